use std::collections::BTreeMap;
use std::fmt::Write;

const X: usize = 1;
const Y: usize = 2;
const Z: usize = 4;

fn main() {
    build_mc_table();
    println!("cargo::rerun-if-changed=build.rs");
}

/// Next axis in the right-handed X-Y-Z cycle
fn next(a: usize) -> usize {
    match a {
        X => Y,
        Y => Z,
        Z => X,
        _ => unreachable!("invalid axis {a}"),
    }
}

/// Packs the edge between two adjacent corners as `4 * t + 2 * v + u`
fn edge_index(a: usize, b: usize) -> u8 {
    let t = a ^ b;
    assert_eq!(t.count_ones(), 1, "corners {a} and {b} are not adjacent");
    let start = a.min(b);
    let u = next(t);
    let v = next(u);
    (t.trailing_zeros() * 4) as u8
        + if start & v != 0 { 2 } else { 0 }
        + if start & u != 0 { 1 } else { 0 }
}

/// Returns a face's corners, counter-clockwise about its outward normal
fn face_corners(face: usize) -> [usize; 4] {
    let t = 1 << (face / 2);
    let u = next(t);
    let v = next(u);
    let positive = face % 2 == 1;
    let base = if positive { t } else { 0 };
    let ring = [base, base | u, base | u | v, base | v];
    if positive {
        ring
    } else {
        [ring[0], ring[3], ring[2], ring[1]]
    }
}

/// Builds polygon loops for a single-level cell
///
/// Each face is walked counter-clockwise about its outward normal.  Every
/// crossing into the inside region is joined to the next crossing back out,
/// which keeps inside corners separated on ambiguous faces.  The resulting
/// directed segments chain into closed loops whose winding gives an outward
/// normal under the right-hand rule.
fn polygons(mask: usize) -> Vec<Vec<u8>> {
    let inside = |c: usize| mask & (1 << c) != 0;
    let mut segments = BTreeMap::new();
    for face in 0..6 {
        let ring = face_corners(face);
        let mut crossings = vec![];
        for k in 0..4 {
            let (a, b) = (ring[k], ring[(k + 1) % 4]);
            if inside(a) != inside(b) {
                crossings.push((edge_index(a, b), inside(b)));
            }
        }
        let n = crossings.len();
        for (i, &(edge, entering)) in crossings.iter().enumerate() {
            if entering {
                let (exit, e) = crossings[(i + 1) % n];
                assert!(!e, "crossings must alternate");
                let prev = segments.insert(edge, exit);
                assert!(prev.is_none(), "edge {edge} starts two segments");
            }
        }
    }

    let mut loops = vec![];
    while let Some((&start, _)) = segments.iter().next() {
        let mut poly = vec![];
        let mut e = start;
        loop {
            poly.push(e);
            e = segments.remove(&e).unwrap();
            if e == start {
                break;
            }
        }
        loops.push(poly);
    }
    loops
}

fn build_mc_table() {
    let mut out = String::new();
    writeln!(
        &mut out,
        "/// Polygon loops (as edge indices) for each single-level corner mask"
    )
    .unwrap();
    writeln!(&mut out, "pub const MC_POLYGONS: [&[&[u8]]; 256] = [").unwrap();
    for mask in 0..256 {
        let loops = polygons(mask);
        for p in &loops {
            assert!(p.len() >= 3, "degenerate loop {p:?} for mask {mask}");
        }
        let body = loops
            .iter()
            .map(|p| {
                let edges: Vec<String> =
                    p.iter().map(|e| e.to_string()).collect();
                format!("&[{}]", edges.join(", "))
            })
            .collect::<Vec<_>>()
            .join(", ");
        writeln!(&mut out, "    &[{body}],").unwrap();
    }
    writeln!(&mut out, "];").unwrap();

    let out_dir = std::env::var_os("OUT_DIR").unwrap();
    let dest_path = std::path::Path::new(&out_dir).join("mc_tables.rs");
    std::fs::write(dest_path, out).unwrap();
}
