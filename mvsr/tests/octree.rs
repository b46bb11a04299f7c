use mvsr::fssr::{MAX_LEVEL, Octree, Sample};
use nalgebra::Vector3;
use rand::{Rng, SeedableRng, rngs::StdRng};
use std::collections::HashMap;

fn random_samples(seed: u64, n: usize) -> Vec<Sample> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|_| {
            let pos = Vector3::from_fn(|_, _| rng.gen_range(-3.0..3.0));
            Sample {
                pos,
                normal: Vector3::z(),
                color: Vector3::repeat(0.5),
                scale: rng.gen_range(0.05..1.0),
                confidence: 1.0,
            }
        })
        .collect()
}

#[test]
fn test_sample_placement() {
    let mut octree = Octree::new();
    octree.insert_samples(random_samples(1, 500));
    assert_eq!(octree.num_samples(), 500);

    let mut seen = 0;
    for info in octree.visit() {
        let half = info.size / 2.0;
        for s in octree.node(info.id).samples() {
            seen += 1;
            let scale = f64::from(s.scale);
            assert!(scale <= info.size, "sample too large for node: {s:?}");
            assert!(
                scale > half || info.level == MAX_LEVEL,
                "sample should have descended further: {s:?}"
            );
            let d = s.pos.cast::<f64>() - info.center;
            assert!(
                d.iter().all(|v| v.abs() <= half + 1e-9),
                "sample {s:?} outside node at {:?}",
                info.center
            );
        }
    }
    assert_eq!(seen, 500);
}

#[test]
fn test_children_tile_parent() {
    let mut octree = Octree::new();
    octree.insert_samples(random_samples(2, 100));
    octree.make_regular_octree();
    assert!(octree.is_regular());
    let nodes: HashMap<_, _> =
        octree.visit().into_iter().map(|n| (n.id, n)).collect();
    for info in nodes.values() {
        let node = octree.node(info.id);
        if node.is_leaf() {
            continue;
        }
        let mut volume = 0.0;
        for c in node.children().iter().flatten() {
            let child = nodes[c];
            assert_eq!(child.level, info.level + 1);
            assert!((child.center - info.center).norm() < info.size);
            volume += child.size.powi(3);
        }
        assert!((volume - info.size.powi(3)).abs() < 1e-9);
    }
}

#[test]
fn test_influence_query_matches_brute_force() {
    let samples = random_samples(3, 300);
    let mut octree = Octree::new();
    octree.insert_samples(samples.clone());

    let mut rng = StdRng::seed_from_u64(4);
    let factor = 3.0;
    let mut found = vec![];
    for _ in 0..50 {
        let pos = Vector3::from_fn(|_, _| rng.gen_range(-3.0..3.0));
        octree.influence_query(&pos, factor, &mut found);
        let expected = samples
            .iter()
            .filter(|s| {
                let r = factor * f64::from(s.scale);
                (pos - s.pos.cast::<f64>()).norm_squared() < r * r
            })
            .count();
        assert_eq!(found.len(), expected, "bad query at {pos:?}");
    }
}

#[test]
fn test_refine_adds_level() {
    let mut octree = Octree::new();
    octree.insert_samples(random_samples(5, 20));
    octree.make_regular_octree();
    let levels = octree.num_levels();
    let leaves = octree.leaves().len();
    octree.refine_octree();
    assert_eq!(octree.num_levels(), levels + 1);
    assert_eq!(octree.leaves().len(), leaves * 8);
    assert!(octree.is_regular());
}
