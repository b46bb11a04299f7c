//! Minimum-area triangulation of polygon loops
use nalgebra::Vector3;
use ordered_float::OrderedFloat;

fn area(a: &Vector3<f32>, b: &Vector3<f32>, c: &Vector3<f32>) -> f64 {
    let ab = (b - a).cast::<f64>();
    let ac = (c - a).cast::<f64>();
    ab.cross(&ac).norm() / 2.0
}

/// Triangulates a closed polygon, minimizing the total triangle area
///
/// This is a dynamic program over every chord `(i, j)`, running in `O(n³)`
/// time.  Triangles are returned as indices into `points`, wound in the same
/// direction as the input loop; an `n`-gon yields `n - 2` triangles.
pub fn min_area_triangulation(points: &[Vector3<f32>]) -> Vec<[usize; 3]> {
    let n = points.len();
    if n < 3 {
        return vec![];
    }
    // cost[i * n + j] is the best area of the sub-polygon i..=j, closed by
    // the chord (i, j); split holds the apex chosen for that chord
    let mut cost = vec![0.0f64; n * n];
    let mut split = vec![0usize; n * n];
    for len in 2..n {
        for i in 0..n - len {
            let j = i + len;
            let (k, c) = (i + 1..j)
                .map(|k| {
                    let c = cost[i * n + k]
                        + cost[k * n + j]
                        + area(&points[i], &points[k], &points[j]);
                    (k, c)
                })
                .min_by_key(|(_, c)| OrderedFloat(*c))
                .unwrap_or((i + 1, 0.0));
            cost[i * n + j] = c;
            split[i * n + j] = k;
        }
    }

    let mut out = Vec::with_capacity(n - 2);
    let mut todo = vec![(0, n - 1)];
    while let Some((i, j)) = todo.pop() {
        if j - i < 2 {
            continue;
        }
        let k = split[i * n + j];
        out.push([i, k, j]);
        todo.push((i, k));
        todo.push((k, j));
    }
    out
}
