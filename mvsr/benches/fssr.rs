use criterion::{
    BenchmarkId, Criterion, black_box, criterion_group, criterion_main,
};
use mvsr::{
    config::ThreadCount,
    fssr::{IsoOctree, IsoSettings, IsoSurface, Octree, Sample},
};
use nalgebra::Vector3;
use std::num::NonZeroUsize;

/// Oriented samples on a Fibonacci lattice over the unit sphere
fn sphere_samples(n: usize) -> Vec<Sample> {
    let golden = std::f32::consts::PI * (3.0 - 5f32.sqrt());
    (0..n)
        .map(|i| {
            let y = 1.0 - 2.0 * (i as f32 + 0.5) / n as f32;
            let r = (1.0 - y * y).sqrt();
            let phi = golden * i as f32;
            let pos = Vector3::new(r * phi.cos(), y, r * phi.sin());
            Sample {
                pos,
                normal: pos,
                color: Vector3::repeat(0.5),
                scale: 0.05,
                confidence: 1.0,
            }
        })
        .collect()
}

fn sphere_octree() -> Octree {
    let mut octree = Octree::new();
    octree.insert_samples(sphere_samples(5000));
    octree.make_regular_octree();
    octree
}

pub fn sphere_voxels_thread_sweep(c: &mut Criterion) {
    let octree = &sphere_octree();
    let mut group = c.benchmark_group("speed vs threads (sphere, voxels)");
    for n in [1, 2, 4, 8] {
        let threads = ThreadCount::from(NonZeroUsize::new(n).unwrap());
        let settings = &IsoSettings {
            threads,
            ..Default::default()
        };
        group.bench_function(BenchmarkId::new("compute_voxels", n), |b| {
            b.iter(|| {
                let mut iso = IsoOctree::new(octree.clone());
                iso.compute_voxels(settings).unwrap();
                black_box(iso)
            })
        });
    }
}

pub fn sphere_mesh(c: &mut Criterion) {
    let mut iso = IsoOctree::new(sphere_octree());
    iso.compute_voxels(&IsoSettings::default()).unwrap();
    let iso = &iso;
    c.bench_function("extract_mesh (sphere)", |b| {
        b.iter(|| {
            let surf = IsoSurface::new(iso).unwrap();
            black_box(surf.extract_mesh(0.0).unwrap())
        })
    });
}

criterion_group!(benches, sphere_voxels_thread_sweep, sphere_mesh);
criterion_main!(benches);
