use mvsr::{
    Error,
    config::ThreadCount,
    dmrecon::{DmRecon, Progress, Settings, Status, reconstruct_views},
    scene::{Raster, Scene},
    synth::{EMBEDDING, SphereScene, noise_image},
};
use std::{num::NonZeroUsize, sync::Arc};

fn median(mut v: Vec<f32>) -> f32 {
    v.sort_by(|a, b| a.total_cmp(b));
    v[v.len() / 2]
}

#[test]
fn test_sphere_accuracy() {
    let (scene, store) = SphereScene::default().scene();
    let progress = Arc::new(Progress::new());
    let settings = Settings {
        keep_confidence_map: true,
        keep_view_indices: true,
        ..Default::default()
    };
    let mut recon = DmRecon::new(&scene, settings, progress.clone()).unwrap();
    recon.start().unwrap();
    assert!(recon.filled() > 100, "only {} pixels filled", recon.filled());
    assert!(recon.global_views().len() >= 4);
    assert!(!recon.global_views().contains(&0));

    let s = progress.snapshot();
    assert_eq!(s.status, Status::Idle);
    assert_eq!(s.filled, recon.filled());

    // Samples should lie on the unit sphere
    let samples = recon.export_points();
    assert_eq!(samples.len(), recon.filled());
    let err =
        median(samples.iter().map(|s| (s.pos.norm() - 1.0).abs()).collect());
    assert!(err < 0.05, "median error {err}");
    let facing = median(
        samples
            .iter()
            .map(|s| s.normal.dot(&s.pos.normalize()))
            .collect(),
    );
    assert!(facing > 0.8, "median normal alignment {facing}");
    assert!(samples.iter().all(|s| s.scale > 0.0 && s.confidence > 0.0));

    assert_eq!(
        store.raster_names(0),
        ["conf-L0", "depth-L0", "normal-L0", "undist-L0", "views-L0"]
    );
    let Some(Raster::Int(views)) = store.raster(0, "views-L0") else {
        panic!("missing view indices");
    };
    assert_eq!(views.channels(), 4);
    let used = views
        .data()
        .chunks(4)
        .filter(|p| p.iter().all(|v| *v > 0))
        .count();
    assert_eq!(used, recon.filled());
    assert!(views.data().chunks(4).all(|p| p[0] == -1 || p[0] > 0));
}

#[test]
fn test_unmatched_neighbors() {
    let synth = SphereScene::default();
    let mut store = synth.store();
    for v in 1..synth.num_views {
        store.insert_image(
            v,
            EMBEDDING,
            noise_image(synth.width, synth.height, 100 + v as u64),
        );
    }
    let store = Arc::new(store);
    let scene = Scene::new(store.clone(), synth.bundle());

    let progress = Arc::new(Progress::new());
    let settings = Settings {
        keep_confidence_map: true,
        ..Default::default()
    };
    let mut recon = DmRecon::new(&scene, settings, progress.clone()).unwrap();
    recon.start().unwrap();
    assert_eq!(recon.filled(), 0);
    assert!(recon.export_points().is_empty());
    assert_eq!(progress.snapshot().status, Status::Idle);

    // Rasters are saved, but nothing was written into them
    for name in ["depth-L0", "normal-L0", "conf-L0"] {
        let Some(Raster::Float(img)) = store.raster(0, name) else {
            panic!("missing raster {name}");
        };
        assert!(img.data().iter().all(|v| *v == 0.0), "{name} is not empty");
    }
}

#[test]
fn test_cancel_before_start() {
    let (scene, store) = SphereScene::default().scene();
    let progress = Arc::new(Progress::new());
    let mut recon =
        DmRecon::new(&scene, Settings::default(), progress.clone()).unwrap();
    progress.cancel();
    let r = recon.start();
    assert!(matches!(r, Err(Error::Cancelled)), "bad result {r:?}");
    assert_eq!(progress.snapshot().status, Status::Cancelled);
    assert_eq!(recon.filled(), 0);
    assert!(store.raster_names(0).is_empty());
}

#[test]
fn test_bad_setup() {
    let (scene, _store) = SphereScene::default().scene();
    let progress = Arc::new(Progress::new());

    let settings = Settings {
        ref_view: 12,
        ..Default::default()
    };
    let r = DmRecon::new(&scene, settings, progress.clone());
    assert!(matches!(r, Err(Error::InvalidRefView(12))));

    let settings = Settings {
        scale: 10,
        ..Default::default()
    };
    let r = DmRecon::new(&scene, settings, progress.clone());
    assert!(matches!(r, Err(Error::BadScale(10, _))));

    let settings = Settings {
        image_embedding: "original".to_owned(),
        ..Default::default()
    };
    let r = DmRecon::new(&scene, settings, progress.clone());
    assert!(matches!(r, Err(Error::MissingImage { view: 0, .. })));
}

#[test]
fn test_no_neighbors() {
    let synth = SphereScene {
        num_views: 1,
        ..Default::default()
    };
    let (scene, _store) = synth.scene();
    let progress = Arc::new(Progress::new());
    let mut recon =
        DmRecon::new(&scene, Settings::default(), progress.clone()).unwrap();
    let r = recon.start();
    assert!(matches!(r, Err(Error::NoGlobalViews)), "bad result {r:?}");
    assert_eq!(progress.snapshot().status, Status::Cancelled);
}

#[test]
fn test_reconstruct_views() {
    let (scene, store) = SphereScene::default().scene();
    let settings = Settings {
        export_points: true,
        ..Default::default()
    };
    let threads = ThreadCount::Many(NonZeroUsize::new(2).unwrap());
    let progress = Progress::new();
    let results =
        reconstruct_views(&scene, &settings, &[0, 6], threads, &progress);
    assert_eq!(results.len(), 2);
    for r in &results {
        let filled = *r.filled.as_ref().unwrap();
        assert!(filled > 0, "view {} is empty", r.view);
        assert_eq!(r.samples.len(), filled);
        assert_eq!(r.progress.ref_view, r.view);
        assert_eq!(r.progress.status, Status::Idle);
        assert!(store.raster(r.view, "depth-L0").is_some());
    }
}

#[test]
fn test_reconstruct_views_cancelled() {
    let (scene, store) = SphereScene::default().scene();
    let cancel = Progress::new();
    cancel.cancel();
    let results = reconstruct_views(
        &scene,
        &Settings::default(),
        &[0, 1, 2],
        ThreadCount::One,
        &cancel,
    );
    for r in results {
        assert!(matches!(r.filled, Err(Error::Cancelled)));
        assert_eq!(r.progress.status, Status::Cancelled);
        assert!(store.raster_names(r.view).is_empty());
    }
}
