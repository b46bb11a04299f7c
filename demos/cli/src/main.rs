use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use env_logger::Env;
use log::{info, warn};

use mvsr::{
    config::ThreadCount,
    dmrecon::{Progress, Settings, ViewResult, reconstruct_views},
    fssr::IsoSettings,
    image::Image,
    scene::{Raster, Scene, ViewStore, raster_name},
    synth::SphereScene,
};

/// Reconstructs a synthetic textured sphere from rendered views
#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
struct Args {
    #[clap(subcommand)]
    cmd: Command,

    #[clap(flatten)]
    scene: SceneSettings,

    /// Number of threads to use
    #[clap(short, long)]
    threads: Option<NonZeroUsize>,
}

#[derive(Subcommand)]
enum Command {
    /// Builds depth maps and writes them as grayscale images
    Depth {
        #[clap(flatten)]
        settings: DepthSettings,

        /// Directory in which to write `depth-<view>.png` files
        #[clap(short, long)]
        out: Option<PathBuf>,
    },
    /// Builds depth maps, fuses them, and writes the surface
    Mesh {
        #[clap(flatten)]
        settings: DepthSettings,

        /// Name of a `.stl` file to write
        #[clap(short, long)]
        out: Option<PathBuf>,

        /// Number of extra octree refinement levels
        #[clap(long, default_value_t = 0)]
        refine: usize,

        /// Drop triangles at or below this confidence
        #[clap(long, default_value_t = 0.0)]
        min_confidence: f32,
    },
}

#[derive(Parser)]
struct SceneSettings {
    /// Number of rendered views
    #[clap(long, default_value_t = 12)]
    num_views: usize,

    /// Image width, in pixels
    #[clap(long, default_value_t = 64)]
    width: usize,

    /// Image height, in pixels
    #[clap(long, default_value_t = 48)]
    height: usize,

    /// Seed for texture and background noise
    #[clap(long, default_value_t = 0)]
    seed: u64,
}

#[derive(Parser)]
struct DepthSettings {
    /// Reference views to reconstruct (all views if omitted)
    #[clap(short, long, value_delimiter = ',')]
    views: Vec<usize>,

    /// Pyramid level at which depth maps are built
    #[clap(short, long, default_value_t = 0)]
    scale: u32,

    /// Patch width in pixels (odd)
    #[clap(long, default_value_t = 5)]
    filter_width: usize,

    /// Number of local neighbor views per pixel
    #[clap(long, default_value_t = 4)]
    neighbors: usize,
}

////////////////////////////////////////////////////////////////////////////////

/// Converts a depth raster to RGBA, nearest surfaces brightest
fn depth_to_rgba(depth: &Image<f32>) -> Vec<u8> {
    let valid = || depth.data().iter().filter(|d| **d > 0.0);
    let lo = valid().cloned().fold(f32::INFINITY, f32::min);
    let hi = valid().cloned().fold(0.0, f32::max);
    let range = (hi - lo).max(f32::EPSILON);
    depth
        .data()
        .iter()
        .flat_map(|d| {
            if *d > 0.0 {
                let z = (255.0 * (1.0 - 0.8 * (d - lo) / range)) as u8;
                [z, z, z, 255]
            } else {
                [0, 0, 0, 0]
            }
        })
        .collect()
}

/// Runs depth-map reconstruction for the selected views
fn run_depth(
    scene: &Scene,
    settings: &DepthSettings,
    threads: ThreadCount,
    export_points: bool,
) -> Result<Vec<ViewResult>> {
    let views = if settings.views.is_empty() {
        (0..scene.store.num_views()).collect()
    } else {
        settings.views.clone()
    };
    let cfg = Settings {
        scale: settings.scale,
        filter_width: settings.filter_width,
        nr_recon_neighbors: settings.neighbors,
        export_points,
        ..Default::default()
    };
    cfg.validate()?;

    let start = Instant::now();
    let results =
        reconstruct_views(scene, &cfg, &views, threads, &Progress::new());
    info!(
        "Reconstructed {} views in {:?} ({threads} threads)",
        views.len(),
        start.elapsed()
    );
    let mut ok = 0;
    for r in &results {
        match &r.filled {
            Ok(n) => {
                info!("  view {}: {n} pixels", r.view);
                ok += 1;
            }
            Err(e) => warn!("  view {}: {e}", r.view),
        }
    }
    if ok == 0 {
        bail!("no view was reconstructed");
    }
    Ok(results)
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .init();

    let args = Args::parse();
    let threads = args.threads.map(ThreadCount::from).unwrap_or_default();
    let synth = SphereScene {
        num_views: args.scene.num_views,
        width: args.scene.width,
        height: args.scene.height,
        seed: args.scene.seed,
        ..Default::default()
    };
    let now = Instant::now();
    let (scene, store) = synth.scene();
    info!("Rendered {} views in {:?}", synth.num_views, now.elapsed());

    match args.cmd {
        Command::Depth { settings, out } => {
            let results = run_depth(&scene, &settings, threads, false)?;
            let Some(out) = out else {
                return Ok(());
            };
            std::fs::create_dir_all(&out)?;
            let name = raster_name("depth", settings.scale);
            for r in results.iter().filter(|r| r.filled.is_ok()) {
                let Some(Raster::Float(depth)) = store.raster(r.view, &name)
                else {
                    warn!("view {} has no depth map", r.view);
                    continue;
                };
                let path = out.join(format!("depth-{}.png", r.view));
                info!("Writing image to {path:?}");
                image::save_buffer(
                    path,
                    &depth_to_rgba(&depth),
                    depth.width() as u32,
                    depth.height() as u32,
                    image::ColorType::Rgba8,
                )?;
            }
        }
        Command::Mesh {
            settings,
            out,
            refine,
            min_confidence,
        } => {
            let results = run_depth(&scene, &settings, threads, true)?;
            let samples: Vec<_> =
                results.into_iter().flat_map(|r| r.samples).collect();
            info!("Fusing {} samples", samples.len());

            let start = Instant::now();
            let iso = IsoSettings {
                min_confidence,
                threads,
                ..Default::default()
            };
            let mesh = mvsr::fssr::reconstruct(samples, refine, &iso)?;
            info!(
                "Extracted {} triangles in {:?}",
                mesh.triangles.len(),
                start.elapsed()
            );
            if let Some(out) = out {
                info!("Writing STL to {out:?}");
                mesh.write_stl(&mut std::fs::File::create(out)?)?;
            }
        }
    }

    Ok(())
}
