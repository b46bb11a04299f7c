//! Depth-map reconstruction for one reference view
use super::{
    patch_optimization::PatchOptimization,
    progress::{Progress, ProgressSnapshot, Status},
    settings::Settings,
    single_view::SingleView,
    view_selection::{GlobalViewSelection, ViewSet},
};
use crate::{
    Error,
    fssr::Sample,
    scene::{Raster, Scene, raster_name},
};
use nalgebra::Vector3;
use ordered_float::OrderedFloat;
use std::{collections::BinaryHeap, sync::Arc};

/// A neighbor only gets a new hypothesis if it would beat the neighbor's
/// best known confidence by this margin
const PUSH_MARGIN: f32 = 0.05;

/// Progress snapshots are refreshed at this interval during region growing
const PROGRESS_INTERVAL: usize = 100;

/// Pending patch hypothesis, ordered by confidence
#[derive(Clone, Debug)]
pub struct QueueData {
    /// Master pixel column, at the working level
    pub x: usize,
    /// Master pixel row, at the working level
    pub y: usize,
    /// Confidence that queued this hypothesis
    pub confidence: f32,
    /// Distance along the pixel's view ray
    pub depth: f32,
    /// Depth change per pixel along `x`
    pub dz_i: f32,
    /// Depth change per pixel along `y`
    pub dz_j: f32,
    /// Local views to try first
    pub local_views: ViewSet,
}

impl PartialEq for QueueData {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other).is_eq()
    }
}
impl Eq for QueueData {}

impl PartialOrd for QueueData {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueData {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        OrderedFloat(self.confidence).cmp(&OrderedFloat(other.confidence))
    }
}

/// Region-growing depth-map reconstruction for a single reference view
///
/// Sparse features seed the depth map; the highest-confidence hypotheses
/// are then refined and propagated to their 4-connected neighbors until no
/// neighbor can be improved.
pub struct DmRecon<'a> {
    scene: &'a Scene,
    settings: Settings,
    views: Vec<Option<SingleView>>,
    progress: Arc<Progress>,
    global: ViewSet,
    queue: BinaryHeap<QueueData>,
    /// Highest confidence queued for each pixel
    reserved: Vec<f32>,
    width: usize,
    height: usize,
    filled: usize,
}

impl<'a> DmRecon<'a> {
    /// Prepares a reconstruction
    ///
    /// Views with a bad camera or without the image embedding are excluded
    /// (with a warning); a bad reference view is an error.
    pub fn new(
        scene: &'a Scene,
        settings: Settings,
        progress: Arc<Progress>,
    ) -> Result<Self, Error> {
        settings.validate()?;
        let ref_view = settings.ref_view;
        let num_views = scene.store.num_views();
        if ref_view >= num_views {
            return Err(Error::InvalidRefView(ref_view));
        }
        let embedding = settings.image_embedding.as_str();
        let mut views = Vec::with_capacity(num_views);
        for i in 0..num_views {
            match SingleView::new(scene, i, embedding) {
                Ok(v) => views.push(Some(v)),
                Err(e) if i == ref_view => return Err(e),
                Err(e) => {
                    log::warn!("excluding view {i}: {e}");
                    views.push(None);
                }
            }
        }
        let Some(master) = views[ref_view].as_mut() else {
            return Err(Error::InvalidRefView(ref_view));
        };
        master.prepare_master_view(&settings)?;
        master.load_color_image(scene, embedding)?;
        let (width, height) = master.level_size(master.scale());

        progress.update(|s| {
            *s = ProgressSnapshot {
                ref_view,
                ..Default::default()
            }
        });
        Ok(Self {
            scene,
            settings,
            views,
            progress,
            global: ViewSet::new(),
            queue: BinaryHeap::new(),
            reserved: vec![0.0; width * height],
            width,
            height,
            filled: 0,
        })
    }

    /// Returns the settings used by this reconstruction
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Returns the reference view
    pub fn master(&self) -> Option<&SingleView> {
        self.views.get(self.settings.ref_view)?.as_ref()
    }

    /// Returns globally selected neighbor views (empty before selection)
    pub fn global_views(&self) -> &ViewSet {
        &self.global
    }

    /// Number of pixels with a committed depth
    pub fn filled(&self) -> usize {
        self.filled
    }

    /// Runs the full reconstruction, saving results to the scene's store
    ///
    /// On error (including cancellation) the status becomes
    /// [`Status::Cancelled`]; partially filled results are kept in memory
    /// but not saved.
    pub fn start(&mut self) -> Result<(), Error> {
        let r = self.run();
        let status = match &r {
            Ok(()) => Status::Idle,
            Err(e) => {
                log::warn!(
                    "reconstruction of view {} stopped: {e}",
                    self.settings.ref_view
                );
                Status::Cancelled
            }
        };
        self.set_status(status);
        r
    }

    fn run(&mut self) -> Result<(), Error> {
        self.check_cancel()?;
        self.set_status(Status::Features);
        self.analyze_features();
        self.check_cancel()?;

        self.set_status(Status::GlobalVs);
        self.global_view_selection()?;
        self.check_cancel()?;

        self.set_status(Status::Features);
        self.process_features()?;
        self.check_cancel()?;

        self.set_status(Status::Queue);
        self.process_queue()?;

        self.set_status(Status::Saving);
        self.save()?;
        log::info!(
            "view {}: filled {} of {} pixels",
            self.settings.ref_view,
            self.filled,
            self.width * self.height
        );
        Ok(())
    }

    fn check_cancel(&self) -> Result<(), Error> {
        if self.progress.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    fn set_status(&self, status: Status) {
        let (filled, queue_size) = (self.filled, self.queue.len());
        self.progress.update(|s| {
            s.status = status;
            s.filled = filled;
            s.queue_size = queue_size;
        });
    }

    /// Registers features with every view that can see them
    ///
    /// Only features observed in the reference view, inside its frustum and
    /// inside the bounding box are considered.
    fn analyze_features(&mut self) {
        let ref_view = self.settings.ref_view;
        let scene = self.scene;
        let features = &scene.bundle.features;
        for v in self.views.iter_mut().flatten() {
            v.clear_features();
        }
        let mut used = 0;
        for (i, f) in features.iter().enumerate() {
            let visible = f.contains_view_id(ref_view)
                && self.settings.in_aabb(&f.pos)
                && self.master().is_some_and(|m| m.point_in_frustum(&f.pos));
            if !visible {
                continue;
            }
            used += 1;
            for (j, v) in self.views.iter_mut().enumerate() {
                let Some(v) = v else {
                    continue;
                };
                if j == ref_view || v.point_in_frustum(&f.pos) {
                    v.add_feature(i);
                }
            }
        }
        log::info!(
            "view {ref_view}: {used} of {} features are usable",
            features.len()
        );
    }

    /// Selects global neighbor views and loads their images
    fn global_view_selection(&mut self) -> Result<(), Error> {
        let global = GlobalViewSelection::new(
            &self.views,
            &self.scene.bundle.features,
            &self.settings,
        )
        .perform()?;
        let embedding = self.settings.image_embedding.as_str();
        let mut loaded = ViewSet::new();
        for v in global {
            let Some(view) = self.views[v].as_mut() else {
                continue;
            };
            match view.load_color_image(self.scene, embedding) {
                Ok(()) => {
                    loaded.insert(v);
                }
                Err(e) => {
                    log::warn!("excluding view {v}: {e}");
                    self.views[v] = None;
                }
            }
        }
        if loaded.is_empty() {
            return Err(Error::NoGlobalViews);
        }
        self.global = loaded;
        Ok(())
    }

    /// Optimizes a hypothesis, returning it (with its normal) if usable
    fn optimize(
        &self,
        x: usize,
        y: usize,
        depth: f32,
        dz_i: f32,
        dz_j: f32,
        local: &ViewSet,
    ) -> Option<(QueueData, Vector3<f32>)> {
        let mut opt = PatchOptimization::new(
            &self.views,
            &self.settings,
            &self.global,
            x,
            y,
            depth,
            dz_i,
            dz_j,
            local,
        );
        opt.do_auto_optimization();
        let confidence = opt.compute_confidence();
        if !(confidence > 0.0) {
            return None;
        }
        let normal = opt.normal()?;
        let (depth, dz_i, dz_j) = opt.hypothesis();
        Some((
            QueueData {
                x,
                y,
                confidence,
                depth,
                dz_i,
                dz_j,
                local_views: opt.local_views().clone(),
            },
            normal,
        ))
    }

    fn confidence_at(&self, x: usize, y: usize) -> f32 {
        self.master()
            .and_then(|m| m.master())
            .map(|m| m.conf.at(x, y, 0))
            .unwrap_or(0.0)
    }

    /// Writes a hypothesis into the result rasters
    fn commit(&mut self, q: &QueueData, normal: &Vector3<f32>) {
        let ref_view = self.settings.ref_view;
        let Some(m) = self.views[ref_view].as_mut().and_then(|v| v.master_mut())
        else {
            return;
        };
        let (x, y) = (q.x, q.y);
        if m.conf.at(x, y, 0) == 0.0 {
            self.filled += 1;
        }
        m.depth.set(x, y, 0, q.depth);
        m.normal.pixel_mut(x, y).copy_from_slice(normal.as_slice());
        m.dz.set(x, y, 0, q.dz_i);
        m.dz.set(x, y, 1, q.dz_j);
        m.conf.set(x, y, 0, q.confidence);
        let slots = m.views.pixel_mut(x, y);
        slots.fill(-1);
        for (s, v) in slots.iter_mut().zip(&q.local_views) {
            *s = *v as i32;
        }
    }

    /// Checks that a patch centered at `(x, y)` fits in the master image
    fn in_margin(&self, x: i64, y: i64) -> bool {
        let r = self.settings.filter_radius() as i64;
        x >= r
            && y >= r
            && x < self.width as i64 - r
            && y < self.height as i64 - r
    }

    /// Seeds the depth map from sparse features
    fn process_features(&mut self) -> Result<(), Error> {
        let ref_view = self.settings.ref_view;
        let Some(master) = self.master() else {
            return Err(Error::InvalidRefView(ref_view));
        };
        let center = master.position();
        let mut seeds = vec![];
        for f in &self.scene.bundle.features {
            let seen = f.contains_view_id(ref_view)
                || self.global.iter().any(|g| f.contains_view_id(*g));
            if !seen
                || !self.settings.in_aabb(&f.pos)
                || !master.point_in_frustum(&f.pos)
            {
                continue;
            }
            let s = master.world_to_screen_scaled(&f.pos);
            let (x, y) = (s.x.round() as i64, s.y.round() as i64);
            if !self.in_margin(x, y) {
                continue;
            }
            seeds.push((x as usize, y as usize, (f.pos - center).norm()));
        }

        let mut succeeded = 0;
        for (x, y, depth) in &seeds {
            self.check_cancel()?;
            let Some((q, normal)) =
                self.optimize(*x, *y, *depth, 0.0, 0.0, &ViewSet::new())
            else {
                continue;
            };
            if q.confidence > self.confidence_at(*x, *y) {
                self.commit(&q, &normal);
                let i = q.y * self.width + q.x;
                self.reserved[i] = self.reserved[i].max(q.confidence);
                self.queue.push(q);
                succeeded += 1;
            }
        }
        log::info!(
            "view {ref_view}: processed {} features, {succeeded} succeeded",
            seeds.len()
        );
        Ok(())
    }

    /// Grows the depth map from queued hypotheses
    fn process_queue(&mut self) -> Result<(), Error> {
        let mut iterations = 0;
        while let Some(q) = self.queue.pop() {
            self.check_cancel()?;
            iterations += 1;
            if iterations % PROGRESS_INTERVAL == 0 {
                self.set_status(Status::Queue);
            }

            let current = self.confidence_at(q.x, q.y);
            if current > q.confidence {
                continue;
            }
            let r = self.optimize(
                q.x,
                q.y,
                q.depth,
                q.dz_i,
                q.dz_j,
                &q.local_views,
            );
            // A committed hypothesis always propagates, even if refining it
            // again fails
            let source = match r {
                Some((r, normal)) if r.confidence > current => {
                    self.commit(&r, &normal);
                    r
                }
                _ if current == q.confidence => q,
                _ => continue,
            };
            self.push_neighbors(&source);
        }
        log::info!(
            "view {}: region growing took {iterations} iterations",
            self.settings.ref_view
        );
        Ok(())
    }

    /// Queues hypotheses for the 4-connected neighbors of a pixel
    fn push_neighbors(&mut self, q: &QueueData) {
        let (x, y) = (q.x as i64, q.y as i64);
        let neighbors = [
            (x - 1, y, q.depth - q.dz_i),
            (x + 1, y, q.depth + q.dz_i),
            (x, y - 1, q.depth - q.dz_j),
            (x, y + 1, q.depth + q.dz_j),
        ];
        for (nx, ny, depth) in neighbors {
            if !self.in_margin(nx, ny) || !(depth > 0.0) {
                continue;
            }
            let (nx, ny) = (nx as usize, ny as usize);
            let i = ny * self.width + nx;
            let best = self.confidence_at(nx, ny).max(self.reserved[i]);
            if best == 0.0 || best < q.confidence - PUSH_MARGIN {
                self.reserved[i] = self.reserved[i].max(q.confidence);
                self.queue.push(QueueData {
                    x: nx,
                    y: ny,
                    depth,
                    ..q.clone()
                });
            }
        }
    }

    /// Persists result rasters to the scene's store
    fn save(&self) -> Result<(), Error> {
        let ref_view = self.settings.ref_view;
        let scale = self.settings.scale;
        let Some(view) = self.master() else {
            return Err(Error::InvalidRefView(ref_view));
        };
        let Some(m) = view.master() else {
            return Err(Error::InvalidRefView(ref_view));
        };
        let mut out = vec![
            ("depth", Raster::Float(m.depth.clone())),
            ("normal", Raster::Float(m.normal.clone())),
        ];
        if self.settings.keep_dz_map {
            out.push(("dz", Raster::Float(m.dz.clone())));
        }
        if self.settings.keep_confidence_map {
            out.push(("conf", Raster::Float(m.conf.clone())));
        }
        if self.settings.keep_view_indices {
            out.push(("views", Raster::Int(m.views.clone())));
        }
        if let Some(img) = view.image(view.scale()) {
            out.push(("undist", Raster::Float(img.clone())));
        }
        for (kind, raster) in out {
            let name = raster_name(kind, scale);
            log::debug!("saving {name} for view {ref_view}");
            self.scene.store.save_raster(ref_view, &name, raster)?;
        }
        Ok(())
    }

    /// Converts the depth map into oriented samples
    pub fn export_points(&self) -> Vec<Sample> {
        let Some(view) = self.master() else {
            return vec![];
        };
        let (Some(m), Some(img)) = (view.master(), view.image(view.scale()))
        else {
            return vec![];
        };
        let center = view.position();
        let mut out = vec![];
        for y in 0..self.height {
            for x in 0..self.width {
                let depth = m.depth.at(x, y, 0);
                if !(depth > 0.0) {
                    continue;
                }
                let ray = view.view_ray_scaled(x as f32, y as f32);
                let pos = center + ray * depth;
                let n = m.normal.pixel(x, y);
                out.push(Sample {
                    pos,
                    normal: Vector3::new(n[0], n[1], n[2]),
                    color: img.linear_at(x as f32, y as f32),
                    scale: view.foot_print_scaled(&pos)
                        * self.settings.point_scale_factor,
                    confidence: m.conf.at(x, y, 0),
                });
            }
        }
        out
    }
}
