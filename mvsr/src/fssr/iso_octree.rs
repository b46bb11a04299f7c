//! Implicit function evaluation at octree corners
use super::{
    basis,
    octree::Octree,
    types::Corner,
    voxel::{VoxelData, VoxelIndex},
};
use crate::{Error, config::ThreadCount};
use nalgebra::Vector3;
use rayon::prelude::*;

/// Settings for voxel evaluation and surface extraction
#[derive(Copy, Clone, Debug)]
pub struct IsoSettings {
    /// Sample support radius, as a multiple of the sample's scale
    pub support_factor: f64,
    /// Triangles touching a vertex with confidence at or below this value
    /// are dropped from the mesh
    pub min_confidence: f32,
    /// Threads used for voxel evaluation
    pub threads: ThreadCount,
}

impl Default for IsoSettings {
    fn default() -> Self {
        Self {
            support_factor: 3.0,
            min_confidence: 0.0,
            threads: ThreadCount::default(),
        }
    }
}

/// An octree with implicit function values at its leaf corners
#[derive(Clone, Debug, Default)]
pub struct IsoOctree {
    octree: Octree,
    /// Sorted by index, with no duplicates
    voxels: Vec<(VoxelIndex, VoxelData)>,
}

impl IsoOctree {
    /// Wraps an octree; voxels are empty until computed
    pub fn new(octree: Octree) -> Self {
        Self {
            octree,
            voxels: vec![],
        }
    }

    /// Borrows the underlying octree
    pub fn octree(&self) -> &Octree {
        &self.octree
    }

    /// Unwraps the underlying octree, discarding voxels
    pub fn into_octree(self) -> Octree {
        self.octree
    }

    /// Returns voxels, sorted by index
    pub fn voxels(&self) -> &[(VoxelIndex, VoxelData)] {
        &self.voxels
    }

    /// Looks up a single voxel
    pub fn voxel(&self, i: VoxelIndex) -> Option<&VoxelData> {
        self.voxels
            .binary_search_by_key(&i, |(j, _)| *j)
            .ok()
            .map(|k| &self.voxels[k].1)
    }

    /// Checks whether a voxel exists
    pub fn has_voxel(&self, i: VoxelIndex) -> bool {
        self.voxels.binary_search_by_key(&i, |(j, _)| *j).is_ok()
    }

    /// Converts a voxel index into a world position
    ///
    /// Returns `None` if the octree is empty.
    pub fn voxel_position(&self, i: VoxelIndex) -> Option<Vector3<f64>> {
        let root = self.octree.root()?;
        Some(i.position(root.center, root.size))
    }

    /// Replaces voxel data
    ///
    /// Returns an error if the list is not strictly sorted by index.
    pub fn set_voxels(
        &mut self,
        voxels: Vec<(VoxelIndex, VoxelData)>,
    ) -> Result<(), Error> {
        if voxels.windows(2).any(|w| w[0].0 >= w[1].0) {
            return Err(Error::UnsortedVoxels);
        }
        self.voxels = voxels;
        Ok(())
    }

    /// Returns the sorted, deduplicated corners of every leaf
    pub fn corner_indices(&self) -> Result<Vec<VoxelIndex>, Error> {
        if self.octree.root().is_none() {
            return Err(Error::EmptyOctree);
        }
        let mut out = self
            .octree
            .leaves()
            .into_iter()
            .flat_map(|n| {
                Corner::iter().map(move |c| {
                    VoxelIndex::try_from_path_and_corner(n.level, n.path, c)
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        out.sort_unstable();
        out.dedup();
        Ok(out)
    }

    /// Evaluates the sample-based implicit function at every leaf corner
    pub fn compute_voxels(
        &mut self,
        settings: &IsoSettings,
    ) -> Result<(), Error> {
        let factor = settings.support_factor;
        let voxels = self.evaluate_corners(
            |pos| self.sample_ifn(&pos, factor),
            settings.threads,
        )?;
        log::info!(
            "computed {} voxels from {} samples",
            voxels.len(),
            self.octree.num_samples()
        );
        self.voxels = voxels;
        Ok(())
    }

    /// Evaluates an arbitrary function at every leaf corner
    pub fn compute_voxels_with<F>(
        &mut self,
        f: F,
        threads: ThreadCount,
    ) -> Result<(), Error>
    where
        F: Fn(Vector3<f64>) -> VoxelData + Sync,
    {
        self.voxels = self.evaluate_corners(f, threads)?;
        Ok(())
    }

    fn evaluate_corners<F>(
        &self,
        f: F,
        threads: ThreadCount,
    ) -> Result<Vec<(VoxelIndex, VoxelData)>, Error>
    where
        F: Fn(Vector3<f64>) -> VoxelData + Sync,
    {
        let indices = self.corner_indices()?;
        let root = self.octree.root().ok_or(Error::EmptyOctree)?;
        let eval = |i: &VoxelIndex| (*i, f(i.position(root.center, root.size)));
        let out = match threads.pool() {
            Some(pool) => {
                pool.install(|| indices.par_iter().map(eval).collect())
            }
            None => indices.iter().map(eval).collect(),
        };
        Ok(out)
    }

    /// Evaluates the implicit function defined by the octree's samples
    ///
    /// The value is the weighted average of every covering sample's basis
    /// function; confidence is the total weight.  Positions not covered by
    /// any sample return [`VoxelData::default()`], i.e. zero confidence.
    pub fn sample_ifn(&self, pos: &Vector3<f64>, factor: f64) -> VoxelData {
        let mut samples = vec![];
        self.octree.influence_query(pos, factor, &mut samples);

        let mut total_value = 0.0;
        let mut total_weight = 0.0;
        let mut total_scale = 0.0;
        let mut total_color = Vector3::<f64>::zeros();
        for s in samples {
            let (x, r) = basis::sample_frame(s, pos);
            let sigma = f64::from(s.scale);
            let w =
                basis::weight(sigma, factor, x, r) * f64::from(s.confidence);
            if w <= 0.0 {
                continue;
            }
            total_value += basis::basis(sigma, x, r) * w;
            total_weight += w;
            total_scale += sigma * w;
            total_color += s.color.cast::<f64>() * w;
        }
        if total_weight <= 0.0 {
            return VoxelData::default();
        }
        VoxelData {
            value: (total_value / total_weight) as f32,
            conf: total_weight as f32,
            scale: (total_scale / total_weight) as f32,
            color: (total_color / total_weight).cast::<f32>(),
        }
    }
}
