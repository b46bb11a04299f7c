//! Raster images, pyramids, and sub-pixel sampling
//!
//! Pixel `(x, y)` is centered at integer coordinates, so bilinear sampling at
//! `(1.0, 2.0)` returns exactly the value stored at column 1, row 2.
use crate::Error;
use nalgebra::Vector3;
use num_traits::AsPrimitive;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

/// Pyramid levels are not built below this size (in either dimension)
pub const MIN_LEVEL_SIZE: usize = 8;

/// Interleaved multi-channel raster
#[derive(Clone, Debug, PartialEq)]
pub struct Image<T> {
    width: usize,
    height: usize,
    channels: usize,
    data: Vec<T>,
}

/// Color image with channels in the `[0, 1]` range
pub type ColorImage = Image<f32>;

impl<T: Copy + Default> Image<T> {
    /// Builds a new image filled with `T::default()`
    pub fn new(width: usize, height: usize, channels: usize) -> Self {
        Self::filled(width, height, channels, T::default())
    }

    /// Builds a new image with every value set to `v`
    pub fn filled(width: usize, height: usize, channels: usize, v: T) -> Self {
        Self {
            width,
            height,
            channels,
            data: vec![v; width * height * channels],
        }
    }

    /// Wraps existing interleaved data
    ///
    /// # Panics
    /// If `data.len()` does not match the given dimensions
    pub fn from_data(
        width: usize,
        height: usize,
        channels: usize,
        data: Vec<T>,
    ) -> Self {
        assert_eq!(data.len(), width * height * channels);
        Self {
            width,
            height,
            channels,
            data,
        }
    }

    /// Image width, in pixels
    pub fn width(&self) -> usize {
        self.width
    }
    /// Image height, in pixels
    pub fn height(&self) -> usize {
        self.height
    }
    /// Number of interleaved channels per pixel
    pub fn channels(&self) -> usize {
        self.channels
    }
    /// Borrows the raw interleaved data
    pub fn data(&self) -> &[T] {
        &self.data
    }
    /// Checks whether `(x, y)` lies inside the image, at least `border`
    /// pixels away from its edges; see [`in_bounds`]
    pub fn contains(&self, x: f32, y: f32, border: f32) -> bool {
        in_bounds(self.width, self.height, x, y, border)
    }

    fn offset(&self, x: usize, y: usize) -> usize {
        debug_assert!(x < self.width && y < self.height);
        (y * self.width + x) * self.channels
    }

    /// Reads a single channel of a single pixel
    pub fn at(&self, x: usize, y: usize, c: usize) -> T {
        self.data[self.offset(x, y) + c]
    }

    /// Writes a single channel of a single pixel
    pub fn set(&mut self, x: usize, y: usize, c: usize, v: T) {
        let i = self.offset(x, y) + c;
        self.data[i] = v;
    }

    /// Borrows every channel of a pixel
    pub fn pixel(&self, x: usize, y: usize) -> &[T] {
        let i = self.offset(x, y);
        &self.data[i..i + self.channels]
    }

    /// Mutably borrows every channel of a pixel
    pub fn pixel_mut(&mut self, x: usize, y: usize) -> &mut [T] {
        let i = self.offset(x, y);
        let c = self.channels;
        &mut self.data[i..i + c]
    }

    /// Sets every value in the image
    pub fn fill(&mut self, v: T) {
        self.data.fill(v);
    }

    /// Applies a function to every value, returning a new image
    pub fn map<U: Copy + Default, F: Fn(T) -> U>(&self, f: F) -> Image<U> {
        Image {
            width: self.width,
            height: self.height,
            channels: self.channels,
            data: self.data.iter().map(|v| f(*v)).collect(),
        }
    }
}

impl<T: Copy + Default + AsPrimitive<f32>> Image<T> {
    /// Reads up to three channels as a color, replicating gray images
    fn color(&self, x: usize, y: usize) -> Vector3<f32> {
        let p = self.pixel(x, y);
        match p.len() {
            0 => Vector3::zeros(),
            1 | 2 => Vector3::repeat(p[0].as_()),
            _ => Vector3::new(p[0].as_(), p[1].as_(), p[2].as_()),
        }
    }

    /// Finds the bilinear cell containing `(x, y)`, clamped to the image
    ///
    /// Returns `None` for an empty image.
    fn cell(&self, x: f32, y: f32) -> Option<([Vector3<f32>; 4], f32, f32)> {
        if self.width == 0 || self.height == 0 {
            return None;
        }
        let x = x.clamp(0.0, (self.width - 1) as f32);
        let y = y.clamp(0.0, (self.height - 1) as f32);
        let x0 = x.floor() as usize;
        let y0 = y.floor() as usize;
        let x1 = (x0 + 1).min(self.width - 1);
        let y1 = (y0 + 1).min(self.height - 1);
        Some((
            [
                self.color(x0, y0),
                self.color(x1, y0),
                self.color(x0, y1),
                self.color(x1, y1),
            ],
            x - x0 as f32,
            y - y0 as f32,
        ))
    }

    /// Samples the image at a fractional position with bilinear interpolation
    ///
    /// An empty image samples as black.
    pub fn linear_at(&self, x: f32, y: f32) -> Vector3<f32> {
        let Some(([c00, c10, c01, c11], fx, fy)) = self.cell(x, y) else {
            return Vector3::zeros();
        };
        let top = c00 * (1.0 - fx) + c10 * fx;
        let bot = c01 * (1.0 - fx) + c11 * fx;
        top * (1.0 - fy) + bot * fy
    }

    /// Samples the image and its exact derivative along `(dx, dy)`
    ///
    /// The derivative is that of the bilinear interpolant within the cell
    /// containing `(x, y)`, scaled by the length of the direction vector.
    pub fn linear_with_derivative(
        &self,
        x: f32,
        y: f32,
        dx: f32,
        dy: f32,
    ) -> (Vector3<f32>, Vector3<f32>) {
        let Some(([c00, c10, c01, c11], fx, fy)) = self.cell(x, y) else {
            return (Vector3::zeros(), Vector3::zeros());
        };
        let top = c00 * (1.0 - fx) + c10 * fx;
        let bot = c01 * (1.0 - fx) + c11 * fx;
        let ddx = (c10 - c00) * (1.0 - fy) + (c11 - c01) * fy;
        let ddy = bot - top;
        (top * (1.0 - fy) + bot * fy, ddx * dx + ddy * dy)
    }
}

impl Image<u8> {
    /// Converts an 8-bit image into a [`ColorImage`] in the `[0, 1]` range
    pub fn to_color(&self) -> ColorImage {
        self.map(|v| f32::from(v) / 255.0)
    }
}

/// Checks whether `(x, y)` lies in a `width x height` image, at least
/// `border` pixels away from its edges
///
/// Pixel centers are at integer coordinates, so with a `border` of 0 the
/// valid range along `x` is `[0, width - 1]`.  An empty image contains
/// nothing.
pub fn in_bounds(
    width: usize,
    height: usize,
    x: f32,
    y: f32,
    border: f32,
) -> bool {
    if width == 0 || height == 0 {
        return false;
    }
    x >= border
        && y >= border
        && x <= (width - 1) as f32 - border
        && y <= (height - 1) as f32 - border
}

/// Returns the size of a pyramid level built from a `width x height` image
pub fn level_size(width: usize, height: usize, level: usize) -> (usize, usize) {
    (0..level).fold((width, height), |(w, h), _| {
        (w.div_ceil(2), h.div_ceil(2))
    })
}

/// Returns the number of levels in a pyramid built from a `width x height`
/// image
///
/// Levels are added while both dimensions of the next level are at least
/// [`MIN_LEVEL_SIZE`].
pub fn pyramid_levels(width: usize, height: usize) -> usize {
    let mut n = 1;
    let (mut w, mut h) = (width, height);
    loop {
        let next = level_size(w, h, 1);
        if next.0.min(next.1) < MIN_LEVEL_SIZE || next == (w, h) {
            return n;
        }
        n += 1;
        (w, h) = next;
    }
}

/// Halves an image by averaging 2x2 blocks, clamping at odd borders
fn downsample(img: &ColorImage) -> ColorImage {
    let (w, h) = level_size(img.width(), img.height(), 1);
    let c = img.channels();
    let mut out = ColorImage::new(w, h, c);
    for y in 0..h {
        let y0 = 2 * y;
        let y1 = (y0 + 1).min(img.height() - 1);
        for x in 0..w {
            let x0 = 2 * x;
            let x1 = (x0 + 1).min(img.width() - 1);
            for k in 0..c {
                let v = img.at(x0, y0, k)
                    + img.at(x1, y0, k)
                    + img.at(x0, y1, k)
                    + img.at(x1, y1, k);
                out.set(x, y, k, v / 4.0);
            }
        }
    }
    out
}

/// Stack of progressively halved images; level 0 is full resolution
#[derive(Clone, Debug)]
pub struct ImagePyramid {
    levels: Vec<ColorImage>,
}

impl ImagePyramid {
    /// Builds a pyramid, halving until either dimension would drop below
    /// [`MIN_LEVEL_SIZE`]
    pub fn new(base: ColorImage) -> Self {
        let n = pyramid_levels(base.width(), base.height());
        let mut levels = vec![base];
        for _ in 1..n {
            let next = downsample(&levels[levels.len() - 1]);
            levels.push(next);
        }
        Self { levels }
    }

    /// Number of levels, always at least 1
    pub fn len(&self) -> usize {
        self.levels.len()
    }

    /// Always returns `false`; every pyramid contains its base image
    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    /// Returns the image at the given level, clamped to the coarsest one
    pub fn level(&self, level: usize) -> &ColorImage {
        &self.levels[level.min(self.levels.len() - 1)]
    }
}

/// Shared cache of image pyramids, keyed by view and embedding name
///
/// Pyramids are immutable once built, so concurrent reconstructions share
/// them through an [`Arc`].
#[derive(Default)]
pub struct PyramidCache {
    map: Mutex<HashMap<(usize, String), Arc<ImagePyramid>>>,
}

impl PyramidCache {
    /// Builds an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a cached pyramid, or builds one from the image returned by
    /// `load`
    ///
    /// The lock is not held while loading, so two threads may race to build
    /// the same pyramid; the first one inserted wins.
    pub fn get_or_load<F>(
        &self,
        view: usize,
        name: &str,
        load: F,
    ) -> Result<Arc<ImagePyramid>, Error>
    where
        F: FnOnce() -> Result<ColorImage, Error>,
    {
        let key = (view, name.to_owned());
        if let Some(p) = self.lock().get(&key) {
            return Ok(p.clone());
        }
        let pyramid = Arc::new(ImagePyramid::new(load()?));
        Ok(self.lock().entry(key).or_insert(pyramid).clone())
    }

    /// Drops every cached pyramid
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Number of cached pyramids
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Checks whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<(usize, String), Arc<ImagePyramid>>>
    {
        self.map.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_relative_eq;

    fn ramp(w: usize, h: usize) -> ColorImage {
        let mut img = ColorImage::new(w, h, 3);
        for y in 0..h {
            for x in 0..w {
                let p = img.pixel_mut(x, y);
                p[0] = x as f32;
                p[1] = y as f32;
                p[2] = (x + y) as f32;
            }
        }
        img
    }

    #[test]
    fn test_linear_at() {
        let img = ramp(8, 6);
        let c = img.linear_at(2.0, 3.0);
        assert_eq!(c, Vector3::new(2.0, 3.0, 5.0));
        let c = img.linear_at(2.25, 3.5);
        assert_relative_eq!(c, Vector3::new(2.25, 3.5, 5.75), epsilon = 1e-6);

        // Clamped outside the image
        let c = img.linear_at(-3.0, 100.0);
        assert_eq!(c, Vector3::new(0.0, 5.0, 5.0));
    }

    #[test]
    fn test_derivative() {
        let img = ramp(8, 6);
        let (c, d) = img.linear_with_derivative(3.2, 1.7, 2.0, -1.0);
        assert_relative_eq!(c, Vector3::new(3.2, 1.7, 4.9), epsilon = 1e-5);
        assert_relative_eq!(d, Vector3::new(2.0, -1.0, 1.0), epsilon = 1e-5);
    }

    #[test]
    fn test_empty_image() {
        let img = ColorImage::new(0, 0, 3);
        assert_eq!(img.linear_at(0.0, 0.0), Vector3::zeros());
        let (c, d) = img.linear_with_derivative(0.5, 0.5, 1.0, 0.0);
        assert_eq!((c, d), (Vector3::zeros(), Vector3::zeros()));
        assert!(!img.contains(0.0, 0.0, 0.0));
        assert!(!in_bounds(0, 5, 0.0, 0.0, 0.0));
    }

    #[test]
    fn test_in_bounds() {
        let img = ramp(8, 6);
        assert!(img.contains(0.0, 0.0, 0.0));
        assert!(img.contains(7.0, 5.0, 0.0));
        assert!(!img.contains(7.1, 5.0, 0.0));
        assert!(!img.contains(0.5, 2.0, 1.0));
        assert!(img.contains(1.0, 1.0, 1.0));
        assert!(img.contains(6.0, 4.0, 1.0));
        assert!(!img.contains(6.5, 4.0, 1.0));
        assert!(!img.contains(3.0, 4.5, 1.0));
    }

    #[test]
    fn test_gray_replication() {
        let img = Image::<u8>::filled(4, 4, 1, 51).to_color();
        let c = img.linear_at(1.5, 1.5);
        assert_relative_eq!(c, Vector3::repeat(0.2), epsilon = 1e-6);
    }

    #[test]
    fn test_pyramid() {
        let p = ImagePyramid::new(ramp(33, 17));
        assert_eq!(p.len(), 2, "bad pyramid depth");
        assert_eq!(p.level(1).width(), 17);
        assert_eq!(p.level(1).height(), 9);
        assert_eq!(level_size(33, 17, 1), (17, 9));
        assert_eq!(level_size(33, 17, 2), (9, 5));
        assert_eq!(pyramid_levels(33, 17), 2);
        assert_eq!(pyramid_levels(640, 480), 7);

        // Averages a 2x2 block
        assert_relative_eq!(p.level(1).at(1, 1, 0), 2.5);
        // Coarser levels are clamped
        assert_eq!(p.level(10).width(), 17);
    }

    #[test]
    fn test_cache() {
        let cache = PyramidCache::new();
        let a = cache.get_or_load(3, "img", || Ok(ramp(16, 16))).unwrap();
        let b = cache
            .get_or_load(3, "img", || panic!("should be cached"))
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);

        let e = cache.get_or_load(4, "img", || {
            Err(Error::MissingImage {
                view: 4,
                name: "img".to_owned(),
            })
        });
        assert!(e.is_err());
        assert_eq!(cache.len(), 1);
    }
}
