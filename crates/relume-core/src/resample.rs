//! Resampling of acquired light directions onto the octahedral grid.
//!
//! The map is fit once per dataset (or once per spatial cell for near-field
//! acquisitions): a Gaussian RBF prior over the acquired lights, refined by a
//! regularized least-squares step so cells near an acquired light reproduce
//! it exactly while sparsely lit cells fall back to the prior.

use {
    crate::{
        error::{Error, Result},
        octa::from_octa,
        pixel::Pixel,
        report, ProgressFn,
    },
    nalgebra::{DMatrix, Vector3},
    tracing::debug,
};

/// Sparse weights of one octahedral cell over the acquired lights.
pub type WeightRow = Vec<(u32, f32)>;

/// Relative RBF weight below which an entry never enters the prior.
const RBF_PRUNE: f32 = 0.005;
/// Absolute weight below which an entry is dropped from the final map.
const MAP_PRUNE: f64 = 0.05;

#[derive(Debug, Clone, Default)]
pub struct ResampleMap {
    rows: Vec<WeightRow>,
}

impl ResampleMap {
    pub fn rows(&self) -> &[WeightRow] {
        &self.rows
    }

    /// Accumulates `weight`-scaled resampled slots of `acquired` into `out`.
    /// `out` must be zeroed by the caller before the first accumulation.
    pub fn accumulate(&self, acquired: &Pixel, out: &mut Pixel, weight: f32) {
        if weight == 0.0 {
            return;
        }
        for (slot, row) in out.iter_mut().zip(&self.rows) {
            for &(source, w) in row {
                let sample = acquired[source as usize];
                let w = w * weight;
                slot.r += sample.r * w;
                slot.g += sample.g * w;
                slot.b += sample.b * w;
            }
        }
    }
}

/// Builds the `R² × K` map for one set of light directions.
pub fn build_resample_map(
    lights: &[Vector3<f32>],
    resolution: u32,
    sigma: f32,
    regularization: f32,
    progress: Option<&ProgressFn>,
) -> Result<ResampleMap> {
    const STAGE: &str = "Resampling light directions:";
    let ndimensions = (resolution * resolution) as usize;
    let nlights = lights.len();
    let radius = 1.0 / (sigma * sigma);

    // RBF prior: per-cell Gaussian weights, normalized, pruned, renormalized
    let mut prior = DMatrix::<f64>::zeros(ndimensions, nlights);
    for y in 0..resolution {
        report(progress, STAGE, 100 * y / resolution)?;
        for x in 0..resolution {
            let cell = (x + y * resolution) as usize;
            let direction = from_octa(x, y, resolution);

            let mut weights: Vec<(usize, f32)> = lights
                .iter()
                .enumerate()
                .map(|(i, light)| (i, (-radius * (direction - light).norm_squared()).exp()))
                .collect();
            let total: f32 = weights.iter().map(|&(_, w)| w).sum();
            weights.retain_mut(|(_, w)| {
                *w /= total;
                *w > RBF_PRUNE
            });
            let kept: f32 = weights.iter().map(|&(_, w)| w).sum();
            for (i, w) in weights {
                prior[(cell, i)] = (w / kept) as f64;
            }
        }
    }

    // bilinear sampling matrix: where each acquired light lands on the grid
    let mut sampling = DMatrix::<f64>::zeros(nlights, ndimensions);
    for (l, light) in lights.iter().enumerate() {
        let lz = (1.0 - light.x * light.x - light.y * light.y).max(0.0).sqrt();
        let s = light.x.abs() + light.y.abs() + lz;
        let x = ((light.x + light.y) / s + 1.0) / 2.0 * (resolution - 1) as f32;
        let y = ((light.y - light.x) / s + 1.0) / 2.0 * (resolution - 1) as f32;

        let sx = (x.floor() as i64).clamp(0, resolution as i64 - 2) as usize;
        let sy = (y.floor() as i64).clamp(0, resolution as i64 - 2) as usize;
        let dx = (x - sx as f32) as f64;
        let dy = (y - sy as f32) as f64;

        let resolution = resolution as usize;
        sampling[(l, sx + sy * resolution)] = (1.0 - dx) * (1.0 - dy);
        sampling[(l, sx + 1 + sy * resolution)] = dx * (1.0 - dy);
        sampling[(l, sx + (sy + 1) * resolution)] = (1.0 - dx) * dy;
        sampling[(l, sx + 1 + (sy + 1) * resolution)] = dx * dy;
    }

    // minimize |Ax − b|² + λ|x − Bb|²:
    //   M = B + (AᵀA + λI)⁻¹ Aᵀ (I − AB)
    let normal = sampling.transpose() * &sampling
        + DMatrix::identity(ndimensions, ndimensions) * regularization as f64;
    let inverse = normal.try_inverse().ok_or(Error::Solver)?;
    let map = &prior
        + inverse
            * sampling.transpose()
            * (DMatrix::identity(nlights, nlights) - &sampling * &prior);

    let rows = (0..ndimensions)
        .map(|cell| {
            let mut row: WeightRow = (0..nlights)
                .filter(|&l| map[(cell, l)].abs() > MAP_PRUNE)
                .map(|l| (l as u32, map[(cell, l)] as f32))
                .collect();
            // pruning nibbles at the partition of unity, restore it
            let total: f32 = row.iter().map(|&(_, w)| w).sum();
            if total != 0.0 {
                for (_, w) in &mut row {
                    *w /= total;
                }
            }
            row
        })
        .collect();

    debug!(resolution, nlights, "built resample map");
    Ok(ResampleMap { rows })
}

/// A small grid of per-region values (resample maps or locally fit bases)
/// used when the light direction varies across the image plane.
#[derive(Debug, Clone)]
pub struct SpatialGrid<T> {
    cells: Vec<T>,
    side: u32,
}

/// Grid side used for every near-field structure.
pub const GRID_SIDE: u32 = 8;

impl<T> SpatialGrid<T> {
    /// Builds a `GRID_SIDE × GRID_SIDE` grid; the builder receives the image
    /// position of each cell corner (corner cells land on image corners).
    pub fn build(
        image_width: u32,
        image_height: u32,
        mut cell: impl FnMut(u32, u32) -> Result<T>,
    ) -> Result<Self> {
        let mut cells = Vec::with_capacity((GRID_SIDE * GRID_SIDE) as usize);
        for gy in 0..GRID_SIDE {
            for gx in 0..GRID_SIDE {
                let pixel_x = image_width * gx / (GRID_SIDE - 1);
                let pixel_y = image_height * gy / (GRID_SIDE - 1);
                cells.push(cell(pixel_x.min(image_width - 1), pixel_y.min(image_height - 1))?);
            }
        }
        Ok(Self {
            cells,
            side: GRID_SIDE,
        })
    }

    pub fn cell(&self, gx: u32, gy: u32) -> &T {
        &self.cells[(gx + gy * self.side) as usize]
    }

    pub fn at(&self, index: usize) -> &T {
        &self.cells[index]
    }

    pub fn side(&self) -> u32 {
        self.side
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// The four grid cells surrounding an image position with their bilinear
    /// blend weights; the weights sum to 1.
    pub fn blend(&self, x: u32, y: u32, image_width: u32, image_height: u32) -> [(usize, f32); 4] {
        let side = self.side as usize;
        let fx = (self.side - 1) as f32 * x as f32 / image_width as f32;
        let fy = (self.side - 1) as f32 * y as f32 / image_height as f32;
        let ix = (fx.floor() as usize).min(side - 2);
        let iy = (fy.floor() as usize).min(side - 2);
        let dx = fx - ix as f32;
        let dy = fy - iy as f32;
        [
            (ix + iy * side, (1.0 - dx) * (1.0 - dy)),
            (ix + 1 + iy * side, dx * (1.0 - dy)),
            (ix + (iy + 1) * side, (1.0 - dx) * dy),
            (ix + 1 + (iy + 1) * side, dx * dy),
        ]
    }
}

#[cfg(test)]
mod tests {
    use {super::*, approx::assert_relative_eq};

    fn dome_lights(count: usize) -> Vec<Vector3<f32>> {
        (0..count)
            .map(|i| {
                let azimuth = i as f32 * std::f32::consts::TAU * 0.618;
                let z = 0.25 + 0.7 * (i as f32 + 0.5) / count as f32;
                let r = (1.0f32 - z * z).sqrt();
                Vector3::new(r * azimuth.cos(), r * azimuth.sin(), z).normalize()
            })
            .collect()
    }

    #[test]
    fn rows_are_a_partition_of_unity() {
        let map = build_resample_map(&dome_lights(64), 8, 0.125, 0.1, None).unwrap();
        assert_eq!(map.rows().len(), 64);
        for (cell, row) in map.rows().iter().enumerate() {
            assert!(!row.is_empty(), "cell {cell} kept no weights");
            let total: f32 = row.iter().map(|&(_, w)| w).sum();
            assert_relative_eq!(total, 1.0, epsilon = 1e-3);
        }
    }

    #[test]
    fn accumulate_blends_sources() {
        let map = ResampleMap {
            rows: vec![vec![(0, 0.25), (1, 0.75)]],
        };
        let mut acquired = Pixel::with_dimensions(2);
        acquired[0] = crate::pixel::Color3f::new(100.0, 0.0, 40.0);
        acquired[1] = crate::pixel::Color3f::new(200.0, 80.0, 0.0);
        let mut out = Pixel::with_dimensions(1);
        map.accumulate(&acquired, &mut out, 1.0);
        assert_relative_eq!(out[0].r, 175.0);
        assert_relative_eq!(out[0].g, 60.0);
        assert_relative_eq!(out[0].b, 10.0);
    }

    #[test]
    fn blend_weights_sum_to_one() {
        let grid = SpatialGrid::build(640, 480, |_, _| Ok(())).unwrap();
        for (x, y) in [(0u32, 0u32), (320, 240), (639, 479), (17, 401)] {
            let corners = grid.blend(x, y, 640, 480);
            let total: f32 = corners.iter().map(|&(_, w)| w).sum();
            assert_relative_eq!(total, 1.0, epsilon = 1e-5);
        }
    }

    #[test]
    fn blend_at_origin_is_the_corner_cell() {
        let grid = SpatialGrid::build(640, 480, |_, _| Ok(())).unwrap();
        let corners = grid.blend(0, 0, 640, 480);
        assert_eq!(corners[0].0, 0);
        assert_relative_eq!(corners[0].1, 1.0);
    }
}
