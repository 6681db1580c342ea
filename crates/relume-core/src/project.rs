//! Per-pixel projection: acquired samples → resampled slots → principal
//! coefficients, plus the optional per-pixel extractions (normals, mean,
//! median).
//!
//! Everything here is frozen after pass 1; workers share one [`Projector`]
//! by reference and keep their own [`Scratch`].

use {
    crate::{
        basis::{light_weights, BasisType, Colorspace, MaterialBuilder},
        octa::to_octa,
        pixel::{Color3f, Pixel, LUMA},
        resample::{ResampleMap, SpatialGrid},
    },
    nalgebra::{Matrix3, Vector3},
};

/// The resampling half of the pipeline: light-domain blending plus the
/// colorspace/gamma transform. Split from [`Projector`] because pass 1 needs
/// it before any basis exists.
#[derive(Debug, Clone)]
pub struct Resampler {
    basis: BasisType,
    colorspace: Colorspace,
    gamma_fix: bool,
    ndimensions: usize,
    image_width: u32,
    image_height: u32,
    map: Option<ResampleMap>,
    map_grid: Option<SpatialGrid<ResampleMap>>,
}

impl Resampler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        basis: BasisType,
        colorspace: Colorspace,
        gamma_fix: bool,
        ndimensions: usize,
        image_width: u32,
        image_height: u32,
        map: Option<ResampleMap>,
        map_grid: Option<SpatialGrid<ResampleMap>>,
    ) -> Self {
        Self {
            basis,
            colorspace,
            gamma_fix,
            ndimensions,
            image_width,
            image_height,
            map,
            map_grid,
        }
    }

    pub fn ndimensions(&self) -> usize {
        self.ndimensions
    }

    pub fn map(&self) -> Option<&ResampleMap> {
        self.map.as_ref()
    }

    pub fn map_grid(&self) -> Option<&SpatialGrid<ResampleMap>> {
        self.map_grid.as_ref()
    }

    /// Fills `out` (already sized to `ndimensions`) from the acquired pixel:
    /// octahedral blending for BILINEAR, plain copy otherwise, then the
    /// colorspace transform.
    pub fn resample_pixel(&self, acquired: &Pixel, out: &mut Pixel) {
        out.x = acquired.x;
        out.y = acquired.y;

        if self.basis == BasisType::Bilinear {
            out.zero();
            if let Some(grid) = &self.map_grid {
                for (cell, weight) in
                    grid.blend(acquired.x, acquired.y, self.image_width, self.image_height)
                {
                    grid.at(cell).accumulate(acquired, out, weight);
                }
            } else if let Some(map) = &self.map {
                map.accumulate(acquired, out, 1.0);
            }
        } else {
            for (slot, sample) in out.iter_mut().zip(acquired.iter()) {
                *slot = *sample;
            }
        }

        if self.colorspace == Colorspace::Mycc {
            for slot in out.iter_mut() {
                *slot = slot.to_ycc();
            }
        } else if self.gamma_fix {
            for slot in out.iter_mut() {
                *slot = slot.gamma_fix();
            }
        }
    }
}

/// Per-worker buffers for projection.
#[derive(Debug, Clone, Default)]
pub struct Scratch {
    pub principal: Vec<f32>,
    blend: Vec<f32>,
    luma: Vec<f32>,
}

/// The frozen projection state shared by all workers.
#[derive(Debug, Clone)]
pub struct Projector {
    resampler: Resampler,
    nplanes: usize,
    light3d: bool,
    builder: MaterialBuilder,
    /// Locally fit builders for near-field closed-form bases.
    builder_grid: Option<SpatialGrid<MaterialBuilder>>,
}

impl Projector {
    pub fn new(
        resampler: Resampler,
        nplanes: usize,
        light3d: bool,
        builder: MaterialBuilder,
        builder_grid: Option<SpatialGrid<MaterialBuilder>>,
    ) -> Self {
        Self {
            resampler,
            nplanes,
            light3d,
            builder,
            builder_grid,
        }
    }

    pub fn resampler(&self) -> &Resampler {
        &self.resampler
    }

    pub fn builder(&self) -> &MaterialBuilder {
        &self.builder
    }

    pub fn builder_grid(&self) -> Option<&SpatialGrid<MaterialBuilder>> {
        self.builder_grid.as_ref()
    }

    pub fn nplanes(&self) -> usize {
        self.nplanes
    }

    pub fn dim(&self) -> usize {
        self.resampler.ndimensions * 3
    }

    pub fn is_data_driven(&self) -> bool {
        self.resampler.basis.is_data_driven()
    }

    pub fn scratch(&self) -> Scratch {
        Scratch {
            principal: vec![0.0; self.nplanes],
            blend: vec![0.0; self.nplanes],
            luma: vec![0.0; self.resampler.ndimensions],
        }
    }

    /// Projects a resampled pixel into `scratch.principal`.
    pub fn project(&self, pixel: &Pixel, scratch: &mut Scratch) {
        match (&self.builder_grid, self.light3d) {
            (Some(grid), true) => {
                // blend the projections of the four surrounding local bases
                scratch.principal.fill(0.0);
                for (cell, weight) in grid.blend(
                    pixel.x,
                    pixel.y,
                    self.resampler.image_width,
                    self.resampler.image_height,
                ) {
                    let builder = grid.at(cell);
                    let (blend, luma) = (&mut scratch.blend, &mut scratch.luma);
                    self.project_with(pixel, builder, blend, luma);
                    for (acc, &value) in scratch.principal.iter_mut().zip(blend.iter()) {
                        *acc += weight * value;
                    }
                }
            }
            _ => {
                let (principal, luma) = (&mut scratch.principal, &mut scratch.luma);
                self.project_with(pixel, &self.builder, principal, luma);
            }
        }
    }

    fn project_with(
        &self,
        pixel: &Pixel,
        builder: &MaterialBuilder,
        out: &mut [f32],
        luma: &mut [f32],
    ) {
        let dim = self.dim();

        if self.resampler.colorspace == Colorspace::Lrgb {
            for (p, value) in out.iter_mut().enumerate() {
                let row = builder.projection_row(p, dim);
                *value = (0..dim).map(|k| pixel.flat(k) * row[k]).sum();
            }

            // normalize shading by its peak so the first three planes come
            // out as a shading-free albedo
            let mut peak = 0.0f32;
            for (slot, l) in pixel.iter().zip(luma.iter_mut()) {
                *l = slot.luma() / 255.0;
                peak = peak.max(*l);
            }
            if peak > 0.0 {
                for l in luma.iter_mut() {
                    *l /= peak;
                }
            }

            let mut albedo = [0.0f32; 3];
            let mut energy = 0.0f32;
            for (slot, &l) in pixel.iter().zip(luma.iter()) {
                for (c, acc) in albedo.iter_mut().enumerate() {
                    *acc += slot[c] / 255.0 * l;
                }
                energy += l * l;
            }
            for (value, acc) in out.iter_mut().zip(albedo) {
                *value = if energy > 0.0 {
                    (255.0 * acc / energy).clamp(0.0, 255.0)
                } else {
                    0.0
                };
            }

            let total_luma = (LUMA[0] * out[0] + LUMA[1] * out[1] + LUMA[2] * out[2]) / 255.0;
            if total_luma > 0.0 {
                for value in &mut out[3..] {
                    *value /= total_luma;
                }
            }
        } else {
            for (p, value) in out.iter_mut().enumerate() {
                let row = builder.projection_row(p, dim);
                *value = (0..dim)
                    .map(|k| (pixel.flat(k) - builder.mean[k]) * row[k])
                    .sum();
            }

            if self.resampler.colorspace == Colorspace::Ycc {
                // fold the chroma of the leading triplets into planes 1 and 2,
                // the rest become luma-only
                let mut cb = 0.0f32;
                let mut cr = 0.0f32;
                let mut count = 0;
                for p in (0..self.nplanes).step_by(3) {
                    let ycc = Color3f::new(out[p], out[p + 1], out[p + 2]).to_ycc();
                    if p < 9 {
                        cb += ycc.g;
                        cr += ycc.b;
                        count += 1;
                    }
                    out[p] = ycc.r;
                    out[p + 1] = if p > 0 { 128.0 } else { ycc.g };
                    out[p + 2] = if p > 0 { 128.0 } else { ycc.b };
                }
                if count > 0 {
                    out[1] = cb / count as f32;
                    out[2] = cr / count as f32;
                }
            }
        }
    }
}

/// Per-channel average over the acquired (not resampled) samples.
pub fn extract_mean(pixel: &Pixel, nlights: usize) -> [f32; 3] {
    let mut mean = [0.0f64; 3];
    for slot in pixel.iter().take(nlights) {
        for (c, acc) in mean.iter_mut().enumerate() {
            *acc += slot[c] as f64;
        }
    }
    mean.map(|m| (m / nlights as f64) as f32)
}

/// 7/8-quantile per channel: bright enough to shrug off shadows, below the
/// specular highlights.
pub fn extract_median(pixel: &Pixel, nlights: usize) -> [f32; 3] {
    let mut values = vec![0.0f32; nlights];
    let mut median = [0.0f32; 3];
    for (c, out) in median.iter_mut().enumerate() {
        for (v, slot) in values.iter_mut().zip(pixel.iter()) {
            *v = slot[c];
        }
        let index = 7 * nlights / 8;
        let (_, quantile, _) = values.select_nth_unstable_by(index, f32::total_cmp);
        *out = *quantile;
    }
    median
}

/// How a virtual light sees the fitted basis.
#[derive(Debug, Clone)]
enum Evaluation {
    /// Closed-form light weights, one per plane triplet.
    Analytic(Vec<f32>),
    /// Basis image sampled at the light direction (data-driven bases):
    /// channel-summed mean plus one channel-summed eigenvector value per
    /// plane.
    Sampled { mean: f32, planes: Vec<f32> },
}

/// Normal extraction from projected coefficients: brightness under three
/// virtual lights, unprojected through the inverted light matrix.
///
/// Built eagerly per build; supports the RGB and MRGB colorspaces.
#[derive(Debug, Clone)]
pub struct NormalEstimator {
    t_inverse: Matrix3<f32>,
    evaluations: [Evaluation; 3],
    nplanes: usize,
}

impl NormalEstimator {
    pub fn new(
        basis: BasisType,
        colorspace: Colorspace,
        nplanes: usize,
        builder: &MaterialBuilder,
        lights: &[Vector3<f32>],
        resolution: u32,
        sigma: f32,
    ) -> Option<Self> {
        if !matches!(colorspace, Colorspace::Rgb | Colorspace::Mrgb) {
            return None;
        }

        let elevation = std::f32::consts::FRAC_PI_4;
        let step = std::f32::consts::FRAC_PI_6;
        let virtual_lights = [1.0f32, 5.0, 9.0].map(|m| {
            Vector3::new(
                elevation.sin() * (m * step).cos(),
                elevation.sin() * (m * step).sin(),
                elevation.cos(),
            )
        });

        let t = Matrix3::from_rows(&[
            virtual_lights[0].transpose(),
            virtual_lights[1].transpose(),
            virtual_lights[2].transpose(),
        ]);
        let t_inverse = t.try_inverse()?;

        let evaluations = virtual_lights.map(|light| match basis {
            BasisType::Rbf => sample_rbf(builder, lights, sigma, light, nplanes),
            BasisType::Bilinear => sample_bilinear(builder, resolution, light, nplanes),
            analytic => {
                let count = match analytic {
                    BasisType::Ptm => 6,
                    _ => nplanes / 3,
                };
                Evaluation::Analytic(light_weights(analytic, light.x, light.y, count))
            }
        });

        Some(Self {
            t_inverse,
            evaluations,
            nplanes,
        })
    }

    /// Normal for one pixel's principal coefficients, remapped to [0, 1]³.
    pub fn estimate(&self, principal: &[f32]) -> [f32; 3] {
        let brightness = Vector3::from_iterator(self.evaluations.iter().map(|evaluation| {
            match evaluation {
                Evaluation::Analytic(weights) => (0..self.nplanes)
                    .step_by(3)
                    .map(|p| weights[p / 3] * (principal[p] + principal[p + 1] + principal[p + 2]))
                    .sum(),
                Evaluation::Sampled { mean, planes } => {
                    mean + planes
                        .iter()
                        .zip(principal)
                        .map(|(&e, &v)| e * v)
                        .sum::<f32>()
                }
            }
        }));

        let normal = self.t_inverse * brightness;
        let norm = normal.norm();
        if norm > 0.0 {
            let n = normal / norm;
            [(n.x + 1.0) / 2.0, (n.y + 1.0) / 2.0, (n.z + 1.0) / 2.0]
        } else {
            [0.5, 0.5, 1.0]
        }
    }
}

fn sample_rbf(
    builder: &MaterialBuilder,
    lights: &[Vector3<f32>],
    sigma: f32,
    direction: Vector3<f32>,
    nplanes: usize,
) -> Evaluation {
    let radius = 1.0 / (sigma * sigma);
    let mut weights: Vec<f32> = lights
        .iter()
        .map(|light| (-radius * (direction - light).norm_squared()).exp())
        .collect();
    let total: f32 = weights.iter().sum();
    for w in &mut weights {
        *w /= total;
    }

    let dim = lights.len() * 3;
    let mean = weights
        .iter()
        .enumerate()
        .map(|(i, w)| w * (builder.mean[i * 3] + builder.mean[i * 3 + 1] + builder.mean[i * 3 + 2]))
        .sum();
    let planes = (0..nplanes)
        .map(|p| {
            let row = builder.projection_row(p, dim);
            weights
                .iter()
                .enumerate()
                .map(|(i, w)| w * (row[i * 3] + row[i * 3 + 1] + row[i * 3 + 2]))
                .sum()
        })
        .collect();
    Evaluation::Sampled { mean, planes }
}

fn sample_bilinear(
    builder: &MaterialBuilder,
    resolution: u32,
    direction: Vector3<f32>,
    nplanes: usize,
) -> Evaluation {
    let (x, y) = to_octa(direction, resolution);
    let res = resolution as usize;
    let ix = (x.floor() as usize).min(res - 2);
    let iy = (y.floor() as usize).min(res - 2);
    let dx = x - ix as f32;
    let dy = y - iy as f32;
    let corners = [
        (ix + iy * res, (1.0 - dx) * (1.0 - dy)),
        (ix + 1 + iy * res, dx * (1.0 - dy)),
        (ix + (iy + 1) * res, (1.0 - dx) * dy),
        (ix + 1 + (iy + 1) * res, dx * dy),
    ];

    let dim = res * res * 3;
    let channel_sum = |data: &[f32]| -> f32 {
        corners
            .iter()
            .map(|&(cell, w)| w * (data[cell * 3] + data[cell * 3 + 1] + data[cell * 3 + 2]))
            .sum()
    };
    let mean = channel_sum(&builder.mean);
    let planes = (0..nplanes)
        .map(|p| channel_sum(builder.projection_row(p, dim)))
        .collect();
    Evaluation::Sampled { mean, planes }
}
