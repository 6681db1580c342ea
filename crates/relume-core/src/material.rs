//! Coefficient quantization planning.
//!
//! Projected coefficients are floats; the planes store bytes. The planner
//! scans the pass-1 sample set for per-plane extrema, then derives a shared
//! scale/bias so every plane quantizes into [0, 255] with (by default) one
//! dynamic range across all planes.

use {
    crate::{
        error::Result,
        pixel::PixelArray,
        project::Projector,
        report, ProgressFn,
    },
    tracing::debug,
};

#[derive(Debug, Clone, Copy)]
pub struct MaterialPlane {
    pub min: f32,
    pub max: f32,
    /// `127 / max|eigen|`: how the viewer dequantizes the basis image tiles.
    /// Meaningful only for the PCA bases, zero otherwise.
    pub range: f32,
    pub scale: f32,
    pub bias: f32,
}

impl Default for MaterialPlane {
    fn default() -> Self {
        Self {
            min: f32::MAX,
            max: -f32::MAX,
            range: 0.0,
            scale: 1.0,
            bias: 0.0,
        }
    }
}

impl MaterialPlane {
    pub fn quantize(&self, value: f32) -> u8 {
        (value / self.scale + self.bias).round().clamp(0.0, 255.0) as u8
    }

    pub fn dequantize(&self, quantized: u8) -> f32 {
        (quantized as f32 - self.bias) * self.scale
    }
}

#[derive(Debug, Clone, Default)]
pub struct Material {
    pub planes: Vec<MaterialPlane>,
}

/// How often the scan polls the progress callback.
const CANCEL_STRIDE: usize = 8000;

/// Scans the sample set through the frozen projector and finalizes per-plane
/// quantization. `rangecompress` blends between one shared dynamic range (0)
/// and per-plane packing (1).
pub fn plan(
    projector: &Projector,
    sample: &PixelArray,
    rangecompress: f32,
    progress: Option<&ProgressFn>,
) -> Result<Material> {
    const STAGE: &str = "Coefficients quantization:";
    let nplanes = projector.nplanes();
    let dim = projector.dim();
    let mut planes = vec![MaterialPlane::default(); nplanes];

    if projector.is_data_driven() {
        // basis coefficients are centered on zero, so the basis image stores
        // 127 + range·eigen
        for (p, plane) in planes.iter_mut().enumerate() {
            let peak = projector
                .builder()
                .projection_row(p, dim)
                .iter()
                .fold(0.0f32, |acc, &w| acc.max(w.abs()));
            plane.range = 127.0 / peak;
        }
    }

    report(progress, STAGE, 0)?;
    let mut scratch = projector.scratch();
    for (i, pixel) in sample.iter().enumerate() {
        if i % CANCEL_STRIDE == 0 {
            report(progress, STAGE, (100 * i / sample.npixels().max(1)) as u32)?;
        }
        projector.project(pixel, &mut scratch);
        for (plane, &value) in planes.iter_mut().zip(&scratch.principal) {
            plane.min = plane.min.min(value);
            plane.max = plane.max.max(value);
        }
    }

    finalize(&mut planes, rangecompress);
    report(progress, STAGE, 100)?;
    debug!(nplanes, "planned quantization");
    Ok(Material { planes })
}

fn finalize(planes: &mut [MaterialPlane], rangecompress: f32) {
    let maxspan = planes
        .iter()
        .fold(0.0f32, |acc, plane| acc.max(plane.max - plane.min));

    for plane in planes {
        let span = rangecompress * (plane.max - plane.min) + (1.0 - rangecompress) * maxspan;
        // a flat sample set (every coefficient identical) still needs a
        // nonzero scale to round-trip
        let span = if span > 0.0 { span } else { 1.0 };
        plane.scale = span / 255.0;
        plane.bias = -plane.min / plane.scale;
    }
}
