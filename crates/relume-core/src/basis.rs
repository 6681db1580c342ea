//! Per-dataset basis fitting.
//!
//! Closed-form bases (PTM and the harmonic family) need only the light
//! directions: the projection matrix is the pseudo-inverse of the light
//! weight matrix, replicated per color channel. The data-driven bases (MRGB,
//! MYCC) instead run a PCA over the resampled sample stack collected in
//! pass 1.

use {
    crate::{
        error::{Error, Result},
        pixel::PixelArray,
        report, ProgressFn,
    },
    nalgebra::{DMatrix, DVector, Vector3},
    serde::{Deserialize, Serialize},
    tap::prelude::*,
    tracing::debug,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, derive_more::Display)]
#[serde(rename_all = "lowercase")]
pub enum BasisType {
    /// Second-order polynomial texture map.
    #[display("ptm")]
    Ptm,
    /// Hemispherical harmonics, 9 terms.
    #[display("hsh")]
    Hsh,
    /// Real spherical harmonics, 9 terms.
    #[display("sh")]
    Sh,
    /// First-order hemispherical harmonics, 4 terms.
    #[display("h")]
    H,
    /// PCA over the acquired light slots, decoded by RBF interpolation.
    #[display("rbf")]
    Rbf,
    /// PCA over an octahedral resampling of the light domain.
    #[display("bilinear")]
    Bilinear,
}

impl BasisType {
    /// True for the PCA-backed bases that ship a basis image to the viewer.
    pub fn is_data_driven(self) -> bool {
        matches!(self, Self::Rbf | Self::Bilinear)
    }
}

impl std::str::FromStr for BasisType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ptm" => Ok(Self::Ptm),
            "hsh" => Ok(Self::Hsh),
            "sh" => Ok(Self::Sh),
            "h" => Ok(Self::H),
            "rbf" => Ok(Self::Rbf),
            "bilinear" => Ok(Self::Bilinear),
            other => Err(Error::InvalidConfig(format!("unknown basis type [{other}]"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, derive_more::Display)]
#[serde(rename_all = "lowercase")]
pub enum Colorspace {
    #[display("rgb")]
    Rgb,
    /// Luminance-separated RGB: three albedo planes, then luma coefficients.
    #[display("lrgb")]
    Lrgb,
    #[display("ycc")]
    Ycc,
    /// Joint PCA across the RGB channels.
    #[display("mrgb")]
    Mrgb,
    /// One PCA per YCbCr channel, planes interleaved.
    #[display("mycc")]
    Mycc,
}

impl Colorspace {
    pub fn is_data_driven(self) -> bool {
        matches!(self, Self::Mrgb | Self::Mycc)
    }
}

impl std::str::FromStr for Colorspace {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "rgb" => Ok(Self::Rgb),
            "lrgb" => Ok(Self::Lrgb),
            "ycc" => Ok(Self::Ycc),
            "mrgb" => Ok(Self::Mrgb),
            "mycc" => Ok(Self::Mycc),
            other => Err(Error::InvalidConfig(format!("unknown colorspace [{other}]"))),
        }
    }
}

/// The frozen outcome of fitting: channel means plus a row-major
/// `nplanes × D` projection matrix, `D = ndimensions · 3`.
#[derive(Debug, Clone, Default)]
pub struct MaterialBuilder {
    pub mean: Vec<f32>,
    pub proj: Vec<f32>,
}

impl MaterialBuilder {
    pub fn projection_row(&self, plane: usize, dim: usize) -> &[f32] {
        &self.proj[plane * dim..(plane + 1) * dim]
    }
}

/// Light weights of a closed-form basis evaluated at a light direction
/// `(u, v)` on the hemisphere; `count` picks the truncation for the
/// harmonic bases (9 for HSH/SH, 4 for H, 6 for PTM).
pub(crate) fn light_weights(basis: BasisType, u: f32, v: f32, count: usize) -> Vec<f32> {
    match basis {
        BasisType::Ptm => vec![1.0, u, v, u * u, u * v, v * v],
        BasisType::Hsh | BasisType::H => light_weights_hsh(u, v, count),
        BasisType::Sh => light_weights_sh(u, v),
        BasisType::Rbf | BasisType::Bilinear => {
            unreachable!("data-driven bases have no analytic light weights")
        }
    }
}

/// Hemispherical harmonics up to 9 terms; the 4-term truncation is the H
/// basis.
fn light_weights_hsh(u: f32, v: f32, count: usize) -> Vec<f32> {
    use std::f32::consts::PI;
    let mut len2 = u * u + v * v;
    let (u, v) = if len2 > 1.0 {
        let len = len2.sqrt();
        len2 = 1.0;
        (u / len, v / len)
    } else {
        (u, v)
    };
    let phi = v.atan2(u).pipe(|phi| if phi < 0.0 { 2.0 * PI + phi } else { phi });
    let theta = (1.0 - len2).sqrt().acos().min(PI / 2.0 - 0.001);

    let cos_p = phi.cos();
    let cos_t = theta.cos();
    let cos_t2 = cos_t * cos_t;
    // sqrt(cosθ − cos²θ) shows up in every odd term
    let s = (cos_t - cos_t2).max(0.0).sqrt();

    let mut weights = vec![0.0f32; count];
    weights[0] = 1.0 / (2.0 * PI).sqrt();
    weights[1] = (6.0 / PI).sqrt() * cos_p * s;
    weights[2] = (3.0 / (2.0 * PI)).sqrt() * (-1.0 + 2.0 * cos_t);
    weights[3] = (6.0 / PI).sqrt() * s * phi.sin();
    if count > 4 {
        weights[4] = (30.0 / PI).sqrt() * (2.0 * phi).cos() * (-cos_t + cos_t2);
        weights[5] = (30.0 / PI).sqrt() * cos_p * (-1.0 + 2.0 * cos_t) * s;
        weights[6] = (5.0 / (2.0 * PI)).sqrt() * (1.0 - 6.0 * cos_t + 6.0 * cos_t2);
        weights[7] = (30.0 / PI).sqrt() * (-1.0 + 2.0 * cos_t) * s * phi.sin();
        weights[8] = (30.0 / PI).sqrt() * (-cos_t + cos_t2) * (2.0 * phi).sin();
    }
    weights
}

/// Real spherical harmonics up to order 2.
fn light_weights_sh(u: f32, v: f32) -> Vec<f32> {
    let z = (1.0 - u * u - v * v).max(0.0).sqrt();
    vec![
        0.282_095,
        0.488_603 * v,
        0.488_603 * z,
        0.488_603 * u,
        1.092_548 * u * v,
        1.092_548 * v * z,
        0.315_392 * (3.0 * z * z - 1.0),
        1.092_548 * u * z,
        0.546_274 * (u * u - v * v),
    ]
}

/// Least-squares pseudo-inverse `(AᵀA)⁻¹ Aᵀ`.
fn pseudo_inverse(a: DMatrix<f64>) -> Result<DMatrix<f64>> {
    (a.transpose() * &a)
        .try_inverse()
        .ok_or(Error::Solver)
        .map(|inverse| inverse * a.transpose())
}

/// Closed-form fit: the projection places pseudo-inverse rows per channel.
/// `lights` must already be normalized; for these bases the light slots are
/// the acquired images, so `ndimensions == lights.len()`.
pub fn fit_closed_form(
    basis: BasisType,
    colorspace: Colorspace,
    lights: &[Vector3<f32>],
    nplanes: u32,
) -> Result<MaterialBuilder> {
    let nlights = lights.len();
    let dim = nlights * 3;
    let nplanes = nplanes as usize;
    let nweights = match basis {
        BasisType::Ptm => 6,
        _ => nplanes / 3,
    };

    let rows: Vec<Vec<f32>> = lights
        .iter()
        .map(|light| light_weights(basis, light.x, light.y, nweights))
        .collect();
    let a = DMatrix::from_fn(nlights, nweights, |l, p| rows[l][p] as f64);
    let pinv = pseudo_inverse(a)?;

    let mut builder = MaterialBuilder {
        mean: vec![0.0; dim],
        proj: vec![0.0; nplanes * dim],
    };

    if colorspace == Colorspace::Lrgb {
        // planes 0..3 are plain channel averages (the albedo), the rest carry
        // luminance-weighted polynomial coefficients
        for p in 0..nplanes {
            for k in 0..nlights {
                let off = k * 3 + p * dim;
                if p >= 3 {
                    let w = pinv[(p - 3, k)] as f32;
                    builder.proj[off] = crate::pixel::LUMA[0] * w;
                    builder.proj[off + 1] = crate::pixel::LUMA[1] * w;
                    builder.proj[off + 2] = crate::pixel::LUMA[2] * w;
                } else {
                    builder.proj[off + p] = 1.0 / nlights as f32;
                }
            }
        }
    } else {
        for p in (0..nplanes).step_by(3) {
            for k in 0..nlights {
                let w = pinv[(p / 3, k)] as f32;
                for c in 0..3 {
                    builder.proj[k * 3 + c + (p + c) * dim] = w;
                }
            }
        }
    }
    Ok(builder)
}

const EIGEN_MAX_ITERATIONS: usize = 4096;

/// Top eigenvectors of the scatter matrix of `records`, largest eigenvalue
/// first. `records` yields centered rows of length `dim`.
fn principal_components(scatter: DMatrix<f64>, count: usize) -> Result<Vec<DVector<f64>>> {
    let dim = scatter.nrows();
    if count > dim {
        return Err(Error::InvalidConfig(format!(
            "requested {count} planes from a {dim}-dimensional sample space"
        )));
    }
    let eigen = scatter
        .try_symmetric_eigen(1.0e-12, EIGEN_MAX_ITERATIONS)
        .ok_or(Error::Solver)?;
    let mut order = (0..dim).collect::<Vec<_>>();
    order.sort_by(|&a, &b| {
        eigen.eigenvalues[b]
            .partial_cmp(&eigen.eigenvalues[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    Ok(order
        .into_iter()
        .take(count)
        .map(|i| eigen.eigenvectors.column(i).into_owned())
        .collect())
}

/// Joint PCA across the RGB channels of every light slot.
pub fn fit_pca_mrgb(
    sample: &PixelArray,
    nplanes: u32,
    progress: Option<&ProgressFn>,
) -> Result<MaterialBuilder> {
    const STAGE: &str = "Computing PCA:";
    report(progress, STAGE, 0)?;

    let nsamples = sample.npixels();
    let dim = sample.components() * 3;
    let nplanes = nplanes as usize;

    let mut means = vec![0.0f64; dim];
    for pixel in sample.iter() {
        for k in 0..dim {
            means[k] += pixel.flat(k) as f64;
        }
    }
    for mean in &mut means {
        *mean /= nsamples as f64;
    }
    report(progress, STAGE, 5)?;

    let mut scatter = DMatrix::<f64>::zeros(dim, dim);
    let mut record = DVector::<f64>::zeros(dim);
    for pixel in sample.iter() {
        for k in 0..dim {
            record[k] = pixel.flat(k) as f64 - means[k];
        }
        scatter.ger(1.0, &record, &record, 1.0);
    }
    report(progress, STAGE, 10)?;

    let components = principal_components(scatter, nplanes)?;
    debug!(nsamples, dim, nplanes, "solved joint PCA");

    let mut builder = MaterialBuilder {
        // resampling can push the mean slightly out of range
        mean: means
            .iter()
            .map(|&m| (m as f32).clamp(0.0, 255.0))
            .collect(),
        proj: vec![0.0; nplanes * dim],
    };
    for (p, component) in components.iter().enumerate() {
        for k in 0..dim {
            builder.proj[k + p * dim] = component[k] as f32;
        }
    }

    normalize_rows(&mut builder.proj, nplanes, dim);
    report(progress, STAGE, 100)?;
    Ok(builder)
}

/// Independent PCA per YCbCr channel. The output planes interleave the three
/// channels as (Y, Cb, Cr) triplets for the first `yccplanes[1]` rounds, then
/// the remaining Y-only planes trail at the end.
pub fn fit_pca_mycc(
    sample: &PixelArray,
    yccplanes: [u32; 3],
    progress: Option<&ProgressFn>,
) -> Result<MaterialBuilder> {
    const STAGE: &str = "Computing PCA:";
    report(progress, STAGE, 0)?;

    let nsamples = sample.npixels();
    let slots = sample.components();
    let dim = slots * 3;
    let nplanes = yccplanes.iter().sum::<u32>() as usize;

    let mut builder = MaterialBuilder {
        mean: vec![0.0; dim],
        proj: vec![0.0; nplanes * dim],
    };

    for channel in 0..3usize {
        let mut means = vec![0.0f64; slots];
        for pixel in sample.iter() {
            for k in 0..slots {
                means[k] += pixel[k][channel] as f64;
            }
        }
        for mean in &mut means {
            *mean /= nsamples as f64;
        }

        let mut scatter = DMatrix::<f64>::zeros(slots, slots);
        let mut record = DVector::<f64>::zeros(slots);
        for pixel in sample.iter() {
            for k in 0..slots {
                record[k] = pixel[k][channel] as f64 - means[k];
            }
            scatter.ger(1.0, &record, &record, 1.0);
        }

        let components = principal_components(scatter, yccplanes[channel] as usize)?;
        debug!(channel, nsamples, slots, "solved per-channel PCA");

        for k in 0..slots {
            builder.mean[k * 3 + channel] = (means[k] as f32).clamp(0.0, 255.0);
        }
        for (yp, component) in components.iter().enumerate() {
            let p = if channel == 0 && yp >= yccplanes[1] as usize {
                // Y planes beyond the interleaved triplets go to the tail
                yccplanes[1] as usize * 2 + yp
            } else {
                yp * 3 + channel
            };
            for k in 0..slots {
                builder.proj[k * 3 + channel + p * dim] = component[k] as f32;
            }
        }
        report(progress, STAGE, 100 * (channel as u32 + 1) / 3)?;
    }

    normalize_rows(&mut builder.proj, nplanes, dim);
    Ok(builder)
}

/// The viewer dequantizes eigenvectors against a unit-norm assumption.
fn normalize_rows(proj: &mut [f32], nplanes: usize, dim: usize) {
    for p in 0..nplanes {
        let row = &mut proj[p * dim..(p + 1) * dim];
        let norm = row.iter().map(|&w| (w as f64).powi(2)).sum::<f64>().sqrt() as f32;
        if norm > 0.0 {
            for w in row {
                *w /= norm;
            }
        }
    }
}
