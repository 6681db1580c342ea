//! Compresses a Reflectance Transformation Imaging acquisition (one photo per
//! known light direction) into a relightable set of JPEG coefficient planes
//! plus a JSON manifest.
//!
//! The pipeline runs in two passes over the image stack: a sampled pass that
//! fits a per-pixel basis (closed-form PTM/HSH/SH/H or data-driven PCA) and
//! plans coefficient quantization, then a streaming row-parallel pass that
//! projects every pixel and feeds the plane encoders.

pub mod basis;
pub mod encode;
pub mod error;
pub mod imageset;
pub mod integration;
pub mod manifest;
pub mod material;
pub mod octa;
pub mod pixel;
pub mod project;
pub mod resample;
pub mod settings;

pub use {
    basis::{BasisType, Colorspace},
    encode::Encoder,
    error::{Error, Result},
    settings::BuildSettings,
};

/// Cooperative progress reporting: called with a stage label and a percentage
/// in [0, 100]; returning `false` requests cancellation.
pub type ProgressFn = dyn Fn(&str, u32) -> bool + Send + Sync;

/// Polls the callback, translating a `false` return into [`Error::Cancelled`].
pub(crate) fn report(progress: Option<&ProgressFn>, stage: &str, percent: u32) -> Result<()> {
    match progress {
        Some(callback) if !callback(stage, percent) => Err(Error::Cancelled),
        _ => Ok(()),
    }
}
