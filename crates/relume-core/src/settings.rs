use {
    crate::{
        basis::{BasisType, Colorspace},
        error::{Error, Result},
    },
    serde::{Deserialize, Serialize},
};

/// Everything a build can be tuned with. Deserializes from the optional
/// `relume.yaml`; the CLI overrides individual fields from flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BuildSettings {
    pub basis: BasisType,
    pub colorspace: Colorspace,
    /// Requested plane count for the data-driven bases. Closed-form bases
    /// derive their count from `(basis, colorspace)` and ignore this.
    pub nplanes: u32,
    /// Per-channel plane counts for MYCC (Y, Cb, Cr).
    pub yccplanes: [u32; 3],
    /// Octahedral grid side used by BILINEAR.
    pub resolution: u32,
    /// RBF radius, in octahedral-map units.
    pub sigma: f32,
    /// λ of the resample-map least-squares refinement.
    pub regularization: f32,
    /// 0 = every plane shares one dynamic range, 1 = each plane packs its own
    /// range (the viewer then rescales per plane).
    pub rangecompress: f32,
    /// Pass-1 sampling budget, megabytes of resampled pixels.
    pub samplingram: u32,
    /// JPEG quality for the coefficient planes.
    pub quality: u8,
    pub chroma_subsampling: bool,
    /// Fit in √-compressed intensity space (inverted by the viewer).
    pub gamma_fix: bool,
    pub save_normals: bool,
    pub save_means: bool,
    pub save_medians: bool,
    /// x, y, width, height; `None` keeps the full frame.
    pub crop: Option<[u32; 4]>,
    /// Indices of acquisition images to leave out of the build.
    pub skip_images: Vec<usize>,
    /// Pass-2 worker count.
    pub workers: usize,
}

impl Default for BuildSettings {
    fn default() -> Self {
        Self {
            basis: BasisType::Ptm,
            colorspace: Colorspace::Rgb,
            nplanes: 18,
            yccplanes: [3, 3, 3],
            resolution: 8,
            sigma: 0.125,
            regularization: 0.1,
            rangecompress: 0.0,
            samplingram: 500,
            quality: 95,
            chroma_subsampling: false,
            gamma_fix: false,
            save_normals: false,
            save_means: false,
            save_medians: false,
            crop: None,
            skip_images: Vec::new(),
            workers: 8,
        }
    }
}

impl BuildSettings {
    /// Rejects combinations the pipeline cannot express, before any image is
    /// touched.
    pub fn validate(&self) -> Result<()> {
        if !self.basis.is_data_driven() && self.colorspace.is_data_driven() {
            return Err(Error::InvalidConfig(format!(
                "{} does not support the {} colorspace",
                self.basis, self.colorspace
            )));
        }
        if self.basis.is_data_driven() && !self.colorspace.is_data_driven() {
            return Err(Error::InvalidConfig(format!(
                "{} supports only mrgb and mycc, got {}",
                self.basis, self.colorspace
            )));
        }
        if self.samplingram == 0 {
            return Err(Error::InvalidConfig("sampling RAM must be > 0".into()));
        }
        if !(0.0..=1.0).contains(&self.rangecompress) {
            return Err(Error::InvalidConfig(format!(
                "rangecompress must lie in [0, 1], got {}",
                self.rangecompress
            )));
        }
        if self.basis == BasisType::Bilinear && self.resolution < 2 {
            return Err(Error::InvalidConfig(format!(
                "octahedral resolution must be at least 2, got {}",
                self.resolution
            )));
        }
        if self.workers == 0 {
            return Err(Error::InvalidConfig("worker count must be > 0".into()));
        }
        self.plane_count().map(|_| ())
    }

    /// Output plane count; a function of `(basis, colorspace)` alone for the
    /// closed-form bases.
    pub fn plane_count(&self) -> Result<u32> {
        use {BasisType::*, Colorspace::*};
        match (self.basis, self.colorspace) {
            (Ptm, Lrgb) => Ok(9),
            (Ptm, Rgb | Ycc) => Ok(18),
            (Hsh | Sh, Rgb | Ycc) => Ok(27),
            (H, Rgb | Ycc) => Ok(12),
            (Rbf | Bilinear, Mrgb) => match self.nplanes {
                0 => Err(Error::InvalidConfig("nplanes must be > 0".into())),
                n => Ok(n),
            },
            (Rbf | Bilinear, Mycc) => match self.yccplanes {
                [0, _, _] => Err(Error::InvalidConfig("yccplanes[0] must be > 0".into())),
                [y, cb, cr] if cb == cr && cb <= y => Ok(y + cb + cr),
                other => Err(Error::InvalidConfig(format!(
                    "yccplanes must satisfy cb == cr <= y, got {other:?}"
                ))),
            },
            (basis, colorspace) => Err(Error::InvalidConfig(format!(
                "no plane layout for {basis} + {colorspace}"
            ))),
        }
    }
}
