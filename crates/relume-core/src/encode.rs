//! The two-pass build driver.
//!
//! Pass 1 (`fit`) samples the image set, builds the resample maps, fits the
//! basis and plans quantization; everything it produces is frozen. Pass 2
//! (`save`) streams rows through a worker pool and commits them, strictly in
//! acquisition order, to one JPEG sink per plane triplet plus the optional
//! auxiliary maps.

use {
    crate::{
        basis::{self, BasisType, Colorspace},
        error::{Error, Result},
        imageset::ImageSource,
        manifest::{Manifest, MaterialEntry},
        material::{self, Material},
        octa::to_octa,
        pixel::PixelArray,
        project::{extract_mean, extract_median, NormalEstimator, Projector, Resampler, Scratch},
        resample::{build_resample_map, SpatialGrid},
        report, BuildSettings, ProgressFn,
    },
    image::RgbImage,
    jpeg_encoder::{ColorType, Encoder as JpegEncoder, SamplingFactor},
    rayon::prelude::*,
    std::{
        fs,
        io::BufWriter,
        path::{Path, PathBuf},
    },
    tap::prelude::*,
    tracing::{info, warn},
};

/// Everything pass 2 reads; immutable once built.
pub struct Fitted {
    pub projector: Projector,
    pub material: Material,
    normal_estimator: Option<NormalEstimator>,
    pub nsamples: usize,
}

pub struct Encoder<S> {
    imageset: S,
    settings: BuildSettings,
    nplanes: usize,
    ndimensions: usize,
    fitted: Option<Fitted>,
}

impl<S: ImageSource> Encoder<S> {
    pub fn new(imageset: S, settings: BuildSettings) -> Result<Self> {
        settings.validate()?;
        if imageset.lights().is_empty() {
            return Err(Error::ImageSet("the image set carries no lights".into()));
        }
        if imageset.width().max(imageset.height()) > u16::MAX as u32 {
            return Err(Error::InvalidConfig(format!(
                "{}x{} exceeds the JPEG size limit",
                imageset.width(),
                imageset.height()
            )));
        }
        let nplanes = settings.plane_count()? as usize;
        let ndimensions = match settings.basis {
            BasisType::Bilinear => (settings.resolution * settings.resolution) as usize,
            _ => imageset.lights().len(),
        };
        Ok(Self {
            imageset,
            settings,
            nplanes,
            ndimensions,
            fitted: None,
        })
    }

    pub fn fitted(&self) -> Option<&Fitted> {
        self.fitted.as_ref()
    }

    pub fn imageset(&self) -> &S {
        &self.imageset
    }

    /// Pass 1: build resample maps, sample the set, fit the basis, plan
    /// quantization.
    pub fn fit(&mut self, progress: Option<&ProgressFn>) -> Result<()> {
        let settings = self.settings.clone();
        let light3d = self.imageset.light3d();
        let (image_width, image_height) =
            (self.imageset.image_width(), self.imageset.image_height());

        let (map, map_grid) = match (settings.basis, light3d) {
            (BasisType::Bilinear, false) => (
                Some(build_resample_map(
                    self.imageset.lights(),
                    settings.resolution,
                    settings.sigma,
                    settings.regularization,
                    progress,
                )?),
                None,
            ),
            (BasisType::Bilinear, true) => {
                let imageset = &self.imageset;
                (
                    None,
                    Some(SpatialGrid::build(image_width, image_height, |x, y| {
                        build_resample_map(
                            &imageset.relative_lights(x, y),
                            settings.resolution,
                            settings.sigma,
                            settings.regularization,
                            progress,
                        )
                    })?),
                )
            }
            _ => (None, None),
        };

        let resampler = Resampler::new(
            settings.basis,
            settings.colorspace,
            settings.gamma_fix,
            self.ndimensions,
            image_width,
            image_height,
            map,
            map_grid,
        );

        let mut sample = PixelArray::default();
        self.imageset.sample(
            &mut sample,
            self.ndimensions as u32,
            &mut |acquired, out| resampler.resample_pixel(acquired, out),
            settings.samplingram,
        )?;
        let nsamples = sample.npixels();
        info!(nsamples, ndimensions = self.ndimensions, "collected fit sample");

        let nplanes = self.nplanes as u32;
        let (builder, builder_grid) = match (settings.basis, settings.colorspace, light3d) {
            (BasisType::Rbf | BasisType::Bilinear, Colorspace::Mrgb, _) => {
                (basis::fit_pca_mrgb(&sample, nplanes, progress)?, None)
            }
            (BasisType::Rbf | BasisType::Bilinear, Colorspace::Mycc, _) => {
                (basis::fit_pca_mycc(&sample, settings.yccplanes, progress)?, None)
            }
            (closed_form, colorspace, true) => {
                let imageset = &self.imageset;
                let grid = SpatialGrid::build(image_width, image_height, |x, y| {
                    basis::fit_closed_form(
                        closed_form,
                        colorspace,
                        &imageset.relative_lights(x, y),
                        nplanes,
                    )
                })?;
                (
                    basis::fit_closed_form(closed_form, colorspace, imageset.lights(), nplanes)?,
                    Some(grid),
                )
            }
            (closed_form, colorspace, false) => (
                basis::fit_closed_form(closed_form, colorspace, self.imageset.lights(), nplanes)?,
                None,
            ),
        };

        let projector = Projector::new(resampler, self.nplanes, light3d, builder, builder_grid);
        let material = material::plan(&projector, &sample, settings.rangecompress, progress)?;

        let normal_estimator = match settings.save_normals {
            false => None,
            true => NormalEstimator::new(
                settings.basis,
                settings.colorspace,
                self.nplanes,
                projector.builder(),
                self.imageset.lights(),
                settings.resolution,
                settings.sigma,
            )
            .tap_none(|| warn!("normals need the rgb or mrgb colorspace, skipping")),
        };

        self.fitted = Some(Fitted {
            projector,
            material,
            normal_estimator,
            nsamples,
        });
        Ok(())
    }

    /// Pass 2: stream every row through the worker pool into the plane JPEGs
    /// and auxiliary maps, then write the manifest. Returns the bytes taken
    /// by the planes plus the manifest.
    pub fn save(&mut self, output: &Path, progress: Option<&ProgressFn>) -> Result<u64> {
        let fitted = self
            .fitted
            .take()
            .ok_or_else(|| Error::InvalidConfig("save called before fit".into()))?;
        let result = self.save_fitted(&fitted, output, progress);
        self.fitted = Some(fitted);
        result
    }

    fn save_fitted(
        &mut self,
        fitted: &Fitted,
        output: &Path,
        progress: Option<&ProgressFn>,
    ) -> Result<u64> {
        const STAGE: &str = "Saving:";
        let settings = self.settings.clone();
        fs::create_dir_all(output)?;

        let (width, height) = (self.imageset.width(), self.imageset.height());
        let njpegs = self.nplanes.div_ceil(3);
        let data_driven = settings.basis.is_data_driven();

        let basis_values = data_driven.then(|| quantize_basis(fitted, self.ndimensions));
        let mut total = Manifest {
            width,
            height,
            format: "jpg".into(),
            basis: settings.basis,
            resolution: (settings.basis == BasisType::Bilinear).then_some(settings.resolution),
            colorspace: settings.colorspace,
            sigma: (settings.basis == BasisType::Rbf).then_some(settings.sigma),
            lights: Manifest::light_table(self.imageset.lights()),
            nplanes: (settings.colorspace != Colorspace::Mycc).then_some(self.nplanes as u32),
            yccplanes: (settings.colorspace == Colorspace::Mycc).then_some(settings.yccplanes),
            quality: settings.quality,
            basis_values,
            materials: vec![MaterialEntry::from_material(&fitted.material, data_driven)],
        }
        .write(&output.join("info.json"))?;

        if data_driven {
            self.save_basis_strip(fitted, output)?;
        }

        let mut sinks = (0..njpegs)
            .map(|j| {
                PlaneSink::create(
                    output.join(format!("plane_{j}.jpg")),
                    width,
                    height,
                    settings.quality,
                    subsampled(&settings, j),
                )
            })
            .collect::<Result<Vec<_>>>()?;

        let mut normals_map = (settings.save_normals && fitted.normal_estimator.is_some())
            .then(|| RgbImage::new(width, height));
        let mut means_map = settings.save_means.then(|| RgbImage::new(width, height));
        let mut medians_map = settings.save_medians.then(|| RgbImage::new(width, height));

        let nlights = self.imageset.lights().len();
        let mut workers = (0..settings.workers.max(1))
            .map(|_| Worker::new(width as usize, nlights, njpegs, &fitted.projector))
            .collect::<Vec<_>>();

        self.imageset.restart()?;
        let mut y = 0u32;
        while y < height {
            let batch = workers.len().min((height - y) as usize);
            for (offset, worker) in workers[..batch].iter_mut().enumerate() {
                report(progress, STAGE, 100 * (y + offset as u32) / height)?;
                self.imageset.read_line(&mut worker.acquired)?;
            }

            workers[..batch]
                .par_iter_mut()
                .for_each(|worker| worker.process(fitted, &settings, nlights));

            for (offset, worker) in workers[..batch].iter().enumerate() {
                let row = y + offset as u32;
                for (sink, line) in sinks.iter_mut().zip(&worker.lines) {
                    sink.write_row(line);
                }
                // normals pack x into red and y into blue, green stays empty
                blit_row(&mut normals_map, row, &worker.normals, |n| [n[0], 0, n[1]]);
                blit_row(&mut means_map, row, &worker.means, |m| m);
                blit_row(&mut medians_map, row, &worker.medians, |m| m);
            }
            y += batch as u32;
        }
        report(progress, STAGE, 100)?;

        for sink in sinks {
            total += sink.finish()?;
        }
        if let Some(map) = normals_map {
            map.save(output.join("normals.png"))?;
        }
        if let Some(map) = means_map {
            map.save(output.join("means.png"))?;
        }
        if let Some(map) = medians_map {
            map.save(output.join("medians.png"))?;
        }

        info!(bytes = total, output = %output.display(), "build saved");
        Ok(total)
    }

    /// `materials.png`: tile 0 is the mean, tile p+1 eigenvector p, every
    /// value remapped as `127 + range·eigen`.
    fn save_basis_strip(&self, fitted: &Fitted, output: &Path) -> Result<()> {
        let builder = fitted.projector.builder();
        let planes = &fitted.material.planes;
        let dim = self.ndimensions * 3;

        let strip = match self.settings.basis {
            BasisType::Bilinear => {
                let side = self.settings.resolution;
                let mut strip = RgbImage::new(side * (self.nplanes as u32 + 1), side);
                for y in 0..side {
                    for x in 0..side {
                        let o = ((x + y * side) * 3) as usize;
                        let sample = |data: &[f32]| {
                            [data[o] as u8, data[o + 1] as u8, data[o + 2] as u8]
                        };
                        strip.put_pixel(x, y, image::Rgb(sample(&builder.mean)));
                        for (p, plane) in planes.iter().enumerate() {
                            let row = builder.projection_row(p, dim);
                            let quantized = [0, 1, 2].map(|c| {
                                (127.0 + plane.range * row[o + c]).clamp(0.0, 255.0) as u8
                            });
                            strip.put_pixel((p as u32 + 1) * side + x, y, image::Rgb(quantized));
                        }
                    }
                }
                strip
            }
            BasisType::Rbf => {
                // sparse tiles: one texel per acquired light position
                let side = 32u32;
                let mut strip = RgbImage::new(side * (self.nplanes as u32 + 1), side);
                for (i, light) in self.imageset.lights().iter().enumerate() {
                    let (x, y) = to_octa(*light, side);
                    let (x, y) = (x as u32, y as u32);
                    let o = i * 3;
                    strip.put_pixel(
                        x,
                        y,
                        image::Rgb([
                            builder.mean[o] as u8,
                            builder.mean[o + 1] as u8,
                            builder.mean[o + 2] as u8,
                        ]),
                    );
                    for (p, plane) in planes.iter().enumerate() {
                        let row = builder.projection_row(p, dim);
                        let quantized = [0, 1, 2].map(|c| {
                            (127.0 + plane.range * row[o + c]).clamp(0.0, 255.0) as u8
                        });
                        strip.put_pixel((p as u32 + 1) * side + x, y, image::Rgb(quantized));
                    }
                }
                strip
            }
            _ => return Ok(()),
        };
        strip.save(output.join("materials.png"))?;
        Ok(())
    }
}

/// The integer rendition of the basis shipped inside the manifest: the mean,
/// then each eigenvector quantized around 127.
fn quantize_basis(fitted: &Fitted, ndimensions: usize) -> Vec<u8> {
    let builder = fitted.projector.builder();
    let dim = ndimensions * 3;
    let mut values: Vec<u8> = builder.mean.iter().map(|&m| m as u8).collect();
    for (p, plane) in fitted.material.planes.iter().enumerate() {
        values.extend(
            builder
                .projection_row(p, dim)
                .iter()
                .map(|&e| (127.0 + plane.range * e).clamp(0.0, 255.0) as u8),
        );
    }
    values
}

fn subsampled(settings: &BuildSettings, jpeg: usize) -> bool {
    if !settings.chroma_subsampling {
        return false;
    }
    match settings.colorspace {
        Colorspace::Mrgb => false,
        Colorspace::Ycc => jpeg < settings.yccplanes[0] as usize,
        _ => true,
    }
}

fn blit_row(target: &mut Option<RgbImage>, row: u32, data: &[u8], pack: impl Fn([u8; 3]) -> [u8; 3]) {
    if let Some(image) = target {
        for x in 0..image.width() {
            let o = x as usize * 3;
            image.put_pixel(x, row, image::Rgb(pack([data[o], data[o + 1], data[o + 2]])));
        }
    }
}

/// One JPEG per plane triplet. The file is created eagerly so a cancelled
/// build leaves its partial outputs on disk for the caller to inspect.
struct PlaneSink {
    path: PathBuf,
    encoder: JpegEncoder<BufWriter<fs::File>>,
    rows: Vec<u8>,
    width: u32,
    height: u32,
}

impl PlaneSink {
    fn create(path: PathBuf, width: u32, height: u32, quality: u8, subsample: bool) -> Result<Self> {
        let mut encoder = JpegEncoder::new_file(&path, quality)?;
        encoder.set_sampling_factor(match subsample {
            true => SamplingFactor::F_2_2,
            false => SamplingFactor::F_1_1,
        });
        Ok(Self {
            path,
            encoder,
            rows: Vec::with_capacity(width as usize * height as usize * 3),
            width,
            height,
        })
    }

    fn write_row(&mut self, row: &[u8]) {
        self.rows.extend_from_slice(row);
    }

    fn finish(self) -> Result<u64> {
        self.encoder.encode(
            &self.rows,
            self.width as u16,
            self.height as u16,
            ColorType::Rgb,
        )?;
        Ok(fs::metadata(&self.path)?.len())
    }
}

/// Per-row scratch owned by exactly one worker; workers are fungible, rows
/// are not.
struct Worker {
    acquired: PixelArray,
    resampled: PixelArray,
    scratch: Scratch,
    lines: Vec<Vec<u8>>,
    normals: Vec<u8>,
    means: Vec<u8>,
    medians: Vec<u8>,
}

impl Worker {
    fn new(width: usize, nlights: usize, njpegs: usize, projector: &Projector) -> Self {
        Self {
            acquired: PixelArray::new(width, nlights),
            resampled: PixelArray::new(width, projector.resampler().ndimensions()),
            scratch: projector.scratch(),
            lines: vec![vec![0; width * 3]; njpegs],
            normals: vec![0; width * 3],
            means: vec![0; width * 3],
            medians: vec![0; width * 3],
        }
    }

    fn process(&mut self, fitted: &Fitted, settings: &BuildSettings, nlights: usize) {
        let projector = &fitted.projector;
        let planes = &fitted.material.planes;
        let nplanes = projector.nplanes();

        for x in 0..self.acquired.npixels() {
            projector
                .resampler()
                .resample_pixel(&self.acquired[x], &mut self.resampled[x]);
            projector.project(&self.resampled[x], &mut self.scratch);
            let principal = &self.scratch.principal;

            for (j, line) in self.lines.iter_mut().enumerate() {
                for c in 0..3 {
                    let p = j * 3 + c;
                    if p >= nplanes {
                        break;
                    }
                    // the LRGB albedo triplet is stored raw
                    line[x * 3 + c] = match settings.colorspace {
                        Colorspace::Lrgb if j == 0 => principal[p].round().clamp(0.0, 255.0) as u8,
                        _ => planes[p].quantize(principal[p]),
                    };
                }
            }

            if let Some(estimator) = &fitted.normal_estimator {
                let normal = estimator.estimate(principal);
                for (c, &v) in normal.iter().enumerate() {
                    self.normals[x * 3 + c] = (v * 255.0).clamp(0.0, 255.0) as u8;
                }
            }
            if settings.save_means {
                for (c, v) in extract_mean(&self.acquired[x], nlights).into_iter().enumerate() {
                    self.means[x * 3 + c] = v.clamp(0.0, 255.0) as u8;
                }
            }
            if settings.save_medians {
                for (c, v) in extract_median(&self.acquired[x], nlights)
                    .into_iter()
                    .enumerate()
                {
                    self.medians[x * 3 + c] = v.clamp(0.0, 255.0) as u8;
                }
            }
        }
    }
}
