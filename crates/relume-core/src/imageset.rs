//! The image-set side of the pipeline: streaming rows across the whole stack
//! of registered photographs.
//!
//! The encoder only ever talks to the [`ImageSource`] trait; the bundled
//! [`FolderImageSet`] implements it for a directory of aligned images with a
//! `.lp` light file. Synthetic sources (tests, generators) implement the same
//! trait.

use {
    crate::{
        error::{Error, Result},
        pixel::{Color3f, Pixel, PixelArray},
    },
    image::RgbImage,
    itertools::Itertools,
    nalgebra::Vector3,
    rand::seq::index,
    std::path::{Path, PathBuf},
    tap::prelude::*,
    tracing::{debug, info},
};

/// A registered, light-annotated image stack, streamed one row at a time.
///
/// `read_line` must stay single-threaded: implementations advance shared
/// decoder state. The produced pixels carry *pre-crop* image coordinates so
/// near-field interpolation stays anchored to the acquisition geometry.
pub trait ImageSource {
    /// Post-crop output size.
    fn width(&self) -> u32;
    fn height(&self) -> u32;
    /// Pre-crop acquisition size.
    fn image_width(&self) -> u32;
    fn image_height(&self) -> u32;
    /// One (normalized) direction per image.
    fn lights(&self) -> &[Vector3<f32>];
    /// True when the light direction varies across the image plane.
    fn light3d(&self) -> bool {
        false
    }

    /// Fills `out` (width × nlights) with the next row and advances.
    fn read_line(&mut self, out: &mut PixelArray) -> Result<()>;

    /// Rewinds to row 0.
    fn restart(&mut self) -> Result<()>;

    /// Collects a randomly positioned set of pixels, each passed through
    /// `resample` into `ndimensions` slots, sized to fit `ram_budget_mb`.
    fn sample(
        &mut self,
        out: &mut PixelArray,
        ndimensions: u32,
        resample: &mut dyn FnMut(&Pixel, &mut Pixel),
        ram_budget_mb: u32,
    ) -> Result<()> {
        let bytes_per_pixel = ndimensions as u64 * 3 * 4;
        let budget = ram_budget_mb as u64 * 1024 * 1024;
        let wanted = (budget / bytes_per_pixel).min(self.width() as u64 * self.height() as u64);
        if wanted == 0 {
            return Err(Error::OutOfMemory {
                budget_mb: ram_budget_mb,
            });
        }

        let rows_wanted = (wanted / self.width() as u64)
            .max(1)
            .min(self.height() as u64) as usize;
        let per_row = (wanted as usize / rows_wanted).min(self.width() as usize);

        let mut rng = rand::thread_rng();
        let selected_rows = index::sample(&mut rng, self.height() as usize, rows_wanted)
            .into_vec()
            .tap_mut(|rows| rows.sort_unstable());
        debug!(
            nsamples = rows_wanted * per_row,
            rows = rows_wanted,
            "sampling image set"
        );

        out.resize(rows_wanted * per_row, ndimensions as usize);
        let mut acquired = PixelArray::new(self.width() as usize, self.lights().len());

        self.restart()?;
        let mut cursor = 0;
        for (rank, &row) in selected_rows.iter().enumerate() {
            while cursor <= row {
                self.read_line(&mut acquired)?;
                cursor += 1;
            }
            let columns = index::sample(&mut rng, self.width() as usize, per_row);
            for (slot, column) in columns.into_iter().enumerate() {
                resample(&acquired[column], &mut out[rank * per_row + slot]);
            }
        }
        self.restart()
    }

    /// Light directions as seen from image position `(x, y)` for a near-field
    /// dome: lights sit at 2.5 image-widths, re-aimed at the pixel.
    fn relative_lights(&self, x: u32, y: u32) -> Vec<Vector3<f32>> {
        let w = self.image_width() as f32;
        // image width is the unit on both axes
        let px = (x as f32 - w / 2.0) / w;
        let py = (y as f32 - self.image_height() as f32 / 2.0) / w;
        self.lights()
            .iter()
            .map(|light| {
                let scaled = light * 2.5;
                Vector3::new(scaled.x - px, scaled.y - py, scaled.z).normalize()
            })
            .collect()
    }
}

/// Options for opening a folder acquisition.
#[derive(Debug, Clone, Default)]
pub struct FolderOptions {
    /// x, y, width, height.
    pub crop: Option<[u32; 4]>,
    /// Image indices excluded from the build.
    pub skip: Vec<usize>,
    pub light3d: bool,
}

/// A directory of aligned photographs plus a `.lp` file naming one light
/// direction per image.
///
/// Frames are decoded up front and held in memory: the `image` crate decodes
/// whole frames, and re-decoding the stack once per row would turn pass 2
/// quadratic. Rows are then served straight from the decoded planes.
pub struct FolderImageSet {
    images: Vec<RgbImage>,
    lights: Vec<Vector3<f32>>,
    crop: [u32; 4],
    image_width: u32,
    image_height: u32,
    light3d: bool,
    row: u32,
}

impl FolderImageSet {
    pub fn open(folder: &Path, options: FolderOptions) -> Result<Self> {
        let entries = parse_light_file(&find_light_file(folder)?)?;
        info!(nlights = entries.len(), "parsed light file");

        let mut images = Vec::with_capacity(entries.len());
        let mut lights = Vec::with_capacity(entries.len());
        for (i, (name, light)) in entries.into_iter().enumerate() {
            if options.skip.contains(&i) {
                continue;
            }
            let path = resolve_image(folder, &name)?;
            let decoded = image::open(&path)?.into_rgb8();
            images.push(decoded);
            lights.push(light);
        }
        if images.is_empty() {
            return Err(Error::ImageSet("no usable images in the set".into()));
        }

        let (image_width, image_height) = images[0].dimensions();
        if let Some(odd) = images.iter().find(|i| i.dimensions() != (image_width, image_height)) {
            return Err(Error::ImageSet(format!(
                "inconsistent geometry: expected {image_width}x{image_height}, found {}x{}",
                odd.width(),
                odd.height()
            )));
        }

        let crop = match options.crop {
            None => [0, 0, image_width, image_height],
            Some([x, y, w, h]) if w > 0 && h > 0 && x + w <= image_width && y + h <= image_height => {
                [x, y, w, h]
            }
            Some(crop) => {
                return Err(Error::ImageSet(format!(
                    "crop {crop:?} does not fit in {image_width}x{image_height}"
                )))
            }
        };

        Ok(Self {
            images,
            lights,
            crop,
            image_width,
            image_height,
            light3d: options.light3d,
            row: 0,
        })
    }

    /// Assembles a set from already decoded frames; used by generators and
    /// tests.
    pub fn from_images(
        images: Vec<RgbImage>,
        lights: Vec<Vector3<f32>>,
        light3d: bool,
    ) -> Result<Self> {
        if images.is_empty() || images.len() != lights.len() {
            return Err(Error::ImageSet(format!(
                "{} images for {} lights",
                images.len(),
                lights.len()
            )));
        }
        let (image_width, image_height) = images[0].dimensions();
        Ok(Self {
            crop: [0, 0, image_width, image_height],
            image_width,
            image_height,
            lights: lights.into_iter().map(|l| l.normalize()).collect(),
            images,
            light3d,
            row: 0,
        })
    }
}

impl ImageSource for FolderImageSet {
    fn width(&self) -> u32 {
        self.crop[2]
    }

    fn height(&self) -> u32 {
        self.crop[3]
    }

    fn image_width(&self) -> u32 {
        self.image_width
    }

    fn image_height(&self) -> u32 {
        self.image_height
    }

    fn lights(&self) -> &[Vector3<f32>] {
        &self.lights
    }

    fn light3d(&self) -> bool {
        self.light3d
    }

    fn read_line(&mut self, out: &mut PixelArray) -> Result<()> {
        if self.row >= self.height() {
            return Err(Error::ImageSet(format!(
                "read past the last row ({})",
                self.height()
            )));
        }
        let [crop_x, crop_y, width, _] = self.crop;
        out.resize(width as usize, self.images.len());
        let y = crop_y + self.row;
        for (x, pixel) in out.iter_mut().enumerate() {
            pixel.x = crop_x + x as u32;
            pixel.y = y;
            for (i, frame) in self.images.iter().enumerate() {
                let p = frame.get_pixel(crop_x + x as u32, y);
                pixel[i] = Color3f::new(p[0] as f32, p[1] as f32, p[2] as f32);
            }
        }
        self.row += 1;
        Ok(())
    }

    fn restart(&mut self) -> Result<()> {
        self.row = 0;
        Ok(())
    }
}

fn find_light_file(folder: &Path) -> Result<PathBuf> {
    std::fs::read_dir(folder)
        .map_err(|e| Error::ImageSet(format!("reading [{}]: {e}", folder.display())))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.extension().is_some_and(|ext| ext == "lp"))
        .sorted()
        .next()
        .ok_or_else(|| Error::ImageSet(format!("no .lp light file in [{}]", folder.display())))
}

/// The classic RTI light-position format: a count line, then
/// `<image> <lx> <ly> <lz>` per image.
fn parse_light_file(path: &Path) -> Result<Vec<(String, Vector3<f32>)>> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::ImageSet(format!("reading [{}]: {e}", path.display())))?;
    let mut lines = content.lines().filter(|line| !line.trim().is_empty());

    let count: usize = lines
        .next()
        .and_then(|line| line.trim().parse().ok())
        .ok_or_else(|| Error::ImageSet("light file does not start with a count".into()))?;

    let entries = lines
        .map(|line| {
            let mut fields = line.split_whitespace();
            let name = fields
                .next()
                .ok_or_else(|| Error::ImageSet(format!("malformed light line [{line}]")))?;
            let direction: Vec<f32> = fields
                .map(|f| f.parse::<f32>())
                .try_collect()
                .map_err(|e| Error::ImageSet(format!("malformed light line [{line}]: {e}")))?;
            match direction.as_slice() {
                &[x, y, z] => Ok((
                    name.to_owned(),
                    Vector3::new(x, y, z).normalize(),
                )),
                other => Err(Error::ImageSet(format!(
                    "expected 3 light components, got {} in [{line}]",
                    other.len()
                ))),
            }
        })
        .try_collect::<_, Vec<_>, _>()?;

    if entries.len() != count {
        return Err(Error::ImageSet(format!(
            "light file promises {count} entries, carries {}",
            entries.len()
        )));
    }
    Ok(entries)
}

/// Light files often store absolute paths from the acquisition machine; only
/// the file name is trusted, and the stem alone is enough when extensions
/// were changed by preprocessing.
fn resolve_image(folder: &Path, name: &str) -> Result<PathBuf> {
    let name = name.replace('\\', "/");
    let file_name = Path::new(&name)
        .file_name()
        .ok_or_else(|| Error::ImageSet(format!("bad image name [{name}]")))?;
    let direct = folder.join(file_name);
    if direct.exists() {
        return Ok(direct);
    }
    let stem = Path::new(file_name).file_stem().unwrap_or(file_name);
    std::fs::read_dir(folder)
        .map_err(|e| Error::ImageSet(format!("reading [{}]: {e}", folder.display())))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .find(|path| path.file_stem() == Some(stem))
        .ok_or_else(|| Error::ImageSet(format!("image [{name}] not found in the set folder")))
}

#[cfg(test)]
mod tests {
    use {super::*, pretty_assertions::assert_eq};

    fn flat_image(width: u32, height: u32, rgb: [u8; 3]) -> RgbImage {
        RgbImage::from_pixel(width, height, image::Rgb(rgb))
    }

    fn three_light_set() -> FolderImageSet {
        FolderImageSet::from_images(
            vec![
                flat_image(4, 3, [10, 20, 30]),
                flat_image(4, 3, [40, 50, 60]),
                flat_image(4, 3, [70, 80, 90]),
            ],
            vec![
                Vector3::new(0.0, 0.0, 1.0),
                Vector3::new(0.5, 0.0, 0.8),
                Vector3::new(0.0, 0.5, 0.8),
            ],
            false,
        )
        .unwrap()
    }

    #[test]
    fn read_line_streams_all_images() {
        let mut set = three_light_set();
        let mut row = PixelArray::default();
        set.read_line(&mut row).unwrap();
        assert_eq!(row.npixels(), 4);
        assert_eq!(row[0][0], Color3f::new(10.0, 20.0, 30.0));
        assert_eq!(row[3][2], Color3f::new(70.0, 80.0, 90.0));
        assert_eq!((row[2].x, row[2].y), (2, 0));

        set.read_line(&mut row).unwrap();
        set.read_line(&mut row).unwrap();
        assert!(set.read_line(&mut row).is_err(), "only 3 rows exist");

        set.restart().unwrap();
        set.read_line(&mut row).unwrap();
        assert_eq!(row[0].y, 0);
    }

    #[test]
    fn sampling_respects_the_budget_and_resamples() {
        let mut set = three_light_set();
        let mut out = PixelArray::default();
        set.sample(&mut out, 3, &mut |acquired, resampled| {
            resampled.clone_from(acquired);
        }, 1)
            .unwrap();
        assert!(out.npixels() > 0 && out.npixels() <= 12);
        assert_eq!(out.components(), 3);
        assert_eq!(out[0][0], Color3f::new(10.0, 20.0, 30.0));
    }

    #[test]
    fn zero_budget_is_an_error() {
        let mut set = three_light_set();
        let mut out = PixelArray::default();
        // 0 MB cannot hold a single resampled pixel
        assert!(matches!(
            set.sample(&mut out, 64, &mut |_, _| {}, 0),
            Err(Error::OutOfMemory { .. })
        ));
    }

    #[test]
    fn light_file_round_trip() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::write(
            dir.path().join("capture.lp"),
            "2\nimg_000.jpg 0.1 0.2 0.97\nC:\\\\acquisition\\\\img_001.jpg -0.3 0.0 0.95\n",
        )?;
        let entries = parse_light_file(&find_light_file(dir.path())?)?;
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].0, "img_000.jpg");
        assert!((entries[0].1.norm() - 1.0).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn relative_lights_tilt_away_from_the_pixel() {
        let set = three_light_set();
        let at_origin = set.relative_lights(0, 0);
        let at_far_corner = set.relative_lights(3, 2);
        assert_eq!(at_origin.len(), 3);
        // the zenith light leans toward positive x/y when seen from the
        // top-left corner, and the other way from the bottom-right
        assert!(at_origin[0].x > 0.0 && at_origin[0].y > 0.0);
        assert!(at_far_corner[0].x < at_origin[0].x);
        for light in at_origin.iter().chain(&at_far_corner) {
            assert!((light.norm() - 1.0).abs() < 1e-6);
        }
    }
}
