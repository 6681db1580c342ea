//! End-to-end builds over synthetic image sets: fit, encode to a temp
//! directory, then read the outputs back the way a viewer would.

use {
    image::RgbImage,
    nalgebra::Vector3,
    relume_core::{
        basis::{BasisType, Colorspace},
        imageset::FolderImageSet,
        manifest::Manifest,
        pixel::{Color3f, Pixel},
        project::Projector,
        BuildSettings, Encoder, Error, ProgressFn,
    },
};

fn dome_lights(count: usize) -> Vec<Vector3<f32>> {
    (0..count)
        .map(|i| {
            let azimuth = i as f32 * std::f32::consts::TAU * 0.618_034;
            let z = 0.3 + 0.65 * (i as f32 + 0.5) / count as f32;
            let r = (1.0f32 - z * z).sqrt();
            Vector3::new(r * azimuth.cos(), r * azimuth.sin(), z).normalize()
        })
        .collect()
}

fn quick_settings(basis: BasisType, colorspace: Colorspace) -> BuildSettings {
    BuildSettings {
        basis,
        colorspace,
        quality: 100,
        samplingram: 16,
        workers: 2,
        ..Default::default()
    }
}

/// One image per light, every pixel painted by `shade(light, x, y)`.
fn synthetic_set(
    width: u32,
    height: u32,
    lights: &[Vector3<f32>],
    shade: impl Fn(&Vector3<f32>, u32, u32) -> [f32; 3],
) -> FolderImageSet {
    let images = lights
        .iter()
        .map(|light| {
            RgbImage::from_fn(width, height, |x, y| {
                image::Rgb(shade(light, x, y).map(|v| v.clamp(0.0, 255.0) as u8))
            })
        })
        .collect();
    FolderImageSet::from_images(images, lights.to_vec(), false).unwrap()
}

fn dequantize(manifest: &Manifest, plane: usize, value: u8) -> f32 {
    let material = &manifest.materials[0];
    (value as f32 - material.bias[plane]) * material.scale[plane]
}

#[test_log::test]
fn ptm_rgb_minimal_solid_red() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let lights = dome_lights(6);
    let set = synthetic_set(4, 4, &lights, |_, _, _| [255.0, 0.0, 0.0]);

    let mut encoder = Encoder::new(set, quick_settings(BasisType::Ptm, Colorspace::Rgb))?;
    encoder.fit(None)?;
    encoder.save(dir.path(), None)?;

    for j in 0..6 {
        assert!(dir.path().join(format!("plane_{j}.jpg")).exists());
    }
    assert!(!dir.path().join("plane_6.jpg").exists());

    let manifest = Manifest::read(&dir.path().join("info.json"))?;
    assert_eq!(manifest.nplanes, Some(18));
    assert_eq!((manifest.width, manifest.height), (4, 4));
    assert_eq!(manifest.lights.len(), 18);

    // the constant plane triplet carries the albedo exactly
    let plane0 = image::open(dir.path().join("plane_0.jpg"))?.into_rgb8();
    let pixel = plane0.get_pixel(1, 1);
    assert!((dequantize(&manifest, 0, pixel[0]) - 255.0).abs() <= 1.0);
    assert!(dequantize(&manifest, 1, pixel[1]).abs() <= 1.0);
    assert!(dequantize(&manifest, 2, pixel[2]).abs() <= 1.0);
    Ok(())
}

#[test_log::test]
fn ptm_reconstruction_stays_within_a_quantization_step() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let lights = dome_lights(8);
    // polynomial in (lx, ly) per pixel: inside the PTM model space, and far
    // enough from 0/255 that nothing clamps
    let shade = |light: &Vector3<f32>, x: u32, y: u32| {
        let v = 60.0
            + 10.0 * x as f32
            + 40.0 * light.x * (1.0 + y as f32) / 8.0
            + 30.0 * light.y * light.y;
        [v, v / 2.0, 30.0]
    };
    let set = synthetic_set(8, 8, &lights, shade);

    let mut encoder = Encoder::new(set, quick_settings(BasisType::Ptm, Colorspace::Rgb))?;
    encoder.fit(None)?;
    encoder.save(dir.path(), None)?;
    let manifest = Manifest::read(&dir.path().join("info.json"))?;

    let planes: Vec<RgbImage> = (0..6)
        .map(|j| {
            image::open(dir.path().join(format!("plane_{j}.jpg")))
                .map(|i| i.into_rgb8())
        })
        .collect::<Result<_, _>>()?;

    let max_scale = manifest.materials[0]
        .scale
        .iter()
        .fold(0.0f32, |acc, &s| acc.max(s));
    for (x, y) in [(0u32, 0u32), (3, 5), (7, 7)] {
        for light in &lights {
            let weights = [
                1.0,
                light.x,
                light.y,
                light.x * light.x,
                light.x * light.y,
                light.y * light.y,
            ];
            let reconstructed: f32 = (0..6)
                .map(|j| weights[j] * dequantize(&manifest, j * 3, planes[j].get_pixel(x, y)[0]))
                .sum();
            let expected = shade(light, x, y)[0];
            // six dequantized coefficients, each carrying up to half a
            // quantization step plus ~2 codes of jpeg noise at quality 100
            assert!(
                (reconstructed - expected).abs() <= 16.0 * max_scale + 1.0,
                "({x},{y}) under {light:?}: {reconstructed} vs {expected}"
            );
        }
    }
    Ok(())
}

#[test_log::test]
fn bilinear_mrgb_emits_the_basis_strip() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let lights = dome_lights(64);
    let shade = |light: &Vector3<f32>, x: u32, y: u32| {
        let base = 40.0 + 10.0 * (x % 4) as f32 + 6.0 * (y % 4) as f32;
        let lit = 150.0 * (light.z + 0.8 * light.x * (x as f32 / 16.0));
        [base + lit, base + lit * 0.6, base + lit * 0.3]
    };
    let set = synthetic_set(16, 16, &lights, shade);

    let settings = BuildSettings {
        nplanes: 9,
        resolution: 8,
        ..quick_settings(BasisType::Bilinear, Colorspace::Mrgb)
    };
    let mut encoder = Encoder::new(set, settings)?;
    encoder.fit(None)?;

    // projection rows of a PCA basis are unit vectors
    let projector = &encoder.fitted().unwrap().projector;
    let dim = projector.dim();
    assert_eq!(dim, 8 * 8 * 3);
    for p in 0..9 {
        let norm: f32 = projector
            .builder()
            .projection_row(p, dim)
            .iter()
            .map(|w| w * w)
            .sum();
        assert!((norm.sqrt() - 1.0).abs() < 1e-4, "plane {p} norm {norm}");
    }

    encoder.save(dir.path(), None)?;

    let strip = image::open(dir.path().join("materials.png"))?.into_rgb8();
    assert_eq!(strip.dimensions(), (80, 8));

    let manifest = Manifest::read(&dir.path().join("info.json"))?;
    assert_eq!(manifest.resolution, Some(8));
    assert_eq!(manifest.nplanes, Some(9));
    let basis = manifest.basis_values.as_ref().expect("basis ints");
    assert_eq!(basis.len(), (9 + 1) * 8 * 8 * 3);
    assert!(manifest.materials[0].range.is_some());
    Ok(())
}

#[test_log::test]
fn lrgb_albedo_planes_ignore_the_shading() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let lights = dome_lights(12);
    // checkerboard albedo modulated per image by a shading ramp peaking at 1,
    // so the recovered albedo is the unscaled board
    let albedo = |x: u32, y: u32| -> [f32; 3] {
        match (x / 4 + y / 4) % 2 {
            0 => [220.0, 60.0, 40.0],
            _ => [40.0, 180.0, 220.0],
        }
    };
    let images: Vec<RgbImage> = (0..lights.len())
        .map(|i| {
            let shading = 0.4 + 0.6 * i as f32 / (lights.len() - 1) as f32;
            RgbImage::from_fn(8, 8, |x, y| {
                image::Rgb(albedo(x, y).map(|a| (a * shading).clamp(0.0, 255.0) as u8))
            })
        })
        .collect();
    let set = FolderImageSet::from_images(images, lights.clone(), false)?;

    let mut encoder = Encoder::new(set, quick_settings(BasisType::Ptm, Colorspace::Lrgb))?;
    encoder.fit(None)?;
    encoder.save(dir.path(), None)?;

    let manifest = Manifest::read(&dir.path().join("info.json"))?;
    assert_eq!(manifest.nplanes, Some(9));

    // the first plane file carries the raw albedo, shading-free
    let plane0 = image::open(dir.path().join("plane_0.jpg"))?.into_rgb8();
    for (x, y) in [(1u32, 1u32), (6, 1), (2, 6), (5, 5)] {
        let expected = albedo(x, y);
        let found = plane0.get_pixel(x, y);
        for c in 0..3 {
            assert!(
                (found[c] as f32 - expected[c]).abs() < 10.0,
                "albedo at ({x},{y}) channel {c}: {} vs {}",
                found[c],
                expected[c]
            );
        }
    }
    // later planes hold luminance coefficients
    assert!(dir.path().join("plane_2.jpg").exists());
    assert!(!dir.path().join("plane_3.jpg").exists());
    Ok(())
}

#[test_log::test]
fn cancellation_mid_save_leaves_partial_planes() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let lights = dome_lights(6);
    let set = synthetic_set(16, 32, &lights, |light, x, _| {
        [140.0 * light.z + x as f32, 80.0, 60.0]
    });

    let mut encoder = Encoder::new(set, quick_settings(BasisType::Ptm, Colorspace::Rgb))?;
    encoder.fit(None)?;

    let cancel_at_half: &ProgressFn = &|stage, percent| !(stage == "Saving:" && percent >= 50);
    match encoder.save(dir.path(), Some(cancel_at_half)) {
        Err(Error::Cancelled) => {}
        other => panic!("expected cancellation, got {other:?}"),
    }

    // sinks are created eagerly, so the partial outputs stay behind
    assert!(dir.path().join("plane_0.jpg").exists());
    assert!(dir.path().join("info.json").exists());
    Ok(())
}

#[test_log::test]
fn near_field_bilinear_builds_a_map_grid() -> anyhow::Result<()> {
    let lights = dome_lights(64);
    let images = lights
        .iter()
        .map(|light| {
            RgbImage::from_fn(16, 16, |x, _| {
                image::Rgb([
                    (120.0 * light.z + x as f32).clamp(0.0, 255.0) as u8,
                    90,
                    40,
                ])
            })
        })
        .collect();
    let set = FolderImageSet::from_images(images, lights.clone(), true)?;

    let settings = BuildSettings {
        nplanes: 6,
        resolution: 8,
        ..quick_settings(BasisType::Bilinear, Colorspace::Mrgb)
    };
    let mut encoder = Encoder::new(set, settings)?;
    encoder.fit(None)?;

    let projector = &encoder.fitted().unwrap().projector;
    let grid = projector
        .resampler()
        .map_grid()
        .expect("near-field build owns a grid of resample maps");
    assert_eq!(grid.side(), 8);
    assert_eq!(grid.len(), 64);

    // at (0, 0) the bilinear blend degenerates to the top-left cell alone
    let mut acquired = Pixel::with_dimensions(lights.len());
    acquired.x = 0;
    acquired.y = 0;
    for (i, slot) in acquired.iter_mut().enumerate() {
        *slot = Color3f::new(10.0 + i as f32, 120.0 - i as f32, 55.0);
    }
    let mut blended = Pixel::with_dimensions(64);
    projector.resampler().resample_pixel(&acquired, &mut blended);

    let mut corner_only = Pixel::with_dimensions(64);
    grid.cell(0, 0).accumulate(&acquired, &mut corner_only, 1.0);
    for (a, b) in blended.iter().zip(corner_only.iter()) {
        for c in 0..3 {
            assert!((a[c] - b[c]).abs() < 1e-5);
        }
    }
    Ok(())
}

#[test_log::test]
fn near_field_closed_form_builds_a_basis_grid() -> anyhow::Result<()> {
    let lights = dome_lights(12);
    let images = lights
        .iter()
        .map(|light| {
            RgbImage::from_fn(16, 16, |_, y| {
                image::Rgb([(150.0 * light.z) as u8, (90.0 + y as f32) as u8, 70])
            })
        })
        .collect();
    let set = FolderImageSet::from_images(images, lights.clone(), true)?;

    let mut encoder = Encoder::new(set, quick_settings(BasisType::Ptm, Colorspace::Rgb))?;
    encoder.fit(None)?;

    let fitted = encoder.fitted().unwrap();
    let grid = fitted
        .projector
        .builder_grid()
        .expect("near-field closed-form fit owns a grid of builders");
    assert_eq!((grid.side(), grid.len()), (8, 64));

    // a pixel at the origin projects exactly like the top-left local basis
    let mut pixel = Pixel::with_dimensions(lights.len());
    pixel.x = 0;
    pixel.y = 0;
    for (slot, light) in pixel.iter_mut().zip(&lights) {
        let v = 200.0 * light.z;
        *slot = Color3f::new(v, v * 0.7, v * 0.2);
    }

    let mut scratch = fitted.projector.scratch();
    fitted.projector.project(&pixel, &mut scratch);
    let blended = scratch.principal.clone();

    let corner = Projector::new(
        fitted.projector.resampler().clone(),
        fitted.projector.nplanes(),
        false,
        grid.cell(0, 0).clone(),
        None,
    );
    let mut corner_scratch = corner.scratch();
    corner.project(&pixel, &mut corner_scratch);

    for (a, b) in blended.iter().zip(&corner_scratch.principal) {
        assert!((a - b).abs() < 1e-5, "{a} vs {b}");
    }
    Ok(())
}

#[test_log::test]
fn aux_maps_are_written_on_request() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let lights = dome_lights(9);
    let set = synthetic_set(6, 6, &lights, |light, x, y| {
        let v = 200.0 * light.z + 5.0 * (x + y) as f32;
        [v, v * 0.8, v * 0.5]
    });

    let settings = BuildSettings {
        save_normals: true,
        save_means: true,
        save_medians: true,
        ..quick_settings(BasisType::Ptm, Colorspace::Rgb)
    };
    let mut encoder = Encoder::new(set, settings)?;
    encoder.fit(None)?;
    encoder.save(dir.path(), None)?;

    for name in ["normals.png", "means.png", "medians.png"] {
        let map = image::open(dir.path().join(name))?.into_rgb8();
        assert_eq!(map.dimensions(), (6, 6), "{name}");
    }
    Ok(())
}
