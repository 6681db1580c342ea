//! Height-from-normals: a bilaterally reweighted Poisson solve.
//!
//! Four one-sided derivative operators (backward/forward along each axis)
//! are weighted by the normal's z component and stacked into one tall system
//! `A z = b`. Iteratively reweighted least squares with a sigmoid of the
//! squared-derivative imbalance lets the solution keep sharp creases instead
//! of smearing them; each round solves the normal equations by warm-started
//! conjugate gradient. A halving pyramid feeds every level the upsampled
//! solution of the coarser one.

use {
    crate::{
        error::{Error, Result},
        report, ProgressFn,
    },
    nalgebra::DVector,
    std::{io::Write, path::Path},
    tracing::{debug, info},
};

#[derive(Debug, Clone)]
pub struct IntegrationParams {
    /// Sigmoid sharpness of the bilateral reweighting; 0 stops after a
    /// single least-squares solve.
    pub k: f64,
    /// Relative energy change that ends the outer loop.
    pub tolerance: f64,
    /// Relative residual target of the inner conjugate gradient.
    pub solver_tolerance: f64,
    pub max_iterations: u32,
    pub max_solver_iterations: u32,
    /// Lowest pyramid level to solve; 0 goes down to full resolution.
    pub scale: u32,
}

impl Default for IntegrationParams {
    fn default() -> Self {
        Self {
            k: 2.0,
            tolerance: 1e-4,
            solver_tolerance: 1e-5,
            max_iterations: 150,
            max_solver_iterations: 2000,
            scale: 0,
        }
    }
}

fn sigmoid(x: f64, k: f64) -> f64 {
    1.0 / (1.0 + (-x * k).exp())
}

/// The four stacked one-sided derivative operators, matrix-free. Block
/// order: backward-y, forward-y, forward-x, backward-x; each block has one
/// row per pixel, rows on the image border stay empty.
struct Derivatives {
    width: usize,
    height: usize,
    /// Per-pixel weight: the (negated) normal z component.
    nz: Vec<f64>,
}

impl Derivatives {
    fn len(&self) -> usize {
        self.width * self.height
    }

    /// `out = A z`, `out` has `4 n` entries.
    fn apply(&self, z: &DVector<f64>, out: &mut DVector<f64>) {
        let (w, h, n) = (self.width, self.height, self.len());
        out.fill(0.0);
        for y in 0..h {
            for x in 0..w {
                let pos = x + y * w;
                let nz = self.nz[pos];
                if y > 0 {
                    out[pos] = nz * (z[pos - w] - z[pos]);
                }
                if y + 1 < h {
                    out[n + pos] = nz * (z[pos] - z[pos + w]);
                }
                if x + 1 < w {
                    out[2 * n + pos] = nz * (z[pos + 1] - z[pos]);
                }
                if x > 0 {
                    out[3 * n + pos] = nz * (z[pos] - z[pos - 1]);
                }
            }
        }
    }

    /// `out = Aᵀ r`, `r` has `4 n` entries.
    fn apply_transpose(&self, r: &DVector<f64>, out: &mut DVector<f64>) {
        let (w, h, n) = (self.width, self.height, self.len());
        out.fill(0.0);
        for y in 0..h {
            for x in 0..w {
                let pos = x + y * w;
                let nz = self.nz[pos];
                if y > 0 {
                    out[pos] -= nz * r[pos];
                    out[pos - w] += nz * r[pos];
                }
                if y + 1 < h {
                    out[pos] += nz * r[n + pos];
                    out[pos + w] -= nz * r[n + pos];
                }
                if x + 1 < w {
                    out[pos] -= nz * r[2 * n + pos];
                    out[pos + 1] += nz * r[2 * n + pos];
                }
                if x > 0 {
                    out[pos] += nz * r[3 * n + pos];
                    out[pos - 1] -= nz * r[3 * n + pos];
                }
            }
        }
    }
}

struct System {
    derivatives: Derivatives,
    b: DVector<f64>,
    weights: DVector<f64>,
    // scratch for operator applications
    tall: DVector<f64>,
}

impl System {
    fn new(width: usize, height: usize, normals: &[f32]) -> Self {
        let n = width * height;
        let nz = (0..n).map(|pos| -normals[pos * 3 + 2] as f64).collect();
        let mut b = DVector::zeros(4 * n);
        for pos in 0..n {
            // the derivative pairs share a right-hand side
            let du = -normals[pos * 3 + 1] as f64;
            let dv = -normals[pos * 3] as f64;
            b[pos] = du;
            b[n + pos] = du;
            b[2 * n + pos] = dv;
            b[3 * n + pos] = dv;
        }
        Self {
            derivatives: Derivatives {
                width,
                height,
                nz,
            },
            b,
            weights: DVector::from_element(4 * n, 0.5),
            tall: DVector::zeros(4 * n),
        }
    }

    /// `(A z − b)ᵀ W (A z − b)`
    fn energy(&mut self, z: &DVector<f64>) -> f64 {
        let (b, weights) = (&self.b, &self.weights);
        self.derivatives.apply(z, &mut self.tall);
        self.tall
            .iter()
            .zip(b.iter())
            .zip(weights.iter())
            .map(|((&az, &b), &w)| w * (az - b) * (az - b))
            .sum()
    }

    /// One conjugate-gradient solve of `AᵀWA z = AᵀWb`, warm-started on `z`.
    fn solve(&mut self, z: &mut DVector<f64>, tolerance: f64, max_iterations: u32) {
        let Self {
            derivatives,
            b,
            weights,
            tall,
        } = self;
        let n = derivatives.len();

        let mut rhs = DVector::zeros(n);
        tall.copy_from(b);
        tall.component_mul_assign(weights);
        derivatives.apply_transpose(tall, &mut rhs);

        // product = AᵀWA · input, with `tall` as the 4n-row intermediate
        let mut product = DVector::zeros(n);
        derivatives.apply(z, tall);
        tall.component_mul_assign(weights);
        derivatives.apply_transpose(tall, &mut product);

        let mut residual = &rhs - &product;
        let mut direction = residual.clone();
        let mut rs = residual.dot(&residual);
        let target = tolerance * tolerance * rhs.dot(&rhs).max(f64::MIN_POSITIVE);

        let mut iterations = 0u32;
        while iterations < max_iterations && rs > target {
            derivatives.apply(&direction, tall);
            tall.component_mul_assign(weights);
            derivatives.apply_transpose(tall, &mut product);

            let denominator = direction.dot(&product);
            if denominator <= 0.0 {
                break;
            }
            let alpha = rs / denominator;
            z.axpy(alpha, &direction, 1.0);
            residual.axpy(-alpha, &product, 1.0);
            let rs_next = residual.dot(&residual);
            direction.axpy(1.0, &residual, rs_next / rs);
            rs = rs_next;
            iterations += 1;
        }
        debug!(iterations, residual = rs.sqrt(), "conjugate gradient finished");
    }

    /// Sigmoid reweighting from the forward/backward derivative imbalance.
    fn reweight(&mut self, z: &DVector<f64>, k: f64) {
        let n = self.derivatives.len();
        self.derivatives.apply(z, &mut self.tall);
        for pos in 0..n {
            let backward_y = self.tall[pos];
            let forward_y = self.tall[n + pos];
            let forward_x = self.tall[2 * n + pos];
            let backward_x = self.tall[3 * n + pos];
            let wu = sigmoid(forward_y * forward_y - backward_y * backward_y, k);
            let wv = sigmoid(backward_x * backward_x - forward_x * forward_x, k);
            self.weights[pos] = wu;
            self.weights[n + pos] = 1.0 - wu;
            self.weights[2 * n + pos] = wv;
            self.weights[3 * n + pos] = 1.0 - wv;
        }
    }
}

/// Recovers heights from a dense normal map at a single resolution.
/// `heights` doubles as warm start and output.
pub fn integrate_normals(
    width: usize,
    height: usize,
    normals: &[f32],
    heights: &mut [f32],
    params: &IntegrationParams,
    progress: Option<&ProgressFn>,
) -> Result<()> {
    const STAGE: &str = "Integrating normals:";
    let n = width * height;
    assert_eq!(normals.len(), n * 3);
    assert_eq!(heights.len(), n);

    let mut system = System::new(width, height, normals);
    let mut z = DVector::from_iterator(n, heights.iter().map(|&h| h as f64));

    let start_energy = system.energy(&z);
    if !start_energy.is_finite() {
        return Err(Error::ImageSet("normal map produced a non-finite energy".into()));
    }
    let mut energy = start_energy;

    for _ in 0..params.max_iterations {
        system.solve(&mut z, params.solver_tolerance, params.max_solver_iterations);
        if params.k == 0.0 {
            break;
        }
        system.reweight(&z, params.k);

        let previous = energy;
        energy = system.energy(&z);
        let relative = ((energy - previous).abs() / previous.max(f64::MIN_POSITIVE)).max(1e-30);
        let total = ((energy - start_energy).abs() / start_energy.max(f64::MIN_POSITIVE)).max(1e-30);
        let span = total.ln() - params.tolerance.ln();
        let percent = match span.abs() < f64::EPSILON {
            true => 100.0,
            false => (100.0 * (relative.ln() - params.tolerance.ln()) / span).clamp(0.0, 100.0),
        };
        report(progress, STAGE, percent as u32)?;
        if relative < params.tolerance {
            break;
        }
    }

    for (height, value) in heights.iter_mut().zip(z.iter()) {
        *height = *value as f32;
    }
    Ok(())
}

struct NormalLevel {
    width: usize,
    height: usize,
    normals: Vec<f32>,
    heights: Vec<f32>,
}

impl NormalLevel {
    /// Halves the resolution by averaging 2×2 blocks and renormalizing.
    fn halve(&self) -> Self {
        let (width, height) = (self.width / 2, self.height / 2);
        let mut normals = vec![0.0f32; width * height * 3];
        for y in 0..height {
            for x in 0..width {
                let out = 3 * (x + y * width);
                for c in 0..3 {
                    let at = |sx: usize, sy: usize| self.normals[c + 3 * (sx + sy * self.width)];
                    normals[out + c] = (at(2 * x, 2 * y)
                        + at(2 * x + 1, 2 * y)
                        + at(2 * x, 2 * y + 1)
                        + at(2 * x + 1, 2 * y + 1))
                        / 4.0;
                }
                let length = (0..3)
                    .map(|c| normals[out + c] * normals[out + c])
                    .sum::<f32>()
                    .sqrt();
                if length > 0.0 {
                    for c in 0..3 {
                        normals[out + c] /= length;
                    }
                }
            }
        }
        Self {
            width,
            height,
            normals,
            heights: Vec::new(),
        }
    }

    /// Warm start: bilinear upsampling of the coarser level's heights.
    fn pull(&mut self, coarser: &Self) {
        self.heights = bilinear_upsample(
            &coarser.heights,
            coarser.width,
            coarser.height,
            self.width,
            self.height,
        );
    }
}

fn bilinear_upsample(
    data: &[f32],
    input_width: usize,
    input_height: usize,
    output_width: usize,
    output_height: usize,
) -> Vec<f32> {
    let x_ratio = match output_width {
        0 | 1 => 0.0,
        w => (input_width - 1) as f32 / (w - 1) as f32,
    };
    let y_ratio = match output_height {
        0 | 1 => 0.0,
        h => (input_height - 1) as f32 / (h - 1) as f32,
    };

    let mut output = vec![0.0f32; output_width * output_height];
    for i in 0..output_height {
        for j in 0..output_width {
            let x = x_ratio * j as f32;
            let y = y_ratio * i as f32;
            let (x_low, y_low) = (x.floor() as usize, y.floor() as usize);
            let (x_high, y_high) = (
                (x.ceil() as usize).min(input_width - 1),
                (y.ceil() as usize).min(input_height - 1),
            );
            let (wx, wy) = (x - x_low as f32, y - y_low as f32);

            let a = data[x_low + y_low * input_width];
            let b = data[x_high + y_low * input_width];
            let c = data[x_low + y_high * input_width];
            let d = data[x_high + y_high * input_width];
            output[j + i * output_width] = a * (1.0 - wx) * (1.0 - wy)
                + b * wx * (1.0 - wy)
                + c * wy * (1.0 - wx)
                + d * wx * wy;
        }
    }
    output
}

/// Side length below which the pyramid stops shrinking.
const PYRAMID_FLOOR: usize = 32;

/// Coarse-to-fine integration. Returns `(width, height, heights)` of the
/// requested pyramid level (level 0 is full resolution).
pub fn integrate_pyramid(
    width: usize,
    height: usize,
    normals: Vec<f32>,
    params: &IntegrationParams,
    progress: Option<&ProgressFn>,
) -> Result<(usize, usize, Vec<f32>)> {
    let mut pyramid = vec![NormalLevel {
        width,
        height,
        normals,
        heights: Vec::new(),
    }];
    while pyramid.last().unwrap().width > PYRAMID_FLOOR
        && pyramid.last().unwrap().height > PYRAMID_FLOOR
    {
        pyramid.push(pyramid.last().unwrap().halve());
    }

    let coarsest = pyramid.len() - 1;
    pyramid[coarsest].heights = vec![0.0; pyramid[coarsest].width * pyramid[coarsest].height];

    let floor = (params.scale as usize).min(coarsest);
    for level in (floor..=coarsest).rev() {
        report(progress, "Integrating normals:", (100 * (coarsest - level) / (coarsest - floor).max(1)) as u32)?;
        if level < coarsest {
            let (finer, coarser) = pyramid.split_at_mut(level + 1);
            finer[level].pull(&coarser[0]);
        }
        let current = &mut pyramid[level];
        info!(level, width = current.width, height = current.height, "integrating pyramid level");
        let (width, height) = (current.width, current.height);
        integrate_normals(
            width,
            height,
            &current.normals,
            &mut current.heights,
            params,
            progress,
        )?;
    }

    let result = pyramid.swap_remove(floor);
    Ok((result.width, result.height, result.heights))
}

/// Binary little-endian PLY mesh of the height field, two triangles per
/// pixel quad.
pub fn save_ply(path: &Path, width: usize, height: usize, heights: &[f32]) -> Result<()> {
    let file = std::fs::File::create(path)?;
    let mut out = std::io::BufWriter::new(file);

    write!(
        out,
        "ply\nformat binary_little_endian 1.0\nelement vertex {}\nproperty float x\nproperty float y\nproperty float z\nelement face {}\nproperty list uchar int vertex_index\nend_header\n",
        width * height,
        2 * (width - 1) * (height - 1),
    )?;

    for y in 0..height {
        for x in 0..width {
            out.write_all(&(x as f32).to_le_bytes())?;
            out.write_all(&(y as f32).to_le_bytes())?;
            out.write_all(&heights[x + y * width].to_le_bytes())?;
        }
    }
    for y in 0..height - 1 {
        for x in 0..width - 1 {
            let pos = (x + y * width) as i32;
            let w = width as i32;
            for triangle in [[pos, pos + w, pos + w + 1], [pos, pos + w + 1, pos + 1]] {
                out.write_all(&[3u8])?;
                for index in triangle {
                    out.write_all(&index.to_le_bytes())?;
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Normal map of a hemisphere bulging out of a flat plane, using the
    /// integrator's conventions (x in channel 0, flipped y in channel 1,
    /// negated z in channel 2).
    fn sphere_normals(size: usize, radius: f32) -> (Vec<f32>, Vec<f32>) {
        let center = size as f32 / 2.0;
        let mut normals = vec![0.0f32; size * size * 3];
        let mut depths = vec![0.0f32; size * size];
        for y in 0..size {
            for x in 0..size {
                let dx = x as f32 - center;
                let dy = y as f32 - center;
                let pos = x + y * size;
                let r2 = dx * dx + dy * dy;
                if r2 < radius * radius {
                    let z = (radius * radius - r2).sqrt();
                    normals[pos * 3] = dx / radius;
                    normals[pos * 3 + 1] = -dy / radius;
                    normals[pos * 3 + 2] = -z / radius;
                    depths[pos] = z;
                } else {
                    normals[pos * 3 + 2] = -1.0;
                }
            }
        }
        (normals, depths)
    }

    fn rms_inside(
        recovered: &[f32],
        expected: &[f32],
        size: usize,
        radius: f32,
    ) -> f32 {
        let center = size as f32 / 2.0;
        let inside = |x: usize, y: usize| {
            let dx = x as f32 - center;
            let dy = y as f32 - center;
            dx * dx + dy * dy < (radius * 0.9) * (radius * 0.9)
        };
        // heights are recovered up to an additive constant
        let mut offset = 0.0f64;
        let mut count = 0usize;
        for y in 0..size {
            for x in 0..size {
                if inside(x, y) {
                    offset += (recovered[x + y * size] - expected[x + y * size]) as f64;
                    count += 1;
                }
            }
        }
        offset /= count as f64;

        let mut sum = 0.0f64;
        for y in 0..size {
            for x in 0..size {
                if inside(x, y) {
                    let d = recovered[x + y * size] as f64 - offset - expected[x + y * size] as f64;
                    sum += d * d;
                }
            }
        }
        (sum / count as f64).sqrt() as f32
    }

    #[test_log::test]
    fn recovers_a_hemisphere_within_two_percent() {
        let (size, radius) = (128usize, 40.0f32);
        let (normals, depths) = sphere_normals(size, radius);
        let params = IntegrationParams {
            k: 2.0,
            tolerance: 1e-4,
            max_iterations: 30,
            ..Default::default()
        };
        let (w, h, heights) = integrate_pyramid(size, size, normals, &params, None).unwrap();
        assert_eq!((w, h), (size, size));
        let rms = rms_inside(&heights, &depths, size, radius);
        assert!(
            rms < 0.02 * radius,
            "rms {rms} exceeds 2% of radius {radius}"
        );
    }

    #[test]
    fn single_solve_when_k_is_zero() {
        let (size, radius) = (48usize, 16.0f32);
        let (normals, _) = sphere_normals(size, radius);
        let mut heights = vec![0.0f32; size * size];
        let params = IntegrationParams {
            k: 0.0,
            max_iterations: 50,
            ..Default::default()
        };
        integrate_normals(size, size, &normals, &mut heights, &params, None).unwrap();
        assert!(heights.iter().all(|h| h.is_finite()));
        assert!(heights.iter().any(|&h| h != 0.0));
    }

    #[test]
    fn cancellation_unwinds_the_pyramid() {
        let (size, radius) = (96usize, 30.0f32);
        let (normals, _) = sphere_normals(size, radius);
        let cancel: &crate::ProgressFn = &|_, _| false;
        assert!(matches!(
            integrate_pyramid(size, size, normals, &Default::default(), Some(cancel)),
            Err(Error::Cancelled)
        ));
    }

    #[test]
    fn upsampling_preserves_a_linear_ramp() {
        let coarse: Vec<f32> = (0..16).map(|i| (i % 4) as f32).collect();
        let fine = bilinear_upsample(&coarse, 4, 4, 7, 7);
        assert_eq!(fine.len(), 49);
        // corners are fixed points of the interpolation
        assert_eq!(fine[0], 0.0);
        assert_eq!(fine[6], 3.0);
        assert!((fine[3] - 1.5).abs() < 1e-6);
    }

    #[test]
    fn ply_export_writes_the_advertised_counts() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("mesh.ply");
        save_ply(&path, 4, 3, &vec![0.5f32; 12])?;
        let content = std::fs::read(&path)?;
        let header_end = content
            .windows(11)
            .position(|w| w == b"end_header\n")
            .unwrap()
            + 11;
        // 12 vertices of 12 bytes, 12 faces of 13 bytes
        assert_eq!(content.len() - header_end, 12 * 12 + 12 * 13);
        Ok(())
    }
}
