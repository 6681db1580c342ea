//! Octahedral parametrization of the light hemisphere.
//!
//! A direction maps onto the `|x|+|y|+|z| = 1` diamond, is rotated 45° into
//! the unit square and finally scaled to `[0, R-1]²` grid coordinates. The
//! exact arithmetic here is a wire-format contract shared with the viewer:
//! cell `(x, y)` of the basis image decodes to `from_octa(x, y, R)`.

use nalgebra::Vector3;

/// Projects a (near-)unit direction to continuous grid coordinates, clamped
/// to `[0, R-1]`.
pub fn to_octa(d: Vector3<f32>, resolution: u32) -> (f32, f32) {
    let s = d.x.abs() + d.y.abs() + d.z.abs();
    let u = (d.x + d.y) / s;
    let v = (d.y - d.x) / s;
    let top = resolution as f32 - 1.0;
    (
        ((u + 1.0) / 2.0 * top).clamp(0.0, top),
        ((v + 1.0) / 2.0 * top).clamp(0.0, top),
    )
}

/// Direction of grid cell `(x, y)`, normalized. The z component is clamped at
/// zero before normalization so grid corners never go NaN on rounding noise.
pub fn from_octa(x: u32, y: u32, resolution: u32) -> Vector3<f32> {
    let top = resolution as f32 - 1.0;
    let ox = 2.0 * x as f32 / top - 1.0;
    let oy = 2.0 * y as f32 / top - 1.0;
    let dx = (ox - oy) / 2.0;
    let dy = (ox + oy) / 2.0;
    let dz = (1.0 - dx.abs() - dy.abs()).max(0.0);
    Vector3::new(dx, dy, dz).normalize()
}
