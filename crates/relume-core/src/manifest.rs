//! The `info.json` manifest a viewer loads before touching any plane JPEG.

use {
    crate::{
        basis::{BasisType, Colorspace},
        error::Result,
        material::Material,
    },
    nalgebra::Vector3,
    serde::{Deserialize, Serialize},
    std::path::Path,
    tracing::info,
};

/// Per-material quantization tables; `range` travels only with the PCA bases
/// (the viewer needs it to dequantize the basis image itself).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MaterialEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub range: Option<Vec<f32>>,
    pub scale: Vec<f32>,
    pub bias: Vec<f32>,
}

impl MaterialEntry {
    pub fn from_material(material: &Material, data_driven: bool) -> Self {
        Self {
            range: data_driven
                .then(|| material.planes.iter().map(|p| p.range).collect()),
            scale: material.planes.iter().map(|p| p.scale).collect(),
            bias: material.planes.iter().map(|p| p.bias).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Manifest {
    pub width: u32,
    pub height: u32,
    pub format: String,
    #[serde(rename = "type")]
    pub basis: BasisType,
    /// Octahedral grid side; BILINEAR only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution: Option<u32>,
    pub colorspace: Colorspace,
    /// RBF radius; RBF only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sigma: Option<f32>,
    /// Flattened direction triples, rounded to 3 decimals.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub lights: Vec<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nplanes: Option<u32>,
    /// Per-channel plane counts; replaces `nplanes` for MYCC.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub yccplanes: Option<[u32; 3]>,
    pub quality: u8,
    /// Quantized mean + eigenvectors; the data-driven bases only.
    #[serde(rename = "basis", skip_serializing_if = "Option::is_none")]
    pub basis_values: Option<Vec<u8>>,
    pub materials: Vec<MaterialEntry>,
}

impl Manifest {
    /// Flattens and rounds the light table the way every deployed viewer
    /// expects it.
    pub fn light_table(lights: &[Vector3<f32>]) -> Vec<f64> {
        lights
            .iter()
            .flat_map(|l| [l.x, l.y, l.z])
            .map(|component| (component as f64 * 1000.0).round() / 1000.0)
            .collect()
    }

    /// Serializes to `path`, returning the written size.
    pub fn write(&self, path: &Path) -> Result<u64> {
        let encoded = serde_json::to_vec_pretty(self)
            .map_err(|e| crate::Error::ImageSet(format!("encoding manifest: {e}")))?;
        std::fs::write(path, &encoded)?;
        info!(path = %path.display(), bytes = encoded.len(), "wrote manifest");
        Ok(encoded.len() as u64)
    }

    pub fn read(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| crate::Error::ImageSet(format!("parsing manifest: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use {super::*, pretty_assertions::assert_eq};

    fn minimal() -> Manifest {
        Manifest {
            width: 640,
            height: 480,
            format: "jpg".into(),
            basis: BasisType::Ptm,
            resolution: None,
            colorspace: Colorspace::Rgb,
            sigma: None,
            lights: Manifest::light_table(&[Vector3::new(0.123456, -0.5, 0.857_91)]),
            nplanes: Some(18),
            yccplanes: None,
            quality: 95,
            basis_values: None,
            materials: vec![MaterialEntry {
                range: None,
                scale: vec![0.5; 18],
                bias: vec![0.1; 18],
            }],
        }
    }

    #[test]
    fn lights_are_rounded_to_three_decimals() {
        let manifest = minimal();
        assert_eq!(manifest.lights, vec![0.123, -0.5, 0.858]);
    }

    #[test]
    fn json_round_trip() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("info.json");
        let manifest = minimal();
        let bytes = manifest.write(&path)?;
        assert_eq!(bytes, std::fs::metadata(&path)?.len());
        assert_eq!(Manifest::read(&path)?, manifest);
        Ok(())
    }

    #[test]
    fn optional_fields_stay_out_of_the_json() -> anyhow::Result<()> {
        let encoded = serde_json::to_string(&minimal())?;
        assert!(!encoded.contains("resolution"));
        assert!(!encoded.contains("sigma"));
        assert!(!encoded.contains("yccplanes"));
        assert!(!encoded.contains("range"));
        assert!(encoded.contains("\"type\":\"ptm\""));
        assert!(encoded.contains("\"colorspace\":\"rgb\""));
        Ok(())
    }
}
