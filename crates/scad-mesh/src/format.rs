use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

const BINARY_STL_HEADER_LEN: usize = 84;
const BINARY_STL_FACET_LEN: usize = 50;

/// Mesh formats the CAD compiler is asked to export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeshFormat {
    AsciiStl,
    #[default]
    BinaryStl,
    Off,
    Amf,
    ThreeMf,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown mesh format '{0}' (expected one of: asciistl, binstl, off, amf, 3mf)")]
pub struct UnknownFormat(pub String);

impl MeshFormat {
    pub const ALL: [MeshFormat; 5] = [
        MeshFormat::AsciiStl,
        MeshFormat::BinaryStl,
        MeshFormat::Off,
        MeshFormat::Amf,
        MeshFormat::ThreeMf,
    ];

    /// Value passed to `openscad --export-format`.
    pub fn export_flag(self) -> &'static str {
        match self {
            MeshFormat::AsciiStl => "asciistl",
            MeshFormat::BinaryStl => "binstl",
            MeshFormat::Off => "off",
            MeshFormat::Amf => "amf",
            MeshFormat::ThreeMf => "3mf",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            MeshFormat::AsciiStl | MeshFormat::BinaryStl => "stl",
            MeshFormat::Off => "off",
            MeshFormat::Amf => "amf",
            MeshFormat::ThreeMf => "3mf",
        }
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            MeshFormat::AsciiStl | MeshFormat::BinaryStl => "application/sla",
            MeshFormat::Off => "application/octet-stream",
            MeshFormat::Amf => "application/x-amf",
            MeshFormat::ThreeMf => "model/3mf",
        }
    }

    /// Name offered to the browser when downloading.
    pub fn download_name(self) -> String {
        format!("model.{}", self.extension())
    }

    pub fn is_stl(self) -> bool {
        matches!(self, MeshFormat::AsciiStl | MeshFormat::BinaryStl)
    }

    /// Checks the leading bytes (or, for binary STL, the facet count) against
    /// what this format must look like.
    pub fn matches_marker(self, bytes: &[u8]) -> bool {
        match self {
            MeshFormat::AsciiStl => trim_ascii_start(bytes).starts_with(b"solid"),
            MeshFormat::BinaryStl => binary_stl_facet_count(bytes).is_some(),
            MeshFormat::Off => trim_ascii_start(bytes).starts_with(b"OFF"),
            MeshFormat::Amf => {
                let head = &bytes[..bytes.len().min(512)];
                let text = String::from_utf8_lossy(head);
                text.trim_start().starts_with("<?xml") && text.contains("<amf")
            }
            MeshFormat::ThreeMf => bytes.starts_with(b"PK\x03\x04"),
        }
    }
}

impl fmt::Display for MeshFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.export_flag())
    }
}

impl FromStr for MeshFormat {
    type Err = UnknownFormat;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "asciistl" | "ascii-stl" | "ascii_stl" => Ok(MeshFormat::AsciiStl),
            "binstl" | "binary-stl" | "binary_stl" | "stl" => Ok(MeshFormat::BinaryStl),
            "off" => Ok(MeshFormat::Off),
            "amf" => Ok(MeshFormat::Amf),
            "3mf" | "three_mf" => Ok(MeshFormat::ThreeMf),
            _ => Err(UnknownFormat(value.to_string())),
        }
    }
}

/// Best-effort identification of a mesh file from its contents.
pub fn detect_format(bytes: &[u8]) -> Option<MeshFormat> {
    // Binary STL first: its 80-byte header may legally begin with "solid".
    [
        MeshFormat::BinaryStl,
        MeshFormat::AsciiStl,
        MeshFormat::Off,
        MeshFormat::Amf,
        MeshFormat::ThreeMf,
    ]
    .into_iter()
    .find(|format| format.matches_marker(bytes))
}

/// Facet count of a binary STL whose length agrees with its header.
pub(crate) fn binary_stl_facet_count(bytes: &[u8]) -> Option<usize> {
    if bytes.len() < BINARY_STL_HEADER_LEN {
        return None;
    }
    let count = u32::from_le_bytes([bytes[80], bytes[81], bytes[82], bytes[83]]) as usize;
    let expected = count
        .checked_mul(BINARY_STL_FACET_LEN)?
        .checked_add(BINARY_STL_HEADER_LEN)?;
    (expected == bytes.len()).then_some(count)
}

fn trim_ascii_start(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|byte| !byte.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    &bytes[start..]
}
