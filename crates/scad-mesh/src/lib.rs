pub mod format;
pub mod stats;
pub mod stl;

/// Indexed triangle mesh read back from a compiled model.
#[derive(Debug, Clone, PartialEq)]
pub struct Mesh {
    pub vertices: Vec<[f64; 3]>,
    pub triangles: Vec<[u32; 3]>,
}

impl Mesh {
    pub fn empty() -> Self {
        Self {
            vertices: Vec::new(),
            triangles: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty() || self.triangles.is_empty()
    }
}

pub use format::{MeshFormat, UnknownFormat, detect_format};
pub use stats::{BoundingBox, MeshStats};
pub use stl::{StlError, parse_stl};
