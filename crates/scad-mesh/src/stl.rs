use std::collections::HashMap;

use crate::Mesh;
use crate::format::binary_stl_facet_count;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StlError {
    #[error("input is neither a binary STL nor an ASCII STL")]
    UnrecognizedFormat,
    #[error("line {line}: {message}")]
    Ascii { line: usize, message: String },
    #[error("STL contains no facets")]
    NoFacets,
}

/// Reads an ASCII or binary STL into an indexed mesh, welding identical
/// vertices so the result can be used for previews and statistics.
pub fn parse_stl(bytes: &[u8]) -> Result<Mesh, StlError> {
    let mesh = if let Some(count) = binary_stl_facet_count(bytes) {
        parse_binary(bytes, count)
    } else if let Ok(text) = std::str::from_utf8(bytes)
        && text.trim_start().starts_with("solid")
    {
        parse_ascii(text)?
    } else {
        return Err(StlError::UnrecognizedFormat);
    };

    if mesh.triangles.is_empty() {
        return Err(StlError::NoFacets);
    }
    Ok(mesh)
}

fn parse_binary(bytes: &[u8], count: usize) -> Mesh {
    let mut builder = MeshBuilder::with_capacity(count);
    for facet in bytes[84..].chunks_exact(50).take(count) {
        // Skip the 12-byte normal; three vertices follow.
        let corners = [
            read_f32_triplet(&facet[12..24]),
            read_f32_triplet(&facet[24..36]),
            read_f32_triplet(&facet[36..48]),
        ];
        builder.push_triangle(corners);
    }
    builder.finish()
}

fn parse_ascii(text: &str) -> Result<Mesh, StlError> {
    let mut builder = MeshBuilder::with_capacity(0);
    let mut pending: Vec<[f64; 3]> = Vec::with_capacity(3);

    for (index, line) in text.lines().enumerate() {
        let line_no = index + 1;
        let mut parts = line.split_whitespace();
        match parts.next() {
            Some("vertex") => {
                let coords = parts
                    .map(|value| value.parse::<f64>())
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|err| StlError::Ascii {
                        line: line_no,
                        message: format!("invalid vertex coordinate: {err}"),
                    })?;
                let [x, y, z] = coords[..] else {
                    return Err(StlError::Ascii {
                        line: line_no,
                        message: format!("expected 3 coordinates, found {}", coords.len()),
                    });
                };
                pending.push([x, y, z]);
            }
            Some("endloop") => {
                if pending.len() != 3 {
                    return Err(StlError::Ascii {
                        line: line_no,
                        message: format!("facet has {} vertices, expected 3", pending.len()),
                    });
                }
                builder.push_triangle([pending[0], pending[1], pending[2]]);
                pending.clear();
            }
            _ => {}
        }
    }

    Ok(builder.finish())
}

fn read_f32_triplet(bytes: &[u8]) -> [f64; 3] {
    let component = |offset: usize| {
        f32::from_le_bytes([
            bytes[offset],
            bytes[offset + 1],
            bytes[offset + 2],
            bytes[offset + 3],
        ]) as f64
    };
    [component(0), component(4), component(8)]
}

struct MeshBuilder {
    mesh: Mesh,
    index: HashMap<[u64; 3], u32>,
}

impl MeshBuilder {
    fn with_capacity(triangles: usize) -> Self {
        Self {
            mesh: Mesh {
                vertices: Vec::with_capacity(triangles / 2),
                triangles: Vec::with_capacity(triangles),
            },
            index: HashMap::new(),
        }
    }

    fn push_triangle(&mut self, corners: [[f64; 3]; 3]) {
        let triangle = corners.map(|corner| self.vertex_index(corner));
        self.mesh.triangles.push(triangle);
    }

    fn vertex_index(&mut self, vertex: [f64; 3]) -> u32 {
        // -0.0 and 0.0 must weld together.
        let key = vertex.map(|value| (value + 0.0).to_bits());
        *self.index.entry(key).or_insert_with(|| {
            self.mesh.vertices.push(vertex);
            (self.mesh.vertices.len() - 1) as u32
        })
    }

    fn finish(self) -> Mesh {
        self.mesh
    }
}
