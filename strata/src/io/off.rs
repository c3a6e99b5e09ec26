use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use glam::Vec3;

use crate::error::{Result, StrataError};
use crate::mesh::TriangleMesh;

fn next_content_line<R: BufRead>(
    input: &mut R,
    line: &mut String,
    path: &Path,
) -> Result<()> {
    loop {
        line.clear();
        if input.read_line(line)? == 0 {
            return Err(StrataError::file_format(path, "unexpected end of file"));
        }
        let trimmed = line.trim();
        if !trimmed.is_empty() && !trimmed.starts_with('#') {
            return Ok(());
        }
    }
}

/// Loads a mesh in OFF format. The NOFF variant carries per-vertex
/// normals. Quad faces are split fan-wise into two triangles.
pub fn load_off_mesh(path: &Path) -> Result<TriangleMesh> {
    let file = File::open(path)?;
    let mut input = BufReader::new(file);
    let mut line = String::new();

    next_content_line(&mut input, &mut line, path)?;
    let header = line.trim();
    let has_normals = match header {
        "OFF" => false,
        "NOFF" => true,
        _ => return Err(StrataError::file_format(path, "unrecognized OFF header")),
    };

    next_content_line(&mut input, &mut line, path)?;
    let counts: Vec<usize> = line
        .split_whitespace()
        .map(|t| t.parse())
        .collect::<std::result::Result<_, _>>()
        .map_err(|_| StrataError::file_format(path, "malformed element counts"))?;
    if counts.len() != 3 {
        return Err(StrataError::file_format(path, "malformed element counts"));
    }
    let (num_vertices, num_faces) = (counts[0], counts[1]);

    let mut mesh = TriangleMesh::new();
    mesh.vertices.reserve(num_vertices);

    for _ in 0..num_vertices {
        next_content_line(&mut input, &mut line, path)?;
        let values: Vec<f32> = line
            .split_whitespace()
            .map(|t| t.parse())
            .collect::<std::result::Result<_, _>>()
            .map_err(|_| StrataError::file_format(path, "malformed vertex"))?;
        let expected = if has_normals { 6 } else { 3 };
        if values.len() < expected {
            return Err(StrataError::file_format(path, "malformed vertex"));
        }
        mesh.vertices.push(Vec3::new(values[0], values[1], values[2]));
        if has_normals {
            mesh.vertex_normals
                .push(Vec3::new(values[3], values[4], values[5]));
        }
    }

    for _ in 0..num_faces {
        next_content_line(&mut input, &mut line, path)?;
        let values: Vec<usize> = line
            .split_whitespace()
            .map(|t| t.parse())
            .collect::<std::result::Result<_, _>>()
            .map_err(|_| StrataError::file_format(path, "malformed face"))?;
        if values.is_empty() || values.len() != values[0] + 1 {
            return Err(StrataError::file_format(path, "malformed face"));
        }
        let ids = &values[1..];
        for &id in ids {
            if id >= num_vertices {
                return Err(StrataError::file_format(path, "face index out of range"));
            }
        }
        match values[0] {
            3 => {
                mesh.faces
                    .extend_from_slice(&[ids[0] as u32, ids[1] as u32, ids[2] as u32]);
            }
            4 => {
                // Split the quad into two triangles.
                mesh.faces
                    .extend_from_slice(&[ids[0] as u32, ids[1] as u32, ids[2] as u32]);
                mesh.faces
                    .extend_from_slice(&[ids[0] as u32, ids[2] as u32, ids[3] as u32]);
            }
            _ => {
                return Err(StrataError::file_format(
                    path,
                    "only triangles and quads are supported",
                ));
            }
        }
    }

    Ok(mesh)
}

/// Writes a mesh in OFF format, or NOFF if vertex normals are present.
pub fn save_off_mesh(mesh: &TriangleMesh, path: &Path) -> Result<()> {
    let has_normals = mesh.has_vertex_normals();
    let mut out = BufWriter::new(File::create(path)?);

    writeln!(out, "{}", if has_normals { "NOFF" } else { "OFF" })?;
    writeln!(out, "{} {} 0", mesh.num_vertices(), mesh.num_faces())?;

    for i in 0..mesh.num_vertices() {
        let v = mesh.vertices[i];
        if has_normals {
            let n = mesh.vertex_normals[i];
            writeln!(out, "{} {} {} {} {} {}", v.x, v.y, v.z, n.x, n.y, n.z)?;
        } else {
            writeln!(out, "{} {} {}", v.x, v.y, v.z)?;
        }
    }

    for face in mesh.faces.chunks(3) {
        writeln!(out, "3 {} {} {}", face[0], face[1], face[2])?;
    }

    Ok(())
}
