use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use glam::{Vec3, Vec4};
use log::warn;

use crate::error::{Result, StrataError};
use crate::fssr::Sample;
use crate::mesh::TriangleMesh;

/// Options for writing a mesh as PLY.
#[derive(Debug, Clone)]
pub struct SavePlyOptions {
    pub write_vertex_normals: bool,
    pub write_vertex_colors: bool,
    pub write_vertex_confidences: bool,
    pub write_vertex_values: bool,
    pub binary: bool,
}

impl Default for SavePlyOptions {
    fn default() -> Self {
        Self {
            write_vertex_normals: false,
            write_vertex_colors: false,
            write_vertex_confidences: false,
            write_vertex_values: false,
            binary: true,
        }
    }
}

/// Options applied while loading a sample point set.
#[derive(Debug, Clone)]
pub struct PointsetOptions {
    /// Multiplies every sample scale.
    pub scale_factor: f32,
    /// Number of samples skipped after each accepted sample.
    pub skip_samples: usize,
}

impl Default for PointsetOptions {
    fn default() -> Self {
        Self {
            scale_factor: 1.0,
            skip_samples: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum PropertyType {
    Float32,
    Float64,
    Uint8,
    Int32,
    Uint32,
}

impl PropertyType {
    fn parse(token: &str) -> Option<Self> {
        match token {
            "float" | "float32" => Some(Self::Float32),
            "double" | "float64" => Some(Self::Float64),
            "uchar" | "uint8" => Some(Self::Uint8),
            "int" | "int32" => Some(Self::Int32),
            "uint" | "uint32" => Some(Self::Uint32),
            _ => None,
        }
    }
}

#[derive(Debug)]
struct Property {
    name: String,
    ty: PropertyType,
}

#[derive(Debug, PartialEq)]
enum PlyFormat {
    Ascii,
    BinaryLittleEndian,
}

struct PlyHeader {
    format: PlyFormat,
    num_vertices: usize,
    vertex_properties: Vec<Property>,
}

fn read_header<R: BufRead>(input: &mut R, path: &Path) -> Result<PlyHeader> {
    let mut line = String::new();
    input.read_line(&mut line)?;
    if line.trim_end() != "ply" {
        return Err(StrataError::file_format(path, "missing ply magic"));
    }

    let mut format = None;
    let mut num_vertices = 0usize;
    let mut vertex_properties = Vec::new();
    let mut in_vertex_element = false;

    loop {
        line.clear();
        if input.read_line(&mut line)? == 0 {
            return Err(StrataError::file_format(path, "unexpected end of header"));
        }
        let tokens: Vec<&str> = line.split_whitespace().collect();
        match tokens.as_slice() {
            ["end_header"] => break,
            ["comment", ..] | ["obj_info", ..] => {}
            ["format", "ascii", _] => format = Some(PlyFormat::Ascii),
            ["format", "binary_little_endian", _] => {
                format = Some(PlyFormat::BinaryLittleEndian)
            }
            ["format", other, _] => {
                return Err(StrataError::file_format(
                    path,
                    format!("unsupported format {other}"),
                ));
            }
            ["element", "vertex", count] => {
                num_vertices = count
                    .parse()
                    .map_err(|_| StrataError::file_format(path, "invalid vertex count"))?;
                in_vertex_element = true;
            }
            ["element", ..] => in_vertex_element = false,
            ["property", "list", ..] => {}
            ["property", ty, name] if in_vertex_element => {
                let ty = PropertyType::parse(ty).ok_or_else(|| {
                    StrataError::file_format(path, format!("unsupported property type {ty}"))
                })?;
                vertex_properties.push(Property {
                    name: (*name).to_string(),
                    ty,
                });
            }
            ["property", ..] => {}
            _ => {
                return Err(StrataError::file_format(
                    path,
                    format!("unrecognized header line: {}", line.trim_end()),
                ));
            }
        }
    }

    let format =
        format.ok_or_else(|| StrataError::file_format(path, "missing format statement"))?;
    Ok(PlyHeader {
        format,
        num_vertices,
        vertex_properties,
    })
}

fn read_binary_value<R: Read>(input: &mut R, ty: PropertyType) -> Result<f32> {
    let value = match ty {
        PropertyType::Float32 => input.read_f32::<LittleEndian>()?,
        PropertyType::Float64 => input.read_f64::<LittleEndian>()? as f32,
        PropertyType::Uint8 => f32::from(input.read_u8()?) / 255.0,
        PropertyType::Int32 => input.read_i32::<LittleEndian>()? as f32,
        PropertyType::Uint32 => input.read_u32::<LittleEndian>()? as f32,
    };
    Ok(value)
}

/// Loads a PLY point set into samples. The vertex element must carry
/// positions and normals; the "value" property holds the sample scale.
/// Confidence and colors are optional. Samples without positive scale are
/// skipped.
pub fn load_ply_pointset(path: &Path, options: &PointsetOptions) -> Result<Vec<Sample>> {
    let file = File::open(path)?;
    let mut input = BufReader::new(file);
    let header = read_header(&mut input, path)?;

    let names: Vec<&str> = header
        .vertex_properties
        .iter()
        .map(|p| p.name.as_str())
        .collect();
    for required in ["x", "y", "z", "nx", "ny", "nz", "value"] {
        if !names.contains(&required) {
            return Err(StrataError::file_format(
                path,
                format!("point set lacks vertex property {required}"),
            ));
        }
    }
    let has_confidence = names.contains(&"confidence");
    let has_color = names.contains(&"red");

    let mut samples = Vec::with_capacity(header.num_vertices);
    let mut values = vec![0.0f32; header.vertex_properties.len()];
    let mut ascii_line = String::new();
    let mut num_rejected = 0usize;
    let mut skip_countdown = 0usize;

    for _ in 0..header.num_vertices {
        match header.format {
            PlyFormat::Ascii => {
                ascii_line.clear();
                if input.read_line(&mut ascii_line)? == 0 {
                    return Err(StrataError::file_format(path, "truncated vertex data"));
                }
                let mut tokens = ascii_line.split_whitespace();
                for (i, property) in header.vertex_properties.iter().enumerate() {
                    let token = tokens.next().ok_or_else(|| {
                        StrataError::file_format(path, "missing vertex property value")
                    })?;
                    let parsed: f32 = token.parse().map_err(|_| {
                        StrataError::file_format(path, "malformed vertex property value")
                    })?;
                    values[i] = if property.ty == PropertyType::Uint8 {
                        parsed / 255.0
                    } else {
                        parsed
                    };
                }
            }
            PlyFormat::BinaryLittleEndian => {
                for (i, property) in header.vertex_properties.iter().enumerate() {
                    values[i] = read_binary_value(&mut input, property.ty)?;
                }
            }
        }

        if skip_countdown > 0 {
            skip_countdown -= 1;
            continue;
        }
        skip_countdown = options.skip_samples;

        let get = |name: &str| -> f32 {
            names
                .iter()
                .position(|n| *n == name)
                .map(|i| values[i])
                .unwrap_or(0.0)
        };

        let scale = get("value") * options.scale_factor;
        if scale <= 0.0 {
            num_rejected += 1;
            continue;
        }

        let normal = Vec3::new(get("nx"), get("ny"), get("nz"));
        if normal.length_squared() == 0.0 {
            num_rejected += 1;
            continue;
        }

        samples.push(Sample {
            pos: Vec3::new(get("x"), get("y"), get("z")),
            normal: normal.normalize(),
            scale,
            confidence: if has_confidence { get("confidence") } else { 1.0 },
            color: has_color.then(|| Vec3::new(get("red"), get("green"), get("blue"))),
        });
    }

    if num_rejected > 0 {
        warn!("rejected {} invalid samples", num_rejected);
    }
    Ok(samples)
}

/// Writes a triangle mesh as PLY, ASCII or binary little-endian.
pub fn save_ply_mesh(mesh: &TriangleMesh, path: &Path, options: &SavePlyOptions) -> Result<()> {
    let write_normals = options.write_vertex_normals && mesh.has_vertex_normals();
    let write_colors = options.write_vertex_colors && mesh.has_vertex_colors();
    let write_confidences = options.write_vertex_confidences && mesh.has_vertex_confidences();
    let write_values = options.write_vertex_values && mesh.has_vertex_values();

    let mut out = BufWriter::new(File::create(path)?);

    writeln!(out, "ply")?;
    if options.binary {
        writeln!(out, "format binary_little_endian 1.0")?;
    } else {
        writeln!(out, "format ascii 1.0")?;
    }
    writeln!(out, "element vertex {}", mesh.num_vertices())?;
    writeln!(out, "property float x")?;
    writeln!(out, "property float y")?;
    writeln!(out, "property float z")?;
    if write_normals {
        writeln!(out, "property float nx")?;
        writeln!(out, "property float ny")?;
        writeln!(out, "property float nz")?;
    }
    if write_values {
        writeln!(out, "property float value")?;
    }
    if write_confidences {
        writeln!(out, "property float confidence")?;
    }
    if write_colors {
        writeln!(out, "property uchar red")?;
        writeln!(out, "property uchar green")?;
        writeln!(out, "property uchar blue")?;
    }
    writeln!(out, "element face {}", mesh.num_faces())?;
    writeln!(out, "property list uchar int vertex_indices")?;
    writeln!(out, "end_header")?;

    let color_byte = |c: f32| -> u8 { (c.clamp(0.0, 1.0) * 255.0 + 0.5) as u8 };

    for i in 0..mesh.num_vertices() {
        let v = mesh.vertices[i];
        if options.binary {
            for k in 0..3 {
                out.write_f32::<LittleEndian>(v[k])?;
            }
            if write_normals {
                let n = mesh.vertex_normals[i];
                for k in 0..3 {
                    out.write_f32::<LittleEndian>(n[k])?;
                }
            }
            if write_values {
                out.write_f32::<LittleEndian>(mesh.vertex_values[i])?;
            }
            if write_confidences {
                out.write_f32::<LittleEndian>(mesh.vertex_confidences[i])?;
            }
            if write_colors {
                let c: Vec4 = mesh.vertex_colors[i];
                out.write_u8(color_byte(c.x))?;
                out.write_u8(color_byte(c.y))?;
                out.write_u8(color_byte(c.z))?;
            }
        } else {
            write!(out, "{} {} {}", v.x, v.y, v.z)?;
            if write_normals {
                let n = mesh.vertex_normals[i];
                write!(out, " {} {} {}", n.x, n.y, n.z)?;
            }
            if write_values {
                write!(out, " {}", mesh.vertex_values[i])?;
            }
            if write_confidences {
                write!(out, " {}", mesh.vertex_confidences[i])?;
            }
            if write_colors {
                let c = mesh.vertex_colors[i];
                write!(
                    out,
                    " {} {} {}",
                    color_byte(c.x),
                    color_byte(c.y),
                    color_byte(c.z)
                )?;
            }
            writeln!(out)?;
        }
    }

    for face in mesh.faces.chunks(3) {
        if options.binary {
            out.write_u8(3)?;
            for &id in face {
                out.write_i32::<LittleEndian>(id as i32)?;
            }
        } else {
            writeln!(out, "3 {} {} {}", face[0], face[1], face[2])?;
        }
    }

    Ok(())
}
