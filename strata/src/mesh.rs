use glam::{Vec2, Vec3, Vec4};
use log::warn;

use crate::error::{Result, StrataError};

/// Triangle mesh with optional per-vertex attributes stored in parallel
/// vectors. Faces are flat index triplets into the vertex list.
#[derive(Debug, Default, Clone)]
pub struct TriangleMesh {
    pub vertices: Vec<Vec3>,
    pub faces: Vec<u32>,
    pub vertex_normals: Vec<Vec3>,
    pub face_normals: Vec<Vec3>,
    pub vertex_colors: Vec<Vec4>,
    pub vertex_confidences: Vec<f32>,
    pub vertex_values: Vec<f32>,
    pub vertex_texcoords: Vec<Vec2>,
}

fn vector_clean<T: Copy>(delete_list: &[bool], vector: &mut Vec<T>) {
    let mut write = 0;
    for read in 0..vector.len() {
        if !delete_list[read] {
            vector[write] = vector[read];
            write += 1;
        }
    }
    vector.truncate(write);
}

fn is_valid_triangle(ids: &[u32]) -> bool {
    ids[0] != ids[1] || ids[0] != ids[2]
}

impl TriangleMesh {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn num_vertices(&self) -> usize {
        self.vertices.len()
    }

    pub fn num_faces(&self) -> usize {
        self.faces.len() / 3
    }

    pub fn has_vertex_normals(&self) -> bool {
        self.vertex_normals.len() == self.vertices.len()
    }

    pub fn has_vertex_colors(&self) -> bool {
        self.vertex_colors.len() == self.vertices.len()
    }

    pub fn has_vertex_confidences(&self) -> bool {
        self.vertex_confidences.len() == self.vertices.len()
    }

    pub fn has_vertex_values(&self) -> bool {
        self.vertex_values.len() == self.vertices.len()
    }

    pub fn has_vertex_texcoords(&self) -> bool {
        self.vertex_texcoords.len() == self.vertices.len()
    }

    pub fn clear(&mut self) {
        self.vertices.clear();
        self.faces.clear();
        self.vertex_normals.clear();
        self.face_normals.clear();
        self.vertex_colors.clear();
        self.vertex_confidences.clear();
        self.vertex_values.clear();
        self.vertex_texcoords.clear();
    }

    /// Computes the axis-aligned bounding box of the vertices.
    pub fn find_aabb(&self) -> (Vec3, Vec3) {
        let mut min = Vec3::splat(f32::MAX);
        let mut max = Vec3::splat(-f32::MAX);
        for v in &self.vertices {
            min = min.min(*v);
            max = max.max(*v);
        }
        (min, max)
    }

    /// Recalculates face and/or vertex normals. Vertex normals are
    /// angle-weighted pseudo-normals accumulated from adjacent faces.
    pub fn recalc_normals(&mut self, face: bool, vertex: bool) {
        if !face && !vertex {
            return;
        }

        if face {
            self.face_normals.clear();
            self.face_normals.reserve(self.faces.len() / 3);
        }
        if vertex {
            self.vertex_normals.clear();
            self.vertex_normals.resize(self.vertices.len(), Vec3::ZERO);
        }

        let mut zero_length_face_normals = 0usize;
        let mut zero_length_vertex_normals = 0usize;

        for i in (0..self.faces.len()).step_by(3) {
            let ia = self.faces[i] as usize;
            let ib = self.faces[i + 1] as usize;
            let ic = self.faces[i + 2] as usize;

            let a = self.vertices[ia];
            let b = self.vertices[ib];
            let c = self.vertices[ic];

            let ab = b - a;
            let bc = c - b;
            let ca = a - c;

            let mut fn_vec = ab.cross(-ca);
            let fnl = fn_vec.length();
            if fnl == 0.0 {
                zero_length_face_normals += 1;
            } else {
                fn_vec /= fnl;
            }

            if face {
                self.face_normals.push(fn_vec);
            }

            if fnl != 0.0 && vertex {
                let abl = ab.length();
                let bcl = bc.length();
                let cal = ca.length();

                // (a / alen).dot(b / blen) is numerically more stable than
                // a.dot(b) / (alen * blen).
                let ratio1 = (ab / abl).dot(-ca / cal);
                let ratio2 = (-ab / abl).dot(bc / bcl);
                let ratio3 = (ca / cal).dot(-bc / bcl);
                let angle1 = ratio1.clamp(-1.0, 1.0).acos();
                let angle2 = ratio2.clamp(-1.0, 1.0).acos();
                let angle3 = ratio3.clamp(-1.0, 1.0).acos();

                self.vertex_normals[ia] += fn_vec * angle1;
                self.vertex_normals[ib] += fn_vec * angle2;
                self.vertex_normals[ic] += fn_vec * angle3;
            }
        }

        if vertex {
            for normal in &mut self.vertex_normals {
                let vnl = normal.length();
                if vnl > 0.0 {
                    *normal /= vnl;
                } else {
                    zero_length_vertex_normals += 1;
                }
            }
        }

        if zero_length_face_normals > 0 || zero_length_vertex_normals > 0 {
            warn!(
                "zero-length normals detected: {} face normals, {} vertex normals",
                zero_length_face_normals, zero_length_vertex_normals
            );
        }
    }

    pub fn ensure_normals(&mut self, face: bool, vertex: bool) {
        let need_face = face && self.face_normals.len() != self.faces.len() / 3;
        let need_vertex = vertex && self.vertex_normals.len() != self.vertices.len();
        self.recalc_normals(need_face, need_vertex);
    }

    /// Deletes all vertices flagged in the delete list, compacting
    /// attribute vectors accordingly. Faces are not touched.
    pub fn delete_vertices(&mut self, delete_list: &[bool]) -> Result<()> {
        if delete_list.len() != self.vertices.len() {
            return Err(StrataError::invalid_argument(
                "delete list does not match vertex list",
            ));
        }

        if self.has_vertex_normals() {
            vector_clean(delete_list, &mut self.vertex_normals);
        }
        if self.has_vertex_colors() {
            vector_clean(delete_list, &mut self.vertex_colors);
        }
        if self.has_vertex_confidences() {
            vector_clean(delete_list, &mut self.vertex_confidences);
        }
        if self.has_vertex_values() {
            vector_clean(delete_list, &mut self.vertex_values);
        }
        if self.has_vertex_texcoords() {
            vector_clean(delete_list, &mut self.vertex_texcoords);
        }
        vector_clean(delete_list, &mut self.vertices);
        Ok(())
    }

    /// Deletes flagged vertices, rewrites the surviving face indices, and
    /// removes faces that referenced deleted vertices.
    pub fn delete_vertices_fix_faces(&mut self, delete_list: &[bool]) -> Result<()> {
        if delete_list.len() != self.vertices.len() {
            return Err(StrataError::invalid_argument(
                "delete list does not match vertex list",
            ));
        }

        // Each surviving vertex shifts left by the number of deleted
        // vertices before it.
        let mut index_shift = vec![0u32; self.vertices.len()];
        let mut num_deleted = 0u32;
        for i in 0..self.vertices.len() {
            index_shift[i] = num_deleted;
            if delete_list[i] {
                num_deleted += 1;
            }
        }

        for i in (0..self.faces.len()).step_by(3) {
            let (a, b, c) = (
                self.faces[i] as usize,
                self.faces[i + 1] as usize,
                self.faces[i + 2] as usize,
            );
            if delete_list[a] || delete_list[b] || delete_list[c] {
                self.faces[i] = 0;
                self.faces[i + 1] = 0;
                self.faces[i + 2] = 0;
            } else {
                self.faces[i] -= index_shift[a];
                self.faces[i + 1] -= index_shift[b];
                self.faces[i + 2] -= index_shift[c];
            }
        }

        self.delete_vertices(delete_list)?;
        self.delete_invalid_faces();
        Ok(())
    }

    /// Removes invalidated faces (triplets collapsed to equal indices) by
    /// swapping them with valid faces from the end of the list.
    pub fn delete_invalid_faces(&mut self) {
        let mut invalid_iter = 0;
        let mut valid_iter = self.faces.len();
        while valid_iter > invalid_iter {
            // Search the next invalid face.
            while invalid_iter < self.faces.len()
                && is_valid_triangle(&self.faces[invalid_iter..invalid_iter + 3])
            {
                invalid_iter += 3;
            }
            // Search the last valid face.
            valid_iter -= 3;
            while valid_iter > invalid_iter
                && !is_valid_triangle(&self.faces[valid_iter..valid_iter + 3])
            {
                valid_iter -= 3;
            }
            if invalid_iter >= valid_iter {
                break;
            }
            for k in 0..3 {
                self.faces.swap(valid_iter + k, invalid_iter + k);
            }
        }
        self.faces.truncate(invalid_iter);
    }
}

/// Removes connected components with fewer vertices than `min_size`.
/// Returns the number of deleted vertices.
pub fn remove_small_components(mesh: &mut TriangleMesh, min_size: usize) -> usize {
    if min_size == 0 || mesh.vertices.is_empty() {
        return 0;
    }

    // Union-find over vertices connected by faces.
    let mut parent: Vec<u32> = (0..mesh.vertices.len() as u32).collect();

    fn find(parent: &mut [u32], mut v: u32) -> u32 {
        while parent[v as usize] != v {
            parent[v as usize] = parent[parent[v as usize] as usize];
            v = parent[v as usize];
        }
        v
    }

    for face in mesh.faces.chunks(3) {
        let a = find(&mut parent, face[0]);
        let b = find(&mut parent, face[1]);
        let c = find(&mut parent, face[2]);
        parent[b as usize] = a;
        parent[c as usize] = a;
    }

    let mut component_size = vec![0usize; mesh.vertices.len()];
    for v in 0..mesh.vertices.len() as u32 {
        component_size[find(&mut parent, v) as usize] += 1;
    }

    let delete_list: Vec<bool> = (0..mesh.vertices.len() as u32)
        .map(|v| component_size[find(&mut parent, v) as usize] < min_size)
        .collect();
    let num_deleted = delete_list.iter().filter(|&&d| d).count();
    if num_deleted > 0 {
        mesh.delete_vertices_fix_faces(&delete_list)
            .expect("delete list matches vertex list");
    }
    num_deleted
}
