use glam::{Vec3, Vec4};
use rustc_hash::FxHashMap;

use crate::iso::tables::{
    MC_EDGE_ORDER, MC_EDGE_TABLE, MC_TRI_TABLE, MT_EDGE_ORDER, MT_EDGE_TABLE, MT_TRI_TABLE,
};
use crate::mesh::TriangleMesh;

/// Accessor interface that decouples the marching-cubes engine from the
/// underlying SDF representation.
///
/// The first call to [`CubeAccessor::next_cube`] initializes the accessor;
/// it returns false when there is no further cube. After a successful call
/// the eight corner values are available in the order documented in
/// [`crate::iso::tables`].
pub trait CubeAccessor {
    fn next_cube(&mut self) -> bool;
    fn sdf(&self) -> &[f32; 8];
    fn vertex_ids(&self) -> &[u64; 8];
    fn positions(&self) -> &[Vec3; 8];
    fn has_colors(&self) -> bool;
    fn colors(&self) -> &[Vec3; 8];
}

/// Accessor interface for the marching-tetrahedra engine. The accessor is
/// expected to iterate over valid tets only.
pub trait TetAccessor {
    fn next_tet(&mut self) -> bool;
    fn sdf(&self) -> &[f32; 4];
    fn vertex_ids(&self) -> &[u64; 4];
    fn positions(&self) -> &[Vec3; 4];
    fn has_colors(&self) -> bool;
    fn colors(&self) -> &[Vec3; 4];
}

fn edge_key(a: u64, b: u64) -> (u64, u64) {
    if a <= b { (a, b) } else { (b, a) }
}

/// Polygonizes an SDF partitioned into cubes.
///
/// Vertices on shared edges are deduplicated through a hash map keyed by
/// the unordered pair of global corner ids, so neighboring cubes reference
/// identical mesh vertices.
pub fn marching_cubes<A: CubeAccessor>(accessor: &mut A) -> TriangleMesh {
    let mut mesh = TriangleMesh::new();
    let mut vert_ids: FxHashMap<(u64, u64), u32> = FxHashMap::default();

    while accessor.next_cube() {
        let sdf = *accessor.sdf();

        // Unique cube index from the SDF signs at the cube corners.
        let mut cubeconfig = 0usize;
        for i in 0..8 {
            if sdf[i] < 0.0 {
                cubeconfig |= 1 << i;
            }
        }

        if cubeconfig == 0x00 || cubeconfig == 0xff {
            continue;
        }

        let edgeconfig = MC_EDGE_TABLE[cubeconfig];

        // Provide a mesh vertex id for every active edge.
        let mut vid = [0u32; 12];
        for i in 0..12 {
            if edgeconfig & (1 << i) == 0 {
                continue;
            }

            let ev = MC_EDGE_ORDER[i];
            let key = edge_key(accessor.vertex_ids()[ev[0]], accessor.vertex_ids()[ev[1]]);
            if let Some(existing) = vert_ids.get(&key) {
                vid[i] = *existing;
                continue;
            }

            // New vertex on the edge.
            let d = [sdf[ev[0]], sdf[ev[1]]];
            let w = [d[1] / (d[1] - d[0]), -d[0] / (d[1] - d[0])];
            let pos = accessor.positions()[ev[0]] * w[0] + accessor.positions()[ev[1]] * w[1];

            if accessor.has_colors() {
                let color =
                    accessor.colors()[ev[0]] * w[0] + accessor.colors()[ev[1]] * w[1];
                mesh.vertex_colors.push(Vec4::new(color.x, color.y, color.z, 1.0));
            }

            vid[i] = mesh.vertices.len() as u32;
            vert_ids.insert(key, vid[i]);
            mesh.vertices.push(pos);
        }

        // Triangles by connecting the vertex ids.
        let tri_row = &MC_TRI_TABLE[cubeconfig];
        let mut j = 0;
        while tri_row[j] != -1 {
            for k in 0..3 {
                mesh.faces.push(vid[tri_row[j + k] as usize]);
            }
            j += 3;
        }
    }

    mesh
}

/// Polygonizes an SDF partitioned into tetrahedra. Corner values of
/// exactly zero snap the iso-vertex onto the corner, deduplicated by the
/// corner id to prevent null faces.
pub fn marching_tetrahedra<A: TetAccessor>(accessor: &mut A) -> TriangleMesh {
    let mut mesh = TriangleMesh::new();
    let mut edge_map: FxHashMap<(u64, u64), u32> = FxHashMap::default();
    let mut vert_map: FxHashMap<u64, u32> = FxHashMap::default();

    while accessor.next_tet() {
        let sdf = *accessor.sdf();

        let mut tetconfig = 0usize;
        for i in 0..4 {
            if sdf[i] < 0.0 {
                tetconfig |= 1 << i;
            }
        }

        if tetconfig == 0x0 || tetconfig == 0xf {
            continue;
        }

        let edgeconfig = MT_EDGE_TABLE[tetconfig];

        let mut vid = [0u32; 6];
        for i in 0..6 {
            if edgeconfig & (1 << i) == 0 {
                continue;
            }

            let ev = MT_EDGE_ORDER[i];
            let key = edge_key(accessor.vertex_ids()[ev[0]], accessor.vertex_ids()[ev[1]]);
            if let Some(existing) = edge_map.get(&key) {
                vid[i] = *existing;
                continue;
            }

            let d = [sdf[ev[0]], sdf[ev[1]]];

            // Vertex snapping to prevent null faces.
            let snap = if d[0] == 0.0 {
                Some(ev[0])
            } else if d[1] == 0.0 {
                Some(ev[1])
            } else {
                None
            };

            if let Some(snap) = snap {
                let corner_id = accessor.vertex_ids()[snap];
                if let Some(existing) = vert_map.get(&corner_id) {
                    vid[i] = *existing;
                    continue;
                }

                if accessor.has_colors() {
                    let color = accessor.colors()[snap];
                    mesh.vertex_colors
                        .push(Vec4::new(color.x, color.y, color.z, 1.0));
                }
                vid[i] = mesh.vertices.len() as u32;
                mesh.vertices.push(accessor.positions()[snap]);
                vert_map.insert(corner_id, vid[i]);
                continue;
            }

            let w = [d[1] / (d[1] - d[0]), -d[0] / (d[1] - d[0])];
            let pos = accessor.positions()[ev[0]] * w[0] + accessor.positions()[ev[1]] * w[1];

            if accessor.has_colors() {
                let color =
                    accessor.colors()[ev[0]] * w[0] + accessor.colors()[ev[1]] * w[1];
                mesh.vertex_colors
                    .push(Vec4::new(color.x, color.y, color.z, 1.0));
            }

            vid[i] = mesh.vertices.len() as u32;
            mesh.vertices.push(pos);
            edge_map.insert(key, vid[i]);
        }

        // Triangles by connecting the vertex ids, dropping degenerates
        // introduced by snapping.
        let tri_row = &MT_TRI_TABLE[tetconfig];
        let mut i = 0;
        while tri_row[i] != -1 {
            let vids = [
                vid[tri_row[i] as usize],
                vid[tri_row[i + 1] as usize],
                vid[tri_row[i + 2] as usize],
            ];
            if vids[0] != vids[1] && vids[1] != vids[2] && vids[2] != vids[0] {
                mesh.faces.extend_from_slice(&vids);
            }
            i += 3;
        }
    }

    mesh
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustc_hash::FxHashMap as Map;

    /// Accessor over a dense regular grid with a callable SDF.
    struct GridAccessor<F: Fn(Vec3) -> f32> {
        sdf_fn: F,
        dim: usize,
        cursor: Option<usize>,
        sdf: [f32; 8],
        vid: [u64; 8],
        pos: [Vec3; 8],
        color: [Vec3; 8],
    }

    impl<F: Fn(Vec3) -> f32> GridAccessor<F> {
        fn new(sdf_fn: F, dim: usize) -> Self {
            Self {
                sdf_fn,
                dim,
                cursor: None,
                sdf: [0.0; 8],
                vid: [0; 8],
                pos: [Vec3::ZERO; 8],
                color: [Vec3::ZERO; 8],
            }
        }
    }

    // Offsets in the cube vertex order of the lookup tables.
    const OFFSETS: [[usize; 3]; 8] = [
        [0, 0, 0],
        [1, 0, 0],
        [1, 0, 1],
        [0, 0, 1],
        [0, 1, 0],
        [1, 1, 0],
        [1, 1, 1],
        [0, 1, 1],
    ];

    impl<F: Fn(Vec3) -> f32> CubeAccessor for GridAccessor<F> {
        fn next_cube(&mut self) -> bool {
            let cells = self.dim - 1;
            let next = match self.cursor {
                None => 0,
                Some(c) => c + 1,
            };
            if next >= cells * cells * cells {
                return false;
            }
            self.cursor = Some(next);

            let x = next % cells;
            let y = (next / cells) % cells;
            let z = next / (cells * cells);
            for i in 0..8 {
                let cx = x + OFFSETS[i][0];
                let cy = y + OFFSETS[i][1];
                let cz = z + OFFSETS[i][2];
                let pos = Vec3::new(cx as f32, cy as f32, cz as f32);
                self.pos[i] = pos;
                self.sdf[i] = (self.sdf_fn)(pos);
                self.vid[i] = (cx + cy * self.dim + cz * self.dim * self.dim) as u64;
            }
            true
        }

        fn sdf(&self) -> &[f32; 8] {
            &self.sdf
        }

        fn vertex_ids(&self) -> &[u64; 8] {
            &self.vid
        }

        fn positions(&self) -> &[Vec3; 8] {
            &self.pos
        }

        fn has_colors(&self) -> bool {
            false
        }

        fn colors(&self) -> &[Vec3; 8] {
            &self.color
        }
    }

    fn euler_characteristic(mesh: &TriangleMesh) -> i64 {
        let v = mesh.num_vertices() as i64;
        let f = mesh.num_faces() as i64;
        let mut edges: Map<(u32, u32), u32> = Map::default();
        for face in mesh.faces.chunks(3) {
            for k in 0..3 {
                let a = face[k];
                let b = face[(k + 1) % 3];
                let key = if a < b { (a, b) } else { (b, a) };
                *edges.entry(key).or_insert(0) += 1;
            }
        }
        // A closed manifold has every edge shared by exactly two faces.
        for count in edges.values() {
            assert_eq!(*count, 2, "mesh has boundary or non-manifold edges");
        }
        v - edges.len() as i64 + f
    }

    #[test]
    fn test_cube_sdf_closed_surface() {
        // SDF of a small axis-aligned box enclosing two grid corners in a
        // 4^3 grid. The zero crossing lies strictly between grid corners.
        let center = Vec3::new(1.5, 1.0, 1.0);
        let mut accessor = GridAccessor::new(
            move |p| {
                let d = (p - center).abs();
                d.x.max(d.y).max(d.z) - 0.6
            },
            4,
        );
        let mesh = marching_cubes(&mut accessor);

        assert!(!mesh.vertices.is_empty());
        let euler = euler_characteristic(&mesh);
        assert_eq!(euler, 2, "closed genus-0 surface expected");
        assert!(mesh.num_faces() >= 12 && mesh.num_faces() <= 24);
    }

    #[test]
    fn test_sphere_sdf_closed_surface() {
        let center = Vec3::splat(4.0);
        let mut accessor = GridAccessor::new(move |p| (p - center).length() - 2.5, 9);
        let mesh = marching_cubes(&mut accessor);

        assert!(!mesh.vertices.is_empty());
        assert!(mesh.num_faces() > 20);

        // All vertices lie close to the sphere.
        for v in &mesh.vertices {
            let r = (*v - center).length();
            assert!(r > 1.5 && r < 3.5);
        }
    }

    #[test]
    fn test_empty_volume_yields_empty_mesh() {
        let mut accessor = GridAccessor::new(|_| 1.0, 4);
        let mesh = marching_cubes(&mut accessor);
        assert!(mesh.vertices.is_empty());
        assert!(mesh.faces.is_empty());
    }

    #[test]
    fn test_vertex_dedup_across_cubes() {
        // Plane SDF: every interior edge crossing is shared between
        // neighboring cubes and must be emitted exactly once.
        let mut accessor = GridAccessor::new(|p| p.x - 1.5, 4);
        let mesh = marching_cubes(&mut accessor);

        let mut unique = std::collections::BTreeSet::new();
        for v in &mesh.vertices {
            unique.insert((
                (v.x * 1024.0) as i64,
                (v.y * 1024.0) as i64,
                (v.z * 1024.0) as i64,
            ));
        }
        assert_eq!(unique.len(), mesh.vertices.len());
    }
}
