use std::collections::btree_map::Range;

use glam::Vec3;
use log::warn;

use crate::dmfusion::octree::DmfOctree;
use crate::iso::{CubeAccessor, TetAccessor};
use crate::voxel::{DmfVoxel, VoxelIndex};

/// Cube vertex ordering expected by the marching-cubes tables, expressed
/// as offsets into the regular voxel neighborhood.
const MC_ORDER: [usize; 8] = [0, 1, 5, 4, 2, 3, 7, 6];

/// Marching-cubes accessor for surface extraction at a single octree
/// level. Iterates the voxels of `at_level` in index order and yields
/// every cube whose eight corners exist, carry weight above `min_weight`
/// and contain a sign change.
pub struct DmfMcAccessor<'a> {
    octree: &'a DmfOctree,
    iter: Option<Range<'a, VoxelIndex, DmfVoxel>>,

    pub min_weight: f32,
    pub at_level: u8,
    pub use_color: bool,

    sdf: [f32; 8],
    vid: [u64; 8],
    pos: [Vec3; 8],
    color: [Vec3; 8],
}

impl<'a> DmfMcAccessor<'a> {
    pub fn new(octree: &'a DmfOctree, at_level: u8) -> Self {
        Self {
            octree,
            iter: None,
            min_weight: 0.0,
            at_level,
            use_color: true,
            sdf: [0.0; 8],
            vid: [0; 8],
            pos: [Vec3::ZERO; 8],
            color: [Vec3::ZERO; 8],
        }
    }

    fn load_cube(&mut self, vi: &VoxelIndex) -> Option<i32> {
        let mut cubeconfig = 0;
        for i in 0..8 {
            let mci = MC_ORDER[i];
            let corner = vi.navigate(
                (mci & 1) as i64,
                ((mci & 2) >> 1) as i64,
                ((mci & 4) >> 2) as i64,
            );
            let voxel = *self.octree.find_voxel(&corner)?;
            if voxel.weight <= self.min_weight {
                return None;
            }
            if voxel.dist < 0.0 {
                cubeconfig |= 1 << i;
            }

            self.sdf[i] = voxel.dist;
            self.pos[i] = self.octree.voxel_pos(&corner);
            self.vid[i] = corner.index;
            if self.use_color {
                self.color[i] = voxel.color.truncate();
            }
        }
        Some(cubeconfig)
    }
}

impl CubeAccessor for DmfMcAccessor<'_> {
    fn next_cube(&mut self) -> bool {
        if self.iter.is_none() {
            let octree = self.octree;
            let start = VoxelIndex::new(self.at_level, 0);
            let end = VoxelIndex::new(self.at_level, u64::MAX);
            self.iter = Some(octree.voxels().range(start..=end));
        }

        loop {
            let Some((vi, _)) = self.iter.as_mut().unwrap().next() else {
                return false;
            };

            if vi.level != self.at_level {
                warn!("unexpected voxel: {}, {}", vi.level, vi.index);
                continue;
            }

            // Skip boundary voxels that cannot be cube base corners.
            let dim = 1u64 << vi.level;
            let xyz = vi.factor_index();
            if xyz[0] == dim || xyz[1] == dim || xyz[2] == dim {
                continue;
            }

            let vi = *vi;
            if let Some(cubeconfig) = self.load_cube(&vi) {
                if cubeconfig != 0x00 && cubeconfig != 0xff {
                    return true;
                }
            }
        }
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
        self.use_color
    }

    fn colors(&self) -> &[Vec3; 8] {
        &self.color
    }
}

/// Marching-tetrahedra accessor over a tetrahedral decomposition
/// registered with [`DmfMtAccessor::add_vertex`] and
/// [`DmfMtAccessor::add_tet`].
pub struct DmfMtAccessor<'a> {
    octree: &'a DmfOctree,
    verts: Vec<VoxelIndex>,
    tets: Vec<u32>,
    cursor: Option<usize>,

    pub min_weight: f32,
    pub use_color: bool,

    sdf: [f32; 4],
    vid: [u64; 4],
    pos: [Vec3; 4],
    color: [Vec3; 4],
}

impl<'a> DmfMtAccessor<'a> {
    pub fn new(octree: &'a DmfOctree) -> Self {
        Self {
            octree,
            verts: Vec::new(),
            tets: Vec::new(),
            cursor: None,
            min_weight: 0.0,
            use_color: false,
            sdf: [0.0; 4],
            vid: [0; 4],
            pos: [Vec3::ZERO; 4],
            color: [Vec3::ZERO; 4],
        }
    }

    pub fn add_vertex(&mut self, vertex: VoxelIndex) {
        self.verts.push(vertex);
    }

    pub fn add_tet(&mut self, ids: [u32; 4]) {
        self.tets.extend_from_slice(&ids);
    }
}

impl TetAccessor for DmfMtAccessor<'_> {
    fn next_tet(&mut self) -> bool {
        let mut cursor = match self.cursor {
            None => 0,
            Some(c) => c + 4,
        };

        'tets: while cursor + 4 <= self.tets.len() {
            for i in 0..4 {
                let id = self.tets[cursor + i];
                let voxel_index = self.verts[id as usize];
                let Some(&voxel) = self.octree.find_voxel(&voxel_index) else {
                    cursor += 4;
                    continue 'tets;
                };
                if voxel.weight <= self.min_weight {
                    cursor += 4;
                    continue 'tets;
                }

                self.sdf[i] = voxel.dist;
                self.pos[i] = self.octree.voxel_pos(&voxel_index);
                self.vid[i] = id as u64;
                if self.use_color {
                    self.color[i] = voxel.color.truncate();
                }
            }
            self.cursor = Some(cursor);
            return true;
        }

        self.cursor = None;
        false
    }

    fn sdf(&self) -> &[f32; 4] {
        &self.sdf
    }

    fn vertex_ids(&self) -> &[u64; 4] {
        &self.vid
    }

    fn positions(&self) -> &[Vec3; 4] {
        &self.pos
    }

    fn has_colors(&self) -> bool {
        self.use_color
    }

    fn colors(&self) -> &[Vec3; 4] {
        &self.color
    }
}
