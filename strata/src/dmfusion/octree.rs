use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use glam::{Vec3, Vec4};
use log::{debug, warn};
use parking_lot::Mutex;
use rayon::prelude::*;

use strata_math::intersect::ray_triangle_intersect;

use crate::error::{Result, StrataError};
use crate::mesh::TriangleMesh;
use crate::voxel::{DmfVoxel, VoxelIndex, MAX_LEVEL};

pub type VoxelMap = BTreeMap<VoxelIndex, DmfVoxel>;

/// A triangle prepared for volumetric fusion: three vertices with
/// per-vertex normals, optional colors and optional confidence values.
#[derive(Debug, Clone)]
pub struct OctreeTriangle {
    pub vertices: [Vec3; 3],
    pub normals: [Vec3; 3],
    pub colors: Option<[Vec4; 3]>,
    pub confidences: Option<[f32; 3]>,
}

/// Six-channel float image holding one octree slice: distance, weight and
/// RGBA color per pixel.
#[derive(Debug, Clone)]
pub struct SliceImage {
    pub width: usize,
    pub height: usize,
    pub channels: usize,
    pub data: Vec<f32>,
}

impl SliceImage {
    fn new(width: usize, height: usize, channels: usize) -> Self {
        Self {
            width,
            height,
            channels,
            data: vec![0.0; width * height * channels],
        }
    }

    pub fn at(&self, pixel: usize, channel: usize) -> f32 {
        self.data[pixel * self.channels + channel]
    }

    fn at_mut(&mut self, pixel: usize, channel: usize) -> &mut f32 {
        &mut self.data[pixel * self.channels + channel]
    }
}

/// Implicit octree for TSDF fusion of triangulated depth maps.
///
/// The hierarchy is not stored explicitly. Each voxel has a level and an
/// index within that level, from which its world position follows together
/// with the root AABB. Voxels are kept in an ordered map so that the
/// voxels of one level can be iterated with range queries.
pub struct DmfOctree {
    ramp_factor: f32,
    safety_border: f32,
    sampling_rate: f32,
    allow_expansion: bool,
    forced_level: u8,
    coarser_levels: u8,

    center: Vec3,
    halfsize: f32,
    forced_aabb: bool,

    viewdir: Vec3,
    use_orthographic: bool,

    voxels: VoxelMap,
}

impl Default for DmfOctree {
    fn default() -> Self {
        Self::new()
    }
}

impl DmfOctree {
    pub fn new() -> Self {
        Self {
            ramp_factor: 5.0,
            safety_border: 0.25,
            sampling_rate: 1.0,
            allow_expansion: true,
            forced_level: 0,
            coarser_levels: 2,
            center: Vec3::ZERO,
            halfsize: 0.0,
            forced_aabb: false,
            viewdir: Vec3::ZERO,
            use_orthographic: false,
            voxels: VoxelMap::new(),
        }
    }

    /* ---------------------- Octree settings --------------------- */

    /// Ramp size as a factor of the voxel footprint of the target level.
    pub fn set_ramp_factor(&mut self, factor: f32) {
        self.ramp_factor = factor;
    }

    /// Border around the mesh AABB as a factor of the AABB size.
    pub fn set_safety_border(&mut self, factor: f32) {
        self.safety_border = factor;
    }

    /// Higher sampling rates place triangles at deeper levels.
    pub fn set_sampling_rate(&mut self, rate: f32) {
        self.sampling_rate = rate;
    }

    /// If expansion is disallowed, triangles outside the root are rejected.
    pub fn set_allow_expansion(&mut self, allow: bool) {
        self.allow_expansion = allow;
    }

    /// Forces all insertions to one level. Zero disables forcing.
    pub fn set_forced_level(&mut self, level: u8) {
        self.forced_level = level;
    }

    /// Number of coarser levels each triangle is additionally inserted into.
    pub fn set_coarser_levels(&mut self, num: u8) {
        self.coarser_levels = num;
    }

    /// Forces the octree root to the given AABB.
    pub fn set_forced_aabb(&mut self, min: Vec3, max: Vec3) {
        self.center = (min + max) / 2.0;
        self.halfsize = (max - min).abs().max_element() * 0.5;
        self.forced_aabb = true;
    }

    /// Uses an orthographic viewing direction instead of per-voxel rays,
    /// for orthographic scanners.
    pub fn set_orthographic_viewdir(&mut self, viewdir: Vec3) {
        self.viewdir = viewdir.normalize();
        self.use_orthographic = true;
    }

    /* ---------------------- Accessors --------------------------- */

    pub fn voxels(&self) -> &VoxelMap {
        &self.voxels
    }

    pub fn voxels_mut(&mut self) -> &mut VoxelMap {
        &mut self.voxels
    }

    pub fn find_voxel(&self, vi: &VoxelIndex) -> Option<&DmfVoxel> {
        self.voxels.get(vi)
    }

    pub fn erase_voxel(&mut self, vi: &VoxelIndex) -> bool {
        self.voxels.remove(vi).is_some()
    }

    pub fn voxel_pos(&self, vi: &VoxelIndex) -> Vec3 {
        vi.position(self.center, self.halfsize)
    }

    pub fn aabb_min(&self) -> Vec3 {
        self.center - Vec3::splat(self.halfsize)
    }

    pub fn aabb_max(&self) -> Vec3 {
        self.center + Vec3::splat(self.halfsize)
    }

    pub fn center(&self) -> Vec3 {
        self.center
    }

    pub fn halfsize(&self) -> f32 {
        self.halfsize
    }

    pub fn clear(&mut self) {
        self.voxels.clear();
    }

    /* ------------------ Inserting into the tree ----------------- */

    /// Inserts a triangulated range image into the volume. Triangles are
    /// fused in parallel; the voxel map update is serialized.
    pub fn insert_mesh(&mut self, mesh: &TriangleMesh, campos: Vec3) -> Result<()> {
        if mesh.faces.is_empty() || mesh.vertices.is_empty() {
            warn!("skipping mesh without faces");
            return Ok(());
        }
        if mesh.vertex_normals.len() != mesh.vertices.len() {
            return Err(StrataError::invalid_argument(
                "mesh without vertex normals given",
            ));
        }

        // Enlarge the AABB to create a safety border around the mesh.
        let (mut aabb_min, mut aabb_max) = mesh.find_aabb();
        let border = (aabb_max - aabb_min) * self.safety_border;
        aabb_min -= border;
        aabb_max += border;

        if self.voxels.is_empty() && !self.forced_aabb {
            self.create_root(aabb_min, aabb_max);
        } else if self.allow_expansion && !self.forced_aabb {
            self.expand_root(aabb_min, aabb_max);
        }

        let has_colors = mesh.has_vertex_colors();
        let has_confidences = mesh.has_vertex_confidences();

        let voxels = Mutex::new(std::mem::take(&mut self.voxels));
        let level_hist = Mutex::new([0usize; MAX_LEVEL as usize + 1]);

        mesh.faces.par_chunks_exact(3).for_each(|face| {
            let ids = [face[0] as usize, face[1] as usize, face[2] as usize];
            let tri = OctreeTriangle {
                vertices: [
                    mesh.vertices[ids[0]],
                    mesh.vertices[ids[1]],
                    mesh.vertices[ids[2]],
                ],
                normals: [
                    mesh.vertex_normals[ids[0]],
                    mesh.vertex_normals[ids[1]],
                    mesh.vertex_normals[ids[2]],
                ],
                colors: has_colors.then(|| {
                    [
                        mesh.vertex_colors[ids[0]],
                        mesh.vertex_colors[ids[1]],
                        mesh.vertex_colors[ids[2]],
                    ]
                }),
                confidences: has_confidences.then(|| {
                    [
                        mesh.vertex_confidences[ids[0]],
                        mesh.vertex_confidences[ids[1]],
                        mesh.vertex_confidences[ids[2]],
                    ]
                }),
            };

            let level = self.fuse_triangle(&tri, campos, &voxels);
            level_hist.lock()[level as usize] += 1;
        });

        self.voxels = voxels.into_inner();

        let hist = level_hist.into_inner();
        for (level, count) in hist.iter().enumerate() {
            if *count > 0 {
                debug!("level {:2}: {:6} triangles", level, count);
            }
        }
        Ok(())
    }

    /// Inserts a single triangle and returns the chosen level.
    pub fn insert_triangle(&mut self, tri: &OctreeTriangle, campos: Vec3) -> u8 {
        let voxels = Mutex::new(std::mem::take(&mut self.voxels));
        let level = self.fuse_triangle(tri, campos, &voxels);
        self.voxels = voxels.into_inner();
        level
    }

    fn fuse_triangle(&self, tri: &OctreeTriangle, campos: Vec3, voxels: &Mutex<VoxelMap>) -> u8 {
        if self.halfsize <= 0.0 {
            warn!("octree has no root, triangle rejected");
            return 0;
        }

        // Fixed level shortcut.
        if self.forced_level > 0 {
            self.fuse_at_level(tri, self.forced_level, 1.0, campos, voxels);
            return self.forced_level;
        }

        // Footprint is the minimum edge length; it selects the level where
        // the voxel spacing matches the triangle sampling.
        let len = [
            (tri.vertices[0] - tri.vertices[1]).length_squared(),
            (tri.vertices[1] - tri.vertices[2]).length_squared(),
            (tri.vertices[2] - tri.vertices[0]).length_squared(),
        ];
        let tri_fp = len[0].min(len[1]).min(len[2]).sqrt();
        let root_fp = self.halfsize * 2.0;
        if tri_fp <= 0.0 {
            return 0;
        }

        let log2 = (root_fp / tri_fp * self.sampling_rate).log2();
        let level = (log2.ceil().max(1.0) as u32).min(MAX_LEVEL as u32) as u8;

        // Insert in the optimal level and in a few coarser levels.
        let target_level = level.saturating_sub(self.coarser_levels);
        for l in (target_level..=level).rev() {
            self.fuse_at_level(tri, l, 1.0, campos, voxels);
        }
        level
    }

    fn fuse_at_level(
        &self,
        tri: &OctreeTriangle,
        level: u8,
        level_weight: f32,
        campos: Vec3,
        voxels: &Mutex<VoxelMap>,
    ) {
        // Ramp length from the level footprint.
        let level_fp = self.halfsize * 2.0 / (1u64 << level) as f32;
        let ramp_len = self.ramp_factor * level_fp;

        // AABB of the truncated tetrahedron: each vertex extruded along its
        // view ray by +- ramp_len.
        let mut aabb_min = Vec3::splat(f32::MAX);
        let mut aabb_max = Vec3::splat(-f32::MAX);
        for i in 0..3 {
            let dir = if self.use_orthographic {
                self.viewdir
            } else {
                (tri.vertices[i] - campos).normalize()
            };
            for p in [
                tri.vertices[i] + dir * ramp_len,
                tri.vertices[i] - dir * ramp_len,
            ] {
                aabb_min = aabb_min.min(p);
                aabb_max = aabb_max.max(p);
            }
        }

        // Identify all voxels at this level inside the AABB.
        let root_min = self.aabb_min();
        let dim = 1u64 << level;
        let fdim = dim as f32;
        let full = self.halfsize * 2.0;
        let mut min_id = [0u64; 3];
        let mut max_id = [0u64; 3];
        for i in 0..3 {
            let fmin = ((aabb_min[i] - root_min[i]) * fdim / full - 0.1).clamp(0.0, fdim);
            let fmax = ((aabb_max[i] - root_min[i]) * fdim / full + 0.1).clamp(0.0, fdim);
            if fmin == fmax {
                return; // Triangle outside the octree AABB.
            }
            min_id[i] = fmin.ceil() as u64;
            max_id[i] = fmax.floor() as u64;
        }

        for z in min_id[2]..=max_id[2] {
            for y in min_id[1]..=max_id[1] {
                for x in min_id[0]..=max_id[0] {
                    let vi = VoxelIndex::from_coords(level, [x, y, z]);
                    self.fuse_voxel(tri, &vi, ramp_len, level_weight, campos, voxels);
                }
            }
        }
    }

    fn fuse_voxel(
        &self,
        tri: &OctreeTriangle,
        vi: &VoxelIndex,
        ramp_len: f32,
        level_weight: f32,
        campos: Vec3,
        voxels: &Mutex<VoxelMap>,
    ) {
        // Ray from the camera center through the voxel.
        let vpos = vi.position(self.center, self.halfsize);
        let camdist = (vpos - campos).length();
        let ray = if self.use_orthographic {
            self.viewdir
        } else {
            (vpos - campos) / camdist
        };

        // Signed distance from the camera through the voxel to the surface.
        let Some(hit) = ray_triangle_intersect(
            campos,
            ray,
            tri.vertices[0],
            tri.vertices[1],
            tri.vertices[2],
        ) else {
            return;
        };

        // Hits behind the camera center are invalid.
        if hit.t <= 0.0 {
            return;
        }

        // Subtract the camera-to-voxel distance to get the SDF value.
        let dist = hit.t - camdist;
        if dist.abs() > ramp_len {
            return;
        }

        // Interpolation weights at the hit point: bary = (u, v, 1-u-v)
        // where u, v weight the second and third vertex.
        let weights = [hit.bary.z, hit.bary.x, hit.bary.y];
        let normal = (tri.normals[0] * weights[0]
            + tri.normals[1] * weights[1]
            + tri.normals[2] * weights[2])
            .normalize();

        // Angle between the ray and the surface. A back-facing hit occurs
        // either for voxels behind the camera center or for broken camera
        // parameters; both cases are skipped.
        let angle_weight = -normal.dot(ray);
        if angle_weight <= 0.0 {
            if angle_weight < 0.0 {
                warn!("ray hit triangle backface");
            }
            return;
        }

        // Weight falloff with distance, see the VRIP weighting scheme.
        let dist_weight = (2.0 * (1.0 - dist.abs() / ramp_len)).clamp(0.0, 1.0);

        let conf_weight = tri.confidences.map_or(1.0, |conf| {
            conf[0] * weights[0] + conf[1] * weights[1] + conf[2] * weights[2]
        });

        let color = tri.colors.map(|colors| {
            colors[0] * weights[0] + colors[1] * weights[1] + colors[2] * weights[2]
        });

        let weight = level_weight * angle_weight * dist_weight * conf_weight;
        if weight <= 0.0 {
            return;
        }

        let mut map = voxels.lock();
        let voxel = map.entry(*vi).or_default();
        if voxel.weight == 0.0 {
            voxel.weight = weight;
            voxel.dist = dist;
            if let Some(color) = color {
                voxel.color = color;
            }
            voxel.color.w = weight;
        } else {
            let total_weight = voxel.weight + weight;
            let w1 = voxel.weight / total_weight;
            let w2 = weight / total_weight;
            voxel.dist = voxel.dist * w1 + dist * w2;
            voxel.weight = total_weight;
            if let Some(color) = color {
                let total_cweight = voxel.color.w + weight;
                let cw1 = voxel.color.w / total_cweight;
                let cw2 = weight / total_cweight;
                voxel.color = voxel.color * cw1 + color * cw2;
                voxel.color.w = total_cweight;
            }
        }
    }

    /* -------------------- Root management ------------------------ */

    fn create_root(&mut self, min: Vec3, max: Vec3) {
        debug!("creating octree root");
        self.center = (min + max) * 0.5;
        self.halfsize = (max - min).max_element() * 0.5;
    }

    /// Expands the root until the given AABB fits, one octant doubling at
    /// a time. Every stored voxel index is remapped so that its world
    /// position is unchanged.
    fn expand_root(&mut self, min: Vec3, max: Vec3) {
        let rmin = self.aabb_min();
        let rmax = self.aabb_max();
        let mut fits = true;
        for i in 0..3 {
            if min[i] < rmin[i] || max[i] > rmax[i] {
                fits = false;
            }
        }
        if fits {
            return;
        }

        debug!("expanding octree root");

        // The new root grows away from the octant the data leans toward.
        let mut octant = 0u8;
        for i in 0..3 {
            if (self.center[i] - min[i]).abs() > (self.center[i] - max[i]).abs() {
                octant |= 1 << i;
            }
        }

        let old_halfsize = self.halfsize;
        self.halfsize *= 2.0;
        for i in 0..3 {
            if octant & (1 << i) != 0 {
                self.center[i] -= old_halfsize;
            } else {
                self.center[i] += old_halfsize;
            }
        }

        // Remap all voxel indices into the expanded root.
        let old_voxels = std::mem::take(&mut self.voxels);
        for (vi, data) in old_voxels {
            let mut xyz = vi.factor_index();
            let off = 1u64 << vi.level;
            for j in 0..3 {
                if octant & (1 << j) != 0 {
                    xyz[j] += off;
                }
            }
            let new_vi = VoxelIndex::from_coords(vi.level + 1, xyz);
            self.voxels.insert(new_vi, data);
        }

        // Recursively expand until min/max fits.
        self.expand_root(min, max);
    }

    /* ------------ Preparing for surface extraction -------------- */

    /// Boosts voxels below the confidence threshold by interpolating
    /// distance values from the coincident voxels at the parent level.
    ///
    /// Pass a large threshold (~3.0) for noisy MVS data, a small one
    /// (~0.5) for controlled range scans, or 0.0 to disable.
    pub fn boost_voxels(&mut self, confidence_thres: f32) {
        if self.voxels.is_empty() || confidence_thres <= 0.0 {
            return;
        }

        let mut vmap = VoxelMap::new();
        for (vi, voxel) in &self.voxels {
            let mut voxel = *voxel;

            if voxel.weight >= confidence_thres || vi.level == 0 {
                vmap.insert(*vi, voxel);
                continue;
            }

            // The <= 8 parent-level voxels covering this corner follow from
            // the parity of each axis index.
            let xyz = vi.factor_index();
            let mut min_xyz = [0u64; 3];
            let mut max_xyz = [0u64; 3];
            for i in 0..3 {
                if xyz[i] % 2 == 1 {
                    min_xyz[i] = xyz[i] >> 1;
                    max_xyz[i] = (xyz[i] >> 1) + 1;
                } else {
                    min_xyz[i] = xyz[i] >> 1;
                    max_xyz[i] = xyz[i] >> 1;
                }
            }

            let mut parent_weight = f32::MAX;
            let mut parent_dist = 0.0f32;
            let mut total_amount = 0;
            let mut expected_amount = 0;
            for z in min_xyz[2]..=max_xyz[2] {
                for y in min_xyz[1]..=max_xyz[1] {
                    for x in min_xyz[0]..=max_xyz[0] {
                        expected_amount += 1;
                        let pvi = VoxelIndex::from_coords(vi.level - 1, [x, y, z]);
                        let Some(parent) = self.voxels.get(&pvi) else {
                            continue;
                        };
                        parent_dist += parent.dist;
                        parent_weight = parent_weight.min(confidence_thres.min(parent.weight));
                        total_amount += 1;
                    }
                }
            }

            // Boost only if all parents exist and carry weight.
            if total_amount != expected_amount || total_amount == 0 || parent_weight <= 0.0 {
                vmap.insert(*vi, voxel);
                continue;
            }

            parent_dist /= total_amount as f32;

            let pweight = parent_weight / confidence_thres * (confidence_thres - voxel.weight);
            let nweight = pweight + voxel.weight;
            voxel.dist = (pweight * parent_dist + voxel.weight * voxel.dist) / nweight;
            voxel.weight = nweight;

            vmap.insert(*vi, voxel);
        }

        self.voxels = vmap;
    }

    /// Removes voxels at or below the given weight. Returns the number of
    /// erased voxels.
    pub fn remove_unconfident(&mut self, thres: f32) -> usize {
        let before = self.voxels.len();
        self.voxels.retain(|_, voxel| voxel.weight > thres);
        before - self.voxels.len()
    }

    /// Removes twin voxels, i.e. voxels on multiple levels that address
    /// the same world corner. The deepest voxel survives. Returns the
    /// number of erased duplicates.
    pub fn remove_twins(&mut self) -> usize {
        let mut new_vmap = VoxelMap::new();
        let mut erased = 0usize;
        loop {
            let first = match self.voxels.keys().next() {
                Some(key) => *key,
                None => break,
            };

            // Collect all coincident voxels at deeper levels.
            let mut coincident = vec![first];
            let mut vi = first.descend();
            while vi.level < MAX_LEVEL + 1 {
                if self.voxels.contains_key(&vi) {
                    coincident.push(vi);
                }
                if vi.level == MAX_LEVEL {
                    break;
                }
                vi = vi.descend();
            }

            // Keep the representant at the deepest level.
            let deepest = *coincident.last().unwrap();
            let data = self.voxels[&deepest];
            new_vmap.insert(deepest, data);

            for key in &coincident {
                self.voxels.remove(key);
            }
            erased += coincident.len() - 1;
        }
        self.voxels = new_vmap;
        erased
    }

    /* --------------------- Slice extraction --------------------- */

    /// Returns an image of one octree slice of a level. Arguments are the
    /// level, the orthogonal axis (x=0, y=1, z=2) and the slice id.
    pub fn get_slice(&self, level: u8, axis: usize, id: u64) -> Result<SliceImage> {
        let dim = (1u64 << level) + 1;
        if id >= dim {
            return Err(StrataError::invalid_argument("slice id out of bounds"));
        }
        if axis > 2 {
            return Err(StrataError::invalid_argument("invalid axis id"));
        }

        // Axis strides depending on the selected axis.
        let (dimx, dimy, dimz) = match axis {
            0 => (dim * dim, dim, 1),
            1 => (1, dim * dim, dim),
            _ => (1, dim, dim * dim),
        };

        let mut image = SliceImage::new(dim as usize, dim as usize, 6);

        let start = VoxelIndex::new(level, 0);
        let end = VoxelIndex::new(level, u64::MAX);
        for (vi, voxel) in self.voxels.range(start..=end) {
            if (vi.index / dimz) % dim != id {
                continue;
            }
            let x = (vi.index / dimx) % dim;
            let y = (vi.index / dimy) % dim;
            let pixel = (x + y * dim) as usize;
            *image.at_mut(pixel, 0) = voxel.dist;
            *image.at_mut(pixel, 1) = voxel.weight;
            for c in 0..4 {
                *image.at_mut(pixel, c + 2) = voxel.color[c];
            }
        }

        Ok(image)
    }

    /* ------------------------- File I/O -------------------------- */

    const FILE_HEADER: &'static str = "DMFOCTREE";

    /// Saves the octree as a binary little-endian voxel stream.
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut out = BufWriter::new(File::create(path)?);

        out.write_all(Self::FILE_HEADER.as_bytes())?;
        out.write_all(b"\n")?;
        out.write_all(format!("{}\n", self.voxels.len()).as_bytes())?;
        for i in 0..3 {
            out.write_f32::<LittleEndian>(self.center[i])?;
        }
        out.write_f32::<LittleEndian>(self.halfsize)?;

        for (vi, voxel) in &self.voxels {
            out.write_u8(vi.level)?;
            out.write_u64::<LittleEndian>(vi.index)?;
            out.write_f32::<LittleEndian>(voxel.dist)?;
            out.write_f32::<LittleEndian>(voxel.weight)?;
            for c in 0..4 {
                out.write_f32::<LittleEndian>(voxel.color[c])?;
            }
        }
        Ok(())
    }

    /// Loads an octree saved with [`DmfOctree::save`].
    pub fn load(&mut self, path: &Path) -> Result<()> {
        self.voxels.clear();

        let mut input = BufReader::new(File::open(path)?);

        let mut header = String::new();
        input.read_line(&mut header)?;
        if header.trim_end() != Self::FILE_HEADER {
            return Err(StrataError::file_format(path, "unrecognized header"));
        }

        let mut count_line = String::new();
        input.read_line(&mut count_line)?;
        let num_voxels: usize = count_line
            .trim_end()
            .parse()
            .map_err(|_| StrataError::file_format(path, "invalid voxel count"))?;

        let mut center = [0.0f32; 3];
        input.read_f32_into::<LittleEndian>(&mut center)?;
        self.center = Vec3::from_array(center);
        self.halfsize = input.read_f32::<LittleEndian>()?;

        let mut level_hist = [0usize; MAX_LEVEL as usize + 1];
        for _ in 0..num_voxels {
            let level = input.read_u8()?;
            if level > MAX_LEVEL {
                return Err(StrataError::file_format(path, "voxel level out of range"));
            }
            let index = input.read_u64::<LittleEndian>()?;
            let dist = input.read_f32::<LittleEndian>()?;
            let weight = input.read_f32::<LittleEndian>()?;
            let mut color = [0.0f32; 4];
            input.read_f32_into::<LittleEndian>(&mut color)?;

            let vi = VoxelIndex::new(level, index);
            let dim = vi.dim();
            if index >= dim * dim * dim {
                return Err(StrataError::file_format(path, "voxel index out of range"));
            }
            self.voxels.insert(
                vi,
                DmfVoxel {
                    dist,
                    weight,
                    color: Vec4::from_array(color),
                },
            );
            level_hist[level as usize] += 1;
        }

        // A trailing voxel shortage means the file was truncated.
        if self.voxels.len() != num_voxels {
            return Err(StrataError::file_format(path, "inconsistent voxel count"));
        }

        for (level, count) in level_hist.iter().enumerate() {
            if *count > 0 {
                debug!("level {:2}: {:6} voxels", level, count);
            }
        }
        Ok(())
    }

    /// Drains another octree's voxels into this one (no blending; used by
    /// the file loader and tests).
    pub fn insert_voxel(&mut self, vi: VoxelIndex, voxel: DmfVoxel) {
        self.voxels.insert(vi, voxel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_triangle() -> OctreeTriangle {
        OctreeTriangle {
            vertices: [
                Vec3::new(-0.5, -0.5, 1.0),
                Vec3::new(0.5, -0.5, 1.0),
                Vec3::new(0.0, 0.5, 1.0),
            ],
            normals: [Vec3::new(0.0, 0.0, -1.0); 3],
            colors: None,
            confidences: None,
        }
    }

    fn filled_octree() -> (DmfOctree, Vec3) {
        let mut octree = DmfOctree::new();
        octree.set_forced_aabb(Vec3::splat(-2.0), Vec3::splat(2.0));
        let campos = Vec3::new(0.0, 0.0, -1.0);
        octree.insert_triangle(&unit_triangle(), campos);
        (octree, campos)
    }

    #[test]
    fn test_insert_creates_voxels() {
        let (octree, _) = filled_octree();
        assert!(!octree.voxels().is_empty());
        for (vi, _) in octree.voxels() {
            let dim = vi.dim();
            assert!(vi.index < dim * dim * dim);
        }
    }

    #[test]
    fn test_fusion_monotonicity() {
        // Fusing the same triangle twice doubles weights and keeps
        // distances unchanged.
        let (mut octree, campos) = filled_octree();
        let snapshot: Vec<(VoxelIndex, DmfVoxel)> =
            octree.voxels().iter().map(|(k, v)| (*k, *v)).collect();

        octree.insert_triangle(&unit_triangle(), campos);

        for (vi, before) in snapshot {
            let after = octree.find_voxel(&vi).expect("voxel must persist");
            assert!((after.weight - 2.0 * before.weight).abs() < 1e-5 * before.weight.max(1.0));
            assert!((after.dist - before.dist).abs() < 1e-5);
        }
    }

    #[test]
    fn test_sdf_sign_convention() {
        // Convention: dist < 0 inside (beyond the surface as seen from the
        // camera), dist > 0 between camera and surface.
        let (octree, campos) = filled_octree();
        for (vi, voxel) in octree.voxels() {
            let pos = octree.voxel_pos(vi);
            let camdist = (pos - campos).length();
            // Surface plane sits at z=1, camera at z=-1.
            if camdist < 1.9 {
                assert!(voxel.dist >= 0.0, "voxel before surface must be outside");
            }
        }
    }

    #[test]
    fn test_expand_root_preserves_positions() {
        let mut octree = DmfOctree::new();
        let mut mesh = TriangleMesh::new();
        mesh.vertices = vec![
            Vec3::new(-0.5, -0.5, 1.0),
            Vec3::new(0.5, -0.5, 1.0),
            Vec3::new(0.0, 0.5, 1.0),
        ];
        mesh.faces = vec![0, 1, 2];
        mesh.vertex_normals = vec![Vec3::new(0.0, 0.0, -1.0); 3];
        octree
            .insert_mesh(&mesh, Vec3::new(0.0, 0.0, -1.0))
            .unwrap();

        let before: Vec<(VoxelIndex, Vec3)> = octree
            .voxels()
            .iter()
            .map(|(vi, _)| (*vi, octree.voxel_pos(vi)))
            .collect();

        // Insert a far-away mesh to force expansion.
        let mut far = TriangleMesh::new();
        far.vertices = vec![
            Vec3::new(9.5, 9.5, 11.0),
            Vec3::new(10.5, 9.5, 11.0),
            Vec3::new(10.0, 10.5, 11.0),
        ];
        far.faces = vec![0, 1, 2];
        far.vertex_normals = vec![Vec3::new(0.0, 0.0, -1.0); 3];
        octree.insert_mesh(&far, Vec3::new(10.0, 10.0, 9.0)).unwrap();

        // The old voxels were remapped; each remapped index must resolve
        // to the same world position.
        for (old_vi, old_pos) in before {
            let mut found = false;
            for (vi, _) in octree.voxels() {
                if vi.level >= old_vi.level {
                    let pos = octree.voxel_pos(vi);
                    if (pos - old_pos).length() < 1e-5 * old_pos.length().max(1.0) {
                        found = true;
                        break;
                    }
                }
            }
            assert!(found, "voxel at {:?} lost its position", old_pos);
        }
    }

    #[test]
    fn test_remove_unconfident() {
        let mut octree = DmfOctree::new();
        octree.insert_voxel(
            VoxelIndex::new(2, 0),
            DmfVoxel {
                dist: 1.0,
                weight: 0.1,
                color: Vec4::ZERO,
            },
        );
        octree.insert_voxel(
            VoxelIndex::new(2, 1),
            DmfVoxel {
                dist: 1.0,
                weight: 2.0,
                color: Vec4::ZERO,
            },
        );
        assert_eq!(octree.remove_unconfident(0.5), 1);
        assert_eq!(octree.voxels().len(), 1);
    }

    #[test]
    fn test_remove_twins_keeps_deepest() {
        let mut octree = DmfOctree::new();
        let coarse = VoxelIndex::from_coords(2, [1, 1, 1]);
        let fine = coarse.descend();
        octree.insert_voxel(
            coarse,
            DmfVoxel {
                dist: 1.0,
                weight: 1.0,
                color: Vec4::ZERO,
            },
        );
        octree.insert_voxel(
            fine,
            DmfVoxel {
                dist: 2.0,
                weight: 2.0,
                color: Vec4::ZERO,
            },
        );
        assert_eq!(octree.remove_twins(), 1);
        assert_eq!(octree.voxels().len(), 1);
        let survivor = octree.find_voxel(&fine).expect("deepest must survive");
        assert_eq!(survivor.dist, 2.0);
    }

    #[test]
    fn test_save_load_roundtrip() {
        let (octree, _) = filled_octree();
        let path = std::env::temp_dir().join("strata_dmf_octree_test.bin");
        octree.save(&path).unwrap();

        let mut loaded = DmfOctree::new();
        loaded.load(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(loaded.voxels().len(), octree.voxels().len());
        assert_eq!(loaded.center(), octree.center());
        assert_eq!(loaded.halfsize(), octree.halfsize());
        for ((via, va), (vib, vb)) in loaded.voxels().iter().zip(octree.voxels().iter()) {
            assert_eq!(via, vib);
            assert_eq!(va.dist, vb.dist);
            assert_eq!(va.weight, vb.weight);
        }
    }

    #[test]
    fn test_get_slice_rejects_bad_args() {
        let (octree, _) = filled_octree();
        assert!(octree.get_slice(2, 3, 0).is_err());
        assert!(octree.get_slice(2, 0, 100).is_err());
    }

    #[test]
    fn test_boost_voxels_diffuses_parent_distance() {
        let mut octree = DmfOctree::new();
        // A full set of parents around fine voxel (1, 1, 1) at level 2.
        for z in 0..=1u64 {
            for y in 0..=1u64 {
                for x in 0..=1u64 {
                    octree.insert_voxel(
                        VoxelIndex::from_coords(1, [x, y, z]),
                        DmfVoxel {
                            dist: 4.0,
                            weight: 3.0,
                            color: Vec4::ZERO,
                        },
                    );
                }
            }
        }
        let fine = VoxelIndex::from_coords(2, [1, 1, 1]);
        octree.insert_voxel(
            fine,
            DmfVoxel {
                dist: 0.0,
                weight: 0.5,
                color: Vec4::ZERO,
            },
        );

        octree.boost_voxels(2.0);
        let boosted = octree.find_voxel(&fine).unwrap();
        assert!(boosted.weight > 0.5);
        assert!(boosted.dist > 0.0, "parent distance must leak in");
    }
}
