use std::collections::{BTreeMap, BTreeSet};

use glam::Vec3;
use log::{debug, warn};
use rayon::prelude::*;

use crate::fssr::basis::evaluate_sample;
use crate::fssr::sample::Sample;
use crate::voxel::{FssrVoxel, VoxelIndex, MAX_LEVEL};

const INVALID: u32 = u32::MAX;

/// Explicit octree node in the arena. Children are arena indices and are
/// created individually; after regularization an inner node has all eight
/// children populated.
#[derive(Debug, Clone)]
struct Node {
    children: [u32; 8],
    level: u8,
    coords: [u64; 3],
    samples: Vec<Sample>,
    /// Largest support-defining scale in the subtree rooted here. Valid
    /// after [`FssrOctree::update_scale_bounds`].
    max_scale: f32,
}

impl Node {
    fn new(level: u8, coords: [u64; 3]) -> Self {
        Self {
            children: [INVALID; 8],
            level,
            coords,
            samples: Vec::new(),
            max_scale: 0.0,
        }
    }

    fn is_leaf(&self) -> bool {
        self.children.iter().all(|&c| c == INVALID)
    }
}

/// Adaptive sparse octree of surface samples with per-sample scale.
///
/// Nodes live in an arena indexed by u32 instead of a pointer graph,
/// which keeps traversal cache friendly and avoids back-pointer cycles.
/// Samples are inserted at the depth matching their scale; voxels (leaf
/// cell corners) are computed by sampling the implicit function.
pub struct FssrOctree {
    nodes: Vec<Node>,
    center: Vec3,
    halfsize: f32,
    voxels: BTreeMap<VoxelIndex, FssrVoxel>,
    num_samples: usize,
}

impl Default for FssrOctree {
    fn default() -> Self {
        Self::new()
    }
}

impl FssrOctree {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            center: Vec3::ZERO,
            halfsize: 0.0,
            voxels: BTreeMap::new(),
            num_samples: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn num_samples(&self) -> usize {
        self.num_samples
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn center(&self) -> Vec3 {
        self.center
    }

    pub fn halfsize(&self) -> f32 {
        self.halfsize
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.voxels.clear();
        self.num_samples = 0;
        self.halfsize = 0.0;
        self.center = Vec3::ZERO;
    }

    /// Side length of a cell at the given level.
    fn cell_size(&self, level: u8) -> f32 {
        self.halfsize * 2.0 / (1u64 << level) as f32
    }

    fn cell_min(&self, level: u8, coords: [u64; 3]) -> Vec3 {
        let size = self.cell_size(level);
        self.center - Vec3::splat(self.halfsize)
            + Vec3::new(
                coords[0] as f32 * size,
                coords[1] as f32 * size,
                coords[2] as f32 * size,
            )
    }

    fn cell_center(&self, level: u8, coords: [u64; 3]) -> Vec3 {
        self.cell_min(level, coords) + Vec3::splat(self.cell_size(level) / 2.0)
    }

    /* ---------------------- Sample insertion --------------------- */

    /// Inserts samples, creating or expanding the root as needed. Samples
    /// without positive scale are rejected.
    pub fn insert_samples(&mut self, samples: &[Sample]) {
        let valid: Vec<&Sample> = samples.iter().filter(|s| s.scale > 0.0).collect();
        if valid.len() != samples.len() {
            warn!(
                "rejected {} samples without positive scale",
                samples.len() - valid.len()
            );
        }
        if valid.is_empty() {
            return;
        }

        // The root must contain every sample with its full kernel support.
        let mut min = Vec3::splat(f32::MAX);
        let mut max = Vec3::splat(-f32::MAX);
        for sample in &valid {
            min = min.min(sample.pos - Vec3::splat(sample.support_radius()));
            max = max.max(sample.pos + Vec3::splat(sample.support_radius()));
        }

        if self.nodes.is_empty() {
            self.center = (min + max) * 0.5;
            self.halfsize = (max - min).max_element() * 0.5;
            self.nodes.push(Node::new(0, [0, 0, 0]));
            debug!(
                "created octree root at {:?}, halfsize {}",
                self.center, self.halfsize
            );
        } else {
            self.expand_root(min, max);
        }

        for sample in valid {
            self.insert_sample(*sample);
        }
    }

    fn insert_sample(&mut self, sample: Sample) {
        // Descend while the child cell would still be larger than the
        // sample scale: the sample lands in the first node whose size is
        // in [scale, 2 * scale).
        let mut node = 0usize;
        while self.cell_size(self.nodes[node].level) / 2.0 >= sample.scale
            && self.nodes[node].level < MAX_LEVEL
        {
            let child_index = self.child_index_for(node, sample.pos);
            node = self.ensure_child(node, child_index);
        }
        self.nodes[node].samples.push(sample);
        self.num_samples += 1;
    }

    fn child_index_for(&self, node: usize, pos: Vec3) -> usize {
        let center = self.cell_center(self.nodes[node].level, self.nodes[node].coords);
        let mut index = 0;
        if pos.x >= center.x {
            index |= 1;
        }
        if pos.y >= center.y {
            index |= 2;
        }
        if pos.z >= center.z {
            index |= 4;
        }
        index
    }

    fn ensure_child(&mut self, node: usize, child_index: usize) -> usize {
        if self.nodes[node].children[child_index] != INVALID {
            return self.nodes[node].children[child_index] as usize;
        }
        let level = self.nodes[node].level + 1;
        let coords = self.nodes[node].coords;
        let child_coords = [
            coords[0] * 2 + (child_index & 1) as u64,
            coords[1] * 2 + ((child_index >> 1) & 1) as u64,
            coords[2] * 2 + ((child_index >> 2) & 1) as u64,
        ];
        let new_index = self.nodes.len() as u32;
        self.nodes.push(Node::new(level, child_coords));
        self.nodes[node].children[child_index] = new_index;
        new_index as usize
    }

    /// Grows the root until the given AABB fits, one doubling at a time.
    /// The old root becomes one octant of the new root; the subtree's
    /// levels and coordinates are remapped in place.
    fn expand_root(&mut self, min: Vec3, max: Vec3) {
        loop {
            let rmin = self.center - Vec3::splat(self.halfsize);
            let rmax = self.center + Vec3::splat(self.halfsize);
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

            let mut octant = 0usize;
            for i in 0..3 {
                if (self.center[i] - min[i]).abs() > (self.center[i] - max[i]).abs() {
                    octant |= 1 << i;
                }
            }

            // Move the old root into the arena as a child of a fresh root.
            let old_root = std::mem::replace(&mut self.nodes[0], Node::new(0, [0, 0, 0]));
            let moved = self.nodes.len();
            self.nodes.push(old_root);
            self.remap_subtree(moved, octant);
            self.nodes[0].children[octant] = moved as u32;

            let old_halfsize = self.halfsize;
            self.halfsize *= 2.0;
            for i in 0..3 {
                if octant & (1 << i) != 0 {
                    self.center[i] -= old_halfsize;
                } else {
                    self.center[i] += old_halfsize;
                }
            }
        }
    }

    fn remap_subtree(&mut self, root: usize, octant: usize) {
        let mut stack = vec![root];
        while let Some(index) = stack.pop() {
            let old_level = self.nodes[index].level;
            self.nodes[index].level = old_level + 1;
            for j in 0..3 {
                if octant & (1 << j) != 0 {
                    self.nodes[index].coords[j] += 1u64 << old_level;
                }
            }
            for child in self.nodes[index].children {
                if child != INVALID {
                    stack.push(child as usize);
                }
            }
        }
    }

    /* -------------------- Structure refinement ------------------- */

    /// One refinement round: subdivides every leaf that holds samples,
    /// pushing each sample into the child containing its position.
    pub fn refine_octree(&mut self) {
        let leaves: Vec<usize> = (0..self.nodes.len())
            .filter(|&i| self.nodes[i].is_leaf() && !self.nodes[i].samples.is_empty())
            .collect();

        for node in leaves {
            if self.nodes[node].level >= MAX_LEVEL {
                continue;
            }
            let samples = std::mem::take(&mut self.nodes[node].samples);
            for sample in samples {
                let child_index = self.child_index_for(node, sample.pos);
                let child = self.ensure_child(node, child_index);
                self.nodes[child].samples.push(sample);
            }
        }
    }

    /// Finds the deepest existing node containing the cell at the given
    /// level and coordinates.
    fn deepest_node_at(&self, level: u8, coords: [u64; 3]) -> usize {
        let mut node = 0usize;
        for depth in (0..level).rev() {
            let child_index = (((coords[0] >> depth) & 1)
                | ((coords[1] >> depth) & 1) << 1
                | ((coords[2] >> depth) & 1) << 2) as usize;
            let child = self.nodes[node].children[child_index];
            if child == INVALID {
                return node;
            }
            node = child as usize;
        }
        node
    }

    /// Level-balances the tree: any two face/edge/corner adjacent leaves
    /// end up within one level of each other. This keeps coarse/fine
    /// transitions simple for the adaptive extraction stage.
    fn balance_octree(&mut self) {
        loop {
            let mut changed = false;
            let leaves: Vec<(u8, [u64; 3])> = self
                .nodes
                .iter()
                .filter(|n| n.is_leaf())
                .map(|n| (n.level, n.coords))
                .collect();

            for (level, coords) in leaves {
                if level < 2 {
                    continue;
                }
                let cells = 1u64 << level;
                for dz in -1i64..=1 {
                    for dy in -1i64..=1 {
                        for dx in -1i64..=1 {
                            if dx == 0 && dy == 0 && dz == 0 {
                                continue;
                            }
                            let nx = coords[0] as i64 + dx;
                            let ny = coords[1] as i64 + dy;
                            let nz = coords[2] as i64 + dz;
                            if nx < 0
                                || ny < 0
                                || nz < 0
                                || nx >= cells as i64
                                || ny >= cells as i64
                                || nz >= cells as i64
                            {
                                continue;
                            }
                            let ncoords = [nx as u64, ny as u64, nz as u64];
                            let node = self.deepest_node_at(level, ncoords);
                            if self.nodes[node].level + 1 < level {
                                // Split one level, keeping full coverage.
                                for child_index in 0..8 {
                                    self.ensure_child(node, child_index);
                                }
                                changed = true;
                            }
                        }
                    }
                }
            }

            if !changed {
                return;
            }
        }
    }

    /// Regularizes the octree: level-balances it and creates the missing
    /// children of every inner node, so that each voxel index derived
    /// from a leaf corner has well-defined neighbors.
    pub fn make_regular_octree(&mut self) {
        if self.nodes.is_empty() {
            return;
        }

        self.balance_octree();

        let mut cursor = 0;
        while cursor < self.nodes.len() {
            if !self.nodes[cursor].is_leaf() {
                for child_index in 0..8 {
                    if self.nodes[cursor].children[child_index] == INVALID {
                        self.ensure_child(cursor, child_index);
                    }
                }
            }
            cursor += 1;
        }
    }

    /* ---------------------- Voxel computation -------------------- */

    /// Post-order sweep computing the per-subtree scale bound used for
    /// pruning the sample gather.
    fn update_scale_bounds(&mut self) {
        let order = self.postorder();
        for index in order {
            let mut bound: f32 = 0.0;
            for sample in &self.nodes[index].samples {
                bound = bound.max(sample.scale);
            }
            for child in self.nodes[index].children {
                if child != INVALID {
                    bound = bound.max(self.nodes[child as usize].max_scale);
                }
            }
            self.nodes[index].max_scale = bound;
        }
    }

    fn postorder(&self) -> Vec<usize> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![(0usize, false)];
        while let Some((index, expanded)) = stack.pop() {
            if expanded {
                order.push(index);
                continue;
            }
            stack.push((index, true));
            for child in self.nodes[index].children {
                if child != INVALID {
                    stack.push((child as usize, false));
                }
            }
        }
        order
    }

    /// Evaluates the implicit function at every leaf corner. Corners
    /// shared between leaves are computed once; evaluation runs in
    /// parallel over the unique corners.
    pub fn compute_voxels(&mut self) {
        if self.nodes.is_empty() {
            return;
        }
        self.update_scale_bounds();

        let mut corners: BTreeSet<VoxelIndex> = BTreeSet::new();
        for node in &self.nodes {
            if !node.is_leaf() {
                continue;
            }
            for corner in 0..8u64 {
                let coords = [
                    node.coords[0] + (corner & 1),
                    node.coords[1] + ((corner >> 1) & 1),
                    node.coords[2] + ((corner >> 2) & 1),
                ];
                corners.insert(VoxelIndex::from_coords(node.level, coords));
            }
        }
        debug!("computing {} voxels", corners.len());

        let corner_list: Vec<VoxelIndex> = corners.into_iter().collect();
        let this: &Self = self;
        let computed: Vec<(VoxelIndex, FssrVoxel)> = corner_list
            .into_par_iter()
            .map(|vi| {
                let pos = vi.position(this.center, this.halfsize);
                (vi, this.sample_ifn(pos))
            })
            .collect();

        self.voxels = computed.into_iter().collect();
    }

    /// Samples the implicit function at one position: the weighted
    /// average of all basis functions whose support reaches the position.
    fn sample_ifn(&self, pos: Vec3) -> FssrVoxel {
        let mut value = 0.0f64;
        let mut weight = 0.0f64;
        let mut color = glam::DVec3::ZERO;
        let mut color_weight = 0.0f64;
        let mut scale = 0.0f64;

        let mut stack = vec![0usize];
        while let Some(index) = stack.pop() {
            let node = &self.nodes[index];

            // Prune subtrees whose samples cannot reach the position.
            let cell_min = self.cell_min(node.level, node.coords);
            let cell_max = cell_min + Vec3::splat(self.cell_size(node.level));
            let closest = pos.clamp(cell_min, cell_max);
            if (pos - closest).length() > 3.0 * node.max_scale {
                continue;
            }

            for sample in &node.samples {
                let Some(contribution) = evaluate_sample(pos, sample) else {
                    continue;
                };
                value += contribution.value;
                weight += contribution.weight;
                scale += contribution.weight * f64::from(sample.scale);
                if let Some(sample_color) = sample.color {
                    color += contribution.weight * sample_color.as_dvec3();
                    color_weight += contribution.weight;
                }
            }

            for child in node.children {
                if child != INVALID {
                    stack.push(child as usize);
                }
            }
        }

        if weight <= 0.0 {
            return FssrVoxel::default();
        }

        FssrVoxel {
            value: (value / weight) as f32,
            confidence: weight as f32,
            color: if color_weight > 0.0 {
                (color / color_weight).as_vec3()
            } else {
                Vec3::ZERO
            },
            scale: (scale / weight) as f32,
        }
    }

    /// Computed voxels keyed by voxel index, in sorted order.
    pub fn voxels(&self) -> &BTreeMap<VoxelIndex, FssrVoxel> {
        &self.voxels
    }

    /// Leaf cells as (level, coordinates) pairs.
    pub fn leaves(&self) -> impl Iterator<Item = (u8, [u64; 3])> + '_ {
        self.nodes
            .iter()
            .filter(|n| n.is_leaf())
            .map(|n| (n.level, n.coords))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn axis_samples(scale: f32) -> Vec<Sample> {
        // Six samples on the unit axes with outward normals.
        let axes = [
            Vec3::X,
            Vec3::NEG_X,
            Vec3::Y,
            Vec3::NEG_Y,
            Vec3::Z,
            Vec3::NEG_Z,
        ];
        axes.iter().map(|&a| Sample::new(a, a, scale)).collect()
    }

    #[test]
    fn test_insert_rejects_zero_scale() {
        let mut octree = FssrOctree::new();
        let mut samples = axis_samples(0.3);
        samples.push(Sample::new(Vec3::ZERO, Vec3::X, 0.0));
        octree.insert_samples(&samples);
        assert_eq!(octree.num_samples(), 6);
    }

    #[test]
    fn test_sample_depth_matches_scale() {
        let mut octree = FssrOctree::new();
        octree.insert_samples(&axis_samples(0.3));

        // Every sample must sit in a node whose cell size is within
        // [scale, 2 * scale).
        for node in &octree.nodes {
            for sample in &node.samples {
                let size = octree.cell_size(node.level);
                assert!(size >= sample.scale, "node too small for sample");
                assert!(
                    size / 2.0 < sample.scale,
                    "sample not pushed deep enough: size {} scale {}",
                    size,
                    sample.scale
                );
            }
        }
    }

    #[test]
    fn test_refine_adds_one_level(){
        let mut octree = FssrOctree::new();
        octree.insert_samples(&axis_samples(0.3));
        let max_level_before = octree.nodes.iter().map(|n| n.level).max().unwrap();
        octree.refine_octree();
        let max_level_after = octree.nodes.iter().map(|n| n.level).max().unwrap();
        assert_eq!(max_level_after, max_level_before + 1);
    }

    #[test]
    fn test_make_regular_fills_children() {
        let mut octree = FssrOctree::new();
        octree.insert_samples(&axis_samples(0.3));
        octree.make_regular_octree();
        for node in &octree.nodes {
            let num_children = node.children.iter().filter(|&&c| c != INVALID).count();
            assert!(num_children == 0 || num_children == 8);
        }
    }

    #[test]
    fn test_balanced_after_regularization() {
        let mut octree = FssrOctree::new();
        let mut samples = axis_samples(0.3);
        // One much finer sample forces deep subdivision.
        samples.push(Sample::new(Vec3::new(1.0, 0.01, 0.01), Vec3::X, 0.02));
        octree.insert_samples(&samples);
        octree.make_regular_octree();

        let leaves: Vec<(u8, [u64; 3])> = octree.leaves().collect();
        for &(level, coords) in &leaves {
            for &(other_level, other_coords) in &leaves {
                // Face-adjacent leaves must be within one level.
                if level.abs_diff(other_level) <= 1 {
                    continue;
                }
                let (fine, coarse, fl, cl) = if level > other_level {
                    (coords, other_coords, level, other_level)
                } else {
                    (other_coords, coords, other_level, level)
                };
                let shift = fl - cl;
                let mut adjacent = true;
                for i in 0..3 {
                    let cmin = coarse[i] << shift;
                    let cmax = (coarse[i] + 1) << shift;
                    if fine[i] + 1 < cmin || fine[i] > cmax {
                        adjacent = false;
                    }
                }
                assert!(!adjacent, "adjacent leaves differ by more than one level");
            }
        }
    }

    #[test]
    fn test_compute_voxels_signs() {
        let mut octree = FssrOctree::new();
        octree.insert_samples(&axis_samples(0.5));
        octree.make_regular_octree();
        octree.compute_voxels();

        assert!(!octree.voxels().is_empty());

        // Voxels near the origin (inside) must have negative values,
        // voxels far outside positive values, wherever confident.
        let center = octree.center();
        let halfsize = octree.halfsize();
        let mut saw_inside = false;
        let mut saw_outside = false;
        for (vi, voxel) in octree.voxels() {
            if voxel.confidence <= 0.0 {
                continue;
            }
            let pos = vi.position(center, halfsize);
            let r = pos.length();
            if r < 0.5 && voxel.value < 0.0 {
                saw_inside = true;
            }
            if r > 1.1 && r < 1.5 && voxel.value > 0.0 {
                saw_outside = true;
            }
        }
        assert!(saw_inside, "no confident inside voxel found");
        assert!(saw_outside, "no confident outside voxel found");
    }

    #[test]
    fn test_clear_resets_state() {
        let mut octree = FssrOctree::new();
        octree.insert_samples(&axis_samples(0.3));
        octree.compute_voxels();
        octree.clear();
        assert!(octree.is_empty());
        assert_eq!(octree.num_samples(), 0);
        assert!(octree.voxels().is_empty());
    }
}
