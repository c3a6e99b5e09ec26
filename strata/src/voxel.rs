use glam::{Vec3, Vec4};

/// Deepest level supported by the implicit voxel addressing. At level 20
/// the grid has (1 << 20) + 1 corners per axis, which is the densest grid
/// whose linear index still fits comfortably in 64 bits.
pub const MAX_LEVEL: u8 = 20;

/// Uniquely addresses a cell corner at a given octree level.
///
/// The grid at level L has `(1 << L) + 1` corners per axis, so corner
/// planes are shared between adjacent cells. The linear index packs the
/// coordinates as `x + y * dim + z * dim * dim`.
///
/// The derived ordering is lexicographic in (level, index), which groups
/// voxels by level and allows per-level range queries on an ordered map.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VoxelIndex {
    pub level: u8,
    pub index: u64,
}

impl VoxelIndex {
    pub fn new(level: u8, index: u64) -> Self {
        Self { level, index }
    }

    pub fn from_coords(level: u8, xyz: [u64; 3]) -> Self {
        let mut vi = Self { level, index: 0 };
        vi.set_index(xyz);
        vi
    }

    /// Corners per axis at this level.
    pub fn dim(&self) -> u64 {
        (1u64 << self.level) + 1
    }

    pub fn set_index(&mut self, xyz: [u64; 3]) {
        let dim = self.dim();
        self.index = xyz[0] + xyz[1] * dim + xyz[2] * dim * dim;
    }

    /// Splits the linear index into its axis coordinates.
    pub fn factor_index(&self) -> [u64; 3] {
        let dim = self.dim();
        [
            self.index % dim,
            (self.index / dim) % dim,
            (self.index / (dim * dim)) % dim,
        ]
    }

    /// Returns the index of the coincident corner one level deeper.
    pub fn descend(&self) -> Self {
        let xyz = self.factor_index();
        Self::from_coords(self.level + 1, [xyz[0] * 2, xyz[1] * 2, xyz[2] * 2])
    }

    /// Returns the same-level neighbor at the given offset. Underflow
    /// saturates at coordinate zero, there is no wrap-around.
    pub fn navigate(&self, x: i64, y: i64, z: i64) -> Self {
        let xyz = self.factor_index();
        let offset = [x, y, z];
        let mut out = [0u64; 3];
        for i in 0..3 {
            out[i] = if offset[i] < 0 && offset[i].unsigned_abs() > xyz[i] {
                0
            } else {
                xyz[i].wrapping_add_signed(offset[i])
            };
        }
        Self::from_coords(self.level, out)
    }

    /// Tests whether two voxels, possibly on different levels, address
    /// nearby corners. The coarser index is lifted to the finer level and
    /// the per-axis distance compared against `(1 << delta) + 2`.
    pub fn is_neighbor(&self, other: &Self) -> bool {
        if self.level < other.level {
            return other.is_neighbor(self);
        }

        let mut oi = other.factor_index();
        let ti = self.factor_index();

        let level_delta = self.level - other.level;
        let off = (1u64 << level_delta) + 2;
        for i in 0..3 {
            oi[i] <<= level_delta;
            if ti[i] + off < oi[i] || oi[i] + off < ti[i] {
                return false;
            }
        }
        true
    }

    /// World position of this corner in a root cube given by center and
    /// halfsize.
    pub fn position(&self, center: Vec3, halfsize: f32) -> Vec3 {
        let dim = self.dim();
        let xyz = self.factor_index();
        let origin = center - Vec3::splat(halfsize);
        let fullsize = 2.0 * halfsize;
        Vec3::new(
            origin.x + fullsize * (xyz[0] as f32 / (dim - 1) as f32),
            origin.y + fullsize * (xyz[1] as f32 / (dim - 1) as f32),
            origin.z + fullsize * (xyz[2] as f32 / (dim - 1) as f32),
        )
    }

    /// Globally unique corner id, normalized to [`MAX_LEVEL`]. Coincident
    /// corners on different levels share the same id.
    pub fn corner_id(&self) -> u64 {
        let shift = MAX_LEVEL - self.level;
        let xyz = self.factor_index();
        let dim = (1u64 << MAX_LEVEL) + 1;
        (xyz[0] << shift) + (xyz[1] << shift) * dim + (xyz[2] << shift) * dim * dim
    }
}

/// Voxel payload of the depth-map fusion octree. `weight == 0` means the
/// voxel is unset. Negative distances are inside the surface.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DmfVoxel {
    pub dist: f32,
    pub weight: f32,
    /// RGB in the first three channels; the alpha channel accumulates the
    /// color blending weight.
    pub color: Vec4,
}

impl Default for DmfVoxel {
    fn default() -> Self {
        Self {
            dist: 0.0,
            weight: 0.0,
            color: Vec4::ZERO,
        }
    }
}

/// Voxel payload of the floating-scale octree: sampled implicit function
/// value, accumulated confidence, blended color and interpolated scale.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FssrVoxel {
    pub value: f32,
    pub confidence: f32,
    pub color: Vec3,
    pub scale: f32,
}

impl Default for FssrVoxel {
    fn default() -> Self {
        Self {
            value: 0.0,
            confidence: 0.0,
            color: Vec3::ZERO,
            scale: 0.0,
        }
    }
}
