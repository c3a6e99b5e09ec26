mod accessor;
mod octree;

pub use accessor::{DmfMcAccessor, DmfMtAccessor};
pub use octree::{DmfOctree, OctreeTriangle, SliceImage, VoxelMap};
