pub mod off;
pub mod ply;

pub use off::{load_off_mesh, save_off_mesh};
pub use ply::{load_ply_pointset, save_ply_mesh, PointsetOptions, SavePlyOptions};
