mod adaptive;
mod marching;
pub mod tables;

pub use adaptive::extract_isosurface;
pub use marching::{marching_cubes, marching_tetrahedra, CubeAccessor, TetAccessor};
