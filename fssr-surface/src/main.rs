use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;

use strata::dmfusion::{DmfMcAccessor, DmfOctree};
use strata::io::ply::{save_ply_mesh, SavePlyOptions};
use strata::iso::marching_cubes;
use strata::mesh::remove_small_components;
use strata::TriangleMesh;

struct AppSettings {
    in_octree: PathBuf,
    out_mesh: PathBuf,
    conf_threshold: f32,
    component_size: usize,
    clean_degenerated: bool,
}

fn print_usage(program: &str) {
    eprintln!("Usage: {program} [ OPTS ] IN_OCTREE OUT_PLY_MESH");
    eprintln!();
    eprintln!("Extracts the isosurface from the sampled implicit function of an");
    eprintln!("input octree. The accumulated weights in the octree can be");
    eprintln!("thresholded to extract reliable parts of the geometry only.");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  -t FLOAT    Threshold on the geometry confidence [1.0]");
    eprintln!("  -c INT      Minimum number of vertices per component [1000]");
    eprintln!("  -n          Prevents cleanup of degenerated faces");
}

fn parse_args() -> Option<AppSettings> {
    let program = std::env::args()
        .next()
        .unwrap_or_else(|| "fssr_surface".into());
    let mut files: Vec<PathBuf> = Vec::new();
    let mut conf_threshold = 1.0f32;
    let mut component_size = 1000usize;
    let mut clean_degenerated = true;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-t" => conf_threshold = args.next()?.parse().ok()?,
            "-c" => component_size = args.next()?.parse().ok()?,
            "-n" => clean_degenerated = false,
            other if other.starts_with('-') => {
                eprintln!("Invalid option: {other}");
                print_usage(&program);
                return None;
            }
            other => files.push(PathBuf::from(other)),
        }
    }

    if files.len() != 2 {
        print_usage(&program);
        return None;
    }
    let out_mesh = files.pop().unwrap();
    let in_octree = files.pop().unwrap();

    Some(AppSettings {
        in_octree,
        out_mesh,
        conf_threshold,
        component_size,
        clean_degenerated,
    })
}

fn remove_low_conf_geometry(mesh: &mut TriangleMesh, threshold: f32) -> strata::Result<()> {
    let delete_list: Vec<bool> = mesh
        .vertex_confidences
        .iter()
        .map(|&conf| conf <= threshold)
        .collect();
    let num_deleted = delete_list.iter().filter(|&&del| del).count();
    mesh.delete_vertices_fix_faces(&delete_list)?;
    println!("Deleted {num_deleted} low-confidence vertices.");
    Ok(())
}

/// Extracts the mesh from the deepest occupied octree level.
fn extract_mesh(octree: &DmfOctree) -> TriangleMesh {
    let deepest = octree
        .voxels()
        .keys()
        .map(|vi| vi.level)
        .max()
        .unwrap_or(0);
    let mut accessor = DmfMcAccessor::new(octree, deepest);
    let mut mesh = marching_cubes(&mut accessor);

    // Confidences from the voxel weights along the surface.
    let mut confidences = Vec::with_capacity(mesh.num_vertices());
    for vertex in &mesh.vertices {
        confidences.push(nearest_voxel_weight(octree, deepest, *vertex));
    }
    mesh.vertex_confidences = confidences;
    mesh
}

fn nearest_voxel_weight(octree: &DmfOctree, level: u8, pos: glam::Vec3) -> f32 {
    let dim = 1u64 << level;
    let fdim = dim as f32;
    let relative = (pos - octree.aabb_min()) / (2.0 * octree.halfsize());
    let coords = [
        ((relative.x * fdim).round().max(0.0) as u64).min(dim),
        ((relative.y * fdim).round().max(0.0) as u64).min(dim),
        ((relative.z * fdim).round().max(0.0) as u64).min(dim),
    ];
    let vi = strata::VoxelIndex::from_coords(level, coords);
    octree.find_voxel(&vi).map_or(0.0, |voxel| voxel.weight)
}

fn run(conf: &AppSettings) -> strata::Result<bool> {
    println!("Octree input file: {}", conf.in_octree.display());
    let timer = Instant::now();
    let mut octree = DmfOctree::new();
    octree.load(&conf.in_octree)?;
    println!(
        "Loading octree took {}ms, contains {} voxels.",
        timer.elapsed().as_millis(),
        octree.voxels().len()
    );

    // Coincident voxels on multiple levels disturb the extraction.
    let num_twins = octree.remove_twins();
    if num_twins > 0 {
        println!("Removed {num_twins} twin voxels.");
    }

    let timer = Instant::now();
    let mut mesh = extract_mesh(&octree);
    octree.clear();
    println!("Mesh extraction took {}ms.", timer.elapsed().as_millis());

    if mesh.vertices.is_empty() {
        eprintln!("Isosurface does not contain any vertices.");
        return Ok(false);
    }

    println!(
        "Removing low-confidence geometry (threshold {})...",
        conf.conf_threshold
    );
    remove_low_conf_geometry(&mut mesh, conf.conf_threshold)?;

    if conf.component_size > 0 {
        println!(
            "Removing isolated components with < {} vertices...",
            conf.component_size
        );
        let num_deleted = remove_small_components(&mut mesh, conf.component_size);
        println!("Deleted {num_deleted} vertices in isolated regions.");
    }

    if conf.clean_degenerated {
        mesh.delete_invalid_faces();
    }

    if mesh.vertices.is_empty() || mesh.faces.is_empty() {
        eprintln!("Mesh is empty after cleanup.");
        return Ok(false);
    }

    let ply_opts = SavePlyOptions {
        write_vertex_colors: true,
        write_vertex_confidences: true,
        ..Default::default()
    };
    println!("Mesh output file: {}", conf.out_mesh.display());
    save_ply_mesh(&mesh, &conf.out_mesh, &ply_opts)?;

    Ok(true)
}

fn main() -> ExitCode {
    env_logger::init();

    let Some(conf) = parse_args() else {
        return ExitCode::FAILURE;
    };

    match run(&conf) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(error) => {
            eprintln!("Error: {error}");
            ExitCode::FAILURE
        }
    }
}
