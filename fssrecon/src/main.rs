use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;

use strata::fssr::FssrOctree;
use strata::io::ply::{load_ply_pointset, save_ply_mesh, PointsetOptions, SavePlyOptions};
use strata::iso::extract_isosurface;

struct AppSettings {
    in_files: Vec<PathBuf>,
    out_mesh: PathBuf,
    scale_factor: f32,
    refine_octree: u32,
    skip_samples: usize,
}

fn print_usage(program: &str) {
    eprintln!("Usage: {program} [ OPTS ] IN_PLY [ IN_PLY ... ] OUT_PLY");
    eprintln!();
    eprintln!("Samples the implicit function defined by the input samples and");
    eprintln!("produces a surface mesh. The input samples must have normals and");
    eprintln!("the \"value\" PLY attribute (the scale of the samples). Confidence");
    eprintln!("values and vertex colors are optional.");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  -s FACTOR   Multiply sample scale with factor [1.0]");
    eprintln!("  -r LEVELS   Refine octree with N levels [0]");
    eprintln!("  -k NUM      Skip input samples [0]");
}

fn parse_args() -> Option<AppSettings> {
    let program = std::env::args().next().unwrap_or_else(|| "fssrecon".into());
    let mut files: Vec<PathBuf> = Vec::new();
    let mut scale_factor = 1.0f32;
    let mut refine_octree = 0u32;
    let mut skip_samples = 0usize;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-s" => scale_factor = args.next()?.parse().ok()?,
            "-r" => refine_octree = args.next()?.parse().ok()?,
            "-k" => skip_samples = args.next()?.parse().ok()?,
            other if other.starts_with('-') => {
                eprintln!("Invalid option: {other}");
                print_usage(&program);
                return None;
            }
            other => files.push(PathBuf::from(other)),
        }
    }

    if files.len() < 2 {
        print_usage(&program);
        return None;
    }
    let out_mesh = files.pop().unwrap();

    if refine_octree > 3 {
        eprintln!("Unreasonable refine level of {refine_octree}, exiting.");
        return None;
    }

    Some(AppSettings {
        in_files: files,
        out_mesh,
        scale_factor,
        refine_octree,
        skip_samples,
    })
}

fn run(conf: &AppSettings) -> strata::Result<bool> {
    let mut octree = FssrOctree::new();

    // Load all input point sets and insert the samples.
    for file in &conf.in_files {
        println!("Loading: {}...", file.display());
        let options = PointsetOptions {
            scale_factor: conf.scale_factor,
            skip_samples: conf.skip_samples,
        };
        let samples = load_ply_pointset(file, &options)?;

        let timer = Instant::now();
        octree.insert_samples(&samples);
        println!(
            "Inserted {} samples, took {}ms.",
            samples.len(),
            timer.elapsed().as_millis()
        );
    }

    // Each refinement round adds one level of voxels.
    if conf.refine_octree > 0 {
        let timer = Instant::now();
        for _ in 0..conf.refine_octree {
            octree.refine_octree();
        }
        println!("Refining octree took {}ms.", timer.elapsed().as_millis());
    }

    // Inner octree nodes must have exactly eight children.
    {
        let timer = Instant::now();
        octree.make_regular_octree();
        println!(
            "Regularizing octree took {}ms.",
            timer.elapsed().as_millis()
        );
    }

    println!(
        "Octree stats: {} samples in {} nodes.",
        octree.num_samples(),
        octree.num_nodes()
    );

    let timer = Instant::now();
    octree.compute_voxels();
    println!(
        "Computed {} voxels, took {}ms.",
        octree.voxels().len(),
        timer.elapsed().as_millis()
    );

    let mut mesh = extract_isosurface(&octree);
    octree.clear();

    if mesh.vertices.is_empty() {
        eprintln!("Isosurface does not contain any vertices.");
        return Ok(false);
    }

    // Surfaces between voxels with zero confidence are ghosts.
    {
        let timer = Instant::now();
        let delete_list: Vec<bool> = mesh
            .vertex_confidences
            .iter()
            .map(|&conf| conf == 0.0)
            .collect();
        mesh.delete_vertices_fix_faces(&delete_list)?;
        println!(
            "Deleted zero-confidence vertices, took {}ms.",
            timer.elapsed().as_millis()
        );
    }

    let ply_opts = SavePlyOptions {
        write_vertex_colors: true,
        write_vertex_confidences: true,
        write_vertex_values: true,
        ..Default::default()
    };
    println!("Mesh output file: {}", conf.out_mesh.display());
    save_ply_mesh(&mesh, &conf.out_mesh, &ply_opts)?;

    println!();
    println!("All done. Remember to clean the output mesh.");
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
