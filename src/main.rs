use std::{path::PathBuf, process::ExitCode, sync::Arc};

use clap::{Parser, Subcommand};
use log::{error, info};
use rand::{rngs::StdRng, SeedableRng};

use resonite::{
    config::{load_config, DatasetConfig},
    dataset::{generate_random_dataset, DatasetLoader, INDEX_MAP_FILE},
    error::Result,
    material::{Material, MaterialRanges},
    mesher::create_mesh,
    modal::ModalSystem,
    post_processor,
    shape::parse_csv,
};

/// Modal plate dataset generator
#[derive(Debug, Parser)]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Generate a random dataset of shapes and materials.
    Generate {
        /// JSON config file; command line flags override it.
        #[arg(long)]
        config: Option<String>,
        #[arg(long)]
        n_shapes: Option<usize>,
        #[arg(long)]
        n_materials: Option<usize>,
        /// Vertices per random shape.
        #[arg(long)]
        n_vertices: Option<usize>,
        #[arg(long)]
        n_modes: Option<usize>,
        #[arg(long)]
        n_refinements: Option<usize>,
        #[arg(long)]
        scale_factor: Option<f64>,
        /// Square occupancy map resolution.
        #[arg(long)]
        resolution: Option<usize>,
        /// Index boundary nodes as well as interior ones.
        #[arg(long)]
        all_nodes: bool,
        #[arg(long)]
        data_dir: Option<PathBuf>,
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Render one dataset sample to a WAV file.
    Render {
        #[arg(long)]
        index_map: PathBuf,
        /// Index map row to render.
        #[arg(long)]
        row: usize,
        /// Audio length in seconds.
        #[arg(long, default_value_t = 0.3)]
        length: f64,
        #[arg(long, default_value_t = 16000)]
        sample_rate: u32,
        /// JSON config holding the material ranges the dataset was built with.
        #[arg(long)]
        config: Option<String>,
        #[arg(long)]
        output: String,
    },
    /// Solve one shape and write its mode table.
    Modes {
        /// CSV with x and y columns.
        #[arg(long)]
        geometry: String,
        #[arg(long, default_value = "ceramic")]
        material: String,
        #[arg(long, default_value_t = 32)]
        n_modes: usize,
        #[arg(long, default_value_t = 3)]
        n_refinements: usize,
        #[arg(long, default_value = "modes.csv")]
        output: String,
        /// Also write per-node mode gains to this CSV.
        #[arg(long)]
        shapes_output: Option<String>,
    },
}

fn main() -> ExitCode {
    env_logger::builder()
        .filter_module("resonite", log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let args = Args::parse();

    match run(args.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            ExitCode::FAILURE
        }
    }
}

fn run(command: Command) -> Result<()> {
    match command {
        Command::Generate {
            config,
            n_shapes,
            n_materials,
            n_vertices,
            n_modes,
            n_refinements,
            scale_factor,
            resolution,
            all_nodes,
            data_dir,
            seed,
        } => {
            let mut config = match config {
                Some(path) => load_config(&path)?,
                None => DatasetConfig::default(),
            };

            config.n_shapes = n_shapes.unwrap_or(config.n_shapes);
            config.n_materials = n_materials.unwrap_or(config.n_materials);
            config.n_vertices = n_vertices.unwrap_or(config.n_vertices);
            config.n_modes = n_modes.unwrap_or(config.n_modes);
            config.n_refinements = n_refinements.unwrap_or(config.n_refinements);
            config.scale_factor = scale_factor.unwrap_or(config.scale_factor);
            if let Some(r) = resolution {
                config.resolution = (r, r);
            }
            if all_nodes {
                config.without_boundary_nodes = false;
            }
            if let Some(dir) = data_dir {
                config.data_dir = dir;
            }
            config.seed = seed.or(config.seed);
            config.validate()?;

            let mut rng = match config.seed {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::from_entropy(),
            };

            let summary = generate_random_dataset(
                config.n_shapes,
                config.n_materials,
                config.n_vertices,
                &config,
                &mut rng,
            )?;
            info!(
                "{} records and {} samples in {}",
                summary.records,
                summary.index_rows,
                config.data_dir.join(INDEX_MAP_FILE).display()
            );
            Ok(())
        }
        Command::Render {
            index_map,
            row,
            length,
            sample_rate,
            config,
            output,
        } => {
            let ranges = match config {
                Some(path) => load_config(&path)?.material_ranges,
                None => MaterialRanges::default(),
            };
            let loader = DatasetLoader::open(&index_map, length, sample_rate as f64, ranges)?;
            let sample = loader.sample(row)?;
            info!(
                "sample {row}: node at ({:.4}, {:.4})",
                sample.coords[0], sample.coords[1]
            );
            post_processor::wav_output(&sample.audio, sample_rate, &output)
        }
        Command::Modes {
            geometry,
            material,
            n_modes,
            n_refinements,
            output,
            shapes_output,
        } => {
            let polygon = parse_csv(&geometry)?;
            let mesh = Arc::new(create_mesh(&polygon, n_refinements)?);
            let material = Material::preset(&material)?;

            let mut system = ModalSystem::new(material, mesh.clone(), n_modes);
            system.solve()?;

            post_processor::mode_table_output(
                system.eigenvalues()?,
                &system.frequencies()?,
                &system.damped_frequencies()?,
                &system.damping_coefficients()?,
                &output,
            )?;

            if let Some(path) = shapes_output {
                let gains = system.all_mode_gains()?;
                post_processor::mode_shapes_output(&mesh, &gains, &path)?;
            }

            Ok(())
        }
    }
}
