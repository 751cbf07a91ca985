use anyhow::Result;
use clap::{Parser, Subcommand};
use regolith::TileGeometry;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;

use commands::{DetectionArgs, ExportArgs, MeshArgs, StoreOptions};

/// Planetary heightmap crater detection and terrain mesh conversion
#[derive(Parser)]
#[command(name = "regolith")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Directory containing .pgm tiles
    #[arg(short, long, env = "REGOLITH_DATA_DIR", global = true)]
    data_dir: Option<PathBuf>,

    /// Maximum tiles in memory
    #[arg(
        short,
        long,
        env = "REGOLITH_CACHE_SIZE",
        default_value = "8",
        global = true
    )]
    cache_size: u64,

    /// Download missing tiles from the THEMIS archive
    #[arg(short, long, global = true)]
    auto_download: bool,

    /// Ground distance between samples for tiles without header metadata
    #[arg(long, env = "REGOLITH_KM_PER_SAMPLE", default_value_t = 0.1, global = true)]
    km_per_sample: f64,

    /// Elevation per sample unit for tiles without header metadata
    #[arg(long, env = "REGOLITH_ELEVATION_KM_PER_UNIT", default_value_t = 0.01, global = true)]
    elevation_km_per_unit: f64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Detect craters in one tile
    Detect {
        /// Path to a .pgm file, or tile name (e.g., lat-30_lon000)
        tile: Option<String>,

        /// Specify tile by latitude instead of filename
        #[arg(long, conflicts_with = "tile", requires = "lon", allow_hyphen_values = true)]
        lat: Option<i32>,

        /// Specify tile by longitude instead of filename
        #[arg(long, conflicts_with = "tile", requires = "lat")]
        lon: Option<i32>,

        /// Directory for the CSV, statistics and overlay
        #[arg(short, long, default_value = ".")]
        output_dir: PathBuf,

        /// Skip the overlay image
        #[arg(long)]
        no_overlay: bool,

        /// Print statistics as JSON
        #[arg(short, long)]
        json: bool,

        #[command(flatten)]
        detection: DetectionArgs,
    },

    /// Convert one tile into a decimated terrain mesh
    Convert {
        /// Path to a .pgm file, or tile name (e.g., lat-30_lon000)
        tile: Option<String>,

        /// Specify tile by latitude instead of filename
        #[arg(long, conflicts_with = "tile", requires = "lon", allow_hyphen_values = true)]
        lat: Option<i32>,

        /// Specify tile by longitude instead of filename
        #[arg(long, conflicts_with = "tile", requires = "lat")]
        lon: Option<i32>,

        /// Output file (defaults to <tile>.glb, or <tile>.obj with --obj-only)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Write the OBJ interchange file and skip the external converters
        #[arg(long)]
        obj_only: bool,

        /// Print the conversion report as JSON
        #[arg(short, long)]
        json: bool,

        #[command(flatten)]
        mesh: MeshArgs,

        #[command(flatten)]
        export: ExportArgs,
    },

    /// Detect and convert many tiles
    Batch {
        /// CSV file listing cells to process
        #[arg(required_unless_present = "all")]
        input: Option<PathBuf>,

        /// Process every tile in the data directory
        #[arg(long, conflicts_with = "input")]
        all: bool,

        /// Column name for latitude
        #[arg(long, default_value = "lat")]
        lat_col: String,

        /// Column name for longitude
        #[arg(long, default_value = "lon")]
        lon_col: String,

        /// Directory for per-tile outputs
        #[arg(short, long, default_value = ".")]
        output_dir: PathBuf,

        /// Mesh artifact to produce per tile
        #[arg(long, value_enum, default_value_t = commands::batch::MeshMode::Glb)]
        mesh: commands::batch::MeshMode,

        /// Parallel downloads when fetching missing tiles
        #[arg(long, default_value_t = 4)]
        workers: usize,

        /// Skip the overlay images
        #[arg(long)]
        no_overlay: bool,

        /// Print the batch summary as JSON
        #[arg(short, long)]
        json: bool,

        #[command(flatten)]
        detection: DetectionArgs,

        #[command(flatten)]
        mesh_args: MeshArgs,

        #[command(flatten)]
        export: ExportArgs,
    },

    /// Summarize crater tables
    Stats {
        /// Candidate CSV files
        #[arg(required = true)]
        inputs: Vec<PathBuf>,

        /// Surveyed area per file, for crater density
        #[arg(long)]
        area_km2: Option<f64>,

        /// Write the per-file summary CSV here
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Print statistics as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Compare two crater tables
    Compare {
        /// Baseline candidate CSV (e.g., a coarse survey)
        baseline: PathBuf,

        /// Reference candidate CSV (e.g., a high-resolution catalogue)
        reference: PathBuf,

        /// Surveyed area of the baseline
        #[arg(long)]
        baseline_area_km2: Option<f64>,

        /// Surveyed area of the reference
        #[arg(long)]
        reference_area_km2: Option<f64>,

        /// Write the comparison CSV here
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Print the comparison as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Display information about a tile
    Info {
        /// Path to a .pgm file, or tile name (e.g., lat-30_lon000)
        tile: Option<String>,

        /// Specify tile by latitude instead of filename
        #[arg(long, conflicts_with = "tile", requires = "lon", allow_hyphen_values = true)]
        lat: Option<i32>,

        /// Specify tile by longitude instead of filename
        #[arg(long, conflicts_with = "tile", requires = "lat")]
        lon: Option<i32>,
    },

    /// List tiles in the data directory
    List,
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "regolith=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let store = StoreOptions {
        data_dir: cli.data_dir,
        cache_size: cli.cache_size,
        auto_download: cli.auto_download,
        geometry: TileGeometry::new(cli.km_per_sample, cli.elevation_km_per_unit),
    };

    match cli.command {
        Commands::Detect {
            tile,
            lat,
            lon,
            output_dir,
            no_overlay,
            json,
            detection,
        } => commands::detect::run(
            &store,
            commands::tile_ref(tile, lat, lon)?,
            output_dir,
            !no_overlay,
            json,
            &detection,
        ),
        Commands::Convert {
            tile,
            lat,
            lon,
            output,
            obj_only,
            json,
            mesh,
            export,
        } => commands::convert::run(
            &store,
            commands::tile_ref(tile, lat, lon)?,
            output,
            obj_only,
            json,
            &mesh,
            &export,
        ),
        Commands::Batch {
            input,
            all,
            lat_col,
            lon_col,
            output_dir,
            mesh,
            workers,
            no_overlay,
            json,
            detection,
            mesh_args,
            export,
        } => commands::batch::run(
            &store,
            commands::batch::CellSource::from_args(input, all, lat_col, lon_col),
            commands::batch::BatchArgs {
                output_dir,
                mesh_mode: mesh,
                workers,
                write_overlay: !no_overlay,
                json,
            },
            &detection,
            &mesh_args,
            &export,
        ),
        Commands::Stats {
            inputs,
            area_km2,
            output,
            json,
        } => commands::stats::run(&inputs, area_km2, output, json),
        Commands::Compare {
            baseline,
            reference,
            baseline_area_km2,
            reference_area_km2,
            output,
            json,
        } => commands::compare::run(
            &baseline,
            &reference,
            baseline_area_km2,
            reference_area_km2,
            output,
            json,
        ),
        Commands::Info { tile, lat, lon } => {
            commands::info::run(&store, commands::tile_ref(tile, lat, lon)?)
        }
        Commands::List => commands::list::run(&store),
    }
}
