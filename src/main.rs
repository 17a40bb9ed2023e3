use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use log::LevelFilter;
use simple_logger::SimpleLogger;

use transit_playback::container::decode::ContainerIndex;
use transit_playback::container::hour_bucket;
use transit_playback::feed_rkyv::parse_feed_time;
use transit_playback::interpolate::{FlatElevation, InterpolationOptions, DEFAULT_ELEVATION};
use transit_playback::pipeline::PipelineOptions;
use transit_playback::prepare_container::{prepare_container, ContainerPaths};
use transit_playback::prepare_feed_as_rkyv;

#[derive(Parser, Debug)]
#[command(name = "transit-playback", author, version, about, long_about = None)]
struct Cli {
    /// Also log every skipped trip and failed lookup
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Build a playback container from a GTFS folder
    Encode {
        feed_dir: PathBuf,
        #[arg(short, long, default_value = "playback.bin")]
        output: PathBuf,
        /// Manifest path, defaults to the output path with a .json extension
        #[arg(long)]
        manifest: Option<PathBuf>,
        /// Elevation in meters given to every waypoint
        #[arg(long, default_value_t = DEFAULT_ELEVATION)]
        flat_elevation: f64,
        /// Connect the stops directly for trips without a usable shape
        #[arg(long)]
        stop_geometry_fallback: bool,
        /// Parse the feed files even if a cached copy exists
        #[arg(long)]
        no_cache: bool,
        /// Interpolate on a single thread
        #[arg(long)]
        sequential: bool,
    },
    /// Build or refresh the cached copy of a GTFS folder
    Cache { feed_dir: PathBuf },
    /// Print the tables and chunk index of a container
    Inspect {
        file: PathBuf,
        /// Also decode the trips of this hour bucket
        #[arg(long, conflicts_with = "at")]
        hour: Option<u32>,
        /// Also decode the trips of the bucket containing this feed time (HH:MM:SS)
        #[arg(long, value_parser = parse_time_arg)]
        at: Option<u32>,
    },
}

fn parse_time_arg(value: &str) -> Result<u32> {
    parse_feed_time(value).ok_or_else(|| anyhow!("Expected a time like 08:15:00, got {value:?}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    SimpleLogger::new()
        .with_level(if cli.verbose {
            LevelFilter::Debug
        } else {
            LevelFilter::Info
        })
        .env()
        .init()?;

    match cli.command {
        Commands::Encode {
            feed_dir,
            output,
            manifest,
            flat_elevation,
            stop_geometry_fallback,
            no_cache,
            sequential,
        } => {
            let mut paths = ContainerPaths::next_to(&output);
            if let Some(manifest) = manifest {
                paths.manifest = manifest;
            }
            let options = PipelineOptions {
                interpolation: InterpolationOptions {
                    stop_geometry_fallback,
                },
                parallel: !sequential,
            };
            let report = prepare_container(
                &feed_dir,
                &paths,
                &FlatElevation(flat_elevation),
                &options,
                !no_cache,
            )
            .await?;
            log::info!(
                "Encoded {} of {} trips into {:?}",
                report.trips_encoded,
                report.load.trips,
                paths.output
            );
        }
        Commands::Cache { feed_dir } => {
            let path = prepare_feed_as_rkyv::write_feed_folder_rkyv(&feed_dir).await?;
            log::info!("Feed cached at {:?}", path);
        }
        Commands::Inspect { file, hour, at } => {
            let bytes = tokio::fs::read(&file)
                .await
                .with_context(|| format!("Failed to read {:?}", file))?;
            let index = ContainerIndex::parse(&bytes)?;
            let hour = hour.or(at.map(hour_bucket));
            let trips = hour
                .map(|hour| index.trips_in_hour(&bytes, hour))
                .transpose()?;
            let summary = serde_json::json!({
                "format_version": index.header.version.get(),
                "file_size": bytes.len(),
                "shared_prefix_size": index.shared_prefix_size,
                "shapes": index.shapes.len(),
                "shape_points": index.shapes.iter().map(Vec::len).sum::<usize>(),
                "routes": index.routes,
                "headsigns": index.headsigns,
                "chunks": index.chunks,
                "hour": hour,
                "trips": trips,
            });
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
    }

    Ok(())
}
