use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::container::manifest::Manifest;
use crate::interpolate::Elevation;
use crate::pipeline::{self, PipelineOptions, PipelineReport};
use crate::prepare_feed_as_rkyv;

pub struct ContainerPaths {
    pub output: PathBuf,
    pub manifest: PathBuf,
}

impl ContainerPaths {
    /// `output` with the manifest next to it, sharing its file stem.
    pub fn next_to(output: &Path) -> Self {
        ContainerPaths {
            output: output.to_path_buf(),
            manifest: output.with_extension("json"),
        }
    }
}

/// Builds the playback container for the feed in `feed_folder_path` and writes it
/// together with its manifest.
///
/// Nothing is written unless the whole container encoded successfully.
pub async fn prepare_container<E>(
    feed_folder_path: &Path,
    paths: &ContainerPaths,
    elevation: &E,
    options: &PipelineOptions,
    use_cache: bool,
) -> Result<PipelineReport>
where
    E: Elevation + Sync + ?Sized,
{
    let feed = prepare_feed_as_rkyv::load_feed_folder(feed_folder_path, use_cache)
        .await
        .with_context(|| format!("Failed to load feed from {:?}", feed_folder_path))?;

    let output = pipeline::run(&feed, elevation, options)?;
    let layout = &output.container.layout;

    for path in [&paths.output, &paths.manifest] {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
    }

    log::info!(
        "Writing {} bytes to {:?} (shared prefix {} bytes)",
        layout.total_size,
        paths.output,
        layout.shared_prefix_size()
    );
    tokio::fs::write(&paths.output, &output.container.bytes)
        .await
        .with_context(|| format!("Failed to write {:?}", paths.output))?;

    let manifest = Manifest::new(layout, &output.report, chrono::Utc::now());
    log::info!("Writing manifest to {:?}", paths.manifest);
    tokio::fs::write(&paths.manifest, manifest.to_json()?)
        .await
        .with_context(|| format!("Failed to write {:?}", paths.manifest))?;

    Ok(output.report)
}
