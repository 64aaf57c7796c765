use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use md5::{Digest, Md5};

use crate::config::ConfigStore;
use crate::jobs;
use crate::persistence::PersistenceGateway;

const MB: u64 = 1024 * 1024;

/// Moves, renames and marks a completed download. Lives outside this crate.
#[async_trait]
pub trait PostProcessor: Send + Sync {
    async fn process(&self, path: &Path, guid: &str) -> anyhow::Result<()>;
}

pub struct LogOnly;

#[async_trait]
impl PostProcessor for LogOnly {
    async fn process(&self, path: &Path, guid: &str) -> anyhow::Result<()> {
        log::info!("Would post-process {path:?} as {guid}");
        Ok(())
    }
}

/// Which directory entries a scan picks up.
#[derive(Debug, Default)]
struct Selection {
    min_bytes: u64,
    modified_after: Option<DateTime<Utc>>,
    skip: HashSet<PathBuf>,
}

impl Selection {
    fn accepts(&self, path: &Path, meta: &fs::Metadata) -> io::Result<bool> {
        if self.skip.contains(path) {
            return Ok(false);
        }
        if let Some(after) = self.modified_after {
            if DateTime::<Utc>::from(meta.modified()?) <= after {
                return Ok(false);
            }
        }
        Ok(meta.is_dir() || (meta.is_file() && meta.len() > self.min_bytes))
    }
}

fn candidates(dir: &Path, selection: &Selection) -> io::Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let accepted = fs::metadata(&path).and_then(|meta| selection.accepts(&path, &meta));
        match accepted {
            Ok(true) => found.push(path),
            Ok(false) => {}
            Err(err) => log::warn!("Skipping {path:?}: {err}"),
        }
    }
    found.sort();
    Ok(found)
}

/// Guid for a file no search result matches, derived from its name only.
fn synthetic_guid(name: &str) -> String {
    let ascii: String = name.chars().filter(char::is_ascii).collect();
    format!("postprocessing{:x}", Md5::digest(ascii.as_bytes()))
}

/// The `PostProcessing Scan` task.
pub struct DirectoryScan {
    config: Arc<ConfigStore>,
    gateway: Arc<dyn PersistenceGateway>,
    processor: Arc<dyn PostProcessor>,
}

impl DirectoryScan {
    pub fn new(
        config: Arc<ConfigStore>,
        gateway: Arc<dyn PersistenceGateway>,
        processor: Arc<dyn PostProcessor>,
    ) -> Self {
        DirectoryScan {
            config,
            gateway,
            processor,
        }
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        let cfg = self.config.snapshot();
        let scanner = &cfg.postprocessing.scanner;
        log::info!("Scanning {:?} for movies to process", scanner.directory);

        let mut selection = Selection {
            min_bytes: scanner.minsize * MB,
            ..Selection::default()
        };
        if scanner.newfilesonly {
            let Some(last) = self.gateway.last_execution(jobs::POSTPROCESSING_SCAN)? else {
                log::warn!("Unable to scan directory, last scan timestamp unknown");
                return Ok(());
            };
            log::info!("Scanning for new files only (last scan: {last})");
            selection.modified_after = Some(last);
            selection.skip = self.gateway.postprocessed_paths()?.into_iter().collect();
        }

        let files = candidates(&scanner.directory, &selection)
            .with_context(|| format!("Unable to list {:?}", scanner.directory))?;
        if files.is_empty() {
            log::info!("No new files found in directory scan");
            return Ok(());
        }

        for path in files {
            let guid = self.guid_for(&path)?;
            log::info!("Processing {path:?}");
            if let Err(err) = self.processor.process(&path, &guid).await {
                log::error!("Unable to post-process {path:?}: {err:#}");
            }
        }

        self.gateway.clear_postprocessed_paths()?;
        Ok(())
    }

    fn guid_for(&self, path: &Path) -> anyhow::Result<String> {
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        match self.gateway.find_result_by_title(&name)? {
            Some(result) => {
                log::info!("Found match for {name} in releases: {}", result.title);
                Ok(result.guid)
            }
            None => {
                log::info!(
                    "Unable to find match in database for {name}, release cannot be marked as Finished"
                );
                Ok(synthetic_guid(&name))
            }
        }
    }
}

/// The `Postprocessed Paths Scan` task: forgets recorded paths that are gone.
pub fn prune_paths(gateway: &dyn PersistenceGateway) -> anyhow::Result<()> {
    for path in gateway.postprocessed_paths()? {
        if !path.exists() {
            log::debug!("Forgetting postprocessed path {path:?}");
            gateway.remove_postprocessed_path(&path)?;
        }
    }
    Ok(())
}
