//! The hourly torrent status check: removes finished torrents once they are
//! post-processed and replaces stalled ones.

use std::sync::Arc;

use crate::config::{BackendPolicy, Config, ConfigStore};
use crate::downloader::{timed, DownloaderClient, Registry, SharedRegistry, TorrentRecord};
use crate::error::ReconcileError;
use crate::monitor::DownloadMonitor;
use crate::persistence::{PersistenceGateway, ProgressMap, RowQuery};
use crate::snatch::{snatch, SnatchArbiter};
use crate::stall::TorrentStatus;
use crate::ResultStatus;

pub struct Reconciler {
    config: Arc<ConfigStore>,
    registry: Arc<SharedRegistry>,
    gateway: Arc<dyn PersistenceGateway>,
    monitor: DownloadMonitor,
    arbiter: Arc<dyn SnatchArbiter>,
}

impl Reconciler {
    pub fn new(
        config: Arc<ConfigStore>,
        registry: Arc<SharedRegistry>,
        gateway: Arc<dyn PersistenceGateway>,
        arbiter: Arc<dyn SnatchArbiter>,
    ) -> Self {
        Reconciler {
            config,
            registry,
            monitor: DownloadMonitor::new(gateway.clone()),
            gateway,
            arbiter,
        }
    }

    /// One pass over the current config and backends.
    pub async fn run(&self) -> anyhow::Result<()> {
        let cfg = self.config.snapshot();
        let registry = self.registry.current();
        self.reconcile(&cfg, &registry).await;
        Ok(())
    }

    pub async fn reconcile(&self, cfg: &Config, registry: &Registry) {
        for policy in cfg.monitored_backends() {
            let Some(client) = registry.get(policy.name()) else {
                log::warn!("{} is enabled but has no client, skipping", policy.name());
                continue;
            };
            self.reconcile_backend(&policy, client.as_ref()).await;
        }
    }

    async fn reconcile_backend(&self, policy: &BackendPolicy, client: &dyn DownloaderClient) {
        let prior = if policy.handles_stalls() {
            self.gateway
                .progress_snapshot(policy.name())
                .unwrap_or_else(|err| {
                    log::error!("Unable to read progress for {}: {err}", policy.name());
                    ProgressMap::default()
                })
        } else {
            ProgressMap::default()
        };

        let records = self
            .monitor
            .poll(client, &[], policy.stalled_for, &prior)
            .await;

        for record in &records {
            match self.reconcile_torrent(policy, client, record, &prior).await {
                Ok(()) => {}
                Err(err @ ReconcileError::NotFound { .. }) => {
                    log::warn!("Skipping torrent {} ({}): {err}", record.id, record.name)
                }
                Err(err) => {
                    log::error!("Unable to reconcile torrent {} ({}): {err}", record.id, record.name)
                }
            }
        }
    }

    async fn reconcile_torrent(
        &self,
        policy: &BackendPolicy,
        client: &dyn DownloaderClient,
        record: &TorrentRecord,
        prior: &ProgressMap,
    ) -> Result<(), ReconcileError> {
        match record.status {
            TorrentStatus::Finished if policy.removes_finished() => {
                self.remove_finished(client, record).await
            }
            TorrentStatus::Finished => Ok(()),
            TorrentStatus::Stalled => self.replace_stalled(client, record).await,
            TorrentStatus::Downloading | TorrentStatus::Unknown => {
                if policy.handles_stalls() {
                    self.monitor
                        .record_progress(client.name(), record, prior)?;
                }
                Ok(())
            }
        }
    }

    /// Only torrents known to be post-processed are removed.
    async fn remove_finished(
        &self,
        client: &dyn DownloaderClient,
        record: &TorrentRecord,
    ) -> Result<(), ReconcileError> {
        log::info!(
            "Check if we know finished torrent {} and is postprocessed ({})",
            record.id,
            record.name
        );

        let marked = self.gateway.row_exists(RowQuery::MarkedResult {
            guid: &record.id,
            status: ResultStatus::Finished,
        })?;
        let confirmed = marked
            || self.gateway.row_exists(RowQuery::SearchResult {
                download_id: &record.id,
                status: ResultStatus::Finished,
            })?;

        if !confirmed {
            log::debug!("Torrent {} is not post-processed yet, leaving it", record.id);
            return Ok(());
        }

        if timed(client.name(), client.cancel(&record.id)).await? {
            log::info!("Removed finished torrent {} from {}", record.id, client.name());
            self.gateway.remove_progress(client.name(), &record.id)?;
        } else {
            log::warn!("{} did not remove torrent {}", client.name(), record.id);
        }
        Ok(())
    }

    /// Marks the release Bad, removes it and snatches the next best one if
    /// there is any.
    async fn replace_stalled(
        &self,
        client: &dyn DownloaderClient,
        record: &TorrentRecord,
    ) -> Result<(), ReconcileError> {
        log::info!(
            "Check if we know torrent {} and is snatched ({})",
            record.id,
            record.name
        );

        let result = self
            .gateway
            .find_result_by_download_id(&record.id)?
            .ok_or_else(|| ReconcileError::NotFound {
                kind: "search result",
                key: record.id.clone(),
            })?;
        if result.status != ResultStatus::Snatched {
            log::info!(
                "Torrent {} looks stalled but its release {} is {}, leaving it",
                record.id,
                result.guid,
                result.status
            );
            return Ok(());
        }
        let movie = self
            .gateway
            .movie(&result.imdbid)?
            .ok_or_else(|| ReconcileError::NotFound {
                kind: "movie",
                key: result.imdbid.clone(),
            })?;

        let alternate = match self.arbiter.best_alternate(&movie, &result.guid).await {
            Ok(alternate) => alternate,
            Err(err) => {
                log::error!("Unable to find an alternate release for {}: {err:#}", movie.imdbid);
                None
            }
        };

        log::info!(
            "Torrent {} is stalled, download will be cancelled and marked as Bad",
            record.id
        );
        self.gateway
            .update_result_status(&result.guid, ResultStatus::Bad)?;
        if !timed(client.name(), client.cancel(&record.id)).await? {
            log::warn!("{} did not remove torrent {}", client.name(), record.id);
        }
        self.gateway.remove_progress(client.name(), &record.id)?;

        match alternate {
            Some(release) => {
                snatch(client, self.gateway.as_ref(), &release).await?;
            }
            None => log::info!("No alternate release for {}", movie.title),
        }
        Ok(())
    }
}
