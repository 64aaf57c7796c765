//! Polling of download backends and stored progress upkeep.

use std::sync::Arc;

use chrono::Utc;

use crate::downloader::{timed, DownloaderClient, TorrentRecord};
use crate::error::PersistenceError;
use crate::persistence::{PersistenceGateway, ProgressMap, ProgressSnapshot, RowQuery};
use crate::stall::TorrentStatus;
use crate::ResultStatus;

pub struct DownloadMonitor {
    gateway: Arc<dyn PersistenceGateway>,
}

impl DownloadMonitor {
    pub fn new(gateway: Arc<dyn PersistenceGateway>) -> Self {
        DownloadMonitor { gateway }
    }

    /// Normalized state of the requested torrents, or of all of them when
    /// `ids` is empty. A backend that fails or times out yields no records
    /// for this cycle.
    pub async fn poll(
        &self,
        client: &dyn DownloaderClient,
        ids: &[String],
        stalled_for: Option<u32>,
        prior: &ProgressMap,
    ) -> Vec<TorrentRecord> {
        match timed(client.name(), client.status(ids, stalled_for, prior)).await {
            Ok(records) => {
                log::debug!("{} reported {} torrents", client.name(), records.len());
                records
            }
            Err(err) => {
                log::error!("Unable to get torrents from {}: {err}", client.name());
                Vec::new()
            }
        }
    }

    /// Brings the stored progress of a tracked, non-stalled torrent up to
    /// date. Only torrents with a stored snapshot are tracked, and only
    /// results still Snatched are written. Returns whether anything changed.
    ///
    /// - downloading: store the byte count if it differs from the stored one
    /// - finished or stalled: leave alone
    /// - anything else: forget the stored progress so the stall timer restarts
    pub fn record_progress(
        &self,
        backend: &str,
        record: &TorrentRecord,
        prior: &ProgressMap,
    ) -> Result<bool, PersistenceError> {
        let Some(stored) = prior.get(&record.id) else {
            return Ok(false);
        };

        let update = match record.status {
            TorrentStatus::Downloading => match record.progress {
                Some(bytes) if stored.progress != Some(bytes) => Some(ProgressSnapshot::new(
                    bytes,
                    record.changed_at.unwrap_or_else(Utc::now),
                )),
                _ => None,
            },
            TorrentStatus::Unknown if stored.progress.is_some() => {
                Some(ProgressSnapshot::default())
            }
            _ => None,
        };

        let Some(update) = update else {
            return Ok(false);
        };

        let snatched = self.gateway.row_exists(RowQuery::SearchResult {
            download_id: &record.id,
            status: ResultStatus::Snatched,
        })?;
        if !snatched {
            return Ok(false);
        }

        log::debug!("Progress of {} on {backend}: {:?}", record.id, update.progress);
        self.gateway.set_progress(backend, &record.id, update)?;
        Ok(true)
    }
}
