pub mod deluge;
pub mod transmission;

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::{BackendKind, Config};
use crate::error::DownloaderError;
use crate::persistence::{ProgressMap, ProgressSnapshot};
use crate::stall::{self, Observation, TorrentStatus};
use crate::{Release, TIMEOUT};

/// One torrent as seen by a backend, with its status normalized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TorrentRecord {
    pub id: String,
    pub name: String,
    pub status: TorrentStatus,
    pub progress: Option<u64>,
    /// When `progress` last changed, taken from the stored baseline. `None`
    /// when there is no baseline or the byte count moved off it.
    pub changed_at: Option<DateTime<Utc>>,
}

impl TorrentRecord {
    /// Classifies an observation and carries over the stored progress
    /// baseline when the byte count did not move.
    pub fn observe(
        id: String,
        name: String,
        observation: &Observation,
        prior: Option<&ProgressSnapshot>,
        stalled_for: Option<u32>,
        now: DateTime<Utc>,
    ) -> Self {
        let status = stall::classify(observation, prior, stalled_for, now);
        let changed_at = match (observation.bytes, prior) {
            (Some(bytes), Some(prior)) if prior.progress == Some(bytes) => prior.time,
            _ => None,
        };

        TorrentRecord {
            id,
            name,
            status,
            progress: observation.bytes,
            changed_at,
        }
    }
}

/// A download backend.
///
/// Implementations keep their own session (cookies, request ids) and reuse it
/// across calls.
#[async_trait]
pub trait DownloaderClient: Send + Sync {
    fn name(&self) -> &str;

    /// Sends a release to the backend and returns its download id.
    async fn submit(&self, release: &Release) -> Result<String, DownloaderError>;

    /// Removes a download together with its data.
    async fn cancel(&self, download_id: &str) -> Result<bool, DownloaderError>;

    /// Current state of the requested torrents, every torrent when `ids` is
    /// empty. Ids the backend doesn't know are left out.
    async fn status(
        &self,
        ids: &[String],
        stalled_for: Option<u32>,
        prior: &ProgressMap,
    ) -> Result<Vec<TorrentRecord>, DownloaderError>;
}

/// Runs a backend call with the global [`TIMEOUT`].
pub async fn timed<T>(
    backend: &str,
    call: impl Future<Output = Result<T, DownloaderError>>,
) -> Result<T, DownloaderError> {
    timed_with(TIMEOUT, backend, call).await
}

pub(crate) async fn timed_with<T>(
    limit: Duration,
    backend: &str,
    call: impl Future<Output = Result<T, DownloaderError>>,
) -> Result<T, DownloaderError> {
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(DownloaderError::Timeout {
            backend: backend.to_string(),
        }),
    }
}

/// Configured backends by name, resolved once per config load.
#[derive(Clone, Default)]
pub struct Registry {
    clients: BTreeMap<String, Arc<dyn DownloaderClient>>,
}

impl Registry {
    /// Builds a client for every enabled torrent backend. A backend whose
    /// client can't be built is logged and left out.
    pub fn from_config(cfg: &Config) -> Self {
        let mut registry = Registry::default();
        let backends = &cfg.downloader.torrent;

        for kind in BackendKind::ALL {
            let client: Result<Arc<dyn DownloaderClient>, DownloaderError> = match kind {
                BackendKind::Transmission if backends.transmission.enabled => {
                    transmission::Client::new(&backends.transmission)
                        .map(|c| Arc::new(c) as Arc<dyn DownloaderClient>)
                }
                BackendKind::DelugeWeb if backends.deluge_web.enabled => {
                    deluge::Client::new(&backends.deluge_web)
                        .map(|c| Arc::new(c) as Arc<dyn DownloaderClient>)
                }
                _ => continue,
            };

            match client {
                Ok(client) => registry.insert(kind.name(), client),
                Err(err) => log::error!("Unable to set up {}: {err}", kind.name()),
            }
        }

        registry
    }

    pub fn insert(&mut self, name: &str, client: Arc<dyn DownloaderClient>) {
        self.clients.insert(name.to_string(), client);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn DownloaderClient>> {
        self.clients.get(name).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.clients.keys().map(String::as_str)
    }
}

/// The live registry, swapped whole when the downloader settings change.
#[derive(Default)]
pub struct SharedRegistry(RwLock<Arc<Registry>>);

impl SharedRegistry {
    pub fn new(registry: Registry) -> Self {
        SharedRegistry(RwLock::new(Arc::new(registry)))
    }

    pub fn current(&self) -> Arc<Registry> {
        self.0.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn replace(&self, registry: Registry) {
        *self.0.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(registry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn observation(bytes: u64) -> Observation {
        Observation {
            status: TorrentStatus::Downloading,
            bytes: Some(bytes),
            timers: None,
        }
    }

    #[test]
    fn unchanged_progress_keeps_baseline() {
        let changed = now() - Duration::hours(2);
        let prior = ProgressSnapshot::new(42, changed);
        let record = TorrentRecord::observe(
            "abc".to_string(),
            "Movie".to_string(),
            &observation(42),
            Some(&prior),
            Some(4),
            now(),
        );

        assert_eq!(record.status, TorrentStatus::Downloading);
        assert_eq!(record.changed_at, Some(changed));
    }

    #[test]
    fn changed_progress_drops_baseline_time() {
        let prior = ProgressSnapshot::new(42, now() - Duration::hours(2));
        let record = TorrentRecord::observe(
            "abc".to_string(),
            "Movie".to_string(),
            &observation(64),
            Some(&prior),
            Some(4),
            now(),
        );

        assert_eq!(record.progress, Some(64));
        assert_eq!(record.changed_at, None);
    }

    #[test]
    fn untracked_torrents_have_no_change_time() {
        let record = TorrentRecord::observe(
            "abc".to_string(),
            "Movie".to_string(),
            &observation(64),
            None,
            Some(4),
            now(),
        );

        assert_eq!(record.changed_at, None);
    }

    #[test]
    fn disabled_backends_are_not_registered() {
        let mut cfg = Config::default();
        cfg.downloader.torrent.transmission.enabled = true;

        let registry = Registry::from_config(&cfg);
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["Transmission"]);
        assert!(registry.get("DelugeWeb").is_none());
    }

    #[tokio::test]
    async fn slow_calls_time_out() {
        let result: Result<(), _> = timed_with(
            std::time::Duration::from_millis(10),
            "Transmission",
            async {
                tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                Ok(())
            },
        )
        .await;

        assert!(matches!(result, Err(DownloaderError::Timeout { .. })));
    }
}
