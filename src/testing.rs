//! In-memory stand-ins shared by the unit tests.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::downloader::{DownloaderClient, TorrentRecord};
use crate::error::{DownloaderError, PersistenceError};
use crate::persistence::{
    prefer_snatched, MarkedResult, PersistenceGateway, ProgressMap, ProgressSnapshot, RowQuery,
};
use crate::snatch::SnatchArbiter;
use crate::stall::Observation;
use crate::{Movie, Release, ResultStatus, SearchResult};

#[derive(Default)]
struct Tables {
    tasks: HashMap<String, DateTime<Utc>>,
    progress: HashMap<(String, String), ProgressSnapshot>,
    results: BTreeMap<String, SearchResult>,
    marked: HashMap<String, MarkedResult>,
    movies: HashMap<String, Movie>,
    postprocessed: BTreeSet<PathBuf>,
}

#[derive(Default)]
pub struct MemoryGateway {
    tables: Mutex<Tables>,
    progress_writes: AtomicUsize,
}

impl MemoryGateway {
    pub fn progress_writes(&self) -> usize {
        self.progress_writes.load(Ordering::SeqCst)
    }

    pub fn progress(&self, backend: &str, download_id: &str) -> Option<ProgressSnapshot> {
        self.tables
            .lock()
            .unwrap()
            .progress
            .get(&(backend.to_string(), download_id.to_string()))
            .copied()
    }

    pub fn result(&self, guid: &str) -> Option<SearchResult> {
        self.tables.lock().unwrap().results.get(guid).cloned()
    }
}

impl PersistenceGateway for MemoryGateway {
    fn last_execution(&self, task: &str) -> Result<Option<DateTime<Utc>>, PersistenceError> {
        Ok(self.tables.lock().unwrap().tasks.get(task).copied())
    }

    fn set_last_execution(&self, task: &str, at: DateTime<Utc>) -> Result<(), PersistenceError> {
        self.tables
            .lock()
            .unwrap()
            .tasks
            .insert(task.to_string(), at);
        Ok(())
    }

    fn progress_snapshot(&self, backend: &str) -> Result<ProgressMap, PersistenceError> {
        Ok(self
            .tables
            .lock()
            .unwrap()
            .progress
            .iter()
            .filter(|((b, _), _)| b == backend)
            .map(|((_, id), snapshot)| (id.clone(), *snapshot))
            .collect())
    }

    fn set_progress(
        &self,
        backend: &str,
        download_id: &str,
        snapshot: ProgressSnapshot,
    ) -> Result<(), PersistenceError> {
        self.progress_writes.fetch_add(1, Ordering::SeqCst);
        self.tables
            .lock()
            .unwrap()
            .progress
            .insert((backend.to_string(), download_id.to_string()), snapshot);
        Ok(())
    }

    fn remove_progress(&self, backend: &str, download_id: &str) -> Result<(), PersistenceError> {
        self.tables
            .lock()
            .unwrap()
            .progress
            .remove(&(backend.to_string(), download_id.to_string()));
        Ok(())
    }

    fn find_result_by_download_id(
        &self,
        download_id: &str,
    ) -> Result<Option<SearchResult>, PersistenceError> {
        let results = self
            .tables
            .lock()
            .unwrap()
            .results
            .values()
            .filter(|r| r.download_id.as_deref() == Some(download_id))
            .cloned()
            .collect();
        Ok(prefer_snatched(results))
    }

    fn find_result_by_title(&self, title: &str) -> Result<Option<SearchResult>, PersistenceError> {
        Ok(self
            .tables
            .lock()
            .unwrap()
            .results
            .values()
            .find(|r| r.title == title)
            .cloned())
    }

    fn save_result(&self, result: &SearchResult) -> Result<(), PersistenceError> {
        self.tables
            .lock()
            .unwrap()
            .results
            .insert(result.guid.clone(), result.clone());
        Ok(())
    }

    fn update_result_status(
        &self,
        guid: &str,
        status: ResultStatus,
    ) -> Result<(), PersistenceError> {
        let mut tables = self.tables.lock().unwrap();
        let Some(result) = tables.results.get_mut(guid) else {
            return Ok(());
        };
        if result.status.is_final() && result.status != status {
            return Ok(());
        }
        result.status = status;
        let imdbid = result.imdbid.clone();
        tables.marked.insert(
            guid.to_string(),
            MarkedResult {
                guid: guid.to_string(),
                imdbid,
                status,
            },
        );
        Ok(())
    }

    fn row_exists(&self, query: RowQuery<'_>) -> Result<bool, PersistenceError> {
        let tables = self.tables.lock().unwrap();
        Ok(match query {
            RowQuery::MarkedResult { guid, status } => tables
                .marked
                .get(guid)
                .is_some_and(|m| m.status == status),
            RowQuery::SearchResult {
                download_id,
                status,
            } => tables
                .results
                .values()
                .any(|r| r.download_id.as_deref() == Some(download_id) && r.status == status),
        })
    }

    fn movie(&self, imdbid: &str) -> Result<Option<Movie>, PersistenceError> {
        Ok(self.tables.lock().unwrap().movies.get(imdbid).cloned())
    }

    fn save_movie(&self, movie: &Movie) -> Result<(), PersistenceError> {
        self.tables
            .lock()
            .unwrap()
            .movies
            .insert(movie.imdbid.clone(), movie.clone());
        Ok(())
    }

    fn record_snatch(&self, result: &SearchResult) -> Result<(), PersistenceError> {
        let mut tables = self.tables.lock().unwrap();
        tables.results.insert(result.guid.clone(), result.clone());
        tables.marked.insert(
            result.guid.clone(),
            MarkedResult {
                guid: result.guid.clone(),
                imdbid: result.imdbid.clone(),
                status: result.status,
            },
        );
        if let Some(movie) = tables.movies.get_mut(&result.imdbid) {
            movie.status = result.status;
            movie.tried.insert(result.guid.clone());
        }
        Ok(())
    }

    fn postprocessed_paths(&self) -> Result<Vec<PathBuf>, PersistenceError> {
        Ok(self
            .tables
            .lock()
            .unwrap()
            .postprocessed
            .iter()
            .cloned()
            .collect())
    }

    fn add_postprocessed_path(&self, path: &Path) -> Result<(), PersistenceError> {
        self.tables
            .lock()
            .unwrap()
            .postprocessed
            .insert(path.to_path_buf());
        Ok(())
    }

    fn remove_postprocessed_path(&self, path: &Path) -> Result<(), PersistenceError> {
        self.tables.lock().unwrap().postprocessed.remove(path);
        Ok(())
    }

    fn clear_postprocessed_paths(&self) -> Result<(), PersistenceError> {
        self.tables.lock().unwrap().postprocessed.clear();
        Ok(())
    }
}

/// Backend answering from a fixed torrent list.
pub struct FakeClient {
    name: &'static str,
    torrents: Mutex<Vec<(String, Observation)>>,
    failing_cancels: HashSet<String>,
    unavailable: AtomicBool,
    submitted: Mutex<Vec<Release>>,
    cancelled: Mutex<Vec<String>>,
}

impl FakeClient {
    pub fn new(name: &'static str) -> Self {
        FakeClient {
            name,
            torrents: Mutex::new(Vec::new()),
            failing_cancels: HashSet::new(),
            unavailable: AtomicBool::new(false),
            submitted: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
        }
    }

    pub fn with_torrent(self, id: &str, observation: Observation) -> Self {
        self.torrents
            .lock()
            .unwrap()
            .push((id.to_string(), observation));
        self
    }

    pub fn failing_cancel(mut self, id: &str) -> Self {
        self.failing_cancels.insert(id.to_string());
        self
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn submitted(&self) -> Vec<Release> {
        self.submitted.lock().unwrap().clone()
    }

    pub fn cancelled(&self) -> Vec<String> {
        self.cancelled.lock().unwrap().clone()
    }
}

#[async_trait]
impl DownloaderClient for FakeClient {
    fn name(&self) -> &str {
        self.name
    }

    async fn submit(&self, release: &Release) -> Result<String, DownloaderError> {
        self.submitted.lock().unwrap().push(release.clone());
        Ok(format!("{}-hash", release.guid.to_lowercase()))
    }

    async fn cancel(&self, download_id: &str) -> Result<bool, DownloaderError> {
        if self.failing_cancels.contains(download_id) {
            return Err(DownloaderError::rejected(self.name, "torrent is locked"));
        }
        self.cancelled.lock().unwrap().push(download_id.to_string());
        Ok(true)
    }

    async fn status(
        &self,
        ids: &[String],
        stalled_for: Option<u32>,
        prior: &ProgressMap,
    ) -> Result<Vec<TorrentRecord>, DownloaderError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(DownloaderError::unavailable(self.name, "connection refused"));
        }

        let now = Utc::now();
        Ok(self
            .torrents
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| ids.is_empty() || ids.contains(id))
            .map(|(id, observation)| {
                TorrentRecord::observe(
                    id.clone(),
                    format!("Torrent {id}"),
                    observation,
                    prior.get(id),
                    stalled_for,
                    now,
                )
            })
            .collect())
    }
}

/// Arbiter that always proposes the same release and remembers what it was
/// asked.
#[derive(Default)]
pub struct FixedArbiter {
    alternate: Option<Release>,
    fail: bool,
    asked: Mutex<Vec<(String, String)>>,
}

impl FixedArbiter {
    pub fn returning(alternate: Option<Release>) -> Self {
        FixedArbiter {
            alternate,
            ..FixedArbiter::default()
        }
    }

    pub fn failing() -> Self {
        FixedArbiter {
            fail: true,
            ..FixedArbiter::default()
        }
    }

    /// `(imdbid, excluded guid)` of every call.
    pub fn asked(&self) -> Vec<(String, String)> {
        self.asked.lock().unwrap().clone()
    }
}

#[async_trait]
impl SnatchArbiter for FixedArbiter {
    async fn best_alternate(
        &self,
        movie: &Movie,
        exclude_guid: &str,
    ) -> anyhow::Result<Option<Release>> {
        self.asked
            .lock()
            .unwrap()
            .push((movie.imdbid.clone(), exclude_guid.to_string()));
        if self.fail {
            anyhow::bail!("indexers unreachable");
        }
        Ok(self.alternate.clone())
    }
}
