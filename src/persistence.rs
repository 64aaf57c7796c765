use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::error::PersistenceError;
use crate::{Movie, ResultStatus, SearchResult};

/// Last observed byte count of a download and when it last changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub progress: Option<u64>,
    pub time: Option<DateTime<Utc>>,
}

impl ProgressSnapshot {
    pub fn new(progress: u64, time: DateTime<Utc>) -> Self {
        ProgressSnapshot {
            progress: Some(progress),
            time: Some(time),
        }
    }
}

/// Download id -> progress snapshot, for one backend.
pub type ProgressMap = FxHashMap<String, ProgressSnapshot>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkedResult {
    pub guid: String,
    pub imdbid: String,
    pub status: ResultStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowQuery<'a> {
    MarkedResult {
        guid: &'a str,
        status: ResultStatus,
    },
    SearchResult {
        download_id: &'a str,
        status: ResultStatus,
    },
}

/// Small durable store shared by every task. Implementations serialize
/// conflicting writes themselves; callers may invoke it from several running
/// tasks at once.
pub trait PersistenceGateway: Send + Sync {
    fn last_execution(&self, task: &str) -> Result<Option<DateTime<Utc>>, PersistenceError>;
    fn set_last_execution(&self, task: &str, at: DateTime<Utc>) -> Result<(), PersistenceError>;

    fn progress_snapshot(&self, backend: &str) -> Result<ProgressMap, PersistenceError>;
    fn set_progress(
        &self,
        backend: &str,
        download_id: &str,
        snapshot: ProgressSnapshot,
    ) -> Result<(), PersistenceError>;
    fn remove_progress(&self, backend: &str, download_id: &str) -> Result<(), PersistenceError>;

    fn find_result_by_download_id(
        &self,
        download_id: &str,
    ) -> Result<Option<SearchResult>, PersistenceError>;
    fn find_result_by_title(&self, title: &str) -> Result<Option<SearchResult>, PersistenceError>;
    fn save_result(&self, result: &SearchResult) -> Result<(), PersistenceError>;
    /// Moves the search result and its marked result to `status`. A result
    /// that is already Finished or Bad keeps its status.
    fn update_result_status(&self, guid: &str, status: ResultStatus)
        -> Result<(), PersistenceError>;
    fn row_exists(&self, query: RowQuery<'_>) -> Result<bool, PersistenceError>;

    fn movie(&self, imdbid: &str) -> Result<Option<Movie>, PersistenceError>;
    fn save_movie(&self, movie: &Movie) -> Result<(), PersistenceError>;
    /// Stores a freshly snatched result, marks it and adds it to the movie's
    /// tried releases.
    fn record_snatch(&self, result: &SearchResult) -> Result<(), PersistenceError>;

    fn postprocessed_paths(&self) -> Result<Vec<PathBuf>, PersistenceError>;
    fn add_postprocessed_path(&self, path: &Path) -> Result<(), PersistenceError>;
    fn remove_postprocessed_path(&self, path: &Path) -> Result<(), PersistenceError>;
    fn clear_postprocessed_paths(&self) -> Result<(), PersistenceError>;
}

fn progress_key(backend: &str, download_id: &str) -> String {
    format!("{backend}/{download_id}")
}

fn store_err(operation: &'static str, err: impl Display) -> PersistenceError {
    PersistenceError::Store {
        operation,
        detail: err.to_string(),
    }
}

/// Several results can share a download id when the same torrent was
/// offered twice; the one still being downloaded is the live one.
pub(crate) fn prefer_snatched(results: Vec<SearchResult>) -> Option<SearchResult> {
    let mut results = results.into_iter();
    let first = results.next()?;
    if first.status == ResultStatus::Snatched {
        return Some(first);
    }
    Some(
        results
            .find(|r| r.status == ResultStatus::Snatched)
            .unwrap_or(first),
    )
}

fn lock<T>(store: &Mutex<T>) -> MutexGuard<'_, T> {
    store.lock().unwrap_or_else(PoisonError::into_inner)
}

macro_rules! open_store {
    ($dir:expr, $file:literal) => {{
        let path = $dir.join($file);
        let store = kv::Store::open(&path).map_err(|err| PersistenceError::Open {
            path,
            detail: err.to_string(),
        })?;
        Mutex::new(store)
    }};
}

/// Gateway backed by one `kv` store per record kind. Each store sits behind
/// its own mutex; when several are touched they are locked in field order.
pub struct KvGateway {
    tasks: Mutex<kv::Store<String>>,
    results: Mutex<kv::Store<SearchResult>>,
    marked: Mutex<kv::Store<MarkedResult>>,
    movies: Mutex<kv::Store<Movie>>,
    progress: Mutex<kv::Store<ProgressSnapshot>>,
    postprocessed: Mutex<kv::Store<String>>,
}

impl KvGateway {
    pub fn open(dir: &Path) -> Result<Self, PersistenceError> {
        Ok(KvGateway {
            tasks: open_store!(dir, "tasks.db"),
            results: open_store!(dir, "searchresults.db"),
            marked: open_store!(dir, "markedresults.db"),
            movies: open_store!(dir, "movies.db"),
            progress: open_store!(dir, "progress.db"),
            postprocessed: open_store!(dir, "postprocessed.db"),
        })
    }

    fn results_where(
        &self,
        predicate: impl Fn(&SearchResult) -> bool,
    ) -> Result<Vec<SearchResult>, PersistenceError> {
        let results = lock(&self.results)
            .load_map()
            .map_err(|err| store_err("load search results", err))?;
        Ok(results
            .into_iter()
            .map(|(_, r)| r)
            .filter(|r| predicate(r))
            .collect())
    }
}

impl PersistenceGateway for KvGateway {
    fn last_execution(&self, task: &str) -> Result<Option<DateTime<Utc>>, PersistenceError> {
        let Some(raw) = lock(&self.tasks)
            .get(task)
            .map_err(|err| store_err("get last execution", err))?
        else {
            return Ok(None);
        };

        DateTime::parse_from_rfc3339(&raw)
            .map(|t| Some(t.with_timezone(&Utc)))
            .map_err(|err| PersistenceError::Corrupt {
                key: task.to_string(),
                detail: err.to_string(),
            })
    }

    fn set_last_execution(&self, task: &str, at: DateTime<Utc>) -> Result<(), PersistenceError> {
        lock(&self.tasks)
            .set(task, &at.to_rfc3339())
            .map_err(|err| store_err("set last execution", err))?;
        Ok(())
    }

    fn progress_snapshot(&self, backend: &str) -> Result<ProgressMap, PersistenceError> {
        let prefix = progress_key(backend, "");
        let all = lock(&self.progress)
            .load_map()
            .map_err(|err| store_err("load progress", err))?;

        Ok(all
            .into_iter()
            .filter_map(|(key, snapshot)| {
                key.strip_prefix(&prefix)
                    .map(|id| (id.to_string(), snapshot))
            })
            .collect())
    }

    fn set_progress(
        &self,
        backend: &str,
        download_id: &str,
        snapshot: ProgressSnapshot,
    ) -> Result<(), PersistenceError> {
        lock(&self.progress)
            .set(&progress_key(backend, download_id), &snapshot)
            .map_err(|err| store_err("set progress", err))?;
        Ok(())
    }

    fn remove_progress(&self, backend: &str, download_id: &str) -> Result<(), PersistenceError> {
        lock(&self.progress)
            .unset(&progress_key(backend, download_id))
            .map_err(|err| store_err("remove progress", err))?;
        Ok(())
    }

    fn find_result_by_download_id(
        &self,
        download_id: &str,
    ) -> Result<Option<SearchResult>, PersistenceError> {
        let results = self.results_where(|r| r.download_id.as_deref() == Some(download_id))?;
        Ok(prefer_snatched(results))
    }

    fn find_result_by_title(&self, title: &str) -> Result<Option<SearchResult>, PersistenceError> {
        Ok(self.results_where(|r| r.title == title)?.into_iter().next())
    }

    fn save_result(&self, result: &SearchResult) -> Result<(), PersistenceError> {
        lock(&self.results)
            .set(&result.guid, result)
            .map_err(|err| store_err("save search result", err))?;
        Ok(())
    }

    fn update_result_status(
        &self,
        guid: &str,
        status: ResultStatus,
    ) -> Result<(), PersistenceError> {
        let results = lock(&self.results);
        let marked = lock(&self.marked);

        let Some(mut result) = results
            .get(guid)
            .map_err(|err| store_err("get search result", err))?
        else {
            log::warn!("No search result with guid `{guid}` to mark {status}");
            return Ok(());
        };
        if result.status.is_final() && result.status != status {
            log::warn!(
                "Search result `{guid}` is {}, not marking it {status}",
                result.status
            );
            return Ok(());
        }

        result.status = status;
        results
            .set(guid, &result)
            .map_err(|err| store_err("update search result", err))?;

        let mark = MarkedResult {
            guid: guid.to_string(),
            imdbid: result.imdbid,
            status,
        };
        marked
            .set(guid, &mark)
            .map_err(|err| store_err("update marked result", err))?;
        Ok(())
    }

    fn row_exists(&self, query: RowQuery<'_>) -> Result<bool, PersistenceError> {
        match query {
            RowQuery::MarkedResult { guid, status } => Ok(lock(&self.marked)
                .get(guid)
                .map_err(|err| store_err("get marked result", err))?
                .is_some_and(|m| m.status == status)),
            RowQuery::SearchResult {
                download_id,
                status,
            } => Ok(!self
                .results_where(|r| {
                    r.download_id.as_deref() == Some(download_id) && r.status == status
                })?
                .is_empty()),
        }
    }

    fn movie(&self, imdbid: &str) -> Result<Option<Movie>, PersistenceError> {
        lock(&self.movies)
            .get(imdbid)
            .map_err(|err| store_err("get movie", err))
    }

    fn save_movie(&self, movie: &Movie) -> Result<(), PersistenceError> {
        lock(&self.movies)
            .set(&movie.imdbid, movie)
            .map_err(|err| store_err("save movie", err))?;
        Ok(())
    }

    fn record_snatch(&self, result: &SearchResult) -> Result<(), PersistenceError> {
        let results = lock(&self.results);
        let marked = lock(&self.marked);
        let movies = lock(&self.movies);

        results
            .set(&result.guid, result)
            .map_err(|err| store_err("save search result", err))?;

        let mark = MarkedResult {
            guid: result.guid.clone(),
            imdbid: result.imdbid.clone(),
            status: result.status,
        };
        marked
            .set(&result.guid, &mark)
            .map_err(|err| store_err("save marked result", err))?;

        if let Some(mut movie) = movies
            .get(&result.imdbid)
            .map_err(|err| store_err("get movie", err))?
        {
            movie.status = result.status;
            movie.tried.insert(result.guid.clone());
            movies
                .set(&movie.imdbid, &movie)
                .map_err(|err| store_err("save movie", err))?;
        }
        Ok(())
    }

    fn postprocessed_paths(&self) -> Result<Vec<PathBuf>, PersistenceError> {
        let paths = lock(&self.postprocessed)
            .load_map()
            .map_err(|err| store_err("load postprocessed paths", err))?;
        Ok(paths.into_iter().map(|(path, _)| PathBuf::from(path)).collect())
    }

    fn add_postprocessed_path(&self, path: &Path) -> Result<(), PersistenceError> {
        let path = path.to_string_lossy().to_string();
        lock(&self.postprocessed)
            .set(&path, &path)
            .map_err(|err| store_err("add postprocessed path", err))?;
        Ok(())
    }

    fn remove_postprocessed_path(&self, path: &Path) -> Result<(), PersistenceError> {
        lock(&self.postprocessed)
            .unset(path.to_string_lossy().as_ref())
            .map_err(|err| store_err("remove postprocessed path", err))?;
        Ok(())
    }

    fn clear_postprocessed_paths(&self) -> Result<(), PersistenceError> {
        let store = lock(&self.postprocessed);
        let paths = store
            .load_map()
            .map_err(|err| store_err("load postprocessed paths", err))?;
        for (path, _) in paths {
            store
                .unset(&path)
                .map_err(|err| store_err("remove postprocessed path", err))?;
        }
        Ok(())
    }
}
