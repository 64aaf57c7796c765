pub mod app;
pub mod config;
pub mod downloader;
pub mod error;
pub mod jobs;
pub mod monitor;
pub mod persistence;
pub mod postprocessing;
pub mod reconcile;
pub mod router;
pub mod scheduler;
pub mod snatch;
pub mod stall;

#[cfg(test)]
pub(crate) mod testing;

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Upper bound for a single call to a download backend. Adding or removing
/// large torrents can keep a client busy for a while.
pub const TIMEOUT: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReleaseKind {
    #[serde(rename = "torrent")]
    Torrent,
    #[serde(rename = "magnet")]
    Magnet,
}

/// A release candidate picked for download.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Release {
    pub guid: String,
    pub imdbid: String,
    pub title: String,
    /// Link to the `.torrent` file or the magnet uri.
    pub torrentfile: String,
    pub kind: ReleaseKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResultStatus {
    Wanted,
    Snatched,
    Bad,
    Finished,
    Disabled,
}

impl ResultStatus {
    /// Finished and Bad results never move to another status.
    pub fn is_final(self) -> bool {
        matches!(self, ResultStatus::Finished | ResultStatus::Bad)
    }
}

impl fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResultStatus::Wanted => "Wanted",
            ResultStatus::Snatched => "Snatched",
            ResultStatus::Bad => "Bad",
            ResultStatus::Finished => "Finished",
            ResultStatus::Disabled => "Disabled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub guid: String,
    pub imdbid: String,
    pub title: String,
    pub status: ResultStatus,
    pub download_id: Option<String>,
    /// Name of the backend the release was sent to.
    pub download_client: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Movie {
    pub imdbid: String,
    pub title: String,
    pub status: ResultStatus,
    /// Guids of every release already sent to a backend for this movie.
    #[serde(default)]
    pub tried: BTreeSet<String>,
}
