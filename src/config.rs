use std::collections::BTreeMap;
use std::fs::{self, read_to_string};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::ConfigError;

/// Complete configuration snapshot. Every section is default-filled field by
/// field, so an older file missing newer keys still loads.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    #[serde(rename = "Server")]
    pub server: Server,
    #[serde(rename = "Search")]
    pub search: Search,
    #[serde(rename = "Postprocessing")]
    pub postprocessing: Postprocessing,
    #[serde(rename = "System")]
    pub system: System,
    #[serde(rename = "Downloader")]
    pub downloader: Downloader,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Server {
    pub checkupdates: bool,
    /// Hours between update checks.
    pub checkupdatefrequency: u32,
    pub installupdates: bool,
}

impl Default for Server {
    fn default() -> Self {
        Server {
            checkupdates: true,
            checkupdatefrequency: 48,
            installupdates: false,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Search {
    /// Minutes between searches for wanted movies.
    pub rsssyncfrequency: u32,
    #[serde(rename = "Watchlists")]
    pub watchlists: Watchlists,
}

impl Default for Search {
    fn default() -> Self {
        Search {
            rsssyncfrequency: 60,
            watchlists: Watchlists::default(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Watchlists {
    pub imdbsync: bool,
    /// Minutes.
    pub imdbfrequency: u32,
    pub imdbrss: Vec<String>,
    pub popularmoviessync: bool,
    pub popularmovieshour: u32,
    pub popularmoviesmin: u32,
    pub traktsync: bool,
    /// Minutes.
    pub traktfrequency: u32,
    #[serde(rename = "Traktlists")]
    pub traktlists: BTreeMap<String, bool>,
}

impl Default for Watchlists {
    fn default() -> Self {
        let traktlists = ["trending", "popular", "anticipated", "boxoffice"]
            .into_iter()
            .map(|list| (list.to_string(), false))
            .collect();

        Watchlists {
            imdbsync: false,
            imdbfrequency: 60,
            imdbrss: Vec::new(),
            popularmoviessync: false,
            popularmovieshour: 3,
            popularmoviesmin: 0,
            traktsync: false,
            traktfrequency: 60,
            traktlists,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(default)]
pub struct Postprocessing {
    #[serde(rename = "Scanner")]
    pub scanner: Scanner,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Scanner {
    pub enabled: bool,
    /// Minutes between directory scans.
    pub interval: u32,
    pub directory: PathBuf,
    /// Smallest file worth processing, in megabytes.
    pub minsize: u64,
    pub newfilesonly: bool,
}

impl Default for Scanner {
    fn default() -> Self {
        Scanner {
            enabled: false,
            interval: 10,
            directory: PathBuf::new(),
            minsize: 500,
            newfilesonly: true,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(default)]
pub struct System {
    #[serde(rename = "FileManagement")]
    pub file_management: FileManagement,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct FileManagement {
    pub scanmissingfiles: bool,
    pub scanmissinghour: u32,
    pub scanmissingmin: u32,
}

impl Default for FileManagement {
    fn default() -> Self {
        FileManagement {
            scanmissingfiles: false,
            scanmissinghour: 2,
            scanmissingmin: 0,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(default)]
pub struct Downloader {
    #[serde(rename = "Sources")]
    pub sources: Sources,
    #[serde(rename = "Torrent")]
    pub torrent: TorrentBackends,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Sources {
    pub torrentenabled: bool,
}

impl Default for Sources {
    fn default() -> Self {
        Sources {
            torrentenabled: true,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(default)]
pub struct TorrentBackends {
    #[serde(rename = "Transmission")]
    pub transmission: Transmission,
    #[serde(rename = "DelugeWeb")]
    pub deluge_web: DelugeWeb,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Transmission {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub user: String,
    #[serde(flatten)]
    pub password: Password,
    pub category: String,
    pub addpaused: bool,
    pub removetorrents: bool,
    /// Hours without progress before a download counts as stalled, 0 to
    /// disable stall handling.
    pub removestalledfor: u32,
}

impl Default for Transmission {
    fn default() -> Self {
        Transmission {
            enabled: false,
            host: "http://localhost".to_string(),
            port: 9091,
            user: String::new(),
            password: Password::default(),
            category: "Watcher".to_string(),
            addpaused: false,
            removetorrents: false,
            removestalledfor: 0,
        }
    }
}

impl Transmission {
    pub fn url(&self) -> Result<Url, url::ParseError> {
        Url::parse(&format!("{}:{}/transmission/rpc", self.host, self.port))
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

impl Priority {
    pub fn deluge_value(self) -> u8 {
        match self {
            Priority::Low => 64,
            Priority::Normal => 128,
            Priority::High => 255,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct DelugeWeb {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    #[serde(flatten)]
    pub password: Password,
    pub category: String,
    pub priority: Priority,
    pub addpaused: bool,
    /// Stop seeding at this ratio; `-1` seeds forever, unset keeps the
    /// client default.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seedratiolimit: Option<f64>,
    pub removetorrents: bool,
    pub removestalledfor: u32,
}

impl Default for DelugeWeb {
    fn default() -> Self {
        DelugeWeb {
            enabled: false,
            host: "http://localhost".to_string(),
            port: 8112,
            password: Password::default(),
            category: "Watcher".to_string(),
            priority: Priority::Normal,
            addpaused: false,
            seedratiolimit: None,
            removetorrents: false,
            removestalledfor: 0,
        }
    }
}

impl DelugeWeb {
    pub fn url(&self) -> Result<Url, url::ParseError> {
        Url::parse(&format!("{}:{}/json", self.host, self.port))
    }
}

/// Backend password, either inline or read from a file when the client is
/// built.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum Password {
    File {
        passfile: PathBuf,
    },
    Raw {
        #[serde(default)]
        pass: String,
    },
}

impl Default for Password {
    fn default() -> Self {
        Password::Raw {
            pass: String::new(),
        }
    }
}

impl Password {
    pub fn resolve(&self) -> io::Result<String> {
        match self {
            Password::Raw { pass } => Ok(pass.clone()),
            Password::File { passfile } => Ok(read_to_string(passfile)?.trim().to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    Transmission,
    DelugeWeb,
}

impl BackendKind {
    pub const ALL: [BackendKind; 2] = [BackendKind::Transmission, BackendKind::DelugeWeb];

    pub fn name(self) -> &'static str {
        match self {
            BackendKind::Transmission => "Transmission",
            BackendKind::DelugeWeb => "DelugeWeb",
        }
    }

    /// Deluge removes torrents on its own once the seed ratio is reached, so
    /// removal of finished torrents is never driven from here.
    pub fn supports_remove_on_finish(self) -> bool {
        matches!(self, BackendKind::Transmission)
    }
}

/// The part of a backend's settings that drives monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendPolicy {
    pub kind: BackendKind,
    pub enabled: bool,
    pub remove_torrents: bool,
    pub stalled_for: Option<u32>,
}

impl BackendPolicy {
    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    pub fn removes_finished(&self) -> bool {
        self.remove_torrents && self.kind.supports_remove_on_finish()
    }

    pub fn handles_stalls(&self) -> bool {
        self.stalled_for.is_some()
    }

    pub fn needs_monitoring(&self) -> bool {
        self.enabled && (self.removes_finished() || self.handles_stalls())
    }
}

impl TorrentBackends {
    pub fn policy(&self, kind: BackendKind) -> BackendPolicy {
        let (enabled, remove_torrents, stalled_for) = match kind {
            BackendKind::Transmission => (
                self.transmission.enabled,
                self.transmission.removetorrents,
                self.transmission.removestalledfor,
            ),
            BackendKind::DelugeWeb => (
                self.deluge_web.enabled,
                self.deluge_web.removetorrents,
                self.deluge_web.removestalledfor,
            ),
        };
        BackendPolicy {
            kind,
            enabled,
            remove_torrents,
            stalled_for: (stalled_for > 0).then_some(stalled_for),
        }
    }
}

impl Config {
    /// Enabled torrent backends that need the status check, i.e. that remove
    /// finished torrents or handle stalled ones.
    pub fn monitored_backends(&self) -> Vec<BackendPolicy> {
        if !self.downloader.sources.torrentenabled {
            return Vec::new();
        }
        BackendKind::ALL
            .into_iter()
            .map(|kind| self.downloader.torrent.policy(kind))
            .filter(BackendPolicy::needs_monitoring)
            .collect()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        positive("Server", "checkupdatefrequency", self.server.checkupdatefrequency)?;
        positive("Search", "rsssyncfrequency", self.search.rsssyncfrequency)?;

        let watchlists = &self.search.watchlists;
        positive("Search.Watchlists", "imdbfrequency", watchlists.imdbfrequency)?;
        positive("Search.Watchlists", "traktfrequency", watchlists.traktfrequency)?;
        hour("Search.Watchlists", "popularmovieshour", watchlists.popularmovieshour)?;
        minute("Search.Watchlists", "popularmoviesmin", watchlists.popularmoviesmin)?;

        positive(
            "Postprocessing.Scanner",
            "interval",
            self.postprocessing.scanner.interval,
        )?;

        let files = &self.system.file_management;
        hour("System.FileManagement", "scanmissinghour", files.scanmissinghour)?;
        minute("System.FileManagement", "scanmissingmin", files.scanmissingmin)?;

        let torrent = &self.downloader.torrent;
        if torrent.transmission.enabled && torrent.transmission.url().is_err() {
            return Err(ConfigError::Malformed {
                section: "Downloader.Torrent.Transmission",
                field: "host",
                reason: "is not a valid url",
            });
        }
        if torrent.deluge_web.enabled && torrent.deluge_web.url().is_err() {
            return Err(ConfigError::Malformed {
                section: "Downloader.Torrent.DelugeWeb",
                field: "host",
                reason: "is not a valid url",
            });
        }

        Ok(())
    }

    /// The snapshot as a plain section -> key -> value tree.
    pub fn to_tree(&self) -> serde_json::Value {
        // Every field serializes to a plain JSON value
        serde_json::to_value(self).unwrap_or_default()
    }
}

fn positive(section: &'static str, field: &'static str, value: u32) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::Malformed {
            section,
            field,
            reason: "must be at least 1",
        });
    }
    Ok(())
}

fn hour(section: &'static str, field: &'static str, value: u32) -> Result<(), ConfigError> {
    if value > 23 {
        return Err(ConfigError::Malformed {
            section,
            field,
            reason: "must be an hour between 0 and 23",
        });
    }
    Ok(())
}

fn minute(section: &'static str, field: &'static str, value: u32) -> Result<(), ConfigError> {
    if value > 59 {
        return Err(ConfigError::Malformed {
            section,
            field,
            reason: "must be a minute between 0 and 59",
        });
    }
    Ok(())
}

pub fn read_file(path: &Path) -> Result<Config, ConfigError> {
    let file = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let cfg: Config = toml::from_str(&file)?;
    cfg.validate()?;
    Ok(cfg)
}

/// Writes through a sibling temp file so a crash never leaves half a config
/// behind.
fn write_file(path: &Path, cfg: &Config) -> Result<(), ConfigError> {
    let content = toml::to_string_pretty(cfg)?;
    let tmp = path.with_extension("toml.tmp");

    fs::write(&tmp, content)
        .and_then(|()| fs::rename(&tmp, path))
        .map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
}

/// The two complete snapshots around a committed write.
#[derive(Debug, Clone)]
pub struct ConfigChange {
    pub old: Arc<Config>,
    pub new: Arc<Config>,
}

/// Holds the live snapshot. Writers are serialized and replace the whole
/// snapshot at once; readers get an `Arc` to either the old or the new one.
#[derive(Debug)]
pub struct ConfigStore {
    path: PathBuf,
    current: RwLock<Arc<Config>>,
    writer: Mutex<()>,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>, cfg: Config) -> Self {
        ConfigStore {
            path: path.into(),
            current: RwLock::new(Arc::new(cfg)),
            writer: Mutex::new(()),
        }
    }

    pub fn load(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let cfg = read_file(&path)?;
        Ok(ConfigStore::new(path, cfg))
    }

    /// Loads the file, writing the defaults first when it doesn't exist yet.
    pub fn load_or_create(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        if !path.exists() {
            log::info!("Creating default config file {path:?}");
            write_file(&path, &Config::default())?;
        }
        ConfigStore::load(path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn snapshot(&self) -> Arc<Config> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Validates and persists `new`, then makes it the live snapshot.
    pub fn write(&self, new: Config) -> Result<ConfigChange, ConfigError> {
        self.write_then(new, ConfigChange::clone)
    }

    /// Like [`ConfigStore::write`], running `then` on the committed change
    /// before any other writer can commit.
    pub fn write_then<R>(
        &self,
        new: Config,
        then: impl FnOnce(&ConfigChange) -> R,
    ) -> Result<R, ConfigError> {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        new.validate()?;
        write_file(&self.path, &new)?;
        Ok(then(&self.swap(new)))
    }

    /// Re-reads the file from disk, for edits made outside the process.
    pub fn reload(&self) -> Result<ConfigChange, ConfigError> {
        self.reload_then(ConfigChange::clone)
    }

    /// Like [`ConfigStore::reload`], running `then` under the writer lock.
    pub fn reload_then<R>(
        &self,
        then: impl FnOnce(&ConfigChange) -> R,
    ) -> Result<R, ConfigError> {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let new = read_file(&self.path)?;
        Ok(then(&self.swap(new)))
    }

    fn swap(&self, new: Config) -> ConfigChange {
        let new = Arc::new(new);
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        let old = std::mem::replace(&mut *current, new.clone());
        ConfigChange { old, new }
    }
}
