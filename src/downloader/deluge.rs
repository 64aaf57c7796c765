use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{COOKIE, SET_COOKIE};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use url::Url;

use crate::config::{self, Priority};
use crate::downloader::{DownloaderClient, TorrentRecord};
use crate::error::DownloaderError;
use crate::persistence::ProgressMap;
use crate::stall::{NativeTimers, Observation, TorrentStatus};
use crate::{Release, ReleaseKind, TIMEOUT};

const NAME: &str = "DelugeWeb";

/// Deluge answers with this code when the session cookie is missing or
/// expired.
const NOT_AUTHENTICATED: i64 = 1;

const STATUS_FIELDS: [&str; 7] = [
    "hash",
    "state",
    "name",
    "last_seen_complete",
    "time_since_download",
    "total_payload_download",
    "active_time",
];

/// Login state of one Deluge Web account.
#[derive(Debug, Default)]
struct Session {
    cookie: Option<String>,
    next_id: u64,
}

impl Session {
    fn command(&mut self, method: &str, params: &Value) -> Value {
        let id = self.next_id;
        self.next_id += 1;
        json!({ "method": method, "params": params, "id": id })
    }
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Value,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    message: String,
    #[serde(default)]
    code: i64,
}

pub struct Client {
    http: reqwest::Client,
    url: Url,
    password: String,
    label: String,
    priority: Priority,
    add_paused: bool,
    seed_ratio: Option<f64>,
    remove_at_ratio: bool,
    session: Mutex<Session>,
}

impl Client {
    pub fn new(cfg: &config::DelugeWeb) -> Result<Self, DownloaderError> {
        let password = cfg
            .password
            .resolve()
            .map_err(|source| DownloaderError::Credentials {
                backend: NAME.to_string(),
                source,
            })?;
        let url = cfg
            .url()
            .map_err(|err| DownloaderError::unavailable(NAME, err))?;
        let http = reqwest::Client::builder()
            .timeout(TIMEOUT)
            .user_agent("reelwatch")
            .build()
            .map_err(|err| DownloaderError::unavailable(NAME, err))?;

        Ok(Self {
            http,
            url,
            password,
            label: sanitize_label(&cfg.category),
            priority: cfg.priority,
            add_paused: cfg.addpaused,
            seed_ratio: cfg.seedratiolimit,
            remove_at_ratio: cfg.removetorrents,
            session: Mutex::new(Session::default()),
        })
    }

    /// Calls a JSON-RPC method, logging in first when there is no session
    /// and once more if the session turned out to be expired.
    async fn call(&self, method: &str, params: Value) -> Result<Value, DownloaderError> {
        let mut session = self.session.lock().await;
        if session.cookie.is_none() {
            self.login(&mut session).await?;
        }

        let mut response = self.send(&mut session, method, &params).await?;
        if matches!(&response.error, Some(err) if err.code == NOT_AUTHENTICATED) {
            log::debug!("Deluge session expired, logging in again");
            self.login(&mut session).await?;
            response = self.send(&mut session, method, &params).await?;
        }

        match response.error {
            Some(err) => Err(DownloaderError::rejected(
                NAME,
                format!("{method}: {}", err.message),
            )),
            None => Ok(response.result),
        }
    }

    async fn send(
        &self,
        session: &mut Session,
        method: &str,
        params: &Value,
    ) -> Result<RpcResponse, DownloaderError> {
        let command = session.command(method, params);
        let mut request = self.http.post(self.url.clone()).json(&command);
        if let Some(cookie) = &session.cookie {
            request = request.header(COOKIE, cookie);
        }

        request
            .send()
            .await
            .map_err(|err| DownloaderError::unavailable(NAME, err))?
            .json()
            .await
            .map_err(|err| DownloaderError::unavailable(NAME, err))
    }

    async fn login(&self, session: &mut Session) -> Result<(), DownloaderError> {
        log::info!("Logging in to Deluge Web UI");
        session.cookie = None;

        let command = session.command("auth.login", &json!([self.password]));
        let response = self
            .http
            .post(self.url.clone())
            .json(&command)
            .send()
            .await
            .map_err(|err| DownloaderError::unavailable(NAME, err))?;

        let cookie = response
            .headers()
            .get(SET_COOKIE)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(';').next())
            .map(str::to_string);
        let body: RpcResponse = response
            .json()
            .await
            .map_err(|err| DownloaderError::unavailable(NAME, err))?;

        match (cookie, body.result.as_bool()) {
            (Some(cookie), Some(true)) => {
                session.cookie = Some(cookie);
                Ok(())
            }
            _ => Err(DownloaderError::rejected(NAME, "incorrect password")),
        }
    }

    async fn set_label(&self, hash: &str) -> Result<(), DownloaderError> {
        if self.label.is_empty() {
            return Ok(());
        }
        log::info!("Applying label {} to torrent {hash} in Deluge Web UI", self.label);

        let labels: Vec<String> = decode(self.call("label.get_labels", json!([])).await?)?;
        if !labels.contains(&self.label) {
            log::info!("Adding label {} to Deluge", self.label);
            self.call("label.add", json!([self.label])).await?;
        }
        self.call("label.set_torrent", json!([hash.to_lowercase(), self.label]))
            .await?;
        Ok(())
    }

    fn add_options(&self, download_location: String) -> Value {
        let mut options = json!({
            "add_paused": self.add_paused,
            "download_location": download_location,
            "priority": self.priority.deluge_value(),
        });
        match self.seed_ratio {
            Some(ratio) if ratio < 0.0 => options["stop_at_ratio"] = json!(false),
            Some(ratio) => {
                options["stop_at_ratio"] = json!(true);
                options["stop_ratio"] = json!(ratio);
            }
            None => {}
        }
        if self.remove_at_ratio {
            options["remove_at_ratio"] = json!(true);
        }
        options
    }
}

#[async_trait]
impl DownloaderClient for Client {
    fn name(&self) -> &str {
        NAME
    }

    async fn submit(&self, release: &Release) -> Result<String, DownloaderError> {
        log::info!("Sending torrent {} to Deluge Web UI", release.title);

        let download_dir: String = decode(
            self.call("core.get_config_value", json!(["download_location"]))
                .await?,
        )?;
        let location = format!("{download_dir}/{}", self.label);

        let path = match release.kind {
            ReleaseKind::Torrent => decode::<String>(
                self.call(
                    "web.download_torrent_from_url",
                    json!([release.torrentfile]),
                )
                .await?,
            )?,
            ReleaseKind::Magnet => release.torrentfile.clone(),
        };

        let torrent = json!({ "path": path, "options": self.add_options(location) });
        let result = self.call("web.add_torrents", json!([[torrent]])).await?;
        let hash = added_hash(&result, release)?;

        if let Err(err) = self.set_label(&hash).await {
            log::error!("Unable to label torrent {hash}: {err}");
        }
        Ok(hash)
    }

    async fn cancel(&self, download_id: &str) -> Result<bool, DownloaderError> {
        log::info!("Cancelling download {download_id} in Deluge Web UI");
        let result = self
            .call(
                "core.remove_torrent",
                json!([download_id.to_lowercase(), true]),
            )
            .await?;
        Ok(result.as_bool().unwrap_or(false))
    }

    async fn status(
        &self,
        ids: &[String],
        stalled_for: Option<u32>,
        prior: &ProgressMap,
    ) -> Result<Vec<TorrentRecord>, DownloaderError> {
        log::debug!("Get torrents from DelugeWeb: {ids:?}");
        let filter = if ids.is_empty() {
            json!({})
        } else {
            json!({ "id": ids })
        };

        let result = self
            .call("core.get_torrents_status", json!([filter, STATUS_FIELDS]))
            .await?;
        Ok(records(result, stalled_for, prior, Utc::now()))
    }
}

fn decode<T: DeserializeOwned>(value: Value) -> Result<T, DownloaderError> {
    serde_json::from_value(value).map_err(|err| DownloaderError::unavailable(NAME, err))
}

#[derive(Debug, Deserialize)]
struct DelugeTorrent {
    hash: String,
    state: String,
    name: String,
    last_seen_complete: Option<i64>,
    time_since_download: Option<i64>,
    total_payload_download: Option<u64>,
    #[serde(default)]
    active_time: i64,
}

impl DelugeTorrent {
    fn observation(&self) -> Observation {
        let status = match self.state.to_lowercase().as_str() {
            "downloading" => TorrentStatus::Downloading,
            "seeding" => TorrentStatus::Finished,
            _ => TorrentStatus::Unknown,
        };

        // Deluge 2 keeps timers, Deluge 1 only reports the payload count
        let timers = match (self.last_seen_complete, self.time_since_download) {
            (Some(last_seen_complete), Some(time_since_download)) => Some(NativeTimers {
                last_seen_complete,
                time_since_download,
                active_time: self.active_time,
            }),
            _ => None,
        };

        Observation {
            status,
            bytes: self.total_payload_download,
            timers,
        }
    }
}

/// Deluge answers with an empty object for every requested hash it doesn't
/// know; those are dropped.
fn records(
    result: Value,
    stalled_for: Option<u32>,
    prior: &ProgressMap,
    now: DateTime<Utc>,
) -> Vec<TorrentRecord> {
    let Value::Object(torrents) = result else {
        return Vec::new();
    };

    torrents
        .into_iter()
        .filter(|(_, torrent)| torrent.as_object().is_some_and(|t| !t.is_empty()))
        .filter_map(|(id, torrent)| match serde_json::from_value::<DelugeTorrent>(torrent) {
            Ok(torrent) => Some(torrent),
            Err(err) => {
                log::warn!("Skipping unreadable Deluge torrent {id}: {err}");
                None
            }
        })
        .map(|torrent| {
            let id = torrent.hash.to_lowercase();
            TorrentRecord::observe(
                id.clone(),
                torrent.name.clone(),
                &torrent.observation(),
                prior.get(&id),
                stalled_for,
                now,
            )
        })
        .collect()
}

/// Deluge 1 answers `true`, Deluge 2 `[[true, hash]]`.
fn added_hash(result: &Value, release: &Release) -> Result<String, DownloaderError> {
    if result.as_bool() == Some(true) {
        return magnet_hash(&release.torrentfile).ok_or_else(|| {
            DownloaderError::rejected(NAME, "torrent added but its hash is unknown")
        });
    }

    match result.pointer("/0/0").and_then(Value::as_bool) {
        Some(true) => result
            .pointer("/0/1")
            .and_then(Value::as_str)
            .map(str::to_lowercase)
            .ok_or_else(|| DownloaderError::rejected(NAME, "add response carries no hash")),
        _ => Err(DownloaderError::rejected(
            NAME,
            format!("failed to add `{}`", release.title),
        )),
    }
}

fn magnet_hash(uri: &str) -> Option<String> {
    let url = Url::parse(uri).ok()?;
    if url.scheme() != "magnet" {
        return None;
    }
    url.query_pairs().find_map(|(key, value)| {
        (key == "xt")
            .then(|| value.strip_prefix("urn:btih:").map(str::to_lowercase))
            .flatten()
    })
}

fn sanitize_label(label: &str) -> String {
    label
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '_' || *c == '-')
        .collect()
}
