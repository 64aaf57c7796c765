//! Maps config changes to task reloads.
//!
//! A [`ConfigDiff`] holds only the leaves that differ between two complete
//! snapshots, nested like the snapshots themselves. [`route`] turns it into
//! the trigger reloads it implies using a fixed rule table.

use chrono::{DateTime, Local};
use serde_json::{Map, Value};

use crate::config::Config;
use crate::jobs::{self, Occasion};
use crate::scheduler::Trigger;

/// Changed leaves between two config trees.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigDiff(Map<String, Value>);

impl ConfigDiff {
    /// Keys present in `new` with a value missing from or different in `old`.
    /// Keys that only exist in `old` are not reported.
    pub fn between(old: &Value, new: &Value) -> Self {
        match (old, new) {
            (Value::Object(old), Value::Object(new)) => ConfigDiff(diff_maps(Some(old), new)),
            (_, Value::Object(new)) => ConfigDiff(diff_maps(None, new)),
            _ => ConfigDiff::default(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The changed subtree or leaf at `path`.
    pub fn get(&self, path: &[&str]) -> Option<&Value> {
        let (first, rest) = path.split_first()?;
        rest.iter()
            .try_fold(self.0.get(*first)?, |node, key| node.get(*key))
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

fn diff_maps(old: Option<&Map<String, Value>>, new: &Map<String, Value>) -> Map<String, Value> {
    let mut changed = Map::new();

    for (key, value) in new {
        let before = old.and_then(|old| old.get(key));
        match (before, value) {
            (Some(Value::Object(before)), Value::Object(after)) => {
                let nested = diff_maps(Some(before), after);
                if !nested.is_empty() {
                    changed.insert(key.clone(), Value::Object(nested));
                }
            }
            (Some(before), after) if before == after => {}
            _ => {
                changed.insert(key.clone(), value.clone());
            }
        }
    }

    changed
}

/// Segment matching any key at its level.
const ANY: &str = "*";

/// A change to any of `keys` under `section` reloads `task`.
struct Rule {
    section: &'static [&'static str],
    keys: &'static [&'static str],
    task: &'static str,
}

const RULES: [Rule; 9] = [
    Rule {
        section: &["Server"],
        keys: &["checkupdates", "checkupdatefrequency"],
        task: jobs::UPDATE_CHECKER,
    },
    Rule {
        section: &["Search"],
        keys: &["rsssyncfrequency"],
        task: jobs::MOVIE_SEARCH,
    },
    Rule {
        section: &["Search", "Watchlists"],
        keys: &["imdbfrequency", "imdbsync"],
        task: jobs::IMDB_SYNC,
    },
    Rule {
        section: &["Search", "Watchlists"],
        keys: &["popularmoviessync", "popularmovieshour", "popularmoviesmin"],
        task: jobs::POPULAR_MOVIES_SYNC,
    },
    Rule {
        section: &["Search", "Watchlists"],
        keys: &["traktsync", "traktfrequency"],
        task: jobs::TRAKT_SYNC,
    },
    Rule {
        section: &["Postprocessing", "Scanner"],
        keys: &["interval", "enabled"],
        task: jobs::POSTPROCESSING_SCAN,
    },
    Rule {
        section: &["System", "FileManagement"],
        keys: &["scanmissingfiles", "scanmissinghour", "scanmissingmin"],
        task: jobs::MISSING_FILES_SCAN,
    },
    Rule {
        section: &["Downloader", "Torrent", ANY],
        keys: &["enabled", "removetorrents", "removestalledfor"],
        task: jobs::TORRENTS_STATUS_CHECK,
    },
    Rule {
        section: &["Downloader", "Sources"],
        keys: &["torrentenabled"],
        task: jobs::TORRENTS_STATUS_CHECK,
    },
];

impl Rule {
    fn matches(&self, diff: &ConfigDiff) -> bool {
        sections(&diff.0, self.section)
            .into_iter()
            .any(|section| self.keys.iter().any(|key| section.contains_key(*key)))
    }
}

/// Every changed section reachable through `path`, expanding [`ANY`].
fn sections<'a>(root: &'a Map<String, Value>, path: &[&str]) -> Vec<&'a Map<String, Value>> {
    let Some((first, rest)) = path.split_first() else {
        return vec![root];
    };

    let children: Vec<&Value> = if *first == ANY {
        root.values().collect()
    } else {
        root.get(*first).into_iter().collect()
    };

    children
        .into_iter()
        .filter_map(Value::as_object)
        .flat_map(|child| sections(child, rest))
        .collect()
}

/// A trigger to apply to an existing task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reload {
    pub task: &'static str,
    pub trigger: Trigger,
}

/// Reloads implied by `diff`, each task at most once, with triggers derived
/// from the committed snapshot `cfg`.
pub fn route(diff: &ConfigDiff, cfg: &Config, now: DateTime<Local>) -> Vec<Reload> {
    let mut reloads: Vec<Reload> = Vec::new();

    for rule in &RULES {
        if reloads.iter().any(|r| r.task == rule.task) || !rule.matches(diff) {
            continue;
        }
        if let Some(trigger) = jobs::trigger_for(rule.task, cfg, now, Occasion::Reload) {
            reloads.push(Reload {
                task: rule.task,
                trigger,
            });
        }
    }

    reloads
}
