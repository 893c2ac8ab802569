//! Persistent map of known menu routes.
//!
//! Saves re-discovering the menu structure on every run. Routes are keyed by
//! menu text; validation rules are keyed by normalized URL so they can be
//! found from whatever URL the browser ends up on.
//!
//! A cache file that is too old, was written for another application URL or
//! carries another format version loads as empty.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{RegressError, RegressResult};
use crate::session::store::replace_file;
use crate::validate::ValidationRules;

const LOG_TARGET: &str = "menu_regress::cache";

pub const CACHE_VERSION: &str = "1.0";

/// One known menu → route binding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteEntry {
    /// Normalized URL
    pub url: String,
    pub original_url: String,
    pub level: u32,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Routes {
    #[serde(default)]
    menu_routes: BTreeMap<String, RouteEntry>,
    #[serde(default)]
    route_validation: BTreeMap<String, ValidationRules>,
    #[serde(default = "empty_array")]
    hierarchy: serde_json::Value,
    #[serde(default = "empty_object")]
    parameters: serde_json::Value,
}

impl Default for Routes {
    fn default() -> Self {
        Self {
            menu_routes: BTreeMap::new(),
            route_validation: BTreeMap::new(),
            hierarchy: empty_array(),
            parameters: empty_object(),
        }
    }
}

/// On-disk document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct CacheFile {
    url: String,
    /// Milliseconds since the epoch of the last save
    timestamp: i64,
    version: String,
    routes: Routes,
    #[serde(default = "empty_object")]
    metadata: serde_json::Value,
}

impl CacheFile {
    fn empty(app_url: &str) -> Self {
        Self {
            url: app_url.to_string(),
            timestamp: Utc::now().timestamp_millis(),
            version: CACHE_VERSION.to_string(),
            routes: Routes::default(),
            metadata: empty_object(),
        }
    }
}

fn empty_array() -> serde_json::Value {
    serde_json::Value::Array(Vec::new())
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

pub struct RouteCacheStore {
    path: PathBuf,
    app_url: String,
    max_age: Duration,
    data: CacheFile,
}

impl RouteCacheStore {
    /// Empty cache bound to `path`; nothing is read
    pub fn new(path: impl Into<PathBuf>, app_url: &str, max_age: Duration) -> Self {
        Self {
            path: path.into(),
            app_url: app_url.to_string(),
            max_age,
            data: CacheFile::empty(app_url),
        }
    }

    /// Open the cache at `path`. Missing, unreadable, stale or foreign
    /// files give an empty cache.
    pub fn load(path: impl Into<PathBuf>, app_url: &str, max_age: Duration) -> Self {
        let mut store = Self::new(path, app_url, max_age);
        match read_cache_file(&store.path) {
            Ok(Some(file)) => match store.reject_reason(&file) {
                None => {
                    tracing::info!(
                        target: LOG_TARGET,
                        path = %store.path.display(),
                        routes = file.routes.menu_routes.len(),
                        "route cache loaded"
                    );
                    store.data = file;
                }
                Some(reason) => {
                    tracing::info!(target: LOG_TARGET, path = %store.path.display(), reason, "route cache ignored");
                }
            },
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(target: LOG_TARGET, path = %store.path.display(), error = %e, "route cache unreadable");
            }
        }
        store
    }

    fn reject_reason(&self, file: &CacheFile) -> Option<&'static str> {
        if file.version != CACHE_VERSION {
            Some("version differs")
        } else if file.url != self.app_url {
            Some("written for another application url")
        } else if age_exceeds(file.timestamp, self.max_age) {
            Some("expired")
        } else {
            None
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the cache, stamping it with the current time
    pub fn save(&mut self) -> RegressResult<()> {
        self.data.timestamp = Utc::now().timestamp_millis();
        write_cache_file(&self.path, &self.data)?;
        tracing::debug!(target: LOG_TARGET, path = %self.path.display(), routes = self.len(), "route cache saved");
        Ok(())
    }

    /// Whether the in-memory cache is older than the configured lifetime
    pub fn is_stale(&self) -> bool {
        age_exceeds(self.data.timestamp, self.max_age)
    }

    /// Record (or overwrite) the route of a menu entry
    pub fn record_route(
        &mut self,
        menu_text: &str,
        url: &str,
        level: u32,
        rules: Option<ValidationRules>,
    ) {
        let normalized = normalize_url(url);
        if let Some(rules) = rules {
            self.data.routes.route_validation.insert(normalized.clone(), rules);
        }
        let entry = RouteEntry {
            url: normalized,
            original_url: url.to_string(),
            level: level.max(1),
            recorded_at: Utc::now(),
        };
        self.data.routes.menu_routes.insert(menu_text.to_string(), entry);
    }

    pub fn route_for(&self, menu_text: &str) -> Option<&RouteEntry> {
        self.data.routes.menu_routes.get(menu_text)
    }

    /// Rules for whatever URL form the browser reports
    pub fn rules_for_url(&self, url: &str) -> Option<&ValidationRules> {
        self.data.routes.route_validation.get(&normalize_url(url))
    }

    /// Known routes ordered by menu text
    pub fn routes(&self) -> impl Iterator<Item = (&str, &RouteEntry)> {
        self.data
            .routes
            .menu_routes
            .iter()
            .map(|(text, entry)| (text.as_str(), entry))
    }

    pub fn len(&self) -> usize {
        self.data.routes.menu_routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.routes.menu_routes.is_empty()
    }

    /// Drop every route and rule. Opaque hierarchy data goes too.
    pub fn clear(&mut self) {
        self.data.routes = Routes::default();
        tracing::info!(target: LOG_TARGET, "route cache cleared");
    }

    /// Merge routes from another cache file, ignoring its age and origin.
    /// Imported routes overwrite existing ones with the same menu text.
    pub fn import(&mut self, path: &Path) -> RegressResult<usize> {
        let file = read_cache_file(path)?.ok_or_else(|| {
            RegressError::Persistence(format!("no cache file at {}", path.display()))
        })?;
        let count = file.routes.menu_routes.len();
        self.data.routes.menu_routes.extend(file.routes.menu_routes);
        self.data
            .routes
            .route_validation
            .extend(file.routes.route_validation);
        tracing::info!(target: LOG_TARGET, from = %path.display(), count, "routes imported");
        Ok(count)
    }

    /// Write the current cache to another file
    pub fn export(&self, path: &Path) -> RegressResult<()> {
        write_cache_file(path, &self.data)
    }
}

fn age_exceeds(timestamp_ms: i64, max_age: Duration) -> bool {
    let age = Utc::now().timestamp_millis().saturating_sub(timestamp_ms);
    age.max(0) as u128 > max_age.as_millis()
}

fn read_cache_file(path: &Path) -> RegressResult<Option<CacheFile>> {
    if !path.exists() {
        return Ok(None);
    }
    let data = fs::read(path)?;
    Ok(Some(serde_json::from_slice(&data)?))
}

fn write_cache_file(path: &Path, data: &CacheFile) -> RegressResult<()> {
    replace_file(path, &serde_json::to_vec_pretty(data)?)
}

/// Canonical form used for route lookups.
///
/// Scheme and host are lowercased, the query is dropped, repeated `/` are
/// collapsed and a trailing `/` is trimmed. A fragment is kept without its
/// own `?query`.
pub fn normalize_url(raw: &str) -> String {
    let trimmed = raw.trim();
    let Ok(url) = url::Url::parse(trimmed) else {
        return trimmed.trim_end_matches('/').to_string();
    };

    let mut out = format!("{}://", url.scheme());
    if let Some(host) = url.host_str() {
        out.push_str(host);
    }
    if let Some(port) = url.port() {
        out.push_str(&format!(":{}", port));
    }

    let mut path = String::with_capacity(url.path().len());
    for c in url.path().chars() {
        if c == '/' && path.ends_with('/') {
            continue;
        }
        path.push(c);
    }
    out.push_str(path.trim_end_matches('/'));

    if let Some(fragment) = url.fragment() {
        let fragment = fragment.split('?').next().unwrap_or_default();
        if !fragment.is_empty() {
            out.push('#');
            out.push_str(fragment);
        }
    }
    out
}
