use std::collections::HashSet;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use crate::classify::DEFAULT_TOLERATED_EMBED_SIGNATURES;
use crate::error::QmdError;
use crate::error::Result;

pub const ENV_PREFIX: &str = "CODEX_QMD_";

const MIN_OPEN_MAX_BYTES: usize = 256;

/// Configuration for the qmd orchestration layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QmdConfig {
    /// Directory holding one sub-directory per workspace
    #[serde(default = "default_workspace_root")]
    pub workspace_root: PathBuf,

    /// Engine executable, looked up on PATH when not absolute
    #[serde(default = "default_binary")]
    pub binary: String,

    /// Forward engine invocations to a sidecar instead of spawning locally
    #[serde(default)]
    pub sidecar_url: Option<String>,

    /// Index name passed as `--index` on every invocation
    #[serde(default = "default_index_name")]
    pub index_name: String,

    /// Collection registered for each workspace
    #[serde(default = "default_collection")]
    pub collection: String,

    /// Model cache shared by every workspace through a symlink
    #[serde(default)]
    pub shared_models_dir: Option<PathBuf>,

    /// Changed paths matching these globs are indexed without embedding
    #[serde(default)]
    pub embed_exclude: Vec<String>,

    #[serde(default = "default_search_limit")]
    pub search_limit: usize,

    #[serde(default = "default_open_max_bytes")]
    pub open_max_bytes: usize,

    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    #[serde(default = "default_index_timeout_secs")]
    pub index_timeout_secs: u64,

    #[serde(default = "default_query_timeout_secs")]
    pub query_timeout_secs: u64,

    /// Run `embed` after `update` when vectors are pending
    #[serde(default = "default_true")]
    pub auto_embed: bool,

    /// Embed failures containing one of these are logged and skipped
    #[serde(default = "default_tolerated_embed_signatures")]
    pub tolerated_embed_signatures: Vec<String>,
}

fn default_workspace_root() -> PathBuf {
    PathBuf::from("workspaces")
}

fn default_binary() -> String {
    "qmd".to_string()
}

fn default_index_name() -> String {
    "agent-runtime".to_string()
}

fn default_collection() -> String {
    "workspace".to_string()
}

fn default_search_limit() -> usize {
    5
}

fn default_open_max_bytes() -> usize {
    1600
}

fn default_debounce_ms() -> u64 {
    3_000
}

fn default_index_timeout_secs() -> u64 {
    180
}

fn default_query_timeout_secs() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_tolerated_embed_signatures() -> Vec<String> {
    DEFAULT_TOLERATED_EMBED_SIGNATURES
        .iter()
        .map(|signature| (*signature).to_string())
        .collect()
}

impl Default for QmdConfig {
    fn default() -> Self {
        Self {
            workspace_root: default_workspace_root(),
            binary: default_binary(),
            sidecar_url: None,
            index_name: default_index_name(),
            collection: default_collection(),
            shared_models_dir: None,
            embed_exclude: Vec::new(),
            search_limit: default_search_limit(),
            open_max_bytes: default_open_max_bytes(),
            debounce_ms: default_debounce_ms(),
            index_timeout_secs: default_index_timeout_secs(),
            query_timeout_secs: default_query_timeout_secs(),
            auto_embed: true,
            tolerated_embed_signatures: default_tolerated_embed_signatures(),
        }
    }
}

impl QmdConfig {
    pub fn new(workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            ..Default::default()
        }
    }

    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        toml::from_str(&contents)
            .map_err(|err| QmdError::Config(format!("{}: {err}", path.display())))
    }

    /// Replaces blank or out-of-range values with defaults and normalizes
    /// the embed exclusion globs.
    pub fn normalized(mut self) -> Self {
        if self.binary.trim().is_empty() {
            self.binary = default_binary();
        }
        if self.index_name.trim().is_empty() {
            self.index_name = default_index_name();
        }
        if self.collection.trim().is_empty() {
            self.collection = default_collection();
        }
        self.sidecar_url = self
            .sidecar_url
            .map(|url| url.trim().trim_end_matches('/').to_string())
            .filter(|url| !url.is_empty());
        self.shared_models_dir = self
            .shared_models_dir
            .filter(|dir| !dir.as_os_str().is_empty());
        if self.search_limit == 0 {
            self.search_limit = default_search_limit();
        }
        if self.open_max_bytes < MIN_OPEN_MAX_BYTES {
            self.open_max_bytes = default_open_max_bytes();
        }
        if self.debounce_ms == 0 {
            self.debounce_ms = default_debounce_ms();
        }
        if self.index_timeout_secs == 0 {
            self.index_timeout_secs = default_index_timeout_secs();
        }
        if self.query_timeout_secs == 0 {
            self.query_timeout_secs = default_query_timeout_secs();
        }
        let mut seen = HashSet::new();
        self.embed_exclude = self
            .embed_exclude
            .iter()
            .map(|pattern| normalize_pattern(pattern))
            .filter(|pattern| !pattern.is_empty() && seen.insert(pattern.clone()))
            .collect();
        self
    }

    /// Applies `CODEX_QMD_*` overrides from the process environment.
    pub fn apply_env(self) -> Result<Self> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    pub fn apply_env_from<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| {
            lookup(&format!("{ENV_PREFIX}{name}"))
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        if let Some(value) = var("WORKSPACE_ROOT") {
            self.workspace_root = PathBuf::from(value);
        }
        if let Some(value) = var("BINARY") {
            self.binary = value;
        }
        if let Some(value) = var("SIDECAR_URL") {
            self.sidecar_url = Some(value);
        }
        if let Some(value) = var("INDEX") {
            self.index_name = value;
        }
        if let Some(value) = var("COLLECTION") {
            self.collection = value;
        }
        if let Some(value) = var("SHARED_MODELS_DIR") {
            self.shared_models_dir = Some(PathBuf::from(value));
        }
        if let Some(value) = var("EMBED_EXCLUDE") {
            self.embed_exclude = value.split(',').map(str::to_string).collect();
        }
        if let Some(value) = var("SEARCH_LIMIT") {
            self.search_limit = parse_number("SEARCH_LIMIT", &value)?;
        }
        if let Some(value) = var("OPEN_MAX_BYTES") {
            self.open_max_bytes = parse_number("OPEN_MAX_BYTES", &value)?;
        }
        if let Some(value) = var("DEBOUNCE_MS") {
            self.debounce_ms = parse_number("DEBOUNCE_MS", &value)?;
        }
        if let Some(value) = var("INDEX_TIMEOUT_SECS") {
            self.index_timeout_secs = parse_number("INDEX_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = var("QUERY_TIMEOUT_SECS") {
            self.query_timeout_secs = parse_number("QUERY_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = var("AUTO_EMBED") {
            self.auto_embed = parse_bool("AUTO_EMBED", &value)?;
        }
        Ok(self)
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.workspace_root.as_os_str().is_empty() {
            return Err("Workspace root must be set".to_string());
        }
        if let Some(url) = &self.sidecar_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(format!("Sidecar URL must be http(s): {url}"));
            }
        }
        Ok(())
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn index_timeout(&self) -> Duration {
        Duration::from_secs(self.index_timeout_secs)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }
}

pub(crate) fn normalize_pattern(pattern: &str) -> String {
    let value = pattern.trim().replace('\\', "/");
    let value = value.strip_prefix("./").unwrap_or(&value);
    let value = value.strip_prefix('/').unwrap_or(value);
    value.to_string()
}

fn parse_number<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| QmdError::Config(format!("{ENV_PREFIX}{name} must be a number, got {value:?}")))
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(QmdError::Config(format!(
            "{ENV_PREFIX}{name} must be a boolean, got {value:?}"
        ))),
    }
}
