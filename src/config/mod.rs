use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::pipeline::{
    CLONE_SIZE_THRESHOLD_DEFAULT, FLUSH_THRESHOLD_DEFAULT, LINK_SIMILARITY_DEFAULT,
    POLL_INTERVAL_DEFAULT, PipelineSettings, default_workers,
};
use crate::vcs::{Language, VcsError};

pub const PROJECT_CONFIG_FILE: &str = ".clonegen.project.yml";

#[derive(Debug, Clone, PartialEq)]
pub struct EffectiveConfig {
    pub workers: usize,
    pub flush_threshold: usize,
    pub poll_interval_ms: u64,
    pub cross_project: bool,
    pub clone_size_threshold: u32,
    pub link_similarity: f32,
    pub include: Vec<String>,
}

impl Default for EffectiveConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            flush_threshold: FLUSH_THRESHOLD_DEFAULT,
            poll_interval_ms: u64::try_from(POLL_INTERVAL_DEFAULT.as_millis()).unwrap_or(1_000),
            cross_project: false,
            clone_size_threshold: CLONE_SIZE_THRESHOLD_DEFAULT,
            link_similarity: LINK_SIMILARITY_DEFAULT,
            include: Language::default_globs(),
        }
    }
}

impl EffectiveConfig {
    pub fn settings(&self) -> PipelineSettings {
        PipelineSettings {
            workers: self.workers,
            flush_threshold: self.flush_threshold,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            cross_project: self.cross_project,
            clone_size_threshold: self.clone_size_threshold,
            link_similarity: self.link_similarity,
        }
    }

    pub fn language(&self) -> Result<Language, VcsError> {
        Language::from_globs(&self.include)
    }

    /// Command-line flags are the last layer.
    pub fn with_overrides(mut self, overrides: &Overrides) -> Result<Self, ConfigError> {
        let layer = RawConfig {
            workers: overrides.workers,
            flush_threshold: overrides.flush_threshold,
            poll_interval_ms: overrides.interval_ms,
            cross_project: overrides.cross_project.then_some(true),
            ..RawConfig::default()
        };
        merge_layer(&mut self, layer.validated()?);
        Ok(self)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Overrides {
    pub workers: Option<usize>,
    pub flush_threshold: Option<usize>,
    pub interval_ms: Option<u64>,
    pub cross_project: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default)]
    workers: Option<usize>,
    #[serde(default)]
    flush_threshold: Option<usize>,
    #[serde(default)]
    poll_interval_ms: Option<u64>,
    #[serde(default)]
    cross_project: Option<bool>,
    #[serde(default)]
    clone_size_threshold: Option<u32>,
    #[serde(default)]
    link_similarity: Option<f32>,
    #[serde(default)]
    include: Option<Vec<String>>,
}

impl RawConfig {
    fn validated(self) -> Result<Self, ConfigError> {
        if self.workers == Some(0) {
            return Err(ConfigError::invalid("workers", "must be at least 1"));
        }
        if self.flush_threshold == Some(0) {
            return Err(ConfigError::invalid("flush_threshold", "must be at least 1"));
        }
        if self.poll_interval_ms == Some(0) {
            return Err(ConfigError::invalid("poll_interval_ms", "must be at least 1"));
        }
        if let Some(similarity) = self.link_similarity
            && !(0.0..=1.0).contains(&similarity)
        {
            return Err(ConfigError::invalid(
                "link_similarity",
                "must be between 0.0 and 1.0",
            ));
        }
        if let Some(include) = &self.include
            && include.iter().all(|glob| glob.trim().is_empty())
        {
            return Err(ConfigError::invalid("include", "must name at least one glob"));
        }
        Ok(self)
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Yaml(serde_yaml::Error),
    Invalid { field: &'static str, message: String },
}

impl ConfigError {
    fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(err) => write!(f, "{err}"),
            Self::Yaml(err) => write!(f, "{err}"),
            Self::Invalid { field, message } => write!(f, "invalid `{field}`: {message}"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(value: serde_yaml::Error) -> Self {
        Self::Yaml(value)
    }
}

/// Merges user, nearest project and repository layers; later layers win field by field.
pub fn load_effective_config(
    cwd: &Path,
    repo_config: Option<&Path>,
    user_config: Option<&Path>,
) -> Result<EffectiveConfig, ConfigError> {
    let mut merged = EffectiveConfig::default();

    if let Some(path) = user_config.filter(|path| path.exists()) {
        merge_layer(&mut merged, load_config_layer(path)?);
    }

    if let Some(path) = find_nearest_project_config(cwd) {
        merge_layer(&mut merged, load_config_layer(&path)?);
    }

    if let Some(path) = repo_config.filter(|path| path.exists()) {
        merge_layer(&mut merged, load_config_layer(path)?);
    }

    Ok(merged)
}

pub fn find_nearest_project_config(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .map(|dir| dir.join(PROJECT_CONFIG_FILE))
        .find(|candidate| candidate.is_file())
}

fn merge_layer(merged: &mut EffectiveConfig, layer: RawConfig) {
    if let Some(workers) = layer.workers {
        merged.workers = workers;
    }
    if let Some(flush_threshold) = layer.flush_threshold {
        merged.flush_threshold = flush_threshold;
    }
    if let Some(poll_interval_ms) = layer.poll_interval_ms {
        merged.poll_interval_ms = poll_interval_ms;
    }
    if let Some(cross_project) = layer.cross_project {
        merged.cross_project = cross_project;
    }
    if let Some(clone_size_threshold) = layer.clone_size_threshold {
        merged.clone_size_threshold = clone_size_threshold;
    }
    if let Some(link_similarity) = layer.link_similarity {
        merged.link_similarity = link_similarity;
    }
    if let Some(include) = layer.include {
        merged.include = include;
    }
}

fn load_config_layer(path: &Path) -> Result<RawConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    parse_config_layer(&content)
}

fn parse_config_layer(content: &str) -> Result<RawConfig, ConfigError> {
    // an empty or comment-only file is an empty layer
    let value: serde_yaml::Value = serde_yaml::from_str(content)?;
    if value.is_null() {
        return Ok(RawConfig::default());
    }
    let raw: RawConfig = serde_yaml::from_value(value)?;
    raw.validated()
}

pub fn load_config_file(path: &Path) -> Result<EffectiveConfig, ConfigError> {
    let mut config = EffectiveConfig::default();
    merge_layer(&mut config, load_config_layer(path)?);
    Ok(config)
}

pub fn default_repo_config_yaml() -> String {
    let include = Language::default_globs()
        .iter()
        .map(|glob| format!("  - \"{glob}\"\n"))
        .collect::<String>();
    format!(
        "# workers: 8\nflush_threshold: {FLUSH_THRESHOLD_DEFAULT}\npoll_interval_ms: {}\n\
         cross_project: false\nclone_size_threshold: {CLONE_SIZE_THRESHOLD_DEFAULT}\n\
         link_similarity: {LINK_SIMILARITY_DEFAULT}\ninclude:\n{include}",
        POLL_INTERVAL_DEFAULT.as_millis(),
    )
}

pub fn default_global_config_yaml() -> String {
    "# settings here apply to every repository unless overridden\n# workers: 8\n# flush_threshold: 10000\n"
        .to_string()
}

pub fn expand_tilde(path: &str, home: &Path) -> PathBuf {
    if path == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = path.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(path)
}
