use crate::error::SlugError;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::{
    fs::{read_to_string, write},
    path::PathBuf,
};

/// Characters replaced in generated slugs unless a site overrides them.
pub const DEFAULT_FORBIDDEN_CHARS: &str = "\\:*?\"<>|&%.'#[]+=\u{201e}\u{201c} ";

/// Whether the subtree below a changed node is resolved before the trigger returns.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GenerationMode {
    /// The node is saved inline, its subtree goes to the generation queue.
    #[default]
    Deferred,
    /// The whole affected subtree is built, checked and saved inline.
    Synchronous,
}

/// What to do when a generated slug duplicates another node's slug.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictPolicy {
    /// Abort the whole save.
    Error,
    /// Leave the conflicting slug unsaved, log it, commit the rest.
    #[default]
    Skip,
    /// Append a numeric suffix until the slug is unique.
    Append,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SiteConfig {
    pub mode: GenerationMode,
    pub conflict_policy: ConflictPolicy,
    pub log_conflicts: bool,
    /// Generate slugs for cultures the node has no document in, from the default culture.
    pub generate_if_missing: bool,
    /// Build and save immediate children inline before deferring the rest.
    pub sync_children: bool,
    pub forbidden_chars: String,
    pub replacement_char: char,
    pub lowercase: bool,
    pub max_append_attempts: u32,
}

impl Default for SiteConfig {
    fn default() -> Self {
        SiteConfig {
            mode: GenerationMode::default(),
            conflict_policy: ConflictPolicy::default(),
            log_conflicts: true,
            generate_if_missing: false,
            sync_children: false,
            forbidden_chars: DEFAULT_FORBIDDEN_CHARS.to_string(),
            replacement_char: '-',
            lowercase: true,
            max_append_attempts: 20,
        }
    }
}

impl SiteConfig {
    /// Strict sites resolve everything inline and refuse to save anything on conflict.
    pub fn is_strict(&self) -> bool {
        self.mode == GenerationMode::Synchronous && self.conflict_policy == ConflictPolicy::Error
    }
}

/// Per-site overrides of [SlugConfig::defaults]. Unset keys inherit.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteOverrides {
    pub mode: Option<GenerationMode>,
    pub conflict_policy: Option<ConflictPolicy>,
    pub log_conflicts: Option<bool>,
    pub generate_if_missing: Option<bool>,
    pub sync_children: Option<bool>,
    pub forbidden_chars: Option<String>,
    pub replacement_char: Option<char>,
    pub lowercase: Option<bool>,
    pub max_append_attempts: Option<u32>,
}

impl SiteOverrides {
    pub fn apply(&self, base: &SiteConfig) -> SiteConfig {
        SiteConfig {
            mode: self.mode.unwrap_or(base.mode),
            conflict_policy: self.conflict_policy.unwrap_or(base.conflict_policy),
            log_conflicts: self.log_conflicts.unwrap_or(base.log_conflicts),
            generate_if_missing: self.generate_if_missing.unwrap_or(base.generate_if_missing),
            sync_children: self.sync_children.unwrap_or(base.sync_children),
            forbidden_chars: self
                .forbidden_chars
                .clone()
                .unwrap_or_else(|| base.forbidden_chars.clone()),
            replacement_char: self.replacement_char.unwrap_or(base.replacement_char),
            lowercase: self.lowercase.unwrap_or(base.lowercase),
            max_append_attempts: self.max_append_attempts.unwrap_or(base.max_append_attempts),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Identity under which this deployment claims queue entries. It must stay the same
    /// across restarts so entries a crashed run left behind are reaped; liveness is tracked
    /// by the worker handle minted on every start. Deployments sharing a host need distinct
    /// identities.
    pub process_identity: String,
    /// When false an errored entry at the head of the queue blocks everything behind it.
    pub skip_errored: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            process_identity: default_process_identity(),
            skip_errored: true,
        }
    }
}

fn default_process_identity() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|host| !host.trim().is_empty())
        .unwrap_or_else(|| "local".to_string())
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlugConfig {
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub defaults: SiteConfig,
    #[serde(default)]
    pub sites: BTreeMap<String, SiteOverrides>,
}

impl SlugConfig {
    pub fn site(&self, site: &str) -> SiteConfig {
        match self.sites.get(site) {
            Some(overrides) => overrides.apply(&self.defaults),
            None => self.defaults.clone(),
        }
    }
}

impl TryFrom<&str> for SlugConfig {
    type Error = SlugError;

    fn try_from(toml_str: &str) -> Result<Self, Self::Error> {
        Ok(toml::from_str(toml_str)?)
    }
}

pub trait SlugConfigProvider: Send + Sync {
    fn site_config(&self, site: &str) -> Result<SiteConfig, SlugError>;
    fn queue_config(&self) -> Result<QueueConfig, SlugError>;
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TomlConfigProvider {
    path: PathBuf,
}

impl TomlConfigProvider {
    pub fn new(path: PathBuf) -> Self {
        TomlConfigProvider { path }
    }

    pub fn get_config(&self) -> Result<SlugConfig, SlugError> {
        tracing::debug!("Attempting to read slug config from: {:?}", &self.path);
        if !self.path.exists() {
            tracing::debug!("Config file not found, using defaults.");
            return Ok(SlugConfig::default());
        }
        let content = read_to_string(&self.path)?;
        SlugConfig::try_from(content.as_str())
    }

    pub fn set_config(&self, config: &SlugConfig) -> Result<(), SlugError> {
        tracing::debug!("Attempting to write slug config to: {:?}", &self.path);
        let toml_string = toml::to_string(config)?;
        write(&self.path, toml_string)?;
        Ok(())
    }
}

impl SlugConfigProvider for TomlConfigProvider {
    fn site_config(&self, site: &str) -> Result<SiteConfig, SlugError> {
        Ok(self.get_config()?.site(site))
    }

    fn queue_config(&self) -> Result<QueueConfig, SlugError> {
        Ok(self.get_config()?.queue)
    }
}

/// Config held in memory, for embedding applications that own their settings.
#[derive(Debug, Default)]
pub struct StaticConfigProvider(RwLock<SlugConfig>);

impl StaticConfigProvider {
    pub fn new(config: SlugConfig) -> Self {
        StaticConfigProvider(RwLock::new(config))
    }

    pub fn update<F: FnOnce(&mut SlugConfig)>(&self, f: F) {
        let mut config = self.0.write();
        f(&mut config);
    }
}

impl SlugConfigProvider for StaticConfigProvider {
    fn site_config(&self, site: &str) -> Result<SiteConfig, SlugError> {
        Ok(self.0.read().site(site))
    }

    fn queue_config(&self) -> Result<QueueConfig, SlugError> {
        Ok(self.0.read().queue.clone())
    }
}
