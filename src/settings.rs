use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::{
    config::{SiteConfig, SlugConfigProvider},
    error::SlugError,
    paths::SlugFormat,
    tree::ContentTree,
};

/// Site data needed while rendering. Never serialized: rebuilt from the site name whenever
/// settings come back from the generation queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolutionContext {
    pub site: String,
    pub site_config: SiteConfig,
    pub format: SlugFormat,
}

impl ResolutionContext {
    pub fn new(site: &str, site_config: SiteConfig) -> Self {
        let format = SlugFormat::from(&site_config);
        ResolutionContext {
            site: site.to_string(),
            site_config,
            format,
        }
    }
}

/// How far one build pass reaches and what it assumes about existing data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuilderSettings {
    pub site: String,
    pub cultures: Vec<String>,
    pub default_culture: String,
    pub generate_if_missing: bool,
    /// When false the pass assumes no generated slugs exist yet: only custom records are
    /// loaded and everything rendered is new.
    pub check_for_updates: bool,
    pub rebuild_siblings: bool,
    pub rebuild_descendants: bool,
    pub rebuild_children: bool,
    pub log_conflicts: bool,
    #[serde(skip)]
    context: OnceCell<Arc<ResolutionContext>>,
}

impl PartialEq for BuilderSettings {
    fn eq(&self, other: &Self) -> bool {
        self.site == other.site
            && self.cultures == other.cultures
            && self.default_culture == other.default_culture
            && self.generate_if_missing == other.generate_if_missing
            && self.check_for_updates == other.check_for_updates
            && self.rebuild_siblings == other.rebuild_siblings
            && self.rebuild_descendants == other.rebuild_descendants
            && self.rebuild_children == other.rebuild_children
            && self.log_conflicts == other.log_conflicts
    }
}

impl BuilderSettings {
    /// Settings for an incremental pass over `site`, seeded with its resolution context.
    pub fn for_site(
        site: &str,
        tree: &dyn ContentTree,
        site_config: &SiteConfig,
    ) -> Result<Self, SlugError> {
        let settings = BuilderSettings {
            site: site.to_string(),
            cultures: tree.get_site_cultures(site)?,
            default_culture: tree.get_default_culture(site)?,
            generate_if_missing: site_config.generate_if_missing,
            check_for_updates: true,
            rebuild_siblings: false,
            rebuild_descendants: false,
            rebuild_children: false,
            log_conflicts: site_config.log_conflicts,
            context: OnceCell::new(),
        };
        let _ = settings
            .context
            .set(Arc::new(ResolutionContext::new(site, site_config.clone())));
        Ok(settings)
    }

    /// The resolution context, rebuilt from the site name on first use after deserialization.
    pub fn context(
        &self,
        config: &dyn SlugConfigProvider,
    ) -> Result<Arc<ResolutionContext>, SlugError> {
        self.context
            .get_or_try_init(|| -> Result<Arc<ResolutionContext>, SlugError> {
                tracing::debug!(
                    "[BuilderSettings] Rebuilding resolution context for '{}'",
                    self.site
                );
                let site_config = config.site_config(&self.site)?;
                Ok(Arc::new(ResolutionContext::new(&self.site, site_config)))
            })
            .cloned()
    }

    pub fn has_context(&self) -> bool {
        self.context.get().is_some()
    }

    pub fn is_default_culture(&self, culture: &str) -> bool {
        self.default_culture == culture
    }
}
