//! Read side used by request routing.
//!
//! Both lookups are served from [SlugCache], which every commit clears. A URL with no slug is
//! `Ok(None)`, never an error, so the router can fall through to its own not-found handling.
use parking_lot::RwLock;
use std::{collections::BTreeMap, sync::Arc};

use crate::{
    config::SlugConfigProvider,
    error::SlugError,
    nodeitem::{select_slug, NodeUrlSlug},
    paths::{normalize_slug, SlugFormat},
    properties::{AlternateUrl, NodeId, CULTURE_INVARIANT},
    store::SlugStore,
    tree::ContentTree,
};

#[derive(Debug, Default)]
struct CacheState {
    /// (site, culture, url) to node
    urls: BTreeMap<(String, String, String), Option<NodeId>>,
    /// (node, culture) to slug text
    slugs: BTreeMap<(NodeId, String), Option<String>>,
    /// (site, url) to redirect target
    redirects: BTreeMap<(String, String), Option<AlternateUrl>>,
    invalidations: u64,
}

/// Shared lookup cache. Clones share the same entries.
#[derive(Debug, Clone, Default)]
pub struct SlugCache(Arc<RwLock<CacheState>>);

impl SlugCache {
    pub fn new() -> Self {
        SlugCache::default()
    }

    pub fn invalidate(&self) {
        let mut state = self.0.write();
        state.urls.clear();
        state.slugs.clear();
        state.redirects.clear();
        state.invalidations += 1;
    }

    /// How many times the cache has been cleared.
    pub fn invalidations(&self) -> u64 {
        self.0.read().invalidations
    }

    /// Fill the cache only if no commit invalidated it since `generation` was read.
    fn fill(&self, generation: u64, f: impl FnOnce(&mut CacheState)) {
        let mut state = self.0.write();
        if state.invalidations == generation {
            f(&mut state);
        }
    }

    pub fn len(&self) -> usize {
        let state = self.0.read();
        state.urls.len() + state.slugs.len() + state.redirects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct SlugResolver<S> {
    store: S,
    tree: Arc<dyn ContentTree>,
    config: Arc<dyn SlugConfigProvider>,
    cache: SlugCache,
}

impl<S: SlugStore> SlugResolver<S> {
    pub fn new(
        store: S,
        tree: Arc<dyn ContentTree>,
        config: Arc<dyn SlugConfigProvider>,
        cache: SlugCache,
    ) -> Self {
        SlugResolver {
            store,
            tree,
            config,
            cache,
        }
    }

    pub fn cache(&self) -> &SlugCache {
        &self.cache
    }

    /// Bring an inbound URL into the form slugs are stored in.
    pub fn normalize_url(&self, url: &str, site: &str) -> Result<String, SlugError> {
        let format = SlugFormat::from(&self.config.site_config(site)?);
        Ok(normalize_slug(url, &format))
    }

    /// The node whose slug is `url`. A slug of the requested culture wins over a culture
    /// invariant one, which wins over any other culture.
    pub async fn resolve_url_to_node(
        &self,
        url: &str,
        culture: &str,
        site: &str,
    ) -> Result<Option<NodeId>, SlugError> {
        let url = self.normalize_url(url, site)?;
        let key = (site.to_string(), culture.to_string(), url.clone());
        if let Some(hit) = self.cache.0.read().urls.get(&key) {
            return Ok(*hit);
        }
        let generation = self.cache.invalidations();
        let records = self.store.find_slug(site, &url).await?;
        let node = records
            .iter()
            .find(|r| r.culture == culture)
            .or_else(|| records.iter().find(|r| r.culture == CULTURE_INVARIANT))
            .or_else(|| records.first())
            .map(|r| r.node_id);
        self.cache.fill(generation, |state| {
            state.urls.insert(key, node);
        });
        Ok(node)
    }

    /// Slug text of `node` in `culture`, falling back to the default culture, then the
    /// culture invariant slug, then any slug of the node.
    pub async fn get_slug_for_node(
        &self,
        node: NodeId,
        culture: &str,
    ) -> Result<Option<String>, SlugError> {
        let key = (node, culture.to_string());
        if let Some(hit) = self.cache.0.read().slugs.get(&key) {
            return Ok(hit.clone());
        }
        let generation = self.cache.invalidations();
        let records = self.store.slugs_for_node(node).await?;
        let default_culture = match records.first() {
            Some(record) => self.tree.get_default_culture(&record.site)?,
            None => String::new(),
        };
        let slugs: Vec<NodeUrlSlug> = records
            .iter()
            .map(|r| NodeUrlSlug::from_record(r, &default_culture))
            .collect();
        let slug = select_slug(&slugs, culture).map(|s| s.slug.clone());
        self.cache.fill(generation, |state| {
            state.slugs.insert(key, slug.clone());
        });
        Ok(slug)
    }

    /// The node a former slug should redirect to.
    pub async fn resolve_redirect(
        &self,
        url: &str,
        site: &str,
    ) -> Result<Option<AlternateUrl>, SlugError> {
        let url = self.normalize_url(url, site)?;
        let key = (site.to_string(), url.clone());
        if let Some(hit) = self.cache.0.read().redirects.get(&key) {
            return Ok(hit.clone());
        }
        let generation = self.cache.invalidations();
        let redirect = self.store.find_alternate_url(site, &url).await?;
        self.cache.fill(generation, |state| {
            state.redirects.insert(key, redirect.clone());
        });
        Ok(redirect)
    }
}
