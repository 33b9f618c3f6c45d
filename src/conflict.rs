//! Site-wide slug collision detection and the policies that act on it.
//!
//! Detection never fails on a collision: it returns a [ConflictList], and the caller decides
//! whether that aborts the operation ([ConflictPolicy::Error]), drops the offending slugs
//! ([ConflictPolicy::Skip]) or renames them ([ConflictPolicy::Append]).
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::{Display, Formatter},
};
use uuid::Uuid;

use crate::{
    config::ConflictPolicy,
    error::SlugError,
    nodeitem::NodeItem,
    paths::with_suffix,
    properties::{NodeId, SlugRecord},
    store::SlugStore,
};

/// One slug whose text is already held by another node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conflict {
    pub site: String,
    pub node_id: NodeId,
    pub culture: String,
    pub slug: String,
    pub existing_node: NodeId,
    pub existing_culture: String,
}

impl Display for Conflict {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(
            f,
            "'{}' for node {} ({}) is already used by node {} ({}) on site '{}'",
            self.slug,
            self.node_id,
            display_culture(&self.culture),
            self.existing_node,
            display_culture(&self.existing_culture),
            self.site
        )
    }
}

fn display_culture(culture: &str) -> &str {
    if culture.is_empty() {
        "invariant"
    } else {
        culture
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictList(pub Vec<Conflict>);

impl Display for ConflictList {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        let mut first = true;
        for conflict in self.0.iter() {
            if !first {
                write!(f, "; ")?;
            }
            write!(f, "{conflict}")?;
            first = false;
        }
        Ok(())
    }
}

impl ConflictList {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Conflict> {
        self.0.iter()
    }

    pub fn push(&mut self, conflict: Conflict) {
        self.0.push(conflict);
    }

    pub fn extend(&mut self, other: ConflictList) {
        self.0.extend(other.0);
    }

    pub fn into_result(self) -> Result<(), ConflictList> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl IntoIterator for ConflictList {
    type Item = Conflict;
    type IntoIter = std::vec::IntoIter<Conflict>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// Slug texts claimed by the items of one pass, with the persisted records those items are
/// moving away from.
#[derive(Debug, Default)]
struct PassClaims {
    /// Text to the (node, culture) that claimed it first.
    claimed: BTreeMap<String, (NodeId, String)>,
    /// Records whose text this pass replaces. They no longer block their old text.
    released: BTreeSet<Uuid>,
}

impl PassClaims {
    fn collect(items: &[&NodeItem]) -> Self {
        let mut claims = PassClaims::default();
        for item in items.iter() {
            for slug in item.slugs.iter() {
                if let (true, Some(id)) = (slug.has_new_text(), slug.existing_id) {
                    claims.released.insert(id);
                }
            }
        }
        claims
    }

    /// Claim `text` for (node, culture). Returns the earlier claimant of another node.
    fn claim(&mut self, text: &str, node: NodeId, culture: &str) -> Option<(NodeId, String)> {
        match self.claimed.get(text) {
            Some((holder, holder_culture)) if *holder != node => {
                Some((*holder, holder_culture.clone()))
            }
            Some(_) => None,
            None => {
                self.claimed
                    .insert(text.to_string(), (node, culture.to_string()));
                None
            }
        }
    }

    fn is_claimed_by_other(&self, text: &str, node: NodeId) -> bool {
        self.claimed
            .get(text)
            .is_some_and(|(holder, _)| *holder != node)
    }
}

/// Checks the slugs of one pass against each other and against the persisted slug set.
pub struct ConflictDetector<'a, S> {
    store: &'a S,
    site: &'a str,
    /// Generated records are about to be replaced wholesale (a from-scratch rebuild), so
    /// only custom records block a text.
    ignore_generated: bool,
}

impl<'a, S: SlugStore> ConflictDetector<'a, S> {
    pub fn new(store: &'a S, site: &'a str) -> Self {
        ConflictDetector {
            store,
            site,
            ignore_generated: false,
        }
    }

    pub fn ignoring_generated(mut self, ignore: bool) -> Self {
        self.ignore_generated = ignore;
        self
    }

    async fn holders(
        &self,
        text: &str,
        node: NodeId,
        claims: &PassClaims,
    ) -> Result<Vec<SlugRecord>, SlugError> {
        Ok(self
            .store
            .find_slug(self.site, text)
            .await?
            .into_iter()
            .filter(|r| r.node_id != node)
            .filter(|r| !claims.released.contains(&r.id))
            .filter(|r| !self.ignore_generated || r.is_custom)
            .collect())
    }

    /// Every new-text slug of `items` (not their children) that collides with another
    /// node, either in storage or earlier in `items`.
    pub async fn find_conflicts(&self, items: &[&NodeItem]) -> Result<ConflictList, SlugError> {
        let mut claims = PassClaims::collect(items);
        let mut conflicts = ConflictList::default();
        for item in items.iter() {
            for slug in item.slugs.iter().filter(|s| s.has_new_text()) {
                if let Some((holder, holder_culture)) =
                    claims.claim(&slug.slug, item.node_id, &slug.culture)
                {
                    conflicts.push(Conflict {
                        site: self.site.to_string(),
                        node_id: item.node_id,
                        culture: slug.culture.clone(),
                        slug: slug.slug.clone(),
                        existing_node: holder,
                        existing_culture: holder_culture,
                    });
                    continue;
                }
                if let Some(record) = self
                    .holders(&slug.slug, item.node_id, &claims)
                    .await?
                    .into_iter()
                    .next()
                {
                    conflicts.push(Conflict {
                        site: self.site.to_string(),
                        node_id: item.node_id,
                        culture: slug.culture.clone(),
                        slug: slug.slug.clone(),
                        existing_node: record.node_id,
                        existing_culture: record.culture,
                    });
                }
            }
        }
        Ok(conflicts)
    }

    /// [ConflictDetector::find_conflicts] over `root` and all of its built descendants.
    pub async fn find_tree_conflicts(&self, root: &NodeItem) -> Result<ConflictList, SlugError> {
        self.find_conflicts(&root.flatten()).await
    }

    /// Rename every conflicting slug by appending `-1`, `-2`, … until a free text is found,
    /// trying at most `max_attempts` suffixes per slug. Returns the conflicts left unresolved.
    pub async fn append_suffixes(
        &self,
        items: &mut [NodeItem],
        conflicts: ConflictList,
        max_attempts: u32,
    ) -> Result<ConflictList, SlugError> {
        let refs: Vec<&NodeItem> = items.iter().collect();
        let mut claims = PassClaims::collect(&refs);
        for item in refs.iter() {
            for slug in item.slugs.iter().filter(|s| s.has_new_text()) {
                claims.claim(&slug.slug, item.node_id, &slug.culture);
            }
        }

        let mut unresolved = ConflictList::default();
        for conflict in conflicts {
            let mut replacement = None;
            for attempt in 1..=max_attempts {
                let candidate = with_suffix(&conflict.slug, attempt);
                if claims.is_claimed_by_other(&candidate, conflict.node_id) {
                    continue;
                }
                if self
                    .holders(&candidate, conflict.node_id, &claims)
                    .await?
                    .is_empty()
                {
                    replacement = Some(candidate);
                    break;
                }
            }
            let slug = items
                .iter_mut()
                .find(|i| i.node_id == conflict.node_id)
                .and_then(|i| i.slugs.iter_mut().find(|s| s.culture == conflict.culture));
            match (replacement, slug) {
                (Some(candidate), Some(slug)) => {
                    tracing::debug!(
                        "[ConflictDetector] Renamed '{}' to '{}' for node {}",
                        conflict.slug,
                        candidate,
                        conflict.node_id
                    );
                    claims.claim(&candidate, conflict.node_id, &conflict.culture);
                    slug.slug = candidate;
                }
                _ => unresolved.push(conflict),
            }
        }
        Ok(unresolved)
    }
}

/// Withdraw the conflicting slugs from `items` so the rest of the pass can commit. A slug
/// that updates a persisted record falls back to its persisted text; a brand new slug is
/// dropped.
pub fn skip_conflicting(items: &mut [NodeItem], conflicts: &ConflictList) {
    for conflict in conflicts.iter() {
        let Some(item) = items.iter_mut().find(|i| i.node_id == conflict.node_id) else {
            continue;
        };
        item.slugs.retain_mut(|slug| {
            if slug.culture != conflict.culture || !slug.has_new_text() {
                return true;
            }
            match slug.previous_slug.clone() {
                Some(previous) => {
                    slug.slug = previous;
                    slug.is_new_or_updated = false;
                    true
                }
                None => false,
            }
        });
    }
}

/// Apply `policy` to the conflicts of one sibling level. Returns the conflicts that remain
/// in effect: all of them under [ConflictPolicy::Error], the ones that were dropped under
/// [ConflictPolicy::Skip], and the ones no free suffix was found for under
/// [ConflictPolicy::Append].
pub async fn apply_policy<S: SlugStore>(
    detector: &ConflictDetector<'_, S>,
    items: &mut [NodeItem],
    conflicts: ConflictList,
    policy: ConflictPolicy,
    max_attempts: u32,
) -> Result<ConflictList, SlugError> {
    if conflicts.is_empty() {
        return Ok(conflicts);
    }
    match policy {
        ConflictPolicy::Error => Ok(conflicts),
        ConflictPolicy::Skip => {
            skip_conflicting(items, &conflicts);
            Ok(conflicts)
        }
        ConflictPolicy::Append => {
            let unresolved = detector
                .append_suffixes(items, conflicts, max_attempts)
                .await?;
            skip_conflicting(items, &unresolved);
            Ok(unresolved)
        }
    }
}
