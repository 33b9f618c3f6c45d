//! Identifiers and records shared by every stage of slug generation.
//!
//! [ContentNode] and [CultureDocument] mirror what the content tree hands us, [SlugRecord]
//! and [AlternateUrl] are what we persist, and [QueueEntry] is one unit of deferred work.
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fmt::{Display, Formatter},
    str::FromStr,
    time::{SystemTime, UNIX_EPOCH},
};
use uuid::Uuid;

use crate::error::SlugError;

/// Culture code of a slug that applies to every culture of its node.
pub const CULTURE_INVARIANT: &str = "";

/// Identifier of a node in the external content tree.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct NodeId(pub i64);

impl Display for NodeId {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for NodeId {
    type Err = SlugError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<i64>()
            .map(NodeId)
            .map_err(|e| SlugError::Serialization(format!("Invalid node id '{s}': {e}")))
    }
}

impl From<i64> for NodeId {
    fn from(id: i64) -> Self {
        NodeId(id)
    }
}

/// One culture variant of a node.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CultureDocument {
    pub name: String,
    /// Slash separated document names from the root down to this document.
    pub name_path: String,
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}

impl CultureDocument {
    pub fn new(name: &str, name_path: &str) -> Self {
        CultureDocument {
            name: name.to_string(),
            name_path: name_path.to_string(),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, key: &str, value: &str) -> Self {
        self.fields.insert(key.to_string(), value.to_string());
        self
    }
}

/// A node of the content tree as exposed by [crate::tree::ContentTree]. Read-only to this crate.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentNode {
    pub id: NodeId,
    pub parent_id: Option<NodeId>,
    pub site: String,
    pub class_name: String,
    #[serde(default)]
    pub is_container: bool,
    /// Ordering key among siblings, 1-based.
    pub order: i32,
    /// Depth below the site root, which has level 0.
    pub level: u32,
    pub alias_path: String,
    /// Culture invariant field values.
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
    /// Culture code to document.
    #[serde(default)]
    pub documents: BTreeMap<String, CultureDocument>,
}

impl ContentNode {
    pub fn document(&self, culture: &str) -> Option<&CultureDocument> {
        self.documents.get(culture)
    }

    pub fn has_culture(&self, culture: &str) -> bool {
        self.documents.contains_key(culture)
    }
}

/// A persisted slug: at most one per (node, culture).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlugRecord {
    pub id: Uuid,
    pub site: String,
    pub node_id: NodeId,
    pub culture: String,
    pub slug: String,
    /// Manually authored; automatic generation never touches it.
    pub is_custom: bool,
    pub modified_ms: i64,
}

impl SlugRecord {
    pub fn new(site: &str, node_id: NodeId, culture: &str, slug: &str, is_custom: bool) -> Self {
        SlugRecord {
            id: Uuid::new_v4(),
            site: site.to_string(),
            node_id,
            culture: culture.to_string(),
            slug: slug.to_string(),
            is_custom,
            modified_ms: now_ms(),
        }
    }
}

/// A previous slug kept so old links can be redirected to the node that used to own it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlternateUrl {
    pub id: Uuid,
    pub site: String,
    pub url: String,
    pub node_id: NodeId,
    pub culture: String,
    pub created_ms: i64,
}

impl AlternateUrl {
    pub fn new(site: &str, url: &str, node_id: NodeId, culture: &str) -> Self {
        AlternateUrl {
            id: Uuid::new_v4(),
            site: site.to_string(),
            url: url.to_string(),
            node_id,
            culture: culture.to_string(),
            created_ms: now_ms(),
        }
    }
}

/// Who holds a running queue entry. The worker handle is minted fresh for every consumer
/// loop, so a recycled OS thread can never be mistaken for a live owner.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerIdentity {
    pub process: String,
    pub worker: Uuid,
}

impl WorkerIdentity {
    pub fn new(process: &str) -> Self {
        WorkerIdentity {
            process: process.to_string(),
            worker: Uuid::new_v4(),
        }
    }
}

impl Display for WorkerIdentity {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "{}/{}", self.process, self.worker)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueState {
    Pending,
    Running,
    Errored,
}

impl Display for QueueState {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            QueueState::Pending => write!(f, "pending"),
            QueueState::Running => write!(f, "running"),
            QueueState::Errored => write!(f, "errored"),
        }
    }
}

/// A durable unit of deferred subtree generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: i64,
    pub payload: String,
    /// Hex encoded SHA-256 of `payload`.
    pub digest: String,
    pub running: bool,
    pub owner: Option<WorkerIdentity>,
    pub started_ms: Option<i64>,
    pub ended_ms: Option<i64>,
    pub error: Option<String>,
    pub created_ms: i64,
}

impl QueueEntry {
    pub fn state(&self) -> QueueState {
        if self.running {
            QueueState::Running
        } else if self.error.is_some() {
            QueueState::Errored
        } else {
            QueueState::Pending
        }
    }
}

/// Milliseconds since the unix epoch.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
