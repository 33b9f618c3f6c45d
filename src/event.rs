use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use tokio::sync::mpsc::UnboundedSender;

use crate::{conflict::Conflict, properties::NodeId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlugEvent {
    /// Site, node, culture, slug
    SlugCreated(String, NodeId, String, String),
    /// Site, node, culture, previous slug, new slug. Sent before the change is committed.
    SlugChanged(String, NodeId, String, String, String),
    /// A slug was refused or renamed because another node holds its text
    ConflictDetected(Conflict),
    /// Queue entry id, root node of the deferred subtree
    EntryQueued(i64, NodeId),
    /// Queue entry id, number of slug writes it committed
    EntryCompleted(i64, usize),
    /// Queue entry id, error text
    EntryFailed(i64, String),
}

impl SlugEvent {
    /// The node the event is about, when it is about one.
    pub fn node(&self) -> Option<NodeId> {
        match self {
            SlugEvent::SlugCreated(_, node, _, _) => Some(*node),
            SlugEvent::SlugChanged(_, node, _, _, _) => Some(*node),
            SlugEvent::ConflictDetected(conflict) => Some(conflict.node_id),
            SlugEvent::EntryQueued(_, node) => Some(*node),
            SlugEvent::EntryCompleted(_, _) => None,
            SlugEvent::EntryFailed(_, _) => None,
        }
    }
}

impl Display for SlugEvent {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            SlugEvent::SlugCreated(_, _, _, _) => write!(f, "SlugCreated"),
            SlugEvent::SlugChanged(_, _, _, _, _) => write!(f, "SlugChanged"),
            SlugEvent::ConflictDetected(_) => write!(f, "ConflictDetected"),
            SlugEvent::EntryQueued(_, _) => write!(f, "EntryQueued"),
            SlugEvent::EntryCompleted(_, _) => write!(f, "EntryCompleted"),
            SlugEvent::EntryFailed(_, _) => write!(f, "EntryFailed"),
        }
    }
}

/// Optional sink for [SlugEvent]s. Sending never fails the operation that emits the event.
#[derive(Debug, Clone, Default)]
pub struct EventSink(Option<UnboundedSender<SlugEvent>>);

impl EventSink {
    pub fn new(tx: Option<UnboundedSender<SlugEvent>>) -> Self {
        EventSink(tx)
    }

    pub fn send(&self, event: SlugEvent) {
        if let Some(tx) = self.0.as_ref() {
            if let Err(e) = tx.send(event) {
                tracing::debug!("[EventSink] Receiver dropped, discarding {}", e.0);
            }
        }
    }
}
