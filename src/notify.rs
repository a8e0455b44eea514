//! # Notification Gateway
//!
//! Store-level broadcasts keyed by an operation tag, plus the sink that tells
//! account services their raw contacts were viewed.
//!
//! The listener registry belongs to one gateway instance. Listeners are added
//! with [`NotificationGateway::subscribe`] and leave either through
//! [`NotificationGateway::unsubscribe`] or by dropping their receiver, which
//! prunes them on the next broadcast.

use crate::accounts::NotifyEndpoint;
use crate::groups::UndoPayload;
use crate::model::{ContactRef, GroupId, RawContactId};
use crate::worker::RequestKind;
use anyhow::{anyhow, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Operation tag a listener filters on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BroadcastTag {
    GroupDeleted,
    LinkComplete,
    UnlinkComplete,
    ServiceStateChanged,
}

impl fmt::Display for BroadcastTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BroadcastTag::GroupDeleted => "group_deleted",
            BroadcastTag::LinkComplete => "link_complete",
            BroadcastTag::UnlinkComplete => "unlink_complete",
            BroadcastTag::ServiceStateChanged => "service_state_changed",
        };
        f.write_str(name)
    }
}

/// A store-level event.
#[derive(Debug, Clone, PartialEq)]
pub enum Broadcast {
    /// A group was deleted. The payload rebuilds it.
    GroupDeleted { group: GroupId, undo: UndoPayload },
    /// Contacts were joined; `lookup` names the resulting contact.
    LinkComplete { lookup: Option<ContactRef> },
    UnlinkComplete,
    /// Requests still queued or running, in submission order.
    ServiceStateChanged { pending: Vec<RequestKind> },
}

impl Broadcast {
    pub fn tag(&self) -> BroadcastTag {
        match self {
            Broadcast::GroupDeleted { .. } => BroadcastTag::GroupDeleted,
            Broadcast::LinkComplete { .. } => BroadcastTag::LinkComplete,
            Broadcast::UnlinkComplete => BroadcastTag::UnlinkComplete,
            Broadcast::ServiceStateChanged { .. } => BroadcastTag::ServiceStateChanged,
        }
    }

    pub fn undo_payload(&self) -> Option<&UndoPayload> {
        match self {
            Broadcast::GroupDeleted { undo, .. } => Some(undo),
            _ => None,
        }
    }

    pub fn can_undo(&self) -> bool {
        self.undo_payload().is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(pub u64);

struct Listener {
    id: ListenerId,
    /// Empty means every tag.
    tags: Vec<BroadcastTag>,
    sender: Sender<Broadcast>,
}

impl Listener {
    fn wants(&self, tag: BroadcastTag) -> bool {
        self.tags.is_empty() || self.tags.contains(&tag)
    }
}

/// A "raw contact was viewed" notice for an account service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewedEvent {
    pub endpoint: NotifyEndpoint,
    pub raw_contact_id: RawContactId,
}

/// Delivers view notices to account services.
pub trait ViewNotifier: Send + Sync {
    fn notify_viewed(&self, endpoint: &NotifyEndpoint, raw: RawContactId) -> Result<()>;
}

impl ViewNotifier for Sender<ViewedEvent> {
    fn notify_viewed(&self, endpoint: &NotifyEndpoint, raw: RawContactId) -> Result<()> {
        self.send(ViewedEvent {
            endpoint: endpoint.clone(),
            raw_contact_id: raw,
        })
        .map_err(|_| anyhow!("view notification receiver is gone"))
    }
}

/// Broadcast registry and view-notification sink.
pub struct NotificationGateway {
    listeners: Mutex<Vec<Listener>>,
    next_listener: AtomicU64,
    viewer: RwLock<Option<Arc<dyn ViewNotifier>>>,
}

impl NotificationGateway {
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(1),
            viewer: RwLock::new(None),
        }
    }

    pub fn with_view_notifier(self, notifier: Arc<dyn ViewNotifier>) -> Self {
        *self.viewer.write() = Some(notifier);
        self
    }

    pub fn set_view_notifier(&self, notifier: Option<Arc<dyn ViewNotifier>>) {
        *self.viewer.write() = notifier;
    }

    /// Registers a listener for `tags` (all tags when empty).
    pub fn subscribe(&self, tags: &[BroadcastTag]) -> (ListenerId, Receiver<Broadcast>) {
        let (sender, receiver) = unbounded();
        let id = self.subscribe_with(tags, sender);
        (id, receiver)
    }

    pub fn subscribe_with(&self, tags: &[BroadcastTag], sender: Sender<Broadcast>) -> ListenerId {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        self.listeners.lock().push(Listener {
            id,
            tags: tags.to_vec(),
            sender,
        });
        debug!(listener = id.0, ?tags, "listener registered");
        id
    }

    /// Returns whether the listener was still registered.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|listener| listener.id != id);
        before != listeners.len()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    /// Sends `event` to every interested listener and returns how many got it.
    pub fn broadcast(&self, event: Broadcast) -> usize {
        let tag = event.tag();
        let mut delivered = 0;
        self.listeners.lock().retain(|listener| {
            if !listener.wants(tag) {
                return true;
            }
            match listener.sender.send(event.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(_) => {
                    debug!(listener = listener.id.0, "dropping disconnected listener");
                    false
                }
            }
        });
        trace!(%tag, delivered, "broadcast");
        delivered
    }

    /// Posts a view notice. Failures are logged and swallowed.
    pub fn notify_viewed(&self, endpoint: &NotifyEndpoint, raw: RawContactId) {
        let viewer = self.viewer.read().clone();
        let Some(viewer) = viewer else {
            trace!(raw = %raw, "no view notifier installed");
            return;
        };
        if let Err(err) = viewer.notify_viewed(endpoint, raw) {
            warn!(
                raw = %raw,
                package = %endpoint.package,
                error = %err,
                "view notification failed"
            );
        }
    }
}

impl Default for NotificationGateway {
    fn default() -> Self {
        Self::new()
    }
}
