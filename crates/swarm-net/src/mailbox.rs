//! Mailbox signaling backend
//!
//! A shared key-value store with a presence list and, per recipient, one
//! append-only list per message kind (`offers`, `answers`, `candidates`).
//! Subscribers get child-added notifications. Entries are consumed once:
//! an entry is removed as soon as it has been handed to its recipient, and
//! entries for a recipient that is not listening yet wait in its mailbox.

use crate::event::{Event, EventSender};
use crate::signaling::{SignalingTransport, TransportError};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use swarm_core::{PeerId, SignalEnvelope, SignalKind, SignalingFrame};
use tracing::{debug, warn};

/// Store notification delivered to a watcher
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MailboxNotice {
    PresenceAdded(PeerId),
    PresenceRefreshed(PeerId),
    PresenceRemoved(PeerId),
    Message {
        kind: SignalKind,
        sender: PeerId,
        body: String,
    },
}

type Watcher = Box<dyn FnMut(MailboxNotice) + Send>;

#[derive(Debug, Clone)]
struct Entry {
    sender: PeerId,
    body: String,
}

#[derive(Debug, Default)]
struct Mailbox {
    offers: VecDeque<Entry>,
    answers: VecDeque<Entry>,
    candidates: VecDeque<Entry>,
}

impl Mailbox {
    fn list_mut(&mut self, kind: SignalKind) -> &mut VecDeque<Entry> {
        match kind {
            SignalKind::Offer => &mut self.offers,
            SignalKind::Answer => &mut self.answers,
            SignalKind::Candidate => &mut self.candidates,
        }
    }

    fn len(&self) -> usize {
        self.offers.len() + self.answers.len() + self.candidates.len()
    }
}

struct StoreState {
    online: bool,
    /// Present peers and how often each refreshed its presence
    presence: BTreeMap<PeerId, u64>,
    mailboxes: HashMap<PeerId, Mailbox>,
    watchers: HashMap<PeerId, Watcher>,
}

impl StoreState {
    fn notify_others(&mut self, who: &PeerId, notice: MailboxNotice) {
        for (peer, watcher) in self.watchers.iter_mut() {
            if peer != who {
                watcher(notice.clone());
            }
        }
    }
}

/// In-process shared store
#[derive(Clone)]
pub struct MailboxStore {
    inner: Arc<Mutex<StoreState>>,
}

impl Default for MailboxStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MailboxStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(StoreState {
                online: true,
                presence: BTreeMap::new(),
                mailboxes: HashMap::new(),
                watchers: HashMap::new(),
            })),
        }
    }

    /// Simulate losing (or regaining) the store connection
    pub fn set_online(&self, online: bool) {
        self.inner.lock().online = online;
    }

    fn check_online(state: &StoreState) -> Result<(), TransportError> {
        if state.online {
            Ok(())
        } else {
            Err(TransportError::Unavailable("mailbox store offline".into()))
        }
    }

    /// Register a watcher for `peer`. It immediately receives the current
    /// presence list and any backlog waiting in the peer's mailbox.
    pub fn watch(
        &self,
        peer: &PeerId,
        mut watcher: impl FnMut(MailboxNotice) + Send + 'static,
    ) -> Result<(), TransportError> {
        let mut guard = self.inner.lock();
        Self::check_online(&guard)?;
        let state = &mut *guard;

        for present in state.presence.keys() {
            if present != peer {
                watcher(MailboxNotice::PresenceAdded(present.clone()));
            }
        }

        if let Some(mut mailbox) = state.mailboxes.remove(peer) {
            for kind in [SignalKind::Offer, SignalKind::Answer, SignalKind::Candidate] {
                for entry in mailbox.list_mut(kind).drain(..) {
                    watcher(MailboxNotice::Message {
                        kind,
                        sender: entry.sender,
                        body: entry.body,
                    });
                }
            }
        }

        state.watchers.insert(peer.clone(), Box::new(watcher));
        Ok(())
    }

    /// Remove a watcher
    pub fn unwatch(&self, peer: &PeerId) {
        self.inner.lock().watchers.remove(peer);
    }

    /// Add or refresh a presence entry
    pub fn set_presence(&self, peer: &PeerId) -> Result<(), TransportError> {
        let mut state = self.inner.lock();
        Self::check_online(&state)?;

        let refreshes = state.presence.entry(peer.clone()).or_insert(0);
        *refreshes += 1;
        let notice = if *refreshes == 1 {
            MailboxNotice::PresenceAdded(peer.clone())
        } else {
            MailboxNotice::PresenceRefreshed(peer.clone())
        };
        state.notify_others(peer, notice);
        Ok(())
    }

    /// Remove a presence entry (no-op if absent)
    pub fn remove_presence(&self, peer: &PeerId) {
        let mut state = self.inner.lock();
        if state.presence.remove(peer).is_some() {
            state.notify_others(peer, MailboxNotice::PresenceRemoved(peer.clone()));
        }
        // Mail nobody will read any more
        state.mailboxes.remove(peer);
    }

    /// Append a message to `recipient`'s list for `kind`
    pub fn push(
        &self,
        recipient: &PeerId,
        kind: SignalKind,
        sender: &PeerId,
        body: String,
    ) -> Result<(), TransportError> {
        let mut guard = self.inner.lock();
        Self::check_online(&guard)?;
        let state = &mut *guard;

        if let Some(watcher) = state.watchers.get_mut(recipient) {
            watcher(MailboxNotice::Message {
                kind,
                sender: sender.clone(),
                body,
            });
        } else {
            state
                .mailboxes
                .entry(recipient.clone())
                .or_default()
                .list_mut(kind)
                .push_back(Entry {
                    sender: sender.clone(),
                    body,
                });
        }
        Ok(())
    }

    /// Present peers, sorted
    pub fn present(&self) -> Vec<PeerId> {
        self.inner.lock().presence.keys().cloned().collect()
    }

    /// Undelivered entries waiting for `recipient`
    pub fn pending(&self, recipient: &PeerId) -> usize {
        self.inner
            .lock()
            .mailboxes
            .get(recipient)
            .map(Mailbox::len)
            .unwrap_or(0)
    }
}

/// Signaling transport over a [`MailboxStore`].
///
/// Presence is removed when the transport is dropped, mirroring a
/// remove-on-disconnect registration.
pub struct MailboxTransport {
    store: MailboxStore,
    subscribed: Option<PeerId>,
    announced: Option<PeerId>,
}

impl MailboxTransport {
    pub fn new(store: MailboxStore) -> Self {
        Self {
            store,
            subscribed: None,
            announced: None,
        }
    }
}

fn translate(notice: MailboxNotice) -> Option<Event> {
    match notice {
        MailboxNotice::PresenceAdded(peer) => Some(Event::Discovered { peer, handle: None }),
        MailboxNotice::PresenceRefreshed(peer) => Some(Event::Alive(peer)),
        MailboxNotice::PresenceRemoved(peer) => Some(Event::Departed(peer)),
        MailboxNotice::Message { kind, sender, body } => match SignalingFrame::decode(&body) {
            Ok(SignalingFrame::Signal(envelope))
                if envelope.kind() == kind && envelope.sender == sender =>
            {
                Some(Event::Signal(envelope))
            }
            Ok(frame) => {
                warn!(
                    "Discarding mismatched {} entry from {}: {:?}",
                    kind, sender, frame
                );
                None
            }
            Err(e) => {
                warn!("Discarding malformed {} entry from {}: {}", kind, sender, e);
                None
            }
        },
    }
}

impl SignalingTransport for MailboxTransport {
    fn name(&self) -> &'static str {
        "mailbox"
    }

    fn subscribe(&mut self, local: &PeerId, events: EventSender) -> Result<(), TransportError> {
        self.store.watch(local, move |notice| {
            if let Some(event) = translate(notice) {
                let _ = events.send(event);
            }
        })?;
        self.subscribed = Some(local.clone());
        debug!("Subscribed {} to mailbox store", local);
        Ok(())
    }

    fn announce_presence(&mut self, local: &PeerId) -> Result<(), TransportError> {
        self.store.set_presence(local)?;
        self.announced = Some(local.clone());
        Ok(())
    }

    fn withdraw_presence(&mut self, local: &PeerId) -> Result<(), TransportError> {
        self.store.remove_presence(local);
        self.announced = None;
        Ok(())
    }

    fn publish(
        &mut self,
        recipient: &PeerId,
        envelope: &SignalEnvelope,
    ) -> Result<(), TransportError> {
        let body = SignalingFrame::from(envelope.clone()).encode()?;
        self.store
            .push(recipient, envelope.kind(), &envelope.sender, body)
    }

    fn heartbeat(&mut self, local: &PeerId) -> Result<(), TransportError> {
        if self.announced.is_none() {
            return Err(TransportError::Unavailable("presence not announced".into()));
        }
        self.store.set_presence(local)
    }
}

impl Drop for MailboxTransport {
    fn drop(&mut self) {
        if let Some(peer) = self.announced.take() {
            self.store.remove_presence(&peer);
        }
        if let Some(peer) = self.subscribed.take() {
            self.store.unwatch(&peer);
        }
    }
}
