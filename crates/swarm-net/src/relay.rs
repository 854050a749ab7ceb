//! Relay (chat room) signaling backend
//!
//! All peers join one shared channel under a nick. Liveness is a `hello`
//! frame broadcast to the channel; handshake frames travel as private
//! messages to the recipient's nick. Membership changes map onto discovery:
//! `part`/`quit` mean departure, a nick change updates the display handle.

use crate::event::{Event, EventSender};
use crate::signaling::{SignalingTransport, TransportError};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use swarm_core::{PeerId, SignalEnvelope, SignalingFrame};
use tracing::{debug, warn};

/// Notification delivered to a channel member
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RelayNotice {
    Join { nick: String },
    Part { nick: String },
    Quit { nick: String },
    NickChange { old: String, new: String },
    /// Line broadcast to the whole channel
    Channel { from: String, text: String },
    /// Line sent privately to this member
    Private { from: String, text: String },
}

type Listener = Box<dyn FnMut(RelayNotice) + Send>;

struct HubState {
    online: bool,
    members: BTreeMap<String, Listener>,
}

impl HubState {
    fn notify_others(&mut self, who: &str, notice: RelayNotice) {
        for (nick, listener) in self.members.iter_mut() {
            if nick != who {
                listener(notice.clone());
            }
        }
    }
}

/// In-process chat relay with a single shared channel
#[derive(Clone)]
pub struct RelayHub {
    inner: Arc<Mutex<HubState>>,
}

impl Default for RelayHub {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayHub {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HubState {
                online: true,
                members: BTreeMap::new(),
            })),
        }
    }

    /// Simulate losing (or regaining) the relay connection
    pub fn set_online(&self, online: bool) {
        self.inner.lock().online = online;
    }

    fn check_online(state: &HubState) -> Result<(), TransportError> {
        if state.online {
            Ok(())
        } else {
            Err(TransportError::Unavailable("relay offline".into()))
        }
    }

    /// Join the channel
    pub fn join(
        &self,
        nick: &str,
        listener: impl FnMut(RelayNotice) + Send + 'static,
    ) -> Result<(), TransportError> {
        let mut state = self.inner.lock();
        Self::check_online(&state)?;
        if state.members.contains_key(nick) {
            return Err(TransportError::Unavailable(format!("nick {} in use", nick)));
        }
        state.notify_others(
            nick,
            RelayNotice::Join {
                nick: nick.to_string(),
            },
        );
        state.members.insert(nick.to_string(), Box::new(listener));
        Ok(())
    }

    /// Leave the channel
    pub fn part(&self, nick: &str) {
        let mut state = self.inner.lock();
        if state.members.remove(nick).is_some() {
            state.notify_others(
                nick,
                RelayNotice::Part {
                    nick: nick.to_string(),
                },
            );
        }
    }

    /// Disconnect from the relay
    pub fn quit(&self, nick: &str) {
        let mut state = self.inner.lock();
        if state.members.remove(nick).is_some() {
            state.notify_others(
                nick,
                RelayNotice::Quit {
                    nick: nick.to_string(),
                },
            );
        }
    }

    /// Rename a member
    pub fn change_nick(&self, old: &str, new: &str) -> Result<(), TransportError> {
        let mut state = self.inner.lock();
        Self::check_online(&state)?;
        if state.members.contains_key(new) {
            return Err(TransportError::Unavailable(format!("nick {} in use", new)));
        }
        let listener = state
            .members
            .remove(old)
            .ok_or_else(|| TransportError::Unavailable(format!("{} is not joined", old)))?;
        state.members.insert(new.to_string(), listener);
        state.notify_others(
            new,
            RelayNotice::NickChange {
                old: old.to_string(),
                new: new.to_string(),
            },
        );
        Ok(())
    }

    /// Broadcast a line to every other member
    pub fn say(&self, from: &str, text: &str) -> Result<(), TransportError> {
        let mut state = self.inner.lock();
        Self::check_online(&state)?;
        if !state.members.contains_key(from) {
            return Err(TransportError::Unavailable(format!("{} is not joined", from)));
        }
        state.notify_others(
            from,
            RelayNotice::Channel {
                from: from.to_string(),
                text: text.to_string(),
            },
        );
        Ok(())
    }

    /// Send a line to one member
    pub fn privmsg(&self, from: &str, to: &str, text: &str) -> Result<(), TransportError> {
        let mut state = self.inner.lock();
        Self::check_online(&state)?;
        let listener = state
            .members
            .get_mut(to)
            .ok_or_else(|| TransportError::Unavailable(format!("no such nick {}", to)))?;
        listener(RelayNotice::Private {
            from: from.to_string(),
            text: text.to_string(),
        });
        Ok(())
    }

    /// Current channel members
    pub fn members(&self) -> Vec<String> {
        self.inner.lock().members.keys().cloned().collect()
    }
}

/// Bidirectional `PeerId` / nick mapping learned from hello frames
#[derive(Debug, Default)]
struct NickBook {
    by_peer: HashMap<PeerId, String>,
    by_nick: HashMap<String, PeerId>,
}

impl NickBook {
    /// Record `peer` under `nick`; returns true if the peer is new or moved
    fn learn(&mut self, peer: &PeerId, nick: &str) -> bool {
        if self.by_peer.get(peer).map(String::as_str) == Some(nick) {
            return false;
        }
        if let Some(old) = self.by_peer.insert(peer.clone(), nick.to_string()) {
            self.by_nick.remove(&old);
        }
        self.by_nick.insert(nick.to_string(), peer.clone());
        true
    }

    fn forget_nick(&mut self, nick: &str) -> Option<PeerId> {
        let peer = self.by_nick.remove(nick)?;
        self.by_peer.remove(&peer);
        Some(peer)
    }

    fn rename(&mut self, old: &str, new: &str) -> Option<PeerId> {
        let peer = self.by_nick.remove(old)?;
        self.by_nick.insert(new.to_string(), peer.clone());
        self.by_peer.insert(peer.clone(), new.to_string());
        Some(peer)
    }
}

/// Signaling transport over a [`RelayHub`]
pub struct RelayTransport {
    hub: RelayHub,
    nick: String,
    joined: bool,
    book: Arc<Mutex<NickBook>>,
}

impl RelayTransport {
    pub fn new(hub: RelayHub, nick: impl Into<String>) -> Self {
        Self {
            hub,
            nick: nick.into(),
            joined: false,
            book: Arc::new(Mutex::new(NickBook::default())),
        }
    }

    /// Default nick for a peer: `sw-` followed by the id without its prefix
    pub fn nick_for(peer: &PeerId) -> String {
        let id = peer.as_str();
        format!("sw-{}", id.strip_prefix(PeerId::PREFIX).unwrap_or(id))
    }

    pub fn nick(&self) -> &str {
        &self.nick
    }

    fn hello(&self, local: &PeerId) -> Result<String, TransportError> {
        Ok(SignalingFrame::Hello(local.clone()).encode()?)
    }

    fn ensure_joined(&self) -> Result<(), TransportError> {
        if self.joined {
            Ok(())
        } else {
            Err(TransportError::Unavailable("not joined to relay".into()))
        }
    }
}

fn on_hello(book: &Mutex<NickBook>, peer: PeerId, nick: &str, events: &EventSender) {
    let moved = book.lock().learn(&peer, nick);
    let event = if moved {
        Event::Discovered {
            peer,
            handle: Some(nick.to_string()),
        }
    } else {
        Event::Alive(peer)
    };
    let _ = events.send(event);
}

fn translate(
    notice: RelayNotice,
    local: &PeerId,
    book: &Mutex<NickBook>,
    events: &EventSender,
) {
    match notice {
        RelayNotice::Join { nick } => debug!("{} joined the relay", nick),
        RelayNotice::Part { nick } | RelayNotice::Quit { nick } => {
            if let Some(peer) = book.lock().forget_nick(&nick) {
                let _ = events.send(Event::Departed(peer));
            }
        }
        RelayNotice::NickChange { old, new } => {
            if let Some(peer) = book.lock().rename(&old, &new) {
                let _ = events.send(Event::Discovered {
                    peer,
                    handle: Some(new),
                });
            }
        }
        RelayNotice::Channel { from, text } => match SignalingFrame::decode(&text) {
            Ok(SignalingFrame::Hello(peer)) if &peer != local => {
                on_hello(book, peer, &from, events)
            }
            Ok(SignalingFrame::Hello(_)) => {}
            Ok(SignalingFrame::Signal(envelope)) => {
                debug!("Ignoring {} broadcast by {}", envelope.kind(), from)
            }
            Err(e) => warn!("Discarding malformed channel line from {}: {}", from, e),
        },
        RelayNotice::Private { from, text } => match SignalingFrame::decode(&text) {
            Ok(SignalingFrame::Hello(peer)) => on_hello(book, peer, &from, events),
            Ok(SignalingFrame::Signal(envelope)) => {
                book.lock().learn(&envelope.sender, &from);
                let _ = events.send(Event::Signal(envelope));
            }
            Err(e) => warn!("Discarding malformed private line from {}: {}", from, e),
        },
    }
}

impl SignalingTransport for RelayTransport {
    fn name(&self) -> &'static str {
        "relay"
    }

    fn subscribe(&mut self, local: &PeerId, events: EventSender) -> Result<(), TransportError> {
        let book = self.book.clone();
        let me = local.clone();
        self.hub.join(&self.nick, move |notice| {
            translate(notice, &me, &book, &events)
        })?;
        self.joined = true;
        debug!("Joined relay as {}", self.nick);
        Ok(())
    }

    fn announce_presence(&mut self, local: &PeerId) -> Result<(), TransportError> {
        self.ensure_joined()?;
        let hello = self.hello(local)?;
        self.hub.say(&self.nick, &hello)
    }

    fn withdraw_presence(&mut self, _local: &PeerId) -> Result<(), TransportError> {
        if self.joined {
            self.hub.part(&self.nick);
            self.joined = false;
        }
        Ok(())
    }

    fn publish(
        &mut self,
        recipient: &PeerId,
        envelope: &SignalEnvelope,
    ) -> Result<(), TransportError> {
        self.ensure_joined()?;
        let nick = self
            .book
            .lock()
            .by_peer
            .get(recipient)
            .cloned()
            .ok_or_else(|| TransportError::UnknownRecipient(recipient.clone()))?;
        let line = SignalingFrame::from(envelope.clone()).encode()?;
        self.hub.privmsg(&self.nick, &nick, &line)
    }

    fn heartbeat(&mut self, local: &PeerId) -> Result<(), TransportError> {
        self.announce_presence(local)
    }

    fn greet(&mut self, local: &PeerId, peer: &PeerId) -> Result<(), TransportError> {
        self.ensure_joined()?;
        let nick = self
            .book
            .lock()
            .by_peer
            .get(peer)
            .cloned()
            .ok_or_else(|| TransportError::UnknownRecipient(peer.clone()))?;
        let hello = self.hello(local)?;
        self.hub.privmsg(&self.nick, &nick, &hello)
    }
}

impl Drop for RelayTransport {
    fn drop(&mut self) {
        if self.joined {
            self.hub.quit(&self.nick);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::event_channel;
    use swarm_core::{IceCandidate, Signal};

    fn joined(hub: &RelayHub, id: &str) -> (RelayTransport, PeerId, crate::event::EventReceiver) {
        let peer = PeerId::from(id);
        let mut transport = RelayTransport::new(hub.clone(), RelayTransport::nick_for(&peer));
        let (tx, rx) = event_channel();
        transport.subscribe(&peer, tx).unwrap();
        (transport, peer, rx)
    }

    #[test]
    fn test_nick_derivation() {
        assert_eq!(
            RelayTransport::nick_for(&PeerId::from("peer-0a1b2c3d4e5f")),
            "sw-0a1b2c3d4e5f"
        );
        assert_eq!(RelayTransport::nick_for(&PeerId::from("custom")), "sw-custom");
    }

    #[test]
    fn test_hello_discovers_then_refreshes() {
        let hub = RelayHub::new();
        let (_ta, _a, mut rx_a) = joined(&hub, "peer-a");
        let (mut tb, b, _rx_b) = joined(&hub, "peer-b");

        tb.announce_presence(&b).unwrap();
        tb.heartbeat(&b).unwrap();

        match rx_a.try_recv() {
            Ok(Event::Discovered { peer, handle }) => {
                assert_eq!(peer, b);
                assert_eq!(handle.as_deref(), Some("sw-b"));
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(matches!(rx_a.try_recv(), Ok(Event::Alive(peer)) if peer == b));
    }

    #[test]
    fn test_private_signal_and_greeting() {
        let hub = RelayHub::new();
        let (mut ta, a, mut rx_a) = joined(&hub, "peer-a");
        let (mut tb, b, mut rx_b) = joined(&hub, "peer-b");

        // a cannot address b before hearing from it
        let envelope = SignalEnvelope::new(
            a.clone(),
            Signal::Candidate(IceCandidate::new("candidate:1 1 UDP 1 10.0.0.1 1 typ host")),
        );
        assert!(matches!(
            ta.publish(&b, &envelope),
            Err(TransportError::UnknownRecipient(_))
        ));

        tb.announce_presence(&b).unwrap();
        assert!(matches!(rx_a.try_recv(), Ok(Event::Discovered { .. })));

        ta.greet(&a, &b).unwrap();
        assert!(matches!(rx_b.try_recv(), Ok(Event::Discovered { peer, .. }) if peer == a));

        ta.publish(&b, &envelope).unwrap();
        match rx_b.try_recv() {
            Ok(Event::Signal(received)) => assert_eq!(received, envelope),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_membership_changes() {
        let hub = RelayHub::new();
        let (_ta, _a, mut rx_a) = joined(&hub, "peer-a");
        let (mut tb, b, _rx_b) = joined(&hub, "peer-b");
        tb.announce_presence(&b).unwrap();
        assert!(matches!(rx_a.try_recv(), Ok(Event::Discovered { .. })));

        hub.change_nick("sw-b", "bobby").unwrap();
        match rx_a.try_recv() {
            Ok(Event::Discovered { peer, handle }) => {
                assert_eq!(peer, b);
                assert_eq!(handle.as_deref(), Some("bobby"));
            }
            other => panic!("unexpected event: {:?}", other),
        }

        hub.part("bobby");
        assert!(matches!(rx_a.try_recv(), Ok(Event::Departed(peer)) if peer == b));
        assert_eq!(hub.members(), vec!["sw-a".to_string()]);
    }

    #[test]
    fn test_malformed_lines_are_dropped() {
        let hub = RelayHub::new();
        let (_ta, _a, mut rx_a) = joined(&hub, "peer-a");
        hub.join("legacy", |_| {}).unwrap();

        hub.say("legacy", "HELLO peer-zzz").unwrap();
        hub.privmsg("legacy", "sw-a", "WEBRTC_SIGNAL:{}").unwrap();
        assert!(rx_a.try_recv().is_err());
    }

    #[test]
    fn test_requires_join() {
        let hub = RelayHub::new();
        let peer = PeerId::from("peer-a");
        let mut transport = RelayTransport::new(hub.clone(), "sw-a");
        assert!(matches!(
            transport.announce_presence(&peer),
            Err(TransportError::Unavailable(_))
        ));

        hub.set_online(false);
        let (tx, _rx) = event_channel();
        assert!(transport.subscribe(&peer, tx).is_err());
    }
}
