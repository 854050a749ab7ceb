//! In-process connection primitive
//!
//! Two endpoints of the same [`LoopbackNetwork`] negotiate with the same
//! offer/answer/candidate dance as a real peer connection. The link comes up
//! once both sides hold matching descriptions and at least one remote
//! candidate each; only then do data-channel bytes flow.

use crate::connection::{ConnectionConfig, Connector, LinkError, PeerConnection};
use crate::event::{ConnectionEvent, Event, EventSender, LinkId, PeerConnectionState};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use swarm_core::{IceCandidate, PeerId, SdpType, SessionDescription};
use tracing::trace;

type EndpointKey = (PeerId, PeerId);

struct Endpoint {
    link: LinkId,
    events: EventSender,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    remote_candidates: usize,
    channel_label: Option<String>,
    connected: bool,
}

impl Endpoint {
    fn post(&self, remote: &PeerId, event: ConnectionEvent) {
        let _ = self.events.send(Event::Connection {
            peer: remote.clone(),
            link: self.link,
            event,
        });
    }

    fn ready(&self) -> bool {
        self.local.is_some() && self.remote.is_some() && self.remote_candidates > 0
    }
}

#[derive(Default)]
struct NetState {
    endpoints: HashMap<EndpointKey, Endpoint>,
    sdp_counter: u64,
    refuse: HashSet<PeerId>,
}

impl NetState {
    /// Bring the pair up if both halves are ready and agree on descriptions
    fn try_connect(&mut self, a: &PeerId, b: &PeerId) {
        let (ab, ba) = match (
            self.endpoints.get(&(a.clone(), b.clone())),
            self.endpoints.get(&(b.clone(), a.clone())),
        ) {
            (Some(ab), Some(ba)) => (ab, ba),
            _ => return,
        };
        if ab.connected || !ab.ready() || !ba.ready() {
            return;
        }
        if ab.local != ba.remote || ba.local != ab.remote {
            return;
        }
        let open = ab.channel_label.is_some() || ba.channel_label.is_some();

        for (local, remote) in [(a, b), (b, a)] {
            if let Some(endpoint) = self.endpoints.get_mut(&(local.clone(), remote.clone())) {
                endpoint.connected = true;
                endpoint.post(
                    remote,
                    ConnectionEvent::StateChanged(PeerConnectionState::Connected),
                );
                if open {
                    endpoint.post(remote, ConnectionEvent::ChannelOpen);
                }
            }
        }
        trace!("Loopback link {} <-> {} is up", a, b);
    }
}

/// Shared in-process network
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    inner: Arc<Mutex<NetState>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connector creating endpoints on this network
    pub fn connector(&self) -> LoopbackConnector {
        LoopbackConnector {
            network: self.clone(),
        }
    }

    /// Reject every description authored by `peer`
    pub fn reject_descriptions_from(&self, peer: &PeerId) {
        self.inner.lock().refuse.insert(peer.clone());
    }

    /// Drop the link between two peers; both sides observe a failure
    pub fn sever(&self, a: &PeerId, b: &PeerId) {
        let mut state = self.inner.lock();
        for (local, remote) in [(a, b), (b, a)] {
            if let Some(endpoint) = state.endpoints.get_mut(&(local.clone(), remote.clone())) {
                endpoint.connected = false;
                endpoint.post(
                    remote,
                    ConnectionEvent::StateChanged(PeerConnectionState::Failed),
                );
            }
        }
    }

    /// True if both halves of the pair are up
    pub fn is_connected(&self, a: &PeerId, b: &PeerId) -> bool {
        let state = self.inner.lock();
        let up = |local: &PeerId, remote: &PeerId| {
            state
                .endpoints
                .get(&(local.clone(), remote.clone()))
                .map(|e| e.connected)
                .unwrap_or(false)
        };
        up(a, b) && up(b, a)
    }
}

/// [`Connector`] for a [`LoopbackNetwork`]
#[derive(Clone)]
pub struct LoopbackConnector {
    network: LoopbackNetwork,
}

impl Connector for LoopbackConnector {
    fn create(
        &self,
        local: &PeerId,
        remote: &PeerId,
        link: LinkId,
        config: &ConnectionConfig,
        events: EventSender,
    ) -> Result<Box<dyn PeerConnection>, LinkError> {
        if local == remote {
            return Err(LinkError::Setup("cannot connect to self".into()));
        }
        let mut state = self.network.inner.lock();
        let replaced = state.endpoints.insert(
            (local.clone(), remote.clone()),
            Endpoint {
                link,
                events,
                local: None,
                remote: None,
                remote_candidates: 0,
                channel_label: None,
                connected: false,
            },
        );
        if replaced.is_some() {
            trace!("Replaced loopback endpoint {} -> {}", local, remote);
        }
        trace!(
            "Created loopback endpoint {} -> {} (link {}, {} ice servers)",
            local,
            remote,
            link,
            config.ice_servers.len()
        );
        Ok(Box::new(LoopbackConnection {
            network: self.network.clone(),
            local: local.clone(),
            remote: remote.clone(),
            link,
        }))
    }
}

/// One endpoint of a loopback link
pub struct LoopbackConnection {
    network: LoopbackNetwork,
    local: PeerId,
    remote: PeerId,
    link: LinkId,
}

impl LoopbackConnection {
    fn key(&self) -> EndpointKey {
        (self.local.clone(), self.remote.clone())
    }

    /// Run `f` against this connection's endpoint if it is still current
    fn with_endpoint<R>(
        &self,
        state: &mut NetState,
        f: impl FnOnce(&mut Endpoint) -> R,
    ) -> Option<R> {
        match state.endpoints.get_mut(&self.key()) {
            Some(endpoint) if endpoint.link == self.link => Some(f(endpoint)),
            _ => None,
        }
    }

    fn describe(&mut self, sdp_type: SdpType) {
        let mut state = self.network.inner.lock();
        state.sdp_counter += 1;
        let sdp = format!(
            "v=0 loopback {} {} {}",
            self.local, self.remote, state.sdp_counter
        );
        let desc = SessionDescription { sdp_type, sdp };
        let candidate = IceCandidate::new(format!(
            "candidate:{} 1 udp 2122260223 127.0.0.1 {} typ host",
            self.link,
            40000 + (state.sdp_counter % 20000)
        ));
        let remote = self.remote.clone();

        self.with_endpoint(&mut state, |endpoint| {
            let has_remote_offer = matches!(
                &endpoint.remote,
                Some(d) if d.sdp_type == SdpType::Offer
            );
            if sdp_type == SdpType::Answer && !has_remote_offer {
                endpoint.post(
                    &remote,
                    ConnectionEvent::NegotiationFailed("no remote offer to answer".into()),
                );
                return;
            }
            endpoint.local = Some(desc.clone());
            endpoint.post(&remote, ConnectionEvent::LocalDescription(desc));
            endpoint.post(&remote, ConnectionEvent::CandidateGenerated(candidate));
        });
        state.try_connect(&self.local, &self.remote);
    }
}

/// Check that a description was authored by `from` for `to`
fn addressed(desc: &SessionDescription, from: &PeerId, to: &PeerId) -> bool {
    let tokens: Vec<&str> = desc.sdp.split_whitespace().collect();
    matches!(
        tokens.as_slice(),
        ["v=0", "loopback", author, target, _] if *author == from.as_str() && *target == to.as_str()
    )
}

impl PeerConnection for LoopbackConnection {
    fn create_data_channel(&mut self, label: &str) {
        let mut state = self.network.inner.lock();
        self.with_endpoint(&mut state, |endpoint| {
            endpoint.channel_label = Some(label.to_string());
        });
    }

    fn create_offer(&mut self) {
        self.describe(SdpType::Offer);
    }

    fn create_answer(&mut self) {
        self.describe(SdpType::Answer);
    }

    fn set_remote_description(&mut self, desc: SessionDescription) {
        let mut state = self.network.inner.lock();
        let refused = state.refuse.contains(&self.remote);
        let valid = addressed(&desc, &self.remote, &self.local);
        let remote = self.remote.clone();

        self.with_endpoint(&mut state, |endpoint| {
            let expected = match &endpoint.local {
                Some(local) if local.sdp_type == SdpType::Offer => SdpType::Answer,
                Some(_) => {
                    endpoint.post(
                        &remote,
                        ConnectionEvent::NegotiationFailed("negotiation already complete".into()),
                    );
                    return;
                }
                None => SdpType::Offer,
            };
            if refused || !valid || desc.sdp_type != expected || endpoint.remote.is_some() {
                endpoint.post(
                    &remote,
                    ConnectionEvent::NegotiationFailed(format!(
                        "rejected remote {:?} description",
                        desc.sdp_type
                    )),
                );
                return;
            }
            endpoint.remote = Some(desc);
        });
        state.try_connect(&self.local, &self.remote);
    }

    fn add_candidate(&mut self, candidate: IceCandidate) {
        let mut state = self.network.inner.lock();
        let remote = self.remote.clone();
        self.with_endpoint(&mut state, |endpoint| {
            if endpoint.remote.is_none() {
                endpoint.post(
                    &remote,
                    ConnectionEvent::NegotiationFailed("candidate before remote description".into()),
                );
                return;
            }
            if !candidate.candidate.starts_with("candidate:") {
                endpoint.post(
                    &remote,
                    ConnectionEvent::NegotiationFailed(format!(
                        "malformed candidate {}",
                        candidate.candidate
                    )),
                );
                return;
            }
            endpoint.remote_candidates += 1;
        });
        state.try_connect(&self.local, &self.remote);
    }

    fn send(&mut self, data: Bytes) -> Result<(), LinkError> {
        let mut state = self.network.inner.lock();
        let open = self
            .with_endpoint(&mut state, |endpoint| endpoint.connected)
            .unwrap_or(false);
        if !open {
            return Err(LinkError::NotOpen);
        }
        let peer = state
            .endpoints
            .get(&(self.remote.clone(), self.local.clone()))
            .filter(|endpoint| endpoint.connected)
            .ok_or(LinkError::NotOpen)?;
        peer.post(&self.local, ConnectionEvent::ChannelMessage(data));
        Ok(())
    }

    fn close(&mut self) {
        let mut state = self.network.inner.lock();
        let key = self.key();
        let current = matches!(state.endpoints.get(&key), Some(e) if e.link == self.link);
        if !current {
            return;
        }
        let was_connected = state
            .endpoints
            .remove(&key)
            .map(|e| e.connected)
            .unwrap_or(false);
        if !was_connected {
            return;
        }
        if let Some(peer) = state
            .endpoints
            .get_mut(&(self.remote.clone(), self.local.clone()))
        {
            peer.connected = false;
            peer.post(&self.local, ConnectionEvent::ChannelClosed);
            peer.post(
                &self.local,
                ConnectionEvent::StateChanged(PeerConnectionState::Disconnected),
            );
        }
    }
}

impl Drop for LoopbackConnection {
    fn drop(&mut self) {
        self.close();
    }
}
