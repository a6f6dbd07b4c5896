//! Threshold session plumbing
//!
//! A [`Session`] is one keygen or sign run. It owns the inbound message
//! stream for its session id, buffers messages that arrive for a later
//! round, drops duplicates and strangers, and bounds every wait by the
//! round timeout. Private messages are sealed to the recipient's transport
//! key before they touch the bus.

use safe_common::crypto::{parse_transport_public, seal_to};
use safe_common::{BusError, BusFrame, CryptoError, GroupBus, SessionMessage, TransportKey};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;
use x25519_dalek::PublicKey;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("timed out waiting for round {round:?}: have {received} of {expected} messages")]
    Timeout {
        round: Round,
        received: usize,
        expected: usize,
    },
    #[error("session inbox closed")]
    Closed,
    #[error("unknown member: {0}")]
    UnknownMember(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Round tags; every protocol step uses its own tag so buffered messages
/// never leak between steps
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Round {
    DkgCommit = 1,
    DkgShare = 2,
    SignCommit = 3,
    SignShare = 4,
    ChainCode = 5,
    EcdsaKeygen = 6,
    Join = 7,
    EcdsaTriple0 = 8,
    EcdsaTriple1 = 9,
    EcdsaPresign = 10,
    EcdsaSign = 11,
    Signature = 12,
}

impl Round {
    pub fn tag(self) -> u8 {
        self as u8
    }
}

/// Static group facts shared by every session on a node
pub struct SessionContext {
    pub node_id: String,
    /// Members in canonical order; a member's protocol index is its
    /// position plus one
    pub members: Vec<String>,
    pub threshold: u16,
    pub round_timeout: Duration,
    transport: TransportKey,
    peers: BTreeMap<String, PublicKey>,
    bus: Arc<dyn GroupBus>,
}

impl SessionContext {
    pub fn new(
        node_id: impl Into<String>,
        members: BTreeMap<String, String>,
        threshold: u16,
        round_timeout: Duration,
        transport: TransportKey,
        bus: Arc<dyn GroupBus>,
    ) -> Result<Self, SessionError> {
        let node_id = node_id.into();
        let mut peers = BTreeMap::new();
        for (id, public_hex) in members {
            peers.insert(id, parse_transport_public(&public_hex)?);
        }
        if !peers.contains_key(&node_id) {
            return Err(SessionError::UnknownMember(node_id));
        }
        Ok(Self {
            node_id,
            members: peers.keys().cloned().collect(),
            threshold,
            round_timeout,
            transport,
            peers,
            bus,
        })
    }

    pub fn index_of(&self, member: &str) -> Option<u16> {
        self.members
            .iter()
            .position(|m| m == member)
            .map(|i| i as u16 + 1)
    }

    pub fn member_at(&self, index: u16) -> Option<&str> {
        let position = usize::from(index).checked_sub(1)?;
        self.members.get(position).map(String::as_str)
    }

    pub fn my_index(&self) -> Result<u16, SessionError> {
        self.index_of(&self.node_id)
            .ok_or_else(|| SessionError::UnknownMember(self.node_id.clone()))
    }

    pub fn is_member(&self, id: &str) -> bool {
        self.peers.contains_key(id)
    }

    pub fn transport_public_hex(&self) -> String {
        self.transport.public_hex()
    }

    pub fn bus(&self) -> &Arc<dyn GroupBus> {
        &self.bus
    }
}

/// One run of a threshold protocol
pub struct Session {
    pub id: Uuid,
    ctx: Arc<SessionContext>,
    inbox: mpsc::UnboundedReceiver<SessionMessage>,
    pending: BTreeMap<u8, VecDeque<SessionMessage>>,
    seen: HashSet<(String, u8, u32)>,
    sent: BTreeMap<u8, u32>,
}

impl Session {
    pub fn new(id: Uuid, ctx: Arc<SessionContext>, inbox: mpsc::UnboundedReceiver<SessionMessage>) -> Self {
        Self {
            id,
            ctx,
            inbox,
            pending: BTreeMap::new(),
            seen: HashSet::new(),
            sent: BTreeMap::new(),
        }
    }

    pub fn ctx(&self) -> &SessionContext {
        &self.ctx
    }

    fn next_seq(&mut self, round: Round) -> u32 {
        let seq = self.sent.entry(round.tag()).or_insert(0);
        let current = *seq;
        *seq += 1;
        current
    }

    /// Sends `payload` to every member, this node included
    pub async fn broadcast(&mut self, round: Round, payload: Vec<u8>) -> Result<(), SessionError> {
        let seq = self.next_seq(round);
        let message = SessionMessage {
            session_id: self.id,
            round: round.tag(),
            seq,
            from: self.ctx.node_id.clone(),
            to: None,
            payload,
        };
        self.ctx.bus.publish(BusFrame::Session(message)).await?;
        Ok(())
    }

    /// Seals `payload` to `to` and sends it to that member alone
    pub async fn send_private(&mut self, round: Round, to: &str, payload: &[u8]) -> Result<(), SessionError> {
        let recipient = self
            .ctx
            .peers
            .get(to)
            .ok_or_else(|| SessionError::UnknownMember(to.to_string()))?;
        let sealed = seal_to(recipient, payload)?;
        let seq = self.next_seq(round);
        let message = SessionMessage {
            session_id: self.id,
            round: round.tag(),
            seq,
            from: self.ctx.node_id.clone(),
            to: Some(to.to_string()),
            payload: sealed,
        };
        self.ctx.bus.publish(BusFrame::Session(message)).await?;
        Ok(())
    }

    /// Checks a message and opens it when private; `None` drops it
    fn accept(&mut self, mut message: SessionMessage) -> Option<SessionMessage> {
        if message.session_id != self.id || !self.ctx.is_member(&message.from) {
            tracing::debug!(session_id = %self.id, from = %message.from, "dropping stray session message");
            return None;
        }
        if !self.seen.insert((message.from.clone(), message.round, message.seq)) {
            return None;
        }
        if let Some(to) = &message.to {
            if *to != self.ctx.node_id {
                return None;
            }
            match self.ctx.transport.open(&message.payload) {
                Ok(plain) => message.payload = plain,
                Err(e) => {
                    tracing::warn!(
                        session_id = %self.id,
                        from = %message.from,
                        error = %e,
                        "failed to open private message"
                    );
                    return None;
                }
            }
        }
        Some(message)
    }

    async fn next_until(&mut self, round: Round, deadline: Instant) -> Result<Option<SessionMessage>, SessionError> {
        if let Some(message) = self.pending.get_mut(&round.tag()).and_then(VecDeque::pop_front) {
            return Ok(Some(message));
        }
        loop {
            let received = match tokio::time::timeout_at(deadline, self.inbox.recv()).await {
                Ok(Some(message)) => message,
                Ok(None) => return Err(SessionError::Closed),
                Err(_) => return Ok(None),
            };
            let Some(message) = self.accept(received) else {
                continue;
            };
            if message.round == round.tag() {
                return Ok(Some(message));
            }
            self.pending.entry(message.round).or_default().push_back(message);
        }
    }

    /// Next accepted message for `round`, waiting at most one round timeout
    pub async fn next(&mut self, round: Round) -> Result<SessionMessage, SessionError> {
        let deadline = Instant::now() + self.ctx.round_timeout;
        self.next_until(round, deadline)
            .await?
            .ok_or(SessionError::Timeout {
                round,
                received: 0,
                expected: 1,
            })
    }

    /// Waits for one message from each of `from`; later messages from the
    /// same sender in this round are ignored
    pub async fn collect(&mut self, round: Round, from: &[String]) -> Result<BTreeMap<String, Vec<u8>>, SessionError> {
        let deadline = Instant::now() + self.ctx.round_timeout;
        let mut collected = BTreeMap::new();
        while collected.len() < from.len() {
            let Some(message) = self.next_until(round, deadline).await? else {
                return Err(SessionError::Timeout {
                    round,
                    received: collected.len(),
                    expected: from.len(),
                });
            };
            if from.contains(&message.from) && !collected.contains_key(&message.from) {
                collected.insert(message.from, message.payload);
            }
        }
        Ok(collected)
    }

    /// The first `count` distinct senders of `round` in bus order
    pub async fn first_senders(&mut self, round: Round, count: usize) -> Result<Vec<(String, Vec<u8>)>, SessionError> {
        let deadline = Instant::now() + self.ctx.round_timeout;
        let mut senders: Vec<(String, Vec<u8>)> = Vec::with_capacity(count);
        while senders.len() < count {
            let Some(message) = self.next_until(round, deadline).await? else {
                return Err(SessionError::Timeout {
                    round,
                    received: senders.len(),
                    expected: count,
                });
            };
            if !senders.iter().any(|(id, _)| *id == message.from) {
                senders.push((message.from, message.payload));
            }
        }
        Ok(senders)
    }
}
