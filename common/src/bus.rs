//! Group bus collaborator
//!
//! The bus delivers two kinds of frames between nodes: value transfers whose
//! memos carry requests or sealed operations, and session messages carrying
//! threshold protocol rounds. Delivery is at-least-once and ordered per
//! sender; [`MemoryBus`] additionally gives every member the same global
//! order, which signing sessions rely on to agree on participants.
//! Broadcast session messages are echoed back to their sender so that each
//! member observes its own message at the same position as everyone else.

use async_trait::async_trait;
use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("unknown member: {0}")]
    UnknownMember(String),
    #[error("delivery to {member} failed: {reason}")]
    Delivery { member: String, reason: String },
    #[error("bus closed")]
    Closed,
}

/// A value transfer on the group ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    /// Deterministic id; replays of the same logical transfer reuse it
    pub trace_id: Uuid,
    pub transaction_hash: String,
    /// Conversation id of the sending member or group
    pub sender: String,
    pub receivers: Vec<String>,
    pub threshold: u8,
    pub asset_id: Uuid,
    /// Decimal amount in asset units
    pub amount: String,
    pub memo: String,
}

/// One threshold protocol message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMessage {
    pub session_id: Uuid,
    pub round: u8,
    /// Per-sender sequence within a round, for duplicate suppression
    pub seq: u32,
    pub from: String,
    /// Set for private messages; the payload is then sealed to the recipient
    pub to: Option<String>,
    #[serde(with = "hex_bytes")]
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BusFrame {
    Transfer(Transfer),
    Session(SessionMessage),
}

impl BusFrame {
    /// Members a frame is delivered to; broadcasts include the sender
    fn recipients<'a>(&'a self, members: impl Iterator<Item = &'a String>) -> Vec<String> {
        match self {
            BusFrame::Transfer(t) => t.receivers.clone(),
            BusFrame::Session(m) => match &m.to {
                Some(to) => vec![to.clone()],
                None => members.cloned().collect(),
            },
        }
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

#[async_trait]
pub trait GroupBus: Send + Sync {
    async fn publish(&self, frame: BusFrame) -> Result<(), BusError>;
}

/// In-process bus with a single global delivery order
#[derive(Default)]
pub struct MemoryBus {
    members: Mutex<BTreeMap<String, mpsc::UnboundedSender<BusFrame>>>,
}

impl MemoryBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers a member and returns its inbound stream
    pub fn join(&self, member: &str) -> mpsc::UnboundedReceiver<BusFrame> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut members) = self.members.lock() {
            members.insert(member.to_string(), tx);
        }
        rx
    }
}

#[async_trait]
impl GroupBus for MemoryBus {
    async fn publish(&self, frame: BusFrame) -> Result<(), BusError> {
        // fan-out under the lock keeps one order for every member
        let members = self.members.lock().map_err(|_| BusError::Closed)?;
        for recipient in frame.recipients(members.keys()) {
            match members.get(&recipient) {
                Some(tx) => {
                    if tx.send(frame.clone()).is_err() {
                        tracing::debug!(member = %recipient, "dropping frame for departed member");
                    }
                }
                None => tracing::debug!(member = %recipient, "no local member for frame"),
            }
        }
        Ok(())
    }
}

/// Bus that POSTs frames to each member's `/bus` endpoint
pub struct HttpBus {
    client: reqwest::Client,
    peers: BTreeMap<String, String>,
}

impl HttpBus {
    pub fn new(peers: BTreeMap<String, String>) -> Self {
        let peers = peers
            .into_iter()
            .map(|(id, url)| (id, url.trim_end_matches('/').to_string()))
            .collect();
        Self {
            client: reqwest::Client::new(),
            peers,
        }
    }
}

#[async_trait]
impl GroupBus for HttpBus {
    async fn publish(&self, frame: BusFrame) -> Result<(), BusError> {
        let mut first_error = None;
        for recipient in frame.recipients(self.peers.keys()) {
            let Some(url) = self.peers.get(&recipient) else {
                first_error.get_or_insert(BusError::UnknownMember(recipient));
                continue;
            };
            let result = self
                .client
                .post(format!("{}/bus", url))
                .json(&frame)
                .send()
                .await
                .and_then(|r| r.error_for_status());
            if let Err(e) = result {
                tracing::warn!(member = %recipient, error = %e, "bus delivery failed");
                first_error.get_or_insert(BusError::Delivery {
                    member: recipient,
                    reason: e.to_string(),
                });
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Router accepting frames for the local node at `POST /bus`
pub fn bus_router(inbound: mpsc::UnboundedSender<BusFrame>) -> Router {
    Router::new()
        .route("/bus", post(receive_frame))
        .with_state(inbound)
}

async fn receive_frame(
    State(inbound): State<mpsc::UnboundedSender<BusFrame>>,
    Json(frame): Json<BusFrame>,
) -> StatusCode {
    match inbound.send(frame) {
        Ok(()) => StatusCode::ACCEPTED,
        Err(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}
