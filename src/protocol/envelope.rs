//! JSON messages exchanged on the DataStore channel.

use crate::error::{DStoreError, Result};
use crate::store::{Delta, ElementSnapshot};
use serde::{Deserialize, Serialize};

/// A command invocation as sent by the client. Element ids are allocated by
/// the client so both sides refer to the command and its status by the same
/// id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRequest {
    pub command: ElementSnapshot,
    pub status: ElementSnapshot,
    pub subject: ElementSnapshot,
    #[serde(default)]
    pub args: Vec<ElementSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Envelope {
    Handshake { version: String },
    Command(CommandRequest),
    /// Activates a miner. The status is allocated by the client and closed
    /// by the server once the miner is up.
    ActivateMiner { miner: String, status: ElementSnapshot },
    Delta(Delta),
    Exit,
}

impl Envelope {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        serde_json::from_slice(raw).map_err(|e| DStoreError::Protocol(format!("malformed envelope: {}", e)))
    }
}
