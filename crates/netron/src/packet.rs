//! Wire packets exchanged between two runtimes.
//!
//! Every frame a transport carries is one JSON-encoded [`Packet`]. Requests
//! carry a sequence number that the matching `Reply` echoes back.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

use crate::error::Result;
use crate::error::WireError;
use crate::identity::PeerInfo;
use crate::value::WireValue;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Packet {
    /// First packet on a fresh connection, sent by both sides.
    Hello { info: PeerInfo },
    Get { seq: u64, def_id: u64, name: String, data: WireValue },
    Set { seq: u64, def_id: u64, name: String, data: WireValue },
    Task { seq: u64, tasks: Vec<WireTaskRequest> },
    Subscribe { seq: u64, event: String },
    Unsubscribe { seq: u64, event: String },
    /// An event the receiver subscribed to. Not acknowledged.
    Event { name: String, data: WireValue },
    Reply { seq: u64, status: std::result::Result<ReplyBody, WireError> },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyBody {
    Value(WireValue),
    Tasks(BTreeMap<String, WireTaskResult>),
    Done,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WireTaskRequest {
    pub task: String,
    #[serde(default)]
    pub args: Vec<WireValue>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireTaskResult {
    Completed(WireValue),
    Failed(WireError),
}

pub fn encode(packet: &Packet) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(packet)?)
}

pub fn decode(bytes: &[u8]) -> Result<Packet> {
    Ok(serde_json::from_slice(bytes)?)
}
