// Rendezvous wire messages and datagram classification
//
// The rendezvous server speaks plain JSON over UDP. Once both players have
// registered it answers each of them with the other's public endpoint.

use serde::{Deserialize, Serialize};

use super::args::PlayerUid;

/// Keepalive payload exchanged between peers
pub const KEEPALIVE_PAYLOAD: &[u8] = b"ping";

/// Registration (`kill = false`) or withdrawal (`kill = true`) sent to the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PunchRequest {
    pub uid: PlayerUid,
    #[serde(rename = "peerUid")]
    pub peer_uid: PlayerUid,
    pub kill: bool,
}

impl PunchRequest {
    pub fn register(uid: &PlayerUid, peer_uid: &PlayerUid) -> Self {
        Self {
            uid: uid.clone(),
            peer_uid: peer_uid.clone(),
            kill: false,
        }
    }

    pub fn withdraw(uid: &PlayerUid, peer_uid: &PlayerUid) -> Self {
        Self {
            uid: uid.clone(),
            peer_uid: peer_uid.clone(),
            kill: true,
        }
    }
}

/// Public endpoint of the opponent as observed by the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerEndpoint {
    pub address: String,
    pub port: u16,
}

/// Server answer carrying the opponent endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpponentEnvelope {
    #[serde(default)]
    pub match_id: Option<String>,
    pub peer: PeerEndpoint,
}

/// What a datagram arriving on the punch socket means
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound<'a> {
    /// Opponent endpoint announced by the server
    Envelope(OpponentEnvelope),
    /// Peer keepalive
    KeepAlive,
    /// Server chatter that is neither an envelope nor game data
    Control,
    /// Emulator payload from the opponent
    Game(&'a [u8]),
}

/// Classify a punch-socket datagram. Envelope parsing wins over everything else.
pub fn classify(payload: &[u8]) -> Inbound<'_> {
    if let Ok(envelope) = serde_json::from_slice::<OpponentEnvelope>(payload) {
        return Inbound::Envelope(envelope);
    }
    if payload == KEEPALIVE_PAYLOAD {
        return Inbound::KeepAlive;
    }
    if contains(payload, br#""port""#) {
        return Inbound::Control;
    }
    Inbound::Game(payload)
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}
