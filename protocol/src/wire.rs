//! # Wire Framing & RPC Codec (§4.5, §6)
//!
//! Every stream carries `u32_be length ‖ payload`, length capped at 10 MiB.
//! The payload itself is a `bincode`-encoded [`Rpc`]. Unknown fields survive
//! round trips because `serde`/`bincode` simply carries whatever the struct
//! defines — there is no explicit schema evolution here, matching the
//! teacher's wire types.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::config::MAX_FRAME_LEN;
use crate::error::RouterError;
use crate::identity::NodeId;

/// Field-for-field wire shape of a gossip message (§3's signing envelope
/// fields plus what travels over the wire). `id`/`timestamp` are never
/// serialized — the receiver recomputes `id` from `from`/`seqno`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    pub from: [u8; 32],
    pub data: Vec<u8>,
    pub seqno: u64,
    pub topic: String,
    pub signature: Option<Vec<u8>>,
    pub key: Option<Vec<u8>>,
}

impl From<&crate::message::Message> for WireMessage {
    fn from(m: &crate::message::Message) -> Self {
        Self {
            from: *m.from.as_bytes(),
            data: m.data.clone(),
            seqno: m.seq,
            topic: m.topic.clone(),
            signature: m.signature.clone(),
            key: m.key.clone(),
        }
    }
}

impl WireMessage {
    pub fn into_message(self) -> crate::message::Message {
        let key_type = self.key.as_ref().map(|k| crate::crypto::KeyType::infer_from_key_len(k.len()));
        crate::message::Message {
            topic: self.topic,
            from: NodeId::from_bytes(self.from),
            data: self.data,
            seq: self.seqno,
            signature: self.signature,
            key: self.key,
            key_type,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionChange {
    pub topic: String,
    pub subscribe: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlIHave {
    pub topic: String,
    pub ids: Vec<[u8; 40]>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlIWant {
    pub ids: Vec<[u8; 40]>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlGraft {
    pub topic: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlPrune {
    pub topic: String,
    pub backoff_secs: u64,
    pub peers: Vec<[u8; 32]>,
}

/// One stream, one `Rpc`, then `CloseWrite`. Any combination of the four
/// fields may be populated in a single frame; an empty `Rpc` is valid (and
/// a no-op for the receiver).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Rpc {
    #[serde(default)]
    pub subscriptions: Vec<SubscriptionChange>,
    #[serde(default)]
    pub messages: Vec<WireMessage>,
    #[serde(default)]
    pub ihave: Vec<ControlIHave>,
    #[serde(default)]
    pub iwant: Vec<ControlIWant>,
    #[serde(default)]
    pub graft: Vec<ControlGraft>,
    #[serde(default)]
    pub prune: Vec<ControlPrune>,
}

impl Rpc {
    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
            && self.messages.is_empty()
            && self.ihave.is_empty()
            && self.iwant.is_empty()
            && self.graft.is_empty()
            && self.prune.is_empty()
    }

    pub fn encode(&self) -> Result<Vec<u8>, RouterError> {
        bincode::serialize(self).map_err(|e| RouterError::WriteFailed(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, RouterError> {
        bincode::deserialize(bytes).map_err(|e| RouterError::ReadFailed(e.to_string()))
    }
}

/// Writes `payload.len() as u32_be ‖ payload` and does not flush — callers
/// own stream lifecycle (close/close-write) per §5's suspension-point rules.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, payload: &[u8]) -> Result<(), RouterError> {
    if payload.len() as u32 > MAX_FRAME_LEN {
        return Err(RouterError::MessageTooLarge(payload.len()));
    }
    writer
        .write_all(&(payload.len() as u32).to_be_bytes())
        .await
        .map_err(|e| RouterError::WriteFailed(e.to_string()))?;
    writer
        .write_all(payload)
        .await
        .map_err(|e| RouterError::WriteFailed(e.to_string()))?;
    Ok(())
}

/// Reads one `u32_be length ‖ payload` frame, rejecting lengths over
/// [`MAX_FRAME_LEN`] before allocating the read buffer.
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Vec<u8>, RouterError> {
    let mut len_bytes = [0u8; 4];
    reader
        .read_exact(&mut len_bytes)
        .await
        .map_err(|e| RouterError::ReadFailed(e.to_string()))?;
    let len = u32::from_be_bytes(len_bytes);
    if len > MAX_FRAME_LEN {
        return Err(RouterError::MessageTooLarge(len as usize));
    }
    let mut buf = vec![0u8; len as usize];
    reader
        .read_exact(&mut buf)
        .await
        .map_err(|e| RouterError::ReadFailed(e.to_string()))?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_round_trips_over_an_in_memory_pipe() {
        let rpc = Rpc {
            subscriptions: vec![SubscriptionChange { topic: "t".into(), subscribe: true }],
            ..Default::default()
        };
        let encoded = rpc.encode().unwrap();

        let (mut client, mut server) = tokio::io::duplex(64 * 1024);
        write_frame(&mut client, &encoded).await.unwrap();
        drop(client);

        let received = read_frame(&mut server).await.unwrap();
        let decoded = Rpc::decode(&received).unwrap();
        assert_eq!(decoded.subscriptions.len(), 1);
        assert_eq!(decoded.subscriptions[0].topic, "t");
    }

    #[tokio::test]
    async fn oversized_frame_length_is_rejected_before_reading() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let huge = (MAX_FRAME_LEN + 1).to_be_bytes();
        client.write_all(&huge).await.unwrap();

        let result = read_frame(&mut server).await;
        assert!(result.is_err());
    }

    #[test]
    fn wire_message_round_trips_through_message() {
        let from = NodeId::from_bytes([7u8; 32]);
        let msg = crate::message::Message::new("t", from, 9, vec![1, 2, 3]);
        let wire = WireMessage::from(&msg);
        let back = wire.into_message();
        assert_eq!(back.from, from);
        assert_eq!(back.seq, 9);
        assert_eq!(back.data, vec![1, 2, 3]);
    }

    #[test]
    fn empty_rpc_is_empty() {
        assert!(Rpc::default().is_empty());
    }
}
