use crate::error::Result;
use crate::message::Message;

/// Turns messages into bytes and back for a transport. The replica itself only
/// deals in `Message` values and never calls a codec.
pub trait Codec {
    fn encode(&self, message: &Message) -> Result<Vec<u8>>;
    fn decode(&self, bytes: &[u8]) -> Result<Message>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode(&self, message: &Message) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(message)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Message> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::membership::ClusterMember;
    use crate::message::Entry;
    use crate::snapshot::SnapshotManager;
    use bytes::Bytes;

    #[test]
    fn install_snapshot_survives_the_wire() {
        let snapshot = SnapshotManager::new(4, None).create_snapshot(
            9,
            2,
            Bytes::from_static(b"\x00\x01state"),
            vec![ClusterMember::new(1, "10.0.0.1:7000")],
        );
        let message = Message::InstallSnapshot {
            leader_id: 1,
            term: 3,
            snapshot,
            trailing_entries: vec![Entry::command(10, 3, vec![7, 7]), Entry::noop(11, 3)],
        };

        let codec = JsonCodec;
        let decoded = codec.decode(&codec.encode(&message).unwrap()).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn garbage_is_a_serialization_error() {
        assert!(matches!(JsonCodec.decode(b"{not json"), Err(Error::Serialization(_))));
    }
}
