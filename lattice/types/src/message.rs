// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};

use crate::metadata::MetadataRecord;

/// Identity of the peer a message came from (or is synthesized for, when the
/// runtime reports a local failure on an outbound message).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageSenderInfo {
    pub id: u64,
    pub name: String,
}

/// One message on the bus. Sequences are assigned by the sending application;
/// the runtime does not enforce uniqueness.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub sender: MessageSenderInfo,
    pub message_type: i32,
    pub sequence: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty", with = "serde_bytes_vec")]
    pub payload: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MetadataRecord>,
}

// Payload bytes serialize as a plain array; this keeps serde_json happy
// without pulling a dedicated bytes adapter into the public type.
mod serde_bytes_vec {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(data)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        Vec::<u8>::deserialize(deserializer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trip() {
        let envelope = MessageEnvelope {
            sender: MessageSenderInfo {
                id: 9,
                name: "echo-svr-9".to_string(),
            },
            message_type: 3,
            sequence: 101,
            payload: b"hello".to_vec(),
            metadata: None,
        };
        let text = serde_json::to_string(&envelope).unwrap();
        let decoded: MessageEnvelope = serde_json::from_str(&text).unwrap();
        assert_eq!(decoded, envelope);
    }
}
