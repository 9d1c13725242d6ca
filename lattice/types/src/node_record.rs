// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::metadata::MetadataRecord;

/// An ingress gateway published by a peer. Traffic that cannot reach a listen
/// address directly goes through one of these.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayRecord {
    pub address: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_hosts: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_namespaces: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub match_labels: BTreeMap<String, String>,
}

#[derive(Debug, Error)]
pub enum NodeRecordCodecError {
    #[error("node record is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("node record is not valid UTF-8")]
    Utf8(#[from] std::str::Utf8Error),
}

/// The discovery record one peer publishes under the registry root. This is
/// the value stored at `<root>/by_id/<hex id>` and `<root>/by_name/<name>`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    #[serde(default)]
    pub id: u64,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub identity: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hash_code: String,
    #[serde(default)]
    pub type_id: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub type_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hostname: String,
    #[serde(default)]
    pub pid: i32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub listen: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gateways: Vec<GatewayRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MetadataRecord>,
}

impl NodeRecord {
    /// Projection carrying only the identifying fields, used when a message
    /// needs to name a peer without shipping the whole record.
    pub fn key_fields(&self) -> NodeRecord {
        NodeRecord {
            id: self.id,
            name: self.name.clone(),
            identity: self.identity.clone(),
            hash_code: self.hash_code.clone(),
            type_id: self.type_id,
            type_name: self.type_name.clone(),
            hostname: self.hostname.clone(),
            pid: self.pid,
            ..NodeRecord::default()
        }
    }

    /// Serializes the record into the JSON bytes stored in the registry.
    pub fn to_json_bytes(&self) -> Result<Vec<u8>, NodeRecordCodecError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parses a record out of registry value bytes.
    pub fn from_json_bytes(data: &[u8]) -> Result<NodeRecord, NodeRecordCodecError> {
        let text = std::str::from_utf8(data)?;
        Ok(serde_json::from_str(text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> NodeRecord {
        NodeRecord {
            id: 0x1234,
            name: "echo-svr-1".to_string(),
            identity: "echo-svr-1@host-a".to_string(),
            type_id: 7,
            type_name: "echo-svr".to_string(),
            hostname: "host-a".to_string(),
            pid: 4242,
            version: "1.3.0".to_string(),
            listen: vec![
                "ipv4://10.0.0.3:9100".to_string(),
                "unix:///run/echo.sock".to_string(),
            ],
            gateways: vec![GatewayRecord {
                address: "dns://gw.internal:9100".to_string(),
                ..GatewayRecord::default()
            }],
            metadata: Some(MetadataRecord {
                namespace_name: "prod".to_string(),
                ..MetadataRecord::default()
            }),
            ..NodeRecord::default()
        }
    }

    #[test]
    fn json_round_trip_is_identity() {
        let record = sample();
        let bytes = record.to_json_bytes().unwrap();
        let decoded = NodeRecord::from_json_bytes(&bytes).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn key_fields_drop_addresses_and_metadata() {
        let keys = sample().key_fields();
        assert_eq!(keys.id, 0x1234);
        assert_eq!(keys.name, "echo-svr-1");
        assert_eq!(keys.hostname, "host-a");
        assert!(keys.listen.is_empty());
        assert!(keys.gateways.is_empty());
        assert!(keys.metadata.is_none());
    }

    #[test]
    fn decoding_rejects_garbage() {
        assert!(NodeRecord::from_json_bytes(b"{not json").is_err());
        assert!(NodeRecord::from_json_bytes(&[0xff, 0xfe]).is_err());
    }
}
