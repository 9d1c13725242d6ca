// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::hashing::{hash_combine_bytes, Hash128, HASH_MAGIC_SEED};

/// Placement metadata attached to a discovery node, and doubling as the rule
/// type for filtered lookups. Label/annotation maps are ordered so comparing
/// two records compares them under sorted keys.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataRecord {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub api_version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub group: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub service_subset: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl MetadataRecord {
    /// Whether this record, used as a rule, accepts `metadata`. Empty scalar
    /// fields and empty-valued labels/annotations act as wildcards; everything
    /// else must be present in `metadata` with the same value.
    pub fn matches(rule: &MetadataRecord, metadata: &MetadataRecord) -> bool {
        if !rule.namespace_name.is_empty() && rule.namespace_name != metadata.namespace_name {
            return false;
        }
        if !rule.api_version.is_empty() && rule.api_version != metadata.api_version {
            return false;
        }
        if !rule.kind.is_empty() && rule.kind != metadata.kind {
            return false;
        }
        if !rule.group.is_empty() && rule.group != metadata.group {
            return false;
        }
        if !rule.service_subset.is_empty() && rule.service_subset != metadata.service_subset {
            return false;
        }

        for (key, value) in &rule.labels {
            if value.is_empty() {
                continue;
            }
            if metadata.labels.get(key) != Some(value) {
                return false;
            }
        }

        for (key, value) in &rule.annotations {
            if value.is_empty() {
                continue;
            }
            if metadata.annotations.get(key) != Some(value) {
                return false;
            }
        }

        true
    }

    /// Folds the scalar fields, then label values in key order, then
    /// annotation values in key order. Empty scalars are skipped so a record
    /// hashes the same whether a field is absent or empty.
    pub fn fold_hash(&self) -> Hash128 {
        let mut acc = Hash128 {
            h1: u64::from(HASH_MAGIC_SEED),
            h2: 0,
        };

        for scalar in [
            &self.namespace_name,
            &self.api_version,
            &self.kind,
            &self.group,
            &self.service_subset,
        ] {
            if !scalar.is_empty() {
                hash_combine_bytes(&mut acc, scalar.as_bytes());
            }
        }

        for value in self.labels.values() {
            hash_combine_bytes(&mut acc, value.as_bytes());
        }
        for value in self.annotations.values() {
            hash_combine_bytes(&mut acc, value.as_bytes());
        }

        acc
    }
}

impl Hash for MetadataRecord {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.fold_hash().h1);
    }
}
