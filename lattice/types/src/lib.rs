// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

mod address;
mod hashing;
mod message;
mod metadata;
mod node_record;

pub use address::{AddressParseError, AddressScope, BusAddress};
pub use hashing::{
    hash128, hash_combine_bytes, hash_combine_u64, Hash128, HASH_MAGIC_SEED,
};
pub use message::{MessageEnvelope, MessageSenderInfo};
pub use metadata::MetadataRecord;
pub use node_record::{GatewayRecord, NodeRecord, NodeRecordCodecError};
