// SPDX-License-Identifier: MIT OR Apache-2.0

//! Wire shapes for key records and membership requests.
//!
//! A key-record publication is named
//! `<prefix>/kr/<epoch>/<low id>/<high id>/<timestamp>` where the ids are
//! the first four bytes of the least and greatest thumbprint covered by the
//! shard. Its content is a TLV sequence: block 36 with the key pair's
//! creation time, block 150 with the group public key and block 130 with the
//! encrypted records, packed as `(thumbprint, sealed secret)` pairs sorted
//! by thumbprint.
//!
//! A membership request is named `<prefix>/mr/<timestamp>` and has no
//! content; the requester is identified by the signature's key locator.
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cert::{THUMBPRINT_SIZE, Thumbprint};
use crate::crypto::sealed_box::SEAL_OVERHEAD;
use crate::crypto::x25519::{PUBLIC_KEY_SIZE, PublicKey, SECRET_KEY_SIZE};
use crate::name::{Component, Name, NameError};
use crate::tlv::{self, TlvError, TlvReader};

/// Creation-time block (uint64 microseconds).
pub const TLV_CREATED_AT: u8 = 36;

/// Group public key block.
pub const TLV_GROUP_KEY: u8 = 150;

/// Encrypted-record vector block.
pub const TLV_KEY_RECORDS: u8 = 130;

/// Length of a sealed group secret.
pub const SEALED_KEY_SIZE: usize = SECRET_KEY_SIZE + SEAL_OVERHEAD;

/// Bytes of a thumbprint used as a shard range bound in key-record names.
pub const RANGE_ID_SIZE: usize = 4;

/// Per-publication overhead reserved next to the records: TLV framing and
/// signature info.
const PUB_OVERHEAD: usize = 96;

/// The group secret, sealed towards one member.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedKeyRecord {
    pub holder: Thumbprint,
    pub sealed: Vec<u8>,
}

/// Decoded content of a key-record publication.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyRecordContent {
    pub created_at: u64,
    pub group_key: PublicKey,
    pub records: Vec<EncryptedKeyRecord>,
}

impl KeyRecordContent {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        tlv::write_number(&mut out, TLV_CREATED_AT, self.created_at);
        tlv::write_block(&mut out, TLV_GROUP_KEY, self.group_key.as_bytes());
        let mut packed = Vec::with_capacity(self.records.len() * (THUMBPRINT_SIZE + SEALED_KEY_SIZE));
        for record in &self.records {
            packed.extend_from_slice(&record.holder);
            packed.extend_from_slice(&record.sealed);
        }
        tlv::write_block(&mut out, TLV_KEY_RECORDS, &packed);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, RecordError> {
        let mut reader = TlvReader::new(buf);
        let created_at = tlv::decode_number(reader.next_block(TLV_CREATED_AT)?)?;
        let key_bytes: [u8; PUBLIC_KEY_SIZE] = reader
            .next_block(TLV_GROUP_KEY)?
            .try_into()
            .map_err(|_| RecordError::Tlv(TlvError::BadLength))?;
        let packed = reader.next_block(TLV_KEY_RECORDS)?;
        if packed.len() % (THUMBPRINT_SIZE + SEALED_KEY_SIZE) != 0 {
            return Err(RecordError::Tlv(TlvError::BadLength));
        }
        let records = packed
            .chunks_exact(THUMBPRINT_SIZE + SEALED_KEY_SIZE)
            .map(|chunk| EncryptedKeyRecord {
                holder: chunk[..THUMBPRINT_SIZE]
                    .try_into()
                    .expect("chunk holds a thumbprint"),
                sealed: chunk[THUMBPRINT_SIZE..].to_vec(),
            })
            .collect();
        Ok(Self {
            created_at,
            group_key: PublicKey::from_bytes(key_bytes),
            records,
        })
    }
}

/// Most encrypted records that fit into one publication of at most
/// `max_pub_size` bytes.
pub fn max_records_per_pub(max_pub_size: usize) -> usize {
    max_pub_size
        .saturating_sub(PUBLIC_KEY_SIZE + 8 + PUB_OVERHEAD)
        .checked_div(THUMBPRINT_SIZE + SEALED_KEY_SIZE)
        .unwrap_or(0)
        .max(1)
}

/// Name for a key-record shard covering thumbprints from `low` to `high`.
pub fn key_record_name(
    kr_prefix: &Name,
    epoch: u32,
    low: &Thumbprint,
    high: &Thumbprint,
    timestamp: u64,
) -> Name {
    kr_prefix
        .join(Component::number(epoch as u64))
        .join(Component::bytes(low[..RANGE_ID_SIZE].to_vec()))
        .join(Component::bytes(high[..RANGE_ID_SIZE].to_vec()))
        .join(Component::timestamp(timestamp))
}

/// Name for a membership request.
pub fn membership_request_name(mr_prefix: &Name, timestamp: u64) -> Name {
    mr_prefix.join(Component::timestamp(timestamp))
}

/// Parsed components of a key-record name.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KeyRecordName {
    pub epoch: u32,
    pub range_low: [u8; RANGE_ID_SIZE],
    pub range_high: [u8; RANGE_ID_SIZE],
    pub timestamp: u64,
}

pub fn parse_key_record_name(
    name: &Name,
    kr_prefix_len: usize,
) -> Result<KeyRecordName, RecordError> {
    let component = |index: usize| {
        name.get(kr_prefix_len + index)
            .ok_or(RecordError::Name(NameError::MissingComponent))
    };
    let epoch = component(0)?.to_number()?;
    let range_low = component(1)?
        .as_bytes()
        .try_into()
        .map_err(|_| RecordError::BadRange)?;
    let range_high = component(2)?
        .as_bytes()
        .try_into()
        .map_err(|_| RecordError::BadRange)?;
    let timestamp = component(3)?.to_number()?;
    Ok(KeyRecordName {
        epoch: epoch.try_into().map_err(|_| RecordError::BadEpoch)?,
        range_low,
        range_high,
        timestamp,
    })
}

#[derive(Debug, Error)]
pub enum RecordError {
    #[error(transparent)]
    Tlv(#[from] TlvError),

    #[error(transparent)]
    Name(#[from] NameError),

    #[error("shard range id has invalid length")]
    BadRange,

    #[error("epoch does not fit a u32")]
    BadEpoch,
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use crate::crypto::x25519::PublicKey;
    use crate::name::Name;

    use super::{
        EncryptedKeyRecord, KeyRecordContent, SEALED_KEY_SIZE, key_record_name,
        max_records_per_pub, parse_key_record_name,
    };

    fn record(fill: u8) -> EncryptedKeyRecord {
        EncryptedKeyRecord {
            holder: [fill; 32],
            sealed: vec![fill ^ 0xff; SEALED_KEY_SIZE],
        }
    }

    #[test]
    fn content_round_trip() {
        let content = KeyRecordContent {
            created_at: 1_700_000_000_000_000,
            group_key: PublicKey::from_bytes([5; 32]),
            records: vec![record(1), record(2), record(3)],
        };
        let decoded = KeyRecordContent::decode(&content.encode()).unwrap();
        assert_eq!(decoded, content);
    }

    #[test]
    fn empty_record_list_round_trip() {
        let content = KeyRecordContent {
            created_at: 7,
            group_key: PublicKey::from_bytes([5; 32]),
            records: vec![],
        };
        assert_eq!(KeyRecordContent::decode(&content.encode()).unwrap(), content);
    }

    #[test]
    fn malformed_content_is_rejected() {
        let content = KeyRecordContent {
            created_at: 7,
            group_key: PublicKey::from_bytes([5; 32]),
            records: vec![record(1)],
        };
        let mut encoded = content.encode();
        encoded.truncate(encoded.len() - 1);
        assert!(KeyRecordContent::decode(&encoded).is_err());
        assert!(KeyRecordContent::decode(&[]).is_err());
    }

    #[rstest]
    #[case(1024, 7)]
    #[case(2048, 17)]
    #[case(136, 1)]
    #[case(0, 1)]
    fn shard_capacity(#[case] max_pub_size: usize, #[case] expected: usize) {
        assert_eq!(max_records_per_pub(max_pub_size), expected);
    }

    #[test]
    fn name_round_trip() {
        let prefix = Name::from_str_parts(&["domain", "keys", "pdus", "kr"]);
        let low = [1; 32];
        let high = [9; 32];
        let name = key_record_name(&prefix, 1, &low, &high, 42);
        let parsed = parse_key_record_name(&name, prefix.len()).unwrap();
        assert_eq!(parsed.epoch, 1);
        assert_eq!(parsed.range_low, [1; 4]);
        assert_eq!(parsed.range_high, [9; 4]);
        assert_eq!(parsed.timestamp, 42);
    }

    #[test]
    fn short_names_are_rejected() {
        let prefix = Name::from_str_parts(&["domain", "keys", "pdus", "kr"]);
        let name = prefix.join(crate::name::Component::number(1));
        assert!(parse_key_record_name(&name, prefix.len()).is_err());
    }
}
