//! Session serialization strategies.
//!
//! A strategy turns a session into an opaque payload and back, and computes
//! a fingerprint over the attribute set used for change detection. The
//! strategy is picked once at startup from [`SerializerKind`].

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::SessionError;

use super::model::Session;

/// Fingerprint of the attribute set at the last successful load or persist.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SerializationMetadata {
    pub attributes_hash: Vec<u8>,
}

impl SerializationMetadata {
    pub fn new(attributes_hash: Vec<u8>) -> Self {
        Self { attributes_hash }
    }

    /// Hex form for logging.
    pub fn hash_hex(&self) -> String {
        hex::encode(&self.attributes_hash)
    }
}

/// Encodes sessions to and from the bytes stored in the cluster.
pub trait SessionSerializer: Send + Sync {
    fn name(&self) -> &'static str;

    /// Content hash over the session's attributes.
    fn fingerprint(&self, session: &Session) -> Result<Vec<u8>, SessionError>;

    fn serialize(
        &self,
        session: &Session,
        metadata: &SerializationMetadata,
    ) -> Result<Vec<u8>, SessionError>;

    /// Populate an empty `session` and `metadata` from `data`.
    fn deserialize_into(
        &self,
        data: &[u8],
        session: &mut Session,
        metadata: &mut SerializationMetadata,
    ) -> Result<(), SessionError>;
}

/// Closed set of available strategies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerializerKind {
    #[default]
    Json,
    Bincode,
}

impl SerializerKind {
    pub fn build(self) -> Arc<dyn SessionSerializer> {
        match self {
            SerializerKind::Json => Arc::new(JsonSerializer),
            SerializerKind::Bincode => Arc::new(BincodeSerializer),
        }
    }
}

fn sha256(bytes: &[u8]) -> Vec<u8> {
    Sha256::digest(bytes).to_vec()
}

fn serialization_error(err: impl std::fmt::Display) -> SessionError {
    SessionError::Serialization(err.to_string())
}

/// Session fields shared by every strategy.
#[derive(Debug, Serialize, Deserialize)]
struct SessionHeader {
    creation_time: i64,
    last_accessed_time: i64,
    this_accessed_time: i64,
    max_inactive_interval: i64,
    is_new: bool,
    valid: bool,
}

impl SessionHeader {
    fn of(session: &Session) -> Self {
        Self {
            creation_time: session.creation_time,
            last_accessed_time: session.last_accessed_time,
            this_accessed_time: session.this_accessed_time,
            max_inactive_interval: session.max_inactive_interval,
            is_new: session.is_new(),
            valid: session.is_valid(),
        }
    }

    fn apply(self, session: &mut Session) {
        session.creation_time = self.creation_time;
        session.last_accessed_time = self.last_accessed_time;
        session.this_accessed_time = self.this_accessed_time;
        session.max_inactive_interval = self.max_inactive_interval;
        session.set_new(self.is_new);
        session.set_valid(self.valid);
    }
}

// ============================================================================
// JSON
// ============================================================================

#[derive(Serialize, Deserialize)]
struct JsonRecord {
    #[serde(with = "hex_bytes")]
    attributes_hash: Vec<u8>,
    #[serde(flatten)]
    header: SessionHeader,
    attributes: BTreeMap<String, serde_json::Value>,
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

/// Human-readable JSON documents.
pub struct JsonSerializer;

impl SessionSerializer for JsonSerializer {
    fn name(&self) -> &'static str {
        "json"
    }

    fn fingerprint(&self, session: &Session) -> Result<Vec<u8>, SessionError> {
        let encoded = serde_json::to_vec(session.attributes()).map_err(serialization_error)?;
        Ok(sha256(&encoded))
    }

    fn serialize(
        &self,
        session: &Session,
        metadata: &SerializationMetadata,
    ) -> Result<Vec<u8>, SessionError> {
        let record = JsonRecord {
            attributes_hash: metadata.attributes_hash.clone(),
            header: SessionHeader::of(session),
            attributes: session.attributes().clone(),
        };
        serde_json::to_vec(&record).map_err(serialization_error)
    }

    fn deserialize_into(
        &self,
        data: &[u8],
        session: &mut Session,
        metadata: &mut SerializationMetadata,
    ) -> Result<(), SessionError> {
        let record: JsonRecord = serde_json::from_slice(data).map_err(serialization_error)?;
        record.header.apply(session);
        session.attributes = record.attributes;
        metadata.attributes_hash = record.attributes_hash;
        Ok(())
    }
}

// ============================================================================
// Bincode
// ============================================================================

/// Attribute values are carried as JSON text: bincode is not self-describing
/// and cannot decode a `serde_json::Value` directly.
#[derive(Serialize, Deserialize)]
struct BincodeRecord {
    attributes_hash: Vec<u8>,
    header: SessionHeader,
    attributes: Vec<(String, String)>,
}

fn encode_attributes(session: &Session) -> Result<Vec<(String, String)>, SessionError> {
    session
        .attributes()
        .iter()
        .map(|(name, value)| {
            serde_json::to_string(value)
                .map(|encoded| (name.clone(), encoded))
                .map_err(serialization_error)
        })
        .collect()
}

/// Compact binary records.
pub struct BincodeSerializer;

impl SessionSerializer for BincodeSerializer {
    fn name(&self) -> &'static str {
        "bincode"
    }

    fn fingerprint(&self, session: &Session) -> Result<Vec<u8>, SessionError> {
        let encoded =
            bincode::serialize(&encode_attributes(session)?).map_err(serialization_error)?;
        Ok(sha256(&encoded))
    }

    fn serialize(
        &self,
        session: &Session,
        metadata: &SerializationMetadata,
    ) -> Result<Vec<u8>, SessionError> {
        let record = BincodeRecord {
            attributes_hash: metadata.attributes_hash.clone(),
            header: SessionHeader::of(session),
            attributes: encode_attributes(session)?,
        };
        bincode::serialize(&record).map_err(serialization_error)
    }

    fn deserialize_into(
        &self,
        data: &[u8],
        session: &mut Session,
        metadata: &mut SerializationMetadata,
    ) -> Result<(), SessionError> {
        let record: BincodeRecord = bincode::deserialize(data).map_err(serialization_error)?;
        let mut attributes = BTreeMap::new();
        for (name, encoded) in record.attributes {
            let value = serde_json::from_str(&encoded).map_err(serialization_error)?;
            attributes.insert(name, value);
        }

        record.header.apply(session);
        session.attributes = attributes;
        metadata.attributes_hash = record.attributes_hash;
        Ok(())
    }
}

// ============================================================================
// Stored payload envelope
// ============================================================================

const TAG_RESERVATION: u8 = 0x00;
const TAG_SESSION: u8 = 0x01;

/// What a session key holds in the cluster.
///
/// An id is claimed with a `Reservation` before any session content exists;
/// only `Session` payloads are ever handed to a serializer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoredPayload {
    Reservation,
    Session(Vec<u8>),
}

impl StoredPayload {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            StoredPayload::Reservation => vec![TAG_RESERVATION],
            StoredPayload::Session(bytes) => {
                let mut out = Vec::with_capacity(bytes.len() + 1);
                out.push(TAG_SESSION);
                out.extend_from_slice(bytes);
                out
            }
        }
    }

    pub fn decode(data: &[u8]) -> Result<Self, String> {
        match data.split_first() {
            Some((&TAG_RESERVATION, [])) => Ok(StoredPayload::Reservation),
            Some((&TAG_RESERVATION, _)) => Err("reservation with trailing bytes".to_string()),
            Some((&TAG_SESSION, rest)) => Ok(StoredPayload::Session(rest.to_vec())),
            Some((tag, _)) => Err(format!("unknown payload tag 0x{:02x}", tag)),
            None => Err("empty payload".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_session() -> Session {
        let mut session = Session::new("abc", 1800);
        session.set_attribute("user", "alice").unwrap();
        session.set_attribute("cart", json!({"items": [1, 2, 3]})).unwrap();
        session
    }

    fn check_round_trip(serializer: &dyn SessionSerializer) {
        let session = sample_session();
        let metadata = SerializationMetadata::new(serializer.fingerprint(&session).unwrap());
        let bytes = serializer.serialize(&session, &metadata).unwrap();

        let mut loaded = Session::empty("abc");
        let mut loaded_metadata = SerializationMetadata::default();
        serializer
            .deserialize_into(&bytes, &mut loaded, &mut loaded_metadata)
            .unwrap();

        assert_eq!(loaded.attributes(), session.attributes());
        assert_eq!(loaded.creation_time(), session.creation_time());
        assert_eq!(loaded.max_inactive_interval(), 1800);
        assert!(loaded.is_valid());
        assert_eq!(loaded_metadata, metadata);
    }

    #[test]
    fn test_json_round_trip() {
        check_round_trip(&JsonSerializer);
    }

    #[test]
    fn test_bincode_round_trip() {
        check_round_trip(&BincodeSerializer);
    }

    #[test]
    fn test_fingerprint_tracks_attribute_content() {
        for serializer in [SerializerKind::Json.build(), SerializerKind::Bincode.build()] {
            let mut session = sample_session();
            let before = serializer.fingerprint(&session).unwrap();

            session.access();
            assert_eq!(serializer.fingerprint(&session).unwrap(), before);

            session.set_attribute("user", "bob").unwrap();
            assert_ne!(serializer.fingerprint(&session).unwrap(), before);
        }
    }

    #[test]
    fn test_garbage_is_rejected() {
        let mut session = Session::empty("abc");
        let mut metadata = SerializationMetadata::default();
        let err = JsonSerializer
            .deserialize_into(b"not json", &mut session, &mut metadata)
            .unwrap_err();
        assert!(matches!(err, SessionError::Serialization(_)));

        assert!(BincodeSerializer
            .deserialize_into(&[0xff, 0x01], &mut session, &mut metadata)
            .is_err());
    }

    #[test]
    fn test_serializer_kind_from_config() {
        let kind: SerializerKind = serde_json::from_str("\"bincode\"").unwrap();
        assert_eq!(kind, SerializerKind::Bincode);
        assert_eq!(kind.build().name(), "bincode");
        assert_eq!(SerializerKind::default().build().name(), "json");
    }

    #[test]
    fn test_stored_payload_tags() {
        assert_eq!(
            StoredPayload::decode(&StoredPayload::Reservation.encode()),
            Ok(StoredPayload::Reservation)
        );

        let payload = StoredPayload::Session(b"{}".to_vec());
        assert_eq!(StoredPayload::decode(&payload.encode()), Ok(payload));

        assert!(StoredPayload::decode(&[]).is_err());
        assert!(StoredPayload::decode(&[0x07, 1]).is_err());
        assert!(StoredPayload::decode(&[TAG_RESERVATION, 1]).is_err());
    }
}
