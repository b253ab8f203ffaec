//! Identifier service: monotonic, time-derived envelope and message IDs.
//!
//! An envelope id packs wall-clock milliseconds, the process id, and a
//! sub-millisecond slot counter into a base64-url string. Uniqueness within a
//! process is enforced by refusing to produce two ids in the same 0.5 ms
//! slot; the generator sleeps until the next slot instead.

use std::{
    fmt::{self, Display},
    str::FromStr,
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use serde::{Deserialize, Serialize, de};
use thiserror::Error;

/// Width of one generation slot.
const SLOT_MICROS: u64 = 500;

/// Encoded payload: millis (8) + pid (4) + slot-in-millisecond (2).
const ENVELOPE_ID_BYTES: usize = 14;
/// base64-url, no padding: ceil(14 * 8 / 6).
const ENVELOPE_ID_LEN: usize = 19;
/// base64-url of the 4-byte message counter.
const COUNTER_LEN: usize = 6;
/// `<envelope>-<counter>`.
const MESSAGE_ID_LEN: usize = ENVELOPE_ID_LEN + 1 + COUNTER_LEN;

#[derive(Debug, Error)]
pub enum IdError {
    #[error("Malformed identifier: {0:?}")]
    Malformed(String),
}

/// Unique identifier of an accepted envelope.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EnvelopeId(String);

impl EnvelopeId {
    fn from_parts(millis: u64, pid: u32, slot: u16) -> Self {
        let mut bytes = [0_u8; ENVELOPE_ID_BYTES];
        bytes[..8].copy_from_slice(&millis.to_be_bytes());
        bytes[8..12].copy_from_slice(&pid.to_be_bytes());
        bytes[12..].copy_from_slice(&slot.to_be_bytes());
        Self(URL_SAFE_NO_PAD.encode(bytes))
    }

    /// # Errors
    /// If the input does not decode to an envelope id payload.
    pub fn parse(input: &str) -> Result<Self, IdError> {
        let (millis, pid, slot) = decode_envelope(input)?;
        Ok(Self::from_parts(millis, pid, slot))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Milliseconds since the Unix epoch at which this id was generated.
    ///
    /// # Panics
    /// Never: the payload is validated at construction.
    pub fn timestamp_ms(&self) -> u64 {
        decode_envelope(&self.0).expect("validated at construction").0
    }
}

fn decode_envelope(input: &str) -> Result<(u64, u32, u16), IdError> {
    let malformed = || IdError::Malformed(input.to_string());

    if input.len() != ENVELOPE_ID_LEN {
        return Err(malformed());
    }
    let bytes = URL_SAFE_NO_PAD.decode(input).map_err(|_| malformed())?;
    let raw: [u8; ENVELOPE_ID_BYTES] = bytes.try_into().map_err(|_| malformed())?;

    let millis = u64::from_be_bytes(raw[..8].try_into().expect("fixed slice"));
    let pid = u32::from_be_bytes(raw[8..12].try_into().expect("fixed slice"));
    let slot = u16::from_be_bytes(raw[12..].try_into().expect("fixed slice"));
    Ok((millis, pid, slot))
}

impl Display for EnvelopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unique identifier of a spooled message: `<envelope_id>-<counter>`.
///
/// One accepted envelope yields one message per distinct next-hop group, so
/// the process-local counter disambiguates siblings.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MessageId(String);

impl MessageId {
    fn new(envelope: &EnvelopeId, counter: u32) -> Self {
        Self(format!(
            "{envelope}-{}",
            URL_SAFE_NO_PAD.encode(counter.to_be_bytes())
        ))
    }

    /// # Errors
    /// If the input is not `<envelope>-<counter>` with valid payloads.
    pub fn parse(input: &str) -> Result<Self, IdError> {
        let malformed = || IdError::Malformed(input.to_string());

        if input.len() != MESSAGE_ID_LEN
            || !input.is_ascii()
            || input.as_bytes()[ENVELOPE_ID_LEN] != b'-'
        {
            return Err(malformed());
        }
        decode_envelope(&input[..ENVELOPE_ID_LEN])?;

        let counter = URL_SAFE_NO_PAD
            .decode(&input[ENVELOPE_ID_LEN + 1..])
            .map_err(|_| malformed())?;
        let _: [u8; 4] = counter.try_into().map_err(|_| malformed())?;

        Ok(Self(input.to_string()))
    }

    /// Parse a message id from a spool filename like `<id>` or `<id>.body`.
    ///
    /// Rejects path separators and traversal patterns so a hostile filename
    /// can never escape the queue directory.
    pub fn from_filename(filename: &str) -> Option<Self> {
        if filename.contains('/') || filename.contains('\\') || filename.contains("..") {
            return None;
        }
        let stem = filename.strip_suffix(".body").unwrap_or(filename);
        Self::parse(stem).ok()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The id of the envelope this message was spooled from.
    ///
    /// # Panics
    /// Never: the layout is validated at construction.
    pub fn envelope_id(&self) -> EnvelopeId {
        EnvelopeId::parse(&self.0[..ENVELOPE_ID_LEN]).expect("validated at construction")
    }

    /// Orders messages by generation time: oldest first, siblings by counter.
    ///
    /// # Panics
    /// Never: the layout is validated at construction.
    pub fn sort_key(&self) -> (u64, u32, u16, u32) {
        let (millis, pid, slot) =
            decode_envelope(&self.0[..ENVELOPE_ID_LEN]).expect("validated at construction");
        let counter = URL_SAFE_NO_PAD
            .decode(&self.0[ENVELOPE_ID_LEN + 1..])
            .expect("validated at construction");
        let counter = u32::from_be_bytes(counter.try_into().expect("validated at construction"));
        (millis, pid, slot, counter)
    }
}

impl Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for MessageId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for MessageId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for MessageId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(de::Error::custom)
    }
}

impl Serialize for EnvelopeId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for EnvelopeId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(de::Error::custom)
    }
}

/// Generator handed to the spool at construction; never a global.
#[derive(Clone, Debug)]
pub struct IdSource {
    last_slot: Arc<tokio::sync::Mutex<u64>>,
    counter: Arc<AtomicU32>,
    pid: u32,
}

impl Default for IdSource {
    fn default() -> Self {
        Self::new()
    }
}

impl IdSource {
    pub fn new() -> Self {
        Self {
            last_slot: Arc::new(tokio::sync::Mutex::new(0)),
            counter: Arc::new(AtomicU32::new(0)),
            pid: std::process::id(),
        }
    }

    /// Produce a fresh envelope id, waiting out the current slot if it
    /// already produced one.
    pub async fn next_envelope_id(&self) -> EnvelopeId {
        loop {
            let micros = unix_micros();
            let slot = micros / SLOT_MICROS;
            {
                let mut last = self.last_slot.lock().await;
                if slot > *last {
                    *last = slot;
                    let in_millisecond = u16::try_from((micros % 1_000) / SLOT_MICROS)
                        .expect("slot index is 0 or 1");
                    return EnvelopeId::from_parts(micros / 1_000, self.pid, in_millisecond);
                }
            }
            tokio::time::sleep(Duration::from_micros(SLOT_MICROS - (micros % SLOT_MICROS))).await;
        }
    }

    /// Derive the next message id under an envelope.
    pub fn next_message_id(&self, envelope: &EnvelopeId) -> MessageId {
        MessageId::new(envelope, self.counter.fetch_add(1, Ordering::Relaxed))
    }
}

fn unix_micros() -> u64 {
    u64::try_from(
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_micros(),
    )
    .unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn envelope_ids_are_unique_and_time_ordered() {
        let ids = IdSource::new();

        let a = ids.next_envelope_id().await;
        let b = ids.next_envelope_id().await;
        let c = ids.next_envelope_id().await;

        assert_ne!(a, b);
        assert_ne!(b, c);
        assert!(a.timestamp_ms() <= b.timestamp_ms());
        assert!(b.timestamp_ms() <= c.timestamp_ms());
    }

    #[tokio::test]
    async fn envelope_id_round_trips() {
        let ids = IdSource::new();
        let id = ids.next_envelope_id().await;

        let parsed = EnvelopeId::parse(id.as_str()).unwrap();
        assert_eq!(parsed, id);
        assert!(EnvelopeId::parse("not base64!").is_err());
        assert!(EnvelopeId::parse("").is_err());
    }

    #[tokio::test]
    async fn message_ids_count_up_under_one_envelope() {
        let ids = IdSource::new();
        let envelope = ids.next_envelope_id().await;

        let first = ids.next_message_id(&envelope);
        let second = ids.next_message_id(&envelope);

        assert_ne!(first, second);
        assert_eq!(first.envelope_id(), envelope);
        assert_eq!(second.envelope_id(), envelope);
        assert!(first.sort_key() < second.sort_key());

        let parsed = MessageId::parse(first.as_str()).unwrap();
        assert_eq!(parsed, first);
    }

    #[tokio::test]
    async fn filename_parsing_rejects_traversal() {
        let ids = IdSource::new();
        let envelope = ids.next_envelope_id().await;
        let id = ids.next_message_id(&envelope);

        assert_eq!(
            MessageId::from_filename(&format!("{id}.body")),
            Some(id.clone())
        );
        assert_eq!(MessageId::from_filename(id.as_str()), Some(id.clone()));

        assert!(MessageId::from_filename("../etc/passwd").is_none());
        assert!(MessageId::from_filename("a/b").is_none());
        assert!(MessageId::from_filename("a\\b").is_none());
        assert!(MessageId::from_filename("short").is_none());
    }

    #[test]
    fn sub_millisecond_slots_never_collide() {
        // Two ids from the same millisecond but different slots differ.
        let a = EnvelopeId::from_parts(1_700_000_000_000, 42, 0);
        let b = EnvelopeId::from_parts(1_700_000_000_000, 42, 1);
        assert_ne!(a, b);
        assert_eq!(a.timestamp_ms(), b.timestamp_ms());
    }
}
