//! Journal record codec.
//!
//! Every journal payload is one [`Record`] in tagged form:
//!
//! ```text
//! ┌──────────┬──────────────────────────────────────────┐
//! │ Tag (1)  │ Payload (MessagePack, named fields)      │
//! └──────────┴──────────────────────────────────────────┘
//! ```
//!
//! Control markers (unit-of-work boundaries and flush) are the tag byte
//! alone. Data payloads are self-describing so optional fields can be added
//! later without breaking older journals.

use brokerstore_core::{
    MessageRecord, QueueDescriptor, QueueRecord, StoreError, SubscriptionRecord,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use thiserror::Error;

// ============================================================================
// Tags
// ============================================================================

const TAG_MESSAGE_ADD: u8 = 1;
const TAG_QUEUE_ADD: u8 = 2;
const TAG_QUEUE_REMOVE: u8 = 3;
const TAG_QUEUE_ADD_MESSAGE: u8 = 4;
const TAG_QUEUE_REMOVE_MESSAGE: u8 = 5;
const TAG_SUBSCRIPTION_ADD: u8 = 6;
const TAG_SUBSCRIPTION_REMOVE: u8 = 7;
const TAG_MAP_ADD: u8 = 8;
const TAG_MAP_REMOVE: u8 = 9;
const TAG_MAP_ENTRY_PUT: u8 = 10;
const TAG_MAP_ENTRY_REMOVE: u8 = 11;
const TAG_TRACE: u8 = 12;

const TAG_BEGIN_UNIT_OF_WORK: u8 = 0xFF;
const TAG_END_UNIT_OF_WORK: u8 = 0xFE;
const TAG_FLUSH: u8 = 0xFD;
const TAG_CANCEL_UNIT_OF_WORK: u8 = 0xFC;

/// Discriminator of a [`Record`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    /// Message content
    MessageAdd,
    /// New queue
    QueueAdd,
    /// Queue removal
    QueueRemove,
    /// Message enqueued
    QueueAddMessage,
    /// Message dequeued
    QueueRemoveMessage,
    /// Subscription added or updated
    SubscriptionAdd,
    /// Subscription removed
    SubscriptionRemove,
    /// New map
    MapAdd,
    /// Map removal
    MapRemove,
    /// Map entry put
    MapEntryPut,
    /// Map entry removal
    MapEntryRemove,
    /// Free-form diagnostic text
    Trace,
    /// Start of a unit of work
    BeginUnitOfWork,
    /// Successful end of a unit of work
    EndUnitOfWork,
    /// Abandoned unit of work
    CancelUnitOfWork,
    /// Durability barrier
    Flush,
}

impl RecordKind {
    /// Map a tag byte to its kind.
    pub fn from_tag(tag: u8) -> Option<RecordKind> {
        let kind = match tag {
            TAG_MESSAGE_ADD => RecordKind::MessageAdd,
            TAG_QUEUE_ADD => RecordKind::QueueAdd,
            TAG_QUEUE_REMOVE => RecordKind::QueueRemove,
            TAG_QUEUE_ADD_MESSAGE => RecordKind::QueueAddMessage,
            TAG_QUEUE_REMOVE_MESSAGE => RecordKind::QueueRemoveMessage,
            TAG_SUBSCRIPTION_ADD => RecordKind::SubscriptionAdd,
            TAG_SUBSCRIPTION_REMOVE => RecordKind::SubscriptionRemove,
            TAG_MAP_ADD => RecordKind::MapAdd,
            TAG_MAP_REMOVE => RecordKind::MapRemove,
            TAG_MAP_ENTRY_PUT => RecordKind::MapEntryPut,
            TAG_MAP_ENTRY_REMOVE => RecordKind::MapEntryRemove,
            TAG_TRACE => RecordKind::Trace,
            TAG_BEGIN_UNIT_OF_WORK => RecordKind::BeginUnitOfWork,
            TAG_END_UNIT_OF_WORK => RecordKind::EndUnitOfWork,
            TAG_CANCEL_UNIT_OF_WORK => RecordKind::CancelUnitOfWork,
            TAG_FLUSH => RecordKind::Flush,
            _ => return None,
        };
        Some(kind)
    }

    /// Tag byte written for this kind.
    pub fn tag(self) -> u8 {
        match self {
            RecordKind::MessageAdd => TAG_MESSAGE_ADD,
            RecordKind::QueueAdd => TAG_QUEUE_ADD,
            RecordKind::QueueRemove => TAG_QUEUE_REMOVE,
            RecordKind::QueueAddMessage => TAG_QUEUE_ADD_MESSAGE,
            RecordKind::QueueRemoveMessage => TAG_QUEUE_REMOVE_MESSAGE,
            RecordKind::SubscriptionAdd => TAG_SUBSCRIPTION_ADD,
            RecordKind::SubscriptionRemove => TAG_SUBSCRIPTION_REMOVE,
            RecordKind::MapAdd => TAG_MAP_ADD,
            RecordKind::MapRemove => TAG_MAP_REMOVE,
            RecordKind::MapEntryPut => TAG_MAP_ENTRY_PUT,
            RecordKind::MapEntryRemove => TAG_MAP_ENTRY_REMOVE,
            RecordKind::Trace => TAG_TRACE,
            RecordKind::BeginUnitOfWork => TAG_BEGIN_UNIT_OF_WORK,
            RecordKind::EndUnitOfWork => TAG_END_UNIT_OF_WORK,
            RecordKind::CancelUnitOfWork => TAG_CANCEL_UNIT_OF_WORK,
            RecordKind::Flush => TAG_FLUSH,
        }
    }

    /// Control markers carry no payload and are never applied to the index.
    pub fn is_control(self) -> bool {
        matches!(
            self,
            RecordKind::BeginUnitOfWork
                | RecordKind::EndUnitOfWork
                | RecordKind::CancelUnitOfWork
                | RecordKind::Flush
        )
    }
}

// ============================================================================
// Payloads
// ============================================================================

/// Payload of [`Record::QueueRemove`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueRemove {
    /// Queue to drop
    pub queue_name: String,
}

/// Payload of [`Record::QueueAddMessage`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueAddMessage {
    /// Target queue
    pub queue_name: String,
    /// Entry to insert
    pub record: QueueRecord,
}

/// Payload of [`Record::QueueRemoveMessage`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueRemoveMessage {
    /// Source queue
    pub queue_name: String,
    /// Message whose entry is removed
    pub message_key: i64,
}

/// Payload of [`Record::SubscriptionRemove`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionRemove {
    /// Subscription name
    pub name: String,
}

/// Payload of [`Record::MapAdd`] and [`Record::MapRemove`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapName {
    /// Map name
    pub map_name: String,
}

/// Payload of [`Record::MapEntryPut`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapEntryPut {
    /// Map name
    pub map_name: String,
    /// Entry key
    pub key: String,
    /// Entry value
    pub value: Vec<u8>,
}

/// Payload of [`Record::MapEntryRemove`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapEntryRemove {
    /// Map name
    pub map_name: String,
    /// Entry key
    pub key: String,
}

/// Payload of [`Record::Trace`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trace {
    /// Diagnostic text
    pub message: String,
}

// ============================================================================
// Record
// ============================================================================

/// One logical journal record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    /// Message content; the index keeps only its location
    MessageAdd(MessageRecord),
    /// Create a queue
    QueueAdd(QueueDescriptor),
    /// Drop a queue and its entries
    QueueRemove(QueueRemove),
    /// Enqueue a message reference
    QueueAddMessage(QueueAddMessage),
    /// Dequeue a message reference
    QueueRemoveMessage(QueueRemoveMessage),
    /// Add or replace a subscription
    SubscriptionAdd(SubscriptionRecord),
    /// Remove a subscription
    SubscriptionRemove(SubscriptionRemove),
    /// Create a map
    MapAdd(MapName),
    /// Drop a map
    MapRemove(MapName),
    /// Put a map entry
    MapEntryPut(MapEntryPut),
    /// Remove a map entry
    MapEntryRemove(MapEntryRemove),
    /// Diagnostic text, ignored by the index
    Trace(Trace),
    /// Start of a unit of work
    BeginUnitOfWork,
    /// End of a unit of work
    EndUnitOfWork,
    /// Cancellation of a unit of work
    CancelUnitOfWork,
    /// Durability barrier
    Flush,
}

/// Errors from encoding or decoding records.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Zero-length buffer
    #[error("Empty record")]
    Empty,

    /// Tag byte not assigned to any kind
    #[error("Unknown record type: {0:#04x}")]
    UnknownTag(u8),

    /// Payload did not decode for its kind
    #[error("Malformed {kind:?} payload: {reason}")]
    Payload {
        /// Kind named by the tag
        kind: RecordKind,
        /// Decoder message
        reason: String,
    },

    /// Bytes left over after the payload
    #[error("{extra} trailing bytes after {kind:?} record")]
    TrailingBytes {
        /// Kind named by the tag
        kind: RecordKind,
        /// Number of unexpected bytes
        extra: usize,
    },

    /// Payload could not be serialized
    #[error("Failed to encode {kind:?} record: {reason}")]
    Encode {
        /// Kind being encoded
        kind: RecordKind,
        /// Encoder message
        reason: String,
    },
}

impl From<CodecError> for StoreError {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::UnknownTag(tag) => StoreError::UnknownRecordType(tag),
            CodecError::Encode { .. } => StoreError::Fatal(e.to_string()),
            other => StoreError::CorruptRecord {
                location: None,
                reason: other.to_string(),
            },
        }
    }
}

impl Record {
    /// Kind of this record.
    pub fn kind(&self) -> RecordKind {
        match self {
            Record::MessageAdd(_) => RecordKind::MessageAdd,
            Record::QueueAdd(_) => RecordKind::QueueAdd,
            Record::QueueRemove(_) => RecordKind::QueueRemove,
            Record::QueueAddMessage(_) => RecordKind::QueueAddMessage,
            Record::QueueRemoveMessage(_) => RecordKind::QueueRemoveMessage,
            Record::SubscriptionAdd(_) => RecordKind::SubscriptionAdd,
            Record::SubscriptionRemove(_) => RecordKind::SubscriptionRemove,
            Record::MapAdd(_) => RecordKind::MapAdd,
            Record::MapRemove(_) => RecordKind::MapRemove,
            Record::MapEntryPut(_) => RecordKind::MapEntryPut,
            Record::MapEntryRemove(_) => RecordKind::MapEntryRemove,
            Record::Trace(_) => RecordKind::Trace,
            Record::BeginUnitOfWork => RecordKind::BeginUnitOfWork,
            Record::EndUnitOfWork => RecordKind::EndUnitOfWork,
            Record::CancelUnitOfWork => RecordKind::CancelUnitOfWork,
            Record::Flush => RecordKind::Flush,
        }
    }

    /// Tag byte of this record.
    pub fn tag(&self) -> u8 {
        self.kind().tag()
    }

    /// True for unit-of-work markers and flush.
    pub fn is_control(&self) -> bool {
        self.kind().is_control()
    }

    /// Encode to `[tag][payload]`.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let kind = self.kind();
        let mut buf = vec![kind.tag()];
        match self {
            Record::MessageAdd(p) => write_payload(kind, &mut buf, p)?,
            Record::QueueAdd(p) => write_payload(kind, &mut buf, p)?,
            Record::QueueRemove(p) => write_payload(kind, &mut buf, p)?,
            Record::QueueAddMessage(p) => write_payload(kind, &mut buf, p)?,
            Record::QueueRemoveMessage(p) => write_payload(kind, &mut buf, p)?,
            Record::SubscriptionAdd(p) => write_payload(kind, &mut buf, p)?,
            Record::SubscriptionRemove(p) => write_payload(kind, &mut buf, p)?,
            Record::MapAdd(p) | Record::MapRemove(p) => write_payload(kind, &mut buf, p)?,
            Record::MapEntryPut(p) => write_payload(kind, &mut buf, p)?,
            Record::MapEntryRemove(p) => write_payload(kind, &mut buf, p)?,
            Record::Trace(p) => write_payload(kind, &mut buf, p)?,
            Record::BeginUnitOfWork
            | Record::EndUnitOfWork
            | Record::CancelUnitOfWork
            | Record::Flush => {}
        }
        Ok(buf)
    }

    /// Decode a record previously produced by [`Record::encode`].
    pub fn decode(bytes: &[u8]) -> Result<Record, CodecError> {
        let (&tag, payload) = bytes.split_first().ok_or(CodecError::Empty)?;
        let kind = RecordKind::from_tag(tag).ok_or(CodecError::UnknownTag(tag))?;

        if kind.is_control() && !payload.is_empty() {
            return Err(CodecError::TrailingBytes {
                kind,
                extra: payload.len(),
            });
        }

        let record = match kind {
            RecordKind::MessageAdd => Record::MessageAdd(read_payload(kind, payload)?),
            RecordKind::QueueAdd => Record::QueueAdd(read_payload(kind, payload)?),
            RecordKind::QueueRemove => Record::QueueRemove(read_payload(kind, payload)?),
            RecordKind::QueueAddMessage => Record::QueueAddMessage(read_payload(kind, payload)?),
            RecordKind::QueueRemoveMessage => {
                Record::QueueRemoveMessage(read_payload(kind, payload)?)
            }
            RecordKind::SubscriptionAdd => Record::SubscriptionAdd(read_payload(kind, payload)?),
            RecordKind::SubscriptionRemove => {
                Record::SubscriptionRemove(read_payload(kind, payload)?)
            }
            RecordKind::MapAdd => Record::MapAdd(read_payload(kind, payload)?),
            RecordKind::MapRemove => Record::MapRemove(read_payload(kind, payload)?),
            RecordKind::MapEntryPut => Record::MapEntryPut(read_payload(kind, payload)?),
            RecordKind::MapEntryRemove => Record::MapEntryRemove(read_payload(kind, payload)?),
            RecordKind::Trace => Record::Trace(read_payload(kind, payload)?),
            RecordKind::BeginUnitOfWork => Record::BeginUnitOfWork,
            RecordKind::EndUnitOfWork => Record::EndUnitOfWork,
            RecordKind::CancelUnitOfWork => Record::CancelUnitOfWork,
            RecordKind::Flush => Record::Flush,
        };
        Ok(record)
    }

    /// Convenience constructor for a trace record.
    pub fn trace(message: impl Into<String>) -> Record {
        Record::Trace(Trace {
            message: message.into(),
        })
    }
}

fn write_payload<T: Serialize>(
    kind: RecordKind,
    buf: &mut Vec<u8>,
    payload: &T,
) -> Result<(), CodecError> {
    rmp_serde::encode::write_named(buf, payload).map_err(|e| CodecError::Encode {
        kind,
        reason: e.to_string(),
    })
}

fn read_payload<T: DeserializeOwned>(kind: RecordKind, payload: &[u8]) -> Result<T, CodecError> {
    let mut cursor = Cursor::new(payload);
    let value = rmp_serde::decode::from_read(&mut cursor).map_err(|e| CodecError::Payload {
        kind,
        reason: e.to_string(),
    })?;
    let consumed = cursor.position() as usize;
    if consumed != payload.len() {
        return Err(CodecError::TrailingBytes {
            kind,
            extra: payload.len() - consumed,
        });
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_markers_are_single_bytes() {
        assert_eq!(Record::BeginUnitOfWork.encode().unwrap(), vec![0xFF]);
        assert_eq!(Record::EndUnitOfWork.encode().unwrap(), vec![0xFE]);
        assert_eq!(Record::Flush.encode().unwrap(), vec![0xFD]);
        assert_eq!(Record::CancelUnitOfWork.encode().unwrap(), vec![0xFC]);
    }

    #[test]
    fn test_leading_byte_is_tag() {
        let rec = Record::MapEntryPut(MapEntryPut {
            map_name: "M".into(),
            key: "k".into(),
            value: b"v".to_vec(),
        });
        let bytes = rec.encode().unwrap();
        assert_eq!(bytes[0], 10);
        assert_eq!(Record::decode(&bytes).unwrap(), rec);
    }

    #[test]
    fn test_decode_empty() {
        assert!(matches!(Record::decode(&[]), Err(CodecError::Empty)));
    }

    #[test]
    fn test_decode_unknown_tag() {
        let err = Record::decode(&[0x42, 0x00]).unwrap_err();
        assert!(matches!(err, CodecError::UnknownTag(0x42)));
        let store_err: StoreError = err.into();
        assert!(matches!(store_err, StoreError::UnknownRecordType(0x42)));
    }

    #[test]
    fn test_decode_truncated_payload() {
        let rec = Record::trace("LOADED somewhere in time");
        let bytes = rec.encode().unwrap();
        let err = Record::decode(&bytes[..bytes.len() - 3]).unwrap_err();
        assert!(matches!(
            err,
            CodecError::Payload {
                kind: RecordKind::Trace,
                ..
            }
        ));
    }

    #[test]
    fn test_decode_rejects_trailing_bytes() {
        let mut bytes = Record::QueueRemove(QueueRemove {
            queue_name: "Q1".into(),
        })
        .encode()
        .unwrap();
        bytes.push(0xC0);
        assert!(matches!(
            Record::decode(&bytes),
            Err(CodecError::TrailingBytes { extra: 1, .. })
        ));

        assert!(matches!(
            Record::decode(&[0xFE, 0x01]),
            Err(CodecError::TrailingBytes {
                kind: RecordKind::EndUnitOfWork,
                ..
            })
        ));
    }

    #[test]
    fn test_decode_tolerates_unknown_fields() {
        #[derive(Serialize)]
        struct FutureQueueRemove {
            queue_name: String,
            reason: String,
        }
        let mut bytes = vec![TAG_QUEUE_REMOVE];
        rmp_serde::encode::write_named(
            &mut bytes,
            &FutureQueueRemove {
                queue_name: "Q1".into(),
                reason: "expired".into(),
            },
        )
        .unwrap();
        assert_eq!(
            Record::decode(&bytes).unwrap(),
            Record::QueueRemove(QueueRemove {
                queue_name: "Q1".into()
            })
        );
    }

    #[test]
    fn test_tag_table_is_consistent() {
        for tag in 0..=u8::MAX {
            if let Some(kind) = RecordKind::from_tag(tag) {
                assert_eq!(kind.tag(), tag);
            }
        }
    }
}
