//! Record-level types exchanged between the broker and the store
//!
//! These types are what the broker layer reads and writes. The store
//! journals them verbatim and keeps derived lookups in the index.

use serde::{Deserialize, Serialize};

/// Lifecycle state persisted in the root entity.
///
/// `Open` on load means the previous process did not unload cleanly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum StoreState {
    /// Cleanly unloaded
    Closed = 1,
    /// In use (or crashed while in use)
    Open = 2,
}

/// Identifies a queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDescriptor {
    /// Unique queue name
    pub name: String,
    /// Broker-defined queue type
    pub queue_type: i16,
    /// Broker-defined application type
    pub application_type: i16,
    /// Parent queue name for partitioned queues
    #[serde(default)]
    pub parent: Option<String>,
    /// Partition id within the parent (only meaningful with `parent`)
    #[serde(default)]
    pub partition_id: i32,
}

impl QueueDescriptor {
    /// Descriptor for a plain (non-partitioned) queue.
    pub fn new(name: impl Into<String>) -> Self {
        QueueDescriptor {
            name: name.into(),
            queue_type: 0,
            application_type: 0,
            parent: None,
            partition_id: 0,
        }
    }

    /// Set the queue type.
    pub fn with_queue_type(mut self, queue_type: i16) -> Self {
        self.queue_type = queue_type;
        self
    }

    /// Set the application type.
    pub fn with_application_type(mut self, application_type: i16) -> Self {
        self.application_type = application_type;
        self
    }

    /// Make this a partition of `parent`.
    pub fn with_parent(mut self, parent: impl Into<String>, partition_id: i32) -> Self {
        self.parent = Some(parent.into());
        self.partition_id = partition_id;
        self
    }
}

/// A broker message as stored in the journal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    /// Caller-assigned, globally unique, non-negative key
    pub key: i64,
    /// Broker message id
    pub message_id: String,
    /// Payload encoding tag (wire format name)
    pub encoding: String,
    /// Message size as reported by the broker
    pub size: i32,
    /// Message payload, absent when offloaded to a stream
    #[serde(default)]
    pub buffer: Option<Vec<u8>>,
    /// Stream holding the payload, if offloaded
    #[serde(default)]
    pub stream_key: Option<i64>,
}

impl MessageRecord {
    /// Message with an inline payload; `size` is the payload length.
    pub fn new(key: i64, message_id: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        let buffer = payload.into();
        MessageRecord {
            key,
            message_id: message_id.into(),
            encoding: String::new(),
            size: i32::try_from(buffer.len()).unwrap_or(i32::MAX),
            buffer: Some(buffer),
            stream_key: None,
        }
    }

    /// Set the encoding tag.
    pub fn with_encoding(mut self, encoding: impl Into<String>) -> Self {
        self.encoding = encoding.into();
        self
    }
}

/// One entry of a queue: a message reference at a queue sequence key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueRecord {
    /// Position of the entry in the queue
    pub queue_key: i64,
    /// Referenced message
    pub message_key: i64,
    /// Size accounted to the queue
    pub size: i32,
    /// Opaque broker attachment
    #[serde(default)]
    pub attachment: Option<Vec<u8>>,
}

impl QueueRecord {
    /// Entry without an attachment.
    pub fn new(queue_key: i64, message_key: i64, size: i32) -> Self {
        QueueRecord {
            queue_key,
            message_key,
            size,
            attachment: None,
        }
    }
}

/// A named subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionRecord {
    /// Unique subscription name
    pub name: String,
    /// Subscribed destination
    pub destination: String,
    /// Durable subscriptions survive client disconnects
    pub is_durable: bool,
    /// Optional message selector
    #[serde(default)]
    pub selector: Option<String>,
    /// Opaque broker attachment
    #[serde(default)]
    pub attachment: Option<Vec<u8>>,
    /// Time to expire, -1 for none
    #[serde(default = "no_tte")]
    pub tte: i64,
}

fn no_tte() -> i64 {
    -1
}

impl SubscriptionRecord {
    /// Durable subscription with no selector and no expiry.
    pub fn new(name: impl Into<String>, destination: impl Into<String>) -> Self {
        SubscriptionRecord {
            name: name.into(),
            destination: destination.into(),
            is_durable: true,
            selector: None,
            attachment: None,
            tte: no_tte(),
        }
    }

    /// Set the selector.
    pub fn with_selector(mut self, selector: impl Into<String>) -> Self {
        self.selector = Some(selector.into());
        self
    }
}

/// Summary of one queue, as returned by queue listings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueQueryResult {
    /// The queue
    pub descriptor: QueueDescriptor,
    /// Number of entries
    pub count: u64,
    /// Sum of entry sizes
    pub size: i64,
    /// Lowest queue key, if any entry exists
    pub first_sequence: Option<i64>,
    /// Highest queue key, if any entry exists
    pub last_sequence: Option<i64>,
    /// Partitions whose parent is this queue
    pub partitions: Vec<QueueQueryResult>,
}
