//! # Data Model
//!
//! Broker message shapes, the decoded event, and the values that flow from
//! the dispatcher to the downstream task queue and notification listeners.
//!
//! Broker messages are JSON documents tagged by `type`. Binary fields
//! (`payload`, inline attachment `data`) travel base64 encoded and are held
//! as [`Bytes`] so workers can share them without copying.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{CollaboratorError, IngestError};

/// Serde adapter for base64 encoded [`Bytes`].
mod b64 {
    use base64::{engine::general_purpose, Engine as _};
    use bytes::Bytes;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Bytes, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Bytes, D::Error> {
        let text = String::deserialize(d)?;
        general_purpose::STANDARD
            .decode(text.as_bytes())
            .map(Bytes::from)
            .map_err(de::Error::custom)
    }

    pub mod opt {
        use base64::{engine::general_purpose, Engine as _};
        use bytes::Bytes;
        use serde::{de, Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(bytes: &Option<Bytes>, s: S) -> Result<S::Ok, S::Error> {
            match bytes {
                Some(b) => super::serialize(b, s),
                None => s.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Bytes>, D::Error> {
            Option::<String>::deserialize(d)?
                .map(|text| {
                    general_purpose::STANDARD
                        .decode(text.as_bytes())
                        .map(Bytes::from)
                        .map_err(de::Error::custom)
                })
                .transpose()
        }
    }
}

/// # Broker Message
///
/// Every message read from a broker partition. The `type` tag selects the
/// handler in [`crate::core::consumer::IngestConsumer`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BrokerMessage {
    /// A full event envelope.
    Event(IngestMessage),
    /// One fragment of a chunked attachment.
    AttachmentChunk(ChunkMessage),
    /// Finalizes a single attachment uploaded separately from its event.
    Attachment(AttachmentMessage),
    /// A standalone user feedback submission.
    UserReport(UserReportMessage),
}

impl BrokerMessage {
    /// Decodes a raw broker payload.
    ///
    /// A missing or empty required field is a fatal [`IngestError::Malformed`]:
    /// redelivering the same bytes can never succeed.
    pub fn decode(raw: &[u8]) -> Result<Self, IngestError> {
        let message: BrokerMessage =
            serde_json::from_slice(raw).map_err(|e| IngestError::Malformed(e.to_string()))?;

        let event_id = match &message {
            BrokerMessage::Event(m) => Some(&m.event_id),
            BrokerMessage::AttachmentChunk(m) => Some(&m.event_id),
            BrokerMessage::Attachment(m) => Some(&m.event_id),
            BrokerMessage::UserReport(_) => None,
        };
        if event_id.is_some_and(|id| id.trim().is_empty()) {
            return Err(IngestError::Malformed("empty `event_id`".to_string()));
        }
        Ok(message)
    }

    /// Encodes the message for a broker partition.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// The project that owns this message.
    pub fn project_id(&self) -> u64 {
        match self {
            BrokerMessage::Event(m) => m.project_id,
            BrokerMessage::AttachmentChunk(m) => m.project_id,
            BrokerMessage::Attachment(m) => m.project_id,
            BrokerMessage::UserReport(m) => m.project_id,
        }
    }
}

/// # Ingest Message
///
/// One event envelope. The payload is kept as raw bytes and only parsed once
/// the deduplication check and the pre-parse killswitch have passed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestMessage {
    /// Client-assigned event identifier.
    pub event_id: String,
    /// Owning project.
    pub project_id: u64,
    /// Raw event JSON.
    #[serde(with = "b64")]
    pub payload: Bytes,
    /// Unix timestamp (seconds) at which the edge received the event.
    pub start_time: f64,
    /// Address of the submitting client, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_addr: Option<String>,
    /// Attachments submitted together with the event.
    #[serde(default)]
    pub attachments: Vec<AttachmentDescriptor>,
}

/// A fragment of an attachment. Chunks of one `(cache_key, id)` pair may
/// arrive in any order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkMessage {
    /// Event the attachment belongs to.
    pub event_id: String,
    /// Owning project.
    pub project_id: u64,
    /// Attachment id inside the event.
    pub id: String,
    /// Zero-based position of this chunk.
    pub chunk_index: u32,
    /// Chunk bytes.
    #[serde(with = "b64")]
    pub payload: Bytes,
}

/// Finalizes one attachment whose chunks were sent ahead of it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentMessage {
    /// Event the attachment belongs to.
    pub event_id: String,
    /// Owning project.
    pub project_id: u64,
    /// The attachment being finalized.
    pub attachment: AttachmentDescriptor,
}

/// A standalone user feedback submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserReportMessage {
    /// Owning project.
    pub project_id: u64,
    /// Unix timestamp (seconds) at which the edge received the report.
    pub start_time: f64,
    /// Raw report JSON.
    #[serde(with = "b64")]
    pub payload: Bytes,
}

/// # Attachment Type
///
/// The attachment kinds the edge can produce. Only generic attachments and
/// view hierarchies may be finalized individually; crash reports are always
/// uploaded together with their event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttachmentType {
    /// A generic file attachment.
    EventAttachment,
    /// A UI view hierarchy dump.
    ViewHierarchy,
    /// A native minidump.
    Minidump,
    /// An Apple crash report.
    AppleCrashReport,
    /// Unreal Engine crash context.
    UnrealContext,
    /// Unreal Engine crash logs.
    UnrealLogs,
}

impl AttachmentType {
    /// Parses the wire name; `None` for anything unrecognized.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "event.attachment" => Some(Self::EventAttachment),
            "event.view_hierarchy" => Some(Self::ViewHierarchy),
            "event.minidump" => Some(Self::Minidump),
            "event.applecrashreport" => Some(Self::AppleCrashReport),
            "unreal.context" => Some(Self::UnrealContext),
            "unreal.logs" => Some(Self::UnrealLogs),
            _ => None,
        }
    }

    /// The wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::EventAttachment => "event.attachment",
            Self::ViewHierarchy => "event.view_hierarchy",
            Self::Minidump => "event.minidump",
            Self::AppleCrashReport => "event.applecrashreport",
            Self::UnrealContext => "unreal.context",
            Self::UnrealLogs => "unreal.logs",
        }
    }

    /// Whether an individual finalize message may persist this kind.
    pub fn is_individually_persistable(self) -> bool {
        matches!(self, Self::EventAttachment | Self::ViewHierarchy)
    }
}

/// Describes an attachment, either carrying its bytes inline or pointing at
/// `chunks` cached fragments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachmentDescriptor {
    /// Declared type, kept verbatim so unknown kinds can be reported.
    pub attachment_type: String,
    /// Attachment id inside the event.
    pub id: String,
    /// File name as uploaded.
    #[serde(default)]
    pub name: String,
    /// MIME type as uploaded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    /// Number of cached chunks (`0` when `data` is inline).
    #[serde(default)]
    pub chunks: u32,
    /// Inline attachment bytes.
    #[serde(default, with = "b64::opt", skip_serializing_if = "Option::is_none")]
    pub data: Option<Bytes>,
    /// Declared size in bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

/// A fully assembled attachment.
#[derive(Debug, Clone, PartialEq)]
pub struct Attachment {
    /// Declared type.
    pub attachment_type: String,
    /// Attachment id inside the event.
    pub id: String,
    /// File name.
    pub name: String,
    /// MIME type.
    pub content_type: Option<String>,
    /// Assembled bytes.
    pub data: Bytes,
    /// Number of cached chunks the bytes were assembled from.
    pub chunks: u32,
}

/// # Cache Key
///
/// Opaque handle of an event in the processing store. Attachment chunks are
/// cached under the same key so they can be found from the event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(pub String);

impl CacheKey {
    /// The event-scoped key shared by the processing store and the
    /// attachment cache.
    pub fn for_event(project_id: u64, event_id: &str) -> Self {
        CacheKey(format!("e:{}:{}", event_id, project_id))
    }

    /// Borrows the key as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// # Event Data
///
/// The decoded event payload. Always a JSON object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventData(pub Map<String, Value>);

impl EventData {
    /// Parses a raw payload.
    ///
    /// Syntax errors and non-object documents are corrupt input and come back
    /// as [`IngestError::Malformed`]. Anything else the parser reports is
    /// treated as transient.
    pub fn decode(payload: &[u8]) -> Result<Self, IngestError> {
        match serde_json::from_slice::<Value>(payload) {
            Ok(Value::Object(map)) => Ok(EventData(map)),
            Ok(_) => Err(IngestError::Malformed(
                "event payload is not a JSON object".to_string(),
            )),
            Err(e) if e.is_io() => Err(IngestError::Retriable(CollaboratorError::Serialization(
                e.to_string(),
            ))),
            Err(e) => Err(IngestError::Malformed(format!("undecodable payload: {}", e))),
        }
    }

    /// The `type` field, if present and a string.
    pub fn event_type(&self) -> Option<&str> {
        self.0.get("type").and_then(Value::as_str)
    }

    /// The `type` field as a metric/killswitch tag (`"null"` when absent).
    pub fn event_type_tag(&self) -> &str {
        self.event_type().unwrap_or("null")
    }

    /// Number of child spans carried by a transaction.
    pub fn span_count(&self) -> usize {
        self.0
            .get("spans")
            .and_then(Value::as_array)
            .map_or(0, Vec::len)
    }
}

/// Entitlement flags of the owning organization.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrganizationFeatures {
    /// Feedback events may be ingested.
    pub user_feedback_ingest: bool,
    /// Attachments may be finalized individually.
    pub event_attachments: bool,
    /// Dynamic sampling is enabled (span counts are not reported).
    pub dynamic_sampling: bool,
    /// The organization is on the am3 tier (span counts are not reported).
    pub am3_tier: bool,
}

/// A resolved project and the identity of its organization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    /// Project id.
    pub id: u64,
    /// Owning organization id.
    pub organization_id: u64,
    /// Owning organization slug, used as a metric tag.
    #[serde(default)]
    pub organization_slug: String,
    /// Entitlement flags.
    #[serde(default)]
    pub features: OrganizationFeatures,
}

/// Downstream task a routed event is handed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Save a transaction directly, skipping preprocessing.
    SaveEventTransaction,
    /// Save a feedback event.
    SaveEventFeedback,
    /// General preprocessing for every other kind.
    PreprocessEvent,
}

impl TaskKind {
    /// Stable name used for queue keys and logs.
    pub fn as_str(self) -> &'static str {
        match self {
            TaskKind::SaveEventTransaction => "save_event_transaction",
            TaskKind::SaveEventFeedback => "save_event_feedback",
            TaskKind::PreprocessEvent => "preprocess_event",
        }
    }
}

/// Arguments of a downstream task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskArgs {
    /// Processing store handle; `None` when the data travels inline.
    pub cache_key: Option<CacheKey>,
    /// Decoded event, passed along to avoid a processing-store round trip.
    pub data: Option<Arc<EventData>>,
    /// Edge receive time.
    pub start_time: f64,
    /// Event id.
    pub event_id: String,
    /// Project id.
    pub project_id: u64,
    /// Whether attachments were cached for this event.
    #[serde(default)]
    pub has_attachments: bool,
}

/// # Downstream Task
///
/// One fire-and-forget handoff to the task queue. The queue promises
/// at-least-once delivery; consumers of these tasks must tolerate duplicates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownstreamTask {
    /// Which task to run.
    #[serde(rename = "task")]
    pub kind: TaskKind,
    /// Task arguments.
    #[serde(flatten)]
    pub args: TaskArgs,
}

/// Published to listeners once an event has been fully dispatched.
#[derive(Debug, Clone)]
pub struct AcceptedEvent {
    /// Address of the submitting client.
    pub remote_addr: Option<String>,
    /// The decoded event.
    pub data: Arc<EventData>,
    /// Owning project.
    pub project: Project,
    /// When the dispatcher finished with the event.
    pub accepted_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_tagged_event_envelope() {
        let raw = serde_json::json!({
            "type": "event",
            "event_id": "e1",
            "project_id": 7,
            "payload": "eyJ0eXBlIjoiZXJyb3IifQ==",
            "start_time": 1700000000,
        });
        let message = BrokerMessage::decode(raw.to_string().as_bytes()).unwrap();

        match message {
            BrokerMessage::Event(m) => {
                assert_eq!(m.event_id, "e1");
                assert_eq!(m.project_id, 7);
                assert_eq!(&m.payload[..], br#"{"type":"error"}"#);
                assert!(m.attachments.is_empty());
                assert!(m.remote_addr.is_none());
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn missing_event_id_is_malformed() {
        let raw = br#"{"type":"event","project_id":7,"payload":"","start_time":1.0}"#;
        let err = BrokerMessage::decode(raw).unwrap_err();
        assert!(matches!(err, IngestError::Malformed(_)));
        assert!(err.to_string().contains("event_id"));
    }

    #[test]
    fn empty_event_id_is_malformed() {
        let raw = br#"{"type":"attachment_chunk","event_id":" ","project_id":7,"id":"a","chunk_index":0,"payload":""}"#;
        assert!(matches!(
            BrokerMessage::decode(raw),
            Err(IngestError::Malformed(_))
        ));
    }

    #[test]
    fn payload_decode_distinguishes_corrupt_input() {
        assert!(matches!(
            EventData::decode(b"{not json"),
            Err(IngestError::Malformed(_))
        ));
        assert!(matches!(
            EventData::decode(b"[1, 2]"),
            Err(IngestError::Malformed(_))
        ));

        let data = EventData::decode(br#"{"type":"transaction","spans":[{},{}]}"#).unwrap();
        assert_eq!(data.event_type(), Some("transaction"));
        assert_eq!(data.span_count(), 2);
    }

    #[test]
    fn missing_type_tags_as_null() {
        let data = EventData::decode(b"{}").unwrap();
        assert_eq!(data.event_type(), None);
        assert_eq!(data.event_type_tag(), "null");
    }

    #[test]
    fn attachment_types_round_trip_their_wire_names() {
        for name in ["event.attachment", "event.view_hierarchy", "event.minidump"] {
            assert_eq!(AttachmentType::parse(name).map(AttachmentType::as_str), Some(name));
        }
        assert_eq!(AttachmentType::parse("event.payload"), None);
        assert!(!AttachmentType::Minidump.is_individually_persistable());
    }

    #[test]
    fn downstream_task_flattens_arguments() {
        let task = DownstreamTask {
            kind: TaskKind::PreprocessEvent,
            args: TaskArgs {
                cache_key: Some(CacheKey::for_event(7, "e1")),
                data: None,
                start_time: 1.5,
                event_id: "e1".into(),
                project_id: 7,
                has_attachments: false,
            },
        };
        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["task"], "preprocess_event");
        assert_eq!(json["cache_key"], "e:e1:7");
        assert_eq!(json["project_id"], 7);
    }
}
