//! Event definitions for the note and folder aggregates.
//!
//! This module provides:
//! - `Event`, the immutable record stored in an event log
//! - `EventPayload`, the closed set of event variants grouped per aggregate type
//! - `Path`, the slash-separated location of notes and folders
//!
//! Events are persisted as self-describing JSON: the payload is an internally
//! tagged enum flattened into the record, so every stored event carries
//! `event_id`, `agg_id`, `revision` and a `type` discriminator. Unknown fields
//! are ignored on read, which lets newer writers add optional payload fields.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Global, strictly increasing event identifier. `0` means "not yet appended".
pub type EventId = u64;

/// Per-aggregate, 1-based revision.
pub type Revision = u64;

// =============================================================================
// Path
// =============================================================================

/// Location of a note or folder, as a list of elements.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Path {
    pub elements: Vec<String>,
}

impl Path {
    pub fn new<I, S>(elements: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            elements: elements.into_iter().map(Into::into).collect(),
        }
    }

    /// Parse a slash-separated path. The empty string is the root path.
    pub fn parse(path: &str) -> Self {
        if path.is_empty() {
            Self::default()
        } else {
            Self::new(path.split('/'))
        }
    }

    /// The last element, or an empty string for the root path.
    pub fn title(&self) -> &str {
        self.elements.last().map(String::as_str).unwrap_or("")
    }

    pub fn is_root(&self) -> bool {
        self.elements.is_empty()
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.elements.join("/"))
    }
}

// =============================================================================
// Aggregate Types
// =============================================================================

/// The closed set of aggregate types. Every event belongs to exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateType {
    Note,
    Folder,
}

impl fmt::Display for AggregateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Note => write!(f, "note"),
            Self::Folder => write!(f, "folder"),
        }
    }
}

// =============================================================================
// Event Payloads
// =============================================================================

/// Variant-specific event data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EventPayload {
    // Note events
    NoteCreated {
        path: Path,
        title: String,
        content: String,
    },
    NoteDeleted,
    NoteUndeleted,
    AttachmentAdded {
        name: String,
        #[serde(with = "base64_bytes")]
        content: Vec<u8>,
    },
    AttachmentDeleted {
        name: String,
    },
    ContentChanged {
        content: String,
    },
    TitleChanged {
        title: String,
    },
    Moved {
        path: Path,
    },

    // Folder events
    FolderCreated {
        path: Path,
    },
    FolderDeleted {
        path: Path,
    },
}

impl EventPayload {
    /// The aggregate type this payload mutates.
    pub fn family(&self) -> AggregateType {
        match self {
            Self::NoteCreated { .. }
            | Self::NoteDeleted
            | Self::NoteUndeleted
            | Self::AttachmentAdded { .. }
            | Self::AttachmentDeleted { .. }
            | Self::ContentChanged { .. }
            | Self::TitleChanged { .. }
            | Self::Moved { .. } => AggregateType::Note,
            Self::FolderCreated { .. } | Self::FolderDeleted { .. } => AggregateType::Folder,
        }
    }

    /// Get the event type name.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::NoteCreated { .. } => "NoteCreated",
            Self::NoteDeleted => "NoteDeleted",
            Self::NoteUndeleted => "NoteUndeleted",
            Self::AttachmentAdded { .. } => "AttachmentAdded",
            Self::AttachmentDeleted { .. } => "AttachmentDeleted",
            Self::ContentChanged { .. } => "ContentChanged",
            Self::TitleChanged { .. } => "TitleChanged",
            Self::Moved { .. } => "Moved",
            Self::FolderCreated { .. } => "FolderCreated",
            Self::FolderDeleted { .. } => "FolderDeleted",
        }
    }

    /// Whether this payload creates (or re-creates) its aggregate.
    pub fn is_creation(&self) -> bool {
        matches!(self, Self::NoteCreated { .. } | Self::FolderCreated { .. })
    }
}

// =============================================================================
// Event
// =============================================================================

/// An immutable fact about one aggregate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Assigned by the event log on append
    #[serde(default)]
    pub event_id: EventId,

    /// Aggregate this event mutates (or creates)
    pub agg_id: String,

    /// Revision of the aggregate after this event
    pub revision: Revision,

    /// Variant-specific data
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl Event {
    /// Create an event that has not been appended yet.
    pub fn new(agg_id: impl Into<String>, revision: Revision, payload: EventPayload) -> Self {
        Self {
            event_id: 0,
            agg_id: agg_id.into(),
            revision,
            payload,
        }
    }

    /// Copy of this event with a different id.
    pub fn with_event_id(&self, event_id: EventId) -> Self {
        Self {
            event_id,
            ..self.clone()
        }
    }

    /// Copy of this event with a different revision.
    pub fn with_revision(&self, revision: Revision) -> Self {
        Self {
            revision,
            ..self.clone()
        }
    }

    pub fn event_type(&self) -> &'static str {
        self.payload.event_type()
    }

    pub fn family(&self) -> AggregateType {
        self.payload.family()
    }

    /// Equality on aggregate, revision and payload, ignoring the event id.
    ///
    /// Two replicas assign different ids to the same logical event.
    pub fn same_content(&self, other: &Event) -> bool {
        self.agg_id == other.agg_id && self.revision == other.revision && self.payload == other.payload
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}(event_id={}, agg_id={}, revision={})",
            self.event_type(),
            self.event_id,
            self.agg_id,
            self.revision
        )
    }
}

/// Serde adapter storing byte buffers as standard base64 strings.
pub(crate) mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// Serde adapter for `name -> bytes` maps, values as base64.
pub(crate) mod base64_map {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::BTreeMap;

    pub fn serialize<S: Serializer>(
        map: &BTreeMap<String, Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let encoded: BTreeMap<&String, String> =
            map.iter().map(|(k, v)| (k, STANDARD.encode(v))).collect();
        encoded.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<String, Vec<u8>>, D::Error> {
        let encoded = BTreeMap::<String, String>::deserialize(deserializer)?;
        encoded
            .into_iter()
            .map(|(k, v)| {
                STANDARD
                    .decode(v)
                    .map(|bytes| (k, bytes))
                    .map_err(serde::de::Error::custom)
            })
            .collect()
    }
}
