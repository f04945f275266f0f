// packages/replay/src/recording/record.rs
//! Records produced by the capture layer

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Record type, numeric on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordType {
    FullSnapshot,
    IncrementalSnapshot,
    Meta,
    Focus,
    ViewEnd,
    VisualViewport,
    FrustrationRecord,
    Other(u8),
}

impl RecordType {
    pub fn as_u8(&self) -> u8 {
        match self {
            RecordType::FullSnapshot => 2,
            RecordType::IncrementalSnapshot => 3,
            RecordType::Meta => 4,
            RecordType::Focus => 6,
            RecordType::ViewEnd => 7,
            RecordType::VisualViewport => 8,
            RecordType::FrustrationRecord => 9,
            RecordType::Other(code) => *code,
        }
    }
}

impl From<u8> for RecordType {
    fn from(code: u8) -> Self {
        match code {
            2 => RecordType::FullSnapshot,
            3 => RecordType::IncrementalSnapshot,
            4 => RecordType::Meta,
            6 => RecordType::Focus,
            7 => RecordType::ViewEnd,
            8 => RecordType::VisualViewport,
            9 => RecordType::FrustrationRecord,
            other => RecordType::Other(other),
        }
    }
}

impl Serialize for RecordType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.as_u8())
    }
}

impl<'de> Deserialize<'de> for RecordType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        u8::deserialize(deserializer).map(RecordType::from)
    }
}

/// One capturable unit of page activity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    #[serde(rename = "type")]
    pub record_type: RecordType,

    /// Milliseconds since the Unix epoch
    pub timestamp: i64,

    #[serde(rename = "data")]
    pub payload: serde_json::Value,
}

impl Record {
    pub fn new(record_type: RecordType, timestamp: i64, payload: serde_json::Value) -> Self {
        Self {
            record_type,
            timestamp,
            payload,
        }
    }

    pub fn is_full_snapshot(&self) -> bool {
        self.record_type == RecordType::FullSnapshot
    }
}
