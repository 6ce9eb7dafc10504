//! Core domain model for jobtrack: postings as scraped, records as stored.

use std::collections::BTreeMap;
use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

pub mod config;

pub use config::{
    build_app_config, load_app_config, load_app_config_from_env, load_profile, AppConfig,
    ConfigError, DepartmentRule, OfficeProfile, TrackerProfile,
};

pub const CRATE_NAME: &str = "jobtrack-core";

/// Status written on first sighting. The user owns the field afterwards.
pub const DEFAULT_APPLICATION_STATUS: &str = "Not Applied";

/// Cut `text` to at most `limit` characters without splitting a code point.
pub fn truncate_chars(text: &str, limit: usize) -> &str {
    match text.char_indices().nth(limit) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// One headed block of a posting's description, written as the record body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BodySection {
    pub heading: String,
    pub text: String,
}

/// One open job as currently reported by the job board, after normalization.
///
/// Built fresh on every fetch cycle and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Posting {
    pub req_id: String,
    pub title: String,
    pub department: String,
    pub office: String,
    pub experience: String,
    pub apply_url: String,
    pub description: String,
    pub summary: String,
    pub sections: Vec<BodySection>,
    pub posted_on: Option<NaiveDate>,
}

/// Every column the tracker knows about in the remote table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RecordField {
    Title,
    ReqId,
    Department,
    Office,
    Experience,
    ApplyUrl,
    Summary,
    PostedOn,
    Closed,
    ClosedOn,
    SyncHash,
    Status,
    FirstSeen,
    Notes,
}

impl RecordField {
    pub const ALL: [RecordField; 14] = [
        RecordField::Title,
        RecordField::ReqId,
        RecordField::Department,
        RecordField::Office,
        RecordField::Experience,
        RecordField::ApplyUrl,
        RecordField::Summary,
        RecordField::PostedOn,
        RecordField::Closed,
        RecordField::ClosedOn,
        RecordField::SyncHash,
        RecordField::Status,
        RecordField::FirstSeen,
        RecordField::Notes,
    ];

    /// Fields maintained by the user. The reconciler never puts these in an update.
    pub fn is_user_owned(self) -> bool {
        matches!(
            self,
            RecordField::Status | RecordField::FirstSeen | RecordField::Notes
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RecordField::Title => "title",
            RecordField::ReqId => "req_id",
            RecordField::Department => "department",
            RecordField::Office => "office",
            RecordField::Experience => "experience",
            RecordField::ApplyUrl => "apply_url",
            RecordField::Summary => "summary",
            RecordField::PostedOn => "posted_on",
            RecordField::Closed => "closed",
            RecordField::ClosedOn => "closed_on",
            RecordField::SyncHash => "sync_hash",
            RecordField::Status => "status",
            RecordField::FirstSeen => "first_seen",
            RecordField::Notes => "notes",
        }
    }
}

impl fmt::Display for RecordField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A column value as the store understands it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldValue {
    Text(String),
    Date(Option<NaiveDate>),
    Flag(bool),
}

impl FieldValue {
    pub fn text(value: impl Into<String>) -> Self {
        FieldValue::Text(value.into())
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_flag(&self) -> Option<bool> {
        match self {
            FieldValue::Flag(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            FieldValue::Date(d) => *d,
            _ => None,
        }
    }
}

/// Partial field mapping sent with a create or update.
///
/// `body` replaces the record's page content when present and leaves it
/// untouched when `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordPatch {
    pub fields: BTreeMap<RecordField, FieldValue>,
    pub body: Option<Vec<BodySection>>,
}

impl RecordPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, field: RecordField, value: FieldValue) -> Self {
        self.fields.insert(field, value);
        self
    }

    pub fn with_body(mut self, body: Vec<BodySection>) -> Self {
        self.body = Some(body);
        self
    }

    pub fn get(&self, field: RecordField) -> Option<&FieldValue> {
        self.fields.get(&field)
    }

    pub fn contains(&self, field: RecordField) -> bool {
        self.fields.contains_key(&field)
    }

    pub fn touches_user_owned(&self) -> bool {
        self.fields.keys().any(|f| f.is_user_owned())
    }
}

/// Store-assigned row reference.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordHandle(pub String);

impl RecordHandle {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A row as read back from the remote store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub handle: RecordHandle,
    pub fields: BTreeMap<RecordField, FieldValue>,
}

impl StoredRecord {
    pub fn text(&self, field: RecordField) -> &str {
        self.fields
            .get(&field)
            .and_then(FieldValue::as_text)
            .unwrap_or_default()
    }

    pub fn req_id(&self) -> &str {
        self.text(RecordField::ReqId).trim()
    }

    pub fn office(&self) -> &str {
        self.text(RecordField::Office)
    }

    pub fn is_closed(&self) -> bool {
        self.fields
            .get(&RecordField::Closed)
            .and_then(FieldValue::as_flag)
            .unwrap_or(false)
    }

    pub fn sync_hash(&self) -> Option<&str> {
        let hash = self.text(RecordField::SyncHash);
        if hash.is_empty() {
            None
        } else {
            Some(hash)
        }
    }
}

/// Equality filter for store queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordFilter {
    pub field: RecordField,
    pub equals: FieldValue,
}

impl RecordFilter {
    pub fn office(label: impl Into<String>) -> Self {
        Self {
            field: RecordField::Office,
            equals: FieldValue::Text(label.into()),
        }
    }

    pub fn matches(&self, record: &StoredRecord) -> bool {
        match (&self.equals, record.fields.get(&self.field)) {
            (FieldValue::Flag(false), None) => true,
            (FieldValue::Text(want), None) => want.is_empty(),
            (want, Some(have)) => want == have,
            (_, None) => false,
        }
    }
}
