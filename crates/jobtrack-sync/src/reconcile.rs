//! Diff fetched postings against the remote table and issue the writes.

use std::collections::{HashMap, HashSet};
use std::fmt;

use chrono::NaiveDate;
use jobtrack_core::{
    FieldValue, Posting, RecordField, RecordPatch, StoredRecord,
    DEFAULT_APPLICATION_STATUS,
};
use jobtrack_storage::{RecordStore, StoreError};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteOp {
    Create,
    Update,
    Close,
}

impl fmt::Display for WriteOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            WriteOp::Create => "create",
            WriteOp::Update => "update",
            WriteOp::Close => "close",
        })
    }
}

/// A single create/update the store refused. Recovered; the run continues.
#[derive(Debug, Error)]
#[error("{operation} for REQ ID {req_id} failed: {source}")]
pub struct RecordWriteError {
    pub req_id: String,
    pub operation: WriteOp,
    #[source]
    pub source: StoreError,
}

#[derive(Debug, Default)]
pub struct ReconcileReport {
    pub office: String,
    pub fetched: usize,
    pub created: usize,
    pub updated: usize,
    pub reopened: usize,
    pub unchanged: usize,
    pub closed: usize,
    pub already_closed: usize,
    pub failures: Vec<RecordWriteError>,
}

impl ReconcileReport {
    pub fn succeeded_writes(&self) -> usize {
        self.created + self.updated + self.closed
    }

    pub fn attempted_writes(&self) -> usize {
        self.succeeded_writes() + self.failures.len()
    }
}

/// SHA-256 over every sync-owned value, stored in the record so unchanged
/// postings can be skipped without reading the page back.
pub fn sync_fingerprint(posting: &Posting) -> String {
    let mut hasher = Sha256::new();
    let posted = posting
        .posted_on
        .map(|d| d.to_string())
        .unwrap_or_default();
    let mut parts: Vec<&str> = vec![
        posting.title.as_str(),
        posting.department.as_str(),
        posting.office.as_str(),
        posting.experience.as_str(),
        posting.apply_url.as_str(),
        posting.summary.as_str(),
        posted.as_str(),
    ];
    for section in &posting.sections {
        parts.push(section.heading.as_str());
        parts.push(section.text.as_str());
    }
    for part in parts {
        hasher.update((part.len() as u64).to_le_bytes());
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
}

fn sync_fields(posting: &Posting) -> RecordPatch {
    RecordPatch::new()
        .set(RecordField::Title, FieldValue::text(&posting.title))
        .set(RecordField::Department, FieldValue::text(&posting.department))
        .set(RecordField::Office, FieldValue::text(&posting.office))
        .set(RecordField::Experience, FieldValue::text(&posting.experience))
        .set(RecordField::ApplyUrl, FieldValue::text(&posting.apply_url))
        .set(RecordField::Summary, FieldValue::text(&posting.summary))
        .set(RecordField::PostedOn, FieldValue::Date(posting.posted_on))
        .with_body(posting.sections.clone())
}

/// First sighting: every sync-owned field plus the user-owned defaults.
pub fn create_patch(posting: &Posting, fingerprint: &str, today: NaiveDate) -> RecordPatch {
    sync_fields(posting)
        .set(RecordField::ReqId, FieldValue::text(&posting.req_id))
        .set(RecordField::Closed, FieldValue::Flag(false))
        .set(RecordField::ClosedOn, FieldValue::Date(None))
        .set(RecordField::SyncHash, FieldValue::text(fingerprint))
        .set(
            RecordField::Status,
            FieldValue::text(DEFAULT_APPLICATION_STATUS),
        )
        .set(RecordField::FirstSeen, FieldValue::Date(Some(today)))
}

/// Re-sighting: sync-owned fields only. Clears any closure marker.
pub fn update_patch(posting: &Posting, fingerprint: &str) -> RecordPatch {
    sync_fields(posting)
        .set(RecordField::Closed, FieldValue::Flag(false))
        .set(RecordField::ClosedOn, FieldValue::Date(None))
        .set(RecordField::SyncHash, FieldValue::text(fingerprint))
}

pub fn close_patch(today: NaiveDate) -> RecordPatch {
    RecordPatch::new()
        .set(RecordField::Closed, FieldValue::Flag(true))
        .set(RecordField::ClosedOn, FieldValue::Date(Some(today)))
}

/// Collapse repeated identifiers; the last occurrence wins but keeps the first position.
pub fn dedupe_postings(postings: Vec<Posting>) -> Vec<Posting> {
    let mut position: HashMap<String, usize> = HashMap::new();
    let mut out: Vec<Posting> = Vec::with_capacity(postings.len());
    for posting in postings {
        match position.get(&posting.req_id) {
            Some(&idx) => {
                debug!(req_id = %posting.req_id, "duplicate identifier in fetch, keeping last");
                out[idx] = posting;
            }
            None => {
                position.insert(posting.req_id.clone(), out.len());
                out.push(posting);
            }
        }
    }
    out
}

pub struct Reconciler<'a> {
    store: &'a dyn RecordStore,
    today: NaiveDate,
}

impl<'a> Reconciler<'a> {
    pub fn new(store: &'a dyn RecordStore, today: NaiveDate) -> Self {
        Self { store, today }
    }

    /// Bring the records for `office` in line with `postings`.
    ///
    /// Only a failed query is returned as an error. Individual write
    /// failures are collected in the report.
    pub async fn reconcile(
        &self,
        office: &str,
        postings: Vec<Posting>,
    ) -> Result<ReconcileReport, StoreError> {
        let records = self.store.query_records(None).await?;
        let (index, authoritative) = index_records(&records);

        let postings = dedupe_postings(postings);
        let mut report = ReconcileReport {
            office: office.to_string(),
            fetched: postings.len(),
            ..ReconcileReport::default()
        };

        let mut seen: HashSet<&str> = HashSet::new();
        for posting in &postings {
            seen.insert(posting.req_id.as_str());
            let fingerprint = sync_fingerprint(posting);

            match index.get(posting.req_id.as_str()) {
                None => {
                    let patch = create_patch(posting, &fingerprint, self.today);
                    match self.store.create_record(&patch).await {
                        Ok(handle) => {
                            info!(req_id = %posting.req_id, %handle, "created record");
                            report.created += 1;
                        }
                        Err(source) => self.record_failure(
                            &mut report,
                            &posting.req_id,
                            WriteOp::Create,
                            source,
                        ),
                    }
                }
                Some(existing) => {
                    let reopening = existing.is_closed();
                    if !reopening && existing.sync_hash() == Some(fingerprint.as_str()) {
                        report.unchanged += 1;
                        continue;
                    }
                    let patch = update_patch(posting, &fingerprint);
                    match self.store.update_record(&existing.handle, &patch).await {
                        Ok(()) => {
                            info!(
                                req_id = %posting.req_id,
                                reopened = reopening,
                                "updated record"
                            );
                            report.updated += 1;
                            if reopening {
                                report.reopened += 1;
                            }
                        }
                        Err(source) => self.record_failure(
                            &mut report,
                            &posting.req_id,
                            WriteOp::Update,
                            source,
                        ),
                    }
                }
            }
        }

        let close = close_patch(self.today);
        for record in authoritative {
            if record.office() != office || seen.contains(record.req_id()) {
                continue;
            }
            if record.is_closed() {
                report.already_closed += 1;
                continue;
            }
            match self.store.update_record(&record.handle, &close).await {
                Ok(()) => {
                    info!(req_id = %record.req_id(), "flagged record closed");
                    report.closed += 1;
                }
                Err(source) => {
                    self.record_failure(&mut report, record.req_id(), WriteOp::Close, source)
                }
            }
        }

        Ok(report)
    }

    fn record_failure(
        &self,
        report: &mut ReconcileReport,
        req_id: &str,
        operation: WriteOp,
        source: StoreError,
    ) {
        let err = RecordWriteError {
            req_id: req_id.to_string(),
            operation,
            source,
        };
        warn!(error = %err, "record skipped");
        report.failures.push(err);
    }
}

/// Identifier -> first record carrying it, plus those records in table order.
fn index_records(
    records: &[StoredRecord],
) -> (HashMap<&str, &StoredRecord>, Vec<&StoredRecord>) {
    let mut index: HashMap<&str, &StoredRecord> = HashMap::new();
    let mut authoritative = Vec::new();
    for record in records {
        let req_id = record.req_id();
        if req_id.is_empty() {
            continue;
        }
        if let Some(first) = index.get(req_id) {
            warn!(
                req_id,
                kept = %first.handle,
                ignored = %record.handle,
                "identifier appears on more than one record"
            );
            continue;
        }
        index.insert(req_id, record);
        authoritative.push(record);
    }
    (index, authoritative)
}
