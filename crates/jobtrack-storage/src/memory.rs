//! In-memory [`RecordStore`] used by tests and dry runs.

use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use jobtrack_core::{
    BodySection, FieldValue, RecordField, RecordFilter, RecordHandle, RecordPatch, StoredRecord,
};
use tokio::sync::Mutex;

use crate::{RecordStore, StoreError};

/// A write the store accepted, in the order it was issued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    Create {
        handle: RecordHandle,
        req_id: String,
        patch: RecordPatch,
    },
    Update {
        handle: RecordHandle,
        req_id: String,
        patch: RecordPatch,
    },
}

impl StoreOp {
    pub fn req_id(&self) -> &str {
        match self {
            StoreOp::Create { req_id, .. } | StoreOp::Update { req_id, .. } => req_id,
        }
    }

    pub fn patch(&self) -> &RecordPatch {
        match self {
            StoreOp::Create { patch, .. } | StoreOp::Update { patch, .. } => patch,
        }
    }

    pub fn is_create(&self) -> bool {
        matches!(self, StoreOp::Create { .. })
    }
}

#[derive(Debug, Default)]
struct Row {
    fields: BTreeMap<RecordField, FieldValue>,
    body: Vec<BodySection>,
}

#[derive(Debug, Default)]
struct MemoryState {
    rows: BTreeMap<RecordHandle, Row>,
    next_id: u64,
    ops: Vec<StoreOp>,
    queries: usize,
    rejected_req_ids: HashSet<String>,
    fail_queries: bool,
    deny_access: bool,
}

impl MemoryState {
    fn allocate(&mut self) -> RecordHandle {
        self.next_id += 1;
        RecordHandle(format!("mem-{:04}", self.next_id))
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a row directly, bypassing the op log.
    pub async fn seed(
        &self,
        fields: impl IntoIterator<Item = (RecordField, FieldValue)>,
    ) -> RecordHandle {
        let mut state = self.state.lock().await;
        let handle = state.allocate();
        state.rows.insert(
            handle.clone(),
            Row {
                fields: fields.into_iter().collect(),
                body: Vec::new(),
            },
        );
        handle
    }

    /// Make every create/update touching `req_id` fail.
    pub async fn reject_writes_for(&self, req_id: impl Into<String>) {
        self.state.lock().await.rejected_req_ids.insert(req_id.into());
    }

    pub async fn fail_queries(&self) {
        self.state.lock().await.fail_queries = true;
    }

    pub async fn deny_access(&self) {
        self.state.lock().await.deny_access = true;
    }

    pub async fn ops(&self) -> Vec<StoreOp> {
        self.state.lock().await.ops.clone()
    }

    pub async fn clear_ops(&self) {
        self.state.lock().await.ops.clear();
    }

    pub async fn query_count(&self) -> usize {
        self.state.lock().await.queries
    }

    pub async fn records(&self) -> Vec<StoredRecord> {
        let state = self.state.lock().await;
        state
            .rows
            .iter()
            .map(|(handle, row)| StoredRecord {
                handle: handle.clone(),
                fields: row.fields.clone(),
            })
            .collect()
    }

    pub async fn record_by_req_id(&self, req_id: &str) -> Option<StoredRecord> {
        self.records()
            .await
            .into_iter()
            .find(|r| r.req_id() == req_id)
    }

    pub async fn body(&self, handle: &RecordHandle) -> Option<Vec<BodySection>> {
        self.state
            .lock()
            .await
            .rows
            .get(handle)
            .map(|row| row.body.clone())
    }
}

fn patch_req_id(patch: &RecordPatch) -> Option<&str> {
    patch.get(RecordField::ReqId).and_then(FieldValue::as_text)
}

#[async_trait]
impl RecordStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn verify_access(&self) -> Result<(), StoreError> {
        if self.state.lock().await.deny_access {
            return Err(StoreError::Unauthorized {
                status: 401,
                message: "access denied".to_string(),
            });
        }
        Ok(())
    }

    async fn query_records(
        &self,
        filter: Option<&RecordFilter>,
    ) -> Result<Vec<StoredRecord>, StoreError> {
        {
            let mut state = self.state.lock().await;
            if state.fail_queries {
                return Err(StoreError::Api {
                    status: 503,
                    code: "service_unavailable".to_string(),
                    message: "query failed".to_string(),
                });
            }
            state.queries += 1;
        }
        Ok(self
            .records()
            .await
            .into_iter()
            .filter(|r| filter.map_or(true, |f| f.matches(r)))
            .collect())
    }

    async fn create_record(&self, patch: &RecordPatch) -> Result<RecordHandle, StoreError> {
        let mut state = self.state.lock().await;
        let req_id = patch_req_id(patch).unwrap_or_default().to_string();
        if state.rejected_req_ids.contains(&req_id) {
            return Err(StoreError::Rejected(format!("create for {req_id}")));
        }

        let handle = state.allocate();
        state.rows.insert(
            handle.clone(),
            Row {
                fields: patch.fields.clone(),
                body: patch.body.clone().unwrap_or_default(),
            },
        );
        state.ops.push(StoreOp::Create {
            handle: handle.clone(),
            req_id,
            patch: patch.clone(),
        });
        Ok(handle)
    }

    async fn update_record(
        &self,
        handle: &RecordHandle,
        patch: &RecordPatch,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let MemoryState {
            rows,
            ops,
            rejected_req_ids,
            ..
        } = &mut *state;

        let row = rows
            .get_mut(handle)
            .ok_or_else(|| StoreError::NotFound(handle.to_string()))?;
        let req_id = patch_req_id(patch)
            .or_else(|| row.fields.get(&RecordField::ReqId).and_then(FieldValue::as_text))
            .unwrap_or_default()
            .trim()
            .to_string();
        if rejected_req_ids.contains(&req_id) {
            return Err(StoreError::Rejected(format!("update for {req_id}")));
        }

        for (field, value) in &patch.fields {
            row.fields.insert(*field, value.clone());
        }
        if let Some(body) = &patch.body {
            row.body = body.clone();
        }
        ops.push(StoreOp::Update {
            handle: handle.clone(),
            req_id,
            patch: patch.clone(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_then_update_merges_fields_and_logs_ops() {
        let store = MemoryStore::new();
        let patch = RecordPatch::new()
            .set(RecordField::ReqId, FieldValue::text("100"))
            .set(RecordField::Title, FieldValue::text("Old"));
        let handle = store.create_record(&patch).await.unwrap();

        let update = RecordPatch::new().set(RecordField::Title, FieldValue::text("New"));
        store.update_record(&handle, &update).await.unwrap();

        let rec = store.record_by_req_id("100").await.unwrap();
        assert_eq!(rec.text(RecordField::Title), "New");
        let ops = store.ops().await;
        assert_eq!(ops.len(), 2);
        assert!(ops[0].is_create());
        assert_eq!(ops[1].req_id(), "100");
    }

    #[tokio::test]
    async fn rejected_writes_are_not_logged() {
        let store = MemoryStore::new();
        store.reject_writes_for("7").await;
        let patch = RecordPatch::new().set(RecordField::ReqId, FieldValue::text("7"));
        assert!(matches!(
            store.create_record(&patch).await,
            Err(StoreError::Rejected(_))
        ));
        assert!(store.ops().await.is_empty());
        assert!(store.records().await.is_empty());
    }

    #[tokio::test]
    async fn query_applies_filter() {
        let store = MemoryStore::new();
        store
            .seed([(RecordField::Office, FieldValue::text("Tokyo Japan"))])
            .await;
        store
            .seed([(RecordField::Office, FieldValue::text("Taipei Taiwan"))])
            .await;
        let tokyo = store
            .query_records(Some(&RecordFilter::office("Tokyo Japan")))
            .await
            .unwrap();
        assert_eq!(tokyo.len(), 1);
        assert_eq!(store.query_count().await, 1);
    }

    #[tokio::test]
    async fn update_of_unknown_handle_is_not_found() {
        let store = MemoryStore::new();
        let err = store
            .update_record(&RecordHandle("missing".into()), &RecordPatch::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }
}
