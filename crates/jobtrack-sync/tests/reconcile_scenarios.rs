//! Reconciler scenarios against the in-memory store.

use chrono::NaiveDate;
use jobtrack_core::{BodySection, FieldValue, Posting, RecordField};
use jobtrack_storage::{MemoryStore, StoreOp};
use jobtrack_sync::{sync_fingerprint, Reconciler, WriteOp};

const TOKYO: &str = "Tokyo Japan";
const TAIPEI: &str = "Taipei Taiwan";

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn today() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 6, 2).expect("valid date")
}

fn posting(req_id: &str, title: &str, office: &str) -> Posting {
    Posting {
        req_id: req_id.to_string(),
        title: title.to_string(),
        department: "Software Engineering".to_string(),
        office: office.to_string(),
        experience: "5+ years".to_string(),
        apply_url: format!("https://boards.example/acme/jobs/{req_id}"),
        description: format!("{title} full description"),
        summary: format!("{title} summary"),
        sections: vec![BodySection {
            heading: "About the Job".to_string(),
            text: format!("{title} summary"),
        }],
        posted_on: NaiveDate::from_ymd_opt(2025, 5, 1),
    }
}

/// Seed a record exactly as a previous run would have left it.
async fn seed_synced(store: &MemoryStore, p: &Posting, closed: bool) {
    store
        .seed([
            (RecordField::ReqId, FieldValue::text(&p.req_id)),
            (RecordField::Title, FieldValue::text(&p.title)),
            (RecordField::Office, FieldValue::text(&p.office)),
            (RecordField::Closed, FieldValue::Flag(closed)),
            (RecordField::SyncHash, FieldValue::text(sync_fingerprint(p))),
            (RecordField::Status, FieldValue::text("Applied")),
            (RecordField::Notes, FieldValue::text("recruiter called")),
            (
                RecordField::FirstSeen,
                FieldValue::Date(NaiveDate::from_ymd_opt(2025, 1, 1)),
            ),
        ])
        .await;
}

fn ops_for<'a>(ops: &'a [StoreOp], req_id: &str) -> Vec<&'a StoreOp> {
    ops.iter().filter(|op| op.req_id() == req_id).collect()
}

fn assert_no_user_fields_in_updates(ops: &[StoreOp]) {
    for op in ops.iter().filter(|op| !op.is_create()) {
        assert!(
            !op.patch().touches_user_owned(),
            "update for {} touched a user-owned field: {:?}",
            op.req_id(),
            op.patch().fields.keys().collect::<Vec<_>>()
        );
    }
}

// ---------------------------------------------------------------------------
// Core scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn changed_new_and_missing_postings() {
    let store = MemoryStore::new();
    seed_synced(&store, &posting("A", "Alpha", TOKYO), false).await;
    seed_synced(&store, &posting("B", "Bravo", TOKYO), false).await;

    let fetched = vec![
        posting("B", "Bravo Senior", TOKYO),
        posting("C", "Charlie", TOKYO),
    ];
    let report = Reconciler::new(&store, today())
        .reconcile(TOKYO, fetched)
        .await
        .expect("reconcile");

    assert_eq!(
        (report.created, report.updated, report.closed, report.unchanged),
        (1, 1, 1, 0)
    );
    assert!(report.failures.is_empty());

    let ops = store.ops().await;
    assert_eq!(ops.len(), 3);

    let b = ops_for(&ops, "B");
    assert_eq!(b.len(), 1);
    assert!(!b[0].is_create());
    assert_eq!(
        b[0].patch().get(RecordField::Title),
        Some(&FieldValue::text("Bravo Senior"))
    );

    let c = ops_for(&ops, "C");
    assert_eq!(c.len(), 1);
    assert!(c[0].is_create());
    let create = c[0].patch();
    assert_eq!(create.get(RecordField::Status), Some(&FieldValue::text("Not Applied")));
    assert_eq!(create.get(RecordField::FirstSeen), Some(&FieldValue::Date(Some(today()))));
    assert_eq!(create.get(RecordField::Closed), Some(&FieldValue::Flag(false)));

    let a = ops_for(&ops, "A");
    assert_eq!(a.len(), 1);
    assert_eq!(a[0].patch().get(RecordField::Closed), Some(&FieldValue::Flag(true)));
    assert_eq!(
        a[0].patch().get(RecordField::ClosedOn),
        Some(&FieldValue::Date(Some(today())))
    );

    assert_no_user_fields_in_updates(&ops);

    // Soft close: the row and its user fields are still there.
    let a_row = store.record_by_req_id("A").await.expect("A kept");
    assert!(a_row.is_closed());
    assert_eq!(a_row.text(RecordField::Status), "Applied");
    assert_eq!(a_row.text(RecordField::Notes), "recruiter called");
}

#[tokio::test]
async fn already_closed_record_gets_no_operation() {
    let store = MemoryStore::new();
    seed_synced(&store, &posting("A", "Alpha", TOKYO), true).await;

    let report = Reconciler::new(&store, today())
        .reconcile(TOKYO, Vec::new())
        .await
        .expect("reconcile");

    assert_eq!(report.closed, 0);
    assert_eq!(report.already_closed, 1);
    assert!(store.ops().await.is_empty());
}

#[tokio::test]
async fn second_run_with_same_fetch_issues_nothing() {
    let store = MemoryStore::new();
    seed_synced(&store, &posting("OLD", "Gone", TOKYO), false).await;
    let fetched = vec![posting("1", "One", TOKYO), posting("2", "Two", TOKYO)];
    let reconciler = Reconciler::new(&store, today());

    let first = reconciler.reconcile(TOKYO, fetched.clone()).await.expect("first");
    assert_eq!((first.created, first.closed), (2, 1));

    store.clear_ops().await;
    let second = reconciler.reconcile(TOKYO, fetched).await.expect("second");
    assert_eq!(second.unchanged, 2);
    assert_eq!(second.already_closed, 1);
    assert_eq!(second.attempted_writes(), 0);
    assert!(store.ops().await.is_empty());
}

#[tokio::test]
async fn duplicate_identifiers_in_fetch_create_once_with_last_values() {
    let store = MemoryStore::new();
    let fetched = vec![
        posting("9", "First Title", TOKYO),
        posting("9", "Last Title", TOKYO),
    ];

    let report = Reconciler::new(&store, today())
        .reconcile(TOKYO, fetched)
        .await
        .expect("reconcile");

    assert_eq!(report.created, 1);
    let ops = store.ops().await;
    assert_eq!(ops.len(), 1);
    assert_eq!(
        ops[0].patch().get(RecordField::Title),
        Some(&FieldValue::text("Last Title"))
    );
}

#[tokio::test]
async fn resighted_closed_record_is_reopened_without_user_fields() {
    let store = MemoryStore::new();
    let p = posting("A", "Alpha", TOKYO);
    seed_synced(&store, &p, true).await;

    let report = Reconciler::new(&store, today())
        .reconcile(TOKYO, vec![p])
        .await
        .expect("reconcile");

    assert_eq!((report.updated, report.reopened), (1, 1));
    let ops = store.ops().await;
    assert_eq!(ops[0].patch().get(RecordField::Closed), Some(&FieldValue::Flag(false)));
    assert_eq!(ops[0].patch().get(RecordField::ClosedOn), Some(&FieldValue::Date(None)));
    assert_no_user_fields_in_updates(&ops);
    let row = store.record_by_req_id("A").await.expect("row");
    assert_eq!(row.text(RecordField::Status), "Applied");
}

// ---------------------------------------------------------------------------
// Scope and failure handling
// ---------------------------------------------------------------------------

#[tokio::test]
async fn other_office_records_are_never_closed_or_duplicated() {
    let store = MemoryStore::new();
    seed_synced(&store, &posting("T1", "Taipei Role", TAIPEI), false).await;
    seed_synced(&store, &posting("K1", "Tokyo Role", TOKYO), false).await;

    // T1 also listed under Tokyo now: update in place, no second row.
    let report = Reconciler::new(&store, today())
        .reconcile(
            TOKYO,
            vec![
                posting("K1", "Tokyo Role", TOKYO),
                posting("T1", "Taipei Role", TOKYO),
            ],
        )
        .await
        .expect("reconcile");

    assert_eq!((report.created, report.updated, report.closed), (0, 1, 0));
    assert_eq!(store.records().await.len(), 2);

    store.clear_ops().await;
    let report = Reconciler::new(&store, today())
        .reconcile(TAIPEI, Vec::new())
        .await
        .expect("reconcile taipei");
    // T1 now belongs to Tokyo, so Taipei has nothing left to close.
    assert_eq!(report.closed, 0);
    assert!(store.ops().await.is_empty());
}

#[tokio::test]
async fn duplicate_rows_in_store_use_the_first_and_never_create() {
    let store = MemoryStore::new();
    let p = posting("D", "Dup", TOKYO);
    seed_synced(&store, &p, false).await;
    seed_synced(&store, &posting("D", "Stale Dup", TOKYO), false).await;

    let report = Reconciler::new(&store, today())
        .reconcile(TOKYO, vec![p])
        .await
        .expect("reconcile");

    assert_eq!(report.created, 0);
    assert_eq!(report.unchanged, 1);
    assert_eq!(report.closed, 0);
    assert!(store.ops().await.is_empty());
}

#[tokio::test]
async fn rejected_write_is_reported_and_others_continue() {
    let store = MemoryStore::new();
    store.reject_writes_for("BAD").await;

    let report = Reconciler::new(&store, today())
        .reconcile(
            TOKYO,
            vec![posting("BAD", "Broken", TOKYO), posting("OK", "Fine", TOKYO)],
        )
        .await
        .expect("reconcile");

    assert_eq!(report.created, 1);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].req_id, "BAD");
    assert_eq!(report.failures[0].operation, WriteOp::Create);
    assert!(store.record_by_req_id("OK").await.is_some());
    assert!(store.record_by_req_id("BAD").await.is_none());
}

#[tokio::test]
async fn failing_query_is_an_error_with_no_writes() {
    let store = MemoryStore::new();
    store.fail_queries().await;

    let result = Reconciler::new(&store, today())
        .reconcile(TOKYO, vec![posting("1", "One", TOKYO)])
        .await;

    assert!(result.is_err());
    assert!(store.ops().await.is_empty());
}
