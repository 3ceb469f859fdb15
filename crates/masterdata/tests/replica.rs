//! End-to-end behavior of a replica: schema, feed, caches and transactions.

use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

use masterdata::sync::memory::MemoryRemote;
use masterdata::sync::{FeedElement, RowOp};
use masterdata::{
    ChangeKind, IsolationLevel, MasterData, MasterDataConfig, MasterDataError, RowKey, SyncConfig,
    SyncOutcome, TagEdit, TagOp, Value, Wait,
};
use tempfile::TempDir;

const SCHEMA: &str = r#"{
    "tables": [
        {
            "name": "Customer",
            "track_refresh": true,
            "columns": [
                { "name": "Id", "type": "integer", "primary": true },
                { "name": "Name", "type": "text" },
                { "name": "Active", "type": "boolean", "default": "true" }
            ]
        }
    ]
}"#;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn remote() -> Arc<MemoryRemote> {
    let remote = Arc::new(MemoryRemote::new());
    remote.set_schema(SCHEMA, Some(1));
    remote
}

fn open(remote: &Arc<MemoryRemote>, config: MasterDataConfig) -> MasterData {
    MasterData::open(config, Arc::clone(remote) as _).unwrap()
}

fn customer(op: RowOp, id: i64, name: &str) -> FeedElement {
    FeedElement::row(op, vec![Value::Integer(id), Value::Text(name.into()), Value::Integer(1)])
}

fn customers(rows: &[(i64, &str)], full: bool) -> Vec<FeedElement> {
    let mut feed = vec![FeedElement::Batch {
        table: "Customer".into(),
        full,
    }];
    let op = if full { RowOp::Refresh } else { RowOp::Insert };
    feed.extend(rows.iter().map(|(id, name)| customer(op, *id, name)));
    feed.push(FeedElement::SyncId {
        token: Some(format!("t{}", rows.len())),
    });
    feed.push(FeedElement::End);
    feed
}

fn completed(outcome: SyncOutcome) -> masterdata::SyncReport {
    match outcome {
        SyncOutcome::Completed(report) => report,
        SyncOutcome::Deferred => panic!("run was deferred"),
    }
}

#[test]
fn test_cached_rows_follow_the_feed() {
    init_tracing();
    let remote = remote();
    let md = open(&remote, MasterDataConfig::default());
    remote
        .push_elements(&customers(&[(1, "Ada"), (2, "Brendan"), (3, "Cleo")], true))
        .unwrap();
    completed(md.run_synchronization(false).unwrap());

    let ada = md.get_row("Customer", &RowKey::Integer(1)).unwrap().unwrap();
    let cleo = md.get_row("customer", &RowKey::Integer(3)).unwrap().unwrap();
    assert_eq!(ada.get("Active"), Some(Value::Integer(1)));

    // Ada renamed, Cleo gone from the next full refresh.
    remote
        .push_elements(&customers(&[(1, "Ada L."), (2, "Brendan")], true))
        .unwrap();
    completed(md.run_synchronization(false).unwrap());

    assert_eq!(ada.get("Name"), Some(Value::Text("Ada L.".into())));
    assert!(cleo.is_deleted());
    assert!(md.get_row("Customer", &RowKey::Integer(3)).unwrap().is_none());

    let table = md.get_table("Customer").unwrap();
    let names: Vec<Value> = table
        .select()
        .order_by(r#""Name""#)
        .rows()
        .unwrap()
        .iter()
        .filter_map(|row| row.get("Name"))
        .collect();
    assert_eq!(names, vec![Value::Text("Ada L.".into()), Value::Text("Brendan".into())]);
}

#[test]
fn test_row_events_precede_table_changed() {
    let remote = remote();
    let md = open(&remote, MasterDataConfig::default());
    completed(md.run_synchronization(false).unwrap());

    let kinds = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&kinds);
    let _token = md.subscribe("Customer", None, move |event| {
        sink.lock().unwrap().push(event.kind);
    });
    remote
        .push_elements(&customers(&[(1, "Ada"), (2, "Brendan")], false))
        .unwrap();
    completed(md.run_synchronization(false).unwrap());

    assert_eq!(
        *kinds.lock().unwrap(),
        vec![ChangeKind::RowInsert, ChangeKind::RowInsert, ChangeKind::TableChanged]
    );
}

#[test]
fn test_unknown_table_is_reported() {
    let remote = remote();
    let md = open(&remote, MasterDataConfig::default());
    assert!(matches!(
        md.get_table("Customer"),
        Err(MasterDataError::TableNotFound(_))
    ));
    completed(md.run_synchronization(false).unwrap());
    assert!(md.get_table("Customer").is_ok());
    assert!(matches!(
        md.get_table("Invoice"),
        Err(MasterDataError::TableNotFound(_))
    ));
}

#[test]
fn test_reopened_replica_keeps_schema_tokens_and_properties() {
    let dir = TempDir::new().unwrap();
    let config = MasterDataConfig::default().with_database_path(dir.path().join("replica.db"));
    let remote = remote();

    {
        let md = open(&remote, config.clone());
        let mut feed = customers(&[(1, "Ada")], true);
        feed.push(FeedElement::SyncStamp { stamp: 77 });
        remote.push_elements(&feed).unwrap();
        completed(md.run_synchronization(false).unwrap());
        md.set_user_property("device", Some("tablet-7")).unwrap();
    }

    let md = open(&remote, config);
    // Usable before any synchronization.
    assert!(md.get_row("Customer", &RowKey::Integer(1)).unwrap().is_some());
    assert_eq!(md.user_property("device").unwrap().as_deref(), Some("tablet-7"));
    assert_eq!(md.last_sync_stamp().unwrap(), Some(77));

    completed(md.run_synchronization(false).unwrap());
    let request = remote.requests().pop().unwrap();
    assert_eq!(request.tokens.get("Customer").map(String::as_str), Some("t1"));
    assert_eq!(remote.schema_fetches(), 1);
}

#[test]
fn test_local_ids_and_rollback_actions() {
    let remote = remote();
    let md = open(&remote, MasterDataConfig::default());
    completed(md.run_synchronization(false).unwrap());

    let undone = Arc::new(Mutex::new(false));
    {
        let tx = md
            .begin_transaction(IsolationLevel::Write, Wait::NoWait)
            .unwrap()
            .unwrap();
        let first = md.next_local_id(&tx, "Customer").unwrap();
        assert_eq!(first, -1);
        tx.execute(
            r#"INSERT INTO "Customer" ("Id", "Name") VALUES (?1, 'draft')"#,
            [first],
        )
        .unwrap();
        assert_eq!(md.next_local_id(&tx, "Customer").unwrap(), -2);

        let flag = Arc::clone(&undone);
        tx.add_rollback_operation(move || {
            *flag.lock().unwrap() = true;
            Ok(())
        })
        .unwrap();
        // Dropped without commit.
    }

    assert!(*undone.lock().unwrap());
    assert!(md.get_row("Customer", &RowKey::Integer(-1)).unwrap().is_none());
}

#[test]
fn test_busy_replica_defers_synchronization() {
    let remote = remote();
    let md = open(
        &remote,
        MasterDataConfig::default().with_sync(
            SyncConfig::default().with_batch_timeout(Duration::from_millis(20)),
        ),
    );
    let (held_tx, held_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();

    thread::scope(|scope| {
        let md = &md;
        scope.spawn(move || {
            let tx = md
                .begin_transaction(IsolationLevel::Write, Wait::NoWait)
                .unwrap()
                .unwrap();
            held_tx.send(()).unwrap();
            release_rx.recv().unwrap();
            drop(tx);
        });
        held_rx.recv().unwrap();
        assert!(md.run_synchronization(false).unwrap().is_deferred());
        release_tx.send(()).unwrap();
    });

    assert!(!md.run_synchronization(false).unwrap().is_deferred());
}

#[test]
fn test_queued_tag_edits_are_sent_once() {
    let remote = remote();
    let md = open(&remote, MasterDataConfig::default());
    md.queue_tag_edit(&TagEdit {
        object_key: "1".into(),
        tag: "vip".into(),
        op: TagOp::Add,
    })
    .unwrap();

    let report = completed(md.run_synchronization(false).unwrap());
    assert_eq!(report.tag_edits_pushed, 1);
    completed(md.run_synchronization(false).unwrap());

    let requests = remote.requests();
    assert_eq!(requests[0].tag_edits.len(), 1);
    assert!(requests[1].tag_edits.is_empty());
}

#[test]
fn test_held_row_follows_a_moved_virtual_key() {
    const NOTES: &str = r#"{
        "tables": [
            {
                "name": "Contact",
                __KEY__
                "columns": [
                    { "name": "Id", "type": "integer", "primary": true },
                    { "name": "Name", "type": "text", "unique": true },
                    { "name": "Note", "type": "text" }
                ]
            }
        ]
    }"#;
    let contact = |op, note: &str| {
        FeedElement::row(
            op,
            vec![Value::Integer(1), Value::Text("Ada".into()), Value::Text(note.into())],
        )
    };
    let batch = || FeedElement::Batch {
        table: "Contact".into(),
        full: false,
    };

    let remote = Arc::new(MemoryRemote::new());
    remote.set_schema(NOTES.replace("__KEY__", ""), Some(1));
    let md = open(&remote, MasterDataConfig::default());
    remote
        .push_elements(&[batch(), contact(RowOp::Insert, "v1"), FeedElement::End])
        .unwrap();
    completed(md.run_synchronization(false).unwrap());
    let held = md.get_row("Contact", &RowKey::Integer(1)).unwrap().unwrap();

    // Only the virtual key moves; the table needs no DDL.
    remote.set_schema(NOTES.replace("__KEY__", r#""use_as_key": "Name","#), Some(2));
    remote
        .push_elements(&[batch(), contact(RowOp::Update, "v2"), FeedElement::End])
        .unwrap();
    let report = completed(md.run_synchronization(false).unwrap());

    assert_eq!(report.schema_statements, 0);
    assert_eq!(report.tables_changed, vec!["Contact".to_string()]);
    assert_eq!(held.key(), RowKey::Text("Ada".into()));
    assert_eq!(held.get("Note"), Some(Value::Text("v2".into())));
    let again = md.get_row("Contact", &RowKey::Text("Ada".into())).unwrap().unwrap();
    assert!(Arc::ptr_eq(&held, &again));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 1)]
async fn test_async_run_completes_on_blocking_pool() {
    let remote = remote();
    let md = Arc::new(open(&remote, MasterDataConfig::default()));
    remote
        .push_elements(&customers(&[(1, "Ada")], false))
        .unwrap();

    let outcome = md.run_synchronization_async(false).await.unwrap();

    assert_eq!(completed(outcome).rows_applied, 1);
    assert!(md.get_row("Customer", &RowKey::Integer(1)).unwrap().is_some());
}
