use std::{
    fs::File,
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, SystemTime},
};

use rusqlite::{Connection, functions::FunctionFlags};
use serde_json::{Value, json};
use tempfile::TempDir;

use syncsys::{
    channel::{ChannelError, ChannelResult, Claim, ClaimOutcome, Entry, Mailbox, dir::DirMailbox},
    client::{ClientError, SyncClient},
    config::{ClientConfig, ProcessorConfig},
    encoder::{TransactionBuilder, single_request},
    notify::{HookError, NotificationHook},
    op::Operation,
    processor::{Processor, ProcessorError, ProcessorHandle},
    query::Query,
    request::{ErrorKind, Request, RequestInfo, Response, encode_request},
    store::{Applied, Deadline, OperationResult, Store, StoreResult, execute_request, sqlite::SqliteStore},
    types::{Metadata, Row},
};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS tasks (
        task_id INTEGER PRIMARY KEY,
        title TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'open'
    );
    CREATE TABLE IF NOT EXISTS notes (id INTEGER PRIMARY KEY AUTOINCREMENT, body TEXT);
";

fn row(value: Value) -> Row {
    value.as_object().cloned().expect("object literal")
}

struct Site {
    _tmp: TempDir,
    db: PathBuf,
    requests: Arc<DirMailbox>,
    responses: Arc<DirMailbox>,
}

impl Site {
    fn new() -> Self {
        let tmp = TempDir::new().expect("tmp");
        let requests = Arc::new(DirMailbox::open(tmp.path().join("requests")).expect("requests"));
        let responses = Arc::new(DirMailbox::open(tmp.path().join("responses")).expect("responses"));
        Self {
            db: tmp.path().join("central.db"),
            _tmp: tmp,
            requests,
            responses,
        }
    }

    fn store(&self) -> SqliteStore {
        let store = SqliteStore::open(&self.db).expect("open store");
        store.apply_schema(SCHEMA).expect("schema");
        store
    }

    fn spawn(&self, config: ProcessorConfig) -> ProcessorHandle {
        self.spawn_with(Box::new(self.store()), self.responses.clone(), config)
    }

    fn spawn_with(&self, store: Box<dyn Store>, responses: Arc<dyn Mailbox>, config: ProcessorConfig) -> ProcessorHandle {
        Processor::new(store, self.requests.clone(), responses, config)
            .spawn()
            .expect("spawn")
    }

    fn client(&self, config: ClientConfig) -> SyncClient {
        SyncClient::new("site-a", self.requests.clone(), self.responses.clone(), config)
    }

    fn count(&self, table: &str) -> i64 {
        self.store()
            .connection()
            .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |r| r.get(0))
            .expect("count")
    }

    fn log_status(&self, request_id: &str) -> Option<String> {
        self.store()
            .log_entry(request_id)
            .expect("log")
            .map(|entry| entry.status)
    }

    /// Leaves `request` claimed as if its owner died `age` ago.
    fn strand(&self, request: &Request, requeues: u32, age: Duration) {
        self.requests
            .publish(&request.request_id, &encode_request(request))
            .expect("publish");
        let mut claim = take_claim(&self.requests, &request.request_id).expect("claim");
        for _ in 0..requeues {
            self.requests.requeue(claim).expect("requeue");
            claim = take_claim(&self.requests, &request.request_id).expect("claim again");
        }
        assert_eq!(claim.attempt, requeues);
        set_age(&self.requests.root().join(".processing").join(format!("{}.json", request.request_id)), age);
    }
}

fn processor_config() -> ProcessorConfig {
    ProcessorConfig {
        poll_interval: Duration::from_millis(20),
        request_timeout: Duration::from_secs(5),
        cleanup_interval: Duration::from_secs(3_600),
        ..ProcessorConfig::default()
    }
}

fn client_config() -> ClientConfig {
    ClientConfig {
        poll_interval: Duration::from_millis(10),
        request_timeout: Duration::from_secs(10),
        retry_attempts: 0,
        retry_delay: Duration::from_millis(10),
    }
}

fn ready_entry(id: &str) -> Entry {
    Entry {
        id: id.to_string(),
        modified: SystemTime::now(),
    }
}

fn take_claim(mailbox: &DirMailbox, id: &str) -> Option<Claim> {
    match mailbox.claim(&ready_entry(id)).expect("claim") {
        ClaimOutcome::Claimed(claim) => Some(claim),
        ClaimOutcome::Lost => None,
    }
}

fn set_age(path: &Path, age: Duration) {
    File::options()
        .write(true)
        .open(path)
        .and_then(|f| f.set_modified(SystemTime::now() - age))
        .expect("set mtime");
}

/// Waits for and consumes the response to `id`.
async fn wait_response(mailbox: &DirMailbox, id: &str) -> Response {
    for _ in 0..500 {
        if let Some(claim) = take_claim(mailbox, id) {
            let body = mailbox.read(&claim).expect("read");
            mailbox.ack(claim).expect("ack");
            return Response::decode(&body).expect("decode response");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("no response for {id}");
}

async fn eventually(what: &str, cond: impl Fn() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

fn insert_note(body: &str) -> Request {
    let op = Operation::Insert {
        table: "notes".to_string(),
        values: row(json!({"body": body})),
    };
    single_request("site-a", op, Metadata::new()).expect("request")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn client_helpers_round_trip_through_the_processor() {
    let site = Site::new();
    let handle = site.spawn(processor_config());
    let client = site.client(client_config());
    let tasks = client.table("tasks");

    assert_eq!(tasks.insert(row(json!({"task_id": 1, "title": "survey"}))).await.expect("insert"), Some(1));
    assert_eq!(tasks.insert(row(json!({"task_id": 2, "title": "report"}))).await.expect("insert"), Some(2));
    assert_eq!(tasks.update(1, row(json!({"status": "done"}))).await.expect("update"), 1);

    let got = tasks.get(1).await.expect("get").expect("row");
    assert_eq!(got["status"], "done");
    assert_eq!(tasks.count(row(json!({"status": "open"}))).await.expect("count"), 1);
    assert!(!client.exists("tasks", row(json!({"task_id": 9}))).await.expect("exists"));

    let mut txn = TransactionBuilder::new();
    txn.add_delete("tasks", 1)
        .add_update("tasks", 2, row(json!({"title": "final report"})));
    let summary = client.transaction(&txn).await.expect("transaction");
    assert_eq!(summary["transaction_success"], true);
    assert_eq!(summary["operations_count"], 2);
    assert_eq!(summary["total_affected_rows"], 2);

    let rows = client
        .select(Query::new("tasks").columns(["title"]).order_by("task_id", false))
        .await
        .expect("select");
    assert_eq!(rows, vec![row(json!({"title": "final report"}))]);

    let stats = handle.stats();
    assert_eq!(stats.failed, 0);
    assert!(stats.succeeded >= 8);
    handle.shutdown().await.expect("shutdown");
    assert!(site.requests.poll().expect("poll").is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn invalid_documents_are_answered_without_touching_the_store() {
    let site = Site::new();
    let handle = site.spawn(processor_config());

    let missing_where = json!({
        "request_id": "site-a_delete_1_aa",
        "client_id": "site-a",
        "operation": "SINGLE",
        "table": "tasks",
        "data": {"type": "DELETE"},
        "timestamp": 1.0,
    });
    site.requests
        .publish("site-a_delete_1_aa", &serde_json::to_vec(&missing_where).expect("encode"))
        .expect("publish");
    site.requests.publish("garbage_1", b"{not json").expect("publish");
    let mut mismatched = insert_note("wrong name");
    mismatched.request_id = "site-a_insert_2_bb".to_string();
    site.requests
        .publish("site-a_insert_3_cc", &encode_request(&mismatched))
        .expect("publish");

    let first = wait_response(&site.responses, "site-a_delete_1_aa").await;
    assert!(!first.success);
    assert_eq!(first.client_id, "site-a");
    let error = first.error.expect("error");
    assert_eq!(error.kind, ErrorKind::Validation);
    assert_eq!(error.operation_index, Some(1));

    let garbage = wait_response(&site.responses, "garbage_1").await;
    assert_eq!(garbage.error_kind(), Some(ErrorKind::Validation));
    assert_eq!(garbage.client_id, "");

    let mismatch = wait_response(&site.responses, "site-a_insert_3_cc").await;
    assert_eq!(mismatch.error_kind(), Some(ErrorKind::Validation));

    handle.shutdown().await.expect("shutdown");
    assert_eq!(site.count("notes"), 0);
    assert_eq!(site.count("sync_log"), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn constraint_violation_rolls_back_and_names_the_operation() {
    let site = Site::new();
    let handle = site.spawn(processor_config());
    let client = site.client(client_config());

    let mut txn = TransactionBuilder::new();
    txn.add_insert("tasks", row(json!({"task_id": 1, "title": "a"})))
        .add_insert("tasks", row(json!({"task_id": 1, "title": "b"})));
    let err = client.transaction(&txn).await.expect_err("must fail");
    let ClientError::Failed { request_id, error } = err else {
        panic!("unexpected {err:?}");
    };
    assert_eq!(error.kind, ErrorKind::ConstraintViolation);
    assert_eq!(error.operation_index, Some(2));

    handle.shutdown().await.expect("shutdown");
    assert_eq!(site.count("tasks"), 0);
    assert_eq!(site.log_status(&request_id).as_deref(), Some("ERROR"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn slow_request_is_interrupted_and_reported_as_timeout() {
    let site = Site::new();
    let conn = Connection::open(&site.db).expect("conn");
    conn.create_scalar_function("sleep_ms", 1, FunctionFlags::SQLITE_UTF8, |ctx| {
        let ms: i64 = ctx.get(0)?;
        thread::sleep(Duration::from_millis(ms as u64));
        Ok(ms)
    })
    .expect("register sleep_ms");
    let store = SqliteStore::from_connection(conn).expect("store");
    let ticks: Vec<String> = (1..=50).map(|n| format!("({n})")).collect();
    store.apply_schema(SCHEMA).expect("schema");
    store
        .apply_schema(&format!(
            "CREATE TABLE ticks (n INTEGER);
             INSERT INTO ticks VALUES {};
             CREATE TRIGGER slow_notes AFTER INSERT ON notes BEGIN SELECT sleep_ms(20) FROM ticks; END;",
            ticks.join(", ")
        ))
        .expect("slow trigger");

    let config = ProcessorConfig {
        request_timeout: Duration::from_millis(200),
        ..processor_config()
    };
    let handle = site.spawn_with(Box::new(store), site.responses.clone(), config);
    let client = site.client(client_config());

    let request = insert_note("slow");
    let started = std::time::Instant::now();
    let err = client.execute(request.clone()).await.expect_err("must time out");
    assert!(started.elapsed() < Duration::from_millis(900), "{:?}", started.elapsed());
    let ClientError::Failed { error, .. } = err else {
        panic!("unexpected {err:?}");
    };
    assert_eq!(error.kind, ErrorKind::Timeout);
    assert_eq!(handle.stats().timed_out, 1);

    handle.shutdown().await.expect("shutdown");
    assert_eq!(site.count("notes"), 0);
    assert_eq!(site.log_status(&request.request_id).as_deref(), Some("ERROR"));
}

/// Swallows the first response it is asked to publish.
struct LossyMailbox {
    inner: Arc<DirMailbox>,
    dropped: AtomicBool,
}

impl Mailbox for LossyMailbox {
    fn publish(&self, id: &str, body: &[u8]) -> ChannelResult<()> {
        if !self.dropped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.publish(id, body)
    }
    fn poll(&self) -> ChannelResult<Vec<Entry>> {
        self.inner.poll()
    }
    fn claim(&self, entry: &Entry) -> ChannelResult<ClaimOutcome> {
        self.inner.claim(entry)
    }
    fn read(&self, claim: &Claim) -> ChannelResult<Vec<u8>> {
        self.inner.read(claim)
    }
    fn ack(&self, claim: Claim) -> ChannelResult<()> {
        self.inner.ack(claim)
    }
    fn requeue(&self, claim: Claim) -> ChannelResult<()> {
        self.inner.requeue(claim)
    }
    fn claims(&self) -> ChannelResult<Vec<Claim>> {
        self.inner.claims()
    }
    fn sweep(&self, cutoff: SystemTime) -> ChannelResult<usize> {
        self.inner.sweep(cutoff)
    }
    fn sweep_claims(&self, cutoff: SystemTime) -> ChannelResult<usize> {
        self.inner.sweep_claims(cutoff)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn lost_response_leads_to_resubmission_and_a_second_execution() {
    let site = Site::new();
    let lossy = Arc::new(LossyMailbox {
        inner: site.responses.clone(),
        dropped: AtomicBool::new(false),
    });
    let handle = site.spawn_with(Box::new(site.store()), lossy, processor_config());
    let client = site.client(ClientConfig {
        request_timeout: Duration::from_millis(300),
        retry_attempts: 2,
        ..client_config()
    });

    let inserted = client
        .insert("notes", row(json!({"body": "at least once"})))
        .await
        .expect("second attempt answers");
    assert_eq!(inserted, Some(2));

    handle.shutdown().await.expect("shutdown");
    assert_eq!(site.count("notes"), 2);
    assert!(site.requests.poll().expect("poll").is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn client_gives_up_and_withdraws_when_nobody_answers() {
    let site = Site::new();
    let client = site.client(ClientConfig {
        request_timeout: Duration::from_millis(50),
        retry_attempts: 2,
        ..client_config()
    });

    let err = client.execute(insert_note("nobody home")).await.expect_err("no processor");
    let ClientError::NoResponse { attempts, last_request_id } = err else {
        panic!("unexpected {err:?}");
    };
    assert_eq!(attempts, 3);
    assert!(last_request_id.contains("_resubmit_"), "{last_request_id}");
    assert!(site.requests.poll().expect("poll").is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stuck_claim_is_requeued_and_then_processed() {
    let site = Site::new();
    let request = insert_note("orphaned");
    site.strand(&request, 0, Duration::from_secs(600));

    let handle = site.spawn(processor_config());
    let response = wait_response(&site.responses, &request.request_id).await;
    assert!(response.success);
    eventually("requeue counted", || handle.stats().requeued == 1).await;

    handle.shutdown().await.expect("shutdown");
    assert_eq!(site.count("notes"), 1);
    assert!(site.requests.claims().expect("claims").is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn committed_but_unanswered_request_replays_its_logged_result() {
    let site = Site::new();
    let request = insert_note("committed once");
    {
        let mut store = site.store();
        execute_request(&mut store, &request, Deadline::none()).expect("first execution");
    }
    site.strand(&request, 0, Duration::from_secs(600));

    let handle = site.spawn(processor_config());
    let response = wait_response(&site.responses, &request.request_id).await;
    assert!(response.success);
    assert_eq!(response.data.expect("data")["inserted_id"], 1);
    assert_eq!(handle.stats().replayed, 1);

    handle.shutdown().await.expect("shutdown");
    assert_eq!(site.count("notes"), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn claim_stuck_twice_is_abandoned_with_timeout() {
    let site = Site::new();
    let never_ran = insert_note("stuck twice");
    let already_committed = insert_note("committed before crash");
    {
        let mut store = site.store();
        execute_request(&mut store, &already_committed, Deadline::none()).expect("commit");
    }
    site.strand(&never_ran, 1, Duration::from_secs(600));
    site.strand(&already_committed, 1, Duration::from_secs(600));

    let handle = site.spawn(processor_config());
    let failed = wait_response(&site.responses, &never_ran.request_id).await;
    assert_eq!(failed.error_kind(), Some(ErrorKind::Timeout));
    let answered = wait_response(&site.responses, &already_committed.request_id).await;
    assert!(answered.success);
    eventually("abandons counted", || handle.stats().abandoned == 2).await;

    handle.shutdown().await.expect("shutdown");
    assert_eq!(site.count("notes"), 1);
    assert_eq!(site.log_status(&never_ran.request_id).as_deref(), Some("ERROR"));
    assert_eq!(site.log_status(&already_committed.request_id).as_deref(), Some("SUCCESS"));
}

struct BrokenMailbox;

impl BrokenMailbox {
    fn fail<T>() -> ChannelResult<T> {
        Err(ChannelError::Io {
            path: PathBuf::from("/unreachable/share"),
            source: std::io::Error::other("share offline"),
        })
    }
}

impl Mailbox for BrokenMailbox {
    fn publish(&self, _id: &str, _body: &[u8]) -> ChannelResult<()> {
        Self::fail()
    }
    fn poll(&self) -> ChannelResult<Vec<Entry>> {
        Self::fail()
    }
    fn claim(&self, _entry: &Entry) -> ChannelResult<ClaimOutcome> {
        Self::fail()
    }
    fn read(&self, _claim: &Claim) -> ChannelResult<Vec<u8>> {
        Self::fail()
    }
    fn ack(&self, _claim: Claim) -> ChannelResult<()> {
        Self::fail()
    }
    fn requeue(&self, _claim: Claim) -> ChannelResult<()> {
        Self::fail()
    }
    fn claims(&self) -> ChannelResult<Vec<Claim>> {
        Self::fail()
    }
    fn sweep(&self, _cutoff: SystemTime) -> ChannelResult<usize> {
        Self::fail()
    }
    fn sweep_claims(&self, _cutoff: SystemTime) -> ChannelResult<usize> {
        Self::fail()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unusable_request_mailbox_stops_the_processor() {
    let site = Site::new();
    let config = ProcessorConfig {
        poll_interval: Duration::from_millis(5),
        max_channel_failures: 3,
        ..processor_config()
    };
    let handle = Processor::new(Box::new(site.store()), Arc::new(BrokenMailbox), site.responses.clone(), config)
        .spawn()
        .expect("spawn");

    let error = tokio::time::timeout(Duration::from_secs(5), handle.stopped())
        .await
        .expect("processor stops");
    assert!(error.expect("fatal error").contains("share offline"));
    assert_eq!(handle.stats().channel_failures, 3);
    assert!(matches!(handle.shutdown().await, Err(ProcessorError::ChannelFailed(_))));
}

#[derive(Default)]
struct RecordingHook {
    seen: Mutex<Vec<String>>,
}

impl NotificationHook for RecordingHook {
    fn on_commit(&self, request: &Request, data: &Value) -> Result<(), HookError> {
        assert!(data.get("rows_affected").is_some());
        self.seen.lock().expect("lock").push(request.request_id.clone());
        Err("downstream unavailable".into())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn hook_runs_only_for_committed_mutations() {
    let site = Site::new();
    let hook = Arc::new(RecordingHook::default());
    let handle = Processor::new(
        Box::new(site.store()),
        site.requests.clone(),
        site.responses.clone(),
        processor_config(),
    )
    .with_hook(hook.clone())
    .spawn()
    .expect("spawn");
    let client = site.client(client_config());

    let committed = insert_note("notify me");
    client.execute(committed.clone()).await.expect("insert succeeds despite hook failure");
    let op = Operation::Insert {
        table: "tasks".to_string(),
        values: row(json!({"task_id": 1})),
    };
    client
        .execute(single_request("site-a", op, Metadata::new()).expect("request"))
        .await
        .expect_err("title is required");
    client.find_all("notes", Row::new()).await.expect("query");

    handle.shutdown().await.expect("shutdown");
    assert_eq!(*hook.seen.lock().expect("lock"), vec![committed.request_id]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn bursts_beyond_admission_capacity_are_all_answered() {
    let site = Site::new();
    let handle = site.spawn(ProcessorConfig {
        max_concurrent_requests: 2,
        max_queued_requests: 3,
        ..processor_config()
    });
    let client = site.client(client_config());

    let mut tasks = tokio::task::JoinSet::new();
    for n in 0..20 {
        let client = client.clone();
        tasks.spawn(async move {
            client
                .insert("tasks", row(json!({"task_id": n, "title": format!("t{n}")})))
                .await
        });
    }
    while let Some(joined) = tasks.join_next().await {
        joined.expect("join").expect("insert");
    }

    assert_eq!(handle.in_flight(), 0);
    assert_eq!(handle.stats().claimed, 20);
    handle.shutdown().await.expect("shutdown");
    assert_eq!(site.count("tasks"), 20);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sweep_removes_unconsumed_responses_past_retention() {
    let site = Site::new();
    let stale = insert_note("stale");
    let fresh = insert_note("fresh");
    for request in [&stale, &fresh] {
        let response = Response::success(&request.request_id, "site-a", json!({"rows_affected": 1}));
        site.responses.publish(&request.request_id, &response.encode()).expect("publish");
    }
    set_age(
        &site.responses.root().join(format!("{}.json", stale.request_id)),
        Duration::from_secs(7_200),
    );

    let handle = site.spawn(processor_config());
    let report = handle.sweep_now().await.expect("sweep");
    assert_eq!(report.requeued + report.abandoned, 0);

    let left: Vec<String> = site
        .responses
        .poll()
        .expect("poll")
        .into_iter()
        .map(|e| e.id)
        .collect();
    assert_eq!(left, vec![fresh.request_id]);
    handle.shutdown().await.expect("shutdown");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sweep_drops_responses_left_claimed_by_a_dead_client() {
    let site = Site::new();
    let orphaned = insert_note("orphaned response");
    let reading = insert_note("being read");
    for request in [&orphaned, &reading] {
        let response = Response::success(&request.request_id, "site-a", json!({"rows_affected": 1}));
        site.responses.publish(&request.request_id, &response.encode()).expect("publish");
        take_claim(&site.responses, &request.request_id).expect("claim");
    }
    set_age(
        &site.responses.root().join(".processing").join(format!("{}.json", orphaned.request_id)),
        Duration::from_secs(86_400),
    );

    let handle = site.spawn(ProcessorConfig {
        retention: Duration::from_secs(60),
        ..processor_config()
    });
    handle.sweep_now().await.expect("sweep");

    let held: Vec<String> = site
        .responses
        .claims()
        .expect("claims")
        .into_iter()
        .map(|c| c.id)
        .collect();
    assert_eq!(held, vec![reading.request_id]);
    handle.shutdown().await.expect("shutdown");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn zero_intervals_are_refused_at_spawn() {
    let site = Site::new();
    for config in [
        ProcessorConfig {
            poll_interval: Duration::ZERO,
            ..processor_config()
        },
        ProcessorConfig {
            cleanup_interval: Duration::ZERO,
            ..processor_config()
        },
        ProcessorConfig {
            max_concurrent_requests: 0,
            ..processor_config()
        },
    ] {
        let spawned = Processor::new(Box::new(site.store()), site.requests.clone(), site.responses.clone(), config).spawn();
        assert!(matches!(spawned, Err(ProcessorError::Config(_))));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn undecodable_response_is_left_in_the_mailbox() {
    let site = Site::new();
    let request = insert_note("garbled answer");
    site.responses
        .publish(&request.request_id, b"{not a response")
        .expect("publish");
    let client = site.client(ClientConfig {
        request_timeout: Duration::from_millis(200),
        ..client_config()
    });

    let err = client.submit(request.clone()).await.expect_err("garbage response");
    let ClientError::Decode { request_id, .. } = err else {
        panic!("unexpected {err:?}");
    };
    assert_eq!(request_id, request.request_id);

    let ready: Vec<String> = site
        .responses
        .poll()
        .expect("poll")
        .into_iter()
        .map(|e| e.id)
        .collect();
    assert_eq!(ready, vec![request.request_id]);
    assert!(site.responses.claims().expect("claims").is_empty());
}

/// Store double that works in 10 ms slices per operation on `slow` and checks
/// its deadline between slices.
struct SlicedStore {
    applied: Arc<Mutex<Vec<String>>>,
}

impl Store for SlicedStore {
    fn apply(&mut self, info: RequestInfo<'_>, ops: &[Operation], deadline: Deadline) -> StoreResult<Applied> {
        for _ in ops.iter().filter(|op| op.table() == "slow") {
            for _ in 0..50 {
                deadline.check()?;
                thread::sleep(Duration::from_millis(10));
            }
        }
        self.applied.lock().expect("lock").push(info.request_id.to_string());
        Ok(Applied {
            results: ops
                .iter()
                .enumerate()
                .map(|(i, op)| OperationResult {
                    operation_index: i + 1,
                    op_type: op.op_type(),
                    table: op.table().to_string(),
                    rows_affected: 1,
                    inserted_id: None,
                })
                .collect(),
            replayed: false,
        })
    }

    fn select(&mut self, _query: &Query, _deadline: Deadline) -> StoreResult<Vec<Row>> {
        Ok(Vec::new())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn store_without_interrupt_support_times_out_at_its_next_deadline_check() {
    let site = Site::new();
    let applied = Arc::new(Mutex::new(Vec::new()));
    let store = SlicedStore {
        applied: applied.clone(),
    };
    let handle = site.spawn_with(
        Box::new(store),
        site.responses.clone(),
        ProcessorConfig {
            max_concurrent_requests: 1,
            request_timeout: Duration::from_millis(100),
            ..processor_config()
        },
    );
    let client = site.client(client_config());

    let slow = client.insert("slow", row(json!({"n": 1})));
    let fast = client.insert("fast", row(json!({"n": 2})));
    let (slow, fast) = tokio::join!(slow, fast);

    let Err(ClientError::Failed { error, .. }) = slow else {
        panic!("unexpected {slow:?}");
    };
    assert_eq!(error.kind, ErrorKind::Timeout);
    fast.expect("fast insert succeeds");

    handle.shutdown().await.expect("shutdown");
    assert_eq!(applied.lock().expect("lock").len(), 1);
}
