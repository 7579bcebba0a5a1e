//! Integration tests for the worker websocket protocol.
//!
//! Each test spins up the worker Axum router on a random port, connects via
//! tokio-tungstenite, and exercises the real wire contract.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use dispatch_router::auth::StoreAuthGate;
use dispatch_router::router::{RouterState, Scheduler, poll_once, worker_routes};
use dispatch_router::store::{Database, LibSqlBackend, MemoryStore};
use dispatch_router::task::Task;

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Long enough that heartbeats never fire unless a test asks for them.
const QUIET_HEARTBEAT: Duration = Duration::from_secs(60);

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Harness {
    port: u16,
    scheduler: Arc<Scheduler>,
    store: Arc<dyn Database>,
    shutdown: watch::Sender<bool>,
}

/// Start the worker websocket server on a random port.
async fn start_router(store: Arc<dyn Database>, heartbeat: Duration) -> Harness {
    let scheduler = Arc::new(Scheduler::new(Arc::clone(&store), 10.0));
    let (shutdown, shutdown_rx) = watch::channel(false);
    let state = RouterState {
        scheduler: Arc::clone(&scheduler),
        auth: Arc::new(StoreAuthGate::new(Arc::clone(&store))),
        store: Arc::clone(&store),
        heartbeat_interval: heartbeat,
        drain_timeout: Duration::from_secs(30),
        shutdown: shutdown_rx,
    };
    let app = worker_routes(state);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Give the server a moment to start accepting connections.
    tokio::time::sleep(Duration::from_millis(50)).await;

    Harness {
        port,
        scheduler,
        store,
        shutdown,
    }
}

/// Memory store with token `tok` for user 5.
fn seeded_store() -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    store.insert_auth_token("tok", 5, Utc::now() + chrono::Duration::hours(1));
    store
}

async fn open(port: u16) -> Ws {
    let (ws, _resp) = connect_async(format!("ws://127.0.0.1:{port}/ws"))
        .await
        .expect("WS connect failed");
    ws
}

async fn send(ws: &mut Ws, frame: &str) {
    ws.send(Message::Text(frame.into())).await.unwrap();
}

/// Next text frame, skipping control frames.
async fn next_text(ws: &mut Ws) -> String {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(txt))) => return txt.as_str().to_string(),
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            other => panic!("expected text frame, got {other:?}"),
        }
    }
}

/// Read until the server closes the socket. Returns text frames seen on the way.
async fn read_until_closed(ws: &mut Ws) -> Vec<String> {
    let mut texts = Vec::new();
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(txt))) => texts.push(txt.as_str().to_string()),
            Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return texts,
            Some(Ok(_)) => continue,
        }
    }
}

/// Connect and authenticate as `worker_id`, expecting acceptance.
async fn connect_worker(port: u16, worker_id: i64) -> Ws {
    let mut ws = open(port).await;
    send(&mut ws, &format!("1 Bearer tok {worker_id}")).await;
    assert_eq!(next_text(&mut ws).await, "1");
    ws
}

async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    while !check().await {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn worker_count(scheduler: &Scheduler) -> usize {
    scheduler.stats().await.workers
}

// ── Handshake ────────────────────────────────────────────────────────

#[tokio::test]
async fn auth_is_acknowledged() {
    timeout(TEST_TIMEOUT, async {
        let store = seeded_store();
        let worker_id = store.register_worker(5, 2, true);
        let h = start_router(store.clone(), QUIET_HEARTBEAT).await;

        let _ws = connect_worker(h.port, worker_id).await;

        let stats = h.scheduler.stats().await;
        assert_eq!(stats.workers, 1);
        assert_eq!(stats.threads, 2);
        assert!(store.get_worker(worker_id).unwrap().connect_ts.is_some());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn bad_token_is_rejected_and_closed() {
    timeout(TEST_TIMEOUT, async {
        let store = seeded_store();
        let worker_id = store.register_worker(5, 2, true);
        let h = start_router(store, QUIET_HEARTBEAT).await;

        let mut ws = open(h.port).await;
        send(&mut ws, &format!("1 Bearer wrong {worker_id}")).await;

        assert_eq!(read_until_closed(&mut ws).await, vec!["8".to_string()]);
        assert_eq!(worker_count(&h.scheduler).await, 0);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn foreign_worker_id_is_rejected() {
    timeout(TEST_TIMEOUT, async {
        let store = seeded_store();
        let someone_elses = store.register_worker(7, 2, true);
        let h = start_router(store, QUIET_HEARTBEAT).await;

        let mut ws = open(h.port).await;
        send(&mut ws, &format!("1 Bearer tok {someone_elses}")).await;

        assert_eq!(read_until_closed(&mut ws).await, vec!["9".to_string()]);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn worker_id_cannot_be_claimed_twice() {
    timeout(TEST_TIMEOUT, async {
        let store = seeded_store();
        let worker_id = store.register_worker(5, 2, true);
        let h = start_router(store, QUIET_HEARTBEAT).await;

        let _first = connect_worker(h.port, worker_id).await;
        let mut second = open(h.port).await;
        send(&mut second, &format!("1 tok {worker_id}")).await;

        assert_eq!(read_until_closed(&mut second).await, vec!["9".to_string()]);
        assert_eq!(worker_count(&h.scheduler).await, 1);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn malformed_frames_do_not_close_the_socket() {
    timeout(TEST_TIMEOUT, async {
        let store = seeded_store();
        let worker_id = store.register_worker(5, 1, false);
        let h = start_router(store, QUIET_HEARTBEAT).await;

        let mut ws = open(h.port).await;
        send(&mut ws, "not a message").await;
        send(&mut ws, "3 abc").await;
        ws.send(Message::Binary(vec![0xffu8, 0x00].into())).await.unwrap();
        // Task report before AUTH is ignored too.
        send(&mut ws, "3 1").await;

        send(&mut ws, &format!("1 tok {worker_id}")).await;
        assert_eq!(next_text(&mut ws).await, "1");
    })
    .await
    .expect("test timed out");
}

// ── Task lifecycle ───────────────────────────────────────────────────

#[tokio::test]
async fn polled_task_is_sent_and_completion_persisted() {
    timeout(TEST_TIMEOUT, async {
        let store = seeded_store();
        let worker_id = store.register_worker(5, 2, false);
        let data = r#"{"text": "hello world", "n": [1, 2]}"#;
        let task_id = store.insert_task(Task::new(0, "fnA", 5, data));
        let h = start_router(store.clone(), QUIET_HEARTBEAT).await;

        let mut ws = connect_worker(h.port, worker_id).await;
        let report = poll_once(h.store.as_ref(), &h.scheduler).await.unwrap();
        assert_eq!(report.assigned, 1);

        assert_eq!(next_text(&mut ws).await, format!("5 {task_id} fnA {data}"));

        send(&mut ws, &format!("2 {task_id}")).await;
        send(&mut ws, &format!("3 {task_id}")).await;
        // Duplicate report is ignored.
        send(&mut ws, &format!("3 {task_id}")).await;

        let scheduler = Arc::clone(&h.scheduler);
        eventually(|| {
            let scheduler = Arc::clone(&scheduler);
            let store = store.clone();
            async move {
                scheduler.flush().await;
                store.done_writes(task_id) == 1
            }
        })
        .await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        h.scheduler.flush().await;
        assert_eq!(store.done_writes(task_id), 1);
        let stored = store.get_task(task_id).unwrap();
        assert!(stored.task.start_ts.is_some());
        assert!(stored.task.end_ts.is_some());
        assert_eq!(h.scheduler.stats().await.tasks, 0);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn disconnect_moves_tasks_to_another_worker() {
    timeout(TEST_TIMEOUT, async {
        let store = seeded_store();
        let first = store.register_worker(5, 4, false);
        let second = store.register_worker(5, 4, false);
        let h = start_router(store.clone(), QUIET_HEARTBEAT).await;

        let mut ws1 = connect_worker(h.port, first).await;
        let ids: Vec<i64> = (0..3)
            .map(|i| store.insert_task(Task::new(0, "fnA", 5, format!("job {i}"))))
            .collect();
        poll_once(h.store.as_ref(), &h.scheduler).await.unwrap();
        for _ in &ids {
            assert!(next_text(&mut ws1).await.starts_with("5 "));
        }

        let mut ws2 = connect_worker(h.port, second).await;
        ws1.close(None).await.unwrap();

        let mut resent = Vec::new();
        for _ in &ids {
            let frame = next_text(&mut ws2).await;
            let task_id: i64 = frame.split(' ').nth(1).unwrap().parse().unwrap();
            resent.push(task_id);
        }
        assert_eq!(resent, ids);

        let scheduler = Arc::clone(&h.scheduler);
        eventually(|| {
            let scheduler = Arc::clone(&scheduler);
            async move { worker_count(&scheduler).await == 1 }
        })
        .await;
        h.scheduler.flush().await;
        let stored = store.get_worker(first).unwrap();
        assert!(stored.connect_ts.is_none());
        assert!(stored.last_seen_ts.is_some());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn clear_queue_closes_after_last_task() {
    timeout(TEST_TIMEOUT, async {
        let store = seeded_store();
        let worker_id = store.register_worker(5, 1, false);
        let task_id = store.insert_task(Task::new(0, "fnA", 5, "{}"));
        let h = start_router(store.clone(), QUIET_HEARTBEAT).await;

        let mut ws = connect_worker(h.port, worker_id).await;
        poll_once(h.store.as_ref(), &h.scheduler).await.unwrap();
        next_text(&mut ws).await;

        send(&mut ws, &format!("2 {task_id}")).await;
        send(&mut ws, "0").await;
        send(&mut ws, &format!("3 {task_id}")).await;

        assert!(read_until_closed(&mut ws).await.is_empty());
        let scheduler = Arc::clone(&h.scheduler);
        eventually(|| {
            let scheduler = Arc::clone(&scheduler);
            async move { worker_count(&scheduler).await == 0 }
        })
        .await;
        h.scheduler.flush().await;
        assert_eq!(store.done_writes(task_id), 1);
    })
    .await
    .expect("test timed out");
}

// ── Liveness and shutdown ────────────────────────────────────────────

#[tokio::test]
async fn silent_worker_is_dropped_after_missed_heartbeat() {
    timeout(TEST_TIMEOUT, async {
        let store = seeded_store();
        let worker_id = store.register_worker(5, 1, false);
        let h = start_router(store, Duration::from_millis(100)).await;

        // Never read again, so pings go unanswered.
        let _ws = connect_worker(h.port, worker_id).await;
        assert_eq!(worker_count(&h.scheduler).await, 1);

        let scheduler = Arc::clone(&h.scheduler);
        eventually(|| {
            let scheduler = Arc::clone(&scheduler);
            async move { worker_count(&scheduler).await == 0 }
        })
        .await;
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn responsive_worker_survives_heartbeats() {
    timeout(TEST_TIMEOUT, async {
        let store = seeded_store();
        let worker_id = store.register_worker(5, 1, false);
        let h = start_router(store, Duration::from_millis(100)).await;

        let mut ws = connect_worker(h.port, worker_id).await;
        // Reading lets the client answer pings.
        let _ = timeout(Duration::from_millis(500), async {
            while let Some(Ok(_)) = ws.next().await {}
        })
        .await;

        assert_eq!(worker_count(&h.scheduler).await, 1);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn shutdown_sends_reset() {
    timeout(TEST_TIMEOUT, async {
        let store = seeded_store();
        let worker_id = store.register_worker(5, 1, false);
        let h = start_router(store, QUIET_HEARTBEAT).await;

        let mut ws = connect_worker(h.port, worker_id).await;
        h.shutdown.send(true).unwrap();

        assert_eq!(read_until_closed(&mut ws).await, vec!["7".to_string()]);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn shutdown_returns_running_tasks_to_backlog() {
    timeout(TEST_TIMEOUT, async {
        let store = seeded_store();
        let first = store.register_worker(5, 1, false);
        let second = store.register_worker(5, 1, false);
        let task_id = store.insert_task(Task::new(0, "fnA", 5, "{}"));
        let h = start_router(store.clone(), QUIET_HEARTBEAT).await;

        let mut ws1 = connect_worker(h.port, first).await;
        poll_once(h.store.as_ref(), &h.scheduler).await.unwrap();
        next_text(&mut ws1).await;
        let mut ws2 = connect_worker(h.port, second).await;
        send(&mut ws1, &format!("2 {task_id}")).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        h.shutdown.send(true).unwrap();
        assert_eq!(read_until_closed(&mut ws1).await, vec!["7".to_string()]);
        assert_eq!(read_until_closed(&mut ws2).await, vec!["7".to_string()]);

        let scheduler = Arc::clone(&h.scheduler);
        eventually(|| {
            let scheduler = Arc::clone(&scheduler);
            async move { worker_count(&scheduler).await == 0 }
        })
        .await;
        h.scheduler.flush().await;

        assert_eq!(store.failed_writes(task_id), 0);
        let stored = store.get_task(task_id).unwrap();
        assert!(!stored.task.failed);
        assert_eq!(stored.worker_id, None);
        let pending = store.fetch_pending_tasks().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].task_id, task_id);
        assert!(store.get_worker(first).unwrap().connect_ts.is_none());
    })
    .await
    .expect("test timed out");
}

// ── libSQL end to end ────────────────────────────────────────────────

#[tokio::test]
async fn libsql_backlog_roundtrip() {
    timeout(TEST_TIMEOUT, async {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        db.insert_auth_token("tok", 5, Utc::now() + chrono::Duration::hours(1))
            .await
            .unwrap();
        db.insert_function("fnA", 5, "resize", false, false)
            .await
            .unwrap();
        let worker_id = db.register_worker(5, 2, false).await.unwrap();
        let task_id = db.submit_task("fnA", "payload with spaces").await.unwrap();
        let h = start_router(db.clone(), QUIET_HEARTBEAT).await;

        let mut ws = connect_worker(h.port, worker_id).await;
        poll_once(h.store.as_ref(), &h.scheduler).await.unwrap();
        assert_eq!(
            next_text(&mut ws).await,
            format!("5 {task_id} fnA payload with spaces")
        );

        send(&mut ws, &format!("4 {task_id}")).await;
        let scheduler = Arc::clone(&h.scheduler);
        let reader = db.clone();
        eventually(|| {
            let scheduler = Arc::clone(&scheduler);
            let reader = reader.clone();
            async move {
                scheduler.flush().await;
                reader
                    .get_task(task_id)
                    .await
                    .unwrap()
                    .is_some_and(|t| t.task.failed)
            }
        })
        .await;

        let stored = db.get_task(task_id).await.unwrap().unwrap();
        assert_eq!(stored.worker_id, Some(worker_id));
        assert!(db.fetch_pending_tasks().await.unwrap().is_empty());
    })
    .await
    .expect("test timed out");
}
