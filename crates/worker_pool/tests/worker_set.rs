use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::join_all;
use serde_json::{Value, json};
use tokio::sync::{Semaphore, mpsc};
use worker_pool::{
    ConcurrentWorkerSet, Envelope, PoolError, RequestToken, ThreadLauncher, WorkerChannel,
    WorkerEvent, WorkerLauncher, WorkerMessage, WorkerScope, WorkerSetOptions,
};

const SCRIPT: &str = "echo-worker";
const SERVICE: &str = "echo";

struct Recorder {
    next_worker: AtomicUsize,
    exited: AtomicUsize,
    /// (worker, message id, request) in arrival order
    requests: Mutex<Vec<(usize, u64, Value)>>,
    messages: Mutex<Vec<(usize, WorkerMessage)>>,
    gate: Semaphore,
}

impl Recorder {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            next_worker: AtomicUsize::new(0),
            exited: AtomicUsize::new(0),
            requests: Mutex::default(),
            messages: Mutex::default(),
            gate: Semaphore::new(0),
        })
    }

    fn request_order(&self) -> Vec<i64> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|(_, _, request)| request["n"].as_i64().unwrap_or(-1))
            .collect()
    }

    fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

async fn echo_worker(mut scope: WorkerScope, recorder: Arc<Recorder>) {
    let id = recorder.next_worker.fetch_add(1, Ordering::SeqCst);
    scope.initialized(SERVICE);

    while let Some(Envelope { message, transfer }) = scope.recv().await {
        let WorkerMessage::Request {
            service,
            message_id,
            request,
        } = message
        else {
            recorder.messages.lock().unwrap().push((id, message));
            continue;
        };

        recorder
            .requests
            .lock()
            .unwrap()
            .push((id, message_id, request.clone()));

        if request.get("gate").is_some() {
            recorder.gate.acquire().await.unwrap().forget();
        }
        if request.get("exit").is_some() {
            break;
        }
        if let Some(service) = request.get("announce").and_then(Value::as_str) {
            scope.initialized(service);
        }
        if let Some(text) = request.get("log") {
            scope.log(4, text.clone());
        }
        if let Some(value) = request.get("emit") {
            scope.post(WorkerMessage::Event {
                service: service.clone(),
                payload: json!({"type": "progress", "value": value}),
            });
        }
        if let Some(reason) = request.get("fail").and_then(Value::as_str) {
            scope.post(WorkerMessage::reply_error(
                service,
                message_id,
                reason,
                Some("at echo_worker".to_string()),
            ));
        } else {
            scope.post_with_transfer(
                WorkerMessage::reply(service, message_id, json!({"worker": id, "echo": request})),
                transfer,
            );
        }
    }

    recorder.exited.fetch_add(1, Ordering::SeqCst);
}

fn echo_launcher(recorder: &Arc<Recorder>) -> ThreadLauncher {
    let recorder = Arc::clone(recorder);
    ThreadLauncher::new().with_script(SCRIPT, move |scope| echo_worker(scope, Arc::clone(&recorder)))
}

fn options(workers: usize) -> WorkerSetOptions {
    WorkerSetOptions::new(SCRIPT).with_worker_count(workers)
}

async fn started(workers: usize) -> (ConcurrentWorkerSet, Arc<Recorder>) {
    let recorder = Recorder::new();
    let set = ConcurrentWorkerSet::new(options(workers), echo_launcher(&recorder));
    set.connect(SERVICE).await.expect("workers should connect");
    (set, recorder)
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn connect_launches_every_worker() {
    let recorder = Recorder::new();
    let launcher = echo_launcher(&recorder);
    let set = ConcurrentWorkerSet::new(options(3), launcher.clone());

    set.connect(SERVICE).await.unwrap();

    assert_eq!(launcher.spawned(), 3);
    assert_eq!(recorder.next_worker.load(Ordering::SeqCst), 3);
    assert_eq!(set.worker_count(), 3);
}

#[tokio::test]
async fn request_round_trip_keeps_transfer() {
    let (set, _recorder) = started(2).await;

    let reply = set
        .invoke_request(
            SERVICE,
            json!({"n": 1}),
            vec![Bytes::from_static(b"tile")],
            None,
        )
        .await
        .unwrap();

    assert_eq!(reply.value["echo"], json!({"n": 1}));
    assert_eq!(reply.transfer, vec![Bytes::from_static(b"tile")]);
}

#[tokio::test]
async fn remote_error_carries_stack() {
    let (set, _recorder) = started(1).await;

    let err = set
        .invoke_request(SERVICE, json!({"fail": "bad tile"}), Vec::new(), None)
        .await
        .unwrap_err();

    assert_eq!(err.to_string(), "bad tile");
    assert_eq!(err.remote_stack(), Some("at echo_worker"));
}

#[tokio::test]
async fn idle_worker_is_reused_lifo() {
    let (set, recorder) = started(3).await;

    for n in 0..3 {
        set.invoke_request(SERVICE, json!({"n": n}), Vec::new(), None)
            .await
            .unwrap();
    }

    let workers: Vec<usize> = recorder
        .requests
        .lock()
        .unwrap()
        .iter()
        .map(|(worker, _, _)| *worker)
        .collect();
    assert_eq!(workers[0], workers[1]);
    assert_eq!(workers[1], workers[2]);
}

#[tokio::test]
async fn queued_requests_drain_in_submission_order() {
    let (set, recorder) = started(1).await;

    let requests = (0..5).map(|n| {
        let request = if n == 0 {
            json!({"n": n, "gate": true})
        } else {
            json!({"n": n})
        };
        set.invoke_request(SERVICE, request, Vec::new(), None)
    });

    let (results, _) = tokio::join!(join_all(requests), async {
        wait_until(|| recorder.request_count() == 1).await;
        recorder.gate.add_permits(1);
    });

    assert!(results.iter().all(Result::is_ok));
    assert_eq!(recorder.request_order(), vec![0, 1, 2, 3, 4]);
}

#[tokio::test]
async fn explicit_priority_jumps_the_queue() {
    let (set, recorder) = started(1).await;

    let requests = (0..5).map(|n| {
        let token = (n == 3).then(|| RequestToken::with_priority(100));
        let request = if n == 0 {
            json!({"n": n, "gate": true})
        } else {
            json!({"n": n})
        };
        set.invoke_request(SERVICE, request, Vec::new(), token)
    });

    let (results, _) = tokio::join!(join_all(requests), async {
        wait_until(|| recorder.request_count() == 1).await;
        recorder.gate.add_permits(1);
    });

    assert!(results.iter().all(Result::is_ok));
    assert_eq!(recorder.request_order(), vec![0, 3, 1, 2, 4]);
}

#[tokio::test]
async fn aborted_token_never_reaches_a_worker() {
    let (set, recorder) = started(1).await;

    let token = RequestToken::new();
    token.abort();
    let err = set
        .invoke_request(SERVICE, json!({"n": 1}), Vec::new(), Some(token))
        .await
        .unwrap_err();

    assert_eq!(err, PoolError::Aborted);
    assert_eq!(recorder.request_count(), 0);
}

#[tokio::test]
async fn cancelling_a_queued_request_skips_it() {
    let (set, recorder) = started(1).await;
    let token = RequestToken::new();

    let busy = set.invoke_request(SERVICE, json!({"n": 0, "gate": true}), Vec::new(), None);
    let queued = set.invoke_request(SERVICE, json!({"n": 1}), Vec::new(), Some(token.clone()));
    let after = set.invoke_request(SERVICE, json!({"n": 2}), Vec::new(), None);

    let (busy, queued, after, _) = tokio::join!(busy, queued, after, async {
        wait_until(|| recorder.request_count() == 1).await;
        token.abort();
        recorder.gate.add_permits(1);
    });

    assert!(busy.is_ok());
    assert_eq!(queued.unwrap_err(), PoolError::Aborted);
    assert!(after.is_ok());
    assert_eq!(recorder.request_order(), vec![0, 2]);
}

#[tokio::test]
async fn ten_requests_on_three_workers() {
    let (set, recorder) = started(3).await;

    let results = join_all(
        (0..10).map(|n| set.invoke_request(SERVICE, json!({"n": n}), Vec::new(), None)),
    )
    .await;

    assert_eq!(results.iter().filter(|result| result.is_ok()).count(), 10);
    let mut ids: Vec<u64> = recorder
        .requests
        .lock()
        .unwrap()
        .iter()
        .map(|(_, id, _)| *id)
        .collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 10);
}

#[tokio::test]
async fn broadcast_request_answers_once_per_worker() {
    let (set, _recorder) = started(3).await;

    let replies = set
        .broadcast_request(SERVICE, json!({"n": 7}), Vec::new())
        .await
        .unwrap();

    assert_eq!(replies.len(), 3);
    let mut workers: Vec<u64> = replies
        .iter()
        .map(|reply| reply.value["worker"].as_u64().unwrap())
        .collect();
    workers.sort_unstable();
    assert_eq!(workers, vec![0, 1, 2]);
}

#[tokio::test]
async fn broadcast_message_reaches_every_worker_once() {
    let (set, recorder) = started(3).await;
    let message = WorkerMessage::Event {
        service: SERVICE.to_string(),
        payload: json!({"type": "configuration", "level": 3}),
    };

    set.broadcast_message(message.clone(), Vec::new())
        .await
        .unwrap();

    wait_until(|| recorder.messages.lock().unwrap().len() == 3).await;
    let messages = recorder.messages.lock().unwrap();
    let mut workers: Vec<usize> = messages.iter().map(|(worker, _)| *worker).collect();
    workers.sort_unstable();
    assert_eq!(workers, vec![0, 1, 2]);
    assert!(messages.iter().all(|(_, received)| *received == message));
}

#[tokio::test]
async fn event_listener_receives_service_events() {
    let (set, _recorder) = started(1).await;
    let events: Arc<Mutex<Vec<WorkerEvent>>> = Arc::default();
    let sink = Arc::clone(&events);
    set.add_event_listener(SERVICE, move |event: WorkerEvent| {
        sink.lock().unwrap().push(event);
    });

    set.invoke_request(SERVICE, json!({"emit": 42}), Vec::new(), None)
        .await
        .unwrap();

    let events = events.lock().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].payload["value"], json!(42));
}

#[tokio::test]
async fn stop_waits_for_pending_requests() {
    let (set, recorder) = started(1).await;

    let pending = tokio::spawn({
        let set = set.clone();
        async move {
            set.invoke_request(SERVICE, json!({"n": 0, "gate": true}), Vec::new(), None)
                .await
        }
    });
    wait_until(|| recorder.request_count() == 1).await;

    let stopping = tokio::spawn({
        let set = set.clone();
        async move { set.stop().await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!stopping.is_finished());
    assert_eq!(
        set.invoke_request(SERVICE, json!({"n": 1}), Vec::new(), None)
            .await
            .unwrap_err(),
        PoolError::NotStarted
    );

    recorder.gate.add_permits(1);
    assert!(pending.await.unwrap().is_ok());
    stopping.await.unwrap();
    wait_until(|| recorder.exited.load(Ordering::SeqCst) == 1).await;
}

#[tokio::test]
async fn destroy_rejects_pending_without_waiting() {
    let (set, recorder) = started(1).await;

    let pending = tokio::spawn({
        let set = set.clone();
        async move {
            set.invoke_request(SERVICE, json!({"n": 0, "gate": true}), Vec::new(), None)
                .await
        }
    });
    wait_until(|| recorder.request_count() == 1).await;

    set.destroy().await;

    assert_eq!(pending.await.unwrap().unwrap_err(), PoolError::Destroyed);
    assert_eq!(
        set.connect(SERVICE).await.unwrap_err(),
        PoolError::NotStarted
    );
    recorder.gate.add_permits(1);
}

#[tokio::test]
async fn references_stop_and_restart_the_pool() {
    let recorder = Recorder::new();
    let launcher = echo_launcher(&recorder);
    let set = ConcurrentWorkerSet::new(options(2), launcher.clone());
    set.connect(SERVICE).await.unwrap();

    set.add_reference();
    set.remove_reference();
    wait_until(|| recorder.exited.load(Ordering::SeqCst) == 2).await;
    assert_eq!(
        set.invoke_request(SERVICE, json!({}), Vec::new(), None)
            .await
            .unwrap_err(),
        PoolError::NotStarted
    );

    set.add_reference();
    set.connect(SERVICE).await.unwrap();
    assert_eq!(launcher.spawned(), 4);
    assert!(
        set.invoke_request(SERVICE, json!({}), Vec::new(), None)
            .await
            .is_ok()
    );
}

#[tokio::test]
async fn start_twice_is_rejected() {
    let (set, _recorder) = started(1).await;
    assert_eq!(set.start(None).await.unwrap_err(), PoolError::AlreadyStarted);
}

#[tokio::test]
async fn empty_pool_has_no_workers() {
    let recorder = Recorder::new();
    let set = ConcurrentWorkerSet::new(options(0), echo_launcher(&recorder));

    assert_eq!(
        set.invoke_request(SERVICE, json!({}), Vec::new(), None)
            .await
            .unwrap_err(),
        PoolError::NoWorkers
    );
}

#[tokio::test]
async fn silent_worker_times_out() {
    let launcher = ThreadLauncher::new().with_script("silent", |mut scope: WorkerScope| async move {
        while scope.recv().await.is_some() {}
    });
    let options = WorkerSetOptions::new("silent")
        .with_worker_count(1)
        .with_connection_timeout(Duration::from_millis(5));
    let set = ConcurrentWorkerSet::new(options, launcher);

    assert_eq!(
        set.connect(SERVICE).await.unwrap_err(),
        PoolError::InitializationTimeout(Duration::from_millis(5))
    );
}

#[tokio::test]
async fn unknown_script_fails_to_launch() {
    let set = ConcurrentWorkerSet::new(
        WorkerSetOptions::new("missing").with_worker_count(1),
        ThreadLauncher::new(),
    );

    let err = set.connect(SERVICE).await.unwrap_err();
    assert!(matches!(err, PoolError::LaunchFailure(_)));
}

#[tokio::test]
async fn exiting_worker_fails_its_requests() {
    let (set, _recorder) = started(1).await;

    let err = set
        .invoke_request(SERVICE, json!({"exit": true}), Vec::new(), None)
        .await
        .unwrap_err();

    assert_eq!(err, PoolError::WorkerExited(0));
    assert_eq!(
        set.invoke_request(SERVICE, json!({}), Vec::new(), None)
            .await
            .unwrap_err(),
        PoolError::NoWorkers
    );
}

#[tokio::test]
async fn explicit_zero_priority_keeps_submission_order() {
    let (set, recorder) = started(1).await;
    let zero = RequestToken::with_priority(0);

    let requests = (0..5).map(|n| {
        let token = (n == 1).then(|| zero.clone());
        let request = if n == 0 {
            json!({"n": n, "gate": true})
        } else {
            json!({"n": n})
        };
        set.invoke_request(SERVICE, request, Vec::new(), token)
    });

    let (results, _) = tokio::join!(join_all(requests), async {
        wait_until(|| recorder.request_count() == 1).await;
        recorder.gate.add_permits(1);
    });

    assert!(results.iter().all(Result::is_ok));
    assert_eq!(recorder.request_order(), vec![0, 1, 2, 3, 4]);
    // Rewritten to the negated message id of the second request.
    assert_eq!(zero.priority(), -2);
}

#[tokio::test]
async fn stop_rejects_queued_requests() {
    let (set, recorder) = started(1).await;

    let busy = tokio::spawn({
        let set = set.clone();
        async move {
            set.invoke_request(SERVICE, json!({"n": 0, "gate": true}), Vec::new(), None)
                .await
        }
    });
    wait_until(|| recorder.request_count() == 1).await;
    let queued = tokio::spawn({
        let set = set.clone();
        async move {
            set.invoke_request(SERVICE, json!({"n": 1}), Vec::new(), None)
                .await
        }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    let stopping = tokio::spawn({
        let set = set.clone();
        async move { set.stop().await }
    });

    assert_eq!(queued.await.unwrap().unwrap_err(), PoolError::NotStarted);
    recorder.gate.add_permits(1);
    assert!(busy.await.unwrap().is_ok());
    stopping.await.unwrap();
    assert_eq!(recorder.request_order(), vec![0]);
}

#[tokio::test]
async fn removed_event_listener_gets_nothing() {
    let (set, _recorder) = started(1).await;
    let events: Arc<Mutex<Vec<WorkerEvent>>> = Arc::default();
    let sink = Arc::clone(&events);
    set.add_event_listener(SERVICE, move |event: WorkerEvent| {
        sink.lock().unwrap().push(event);
    });

    set.invoke_request(SERVICE, json!({"emit": 1}), Vec::new(), None)
        .await
        .unwrap();
    set.remove_event_listener(SERVICE);
    set.invoke_request(SERVICE, json!({"emit": 2}), Vec::new(), None)
        .await
        .unwrap();

    let events = events.lock().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].payload["value"], json!(1));
}

#[derive(Clone, Default)]
struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl std::io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn worker_logs_are_reemitted_through_tracing() {
    let logs = CapturedLogs::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer({
            let logs = logs.clone();
            move || logs.clone()
        })
        .with_ansi(false)
        .with_max_level(tracing_subscriber::filter::LevelFilter::TRACE)
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let (set, _recorder) = started(1).await;
    set.invoke_request(SERVICE, json!({"log": "tile cache miss"}), Vec::new(), None)
        .await
        .unwrap();

    let line = logs
        .contents()
        .lines()
        .find(|line| line.contains("tile cache miss"))
        .map(str::to_string)
        .expect("worker log line");
    assert!(line.contains("WARN"));
    assert!(line.contains("worker:"));
}

#[tokio::test]
async fn connect_counts_only_live_workers() {
    let (set, _recorder) = started(2).await;

    let err = set
        .invoke_request(SERVICE, json!({"exit": true}), Vec::new(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::WorkerExited(_)));

    let replies = set
        .broadcast_request(SERVICE, json!({"announce": "tiles"}), Vec::new())
        .await
        .unwrap();
    assert_eq!(replies.len(), 1);

    tokio::time::timeout(Duration::from_secs(1), set.connect("tiles"))
        .await
        .expect("connect should settle")
        .unwrap();
}

#[tokio::test]
async fn released_service_waits_for_fresh_announcements() {
    let (set, _recorder) = started(1).await;
    set.broadcast_request(SERVICE, json!({"announce": "tiles"}), Vec::new())
        .await
        .unwrap();
    set.connect("tiles").await.unwrap();

    set.release_service("tiles");
    let waiting = tokio::time::timeout(Duration::from_millis(50), set.connect("tiles")).await;
    assert!(waiting.is_err());

    set.broadcast_request(SERVICE, json!({"announce": "tiles"}), Vec::new())
        .await
        .unwrap();
    set.connect("tiles").await.unwrap();
}

/// Reads one message, then stops reading while its outgoing side stays open
/// until terminated.
#[derive(Clone, Default)]
struct DeafLauncher {
    deaf: Arc<AtomicBool>,
}

impl WorkerLauncher for DeafLauncher {
    fn spawn(&self, _script_url: &str) -> Result<WorkerChannel, PoolError> {
        let (outgoing, mut from_controller) = mpsc::unbounded_channel::<Envelope>();
        let (to_controller, incoming) = mpsc::unbounded_channel();
        let _ = to_controller.send(Envelope::new(WorkerMessage::Initialized {
            service: SERVICE.to_string(),
        }));
        let deaf = Arc::clone(&self.deaf);
        tokio::spawn(async move {
            let _first = from_controller.recv().await;
            drop(from_controller);
            deaf.store(true, Ordering::SeqCst);
        });
        Ok(WorkerChannel::new(outgoing, incoming, move || drop(to_controller)))
    }
}

#[tokio::test]
async fn unreachable_worker_fails_everything_posted_to_it() {
    let launcher = DeafLauncher::default();
    let deaf = Arc::clone(&launcher.deaf);
    let set = ConcurrentWorkerSet::new(options(1), launcher);
    set.connect(SERVICE).await.unwrap();

    let broadcast = tokio::spawn({
        let set = set.clone();
        async move {
            set.broadcast_request(SERVICE, json!({"n": 0}), Vec::new())
                .await
        }
    });
    wait_until(|| deaf.load(Ordering::SeqCst)).await;

    assert_eq!(
        set.invoke_request(SERVICE, json!({"n": 1}), Vec::new(), None)
            .await
            .unwrap_err(),
        PoolError::WorkerExited(0)
    );
    let broadcast = tokio::time::timeout(Duration::from_secs(1), broadcast)
        .await
        .expect("broadcast should settle")
        .unwrap();
    assert_eq!(broadcast.unwrap_err(), PoolError::WorkerExited(0));
    assert_eq!(set.connect(SERVICE).await.unwrap_err(), PoolError::NoWorkers);
    assert_eq!(
        set.invoke_request(SERVICE, json!({"n": 2}), Vec::new(), None)
            .await
            .unwrap_err(),
        PoolError::NoWorkers
    );
}

#[cfg(unix)]
mod process {
    use super::*;
    use worker_pool::ProcessLauncher;

    #[tokio::test]
    async fn shell_worker_announces_service() {
        let launcher = ProcessLauncher::new().with_args([
            "-c",
            r#"echo '{"message":{"type":"initialized","service":"echo"}}'; cat > /dev/null"#,
        ]);
        let set = ConcurrentWorkerSet::new(WorkerSetOptions::new("sh").with_worker_count(2), launcher);

        set.connect(SERVICE).await.unwrap();
        let message = WorkerMessage::Event {
            service: SERVICE.to_string(),
            payload: json!({"type": "configuration"}),
        };
        set.broadcast_message(message, Vec::new()).await.unwrap();
        set.stop().await;
    }

    #[tokio::test]
    async fn quiet_process_times_out() {
        let launcher = ProcessLauncher::new().with_args(["-c", "sleep 5"]);
        let options = WorkerSetOptions::new("sh")
            .with_worker_count(1)
            .with_connection_timeout(Duration::from_millis(50));
        let set = ConcurrentWorkerSet::new(options, launcher);

        assert_eq!(
            set.connect(SERVICE).await.unwrap_err(),
            PoolError::InitializationTimeout(Duration::from_millis(50))
        );
    }

    #[tokio::test]
    async fn missing_program_fails_to_launch() {
        let set = ConcurrentWorkerSet::new(
            WorkerSetOptions::new("/nonexistent/worker-binary").with_worker_count(1),
            ProcessLauncher::new(),
        );

        let err = set.connect(SERVICE).await.unwrap_err();
        assert!(matches!(err, PoolError::LaunchFailure(_)));
    }
}
