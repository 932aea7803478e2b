use speedfish::reporter::EventReporter;
use speedfish::{Client, Config, ProgressCallback, ProgressEvent, Server, TestKind};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const BLOCK: usize = 64 * 1024;

/// Custom callback implementation using a struct
struct TestCallback {
    events: Arc<Mutex<Vec<ProgressEvent>>>,
}

impl TestCallback {
    fn new() -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl ProgressCallback for TestCallback {
    fn on_progress(&self, event: ProgressEvent) {
        self.events.lock().unwrap().push(event);
    }
}

async fn start_server(config: Config) -> (SocketAddr, CancellationToken) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Server::new(config);
    let token = server.cancellation_token().clone();
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });
    (addr, token)
}

fn quick_server() -> Config {
    Config::server(":0")
        .with_block_size(BLOCK)
        .with_duration(Duration::from_secs(1))
        .with_report_interval(Duration::from_millis(200))
}

fn quick_client(addr: SocketAddr) -> Config {
    Config::client(addr.to_string())
        .with_block_size(BLOCK)
        .with_duration(Duration::from_secs(1))
        .with_report_interval(Duration::from_millis(200))
}

fn position(events: &[ProgressEvent], pred: impl Fn(&ProgressEvent) -> bool) -> usize {
    events
        .iter()
        .position(pred)
        .expect("expected event not found")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_full_run_event_order() {
    let (addr, token) = start_server(quick_server()).await;

    let callback = TestCallback::new();
    let events_ref = callback.events.clone();
    let client = Client::new(quick_client(addr)).unwrap().with_callback(callback);
    client.run().await.unwrap();

    let events = events_ref.lock().unwrap().clone();

    // No cname or location configured, so no banner
    assert!(!events.iter().any(|e| matches!(e, ProgressEvent::Banner(_))));
    assert!(!events.iter().any(|e| matches!(e, ProgressEvent::Error(_))));

    let started = |kind: TestKind| {
        position(&events, |e| matches!(e, ProgressEvent::TestStarted(k) if *k == kind))
    };
    let completed = |kind: TestKind| {
        position(&events, |e| matches!(e, ProgressEvent::TestCompleted(k) if *k == kind))
    };

    // Latency, then download, then upload
    assert!(completed(TestKind::Echo) < started(TestKind::Download));
    assert!(completed(TestKind::Download) < started(TestKind::Upload));

    // Progress is reset right after every start
    for kind in [TestKind::Echo, TestKind::Download, TestKind::Upload] {
        match &events[started(kind) + 1] {
            ProgressEvent::TestProgress { kind: k, fraction } => {
                assert_eq!(*k, kind);
                assert_eq!(*fraction, 0.0);
            }
            other => panic!("Expected progress reset, got {:?}", other),
        }
    }

    let latency_samples = events
        .iter()
        .filter(|e| matches!(e, ProgressEvent::Latency { .. }))
        .count();
    assert_eq!(latency_samples, 30);

    // 1 s at 200 ms per sample
    for kind in [TestKind::Download, TestKind::Upload] {
        let samples: Vec<usize> = events
            .iter()
            .enumerate()
            .filter(|(_, e)| {
                matches!(e, ProgressEvent::Throughput { sample, .. } if sample.kind == kind)
            })
            .map(|(i, _)| i)
            .collect();
        assert_eq!(samples.len(), 5, "{} produced {} samples", kind, samples.len());

        let done = completed(kind);
        assert!(samples.iter().all(|i| *i > started(kind) && *i < done));

        // Only progress updates sit between the last sample and completion
        let last = *samples.last().unwrap();
        assert!(events[last + 1..done]
            .iter()
            .all(|e| matches!(e, ProgressEvent::TestProgress { kind: k, .. } if *k == kind)));
        assert!(matches!(
            events[done - 1],
            ProgressEvent::TestProgress { fraction, .. } if fraction == 1.0
        ));
    }

    let measurements = client.get_measurements();
    assert_eq!(measurements.latency.as_ref().unwrap().samples_us.len(), 30);
    assert!(measurements.download.as_ref().unwrap().blocks > 0);
    assert!(measurements.upload.as_ref().unwrap().blocks > 0);
    assert_eq!(measurements.banner.as_deref(), Some(""));

    token.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_banner_emitted_once() {
    let config = quick_server()
        .with_cname("speed.example.net")
        .with_location("Lab\x07 7");
    let (addr, token) = start_server(config).await;

    let events = Arc::new(Mutex::new(Vec::new()));
    let events_clone = events.clone();
    let client = Client::new(quick_client(addr))
        .unwrap()
        .with_callback(move |event: ProgressEvent| {
            events_clone.lock().unwrap().push(event);
        });
    client.run().await.unwrap();

    let banners: Vec<String> = events
        .lock()
        .unwrap()
        .iter()
        .filter_map(|e| match e {
            ProgressEvent::Banner(text) => Some(text.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(banners, vec!["speed.example.net :: Lab 7".to_string()]);

    token.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_run_with_reporter_queue() {
    let (addr, token) = start_server(quick_server()).await;
    let client = Client::new(quick_client(addr).with_ping_count(5)).unwrap();

    let (reporter, mut receiver) = EventReporter::new(4);
    let consumer = tokio::spawn(async move {
        let mut events = Vec::new();
        while let Some(event) = receiver.recv().await {
            events.push(event);
            // Slow consumer; samples may be dropped but the run completes
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        events
    });

    client.run_with_reporter(reporter).await.unwrap();
    let events = consumer.await.unwrap();

    assert!(matches!(
        events.last(),
        Some(ProgressEvent::TestCompleted(TestKind::Upload))
    ));
    let latency = events
        .iter()
        .filter(|e| matches!(e, ProgressEvent::Latency { .. }))
        .count();
    assert!(latency <= 5);
    assert_eq!(
        client.get_measurements().latency.unwrap().samples_us.len(),
        5
    );

    token.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unread_queue_does_not_stall_run() {
    let (addr, token) = start_server(quick_server()).await;
    let client = Client::new(quick_client(addr)).unwrap();

    // Held but never read while the run is in progress
    let (reporter, mut receiver) = EventReporter::new(4);
    let started = std::time::Instant::now();
    tokio::time::timeout(Duration::from_secs(8), client.run_with_reporter(reporter))
        .await
        .expect("run stalled on an unread event queue")
        .unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));

    let measurements = client.get_measurements();
    assert_eq!(measurements.download.as_ref().unwrap().samples_bps.len(), 5);
    assert_eq!(measurements.upload.as_ref().unwrap().samples_bps.len(), 5);

    let mut events = Vec::new();
    while let Ok(event) = receiver.try_recv() {
        events.push(event);
    }
    let lifecycle = events
        .iter()
        .filter(|e| {
            matches!(
                e,
                ProgressEvent::TestStarted(_) | ProgressEvent::TestCompleted(_)
            )
        })
        .count();
    assert_eq!(lifecycle, 6);
    assert!(events.iter().filter(|e| e.is_droppable()).count() <= 4);

    token.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_user_abort_during_download() {
    let config = quick_server().with_duration(Duration::from_secs(30));
    let (addr, token) = start_server(config).await;

    let client = Client::new(quick_client(addr).with_duration(Duration::from_secs(30))).unwrap();
    let abort = client.cancellation_token().clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        abort.cancel();
    });

    let started = std::time::Instant::now();
    let result = client.run().await;
    assert!(result.is_err());
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(client.get_measurements().upload.is_none());

    token.cancel();
}
