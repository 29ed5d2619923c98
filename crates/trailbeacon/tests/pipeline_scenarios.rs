//! End-to-end delivery scenarios against scripted collectors and SMS channels.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use trailbeacon::controller::AttemptOutcome;
use trailbeacon::notify::SmsChannel;
use trailbeacon::source::FixedProvider;
use trailbeacon::{
    Ack, BackoffPolicy, DeviceIdentity, DurableQueue, EmergencyContact, FallbackNotifier,
    LocationSample, NotifyError, Pipeline, PipelineEvent, PipelineParts, Position,
    RetryController, SampleSource, SentStatus, Storage, Transmit, TransmitError,
    TransmitErrorKind,
};

/// Plays back a fixed list of outcomes, then succeeds.
struct ScriptedCollector {
    script: Mutex<VecDeque<Result<Ack, TransmitError>>>,
    seen: Mutex<Vec<LocationSample>>,
}

impl ScriptedCollector {
    fn new(script: Vec<Result<Ack, TransmitError>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            seen: Mutex::new(Vec::new()),
        })
    }

    fn seen(&self) -> Vec<LocationSample> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transmit for ScriptedCollector {
    async fn send(&self, sample: &LocationSample) -> Result<Ack, TransmitError> {
        self.seen.lock().unwrap().push(sample.clone());
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(Ack::default()))
    }
}

/// Records every message it is asked to send.
#[derive(Default)]
struct RecordingSms {
    sent: Mutex<Vec<(Vec<String>, String)>>,
}

impl RecordingSms {
    fn sent(&self) -> Vec<(Vec<String>, String)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl SmsChannel for RecordingSms {
    async fn is_available(&self) -> bool {
        true
    }

    async fn send_text(&self, recipients: &[String], body: &str) -> Result<SentStatus, NotifyError> {
        self.sent
            .lock()
            .unwrap()
            .push((recipients.to_vec(), body.to_string()));
        Ok(SentStatus::Sent)
    }
}

fn timeout() -> TransmitError {
    TransmitError::timeout(Duration::from_secs(5))
}

fn sample(n: u32) -> LocationSample {
    LocationSample::new("device_scenario", Position::new(f64::from(n), f64::from(n) / 2.0))
}

fn storage_with_contact() -> Arc<Storage> {
    let storage = Arc::new(Storage::open_in_memory().unwrap());
    EmergencyContact::new("Sam", "+447700900123")
        .unwrap()
        .save(&storage)
        .unwrap();
    storage
}

fn controller(
    queue: &DurableQueue,
    collector: Arc<ScriptedCollector>,
    sms: Arc<RecordingSms>,
    threshold: u32,
) -> (RetryController, broadcast::Receiver<PipelineEvent>) {
    let (events, rx) = broadcast::channel(64);
    let notifier = FallbackNotifier::new(Arc::clone(queue.storage()), sms);
    let controller = RetryController::new(
        queue.clone(),
        collector,
        notifier,
        BackoffPolicy::default(),
        threshold,
        events,
    );
    (controller, rx)
}

fn queued_ids(queue: &DurableQueue) -> Vec<i64> {
    queue
        .drain_all()
        .unwrap()
        .into_iter()
        .map(|e| e.sequence_id)
        .collect()
}

#[tokio::test]
async fn head_failing_twice_then_succeeding_leaves_rest_queued() {
    let queue = DurableQueue::new(storage_with_contact(), 500);
    let ids: Vec<i64> = (1..=3)
        .map(|n| queue.enqueue(&sample(n)).unwrap().sequence_id)
        .collect();
    assert_eq!(ids, vec![1, 2, 3]);

    let collector = ScriptedCollector::new(vec![
        Err(TransmitError::network("connection reset")),
        Err(TransmitError::rejected(500, "Failed to store device location")),
    ]);
    let sms = Arc::new(RecordingSms::default());
    let (mut controller, _rx) = controller(&queue, Arc::clone(&collector), Arc::clone(&sms), 3);

    for _ in 0..3 {
        controller.attempt_next().await.unwrap();
    }

    assert_eq!(queued_ids(&queue), vec![2, 3]);
    assert_eq!(controller.streak().consecutive_failures(), 0);
    assert!(!controller.streak().threshold_reached());
    assert!(controller.last_success_at().is_some());
    assert_eq!(
        queue.storage().last_success_at().unwrap(),
        controller.last_success_at()
    );
    assert!(collector
        .seen()
        .iter()
        .all(|s| (s.latitude - 1.0).abs() < f64::EPSILON));
    assert!(sms.sent().is_empty());
}

#[tokio::test]
async fn sustained_timeouts_text_contact_once() {
    let queue = DurableQueue::new(storage_with_contact(), 500);
    let head = sample(4);
    queue.enqueue(&head).unwrap();

    let collector = ScriptedCollector::new(vec![Err(timeout()); 6]);
    let sms = Arc::new(RecordingSms::default());
    let (mut controller, _rx) = controller(&queue, collector, Arc::clone(&sms), 3);

    let mut delays = Vec::new();
    for _ in 0..6 {
        match controller.attempt_next().await.unwrap() {
            AttemptOutcome::Failed { delay, error, .. } => {
                assert_eq!(error.kind, TransmitErrorKind::Timeout);
                delays.push(delay.as_secs());
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    assert_eq!(delays, vec![5, 10, 20, 40, 80, 160]);
    let sent = sms.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, vec!["+447700900123".to_string()]);
    assert_eq!(sent[0].1, FallbackNotifier::message_for(&head));
    assert_eq!(queue.peek_oldest().unwrap().unwrap().attempts, 6);
}

#[tokio::test]
async fn queue_survives_restart_and_delivers_in_order() {
    let db_path = std::env::temp_dir().join(format!(
        "trailbeacon_restart_scenario_{}.db",
        std::process::id()
    ));
    let _ = std::fs::remove_file(&db_path);

    {
        let queue = DurableQueue::new(Arc::new(Storage::open(&db_path).unwrap()), 500);
        for n in 1..=3 {
            queue.enqueue(&sample(n)).unwrap();
        }
    }

    let queue = DurableQueue::new(Arc::new(Storage::open(&db_path).unwrap()), 500);
    let collector = ScriptedCollector::new(Vec::new());
    let sms = Arc::new(RecordingSms::default());
    let (mut controller, _rx) = controller(&queue, Arc::clone(&collector), sms, 3);

    while let AttemptOutcome::Delivered { .. } = controller.attempt_next().await.unwrap() {}

    let latitudes: Vec<f64> = collector.seen().iter().map(|s| s.latitude).collect();
    assert_eq!(latitudes, vec![1.0, 2.0, 3.0]);
    assert_eq!(queue.depth().unwrap(), 0);

    drop(controller);
    drop(queue);
    let _ = std::fs::remove_file(&db_path);
    let _ = std::fs::remove_file(db_path.with_extension("db-wal"));
    let _ = std::fs::remove_file(db_path.with_extension("db-shm"));
}

#[tokio::test(start_paused = true)]
async fn running_pipeline_reports_through_outage() {
    let storage = storage_with_contact();
    let queue = DurableQueue::new(Arc::clone(&storage), 500);
    let identity = DeviceIdentity::load_or_create(&storage).unwrap();

    let collector = ScriptedCollector::new(vec![Err(timeout()), Err(timeout()), Err(timeout())]);
    let sms = Arc::new(RecordingSms::default());

    let handle = Pipeline::new(PipelineParts {
        source: SampleSource::new(
            Arc::new(FixedProvider::new(Position::new(-33.86, 151.21))),
            identity.clone(),
            Duration::from_secs(10),
        ),
        queue: queue.clone(),
        transmitter: collector.clone(),
        notifier: FallbackNotifier::new(Arc::clone(&storage), sms.clone()),
        sampling_interval: Duration::from_secs(1800),
        backoff: BackoffPolicy::default(),
        failure_threshold: 3,
    })
    .start();
    let mut events = handle.subscribe();

    loop {
        if let PipelineEvent::Delivered { .. } = events.recv().await.unwrap() {
            break;
        }
    }

    let status = handle.status().unwrap();
    assert_eq!(status.queue_depth, 0);
    assert_eq!(status.consecutive_failures, 0);
    assert!(status.last_success_at.is_some());

    let sent = sms.sent();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].1.contains(&identity.device_id));
    assert!(sent[0].1.contains("Latitude: -33.86"));

    assert_eq!(collector.seen().len(), 4);
    handle.stop().await;
}

#[tokio::test]
async fn missing_contact_surfaces_as_event() {
    let storage = Arc::new(Storage::open_in_memory().unwrap());
    let queue = DurableQueue::new(storage, 500);
    queue.enqueue(&sample(1)).unwrap();

    let collector = ScriptedCollector::new(vec![Err(timeout()); 3]);
    let sms = Arc::new(RecordingSms::default());
    let (mut controller, mut rx) = controller(&queue, collector, Arc::clone(&sms), 3);

    for _ in 0..3 {
        controller.attempt_next().await.unwrap();
    }

    let mut fallback_failures = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let PipelineEvent::FallbackFailed { error } = event {
            fallback_failures.push(error);
        }
    }
    assert_eq!(fallback_failures, vec![NotifyError::NoContactConfigured]);
    assert!(sms.sent().is_empty());
    assert_eq!(queue.depth().unwrap(), 1);
}
