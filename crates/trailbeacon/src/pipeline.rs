//! Pipeline coordinator.
//!
//! Wires the sample source, durable queue, retry controller and fallback
//! notifier into one unit. Two tasks run once started:
//!
//! - the sampler, which produces a sample immediately and then once per
//!   interval, enqueues it and wakes the controller
//! - the retry controller, which delivers queued samples one at a time
//!
//! Sampling never waits on delivery. No error stops either task; failures
//! are logged, published as [`PipelineEvent`]s and retried on the next tick
//! or backoff.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{Config, SourceKind};
use crate::controller::{BackoffPolicy, ControllerSnapshot, RetryController};
use crate::error::{Error, Result};
use crate::identity::DeviceIdentity;
use crate::notify::{FallbackNotifier, HttpSmsGateway, NotifyError, SmsChannel, UnavailableChannel};
use crate::queue::DurableQueue;
use crate::sample::LocationSample;
use crate::source::{FixedProvider, GpsdProvider, PositionProvider, SampleSource};
use crate::storage::Storage;
use crate::transmit::{Ack, HttpTransmitter, Transmit, TransmitError};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Shortest sampling interval the sampler will run with.
pub const MIN_SAMPLING_INTERVAL: Duration = Duration::from_secs(1);

/// Something that happened in the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    /// A sample was captured and queued.
    SampleEnqueued {
        /// Queue position.
        sequence_id: i64,
        /// The sample.
        sample: LocationSample,
    },
    /// A tick produced no queued sample.
    SampleSkipped {
        /// Why.
        reason: String,
    },
    /// A sample reached the collector.
    Delivered {
        /// Delivered entry.
        sequence_id: i64,
        /// Collector acknowledgement.
        ack: Ack,
    },
    /// A delivery attempt failed.
    DeliveryFailed {
        /// Entry that failed.
        sequence_id: i64,
        /// Why.
        error: TransmitError,
        /// Failures since the last success.
        consecutive_failures: u32,
        /// Backoff before the next attempt.
        retry_in: Duration,
    },
    /// The emergency message went out.
    FallbackNotified {
        /// The sample the message reported.
        sample: LocationSample,
    },
    /// The emergency message could not be sent. Needs user attention.
    FallbackFailed {
        /// Why.
        error: NotifyError,
    },
}

/// Observable pipeline state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStatus {
    /// Samples waiting for delivery.
    pub queue_depth: usize,
    /// Failed deliveries since the last success.
    pub consecutive_failures: u32,
    /// When a sample was last delivered.
    pub last_success_at: Option<DateTime<Utc>>,
}

/// Everything a pipeline needs.
pub struct PipelineParts {
    /// Produces samples.
    pub source: SampleSource,
    /// Holds samples until delivered.
    pub queue: DurableQueue,
    /// Delivers samples.
    pub transmitter: Arc<dyn Transmit>,
    /// Sends the emergency message.
    pub notifier: FallbackNotifier,
    /// Time between samples.
    pub sampling_interval: Duration,
    /// Retry delays.
    pub backoff: BackoffPolicy,
    /// Consecutive failures before the emergency message.
    pub failure_threshold: u32,
}

impl std::fmt::Debug for PipelineParts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineParts")
            .field("source", &self.source)
            .field("queue", &self.queue)
            .field("notifier", &self.notifier)
            .field("sampling_interval", &self.sampling_interval)
            .field("backoff", &self.backoff)
            .field("failure_threshold", &self.failure_threshold)
            .finish_non_exhaustive()
    }
}

/// A configured, not yet running pipeline.
#[derive(Debug)]
pub struct Pipeline {
    parts: PipelineParts,
}

/// Build the SMS channel for the configured gateway, if any.
///
/// # Errors
///
/// Returns an error if the gateway URL is invalid.
pub fn sms_channel(config: &Config) -> Result<Arc<dyn SmsChannel>> {
    Ok(match &config.fallback.sms_gateway_url {
        Some(url) => Arc::new(HttpSmsGateway::new(url, config.gateway_timeout())?),
        None => Arc::new(UnavailableChannel),
    })
}

impl Pipeline {
    /// Create a pipeline from its parts.
    #[must_use]
    pub fn new(parts: PipelineParts) -> Self {
        Self { parts }
    }

    /// Build a pipeline from configuration, using `storage` for the queue and
    /// device settings.
    ///
    /// # Errors
    ///
    /// Returns an error if the device identity cannot be loaded or an adapter
    /// cannot be built from the configuration.
    pub fn from_config(config: &Config, storage: Arc<Storage>) -> Result<Self> {
        let identity = DeviceIdentity::load_or_create(&storage)?;

        let provider: Arc<dyn PositionProvider> = match config.sampling.source {
            SourceKind::Gpsd => Arc::new(GpsdProvider::new(config.sampling.gpsd_address.clone())),
            SourceKind::Fixed => {
                let position = config.sampling.fixed_position().ok_or_else(|| {
                    Error::config("fixed source requires fixed_latitude and fixed_longitude")
                })?;
                Arc::new(FixedProvider::new(position))
            }
        };

        let transmitter = HttpTransmitter::new(&config.collector.url, config.send_timeout())?;
        info!(endpoint = %transmitter.endpoint(), "Collector endpoint");

        Ok(Self::new(PipelineParts {
            source: SampleSource::new(provider, identity, config.acquisition_timeout()),
            queue: DurableQueue::new(Arc::clone(&storage), config.queue.capacity),
            transmitter: Arc::new(transmitter),
            notifier: FallbackNotifier::new(storage, sms_channel(config)?),
            sampling_interval: config.sampling_interval(),
            backoff: config.backoff(),
            failure_threshold: config.retry.failure_threshold,
        }))
    }

    /// Spawn the sampler and controller tasks on the current runtime.
    ///
    /// A sampling interval below [`MIN_SAMPLING_INTERVAL`] is raised to it.
    #[must_use]
    pub fn start(self) -> PipelineHandle {
        let PipelineParts {
            source,
            queue,
            transmitter,
            notifier,
            sampling_interval,
            backoff,
            failure_threshold,
        } = self.parts;

        if sampling_interval < MIN_SAMPLING_INTERVAL {
            warn!(requested = ?sampling_interval, "Sampling interval too short, using {MIN_SAMPLING_INTERVAL:?}");
        }
        let sampling_interval = sampling_interval.max(MIN_SAMPLING_INTERVAL);

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        let wake = Arc::new(Notify::new());

        let controller = RetryController::new(
            queue.clone(),
            transmitter,
            notifier,
            backoff,
            failure_threshold,
            events.clone(),
        );
        let snapshots = controller.subscribe();

        let sampler = Sampler {
            source,
            queue: queue.clone(),
            interval: sampling_interval,
            wake: Arc::clone(&wake),
            events: events.clone(),
        };

        info!(interval = ?sampling_interval, "Pipeline started");
        let tasks = vec![
            tokio::spawn(sampler.run(cancel.clone())),
            tokio::spawn(controller.run(wake, cancel.clone())),
        ];

        PipelineHandle {
            queue,
            snapshots,
            events,
            cancel,
            tasks,
        }
    }
}

struct Sampler {
    source: SampleSource,
    queue: DurableQueue,
    interval: Duration,
    wake: Arc<Notify>,
    events: broadcast::Sender<PipelineEvent>,
}

impl Sampler {
    async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            self.sample_once().await;
        }

        info!("Sampler stopped");
    }

    async fn sample_once(&self) {
        let sample = match self.source.produce().await {
            Ok(sample) => sample,
            Err(e) => {
                warn!(error = %e, "Skipping sample");
                let _ = self.events.send(PipelineEvent::SampleSkipped {
                    reason: e.to_string(),
                });
                return;
            }
        };

        match self.queue.enqueue(&sample) {
            Ok(entry) => {
                self.wake.notify_one();
                let _ = self.events.send(PipelineEvent::SampleEnqueued {
                    sequence_id: entry.sequence_id,
                    sample,
                });
            }
            Err(e) => {
                error!(error = %e, "Could not queue sample");
                let _ = self.events.send(PipelineEvent::SampleSkipped {
                    reason: e.to_string(),
                });
            }
        }
    }
}

/// A running pipeline.
#[derive(Debug)]
pub struct PipelineHandle {
    queue: DurableQueue,
    snapshots: watch::Receiver<ControllerSnapshot>,
    events: broadcast::Sender<PipelineEvent>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl PipelineHandle {
    /// Current queue depth, failure streak and last success.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue depth cannot be read.
    pub fn status(&self) -> Result<PipelineStatus> {
        let snapshot = *self.snapshots.borrow();
        Ok(PipelineStatus {
            queue_depth: self.queue.depth()?,
            consecutive_failures: snapshot.streak.consecutive_failures(),
            last_success_at: snapshot.last_success_at,
        })
    }

    /// Watch the retry controller.
    #[must_use]
    pub fn controller(&self) -> watch::Receiver<ControllerSnapshot> {
        self.snapshots.clone()
    }

    /// Receive pipeline events from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    /// Stop both tasks. An in-flight send finishes or times out first.
    pub async fn stop(self) {
        info!("Stopping pipeline");
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                error!(error = %e, "Pipeline task failed");
            }
        }
        info!("Pipeline stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::EmergencyContact;
    use crate::sample::Position;
    use crate::source::{AcquisitionError, MockPositionProvider};
    use crate::transmit::MockTransmit;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn identity() -> DeviceIdentity {
        DeviceIdentity {
            device_id: "device_test".to_string(),
        }
    }

    fn parts(
        provider: Arc<dyn PositionProvider>,
        transmit: MockTransmit,
        interval: Duration,
    ) -> (PipelineParts, DurableQueue) {
        let storage = Arc::new(Storage::open_in_memory().unwrap());
        let queue = DurableQueue::new(Arc::clone(&storage), 500);
        let parts = PipelineParts {
            source: SampleSource::new(provider, identity(), Duration::from_secs(10)),
            queue: queue.clone(),
            transmitter: Arc::new(transmit),
            notifier: FallbackNotifier::new(storage, Arc::new(UnavailableChannel)),
            sampling_interval: interval,
            backoff: BackoffPolicy::default(),
            failure_threshold: 3,
        };
        (parts, queue)
    }

    async fn next_matching(
        rx: &mut broadcast::Receiver<PipelineEvent>,
        pred: impl Fn(&PipelineEvent) -> bool,
    ) -> PipelineEvent {
        loop {
            let event = rx.recv().await.unwrap();
            if pred(&event) {
                return event;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_sample_is_immediate_and_delivered() {
        let mut transmit = MockTransmit::new();
        transmit.expect_send().returning(|_| Ok(Ack::default()));
        let (parts, queue) = parts(
            Arc::new(FixedProvider::new(Position::new(1.0, 2.0))),
            transmit,
            Duration::from_secs(1800),
        );

        let started = tokio::time::Instant::now();
        let handle = Pipeline::new(parts).start();
        let mut rx = handle.subscribe();

        next_matching(&mut rx, |e| matches!(e, PipelineEvent::Delivered { .. })).await;
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(queue.depth().unwrap(), 0);

        let status = handle.status().unwrap();
        assert_eq!(status.queue_depth, 0);
        assert_eq!(status.consecutive_failures, 0);
        assert!(status.last_success_at.is_some());

        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_samples_follow_interval() {
        let mut transmit = MockTransmit::new();
        transmit.expect_send().returning(|_| Ok(Ack::default()));
        let (parts, _queue) = parts(
            Arc::new(FixedProvider::new(Position::new(1.0, 2.0))),
            transmit,
            Duration::from_secs(60),
        );

        let handle = Pipeline::new(parts).start();
        let mut rx = handle.subscribe();
        let started = tokio::time::Instant::now();

        let mut ids = Vec::new();
        while ids.len() < 3 {
            if let PipelineEvent::SampleEnqueued { sequence_id, .. } = next_matching(&mut rx, |e| {
                matches!(e, PipelineEvent::SampleEnqueued { .. })
            })
            .await
            {
                ids.push(sequence_id);
            }
        }
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
        assert!(started.elapsed() >= Duration::from_secs(120));

        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_interval_is_clamped() {
        let mut transmit = MockTransmit::new();
        transmit.expect_send().returning(|_| Ok(Ack::default()));
        let (parts, _queue) = parts(
            Arc::new(FixedProvider::new(Position::new(1.0, 2.0))),
            transmit,
            Duration::ZERO,
        );

        let handle = Pipeline::new(parts).start();
        let mut rx = handle.subscribe();
        let started = tokio::time::Instant::now();

        for _ in 0..3 {
            next_matching(&mut rx, |e| matches!(e, PipelineEvent::SampleEnqueued { .. })).await;
        }
        assert!(started.elapsed() >= MIN_SAMPLING_INTERVAL * 2);

        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquisition_failure_skips_tick() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let mut provider = MockPositionProvider::new();
        provider.expect_name().return_const("mock");
        provider.expect_current_position().returning(move || {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(AcquisitionError::Unavailable("no gps".to_string()))
            } else {
                Ok(Position::new(3.0, 4.0))
            }
        });

        let mut transmit = MockTransmit::new();
        transmit.expect_send().returning(|_| Ok(Ack::default()));
        let (parts, _queue) = parts(Arc::new(provider), transmit, Duration::from_secs(60));

        let handle = Pipeline::new(parts).start();
        let mut rx = handle.subscribe();

        let skipped =
            next_matching(&mut rx, |e| matches!(e, PipelineEvent::SampleSkipped { .. })).await;
        assert!(matches!(skipped, PipelineEvent::SampleSkipped { reason } if reason.contains("no gps")));

        let delivered =
            next_matching(&mut rx, |e| matches!(e, PipelineEvent::SampleEnqueued { .. })).await;
        assert!(matches!(delivered, PipelineEvent::SampleEnqueued { sample, .. } if sample.latitude > 2.0));

        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_sampling_continues_while_delivery_fails() {
        let mut transmit = MockTransmit::new();
        transmit
            .expect_send()
            .returning(|_| Err(TransmitError::network("offline")));
        let (parts, queue) = parts(
            Arc::new(FixedProvider::new(Position::new(1.0, 2.0))),
            transmit,
            Duration::from_secs(60),
        );
        EmergencyContact::new("Alex", "5550100")
            .unwrap()
            .save(queue.storage())
            .unwrap();

        let handle = Pipeline::new(parts).start();
        let mut rx = handle.subscribe();

        let fallback =
            next_matching(&mut rx, |e| matches!(e, PipelineEvent::FallbackFailed { .. })).await;
        assert_eq!(
            fallback,
            PipelineEvent::FallbackFailed {
                error: NotifyError::ChannelUnavailable
            }
        );

        tokio::time::sleep(Duration::from_secs(300)).await;
        let status = handle.status().unwrap();
        assert!(status.queue_depth >= 5);
        assert!(status.consecutive_failures >= 3);
        assert!(status.last_success_at.is_none());

        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_waits_for_in_flight_send() {
        struct SlowTransmit {
            finished: Arc<AtomicUsize>,
        }

        #[async_trait::async_trait]
        impl Transmit for SlowTransmit {
            async fn send(&self, _sample: &LocationSample) -> std::result::Result<Ack, TransmitError> {
                tokio::time::sleep(Duration::from_secs(3)).await;
                self.finished.fetch_add(1, Ordering::SeqCst);
                Ok(Ack::default())
            }
        }

        let finished = Arc::new(AtomicUsize::new(0));
        let (mut parts, queue) = parts(
            Arc::new(FixedProvider::new(Position::new(1.0, 2.0))),
            MockTransmit::new(),
            Duration::from_secs(1800),
        );
        parts.transmitter = Arc::new(SlowTransmit {
            finished: Arc::clone(&finished),
        });

        let handle = Pipeline::new(parts).start();
        let mut snapshots = handle.controller();
        snapshots
            .wait_for(|s| matches!(s.state, crate::controller::ControllerState::Attempting { .. }))
            .await
            .unwrap();

        handle.stop().await;
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert_eq!(queue.depth().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_from_config_fixed_source() {
        let mut config = Config::default();
        config.sampling.source = SourceKind::Fixed;
        config.sampling.fixed_latitude = Some(1.0);
        config.sampling.fixed_longitude = Some(2.0);
        let storage = Arc::new(Storage::open_in_memory().unwrap());

        let pipeline = Pipeline::from_config(&config, Arc::clone(&storage)).unwrap();
        assert_eq!(pipeline.parts.sampling_interval, Duration::from_secs(1800));
        assert_eq!(pipeline.parts.failure_threshold, 3);
        assert!(storage.get_meta(crate::storage::KEY_DEVICE_ID).unwrap().is_some());

        let sample = pipeline.parts.source.produce().await.unwrap();
        assert_eq!(sample.position(), Position::new(1.0, 2.0));
    }

    #[test]
    fn test_from_config_fixed_source_without_position() {
        let mut config = Config::default();
        config.sampling.source = SourceKind::Fixed;
        let storage = Arc::new(Storage::open_in_memory().unwrap());
        assert!(Pipeline::from_config(&config, storage).is_err());
    }

    #[tokio::test]
    async fn test_sms_channel_selection() {
        let mut config = Config::default();
        assert!(!sms_channel(&config).unwrap().is_available().await);

        config.fallback.sms_gateway_url = Some("http://127.0.0.1:9/sms".to_string());
        assert!(sms_channel(&config).unwrap().is_available().await);
    }

    #[test]
    fn test_status_serializes_camel_case() {
        let status = PipelineStatus {
            queue_depth: 2,
            consecutive_failures: 1,
            last_success_at: None,
        };
        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains("queueDepth"));
        assert!(json.contains("consecutiveFailures"));
        assert!(json.contains("lastSuccessAt"));
    }
}
