//! Per-session frame monitor
//!
//! One monitor runs per active session on a blocking thread. Each iteration
//! checks the cancellation flag, then makes one non-blocking read:
//!
//! - frame: publish a [`FrameEvent`], run the [`Responder`], write its
//!   frames (write failures are logged and counted, never fatal),
//! - empty: retry right away (yield, or `idle_sleep_us` if configured),
//! - error: back off `error_backoff_ms`; after
//!   `max_consecutive_read_errors` in a row the session is marked faulted
//!   and the monitor exits.
//!
//! Frame events go out on a broadcast channel; the monitor never waits for
//! a consumer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use canmon_core::{BusDriver, ChannelHandle, DriverError, FrameEvent, LogicalDeviceId, ReceivedFrame};
use chrono::Utc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::config::MonitorConfig;
use crate::responder::Responder;
use crate::session::{MonitorCounters, SessionState, StateCell};

/// Why a monitor loop ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorExit {
    /// Cancellation flag observed
    Cancelled,
    /// Too many consecutive read errors
    Faulted {
        consecutive_errors: u32,
        last_error: DriverError,
    },
}

pub(crate) struct FrameMonitor {
    pub(crate) device: LogicalDeviceId,
    pub(crate) handle: ChannelHandle,
    pub(crate) driver: Arc<dyn BusDriver>,
    pub(crate) cancel: Arc<AtomicBool>,
    pub(crate) events: broadcast::Sender<FrameEvent>,
    pub(crate) responder: Responder,
    pub(crate) counters: Arc<MonitorCounters>,
    pub(crate) state: StateCell,
    pub(crate) config: MonitorConfig,
}

impl FrameMonitor {
    /// Run the loop on a blocking thread
    pub(crate) fn spawn(self) -> JoinHandle<MonitorExit> {
        tokio::task::spawn_blocking(move || self.run())
    }

    pub(crate) fn run(mut self) -> MonitorExit {
        info!(device = %self.device, handle = %self.handle, "Frame monitor started");

        let mut consecutive_errors: u32 = 0;
        let exit = loop {
            if self.cancel.load(Ordering::SeqCst) {
                break MonitorExit::Cancelled;
            }

            match self.driver.read(self.handle) {
                Ok(Some(received)) => {
                    consecutive_errors = 0;
                    self.process(received);
                }
                Ok(None) => self.idle(),
                Err(e) => {
                    // Uninitialize racing with this read
                    if self.cancel.load(Ordering::SeqCst) {
                        break MonitorExit::Cancelled;
                    }

                    self.counters.record_read_error();
                    consecutive_errors = consecutive_errors.saturating_add(1);
                    debug!(handle = %self.handle, error = %e, consecutive_errors, "Read failed");

                    let limit = self.config.max_consecutive_read_errors;
                    if limit > 0 && consecutive_errors >= limit {
                        error!(
                            device = %self.device,
                            handle = %self.handle,
                            error = %e,
                            consecutive_errors,
                            "Giving up on channel after repeated read errors"
                        );
                        break MonitorExit::Faulted {
                            consecutive_errors,
                            last_error: e,
                        };
                    }
                    std::thread::sleep(self.config.error_backoff());
                }
            }
        };

        if matches!(exit, MonitorExit::Faulted { .. }) {
            self.state
                .transition_from(SessionState::Active, SessionState::Faulted);
        }

        let counters = self.counters.snapshot();
        info!(
            device = %self.device,
            handle = %self.handle,
            received = counters.received,
            sent = counters.sent,
            write_failures = counters.write_failures,
            "Frame monitor stopped"
        );
        exit
    }

    fn process(&mut self, received: ReceivedFrame) {
        let sequence = self.counters.record_received();
        trace!(handle = %self.handle, sequence, frame = %received.frame, "Frame received");

        let event = FrameEvent {
            device: self.device.clone(),
            handle: self.handle,
            received,
            received_at: Utc::now(),
            sequence,
        };
        // No subscribers is fine
        let _ = self.events.send(event);

        for frame in self.responder.outgoing(&received.frame) {
            match self.driver.write(self.handle, &frame) {
                Ok(()) => {
                    self.counters.record_sent();
                    trace!(handle = %self.handle, frame = %frame, "Response sent");
                }
                Err(e) => {
                    self.counters.record_write_failure();
                    warn!(handle = %self.handle, frame = %frame, error = %e, "Failed to send response frame");
                }
            }
        }
    }

    fn idle(&self) {
        match self.config.idle_sleep() {
            Some(pause) => std::thread::sleep(pause),
            None => std::thread::yield_now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use canmon_core::{BaudRate, CanFrame};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;
    use crate::driver::mock::MockBusDriver;
    use crate::responder::TRIGGER_ID;

    struct Harness {
        driver: Arc<MockBusDriver>,
        cancel: Arc<AtomicBool>,
        counters: Arc<MonitorCounters>,
        state: StateCell,
        events: broadcast::Receiver<FrameEvent>,
        monitor: FrameMonitor,
    }

    fn harness(config: MonitorConfig) -> Harness {
        let driver = Arc::new(MockBusDriver::new());
        driver
            .initialize(ChannelHandle::FIRST, BaudRate::Baud500K)
            .unwrap();

        let device = LogicalDeviceId::new("D1");
        let cancel = Arc::new(AtomicBool::new(false));
        let counters = Arc::new(MonitorCounters::default());
        let state = StateCell::new(device.clone(), ChannelHandle::FIRST);
        state.transition(SessionState::Initializing);
        state.transition(SessionState::Active);
        let (tx, rx) = broadcast::channel(64);

        let monitor = FrameMonitor {
            device,
            handle: ChannelHandle::FIRST,
            driver: driver.clone(),
            cancel: cancel.clone(),
            events: tx,
            responder: Responder::with_rng(StdRng::seed_from_u64(1)),
            counters: counters.clone(),
            state: state.clone(),
            config,
        };

        Harness {
            driver,
            cancel,
            counters,
            state,
            events: rx,
            monitor,
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_monitor_answers_and_publishes_in_order() {
        let Harness {
            driver,
            cancel,
            counters,
            mut events,
            monitor,
            ..
        } = harness(MonitorConfig::default());
        let handle = ChannelHandle::FIRST;

        driver.inject(handle, CanFrame::with_payload(0x100, false, [1; 8]));
        driver.inject(handle, CanFrame::with_payload(TRIGGER_ID, true, [0; 8]));

        let task = monitor.spawn();
        wait_until(|| driver.written(handle).len() == 6).await;

        cancel.store(true, Ordering::SeqCst);
        assert_eq!(task.await.unwrap(), MonitorExit::Cancelled);

        let written: Vec<u32> = driver.written(handle).iter().map(|f| f.id()).collect();
        assert_eq!(
            written,
            vec![0x100, 0x18008040, 0x18018040, 0x18068040, 0x18078040, 0x18088040]
        );

        let first = events.recv().await.unwrap();
        let second = events.recv().await.unwrap();
        assert_eq!((first.sequence, first.received.frame.id()), (1, 0x100));
        assert_eq!((second.sequence, second.received.frame.id()), (2, TRIGGER_ID));

        let snapshot = counters.snapshot();
        assert_eq!(snapshot.received, 2);
        assert_eq!(snapshot.sent, 6);
    }

    #[tokio::test]
    async fn test_write_failures_do_not_stop_monitor() {
        let Harness {
            driver,
            cancel,
            counters,
            monitor,
            ..
        } = harness(MonitorConfig::default());
        let handle = ChannelHandle::FIRST;

        driver.set_write_failure(handle, Some(DriverError::TransmitQueueFull(handle)));
        driver.inject(handle, CanFrame::with_payload(0x200, false, [0; 8]));

        let task = monitor.spawn();
        wait_until(|| counters.snapshot().write_failures == 1).await;

        driver.set_write_failure(handle, None);
        driver.inject(handle, CanFrame::with_payload(0x201, false, [0; 8]));
        wait_until(|| driver.written(handle).len() == 1).await;

        cancel.store(true, Ordering::SeqCst);
        assert_eq!(task.await.unwrap(), MonitorExit::Cancelled);
        assert_eq!(driver.written(handle)[0].id(), 0x201);
    }

    #[tokio::test]
    async fn test_repeated_read_errors_fault_session() {
        let config = MonitorConfig {
            error_backoff_ms: 0,
            max_consecutive_read_errors: 3,
            ..MonitorConfig::default()
        };
        let Harness {
            driver,
            counters,
            state,
            monitor,
            ..
        } = harness(config);
        let handle = ChannelHandle::FIRST;
        let unplugged = DriverError::Unavailable(handle, "unplugged".to_string());

        driver.set_read_failure(handle, Some(unplugged.clone()));
        let exit = monitor.spawn().await.unwrap();

        assert_eq!(
            exit,
            MonitorExit::Faulted {
                consecutive_errors: 3,
                last_error: unplugged,
            }
        );
        assert_eq!(state.get(), SessionState::Faulted);
        assert_eq!(counters.snapshot().read_errors, 3);
    }

    #[tokio::test]
    async fn test_read_error_after_cancel_is_not_a_fault() {
        let Harness {
            driver,
            cancel,
            state,
            monitor,
            counters,
            ..
        } = harness(MonitorConfig::default());
        let handle = ChannelHandle::FIRST;

        let task = monitor.spawn();
        cancel.store(true, Ordering::SeqCst);
        driver.uninitialize(handle).unwrap();

        assert_eq!(task.await.unwrap(), MonitorExit::Cancelled);
        assert_eq!(state.get(), SessionState::Active);
        assert_eq!(counters.snapshot().read_errors, 0);
    }
}
