//! Observed-frame delivery to display consumers
//!
//! Monitors publish [`FrameEvent`]s on a `tokio::sync::broadcast` channel and
//! never wait for consumers. A [`MessageSink`] is driven by [`spawn_sink`] on
//! its own task, so a slow or vanished consumer cannot stall frame polling.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::channel::ChannelHandle;
use crate::device::LogicalDeviceId;
use crate::error::SinkError;
use crate::frame::ReceivedFrame;

/// One frame observed on a monitored channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameEvent {
    pub device: LogicalDeviceId,
    pub handle: ChannelHandle,
    pub received: ReceivedFrame,
    /// Host wall-clock time when the frame left the driver
    pub received_at: DateTime<Utc>,
    /// Per-session receive counter, starting at 1
    pub sequence: u64,
}

/// Consumer of observed frames (list view, console, log file, ...)
#[async_trait]
pub trait MessageSink: Send {
    /// Handle one frame. Returning [`SinkError::Disposed`] detaches the sink.
    async fn on_frame(&mut self, event: &FrameEvent) -> Result<(), SinkError>;
}

/// Drive `sink` from `rx` until the channel closes or the sink is disposed
pub fn spawn_sink<S>(mut rx: broadcast::Receiver<FrameEvent>, mut sink: S) -> JoinHandle<()>
where
    S: MessageSink + 'static,
{
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => match sink.on_frame(&event).await {
                    Ok(()) => {}
                    Err(SinkError::Disposed) => {
                        info!("Message sink disposed, detaching");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, handle = %event.handle, "Message sink failed to render frame");
                    }
                },
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Message sink lagging, frames dropped from display");
                }
                Err(RecvError::Closed) => {
                    debug!("Frame event channel closed");
                    break;
                }
            }
        }
    })
}
