//! Console message sink

use std::collections::HashMap;
use std::io::{self, Write};

use async_trait::async_trait;
use canmon_core::{ChannelHandle, FrameEvent, MessageSink, SinkError};
use chrono::Local;
use clap::ValueEnum;

/// How frames are printed
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum FrameFormat {
    /// `2026-01-01 12:00:00.123 - ID: 4904000 (Extended) Data: 01-02 [USBBUS1 #1]`
    Text,
    /// One JSON object per frame
    Json,
}

/// Prints every observed frame, with a running count per channel
pub struct ConsoleSink<W> {
    out: W,
    format: FrameFormat,
    counts: HashMap<ChannelHandle, u64>,
}

impl ConsoleSink<io::Stdout> {
    pub fn stdout(format: FrameFormat) -> Self {
        Self::new(io::stdout(), format)
    }
}

impl<W: Write + Send> ConsoleSink<W> {
    pub fn new(out: W, format: FrameFormat) -> Self {
        Self {
            out,
            format,
            counts: HashMap::new(),
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn render(&mut self, event: &FrameEvent) -> io::Result<()> {
        let count = self.counts.entry(event.handle).or_insert(0);
        *count += 1;

        match self.format {
            FrameFormat::Text => writeln!(
                self.out,
                "{} - {} [{} #{}]",
                event
                    .received_at
                    .with_timezone(&Local)
                    .format("%Y-%m-%d %H:%M:%S%.3f"),
                event.received.frame,
                event.handle,
                count
            ),
            FrameFormat::Json => {
                serde_json::to_writer(&mut self.out, event)?;
                writeln!(self.out)
            }
        }
    }
}

#[async_trait]
impl<W: Write + Send> MessageSink for ConsoleSink<W> {
    async fn on_frame(&mut self, event: &FrameEvent) -> Result<(), SinkError> {
        match self.render(event).and_then(|_| self.out.flush()) {
            Ok(()) => Ok(()),
            // Reader went away (`canmond | head`)
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => Err(SinkError::Disposed),
            Err(e) => Err(SinkError::Io(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use canmon_core::{CanFrame, LogicalDeviceId};
    use chrono::Utc;
    use pretty_assertions::assert_eq;

    use super::*;

    fn event(handle: u8, frame: CanFrame, sequence: u64) -> FrameEvent {
        FrameEvent {
            device: LogicalDeviceId::new(format!("USBBUS{}", handle)),
            handle: ChannelHandle::new(handle).unwrap(),
            received: frame.into(),
            received_at: Utc::now(),
            sequence,
        }
    }

    #[tokio::test]
    async fn test_text_format_counts_per_channel() {
        let mut sink = ConsoleSink::new(Vec::new(), FrameFormat::Text);
        let trigger = CanFrame::new(0x04904000, true, &[0x01, 0x40, 0xFF]).unwrap();
        let std = CanFrame::new(0x123, false, &[]).unwrap();

        sink.on_frame(&event(1, trigger, 1)).await.unwrap();
        sink.on_frame(&event(2, std, 1)).await.unwrap();
        sink.on_frame(&event(1, trigger, 2)).await.unwrap();

        let out = String::from_utf8(sink.into_inner()).unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].ends_with(" - ID: 4904000 (Extended) Data: 01-40-FF [USBBUS1 #1]"));
        assert!(lines[1].ends_with(" - ID: 123 (Standard) Data:  [USBBUS2 #1]"));
        assert!(lines[2].ends_with("[USBBUS1 #2]"));
        // "YYYY-MM-DD HH:MM:SS.mmm"
        assert_eq!(lines[0].find(" - "), Some(23));
    }

    #[tokio::test]
    async fn test_json_format() {
        let mut sink = ConsoleSink::new(Vec::new(), FrameFormat::Json);
        let frame = CanFrame::new(0x18A2F6F6, true, &[1, 2]).unwrap();
        sink.on_frame(&event(3, frame, 7)).await.unwrap();

        let out = String::from_utf8(sink.into_inner()).unwrap();
        let value: serde_json::Value = serde_json::from_str(out.trim()).unwrap();
        assert_eq!(value["handle"], 3);
        assert_eq!(value["sequence"], 7);
        assert_eq!(value["device"], "USBBUS3");
    }

    struct ClosedPipe;

    impl Write for ClosedPipe {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::from(io::ErrorKind::BrokenPipe))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_broken_pipe_disposes_sink() {
        let mut sink = ConsoleSink::new(ClosedPipe, FrameFormat::Text);
        let frame = CanFrame::new(0x1, false, &[]).unwrap();
        let result = sink.on_frame(&event(1, frame, 1)).await;
        assert!(matches!(result, Err(SinkError::Disposed)));
    }
}
