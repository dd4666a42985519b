//! Event system for UI decoupling.
//!
//! The updater reports state changes, progress and errors through an
//! [`UpdateObserver`] so CLI and other front ends stay out of the core.

use std::sync::Arc;
use std::sync::mpsc::Sender;

use crate::image::SegmentSpan;
use crate::state::UpdateState;

/// Events emitted during an update attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateEvent {
    /// Orchestration state changed.
    StateChanged { from: UpdateState, to: UpdateState },
    /// Human-readable status line.
    Status { state: UpdateState, message: String },
    /// Bytes written so far across all segments.
    Progress { written: u64, total: u64 },
    /// A segment outside every safe range was dropped.
    SegmentSkipped { span: SegmentSpan },
    /// Bootloader interface opened.
    DeviceConnected {
        vid: u16,
        pid: u16,
        interface: Option<String>,
    },
    /// Non-fatal condition worth surfacing.
    Warning { message: String },
    /// The attempt failed in `state`.
    Error { state: UpdateState, message: String },
    /// Update finished.
    Complete { version: Option<String> },
}

/// Observer trait for receiving update events.
///
/// Implement this trait in your UI layer to receive updates.
pub trait UpdateObserver: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &UpdateEvent);
}

impl<O: UpdateObserver + ?Sized> UpdateObserver for Arc<O> {
    fn on_event(&self, event: &UpdateEvent) {
        (**self).on_event(event)
    }
}

impl<O: UpdateObserver + ?Sized> UpdateObserver for &O {
    fn on_event(&self, event: &UpdateEvent) {
        (**self).on_event(event)
    }
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl UpdateObserver for NullObserver {
    fn on_event(&self, _event: &UpdateEvent) {}
}

/// Forwards events to a channel so a caller can consume them as a stream.
///
/// Send failures are ignored; a dropped receiver just stops listening.
pub struct ChannelObserver {
    sender: Sender<UpdateEvent>,
}

impl ChannelObserver {
    pub fn new(sender: Sender<UpdateEvent>) -> Self {
        Self { sender }
    }
}

impl UpdateObserver for ChannelObserver {
    fn on_event(&self, event: &UpdateEvent) {
        let _ = self.sender.send(event.clone());
    }
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl UpdateObserver for TracingObserver {
    fn on_event(&self, event: &UpdateEvent) {
        match event {
            UpdateEvent::StateChanged { from, to } => {
                tracing::info!(from = %from, to = %to, "State changed");
            }
            UpdateEvent::Status { state, message } => {
                tracing::info!(state = %state, "{}", message);
            }
            UpdateEvent::Progress { written, total } => {
                let pct = if *total > 0 {
                    (*written * 100) / *total
                } else {
                    0
                };
                tracing::debug!(
                    written = written,
                    total = total,
                    progress = %format!("{}%", pct),
                    "Progress"
                );
            }
            UpdateEvent::SegmentSkipped { span } => {
                tracing::warn!(segment = %span, "Segment outside safe ranges skipped");
            }
            UpdateEvent::DeviceConnected {
                vid,
                pid,
                interface,
            } => {
                tracing::info!(
                    vid = %format!("{:04X}", vid),
                    pid = %format!("{:04X}", pid),
                    interface = interface.as_deref().unwrap_or("-"),
                    "Device connected"
                );
            }
            UpdateEvent::Warning { message } => {
                tracing::warn!("{}", message);
            }
            UpdateEvent::Error { state, message } => {
                tracing::error!(state = %state, "Error: {}", message);
            }
            UpdateEvent::Complete { version } => match version {
                Some(v) => tracing::info!(version = %v, "Update complete"),
                None => tracing::info!("Update complete"),
            },
        }
    }
}

#[cfg(test)]
pub(crate) mod recording {
    use std::sync::Mutex;

    use super::*;

    /// Collects every event for later assertions.
    #[derive(Default)]
    pub struct RecordingObserver {
        events: Mutex<Vec<UpdateEvent>>,
    }

    impl RecordingObserver {
        pub fn events(&self) -> Vec<UpdateEvent> {
            self.events.lock().unwrap().clone()
        }

        pub fn states(&self) -> Vec<UpdateState> {
            self.events()
                .into_iter()
                .filter_map(|e| match e {
                    UpdateEvent::StateChanged { to, .. } => Some(to),
                    _ => None,
                })
                .collect()
        }

        pub fn progress(&self) -> Vec<(u64, u64)> {
            self.events()
                .into_iter()
                .filter_map(|e| match e {
                    UpdateEvent::Progress { written, total } => Some((written, total)),
                    _ => None,
                })
                .collect()
        }
    }

    impl UpdateObserver for RecordingObserver {
        fn on_event(&self, event: &UpdateEvent) {
            self.events.lock().unwrap().push(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;

    #[test]
    fn test_channel_observer_forwards() {
        let (tx, rx) = mpsc::channel();
        let observer = ChannelObserver::new(tx);
        observer.on_event(&UpdateEvent::Progress {
            written: 10,
            total: 20,
        });
        assert_eq!(
            rx.recv().unwrap(),
            UpdateEvent::Progress {
                written: 10,
                total: 20
            }
        );
    }

    #[test]
    fn test_channel_observer_survives_dropped_receiver() {
        let (tx, rx) = mpsc::channel();
        drop(rx);
        ChannelObserver::new(tx).on_event(&UpdateEvent::Warning {
            message: "nobody listening".into(),
        });
    }
}
