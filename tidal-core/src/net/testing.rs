//! Test helpers for driving races between notifications and teardown.

use std::fmt;
use std::sync::mpsc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

/// Tracing layer that parks the logging thread at the first event whose
/// message matches, until [`PauseHandle::release`] is called.
pub(crate) struct PauseAtEvent {
    message: &'static str,
    reached: Mutex<mpsc::SyncSender<()>>,
    release: Mutex<Option<mpsc::Receiver<()>>>,
}

pub(crate) struct PauseHandle {
    reached: mpsc::Receiver<()>,
    release: mpsc::SyncSender<()>,
}

impl PauseAtEvent {
    pub(crate) fn new(message: &'static str) -> (Self, PauseHandle) {
        let (reached_tx, reached_rx) = mpsc::sync_channel(1);
        let (release_tx, release_rx) = mpsc::sync_channel(1);
        let layer = Self {
            message,
            reached: Mutex::new(reached_tx),
            release: Mutex::new(Some(release_rx)),
        };
        let handle = PauseHandle {
            reached: reached_rx,
            release: release_tx,
        };
        (layer, handle)
    }
}

impl<S: Subscriber> Layer<S> for PauseAtEvent {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut message = MessageField(String::new());
        event.record(&mut message);
        if message.0 != self.message {
            return;
        }
        let Some(release) = self.release.lock().take() else {
            return;
        };
        let _ = self.reached.lock().send(());
        let _ = release.recv_timeout(Duration::from_secs(5));
    }
}

impl PauseHandle {
    /// Block until the paused thread reaches the event.
    pub(crate) fn wait_reached(&self) {
        self.reached
            .recv_timeout(Duration::from_secs(5))
            .expect("paused event never logged");
    }

    pub(crate) fn release(&self) {
        let _ = self.release.send(());
    }
}

struct MessageField(String);

impl Visit for MessageField {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.0 = format!("{value:?}");
        }
    }
}
