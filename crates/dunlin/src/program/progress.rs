use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::RecvTimeoutError;

/// First report comes after this delay, collapsing short analyses into no
/// report at all.
const INITIAL_DELAY: Duration = Duration::from_millis(100);
/// Reports repeat at most this often while updates keep arriving.
const REPEAT_DELAY: Duration = Duration::from_millis(300);
/// The report dismisses this long after the last update.
const DISMISS_AFTER: Duration = Duration::from_millis(1500);

/// Where "N modules remaining" lines go. The host decides how they
/// render; the analyzer never formats UI.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, remaining: usize);

    fn dismiss(&self);
}

/// Background ticker that rate-limits progress updates: bursts collapse to
/// the latest value, and the display auto-dismisses shortly after the last
/// update.
pub struct ProgressTicker {
    sender: Option<crossbeam_channel::Sender<usize>>,
    handle: Option<JoinHandle<()>>,
}

impl ProgressTicker {
    pub fn new(reporter: Arc<dyn ProgressReporter>) -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded();
        let handle = std::thread::spawn(move || {
            ticker_loop(&receiver, &*reporter);
        });
        Self {
            sender: Some(sender),
            handle: Some(handle),
        }
    }

    pub fn update(&self, remaining: usize) {
        if let Some(sender) = &self.sender {
            sender.send(remaining).ok();
        }
    }

    /// Stops the ticker, dismissing any visible report.
    pub fn finish(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.sender.take();
        if let Some(handle) = self.handle.take() {
            handle.join().ok();
        }
    }
}

impl Drop for ProgressTicker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn ticker_loop(receiver: &crossbeam_channel::Receiver<usize>, reporter: &dyn ProgressReporter) {
    let mut latest: Option<usize> = None;
    let mut visible = false;
    let mut next_emit: Option<Instant> = None;
    let mut last_update = Instant::now();

    loop {
        let now = Instant::now();

        // Emit when due, with the latest value only.
        if let (Some(due), Some(value)) = (next_emit, latest) {
            if now >= due {
                reporter.report(value);
                visible = true;
                next_emit = None;
                latest = None;
            }
        }

        if visible && latest.is_none() && now.duration_since(last_update) >= DISMISS_AFTER {
            reporter.dismiss();
            visible = false;
        }

        let mut deadline = Instant::now() + DISMISS_AFTER;
        if let Some(due) = next_emit {
            deadline = deadline.min(due);
        }
        if visible {
            deadline = deadline.min(last_update + DISMISS_AFTER);
        }

        match receiver.recv_deadline(deadline) {
            Ok(value) => {
                latest = Some(value);
                last_update = Instant::now();
                if next_emit.is_none() {
                    let delay = if visible { REPEAT_DELAY } else { INITIAL_DELAY };
                    next_emit = Some(Instant::now() + delay);
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                if visible {
                    reporter.dismiss();
                }
                break;
            }
        }
    }
}
