//! Progress indication during provider calls.
//!
//! The orchestrator starts an indicator right before a live provider
//! request and stops it when the call settles. Cache hits never show
//! one.

use colored::Colorize;
use crossterm::{
    cursor, execute,
    terminal::{Clear, ClearType},
};
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Capability: show that a blocking operation is in flight
pub trait ProgressIndicator: Send + Sync {
    fn start(&self);
    fn stop(&self);
}

/// Indicator that does nothing. Default for non-interactive sinks and
/// tests.
pub struct NoOpProgress;

impl ProgressIndicator for NoOpProgress {
    fn start(&self) {}
    fn stop(&self) {}
}

const FRAMES: [&str; 8] = ["⣾", "⣽", "⣻", "⢿", "⡿", "⣟", "⣯", "⣷"];
const TICK: Duration = Duration::from_millis(100);

/// Terminal spinner on a background thread, with elapsed seconds
pub struct Spinner {
    message: String,
    state: Mutex<Option<SpinnerState>>,
}

struct SpinnerState {
    stop: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

impl Spinner {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            state: Mutex::new(None),
        }
    }
}

impl ProgressIndicator for Spinner {
    fn start(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.is_some() {
            return;
        }

        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let message = self.message.clone();

        let thread = thread::spawn(move || {
            let started = Instant::now();
            let mut stderr = io::stderr();
            for frame in FRAMES.iter().cycle() {
                if flag.load(Ordering::Relaxed) {
                    break;
                }
                let elapsed = started.elapsed().as_secs_f32();
                let _ = write!(
                    stderr,
                    "\r{} {} {:.1}s",
                    message.cyan(),
                    frame,
                    elapsed
                );
                let _ = stderr.flush();
                thread::sleep(TICK);
            }
            let _ = execute!(stderr, cursor::MoveToColumn(0), Clear(ClearType::CurrentLine));
        });

        *state = Some(SpinnerState { stop, thread });
    }

    fn stop(&self) {
        let taken = self
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(state) = taken {
            state.stop.store(true, Ordering::Relaxed);
            let _ = state.thread.join();
        }
    }
}

impl Drop for Spinner {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noop_progress_is_inert() {
        let progress = NoOpProgress;
        progress.start();
        progress.stop();
    }

    #[test]
    fn test_spinner_start_stop() {
        let spinner = Spinner::new("working");
        spinner.start();
        thread::sleep(Duration::from_millis(50));
        spinner.stop();
        // stopping again is a no-op
        spinner.stop();
    }

    #[test]
    fn test_spinner_double_start_keeps_one_thread() {
        let spinner = Spinner::new("working");
        spinner.start();
        spinner.start();
        spinner.stop();
    }
}
