//! Supervised background threads with cooperative cancellation.
//!
//! A [`Task`] owns a named OS thread and the sending half of a
//! `crossbeam-channel` channel. Nothing is ever sent on it: dropping the
//! sender disconnects the channel, which every [`CancelToken`] observes.

use std::io;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::Mutex;
use tracing::{debug, warn};

/// Cancellation signal handed to the task body.
#[derive(Clone)]
pub struct CancelToken {
    rx: Receiver<()>,
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        matches!(self.rx.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Sleep for up to `timeout`, waking early on cancellation.
    /// Returns true if the task was cancelled.
    pub fn wait(&self, timeout: Duration) -> bool {
        match self.rx.recv_timeout(timeout) {
            Err(RecvTimeoutError::Timeout) => false,
            Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
        }
    }
}

/// A named background thread that can be cancelled and joined.
pub struct Task {
    name: String,
    thread_id: ThreadId,
    handle: Mutex<Option<JoinHandle<()>>>,
    cancel: Mutex<Option<Sender<()>>>,
}

impl Task {
    pub fn spawn<F>(name: &str, body: F) -> io::Result<Task>
    where
        F: FnOnce(CancelToken) + Send + 'static,
    {
        let (tx, rx) = crossbeam_channel::bounded::<()>(0);
        let token = CancelToken { rx };
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || body(token))?;
        debug!(task = name, "task spawned");
        Ok(Task {
            name: name.to_string(),
            thread_id: handle.thread().id(),
            handle: Mutex::new(Some(handle)),
            cancel: Mutex::new(Some(tx)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Signal cancellation. Idempotent.
    pub fn cancel(&self) {
        if self.cancel.lock().take().is_some() {
            debug!(task = %self.name, "task cancelled");
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.lock().is_none()
    }

    pub fn is_finished(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .map_or(true, JoinHandle::is_finished)
    }

    /// Wait for the thread to exit. A no-op when called from the task's own
    /// thread or after a previous join.
    pub fn join(&self) {
        if thread::current().id() == self.thread_id {
            return;
        }
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!(task = %self.name, "task panicked");
            }
        }
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        self.cancel();
    }
}
