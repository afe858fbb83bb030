//! Session lifecycle state shared by the caller and the background threads.

use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Session lifecycle
///
/// ```text
/// Created → Starting → Running → Stopping → Stopped   (caller stopped it)
///                                         → Exited    (shell exited)
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
    Exited,
}

impl SessionState {
    /// Stopped and Exited hold no resources; a new start is allowed.
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Stopped | SessionState::Exited)
    }

    /// States from which `start` may begin a fresh cycle.
    pub fn can_start(self) -> bool {
        matches!(self, SessionState::Created | SessionState::Stopped | SessionState::Exited)
    }
}

/// Who moved the session into `Stopping`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum StopCause {
    /// `stop()` or drop
    Caller,
    /// The exit watcher saw the shell exit
    ChildExit,
    /// The output pump hit end-of-stream or a read error first
    StreamEnded,
}

struct Inner {
    state: SessionState,
    cause: Option<StopCause>,
    exit_code: Option<i32>,
}

pub(crate) struct StateCell {
    inner: Mutex<Inner>,
    changed: Condvar,
}

impl StateCell {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: SessionState::Created,
                cause: None,
                exit_code: None,
            }),
            changed: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn get(&self) -> SessionState {
        self.lock().state
    }

    pub(crate) fn exit_code(&self) -> Option<i32> {
        self.lock().exit_code
    }

    /// Enter `Starting` from a startable state, clearing the previous run.
    pub(crate) fn begin_start(&self) -> Result<(), SessionState> {
        let mut inner = self.lock();
        if !inner.state.can_start() {
            return Err(inner.state);
        }
        inner.state = SessionState::Starting;
        inner.cause = None;
        inner.exit_code = None;
        self.changed.notify_all();
        Ok(())
    }

    pub(crate) fn set(&self, state: SessionState) {
        let mut inner = self.lock();
        inner.state = state;
        self.changed.notify_all();
    }

    /// Try to move into `Stopping` on behalf of `cause`.
    ///
    /// Caller stop and child exit may both take over from a stream-ended
    /// stop, but never from each other, so exactly one of them finishes the
    /// session. Returns whether this call claimed the teardown.
    pub(crate) fn begin_stop(&self, cause: StopCause) -> bool {
        let mut inner = self.lock();
        let claim = match (inner.state, inner.cause) {
            (SessionState::Running, _) => true,
            (SessionState::Stopping, Some(StopCause::StreamEnded)) => cause != StopCause::StreamEnded,
            _ => false,
        };
        if claim {
            inner.state = SessionState::Stopping;
            inner.cause = Some(cause);
            self.changed.notify_all();
        }
        claim
    }

    pub(crate) fn stopped_by_caller(&self) -> bool {
        self.lock().cause == Some(StopCause::Caller)
    }

    /// The output stream ended and nobody has taken over the stop yet.
    pub(crate) fn stream_ended(&self) -> bool {
        self.lock().cause == Some(StopCause::StreamEnded)
    }

    pub(crate) fn finish_exited(&self, code: i32) {
        let mut inner = self.lock();
        inner.state = SessionState::Exited;
        inner.exit_code = Some(code);
        self.changed.notify_all();
    }

    /// Block until the state is terminal or `timeout` elapses; returns the
    /// state at that point.
    pub(crate) fn wait_terminal(&self, timeout: Duration) -> SessionState {
        let deadline = Instant::now() + timeout;
        let mut inner = self.lock();
        while !inner.state.is_terminal() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            inner = match self.changed.wait_timeout(inner, deadline - now) {
                Ok((guard, _)) => guard,
                Err(e) => e.into_inner().0,
            };
        }
        inner.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn running() -> StateCell {
        let cell = StateCell::new();
        cell.begin_start().unwrap();
        cell.set(SessionState::Running);
        cell
    }

    #[test]
    fn test_start_only_from_startable_states() {
        let cell = StateCell::new();
        assert!(cell.begin_start().is_ok());
        assert_eq!(cell.begin_start(), Err(SessionState::Starting));

        cell.set(SessionState::Exited);
        assert!(cell.begin_start().is_ok());
    }

    #[test]
    fn test_caller_and_child_exit_are_exclusive() {
        let cell = running();
        assert!(cell.begin_stop(StopCause::Caller));
        assert!(!cell.begin_stop(StopCause::ChildExit));
        assert!(cell.stopped_by_caller());

        let cell = running();
        assert!(cell.begin_stop(StopCause::ChildExit));
        assert!(!cell.begin_stop(StopCause::Caller));
        assert!(!cell.stopped_by_caller());
    }

    #[test]
    fn test_stream_end_can_be_taken_over() {
        let cell = running();
        assert!(cell.begin_stop(StopCause::StreamEnded));
        assert!(!cell.begin_stop(StopCause::StreamEnded));
        assert_eq!(cell.get(), SessionState::Stopping);
        assert!(cell.stream_ended());

        assert!(cell.begin_stop(StopCause::ChildExit));
        assert!(!cell.stream_ended());
        assert!(!cell.begin_stop(StopCause::Caller));
    }

    #[test]
    fn test_no_stop_claim_outside_running() {
        let cell = StateCell::new();
        assert!(!cell.begin_stop(StopCause::Caller));
        assert_eq!(cell.get(), SessionState::Created);
    }

    #[test]
    fn test_wait_terminal_wakes_on_exit() {
        let cell = Arc::new(running());
        let setter = cell.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            setter.finish_exited(3);
        });

        assert_eq!(cell.wait_terminal(Duration::from_secs(5)), SessionState::Exited);
        assert_eq!(cell.exit_code(), Some(3));
        handle.join().unwrap();
    }

    #[test]
    fn test_wait_terminal_times_out() {
        let cell = running();
        assert_eq!(cell.wait_terminal(Duration::from_millis(20)), SessionState::Running);
    }
}
