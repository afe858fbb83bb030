//! Session events and the sinks that receive them.

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, MutexGuard};

/// Raw bytes from one read of the console output.
///
/// No framing and no decoding; the consumer decides what the bytes mean.
#[derive(Clone, PartialEq, Eq)]
pub struct OutputChunk {
    data: Box<[u8]>,
}

impl OutputChunk {
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data.into_vec()
    }
}

impl From<&[u8]> for OutputChunk {
    fn from(bytes: &[u8]) -> Self {
        Self { data: bytes.into() }
    }
}

impl Deref for OutputChunk {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl fmt::Debug for OutputChunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OutputChunk({:?})", String::from_utf8_lossy(&self.data))
    }
}

/// Session events
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEvent {
    /// Output from the shell, emitted on the output pump thread
    Output(OutputChunk),
    /// The shell exited on its own with this code
    Exited(i32),
}

/// The consumer has gone away.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Disconnected;

/// Receives session events.
///
/// Called from the session's background threads. Keep it quick: the output
/// pump does not read again until `deliver` returns.
pub trait EventSink: Send + Sync {
    fn deliver(&self, event: SessionEvent) -> Result<(), Disconnected>;
}

impl EventSink for Sender<SessionEvent> {
    fn deliver(&self, event: SessionEvent) -> Result<(), Disconnected> {
        self.send(event).map_err(|_| Disconnected)
    }
}

/// Adapts a closure into an [`EventSink`].
pub struct HandlerSink<F>(pub F);

impl<F> EventSink for HandlerSink<F>
where
    F: Fn(SessionEvent) + Send + Sync,
{
    fn deliver(&self, event: SessionEvent) -> Result<(), Disconnected> {
        (self.0)(event);
        Ok(())
    }
}

/// The session's subscription slot.
///
/// Once `close` returns, no further output reaches the sink. Handlers must
/// not call back into `close` (that is, `Session::unsubscribe`) from inside
/// `deliver`.
///
/// A sealed gate drops events without closing the sink; `reopen` lifts the
/// seal when the session starts again.
pub(crate) struct EventGate {
    sink: Mutex<Option<Arc<dyn EventSink>>>,
    sealed: AtomicBool,
}

impl EventGate {
    pub(crate) fn new(sink: Box<dyn EventSink>) -> Self {
        Self {
            sink: Mutex::new(Some(Arc::from(sink))),
            sealed: AtomicBool::new(false),
        }
    }

    fn sink(&self) -> MutexGuard<'_, Option<Arc<dyn EventSink>>> {
        self.sink.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Deliver an event. Returns `false` if nobody is listening any more.
    pub(crate) fn emit(&self, event: SessionEvent) -> bool {
        let mut sink = self.sink();
        if self.sealed.load(Ordering::SeqCst) {
            return false;
        }
        let delivered = match sink.as_ref() {
            Some(s) => s.deliver(event).is_ok(),
            None => return false,
        };
        if !delivered {
            *sink = None;
        }
        delivered
    }

    /// Seal the gate for the rest of the run and hand back the sink for
    /// one last delivery.
    ///
    /// The last event goes out after the lock is released, so its handler
    /// may start the session again.
    pub(crate) fn seal(&self) -> Option<Arc<dyn EventSink>> {
        let sink = self.sink();
        if self.sealed.swap(true, Ordering::SeqCst) {
            return None;
        }
        sink.clone()
    }

    pub(crate) fn reopen(&self) {
        self.sealed.store(false, Ordering::SeqCst);
    }

    pub(crate) fn close(&self) {
        self.sink().take();
    }
}
