//! Output pump
//!
//! A dedicated thread that reads the console output pipe and hands every
//! chunk to the session's event sink as-is.

use std::io;
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, error};

use super::error::PtyError;
use super::event::{EventGate, OutputChunk, SessionEvent};
use super::pipe::PipeEndpoint;
use super::state::{SessionState, StateCell, StopCause};

/// Default read buffer size
pub const DEFAULT_BUFFER_SIZE: usize = 8192;

/// Why the pump stopped.
#[derive(Debug)]
pub enum PumpExit {
    /// A read returned zero bytes.
    EndOfStream,
    /// A read failed after the session had left `Running`.
    Cancelled,
    /// A read failed while the session was running.
    Failed(PtyError),
}

/// Read until end-of-stream or error.
///
/// Every non-empty read becomes exactly one `Output` event. If the consumer
/// goes away the pump keeps draining the pipe without emitting, so the shell
/// never blocks on a full output pipe.
pub(crate) fn run(reader: &PipeEndpoint, buffer_size: usize, events: &EventGate, state: &StateCell) -> PumpExit {
    let mut buffer = vec![0u8; buffer_size.max(1)];
    let mut listening = true;

    loop {
        match reader.read(&mut buffer) {
            Ok(0) => {
                if state.begin_stop(StopCause::StreamEnded) {
                    debug!("Console output reached end-of-stream");
                }
                return PumpExit::EndOfStream;
            }
            Ok(n) => {
                // A caller stop ends delivery even when it was issued from an
                // output handler on this thread.
                if listening && state.stopped_by_caller() {
                    listening = false;
                }
                if listening && !events.emit(SessionEvent::Output(OutputChunk::from(&buffer[..n]))) {
                    debug!("Output consumer gone, draining without events");
                    listening = false;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                if state.get() != SessionState::Running {
                    debug!("Output read ended during shutdown: {}", e);
                    return PumpExit::Cancelled;
                }
                let err = PtyError::ReadTermination(e);
                error!("Output pump stopped abnormally: {}", err);
                state.begin_stop(StopCause::StreamEnded);
                return PumpExit::Failed(err);
            }
        }
    }
}

/// Thread wrapper around [`run`].
pub struct OutputPump;

impl OutputPump {
    /// Start the pump thread.
    ///
    /// `done` is dropped when the thread finishes, so a receiver on the other
    /// end sees a disconnect once the last chunk has been delivered.
    pub(crate) fn spawn(
        reader: Arc<PipeEndpoint>,
        buffer_size: usize,
        events: Arc<EventGate>,
        state: Arc<StateCell>,
        done: Sender<()>,
    ) -> io::Result<JoinHandle<PumpExit>> {
        thread::Builder::new()
            .name("ptyhost-output".to_string())
            .spawn(move || {
                let exit = run(&reader, buffer_size, &events, &state);
                drop(done);
                exit
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::event::HandlerSink;
    use crate::core::pipe::create_pipe_pair;
    use std::sync::mpsc;
    use std::time::Duration;

    fn running_state() -> Arc<StateCell> {
        let state = Arc::new(StateCell::new());
        state.begin_start().unwrap();
        state.set(SessionState::Running);
        state
    }

    #[test]
    fn test_chunks_are_forwarded_verbatim() {
        let (read_end, write_end) = create_pipe_pair(false).unwrap();
        let (tx, rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel();
        let state = running_state();

        let pump = OutputPump::spawn(
            Arc::new(read_end),
            16,
            Arc::new(EventGate::new(Box::new(tx))),
            state.clone(),
            done_tx,
        )
        .unwrap();

        write_end.write_all(b"\x1b[1mbold\xe2\x82").unwrap();
        write_end.write_all(b"\xac tail").unwrap();
        drop(write_end);

        assert!(matches!(pump.join().unwrap(), PumpExit::EndOfStream));
        assert_eq!(done_rx.recv(), Err(mpsc::RecvError));

        let mut received = Vec::new();
        for event in rx.try_iter() {
            match event {
                SessionEvent::Output(chunk) => {
                    assert!(!chunk.is_empty() && chunk.len() <= 16);
                    received.extend_from_slice(&chunk);
                }
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert_eq!(received, b"\x1b[1mbold\xe2\x82\xac tail".to_vec());
        assert_eq!(state.get(), SessionState::Stopping);
    }

    #[test]
    fn test_keeps_draining_after_unsubscribe() {
        let (read_end, write_end) = create_pipe_pair(false).unwrap();
        let (tx, rx) = mpsc::channel();
        let events = Arc::new(EventGate::new(Box::new(tx)));
        let state = running_state();

        let reader = Arc::new(read_end);
        let (done_tx, _done_rx) = mpsc::channel();
        let pump = OutputPump::spawn(reader, 64, events.clone(), state, done_tx).unwrap();

        write_end.write_all(b"first").unwrap();
        let first = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(first, SessionEvent::Output(OutputChunk::from(&b"first"[..])));

        events.close();
        // More than a pipe buffer; this would block forever if nobody drained.
        write_end.write_all(&vec![b'x'; 1024 * 1024]).unwrap();
        drop(write_end);

        assert!(matches!(pump.join().unwrap(), PumpExit::EndOfStream));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_eof_while_stopping_leaves_state() {
        let (read_end, write_end) = create_pipe_pair(false).unwrap();
        let state = running_state();
        assert!(state.begin_stop(StopCause::Caller));
        drop(write_end);

        let events = EventGate::new(Box::new(HandlerSink(|_| {})));
        assert!(matches!(run(&read_end, 64, &events, &state), PumpExit::EndOfStream));
        assert!(state.stopped_by_caller());
    }

    #[test]
    fn test_read_error_while_running_fails_the_stream() {
        // The write end refuses reads.
        let (_read_end, write_end) = create_pipe_pair(false).unwrap();
        let state = running_state();
        let (tx, rx) = mpsc::channel();
        let events = EventGate::new(Box::new(tx));

        let exit = run(&write_end, 64, &events, &state);
        assert!(matches!(exit, PumpExit::Failed(PtyError::ReadTermination(_))), "got {:?}", exit);
        assert_eq!(state.get(), SessionState::Stopping);
        assert!(!state.stopped_by_caller());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_read_error_while_stopping_is_cancellation() {
        let (_read_end, write_end) = create_pipe_pair(false).unwrap();
        let state = running_state();
        assert!(state.begin_stop(StopCause::Caller));
        let (tx, rx) = mpsc::channel();
        let events = EventGate::new(Box::new(tx));

        let exit = run(&write_end, 64, &events, &state);
        assert!(matches!(exit, PumpExit::Cancelled), "got {:?}", exit);
        assert_eq!(state.get(), SessionState::Stopping);
        assert!(state.stopped_by_caller());
        assert!(rx.try_recv().is_err());
    }
}
