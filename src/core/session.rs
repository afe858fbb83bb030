//! Session management
//!
//! A [`Session`] ties one pseudo console, one shell process, the output pump
//! and the exit watcher together, and drives the lifecycle in
//! [`SessionState`].
//!
//! Teardown always closes before it joins: the console goes first, then the
//! input pipe, then the shell, and the pending output read is cancelled.
//! Only then are the background threads joined.

use std::cell::Cell;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use super::console::{ConsoleIo, PseudoConsole, TermSize};
use super::error::{PtyError, Result, StartFailed, StartStage};
use super::event::{EventGate, EventSink, SessionEvent};
use super::input::{line_bytes, ControlKey, InputChannel};
use super::pipe::PipeEndpoint;
use super::process::{ChildProcess, ExitWatch, ProcessSupervisor, ShellCommand};
use super::pump::{OutputPump, PumpExit, DEFAULT_BUFFER_SIZE};
use super::state::{SessionState, StateCell, StopCause};

/// How long teardown waits for a terminated shell to be reaped.
const REAP_TIMEOUT: Duration = Duration::from_secs(1);

/// How a session launches and runs its shell.
#[derive(Clone, Debug)]
pub struct SessionOptions {
    pub command: ShellCommand,
    /// Used when `start` is not given a directory
    pub working_dir: Option<PathBuf>,
    pub read_buffer_size: usize,
    pub exit_poll_interval: Duration,
    /// How long exit handling waits for the remaining output
    pub drain_timeout: Duration,
}

impl SessionOptions {
    pub fn new(command: ShellCommand) -> Self {
        Self {
            command,
            working_dir: None,
            read_buffer_size: DEFAULT_BUFFER_SIZE,
            exit_poll_interval: Duration::from_millis(100),
            drain_timeout: Duration::from_secs(2),
        }
    }
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::new(crate::config::resolve_shell())
    }
}

/// Everything one run owns. Field order is drop order.
struct RunIo {
    input: InputChannel,
    output: Arc<PipeEndpoint>,
    console: PseudoConsole,
    child: ChildProcess,
}

struct ActiveRun {
    io: Arc<RunIo>,
    pump: Option<JoinHandle<PumpExit>>,
    watcher: Option<JoinHandle<()>>,
}

type RunSlot = Arc<Mutex<Option<ActiveRun>>>;

fn lock_slot(slot: &Mutex<Option<ActiveRun>>) -> MutexGuard<'_, Option<ActiveRun>> {
    slot.lock().unwrap_or_else(|e| e.into_inner())
}

fn is_current(handle: &JoinHandle<impl Sized>) -> bool {
    handle.thread().id() == thread::current().id()
}

/// A shell running inside a pseudo console
pub struct Session {
    options: SessionOptions,
    state: Arc<StateCell>,
    events: Arc<EventGate>,
    run: RunSlot,
    size: Mutex<TermSize>,
}

impl Session {
    /// Create a session whose events arrive on the returned receiver.
    pub fn new(options: SessionOptions) -> (Self, Receiver<SessionEvent>) {
        let (tx, rx) = mpsc::channel();
        (Self::with_sink(options, tx), rx)
    }

    /// Create a session that delivers events to `sink`.
    pub fn with_sink(options: SessionOptions, sink: impl EventSink + 'static) -> Self {
        Self {
            options,
            state: Arc::new(StateCell::new()),
            events: Arc::new(EventGate::new(Box::new(sink))),
            run: Arc::new(Mutex::new(None)),
            size: Mutex::new(TermSize::default()),
        }
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    /// Start the shell at `cols` x `rows`.
    ///
    /// All or nothing: on error every resource acquired by this attempt has
    /// been released and the session is back in `Created`.
    pub fn start(&self, cols: u16, rows: u16, working_dir: Option<&Path>) -> std::result::Result<(), StartFailed> {
        let mut slot = lock_slot(&self.run);

        if let Err(current) = self.state.begin_start() {
            debug!("Start refused in state {:?}", current);
            return Err(StartFailed::new(StartStage::Validate, PtyError::AlreadyActive));
        }

        match self.launch(cols, rows, working_dir) {
            Ok(run) => {
                *slot = Some(run);
                Ok(())
            }
            Err(e) => {
                self.state.set(SessionState::Created);
                warn!("{}", e);
                Err(e)
            }
        }
    }

    fn launch(&self, cols: u16, rows: u16, working_dir: Option<&Path>) -> std::result::Result<ActiveRun, StartFailed> {
        let size = TermSize::new(cols, rows)
            .validate()
            .map_err(|e| StartFailed::new(StartStage::Validate, e))?;
        let working_dir = working_dir.or(self.options.working_dir.as_deref());

        let console_io = PseudoConsole::open(size).map_err(StartFailed::from_acquire)?;
        // On failure `console_io` drops pipes first, then the console.
        let child = ProcessSupervisor::spawn(&self.options.command, working_dir, &console_io.console)
            .map_err(StartFailed::from_acquire)?;

        let ConsoleIo { input, output, console } = console_io;
        let pid = child.pid();
        let io = Arc::new(RunIo {
            input: InputChannel::new(input),
            output: Arc::new(output),
            console,
            child,
        });

        self.events.reopen();
        // Running before the threads exist, so an immediate exit or
        // end-of-stream is claimed against this run.
        self.state.set(SessionState::Running);

        let (done_tx, done_rx) = mpsc::channel();
        let pump = match OutputPump::spawn(
            io.output.clone(),
            self.options.read_buffer_size,
            self.events.clone(),
            self.state.clone(),
            done_tx,
        ) {
            Ok(handle) => handle,
            Err(e) => {
                self.abort(&io, None);
                return Err(StartFailed::new(StartStage::Threads, PtyError::ThreadSpawn(e)));
            }
        };

        let watch = ExitWatcher {
            io: io.clone(),
            state: self.state.clone(),
            events: self.events.clone(),
            slot: self.run.clone(),
            pump_done: done_rx,
            poll: self.options.exit_poll_interval,
            drain_timeout: self.options.drain_timeout,
        };
        let watcher = match thread::Builder::new()
            .name("ptyhost-exit".to_string())
            .spawn(move || watch.run())
        {
            Ok(handle) => handle,
            Err(e) => {
                self.abort(&io, Some(pump));
                return Err(StartFailed::new(StartStage::Threads, PtyError::ThreadSpawn(e)));
            }
        };

        *self.size.lock().unwrap_or_else(|e| e.into_inner()) = size;
        info!(
            "Session started: pid {} at {} running {}",
            pid, size, self.options.command
        );

        Ok(ActiveRun {
            io,
            pump: Some(pump),
            watcher: Some(watcher),
        })
    }

    /// Undo a start whose threads could not all be created.
    fn abort(&self, io: &RunIo, pump: Option<JoinHandle<PumpExit>>) {
        self.state.begin_stop(StopCause::Caller);
        close_run(io);
        if let Some(pump) = pump {
            let _ = pump.join();
        }
        reap(&io.child);
    }

    /// Tear the session down.
    ///
    /// Safe to call from any thread and any number of times; calls after the
    /// first do nothing. Called from an event handler, the handler's own
    /// thread is not joined.
    pub fn stop(&self) {
        let Some(mut run) = lock_slot(&self.run).take() else {
            return;
        };

        let claimed = self.state.begin_stop(StopCause::Caller);
        close_run(&run.io);

        let on_pump = run.pump.as_ref().is_some_and(is_current);
        if let Some(watcher) = run.watcher.take() {
            // A watcher that owns the exit may be waiting on this very pump
            // thread; leave it to finish on its own.
            if !is_current(&watcher) && (claimed || !on_pump) {
                let _ = watcher.join();
            }
        }
        if let Some(pump) = run.pump.take() {
            if !on_pump {
                match pump.join() {
                    Ok(exit) => debug!("Output pump finished: {:?}", exit),
                    Err(_) => error!("Output pump panicked"),
                }
            }
        }
        reap(&run.io.child);
        drop(run);

        if claimed {
            self.state.set(SessionState::Stopped);
            info!("Session stopped");
        }
    }

    fn active_io(&self) -> Option<Arc<RunIo>> {
        lock_slot(&self.run).as_ref().map(|run| run.io.clone())
    }

    fn running_io(&self) -> Result<Arc<RunIo>> {
        if self.state.get() != SessionState::Running {
            return Err(PtyError::NotRunning);
        }
        self.active_io().ok_or(PtyError::NotRunning)
    }

    /// Send text to the shell as typed input.
    pub fn write(&self, text: &str) {
        self.write_raw(text.as_bytes());
    }

    /// Send raw bytes to the shell.
    ///
    /// Best effort: failures are logged and otherwise ignored.
    pub fn write_raw(&self, data: &[u8]) {
        let result = self.running_io().and_then(|io| io.input.write(data));
        match result {
            Ok(()) => {}
            Err(PtyError::NotRunning) => debug!("Dropped {} bytes of input: session not running", data.len()),
            Err(e) => warn!("{}", e),
        }
    }

    /// `text` followed by Enter
    pub fn send_line(&self, text: &str) {
        self.write_raw(&line_bytes(text));
    }

    /// Ctrl+C
    pub fn send_interrupt(&self) {
        self.send_control(ControlKey::Interrupt);
    }

    /// Ctrl+D
    pub fn send_eof(&self) {
        self.send_control(ControlKey::Eof);
    }

    pub fn send_control(&self, key: ControlKey) {
        self.write_raw(key.bytes());
    }

    /// Resize the console.
    ///
    /// A failed resize is logged and reported but leaves the session running.
    pub fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        let io = self.running_io()?;
        match io.console.resize(cols, rows) {
            Ok(()) => {
                *self.size.lock().unwrap_or_else(|e| e.into_inner()) = io.console.size();
                debug!("Resized to {}x{}", cols, rows);
                Ok(())
            }
            Err(e) => {
                warn!("{}", e);
                Err(e)
            }
        }
    }

    pub fn state(&self) -> SessionState {
        self.state.get()
    }

    pub fn is_running(&self) -> bool {
        self.state.get() == SessionState::Running
    }

    /// Size of the current or most recent run
    pub fn size(&self) -> TermSize {
        *self.size.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Shell process id while a run is active
    pub fn pid(&self) -> Option<u32> {
        self.active_io().map(|io| io.child.pid())
    }

    /// Exit code of the last run that ended with the shell exiting
    pub fn exit_code(&self) -> Option<i32> {
        self.state.exit_code()
    }

    /// Block until the session is `Stopped` or `Exited`, or `timeout` passes.
    pub fn wait_for_exit(&self, timeout: Duration) -> SessionState {
        self.state.wait_terminal(timeout)
    }

    /// Stop delivering events. Must not be called from inside a handler.
    pub fn unsubscribe(&self) {
        self.events.close();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Close everything a blocked pump or watcher could be waiting on.
fn close_run(io: &RunIo) {
    io.console.close();
    io.input.close();
    if io.child.exit_code().is_none() {
        if let Err(e) = io.child.terminate() {
            warn!("Failed to terminate shell {}: {}", io.child.pid(), e);
        }
    }
    io.output.cancel_io();
}

/// Wait for a terminated shell so it does not linger as a zombie.
fn reap(child: &ChildProcess) {
    match child.wait_timeout(REAP_TIMEOUT) {
        Ok(Some(code)) => debug!("Shell {} reaped with {}", child.pid(), code),
        Ok(None) => warn!("Shell {} still running {:?} after stop", child.pid(), REAP_TIMEOUT),
        Err(e) => debug!("Reaping shell {} failed: {}", child.pid(), e),
    }
}

/// Where the watcher stands with a shell whose output has ended.
#[derive(Clone, Copy)]
enum Orphan {
    Unseen,
    Since(Instant),
    Terminated,
}

/// State for the exit watcher thread.
struct ExitWatcher {
    io: Arc<RunIo>,
    state: Arc<StateCell>,
    events: Arc<EventGate>,
    slot: RunSlot,
    pump_done: Receiver<()>,
    poll: Duration,
    drain_timeout: Duration,
}

impl ExitWatcher {
    fn run(self) {
        let orphan = Cell::new(Orphan::Unseen);
        let watch = ProcessSupervisor::watch_exit(&self.io.child, self.poll, || {
            if self.state.stopped_by_caller() {
                return false;
            }
            if self.state.stream_ended() {
                self.end_orphaned_shell(&orphan);
            }
            true
        });

        match watch {
            ExitWatch::Exited(code) => {
                if self.state.begin_stop(StopCause::ChildExit) {
                    self.finish(code);
                } else {
                    debug!("Shell exited with {} during stop", code);
                }
            }
            ExitWatch::Abandoned => debug!("Exit watch abandoned"),
            ExitWatch::WaitFailed(e) => error!("Waiting for shell exit failed: {}", e),
        }
    }

    /// The output is gone but the shell is not. Give it `drain_timeout` to
    /// exit by itself, then terminate it so the run still ends in `Exited`.
    fn end_orphaned_shell(&self, orphan: &Cell<Orphan>) {
        match orphan.get() {
            Orphan::Unseen => orphan.set(Orphan::Since(Instant::now())),
            Orphan::Since(at) if at.elapsed() >= self.drain_timeout => {
                warn!(
                    "Output ended but shell {} is still running; terminating it",
                    self.io.child.pid()
                );
                if let Err(e) = self.io.child.terminate() {
                    warn!("Failed to terminate shell {}: {}", self.io.child.pid(), e);
                }
                orphan.set(Orphan::Terminated);
            }
            Orphan::Since(_) | Orphan::Terminated => {}
        }
    }

    fn finish(self, code: i32) {
        info!("Shell exited with code {}", code);

        // Closing the console lets it flush and end the output stream.
        self.io.console.close();
        let drained = self.wait_for_pump();
        self.io.input.close();

        let released = lock_slot(&self.slot).take();
        if let Some(mut run) = released {
            if let Some(pump) = run.pump.take() {
                if drained {
                    let _ = pump.join();
                }
            }
        }
        drop(self.io);

        // Seal first so a restart issued once the state reads Exited keeps
        // its own output.
        let sink = self.events.seal();
        self.state.finish_exited(code);
        if let Some(sink) = sink {
            let _ = sink.deliver(SessionEvent::Exited(code));
        }
    }

    /// Wait for the pump to deliver the last output. Returns whether it did.
    fn wait_for_pump(&self) -> bool {
        match self.pump_done.recv_timeout(self.drain_timeout) {
            Err(RecvTimeoutError::Disconnected) | Ok(()) => return true,
            Err(RecvTimeoutError::Timeout) => {}
        }

        debug!("Output still open {:?} after exit, cancelling read", self.drain_timeout);
        self.io.output.cancel_io();
        match self.pump_done.recv_timeout(self.drain_timeout) {
            Err(RecvTimeoutError::Timeout) => {
                warn!("Output pump did not finish after shell exit");
                false
            }
            _ => true,
        }
    }
}
