//! Pseudo console wrapper
//!
//! On Windows this wraps ConPTY (`CreatePseudoConsole`). On Unix it wraps a
//! pty master/slave pair. Either way the console carries its dimensions,
//! resizes in place, and closes exactly once.

use std::sync::{Mutex, MutexGuard};

use tracing::debug;

#[cfg(windows)]
use windows::Win32::System::Console::{
    ClosePseudoConsole, CreatePseudoConsole, ResizePseudoConsole, COORD, HPCON,
};

#[cfg(unix)]
use rustix::fd::OwnedFd;
#[cfg(unix)]
use rustix::fs::{Mode, OFlags};
#[cfg(unix)]
use rustix::io::FdFlags;
#[cfg(unix)]
use rustix::pty::OpenptFlags;
#[cfg(unix)]
use rustix::termios::Winsize;

#[cfg(windows)]
use super::error::win32_io_error;
use super::error::{PtyError, Result};
use super::pipe::PipeEndpoint;
#[cfg(windows)]
use super::pipe::create_pipe_pair;

/// Terminal dimensions in character cells.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TermSize {
    pub cols: u16,
    pub rows: u16,
}

impl TermSize {
    pub const fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }

    /// Both dimensions must be non-zero. ConPTY additionally takes them as
    /// signed 16-bit values.
    pub fn validate(self) -> Result<Self> {
        if self.cols == 0 || self.rows == 0 || self.cols > i16::MAX as u16 || self.rows > i16::MAX as u16 {
            return Err(PtyError::InvalidSize {
                cols: self.cols,
                rows: self.rows,
            });
        }
        Ok(self)
    }

    #[cfg(windows)]
    fn to_coord(self) -> COORD {
        COORD {
            X: self.cols as i16,
            Y: self.rows as i16,
        }
    }

    #[cfg(unix)]
    fn to_winsize(self) -> Winsize {
        Winsize {
            ws_row: self.rows,
            ws_col: self.cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        }
    }
}

impl Default for TermSize {
    fn default() -> Self {
        Self::new(80, 24)
    }
}

impl std::fmt::Display for TermSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.cols, self.rows)
    }
}

/// The native console object.
#[cfg(windows)]
struct NativeConsole {
    hpc: HPCON,
}

#[cfg(windows)]
impl NativeConsole {
    fn resize(&self, size: TermSize) -> std::io::Result<()> {
        unsafe { ResizePseudoConsole(self.hpc, size.to_coord()).map_err(win32_io_error) }
    }
}

#[cfg(windows)]
impl Drop for NativeConsole {
    fn drop(&mut self) {
        unsafe {
            ClosePseudoConsole(self.hpc);
        }
    }
}

#[cfg(unix)]
struct NativeConsole {
    master: OwnedFd,
    /// Parent copy of the slave, handed to the child at spawn and then
    /// dropped.
    slave: Option<OwnedFd>,
}

#[cfg(unix)]
impl NativeConsole {
    fn resize(&self, size: TermSize) -> std::io::Result<()> {
        rustix::termios::tcsetwinsize(&self.master, size.to_winsize()).map_err(Into::into)
    }
}

/// A pseudo console plus the two parent-side pipe endpoints used to talk to
/// it.
///
/// Dropped as a unit, the pipes close before the console, so an undrained
/// output pipe cannot stall `ClosePseudoConsole`.
pub struct ConsoleIo {
    /// Bytes written here reach the child as keyboard input.
    pub input: PipeEndpoint,
    /// Everything the child prints arrives here.
    pub output: PipeEndpoint,
    pub console: PseudoConsole,
}

/// Pseudo console handle
pub struct PseudoConsole {
    native: Mutex<Option<NativeConsole>>,
    size: Mutex<TermSize>,
}

// Safety: the HPCON is only touched behind the mutex, and ConPTY allows
// resize and close from any thread.
#[cfg(windows)]
unsafe impl Send for PseudoConsole {}
#[cfg(windows)]
unsafe impl Sync for PseudoConsole {}

impl PseudoConsole {
    /// Create a ConPTY reading from `input_read` and writing to
    /// `output_write`.
    ///
    /// Both endpoints are the child-facing ends. ConPTY duplicates them, so
    /// the parent copies are closed before this returns; otherwise the output
    /// pipe would never report end-of-stream.
    #[cfg(windows)]
    pub fn create(size: TermSize, input_read: PipeEndpoint, output_write: PipeEndpoint) -> Result<Self> {
        let size = size.validate()?;

        let hpc = unsafe {
            CreatePseudoConsole(size.to_coord(), input_read.raw(), output_write.raw(), 0)
                .map_err(|e| PtyError::ConsoleCreation(win32_io_error(e)))?
        };

        drop(input_read);
        drop(output_write);

        Ok(Self::from_native(NativeConsole { hpc }, size))
    }

    /// Allocate the pipes and the console in one step.
    ///
    /// Anything created before a failure is released on the way out.
    pub fn open(size: TermSize) -> Result<ConsoleIo> {
        let size = size.validate()?;

        #[cfg(windows)]
        {
            // Input pipe (we write, console reads)
            let (input_read, input_write) = create_pipe_pair(false)?;
            // Output pipe (console writes, we read)
            let (output_read, output_write) = create_pipe_pair(false)?;

            let console = Self::create(size, input_read, output_write)?;
            Ok(ConsoleIo {
                console,
                input: input_write,
                output: output_read,
            })
        }

        #[cfg(unix)]
        {
            let console_err = |e: rustix::io::Errno| PtyError::ConsoleCreation(e.into());

            let master = rustix::pty::openpt(OpenptFlags::RDWR | OpenptFlags::NOCTTY).map_err(console_err)?;
            rustix::io::fcntl_setfd(&master, FdFlags::CLOEXEC).map_err(console_err)?;
            rustix::pty::grantpt(&master).map_err(console_err)?;
            rustix::pty::unlockpt(&master).map_err(console_err)?;

            let name = rustix::pty::ptsname(&master, Vec::new()).map_err(console_err)?;
            let slave = rustix::fs::open(
                name.as_c_str(),
                OFlags::RDWR | OFlags::NOCTTY | OFlags::CLOEXEC,
                Mode::empty(),
            )
            .map_err(console_err)?;

            rustix::termios::tcsetwinsize(&master, size.to_winsize()).map_err(console_err)?;

            let input = PipeEndpoint::from_fd(master.try_clone().map_err(PtyError::ConsoleCreation)?);
            let output = PipeEndpoint::from_fd(master.try_clone().map_err(PtyError::ConsoleCreation)?);

            let console = Self::from_native(
                NativeConsole {
                    master,
                    slave: Some(slave),
                },
                size,
            );
            Ok(ConsoleIo { console, input, output })
        }
    }

    fn from_native(native: NativeConsole, size: TermSize) -> Self {
        Self {
            native: Mutex::new(Some(native)),
            size: Mutex::new(size),
        }
    }

    fn native(&self) -> MutexGuard<'_, Option<NativeConsole>> {
        self.native.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Resize the pseudo console.
    ///
    /// The recorded size only changes when the native resize succeeds.
    pub fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        let size = TermSize::new(cols, rows).validate()?;

        let native = self.native();
        let console = native.as_ref().ok_or(PtyError::NotRunning)?;
        console.resize(size).map_err(PtyError::Resize)?;

        *self.size.lock().unwrap_or_else(|e| e.into_inner()) = size;
        Ok(())
    }

    /// Current size
    pub fn size(&self) -> TermSize {
        *self.size.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Close the console. Returns `true` only for the call that actually
    /// closed it; later calls are no-ops.
    ///
    /// The parent-side pipe endpoints are not touched.
    pub fn close(&self) -> bool {
        let native = self.native().take();
        match native {
            Some(console) => {
                drop(console);
                debug!("Pseudo console closed");
                true
            }
            None => false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.native().is_none()
    }

    /// Run `f` with the raw console handle while holding the close lock.
    #[cfg(windows)]
    pub(crate) fn with_handle<R>(&self, f: impl FnOnce(HPCON) -> R) -> Result<R> {
        let native = self.native();
        let console = native.as_ref().ok_or(PtyError::NotRunning)?;
        Ok(f(console.hpc))
    }

    /// Run `f` with the slave side, which the child adopts as its
    /// controlling terminal.
    #[cfg(unix)]
    pub(crate) fn with_slave<R>(&self, f: impl FnOnce(&OwnedFd) -> R) -> Result<R> {
        let native = self.native();
        let slave = native
            .as_ref()
            .and_then(|console| console.slave.as_ref())
            .ok_or(PtyError::NotRunning)?;
        Ok(f(slave))
    }

    /// Drop the parent copy of the slave once the child holds its own.
    #[cfg(unix)]
    pub(crate) fn release_slave(&self) {
        if let Some(console) = self.native().as_mut() {
            console.slave = None;
        }
    }
}

impl Drop for PseudoConsole {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_validation() {
        assert!(TermSize::new(80, 24).validate().is_ok());
        assert!(matches!(
            TermSize::new(0, 24).validate(),
            Err(PtyError::InvalidSize { cols: 0, rows: 24 })
        ));
        assert!(TermSize::new(80, 0).validate().is_err());
        assert!(TermSize::new(u16::MAX, 24).validate().is_err());
    }

    #[test]
    fn test_open_and_resize() {
        let io = PseudoConsole::open(TermSize::new(80, 24)).unwrap();
        assert_eq!(io.console.size(), TermSize::new(80, 24));

        io.console.resize(132, 43).unwrap();
        assert_eq!(io.console.size(), TermSize::new(132, 43));
    }

    #[test]
    fn test_open_rejects_zero_size() {
        assert!(matches!(
            PseudoConsole::open(TermSize::new(0, 0)),
            Err(PtyError::InvalidSize { .. })
        ));
    }

    #[test]
    fn test_close_is_idempotent() {
        let io = PseudoConsole::open(TermSize::default()).unwrap();
        assert!(!io.console.is_closed());
        assert!(io.console.close());
        assert!(!io.console.close());
        assert!(io.console.is_closed());
    }

    #[test]
    fn test_resize_after_close_keeps_size() {
        let io = PseudoConsole::open(TermSize::new(100, 30)).unwrap();
        io.console.close();

        assert!(matches!(io.console.resize(120, 40), Err(PtyError::NotRunning)));
        assert_eq!(io.console.size(), TermSize::new(100, 30));
        assert!(matches!(io.console.resize(0, 40), Err(PtyError::InvalidSize { .. })));
    }
}
