//! Error types for the PTY engine.

use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PtyError {
    #[error("Failed to create pipe: {0}")]
    PipeCreation(#[source] io::Error),

    #[error("Failed to create pseudo console: {0}")]
    ConsoleCreation(#[source] io::Error),

    #[error("Failed to spawn process: {0}")]
    ProcessSpawn(#[source] io::Error),

    #[error("Failed to resize pseudo console: {0}")]
    Resize(#[source] io::Error),

    #[error("Failed to write to PTY: {0}")]
    Write(#[source] io::Error),

    #[error("Read from PTY terminated: {0}")]
    ReadTermination(#[source] io::Error),

    #[error("Failed to start I/O thread: {0}")]
    ThreadSpawn(#[source] io::Error),

    #[error("Invalid terminal size {cols}x{rows}")]
    InvalidSize { cols: u16, rows: u16 },

    #[error("Session is not running")]
    NotRunning,

    #[error("Session is already active; stop it before starting again")]
    AlreadyActive,
}

impl PtyError {
    /// Native error code behind this error, if there is one.
    pub fn os_code(&self) -> Option<i32> {
        match self {
            PtyError::PipeCreation(e)
            | PtyError::ConsoleCreation(e)
            | PtyError::ProcessSpawn(e)
            | PtyError::Resize(e)
            | PtyError::Write(e)
            | PtyError::ReadTermination(e)
            | PtyError::ThreadSpawn(e) => e.raw_os_error(),
            PtyError::InvalidSize { .. } | PtyError::NotRunning | PtyError::AlreadyActive => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, PtyError>;

/// Where in `Session::start` an attempt failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StartStage {
    Validate,
    Pipes,
    Console,
    Spawn,
    Threads,
}

impl std::fmt::Display for StartStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StartStage::Validate => "validating arguments",
            StartStage::Pipes => "creating pipes",
            StartStage::Console => "creating pseudo console",
            StartStage::Spawn => "spawning shell",
            StartStage::Threads => "starting I/O threads",
        };
        f.write_str(name)
    }
}

/// The single error surfaced by a failed `Session::start`.
///
/// Everything acquired during the attempt has already been released when
/// this is returned.
#[derive(Error, Debug)]
#[error("Failed to start session while {stage}: {source}")]
pub struct StartFailed {
    pub stage: StartStage,
    #[source]
    pub source: PtyError,
}

impl StartFailed {
    pub fn new(stage: StartStage, source: PtyError) -> Self {
        Self { stage, source }
    }

    /// Attribute an acquisition error to the stage that produces it.
    pub(crate) fn from_acquire(source: PtyError) -> Self {
        let stage = match source {
            PtyError::PipeCreation(_) => StartStage::Pipes,
            PtyError::ConsoleCreation(_) => StartStage::Console,
            PtyError::ProcessSpawn(_) => StartStage::Spawn,
            PtyError::ThreadSpawn(_) => StartStage::Threads,
            _ => StartStage::Validate,
        };
        Self { stage, source }
    }
}

#[cfg(windows)]
pub(crate) fn win32_io_error(e: windows::core::Error) -> io::Error {
    // HRESULT_FROM_WIN32 wraps the Win32 code as 0x8007xxxx.
    let hr = e.code().0 as u32;
    if hr & 0xFFFF_0000 == 0x8007_0000 {
        io::Error::from_raw_os_error((hr & 0xFFFF) as i32)
    } else {
        io::Error::other(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_os_code_passthrough() {
        let err = PtyError::PipeCreation(io::Error::from_raw_os_error(24));
        assert_eq!(err.os_code(), Some(24));
        assert_eq!(PtyError::NotRunning.os_code(), None);
    }

    #[test]
    fn test_stage_attribution() {
        let err = StartFailed::from_acquire(PtyError::ProcessSpawn(io::Error::from_raw_os_error(2)));
        assert_eq!(err.stage, StartStage::Spawn);
        assert_eq!(err.source.os_code(), Some(2));

        let err = StartFailed::from_acquire(PtyError::PipeCreation(io::Error::from_raw_os_error(24)));
        assert_eq!(err.stage, StartStage::Pipes);
    }

    #[test]
    fn test_start_failed_message() {
        let err = StartFailed::new(StartStage::Validate, PtyError::InvalidSize { cols: 0, rows: 24 });
        assert_eq!(
            err.to_string(),
            "Failed to start session while validating arguments: Invalid terminal size 0x24"
        );
    }
}
