//! Anonymous pipes and owned pipe endpoints.
//!
//! Each [`PipeEndpoint`] owns exactly one OS handle (or file descriptor) and
//! closes it when dropped, so a handle can never be closed twice or leaked on
//! an early-return path.

use std::io;

#[cfg(windows)]
use std::os::windows::io::{AsRawHandle, FromRawHandle, OwnedHandle, RawHandle};
#[cfg(windows)]
use windows::Win32::Foundation::{ERROR_BROKEN_PIPE, HANDLE};
#[cfg(windows)]
use windows::Win32::Security::SECURITY_ATTRIBUTES;
#[cfg(windows)]
use windows::Win32::Storage::FileSystem::{ReadFile, WriteFile};
#[cfg(windows)]
use windows::Win32::System::Pipes::CreatePipe;
#[cfg(windows)]
use windows::Win32::System::IO::CancelIoEx;

#[cfg(unix)]
use rustix::fd::OwnedFd;
#[cfg(unix)]
use rustix::io::Errno;
#[cfg(any(target_os = "macos", target_os = "ios"))]
use rustix::io::FdFlags;

#[cfg(windows)]
use super::error::win32_io_error;
use super::error::{PtyError, Result};

/// One end of a unidirectional byte stream.
#[derive(Debug)]
pub struct PipeEndpoint {
    #[cfg(windows)]
    handle: OwnedHandle,
    #[cfg(unix)]
    fd: OwnedFd,
}

/// Create an anonymous pipe, returning `(read_end, write_end)`.
///
/// When `inheritable` is false the handles are not passed to child
/// processes.
pub fn create_pipe_pair(inheritable: bool) -> Result<(PipeEndpoint, PipeEndpoint)> {
    #[cfg(windows)]
    unsafe {
        let attributes = SECURITY_ATTRIBUTES {
            nLength: std::mem::size_of::<SECURITY_ATTRIBUTES>() as u32,
            lpSecurityDescriptor: std::ptr::null_mut(),
            bInheritHandle: inheritable.into(),
        };

        let mut read = HANDLE::default();
        let mut write = HANDLE::default();
        CreatePipe(&mut read, &mut write, Some(&attributes as *const _), 0)
            .map_err(|e| PtyError::PipeCreation(win32_io_error(e)))?;

        Ok((
            PipeEndpoint::from_raw(read.0 as RawHandle),
            PipeEndpoint::from_raw(write.0 as RawHandle),
        ))
    }

    #[cfg(unix)]
    {
        let (read, write) = unix_pipe(inheritable).map_err(|e| PtyError::PipeCreation(e.into()))?;
        Ok((PipeEndpoint::from_fd(read), PipeEndpoint::from_fd(write)))
    }
}

// CLOEXEC has to be set atomically where the platform allows it, or a shell
// spawned on another thread can inherit the write end and hold the pipe open.
#[cfg(all(unix, not(any(target_os = "macos", target_os = "ios"))))]
fn unix_pipe(inheritable: bool) -> rustix::io::Result<(OwnedFd, OwnedFd)> {
    use rustix::pipe::PipeFlags;

    let flags = if inheritable {
        PipeFlags::empty()
    } else {
        PipeFlags::CLOEXEC
    };
    rustix::pipe::pipe_with(flags)
}

#[cfg(any(target_os = "macos", target_os = "ios"))]
fn unix_pipe(inheritable: bool) -> rustix::io::Result<(OwnedFd, OwnedFd)> {
    let (read, write) = rustix::pipe::pipe()?;
    if !inheritable {
        rustix::io::fcntl_setfd(&read, FdFlags::CLOEXEC)?;
        rustix::io::fcntl_setfd(&write, FdFlags::CLOEXEC)?;
    }
    Ok((read, write))
}

impl PipeEndpoint {
    #[cfg(windows)]
    pub(crate) unsafe fn from_raw(handle: RawHandle) -> Self {
        Self {
            handle: OwnedHandle::from_raw_handle(handle),
        }
    }

    #[cfg(windows)]
    pub(crate) fn raw(&self) -> HANDLE {
        HANDLE(self.handle.as_raw_handle() as _)
    }

    #[cfg(unix)]
    pub(crate) fn from_fd(fd: OwnedFd) -> Self {
        Self { fd }
    }

    /// Duplicate the underlying handle into a second, independently owned
    /// endpoint.
    pub fn try_clone(&self) -> io::Result<Self> {
        #[cfg(windows)]
        {
            Ok(Self {
                handle: self.handle.try_clone()?,
            })
        }
        #[cfg(unix)]
        {
            Ok(Self {
                fd: self.fd.try_clone()?,
            })
        }
    }

    /// Blocking read. `Ok(0)` means the other end is gone.
    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        #[cfg(windows)]
        {
            let len = buf.len().min(u32::MAX as usize);
            let mut read: u32 = 0;
            let result = unsafe { ReadFile(self.raw(), Some(&mut buf[..len]), Some(&mut read), None) };
            match result {
                Ok(()) => Ok(read as usize),
                Err(e) if e.code() == ERROR_BROKEN_PIPE.to_hresult() => Ok(0),
                Err(e) => Err(win32_io_error(e)),
            }
        }

        #[cfg(unix)]
        loop {
            match rustix::io::read(&self.fd, &mut *buf) {
                Ok(n) => return Ok(n),
                Err(Errno::INTR) => continue,
                // A pty master reports EIO once every slave handle is closed.
                Err(Errno::IO) => return Ok(0),
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Write the whole buffer, retrying partial writes.
    pub fn write_all(&self, mut data: &[u8]) -> io::Result<()> {
        while !data.is_empty() {
            let written = self.write_some(data)?;
            if written == 0 {
                return Err(io::Error::new(io::ErrorKind::WriteZero, "pipe accepted no bytes"));
            }
            data = &data[written..];
        }
        Ok(())
    }

    fn write_some(&self, data: &[u8]) -> io::Result<usize> {
        #[cfg(windows)]
        {
            let len = data.len().min(u32::MAX as usize);
            let mut written: u32 = 0;
            unsafe {
                WriteFile(self.raw(), Some(&data[..len]), Some(&mut written), None)
                    .map_err(win32_io_error)?;
            }
            Ok(written as usize)
        }

        #[cfg(unix)]
        loop {
            match rustix::io::write(&self.fd, data) {
                Ok(n) => return Ok(n),
                Err(Errno::INTR) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Cancel a read blocked on this endpoint from another thread.
    ///
    /// On Unix there is nothing to cancel; the read returns once the writing
    /// side is closed.
    pub fn cancel_io(&self) {
        #[cfg(windows)]
        unsafe {
            let _ = CancelIoEx(self.raw(), None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_pipe_round_trip() {
        let (read_end, write_end) = create_pipe_pair(false).unwrap();
        write_end.write_all(b"hello pipe").unwrap();

        let mut buf = [0u8; 64];
        let n = read_end.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello pipe");
    }

    #[test]
    fn test_read_after_writer_dropped_is_eof() {
        let (read_end, write_end) = create_pipe_pair(false).unwrap();
        write_end.write_all(b"last").unwrap();
        drop(write_end);

        let mut buf = [0u8; 16];
        let n = read_end.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"last");
        assert_eq!(read_end.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_blocked_read_wakes_when_writer_closes() {
        let (read_end, write_end) = create_pipe_pair(false).unwrap();
        let reader = thread::spawn(move || {
            let mut buf = [0u8; 16];
            read_end.read(&mut buf)
        });

        thread::sleep(std::time::Duration::from_millis(50));
        drop(write_end);

        assert_eq!(reader.join().unwrap().unwrap(), 0);
    }

    #[test]
    fn test_clone_shares_stream() {
        let (read_end, write_end) = create_pipe_pair(true).unwrap();
        let second = write_end.try_clone().unwrap();
        second.write_all(b"ab").unwrap();
        drop(second);
        write_end.write_all(b"cd").unwrap();

        let mut buf = [0u8; 8];
        let mut got = Vec::new();
        while got.len() < 4 {
            let n = read_end.read(&mut buf).unwrap();
            got.extend_from_slice(&buf[..n]);
        }
        assert_eq!(got, b"abcd");
    }
}
