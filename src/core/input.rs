//! Input side of the console.
//!
//! All writes go through one lock so that concurrent callers never
//! interleave the bytes of a single payload.

use std::sync::{Mutex, MutexGuard};

use super::error::{PtyError, Result};
use super::pipe::PipeEndpoint;

/// Named control payloads.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlKey {
    /// Ctrl+C
    Interrupt,
    /// Ctrl+D
    Eof,
    /// Ctrl+Z
    Suspend,
    Tab,
    Escape,
    Backspace,
    Enter,
    Up,
    Down,
    Right,
    Left,
}

impl ControlKey {
    pub fn bytes(self) -> &'static [u8] {
        match self {
            ControlKey::Interrupt => b"\x03",
            ControlKey::Eof => b"\x04",
            ControlKey::Suspend => b"\x1a",
            ControlKey::Tab => b"\t",
            ControlKey::Escape => b"\x1b",
            ControlKey::Backspace => b"\x7f",
            ControlKey::Enter => b"\r",
            ControlKey::Up => b"\x1b[A",
            ControlKey::Down => b"\x1b[B",
            ControlKey::Right => b"\x1b[C",
            ControlKey::Left => b"\x1b[D",
        }
    }
}

/// `text` followed by a carriage return, which is what a terminal sends for
/// Enter.
pub fn line_bytes(text: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(text.len() + 1);
    bytes.extend_from_slice(text.as_bytes());
    bytes.push(b'\r');
    bytes
}

/// Serialized writer for the console input pipe.
pub struct InputChannel {
    writer: Mutex<Option<PipeEndpoint>>,
}

impl InputChannel {
    pub fn new(endpoint: PipeEndpoint) -> Self {
        Self {
            writer: Mutex::new(Some(endpoint)),
        }
    }

    fn writer(&self) -> MutexGuard<'_, Option<PipeEndpoint>> {
        self.writer.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Write one payload in full. Pipes are unbuffered on our side, so the
    /// bytes are with the console when this returns.
    pub fn write(&self, data: &[u8]) -> Result<()> {
        let writer = self.writer();
        let endpoint = writer.as_ref().ok_or(PtyError::NotRunning)?;
        endpoint.write_all(data).map_err(PtyError::Write)
    }

    /// Close the input pipe. Returns `true` for the call that closed it.
    pub fn close(&self) -> bool {
        self.writer().take().is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.writer().is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::pipe::create_pipe_pair;
    use std::sync::Arc;
    use std::thread;

    fn read_all(endpoint: &PipeEndpoint) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            match endpoint.read(&mut buf) {
                Ok(0) | Err(_) => return out,
                Ok(n) => out.extend_from_slice(&buf[..n]),
            }
        }
    }

    #[test]
    fn test_control_payloads() {
        assert_eq!(ControlKey::Interrupt.bytes(), &[0x03]);
        assert_eq!(ControlKey::Eof.bytes(), &[0x04]);
        assert_eq!(ControlKey::Up.bytes(), b"\x1b[A");
        assert_eq!(line_bytes("echo hello"), b"echo hello\r".to_vec());
    }

    #[test]
    fn test_write_after_close() {
        let (_read_end, write_end) = create_pipe_pair(false).unwrap();
        let input = InputChannel::new(write_end);

        assert!(input.close());
        assert!(!input.close());
        assert!(matches!(input.write(b"x"), Err(PtyError::NotRunning)));
    }

    #[test]
    fn test_write_to_closed_reader_fails() {
        let (read_end, write_end) = create_pipe_pair(false).unwrap();
        drop(read_end);
        let input = InputChannel::new(write_end);

        assert!(matches!(input.write(b"lost"), Err(PtyError::Write(_))));
    }

    #[test]
    fn test_concurrent_writes_stay_whole() {
        // Larger than a pipe buffer, so each payload needs several writes.
        const LEN: usize = 256 * 1024;
        let (read_end, write_end) = create_pipe_pair(false).unwrap();
        let input = Arc::new(InputChannel::new(write_end));

        let reader = thread::spawn(move || read_all(&read_end));

        let writers: Vec<_> = [b'a', b'b']
            .into_iter()
            .map(|byte| {
                let input = input.clone();
                thread::spawn(move || input.write(&vec![byte; LEN]).unwrap())
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }
        input.close();

        let received = reader.join().unwrap();
        assert_eq!(received.len(), 2 * LEN);
        let (first, second) = received.split_at(LEN);
        assert!(first.iter().all(|&b| b == first[0]));
        assert!(second.iter().all(|&b| b == second[0]));
        assert_ne!(first[0], second[0]);
    }
}
