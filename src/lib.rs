//! ptyhost - pseudo-terminal session engine
//!
//! Runs an interactive shell inside a pseudo console and exposes it as a
//! [`Session`]: raw output chunks and the shell's exit arrive as
//! [`SessionEvent`]s, input and resizes go the other way.
//!
//! ```no_run
//! use ptyhost::{Session, SessionEvent, SessionOptions};
//!
//! let (session, events) = Session::new(SessionOptions::default());
//! session.start(80, 24, None)?;
//! session.send_line("echo hello");
//! for event in events {
//!     match event {
//!         SessionEvent::Output(chunk) => print!("{}", String::from_utf8_lossy(&chunk)),
//!         SessionEvent::Exited(code) => {
//!             println!("shell exited with {}", code);
//!             break;
//!         }
//!     }
//! }
//! # Ok::<(), ptyhost::StartFailed>(())
//! ```

pub mod config;
pub mod core;
pub mod ui;

pub use crate::config::Config;
pub use crate::core::{
    ControlKey, EventSink, HandlerSink, OutputChunk, PtyError, Session, SessionEvent, SessionOptions, SessionState,
    ShellCommand, StartFailed, StartStage, TermSize,
};
