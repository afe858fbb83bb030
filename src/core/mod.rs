//! Pseudo-terminal engine.
//!
//! This module contains the session machinery:
//!
//! - **pipe**: anonymous pipes with single-owner endpoints
//! - **console**: the pseudo console (ConPTY on Windows, a pty pair on Unix)
//! - **process**: spawning the shell into the console and watching it exit
//! - **pump**: the background read loop on the console output
//! - **input**: serialized writes to the console input
//! - **session**: the state machine tying all of the above together
//!
//! # Architecture
//!
//! ```text
//! Session
//! ├── PseudoConsole (input pipe, output pipe)
//! ├── ChildProcess  (shell attached to the console)
//! ├── OutputPump    thread: output pipe → SessionEvent::Output
//! └── exit watcher  thread: shell exit → SessionEvent::Exited
//! ```

pub mod console;
pub mod error;
pub mod event;
pub mod input;
pub mod pipe;
pub mod process;
pub mod pump;
pub mod session;
pub mod state;

pub use console::{PseudoConsole, TermSize};
pub use error::{PtyError, Result, StartFailed, StartStage};
pub use event::{EventSink, HandlerSink, OutputChunk, SessionEvent};
pub use input::ControlKey;
pub use process::ShellCommand;
pub use session::{Session, SessionOptions};
pub use state::SessionState;
