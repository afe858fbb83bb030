//! Host-side input handling.
//!
//! - **keymapper**: keyboard input to console byte sequence mapping

pub mod keymapper;

pub use keymapper::{KeyMapper, KeyMode, Modifiers};
