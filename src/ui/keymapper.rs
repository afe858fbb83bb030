//! Key mapping for console input
//!
//! Turns crossterm key events into the xterm byte sequences a shell expects
//! on its terminal input.

use bitflags::bitflags;
use crossterm::event::{KeyCode, KeyEvent, KeyEventKind, KeyModifiers};

use crate::core::input::ControlKey;

bitflags! {
    /// Modifier keys
    #[derive(Clone, Copy, Debug, Default, PartialEq)]
    pub struct Modifiers: u8 {
        const SHIFT = 0b0001;
        const ALT   = 0b0010;
        const CTRL  = 0b0100;
    }
}

impl From<KeyModifiers> for Modifiers {
    fn from(mods: KeyModifiers) -> Self {
        let mut result = Modifiers::empty();
        result.set(Modifiers::SHIFT, mods.contains(KeyModifiers::SHIFT));
        result.set(Modifiers::ALT, mods.contains(KeyModifiers::ALT));
        result.set(Modifiers::CTRL, mods.contains(KeyModifiers::CONTROL));
        result
    }
}

impl Modifiers {
    /// xterm modifier parameter: 1 + the modifier bits
    fn param(self) -> u8 {
        1 + self.bits()
    }
}

/// Input modes the shell can switch on
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct KeyMode {
    /// DECCKM: unmodified arrows send `ESC O x` instead of `ESC [ x`
    pub application_cursor: bool,
    /// Mode 2004: pasted text is wrapped in `ESC [ 200 ~` / `ESC [ 201 ~`
    pub bracketed_paste: bool,
}

/// How a key is encoded once modifiers are involved.
enum Sequence {
    /// `ESC [ x`, or `ESC [ 1 ; m x` with modifiers
    Csi(u8),
    /// `ESC O x`, or `ESC [ 1 ; m x` with modifiers
    Ss3(u8),
    /// `ESC [ n ~`, or `ESC [ n ; m ~` with modifiers
    Tilde(u8),
}

impl Sequence {
    fn encode(self, mods: Modifiers) -> Vec<u8> {
        match (self, mods.is_empty()) {
            (Sequence::Csi(key), true) => vec![0x1B, b'[', key],
            (Sequence::Ss3(key), true) => vec![0x1B, b'O', key],
            (Sequence::Tilde(code), true) => format!("\x1b[{}~", code).into_bytes(),
            (Sequence::Csi(key) | Sequence::Ss3(key), false) => {
                format!("\x1b[1;{}{}", mods.param(), key as char).into_bytes()
            }
            (Sequence::Tilde(code), false) => format!("\x1b[{};{}~", code, mods.param()).into_bytes(),
        }
    }
}

/// Key mapper for converting key events to bytes
pub struct KeyMapper;

impl KeyMapper {
    /// Bytes for `event`, or `None` for keys with no terminal encoding and
    /// for key releases.
    pub fn map(event: &KeyEvent, mode: KeyMode) -> Option<Vec<u8>> {
        if event.kind == KeyEventKind::Release {
            return None;
        }
        let mods = Modifiers::from(event.modifiers);

        let bytes = match event.code {
            KeyCode::Char(ch) => Self::map_char(ch, mods),
            KeyCode::Enter => Self::alt_prefixed(ControlKey::Enter.bytes(), mods),
            KeyCode::Backspace => Self::alt_prefixed(ControlKey::Backspace.bytes(), mods),
            KeyCode::Esc => ControlKey::Escape.bytes().to_vec(),
            KeyCode::Tab if mods.contains(Modifiers::SHIFT) => b"\x1b[Z".to_vec(),
            KeyCode::Tab => ControlKey::Tab.bytes().to_vec(),
            KeyCode::BackTab => b"\x1b[Z".to_vec(),

            KeyCode::Up => Self::cursor_key(b'A', mods, mode),
            KeyCode::Down => Self::cursor_key(b'B', mods, mode),
            KeyCode::Right => Self::cursor_key(b'C', mods, mode),
            KeyCode::Left => Self::cursor_key(b'D', mods, mode),

            KeyCode::Home => Sequence::Csi(b'H').encode(mods),
            KeyCode::End => Sequence::Csi(b'F').encode(mods),
            KeyCode::Insert => Sequence::Tilde(2).encode(mods),
            KeyCode::Delete => Sequence::Tilde(3).encode(mods),
            KeyCode::PageUp => Sequence::Tilde(5).encode(mods),
            KeyCode::PageDown => Sequence::Tilde(6).encode(mods),

            KeyCode::F(n) => Self::function_key(n)?.encode(mods),
            _ => return None,
        };
        Some(bytes)
    }

    /// Bytes for pasted text, bracketed when the shell asked for it.
    pub fn paste(text: &str, mode: KeyMode) -> Vec<u8> {
        if !mode.bracketed_paste {
            return text.as_bytes().to_vec();
        }
        let mut out = Vec::with_capacity(text.len() + 12);
        out.extend_from_slice(b"\x1b[200~");
        out.extend_from_slice(text.as_bytes());
        out.extend_from_slice(b"\x1b[201~");
        out
    }

    fn map_char(ch: char, mods: Modifiers) -> Vec<u8> {
        let ctrl = mods.contains(Modifiers::CTRL);
        let alt = mods.contains(Modifiers::ALT);

        if ctrl {
            if let Some(code) = Self::control_code(ch) {
                return if alt { vec![0x1B, code] } else { vec![code] };
            }
        }

        let mut buf = [0u8; 4];
        let encoded = ch.encode_utf8(&mut buf).as_bytes();
        Self::alt_prefixed(encoded, mods)
    }

    /// C0 code produced by Ctrl plus `ch`
    fn control_code(ch: char) -> Option<u8> {
        match ch {
            'a'..='z' => Some(ch as u8 - b'a' + 1),
            'A'..='Z' => Some(ch as u8 - b'A' + 1),
            '@' | '`' | ' ' | '2' => Some(0x00),
            '[' | '3' => Some(0x1B),
            '\\' | '4' => Some(0x1C),
            ']' | '5' => Some(0x1D),
            '^' | '~' | '6' => Some(0x1E),
            '_' | '?' | '7' => Some(0x1F),
            _ => None,
        }
    }

    fn alt_prefixed(bytes: &[u8], mods: Modifiers) -> Vec<u8> {
        let mut out = Vec::with_capacity(bytes.len() + 1);
        if mods.contains(Modifiers::ALT) {
            out.push(0x1B);
        }
        out.extend_from_slice(bytes);
        out
    }

    fn cursor_key(key: u8, mods: Modifiers, mode: KeyMode) -> Vec<u8> {
        if mode.application_cursor {
            Sequence::Ss3(key).encode(mods)
        } else {
            Sequence::Csi(key).encode(mods)
        }
    }

    fn function_key(n: u8) -> Option<Sequence> {
        let sequence = match n {
            1 => Sequence::Ss3(b'P'),
            2 => Sequence::Ss3(b'Q'),
            3 => Sequence::Ss3(b'R'),
            4 => Sequence::Ss3(b'S'),
            5 => Sequence::Tilde(15),
            6 => Sequence::Tilde(17),
            7 => Sequence::Tilde(18),
            8 => Sequence::Tilde(19),
            9 => Sequence::Tilde(20),
            10 => Sequence::Tilde(21),
            11 => Sequence::Tilde(23),
            12 => Sequence::Tilde(24),
            _ => return None,
        };
        Some(sequence)
    }
}
