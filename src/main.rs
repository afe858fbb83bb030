//! ptyhost - run a shell inside a pseudo console
//!
//! Puts the host terminal into raw mode, starts the configured shell in a
//! pseudo console sized to match, and passes keystrokes, resizes and output
//! straight through until the shell exits.
//!
//! # Quick Start
//!
//! ```text
//! ptyhost                    # Default shell (PowerShell 7 / $SHELL)
//! ptyhost -s cmd.exe         # Custom shell
//! ptyhost -s "bash --norc"   # Shell with arguments
//! ptyhost -d C:\src          # Start in a directory
//! ```
//!
//! The exit code of `ptyhost` is the exit code of the shell.

use std::env;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::mpsc::{Receiver, TryRecvError};
use std::time::Duration;

use anyhow::Context;
use crossterm::event::{self, DisableBracketedPaste, EnableBracketedPaste, Event};
use crossterm::{execute, terminal};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use ptyhost::config::Config;
use ptyhost::ui::{KeyMapper, KeyMode};
use ptyhost::{Session, SessionEvent, SessionState, ShellCommand};

/// Command line options
#[derive(Debug, Default, PartialEq)]
struct Args {
    /// Shell command line, split on whitespace
    shell: Option<String>,
    /// Starting directory
    dir: Option<PathBuf>,
}

/// Version string from Cargo.toml
const VERSION: &str = env!("CARGO_PKG_VERSION");

fn print_version() {
    eprintln!("ptyhost {}", VERSION);
}

fn print_help() {
    eprintln!("ptyhost {} - run a shell inside a pseudo console", VERSION);
    eprintln!();
    eprintln!("Usage: ptyhost [OPTIONS]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  -s, --shell <CMD>     Shell command (default: from config.toml or auto-detected)");
    eprintln!("  -d, --dir <PATH>      Starting directory");
    eprintln!("  -v, --version         Show version");
    eprintln!("  -h, --help            Show this help");
    eprintln!();
    eprintln!("Configuration: ~/.ptyhost/config.toml");
    eprintln!("Log file:      ~/.ptyhost/ptyhost.log (level from RUST_LOG or log_level)");
    eprintln!();
    eprintln!("Exit: Type 'exit' in the shell");
}

/// What the command line asks for
#[derive(Debug, PartialEq)]
enum Invocation {
    Run(Args),
    Help,
    Version,
}

fn parse_args(args: &[String]) -> Result<Invocation, String> {
    let mut parsed = Args::default();
    let mut i = 0;

    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => return Ok(Invocation::Help),
            "-v" | "--version" => return Ok(Invocation::Version),
            "-s" | "--shell" => {
                i += 1;
                let shell = args.get(i).ok_or("Missing shell argument")?;
                parsed.shell = Some(shell.clone());
            }
            "-d" | "--dir" => {
                i += 1;
                let dir = args.get(i).ok_or("Missing directory argument")?;
                parsed.dir = Some(PathBuf::from(dir));
            }
            arg => {
                return Err(format!("Unknown argument: {}. Use -h for help.", arg));
            }
        }
        i += 1;
    }

    Ok(Invocation::Run(parsed))
}

/// Split a `--shell` value into program and arguments.
fn shell_from_cli(value: &str) -> Option<ShellCommand> {
    let mut parts = value.split_whitespace();
    let program = parts.next()?;
    Some(ShellCommand::new(program).args(parts))
}

/// Log to `~/.ptyhost/ptyhost.log`; never to the terminal we draw into.
fn init_logging(config: &Config) {
    let log_path = Config::config_dir()
        .map(|dir| dir.join("ptyhost.log"))
        .unwrap_or_else(|| PathBuf::from("ptyhost.log"));

    if let Some(parent) = log_path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .ok();

    if let Some(file) = log_file {
        let filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&config.log_level))
            .unwrap_or_else(|_| EnvFilter::new("info"));
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::sync::Mutex::new(file))
            .with_ansi(false)
            .finish();
        let _ = tracing::subscriber::set_global_default(subscriber);
    }
}

/// Raw mode plus bracketed paste, undone on every way out of `run`, panics
/// included.
struct RawMode;

impl RawMode {
    fn enable() -> io::Result<Self> {
        terminal::enable_raw_mode()?;
        if let Err(e) = execute!(io::stdout(), EnableBracketedPaste) {
            let _ = terminal::disable_raw_mode();
            return Err(e);
        }
        Ok(Self)
    }
}

impl Drop for RawMode {
    fn drop(&mut self) {
        let _ = execute!(io::stdout(), DisableBracketedPaste);
        let _ = terminal::disable_raw_mode();
    }
}

/// Follow DECCKM (`ESC [ ? 1 h` / `ESC [ ? 1 l`) and bracketed paste
/// (`ESC [ ? 2004 h` / `ESC [ ? 2004 l`) in the shell's output so keys and
/// pastes match what the running program expects.
fn track_key_mode(mode: &mut KeyMode, output: &[u8]) {
    if let Some(on) = last_toggle(output, b"\x1b[?1h", b"\x1b[?1l") {
        mode.application_cursor = on;
    }
    if let Some(on) = last_toggle(output, b"\x1b[?2004h", b"\x1b[?2004l") {
        mode.bracketed_paste = on;
    }
}

/// Whichever of `set` and `reset` appears last in `output`.
fn last_toggle(output: &[u8], set: &[u8], reset: &[u8]) -> Option<bool> {
    let last = |needle: &[u8]| output.windows(needle.len()).rposition(|w| w == needle);
    match (last(set), last(reset)) {
        (Some(set), Some(reset)) => Some(set > reset),
        (Some(_), None) => Some(true),
        (None, Some(_)) => Some(false),
        (None, None) => None,
    }
}

fn main() {
    let args: Vec<String> = env::args().skip(1).collect();
    let args = match parse_args(&args) {
        Ok(Invocation::Run(args)) => args,
        Ok(Invocation::Help) => {
            print_help();
            return;
        }
        Ok(Invocation::Version) => {
            print_version();
            return;
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!("Use --help for usage information");
            std::process::exit(2);
        }
    };

    let config = Config::load();
    init_logging(&config);
    info!("ptyhost starting...");

    let code = match run(args, &config) {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("ptyhost: {:#}", e);
            1
        }
    };
    info!("ptyhost exiting with {}", code);
    std::process::exit(code);
}

/// Run one session to completion and return the shell's exit code.
fn run(args: Args, config: &Config) -> anyhow::Result<i32> {
    let mut options = config.session_options();
    if let Some(command) = args.shell.as_deref().and_then(shell_from_cli) {
        options.command = command;
    }
    if args.dir.is_some() {
        options.working_dir = args.dir;
    }
    info!("Shell: {}", options.command);

    let (cols, rows) = terminal::size().unwrap_or((config.cols, config.rows));
    info!("Terminal size: {}x{}", cols, rows);

    let (session, events) = Session::new(options);
    session.start(cols, rows, None).context("Failed to start shell")?;

    let raw = RawMode::enable().context("Failed to enable raw mode")?;
    let result = run_main_loop(&session, &events);
    session.stop();
    drop(raw);

    result
}

/// Main event loop
fn run_main_loop(session: &Session, events: &Receiver<SessionEvent>) -> anyhow::Result<i32> {
    let poll_timeout = Duration::from_millis(10);
    let mut stdout = io::stdout();
    let mut mode = KeyMode::default();

    loop {
        // Shell output first, so typing never starves the screen.
        loop {
            match events.try_recv() {
                Ok(SessionEvent::Output(chunk)) => {
                    track_key_mode(&mut mode, &chunk);
                    stdout.write_all(&chunk)?;
                }
                Ok(SessionEvent::Exited(code)) => {
                    stdout.flush()?;
                    info!("Shell exited with {}", code);
                    return Ok(code);
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    warn!("Event channel closed");
                    return Ok(session.exit_code().unwrap_or(1));
                }
            }
        }
        stdout.flush()?;

        if session.state() == SessionState::Stopped {
            return Ok(session.exit_code().unwrap_or(1));
        }

        if event::poll(poll_timeout)? {
            match event::read()? {
                Event::Key(key_event) => {
                    if let Some(bytes) = KeyMapper::map(&key_event, mode) {
                        session.write_raw(&bytes);
                    }
                }
                Event::Resize(cols, rows) => {
                    info!("Resize: {}x{}", cols, rows);
                    // Logged by the session; a failed resize keeps the shell.
                    let _ = session.resize(cols, rows);
                }
                Event::Paste(text) => session.write_raw(&KeyMapper::paste(&text, mode)),
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_args() {
        assert_eq!(parse_args(&[]), Ok(Invocation::Run(Args::default())));
        assert_eq!(
            parse_args(&args(&["-s", "bash --norc", "--dir", "/tmp"])),
            Ok(Invocation::Run(Args {
                shell: Some("bash --norc".to_string()),
                dir: Some(PathBuf::from("/tmp")),
            }))
        );
        assert_eq!(parse_args(&args(&["--version"])), Ok(Invocation::Version));
        assert_eq!(parse_args(&args(&["-h", "-x"])), Ok(Invocation::Help));
        assert!(parse_args(&args(&["--shell"])).is_err());
        assert!(parse_args(&args(&["--bogus"])).is_err());
    }

    #[test]
    fn test_shell_from_cli() {
        assert_eq!(
            shell_from_cli("bash --norc -i"),
            Some(ShellCommand::new("bash").args(["--norc", "-i"]))
        );
        assert_eq!(shell_from_cli("   "), None);
    }

    #[test]
    fn test_key_mode_follows_output() {
        let mut mode = KeyMode::default();
        track_key_mode(&mut mode, b"vim\x1b[?1h\x1b=");
        assert!(mode.application_cursor);

        track_key_mode(&mut mode, b"plain output");
        assert!(mode.application_cursor);

        track_key_mode(&mut mode, b"\x1b[?1h...\x1b[?1l");
        assert!(!mode.application_cursor);
        assert!(!mode.bracketed_paste);

        track_key_mode(&mut mode, b"\x1b[?2004h$ ");
        assert!(mode.bracketed_paste);
        assert!(!mode.application_cursor);
        track_key_mode(&mut mode, b"\x1b[?2004l\r\n");
        assert!(!mode.bracketed_paste);
    }
}
