//! Process supervisor
//!
//! Spawns the shell attached to a pseudo console and waits for it to exit.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

#[cfg(windows)]
use std::os::windows::io::{AsRawHandle, FromRawHandle, OwnedHandle, RawHandle};
#[cfg(windows)]
use windows::core::{PCWSTR, PWSTR};
#[cfg(windows)]
use windows::Win32::Foundation::HANDLE;
#[cfg(windows)]
use windows::Win32::System::Console::HPCON;
#[cfg(windows)]
use windows::Win32::System::Threading::{
    CreateProcessW, DeleteProcThreadAttributeList, GetExitCodeProcess,
    InitializeProcThreadAttributeList, TerminateProcess, UpdateProcThreadAttribute,
    WaitForSingleObject, EXTENDED_STARTUPINFO_PRESENT, LPPROC_THREAD_ATTRIBUTE_LIST,
    PROCESS_INFORMATION, STARTUPINFOEXW,
};

#[cfg(unix)]
use std::process::{Child, Command, Stdio};
#[cfg(unix)]
use std::sync::{Mutex, MutexGuard};
#[cfg(unix)]
use std::time::Instant;

use tracing::debug;

use super::console::PseudoConsole;
#[cfg(windows)]
use super::error::win32_io_error;
use super::error::{PtyError, Result};

/// Program and arguments to run inside the console.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShellCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl ShellCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Windows command line for this command, quoted the way
    /// `CommandLineToArgvW` splits it back apart.
    pub fn command_line(&self) -> String {
        let mut line = String::new();
        append_quoted(&self.program.to_string_lossy(), &mut line);
        for arg in &self.args {
            line.push(' ');
            append_quoted(arg, &mut line);
        }
        line
    }
}

impl std::fmt::Display for ShellCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.command_line())
    }
}

fn append_quoted(arg: &str, line: &mut String) {
    if !arg.is_empty() && !arg.contains([' ', '\t', '\n', '\x0b', '"']) {
        line.push_str(arg);
        return;
    }

    line.push('"');
    let mut backslashes = 0;
    for ch in arg.chars() {
        match ch {
            '\\' => backslashes += 1,
            '"' => {
                // Escape the run of backslashes and the quote itself.
                line.extend(std::iter::repeat('\\').take(backslashes * 2 + 1));
                line.push('"');
                backslashes = 0;
            }
            _ => {
                line.extend(std::iter::repeat('\\').take(backslashes));
                line.push(ch);
                backslashes = 0;
            }
        }
    }
    // Trailing backslashes sit in front of the closing quote.
    line.extend(std::iter::repeat('\\').take(backslashes * 2));
    line.push('"');
}

/// A spawned shell.
///
/// The exit code is recorded the first time the exit is observed and never
/// changes afterwards.
pub struct ChildProcess {
    pid: u32,
    #[cfg(windows)]
    process: OwnedHandle,
    #[cfg(windows)]
    #[allow(dead_code)]
    thread: OwnedHandle,
    #[cfg(unix)]
    child: Mutex<Child>,
    exit_code: OnceLock<i32>,
}

#[cfg(windows)]
const WAIT_OBJECT_0: u32 = 0x0000_0000;
#[cfg(windows)]
const WAIT_TIMEOUT: u32 = 0x0000_0102;

#[cfg(unix)]
const UNIX_POLL_STEP: Duration = Duration::from_millis(10);

impl ChildProcess {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Exit code, once the exit has been observed.
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code.get().copied()
    }

    fn record_exit(&self, code: i32) -> i32 {
        *self.exit_code.get_or_init(|| code)
    }

    #[cfg(windows)]
    fn raw_process(&self) -> HANDLE {
        HANDLE(self.process.as_raw_handle() as _)
    }

    #[cfg(unix)]
    fn child(&self) -> MutexGuard<'_, Child> {
        self.child.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Non-blocking exit check.
    pub fn try_wait(&self) -> io::Result<Option<i32>> {
        self.wait_timeout(Duration::ZERO)
    }

    /// Wait up to `timeout` for the process to exit.
    pub fn wait_timeout(&self, timeout: Duration) -> io::Result<Option<i32>> {
        if let Some(code) = self.exit_code() {
            return Ok(Some(code));
        }

        #[cfg(windows)]
        {
            // u32::MAX is INFINITE; stay just below it.
            let millis = timeout.as_millis().min(u128::from(u32::MAX - 1)) as u32;
            let result = unsafe { WaitForSingleObject(self.raw_process(), millis) };
            match result.0 {
                WAIT_OBJECT_0 => {
                    let mut code: u32 = 0;
                    unsafe {
                        GetExitCodeProcess(self.raw_process(), &mut code).map_err(win32_io_error)?;
                    }
                    Ok(Some(self.record_exit(code as i32)))
                }
                WAIT_TIMEOUT => Ok(None),
                _ => Err(io::Error::last_os_error()),
            }
        }

        #[cfg(unix)]
        {
            let deadline = Instant::now() + timeout;
            loop {
                if let Some(status) = self.child().try_wait()? {
                    return Ok(Some(self.record_exit(unix_exit_code(status))));
                }
                let now = Instant::now();
                if now >= deadline {
                    return Ok(None);
                }
                std::thread::sleep((deadline - now).min(UNIX_POLL_STEP));
            }
        }
    }

    /// Kill the process if it is still running.
    pub fn terminate(&self) -> io::Result<()> {
        if self.try_wait()?.is_some() {
            return Ok(());
        }

        #[cfg(windows)]
        unsafe {
            TerminateProcess(self.raw_process(), 1).map_err(win32_io_error)
        }

        #[cfg(unix)]
        match self.child().kill() {
            Err(e) if e.kind() == io::ErrorKind::InvalidInput => Ok(()),
            other => other,
        }
    }
}

#[cfg(unix)]
impl Drop for ChildProcess {
    fn drop(&mut self) {
        // Reap if it is already gone so it does not linger as a zombie.
        let _ = self.child().try_wait();
    }
}

/// Shell convention: 128 + signal number for a signalled process.
#[cfg(unix)]
fn unix_exit_code(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;

    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(-1)
}

/// How an exit watch ended.
#[derive(Debug)]
pub enum ExitWatch {
    /// The process exited with this code.
    Exited(i32),
    /// The watch was called off before an exit was seen.
    Abandoned,
    /// Waiting failed while nobody had asked the watch to stop.
    WaitFailed(io::Error),
}

/// A process-creation attribute list carrying the pseudo console.
///
/// Deleted on drop, so every early return in `spawn` releases it.
#[cfg(windows)]
struct AttributeList {
    // usize storage keeps the list pointer-aligned.
    buffer: Vec<usize>,
    initialized: bool,
}

#[cfg(windows)]
impl AttributeList {
    const PROC_THREAD_ATTRIBUTE_PSEUDOCONSOLE: usize = 0x00020016;

    fn with_pseudo_console(hpc: HPCON) -> io::Result<Self> {
        let mut size: usize = 0;
        unsafe {
            // Sizing call; it reports failure by design.
            let _ = InitializeProcThreadAttributeList(LPPROC_THREAD_ATTRIBUTE_LIST::default(), 1, 0, &mut size);
        }
        if size == 0 {
            return Err(io::Error::last_os_error());
        }

        let words = size.div_ceil(std::mem::size_of::<usize>());
        let mut list = Self {
            buffer: vec![0usize; words],
            initialized: false,
        };

        unsafe {
            InitializeProcThreadAttributeList(list.as_ptr(), 1, 0, &mut size).map_err(win32_io_error)?;
            list.initialized = true;

            // The attribute value is the HPCON itself, not a pointer to it.
            UpdateProcThreadAttribute(
                list.as_ptr(),
                0,
                Self::PROC_THREAD_ATTRIBUTE_PSEUDOCONSOLE,
                Some(hpc.0 as *const _),
                std::mem::size_of::<HPCON>(),
                None,
                None,
            )
            .map_err(win32_io_error)?;
        }

        Ok(list)
    }

    fn as_ptr(&mut self) -> LPPROC_THREAD_ATTRIBUTE_LIST {
        LPPROC_THREAD_ATTRIBUTE_LIST(self.buffer.as_mut_ptr() as *mut _)
    }
}

#[cfg(windows)]
impl Drop for AttributeList {
    fn drop(&mut self) {
        if self.initialized {
            unsafe { DeleteProcThreadAttributeList(self.as_ptr()) };
        }
    }
}

#[cfg(windows)]
fn wide(s: &std::ffi::OsStr) -> Vec<u16> {
    use std::os::windows::ffi::OsStrExt;
    s.encode_wide().chain(std::iter::once(0)).collect()
}

/// Launches shells into pseudo consoles and watches them exit.
pub struct ProcessSupervisor;

impl ProcessSupervisor {
    /// Spawn `command` attached to `console`.
    ///
    /// Nothing allocated here survives a failure.
    pub fn spawn(command: &ShellCommand, working_dir: Option<&Path>, console: &PseudoConsole) -> Result<ChildProcess> {
        #[cfg(windows)]
        {
            console.with_handle(|hpc| unsafe { Self::spawn_attached(command, working_dir, hpc) })?
        }

        #[cfg(unix)]
        {
            let child = console.with_slave(|slave| Self::spawn_attached(command, working_dir, slave))??;
            // The child holds its own copies now. Ours would keep the pty
            // from reporting end-of-stream after the shell exits.
            console.release_slave();
            Ok(child)
        }
    }

    #[cfg(windows)]
    unsafe fn spawn_attached(command: &ShellCommand, working_dir: Option<&Path>, hpc: HPCON) -> Result<ChildProcess> {
        let mut attributes = AttributeList::with_pseudo_console(hpc).map_err(PtyError::ProcessSpawn)?;

        let mut startup_info = STARTUPINFOEXW {
            StartupInfo: std::mem::zeroed(),
            lpAttributeList: attributes.as_ptr(),
        };
        startup_info.StartupInfo.cb = std::mem::size_of::<STARTUPINFOEXW>() as u32;

        let mut cmd_wide: Vec<u16> = command.command_line().encode_utf16().chain(std::iter::once(0)).collect();
        let dir_wide = working_dir.map(|dir| wide(dir.as_os_str()));
        let dir_ptr = match &dir_wide {
            Some(dir) => PCWSTR(dir.as_ptr()),
            None => PCWSTR::null(),
        };

        let mut process_info = PROCESS_INFORMATION::default();

        // Only the console travels to the child; no handles are inherited.
        CreateProcessW(
            PCWSTR::null(),
            PWSTR(cmd_wide.as_mut_ptr()),
            None,
            None,
            false,
            EXTENDED_STARTUPINFO_PRESENT,
            None,
            dir_ptr,
            &startup_info.StartupInfo,
            &mut process_info,
        )
        .map_err(|e| PtyError::ProcessSpawn(win32_io_error(e)))?;

        drop(attributes);

        Ok(ChildProcess {
            pid: process_info.dwProcessId,
            process: OwnedHandle::from_raw_handle(process_info.hProcess.0 as RawHandle),
            thread: OwnedHandle::from_raw_handle(process_info.hThread.0 as RawHandle),
            exit_code: OnceLock::new(),
        })
    }

    #[cfg(unix)]
    fn spawn_attached(
        command: &ShellCommand,
        working_dir: Option<&Path>,
        slave: &rustix::fd::OwnedFd,
    ) -> Result<ChildProcess> {
        use std::os::unix::process::CommandExt;

        let stdio = || slave.try_clone().map(Stdio::from).map_err(PtyError::ProcessSpawn);

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .env("TERM", "xterm-256color")
            .stdin(stdio()?)
            .stdout(stdio()?)
            .stderr(stdio()?);
        if let Some(dir) = working_dir {
            cmd.current_dir(dir);
        }

        // New session with the pty (already on fd 0) as controlling terminal.
        unsafe {
            cmd.pre_exec(|| {
                rustix::process::setsid()?;
                rustix::process::ioctl_tiocsctty(rustix::fd::BorrowedFd::borrow_raw(0))?;
                Ok(())
            });
        }

        let child = cmd.spawn().map_err(PtyError::ProcessSpawn)?;
        Ok(ChildProcess {
            pid: child.id(),
            child: Mutex::new(child),
            exit_code: OnceLock::new(),
        })
    }

    /// Wait for `child` to exit, checking `keep_waiting` every `poll`.
    ///
    /// A wait error after `keep_waiting` turned false is the expected result
    /// of a concurrent stop and ends the watch quietly.
    pub fn watch_exit(child: &ChildProcess, poll: Duration, keep_waiting: impl Fn() -> bool) -> ExitWatch {
        loop {
            match child.wait_timeout(poll) {
                Ok(Some(code)) => return ExitWatch::Exited(code),
                Ok(None) => {
                    if !keep_waiting() {
                        return ExitWatch::Abandoned;
                    }
                }
                Err(e) => {
                    if keep_waiting() {
                        return ExitWatch::WaitFailed(e);
                    }
                    debug!("Exit wait ended by shutdown: {}", e);
                    return ExitWatch::Abandoned;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::console::TermSize;
    use std::time::Instant;

    #[cfg(windows)]
    fn exit_with(code: i32) -> ShellCommand {
        ShellCommand::new("cmd.exe").args(["/c", &format!("exit {}", code)])
    }

    #[cfg(unix)]
    fn exit_with(code: i32) -> ShellCommand {
        ShellCommand::new("/bin/sh").args(["-c", &format!("exit {}", code)])
    }

    #[cfg(windows)]
    fn long_running() -> ShellCommand {
        ShellCommand::new("cmd.exe")
    }

    #[cfg(unix)]
    fn long_running() -> ShellCommand {
        ShellCommand::new("/bin/sh")
    }

    #[test]
    fn test_command_line_quoting() {
        let cmd = ShellCommand::new("cmd.exe").args(["/c", "echo hello"]);
        assert_eq!(cmd.command_line(), r#"cmd.exe /c "echo hello""#);

        let cmd = ShellCommand::new(r"C:\Program Files\PowerShell\7\pwsh.exe").arg("-NoLogo");
        assert_eq!(cmd.command_line(), r#""C:\Program Files\PowerShell\7\pwsh.exe" -NoLogo"#);

        let cmd = ShellCommand::new("x").args(["", r#"say "hi""#, r"dir\ with\", r"C:\path\"]);
        assert_eq!(cmd.command_line(), r#"x "" "say \"hi\"" "dir\ with\\" C:\path\"#);
    }

    #[test]
    fn test_spawn_reports_exit_code() {
        let io = PseudoConsole::open(TermSize::new(80, 24)).unwrap();
        let child = ProcessSupervisor::spawn(&exit_with(3), None, &io.console).unwrap();
        assert_ne!(child.pid(), 0);

        let watch = ProcessSupervisor::watch_exit(&child, Duration::from_millis(50), || true);
        assert!(matches!(watch, ExitWatch::Exited(3)), "got {:?}", watch);
        assert_eq!(child.exit_code(), Some(3));
        assert_eq!(child.try_wait().unwrap(), Some(3));
    }

    #[test]
    fn test_watch_abandoned_when_told_to_stop() {
        let io = PseudoConsole::open(TermSize::new(80, 24)).unwrap();
        let child = ProcessSupervisor::spawn(&long_running(), None, &io.console).unwrap();

        let started = Instant::now();
        let watch = ProcessSupervisor::watch_exit(&child, Duration::from_millis(20), || false);
        assert!(matches!(watch, ExitWatch::Abandoned));
        assert!(started.elapsed() < Duration::from_secs(2));

        child.terminate().unwrap();
        let code = child.wait_timeout(Duration::from_secs(5)).unwrap();
        assert!(code.is_some());
    }

    #[test]
    fn test_spawn_missing_program_fails() {
        let io = PseudoConsole::open(TermSize::new(80, 24)).unwrap();
        let result = ProcessSupervisor::spawn(&ShellCommand::new("/definitely/not/a/shell"), None, &io.console);
        assert!(matches!(result, Err(PtyError::ProcessSpawn(_))));
    }

    #[test]
    fn test_spawn_into_closed_console_fails() {
        let io = PseudoConsole::open(TermSize::new(80, 24)).unwrap();
        io.console.close();
        let result = ProcessSupervisor::spawn(&exit_with(0), None, &io.console);
        assert!(matches!(result, Err(PtyError::NotRunning)));
    }
}
