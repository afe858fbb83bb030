//! A failed start must leave the process's descriptor table as it found it.
//!
//! Lives in its own test binary so no other test opens descriptors
//! concurrently.
#![cfg(target_os = "linux")]

use std::path::Path;

use ptyhost::{Session, SessionOptions, SessionState, ShellCommand, StartStage};

fn open_fds() -> usize {
    std::fs::read_dir("/proc/self/fd")
        .expect("procfs is available")
        .count()
}

#[test]
fn failed_starts_release_every_descriptor() {
    let missing_shell = SessionOptions::new(ShellCommand::new("/definitely/not/a/shell"));
    let (session, _events) = Session::new(missing_shell);

    // Warm up anything the first attempt initializes lazily.
    assert!(session.start(80, 24, None).is_err());
    let before = open_fds();

    for _ in 0..5 {
        let err = session.start(80, 24, None).unwrap_err();
        assert_eq!(err.stage, StartStage::Spawn);
        assert_eq!(session.state(), SessionState::Created);
    }
    assert_eq!(open_fds(), before);

    let (session, _events) = Session::new(SessionOptions::new(ShellCommand::new("/bin/sh")));
    let err = session
        .start(80, 24, Some(Path::new("/definitely/not/a/dir")))
        .unwrap_err();
    assert_eq!(err.stage, StartStage::Spawn);
    assert!(session.start(0, 0, None).is_err());
    assert_eq!(open_fds(), before);
}
