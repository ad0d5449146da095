//! Child reaping. Kept alone in its own test binary: `waitpid(-1)` would
//! otherwise collect children belonging to unrelated tests.

use std::collections::BTreeSet;
use std::process::Command;
use std::thread;
use std::time::{Duration, Instant};

use ivrd::ExitKind;
use ivrd::reaper::{Reaper, reap_exited};

fn spawn_exiting(code: i32) -> i32 {
    let child = Command::new("/bin/sh")
        .args(["-c", &format!("exit {code}")])
        .spawn()
        .expect("spawn child");
    i32::try_from(child.id()).expect("pid fits")
}

fn is_gone(pid: i32) -> bool {
    // A zombie still answers signal 0; a reaped pid does not.
    unsafe { libc::kill(pid, 0) != 0 }
}

#[test]
fn exited_children_are_reaped_without_blocking() {
    // Nothing to collect: returns at once.
    let started = Instant::now();
    assert!(reap_exited().expect("empty drain").is_empty());
    assert!(started.elapsed() < Duration::from_secs(1));

    // Several children exiting together are drained, across as many
    // passes as it takes for them to finish.
    let pids: BTreeSet<i32> = [0, 3, 7].into_iter().map(spawn_exiting).collect();
    let deadline = Instant::now() + Duration::from_secs(10);
    let mut reaped = Vec::new();
    while reaped.len() < pids.len() && Instant::now() < deadline {
        reaped.extend(reap_exited().expect("drain"));
        thread::sleep(Duration::from_millis(20));
    }
    let seen: BTreeSet<i32> = reaped.iter().map(|c| c.pid).collect();
    assert_eq!(seen, pids);
    let codes: BTreeSet<ExitKind> = reaped.iter().map(|c| c.status).collect();
    assert_eq!(
        codes,
        [ExitKind::Code(0), ExitKind::Code(3), ExitKind::Code(7)].into_iter().collect()
    );

    // The background reaper collects children on SIGCHLD.
    let reaper = Reaper::spawn().expect("install reaper");
    let pids: Vec<i32> = (0..4).map(|_| spawn_exiting(1)).collect();
    let deadline = Instant::now() + Duration::from_secs(10);
    while !pids.iter().all(|&pid| is_gone(pid)) {
        assert!(Instant::now() < deadline, "children were not reaped");
        thread::sleep(Duration::from_millis(20));
    }
    reaper.shutdown();
}
