//! Cross-process robustness test: a writer killed between `alloc` and
//! `commit` must leave the next observer's committed state byte-for-byte
//! identical to the last commit.
//!
//! Uses the self-spawning pattern: the test binary re-invokes itself with
//! a role environment variable.

use std::env;
use std::io::Read;
use std::process::{Command, Stdio};
use std::time::Duration;

use basalt_arena::{ArenaFile, CreateOptions, FileOptions, OpenOptions};
use basalt_transport::Transport;

const ENV_ROLE: &str = "BASALT_ROBUST_ROLE";
const ENV_PATH: &str = "BASALT_ROBUST_PATH";
const ROLE_DIER: &str = "dier";

fn open_arena(path: &str) -> basalt_arena::Arena {
    ArenaFile::open_with(
        path,
        FileOptions {
            create: CreateOptions {
                size: 4096,
                mode: 0o600,
                dir_mode: 0o700,
            },
            open: OpenOptions { readonly: false },
        },
    )
    .expect("open arena file")
    .into_arena()
}

/// Lock, allocate, scribble, report readiness, then die without
/// committing or unlocking.
fn run_dier(path: &str) {
    let mut t = Transport::open(open_arena(path)).expect("dier: open transport");
    let mut lk = t.lock().expect("dier: lock");
    lk.alloc(100).expect("dier: alloc").fill(b'!');
    println!("LOCKED");
    // The parent kills us here; stay parked with the lock held.
    std::thread::sleep(Duration::from_secs(60));
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .try_init();
}

#[test]
fn killed_writer_rolls_back_to_last_commit() {
    init_tracing();
    if let Ok(role) = env::var(ENV_ROLE) {
        let path = env::var(ENV_PATH).expect("path not set");
        match role.as_str() {
            ROLE_DIER => run_dier(&path),
            other => panic!("unknown role: {other}"),
        }
        return;
    }

    let path = format!("/tmp/basalt_robust_e2e_{}", std::process::id());
    let _ = std::fs::remove_file(&path);

    // Establish one committed frame.
    let mut t = Transport::open(open_arena(&path)).expect("open transport");
    let before = {
        let mut lk = t.lock().expect("lock");
        lk.alloc(6).expect("alloc").copy_from_slice(b"stable");
        lk.commit().expect("commit");
        lk.committed_state()
    };

    // Spawn a process that dies holding the lock, mid-write.
    let exe = env::current_exe().expect("current exe");
    let mut dier = Command::new(&exe)
        .arg("--exact")
        .arg("killed_writer_rolls_back_to_last_commit")
        .env(ENV_ROLE, ROLE_DIER)
        .env(ENV_PATH, &path)
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .spawn()
        .expect("spawn dier");

    // Wait until the child confirms it holds the lock.
    let mut out = dier.stdout.take().expect("child stdout");
    let mut line = [0u8; 7];
    out.read_exact(&mut line).expect("read child readiness");
    assert_eq!(&line, b"LOCKED\n");

    dier.kill().expect("kill dier");
    dier.wait().expect("reap dier");

    // The next acquisition observes the death and the rolled-back state.
    let mut lk = t.lock().expect("lock after death");
    assert!(lk.prev_owner_died());
    assert_eq!(lk.committed_state(), before);
    assert_eq!((lk.seq_low(), lk.seq_high()), (1, 1));
    lk.jump_head().expect("jump_head");
    assert_eq!(lk.frame().expect("frame").data, b"stable");

    // The transport remains fully usable.
    lk.alloc(5).expect("alloc").copy_from_slice(b"after");
    lk.commit().expect("commit");
    lk.jump_tail().expect("jump_tail");
    assert_eq!(lk.frame().expect("frame").data, b"after");
    assert_eq!((lk.seq_low(), lk.seq_high()), (1, 2));
    drop(lk);

    let _ = std::fs::remove_file(&path);
}
