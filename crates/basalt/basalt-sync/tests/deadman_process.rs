//! Cross-process deadman test.
//!
//! The test binary re-invokes itself with a role environment variable, the
//! same pattern as the transport's two-process tests. The owner child takes
//! the deadman and parks; the parent observes the take, verifies the busy
//! signal, kills the child, and verifies that death releases ownership and
//! that the next take advances the generation.

use std::env;
use std::process::{Command, Stdio};
use std::time::Duration;

use basalt_core::time::TimeMono;
use basalt_sync::Deadman;

const ENV_ROLE: &str = "BASALT_DEADMAN_ROLE";
const ENV_ROOT: &str = "A0_ROOT";
const ROLE_OWNER: &str = "owner";
const TOPIC: &str = "watchdog";

fn run_owner() {
    let mut d = Deadman::open(TOPIC).expect("owner: open deadman");
    d.take().expect("owner: take");
    // Parked until the parent kills us; death must release the deadman.
    std::thread::sleep(Duration::from_secs(60));
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .try_init();
}

#[test]
fn owner_death_releases_and_bumps_generation() {
    init_tracing();
    if let Ok(role) = env::var(ENV_ROLE) {
        match role.as_str() {
            ROLE_OWNER => run_owner(),
            other => panic!("unknown role: {other}"),
        }
        return;
    }

    let root = format!("/tmp/basalt_deadman_e2e_{}", std::process::id());
    let _ = std::fs::remove_dir_all(&root);
    // The env snapshot is read once per process; set the root before any
    // basalt call in this process or its children.
    unsafe { env::set_var(ENV_ROOT, &root) };

    let exe = env::current_exe().expect("current exe");
    let mut owner = Command::new(&exe)
        .arg("--exact")
        .arg("owner_death_releases_and_bumps_generation")
        .env(ENV_ROLE, ROLE_OWNER)
        .env(ENV_ROOT, &root)
        .stderr(Stdio::inherit())
        .spawn()
        .expect("spawn owner");

    let mut d = Deadman::open(TOPIC).expect("open deadman");

    // Observe the child's take.
    let deadline = TimeMono::now().unwrap().add(Duration::from_secs(5));
    let tkn = d.timed_wait_taken(deadline).expect("wait_taken");
    assert_eq!(tkn, 1);

    let st = d.state().expect("state");
    assert!(st.is_taken);
    assert!(!st.is_owner);
    assert_eq!(st.generation, tkn);

    // A live owner means busy.
    let err = d.try_take().expect_err("try_take against live owner");
    assert!(err.is_busy());

    // Kill the owner; its death must release the deadman.
    owner.kill().expect("kill owner");
    owner.wait().expect("reap owner");

    let deadline = TimeMono::now().unwrap().add(Duration::from_secs(5));
    d.timed_wait_released(tkn, deadline).expect("wait_released");

    // The next take succeeds and advances the generation.
    d.take().expect("take after owner death");
    let st = d.state().expect("state after take");
    assert!(st.is_taken);
    assert!(st.is_owner);
    assert_eq!(st.generation, tkn + 1);

    d.release().expect("release");
    let _ = std::fs::remove_dir_all(&root);
}
