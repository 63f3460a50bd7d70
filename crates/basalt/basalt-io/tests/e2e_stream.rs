//! End-to-end two-process pub-sub test over a file-backed arena.
//!
//! The same test executable is re-invoked with a role environment variable
//! so the writer and reader run as independent OS processes, concurrently:
//! the reader attaches with `Init::AwaitNew` and consumes packets as the
//! writer produces them.

use std::env;
use std::process::{Command, Stdio};
use std::time::Duration;

use basalt_arena::{ArenaFile, CreateOptions, FileOptions, OpenOptions};
use basalt_core::time::TimeMono;
use basalt_io::{Init, Iter, ReaderSync, Writer, add_standard_headers};
use basalt_packet::{Packet, WRITER_SEQ_KEY};

const ENV_ROLE: &str = "BASALT_E2E_ROLE";
const ENV_PATH: &str = "BASALT_E2E_PATH";
const ROLE_WRITER: &str = "writer";
const ROLE_READER: &str = "reader";

const PACKET_COUNT: u64 = 500;
const ARENA_SIZE: u64 = 1 << 20;

fn open_arena(path: &str) -> basalt_arena::Arena {
    ArenaFile::open_with(
        path,
        FileOptions {
            create: CreateOptions {
                size: ARENA_SIZE,
                mode: 0o600,
                dir_mode: 0o700,
            },
            open: OpenOptions { readonly: false },
        },
    )
    .expect("open arena file")
    .into_arena()
}

fn run_writer(path: &str) {
    let mut writer = Writer::new(open_arena(path))
        .expect("writer: open")
        .wrap(add_standard_headers());

    for i in 0..PACKET_COUNT {
        writer
            .write(Packet::new(format!("event #{i}")))
            .expect("writer: write");
        // Pace the writer so both processes genuinely overlap.
        if i % 50 == 0 {
            std::thread::sleep(Duration::from_millis(1));
        }
    }
    eprintln!("[WRITER] published {PACKET_COUNT} packets");
}

fn run_reader(path: &str) {
    let mut reader =
        ReaderSync::new(open_arena(path), Init::AwaitNew, Iter::Next).expect("reader: open");

    for i in 0..PACKET_COUNT {
        let deadline = TimeMono::now().unwrap().add(Duration::from_secs(10));
        let pkt = reader
            .next_blocking(Some(deadline))
            .unwrap_or_else(|e| panic!("reader: packet #{i}: {e}"));
        assert_eq!(pkt.payload(), format!("event #{i}").as_bytes());
        assert_eq!(
            pkt.find_header(WRITER_SEQ_KEY),
            Some(i.to_string().as_str())
        );
    }
    assert!(!reader.has_next().expect("reader: has_next"));
    eprintln!("[READER] consumed {PACKET_COUNT} packets in order");
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .try_init();
}

#[test]
fn two_process_stream() {
    init_tracing();
    if let Ok(role) = env::var(ENV_ROLE) {
        let path = env::var(ENV_PATH).expect("path not set");
        match role.as_str() {
            ROLE_WRITER => run_writer(&path),
            ROLE_READER => run_reader(&path),
            other => panic!("unknown role: {other}"),
        }
        return;
    }

    let path = format!("/tmp/basalt_e2e_stream_{}", std::process::id());
    let _ = std::fs::remove_file(&path);
    let exe = env::current_exe().expect("current exe");

    // The reader attaches first (AwaitNew sees only later writes), but
    // retries inside basalt if the file is not there yet, so start order
    // only matters for coverage: reader first guarantees it sees all 500.
    let mut reader = Command::new(&exe)
        .arg("--exact")
        .arg("two_process_stream")
        .env(ENV_ROLE, ROLE_READER)
        .env(ENV_PATH, &path)
        .stderr(Stdio::inherit())
        .spawn()
        .expect("spawn reader");

    std::thread::sleep(Duration::from_millis(50));

    let mut writer = Command::new(&exe)
        .arg("--exact")
        .arg("two_process_stream")
        .env(ENV_ROLE, ROLE_WRITER)
        .env(ENV_PATH, &path)
        .stderr(Stdio::inherit())
        .spawn()
        .expect("spawn writer");

    let writer_status = writer.wait().expect("wait writer");
    let reader_status = reader.wait().expect("wait reader");
    assert!(writer_status.success(), "writer failed: {writer_status}");
    assert!(reader_status.success(), "reader failed: {reader_status}");

    let _ = std::fs::remove_file(&path);
}
