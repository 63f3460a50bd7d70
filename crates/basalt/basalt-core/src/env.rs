//! Environment-variable snapshot.
//!
//! Read once on first use and cached for the life of the process. The
//! variable names and defaults are part of the on-disk interface contract
//! shared with other implementations on the same host.

use std::sync::OnceLock;

struct Snapshot {
    root: String,
    topic: Option<String>,
    tmpl_cfg: String,
    tmpl_deadman: String,
    tmpl_log: String,
    tmpl_prpc: String,
    tmpl_pubsub: String,
    tmpl_rpc: String,
}

fn var_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn snapshot() -> &'static Snapshot {
    static SNAPSHOT: OnceLock<Snapshot> = OnceLock::new();
    SNAPSHOT.get_or_init(|| Snapshot {
        root: var_or("A0_ROOT", "/dev/shm/alephzero"),
        topic: std::env::var("A0_TOPIC").ok(),
        tmpl_cfg: var_or("A0_TOPIC_TMPL_CFG", "{topic}.cfg.a0"),
        tmpl_deadman: var_or("A0_TOPIC_TMPL_DEADMAN", "{topic}.deadman"),
        tmpl_log: var_or("A0_TOPIC_TMPL_LOG", "{topic}.log.a0"),
        tmpl_prpc: var_or("A0_TOPIC_TMPL_PRPC", "{topic}.prpc.a0"),
        tmpl_pubsub: var_or("A0_TOPIC_TMPL_PUBSUB", "{topic}.pubsub.a0"),
        tmpl_rpc: var_or("A0_TOPIC_TMPL_RPC", "{topic}.rpc.a0"),
    })
}

/// Root directory for relative arena paths.
pub fn root() -> &'static str {
    &snapshot().root
}

/// The calling process's self-identifying topic, if set.
pub fn topic() -> Option<&'static str> {
    snapshot().topic.as_deref()
}

pub fn topic_tmpl_cfg() -> &'static str {
    &snapshot().tmpl_cfg
}

pub fn topic_tmpl_deadman() -> &'static str {
    &snapshot().tmpl_deadman
}

pub fn topic_tmpl_log() -> &'static str {
    &snapshot().tmpl_log
}

pub fn topic_tmpl_prpc() -> &'static str {
    &snapshot().tmpl_prpc
}

pub fn topic_tmpl_pubsub() -> &'static str {
    &snapshot().tmpl_pubsub
}

pub fn topic_tmpl_rpc() -> &'static str {
    &snapshot().tmpl_rpc
}
