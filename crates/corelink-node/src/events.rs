use serde::Serialize;
use std::io::Write;
use std::time::{SystemTime, UNIX_EPOCH};

/// Emit a JSONL event to stdout (flushed immediately for piped output).
pub fn emit<T: Serialize>(event: &T) {
    if let Ok(json) = serde_json::to_string(event) {
        let stdout = std::io::stdout();
        let mut lock = stdout.lock();
        let _ = writeln!(lock, "{json}");
        let _ = lock.flush();
    }
}

pub fn now_s() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

// ── Lifecycle ───────────────────────────────────────────────────

#[derive(Serialize)]
pub struct EventStarted {
    pub event: &'static str,
    pub name: String,
    pub role: String,
    pub address: String,
    pub port: u16,
    pub timestamp: u64,
}

impl EventStarted {
    pub fn new(name: &str, role: &str, address: &str, port: u16) -> Self {
        Self {
            event: "started",
            name: name.to_string(),
            role: role.to_string(),
            address: address.to_string(),
            port,
            timestamp: now_s(),
        }
    }
}

#[derive(Serialize)]
pub struct EventStopped {
    pub event: &'static str,
    pub name: String,
    pub elapsed_s: f64,
}

// ── Cluster membership ──────────────────────────────────────────

#[derive(Serialize)]
pub struct EventService {
    pub event: &'static str,
    pub name: String,
    pub service_type: String,
    /// Address on connect, `graceful`/`silent` on disconnect.
    pub detail: String,
    pub elapsed_s: f64,
}

// ── Echo ────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct EventEcho {
    pub event: &'static str,
    pub seq: u32,
    pub hub: String,
    pub session: u32,
    pub rtt_ms: f64,
}

#[derive(Serialize)]
pub struct EventSummary {
    pub event: &'static str,
    pub sent: u64,
    pub answered: u64,
    pub executed: u64,
    pub dropped: u64,
    pub elapsed_s: f64,
}
