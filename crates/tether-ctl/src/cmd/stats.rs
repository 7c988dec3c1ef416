//! Stats, event queue and shutdown commands.

use anyhow::Result;
use serde::Deserialize;
use serde_json::Value;

use super::http::{base_url, delete_json, get_json, post_json};

// ── Response types ────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct StatsResponse {
    threads: Vec<ThreadStats>,
    segments: Vec<SegmentInfo>,
    lookup: LookupInfo,
}

#[derive(Deserialize)]
#[allow(dead_code)]
struct ThreadStats {
    thread: u32,
    events_posted: Vec<(String, u64)>,
    events_overflowed: Vec<(String, u64)>,
    ctrl_rejected: u64,
    sessions_opened: u64,
    sessions_deleted: u64,
    pool_full: u64,
    fifo_alloc_failures: u64,
    close_timeouts: u64,
    migrations: u64,
    quanta: u64,
}

#[derive(Deserialize)]
struct SegmentInfo {
    name: String,
    size: u64,
    used: u64,
    fifos: u32,
    alloc_failures: u64,
}

#[derive(Deserialize)]
struct LookupInfo {
    established: usize,
    half_open: usize,
    listeners: usize,
}

#[derive(Deserialize)]
struct QueueStatus {
    thread: u32,
    queued: usize,
    capacity: usize,
    ctrl_in_use: usize,
    ctrl_capacity: usize,
    posted: Vec<(String, u64)>,
    overflowed: Vec<(String, u64)>,
}

fn counters(pairs: &[(String, u64)]) -> String {
    let shown: Vec<String> = pairs
        .iter()
        .filter(|(_, n)| *n > 0)
        .map(|(k, n)| format!("{}={}", k, n))
        .collect();
    if shown.is_empty() {
        "none".to_string()
    } else {
        shown.join(" ")
    }
}

// ── show session stats ────────────────────────────────────────────────────────

pub async fn cmd_stats(port: u16) -> Result<()> {
    let resp: StatsResponse = get_json(&format!("{}/stats", base_url(port))).await?;

    println!("═══════════════════════════════════════");
    println!("  Session Layer Stats");
    println!("═══════════════════════════════════════");
    println!("  Established : {}", resp.lookup.established);
    println!("  Half-open   : {}", resp.lookup.half_open);
    println!("  Listeners   : {}", resp.lookup.listeners);

    for t in &resp.threads {
        println!("  ┌─ thread {}", t.thread);
        println!("  │  opened/deleted : {}/{}", t.sessions_opened, t.sessions_deleted);
        println!("  │  posted         : {}", counters(&t.events_posted));
        println!("  │  overflowed     : {}", counters(&t.events_overflowed));
        println!("  │  ctrl rejected  : {}", t.ctrl_rejected);
        println!("  │  pool full      : {}", t.pool_full);
        println!("  │  fifo failures  : {}", t.fifo_alloc_failures);
        println!("  │  close timeouts : {}", t.close_timeouts);
        println!("  └─ migrations     : {}", t.migrations);
    }

    for s in &resp.segments {
        println!(
            "  {:<8} {} fifos, {:.1}/{:.1} KB used, {} failed allocations",
            s.name,
            s.fifos,
            s.used as f64 / 1024.0,
            s.size as f64 / 1024.0,
            s.alloc_failures
        );
    }

    Ok(())
}

pub async fn cmd_stats_clear(port: u16) -> Result<()> {
    #[derive(Deserialize)]
    struct ClearResponse {
        cleared: bool,
    }

    let resp: ClearResponse = delete_json(&format!("{}/stats", base_url(port))).await?;
    if resp.cleared {
        println!("✓ Session stats cleared.");
    }
    Ok(())
}

// ── show session events ───────────────────────────────────────────────────────

pub fn print_queues(queues: &[Value]) {
    for q in queues {
        match QueueStatus::deserialize(q) {
            Ok(q) => {
                println!(
                    "Thread {}: {}/{} queued, {}/{} rpc slots in use",
                    q.thread, q.queued, q.capacity, q.ctrl_in_use, q.ctrl_capacity
                );
                println!("  posted     : {}", counters(&q.posted));
                println!("  overflowed : {}", counters(&q.overflowed));
            }
            Err(e) => println!("Unreadable queue status: {}", e),
        }
    }
}

// ── shutdown ──────────────────────────────────────────────────────────────────

pub async fn cmd_shutdown(port: u16) -> Result<()> {
    #[derive(Deserialize)]
    struct ShutdownResponse {
        message: String,
    }

    let resp: ShutdownResponse = post_json(&format!("{}/daemon/shutdown", base_url(port))).await?;
    println!("{}", resp.message);
    Ok(())
}
