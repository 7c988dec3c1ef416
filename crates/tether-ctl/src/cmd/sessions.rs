//! `show session` and `clear session` commands.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::http::{base_url, get_query, post_json_body};

// ── Rendering helpers ─────────────────────────────────────────────────────────

fn str_of<'a>(v: &'a Value, key: &str) -> &'a str {
    v.get(key).and_then(Value::as_str).unwrap_or("-")
}

fn u64_of(v: &Value, key: &str) -> u64 {
    v.get(key).and_then(Value::as_u64).unwrap_or(0)
}

fn handle(v: &Value) -> String {
    format!(
        "[{}:{}]",
        u64_of(v, "thread_index"),
        u64_of(v, "session_index")
    )
}

fn endpoint(v: &Value) -> String {
    let ip = str_of(v, "ip");
    let port = u64_of(v, "port");
    if ip.contains(':') {
        format!("[{}]:{}", ip, port)
    } else {
        format!("{}:{}", ip, port)
    }
}

fn fifo(v: &Value) -> String {
    if v.is_null() {
        return "-".to_string();
    }
    let event = if v.get("has_event").and_then(Value::as_bool) == Some(true) {
        " (evt)"
    } else {
        ""
    };
    format!("{}/{}{}", u64_of(v, "queued"), u64_of(v, "capacity"), event)
}

fn print_row(s: &Value) {
    let flags: Vec<&str> = s["flags"]
        .as_array()
        .map(|a| a.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();
    println!(
        "  {:<10} {:<18} {:<9} {} -> {}  {}",
        handle(&s["handle"]),
        str_of(s, "state"),
        str_of(s, "proto"),
        endpoint(&s["lcl"]),
        endpoint(&s["rmt"]),
        flags.join(",")
    );
}

fn print_detail(s: &Value) {
    println!("═══════════════════════════════════════");
    println!("  Session {}", handle(&s["handle"]));
    println!("═══════════════════════════════════════");
    println!("  State      : {}", str_of(s, "state"));
    println!("  Proto      : {}", str_of(s, "proto"));
    println!("  Local      : {}", endpoint(&s["lcl"]));
    println!("  Remote     : {}", endpoint(&s["rmt"]));
    println!("  Connection : {}", u64_of(s, "connection_index"));
    println!("  App worker : {}", u64_of(s, "app_wrk_index"));
    if !s["listener"].is_null() {
        println!("  Listener   : {}", handle(&s["listener"]));
    }
    println!("  Rx fifo    : {}", fifo(&s["rx_fifo"]));
    println!("  Tx fifo    : {}", fifo(&s["tx_fifo"]));
    println!("  Ooo bytes  : {}", u64_of(s, "ooo_bytes"));
    println!("  Age        : {} ms", u64_of(s, "age_ms"));
}

fn list<'a>(v: &'a Value, key: &str) -> &'a [Value] {
    v.get(key)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
}

// ── show session ──────────────────────────────────────────────────────────────

pub async fn cmd_show(port: u16, args: &[&str]) -> Result<()> {
    let resp: Value = get_query(&format!("{}/sessions", base_url(port)), &args.join(" ")).await?;

    match str_of(&resp, "view") {
        "threads" => {
            for t in list(&resp, "threads") {
                println!(
                    "Thread {}: {} active sessions ({} total, {} closed)",
                    u64_of(t, "thread"),
                    u64_of(t, "active"),
                    u64_of(t, "total"),
                    u64_of(t, "closed")
                );
                if t["suppressed"].as_bool() == Some(true) {
                    println!("  Too many sessions to print, use filters to narrow the listing.");
                }
                list(t, "sessions").iter().for_each(print_row);
            }
        }
        "filter" => {
            if resp["count_only"].as_bool() == Some(true) {
                println!("Thread {}: {} sessions", u64_of(&resp, "thread"), u64_of(&resp, "matched"));
                return Ok(());
            }
            list(&resp, "sessions").iter().for_each(print_row);
            println!("Thread {}: {} sessions matched", u64_of(&resp, "thread"), u64_of(&resp, "matched"));
            if resp["truncated"].as_bool() == Some(true) {
                println!("  Listing truncated, add force-print to see all of them.");
            }
        }
        "session" => print_detail(&resp),
        "protos" => {
            for p in list(&resp, "protos") {
                println!("  {}", p.as_str().unwrap_or("-"));
            }
        }
        "states" => {
            for s in list(&resp, "states") {
                println!("  {}", s.as_str().unwrap_or("-"));
            }
        }
        "listeners" => {
            let listeners = list(&resp, "listeners");
            if listeners.is_empty() {
                println!("No {} listeners.", str_of(&resp, "proto"));
            }
            for l in listeners {
                let session = if l["session"].is_null() {
                    "-".to_string()
                } else {
                    handle(&l["session"])
                };
                println!(
                    "  {:<24} fib {:<4} {:<10} conn {}",
                    str_of(l, "local"),
                    u64_of(l, "fib_index"),
                    session,
                    u64_of(l, "connection_index")
                );
            }
        }
        "events" => super::stats::print_queues(list(&resp, "queues")),
        other => println!("Unexpected response view: {}", other),
    }
    Ok(())
}

// ── clear session ─────────────────────────────────────────────────────────────

pub async fn cmd_clear(port: u16, args: &[&str]) -> Result<()> {
    #[derive(Serialize)]
    struct ClearRequest {
        query: String,
    }

    #[derive(Deserialize)]
    struct ClearResponse {
        cleared: usize,
    }

    let resp: ClearResponse = post_json_body(
        &format!("{}/sessions/clear", base_url(port)),
        &ClearRequest {
            query: args.join(" "),
        },
    )
    .await?;
    println!("✓ {} session(s) scheduled for clearing.", resp.cleared);
    Ok(())
}
