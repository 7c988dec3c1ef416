//! tether-ctl: command-line interface for the Tether daemon.

mod cmd;

use anyhow::{Context, Result};

use cmd::{sessions, stats};

const DEFAULT_PORT: u16 = 9017;

fn print_usage() {
    println!("Usage: tether-ctl [--port <port>] <command>");
    println!();
    println!("Commands:");
    println!("  show session [filters…]               Per-thread session summary, or a filtered listing");
    println!("      filters: thread N, state S, proto P, range A [B], lcl|rmt|ep EP,");
    println!("               verbose [N], force-print");
    println!("  show session thread N index M         One session in detail");
    println!("  show session thread N proto P index C One session, found by its transport connection");
    println!("  show session <proto> [vrf N] A->B     Look a session up by its tuple");
    println!("  show session listeners <proto>        Listeners of one transport");
    println!("  show session events [thread N]        Event queue occupancy");
    println!("  show session states | protos          Known states or registered transports");
    println!("  show session stats                    Per-worker counters and fifo segments");
    println!("  clear session thread N session M      Force-close one session");
    println!("  clear session all                     Force-close every session");
    println!("  clear session stats                   Reset per-worker counters");
    println!("  shutdown                              Stop the daemon");
    println!();
    println!("Options:");
    println!("  --port <port>   API port (default: {})", DEFAULT_PORT);
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();

    // Parse --port option
    let mut port = DEFAULT_PORT;
    let mut remaining: Vec<&str> = Vec::new();
    let mut i = 0;
    while i < args.len() {
        if args[i] == "--port" {
            i += 1;
            port = args
                .get(i)
                .context("--port requires a value")?
                .parse()
                .context("--port must be a number")?;
        } else {
            remaining.push(&args[i]);
        }
        i += 1;
    }

    match remaining.as_slice() {
        ["show", "session", "stats"] => stats::cmd_stats(port).await,
        ["show", "session", rest @ ..] => sessions::cmd_show(port, rest).await,
        ["clear", "session", "stats"] => stats::cmd_stats_clear(port).await,
        ["clear", "session", rest @ ..] => sessions::cmd_clear(port, rest).await,
        ["shutdown"] => stats::cmd_shutdown(port).await,
        ["help"] | ["--help"] | ["-h"] | [] => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {}", other.join(" "));
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    }
}
