//! ferry-ctl — command-line interface for the Ferry daemon.

use anyhow::{Context, Result};

mod cmd;

const DEFAULT_PORT: u16 = 4280;

fn print_usage() {
    println!("Usage: ferry-ctl [--port <port>] <command>");
    println!();
    println!("Commands:");
    println!("  status                      Show daemon status");
    println!("  peers                       List discovered peers");
    println!("  send <peer_id> <path>...    Send files to a peer");
    println!("  sessions                    List transfer sessions");
    println!("  session <id>                Show one session in detail");
    println!("  pause <id>                  Pause a session");
    println!("  resume <id>                 Resume a paused session");
    println!("  cancel <id>                 Cancel a session");
    println!("  retry <id>                  Retry a failed session");
    println!("  cleanup [max_age_secs]      Remove finished sessions");
    println!("  chunks                      Show chunk storage stats");
    println!();
    println!("Options:");
    println!("  --port <port>   API port (default: {})", DEFAULT_PORT);
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();

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
        ["status"] | [] => cmd::status::cmd_status(port).await,
        ["peers"] => cmd::status::cmd_peers(port).await,
        ["chunks"] => cmd::status::cmd_chunks(port).await,
        ["send", peer_id, paths @ ..] => cmd::transfer::cmd_send(port, peer_id, paths).await,
        ["sessions"] => cmd::sessions::cmd_sessions(port).await,
        ["session", id] => cmd::sessions::cmd_session_inspect(port, id).await,
        [action @ ("pause" | "resume" | "cancel" | "retry"), id] => {
            cmd::sessions::cmd_session_action(port, action, id).await
        }
        ["cleanup"] => cmd::sessions::cmd_cleanup(port, None).await,
        ["cleanup", secs] => {
            let secs = secs.parse().context("max_age_secs must be a number")?;
            cmd::sessions::cmd_cleanup(port, Some(secs)).await
        }
        ["help"] | ["--help"] | ["-h"] => {
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
