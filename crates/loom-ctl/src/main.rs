//! loom-ctl — command-line interface for the Loom daemon.

mod cmd;

use std::path::Path;

use anyhow::{Context, Result};

const DEFAULT_PORT: u16 = 9101;

fn print_usage() {
    println!("Usage: loom-ctl [--port <port>] <command>");
    println!();
    println!("Commands:");
    println!("  status                 Show daemon status and job counts");
    println!("  jobs                   List jobs, newest first");
    println!("  job <id>               Show phases, metrics and recent log of a job");
    println!("  submit <spec.json>     Submit a training job");
    println!("  submit <spec.json> --watch");
    println!("                         Submit, then follow the job until it finishes");
    println!("  watch <id>             Follow a job's live events");
    println!("  cancel <id>            Kill a job");
    println!("  shutdown               Stop the daemon (running jobs are killed)");
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
        ["status"] | [] => cmd::status::cmd_status(port).await,
        ["jobs"] => cmd::jobs::cmd_jobs(port).await,
        ["job", id] => cmd::jobs::cmd_job(port, id).await,
        ["submit", path] => cmd::jobs::cmd_submit(port, Path::new(path)).await.map(|_| ()),
        ["submit", path, "--watch"] => {
            let id = cmd::jobs::cmd_submit(port, Path::new(path)).await?;
            cmd::watch::cmd_watch(port, &id).await
        }
        ["watch", id] => cmd::watch::cmd_watch(port, id).await,
        ["cancel", id] => cmd::jobs::cmd_cancel(port, id).await,
        ["shutdown"] => cmd::status::cmd_shutdown(port).await,
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
