//! Daemon status and shutdown commands.

use anyhow::Result;
use serde::Deserialize;

use super::http::{base_url, get_json, post_json};

#[derive(Deserialize)]
struct StatusResponse {
    version: String,
    uptime_secs: u64,
    max_concurrent_jobs: usize,
    default_runtime: String,
    requests_in_flight: usize,
    jobs: JobCounts,
}

#[derive(Deserialize)]
struct JobCounts {
    total: usize,
    waiting: usize,
    in_progress: usize,
    complete: usize,
    failed: usize,
    killed: usize,
}

#[derive(Deserialize)]
struct ShutdownResponse {
    message: String,
}

pub async fn cmd_status(port: u16) -> Result<()> {
    let resp: StatusResponse = get_json(&format!("{}/status", base_url(port))).await?;

    println!("═══════════════════════════════════════");
    println!("  Loom Daemon Status (v{})", resp.version);
    println!("═══════════════════════════════════════");
    println!("  Uptime            : {}s", resp.uptime_secs);
    println!("  Default runtime   : {}", resp.default_runtime);
    println!("  Concurrent jobs   : {}", resp.max_concurrent_jobs);
    println!("  Requests in flight: {}", resp.requests_in_flight);
    println!();
    println!("  Jobs ({})", resp.jobs.total);
    println!("  ├─ waiting     : {}", resp.jobs.waiting);
    println!("  ├─ in progress : {}", resp.jobs.in_progress);
    println!("  ├─ complete    : {}", resp.jobs.complete);
    println!("  ├─ failed      : {}", resp.jobs.failed);
    println!("  └─ killed      : {}", resp.jobs.killed);

    Ok(())
}

pub async fn cmd_shutdown(port: u16) -> Result<()> {
    let resp: ShutdownResponse =
        post_json(&format!("{}/daemon/shutdown", base_url(port))).await?;
    println!("{}", resp.message);
    Ok(())
}
