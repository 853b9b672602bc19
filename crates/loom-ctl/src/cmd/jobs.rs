//! Job commands: list, inspect, submit, cancel.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use super::http::{base_url, get_json, post_json, post_json_body};

// ── Response types ────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct JobsResponse {
    jobs: Vec<JobSummary>,
}

#[derive(Deserialize)]
#[allow(dead_code)]
struct JobSummary {
    id: String,
    name: String,
    status: String,
    phase: Option<String>,
    progress: f64,
    iterations: usize,
    submitted_at: u64,
    updated_at: u64,
}

#[derive(Deserialize)]
struct JobRecord {
    id: String,
    name: String,
    status: String,
    phases: Vec<PhaseRecord>,
    #[serde(default)]
    iterations: Vec<IterationRecord>,
    #[serde(default)]
    smoothed: BTreeMap<String, Vec<f64>>,
    #[serde(default)]
    results: BTreeMap<String, f64>,
    #[serde(default)]
    logs: Vec<String>,
}

#[derive(Deserialize)]
struct PhaseRecord {
    name: String,
    status: String,
    progress: f64,
    error: Option<String>,
}

#[derive(Deserialize)]
#[allow(dead_code)]
struct IterationRecord {
    index: u64,
    metrics: BTreeMap<String, f64>,
}

#[derive(Deserialize)]
struct SubmitResponse {
    id: String,
}

#[derive(Deserialize)]
struct CancelResponse {
    id: String,
    outcome: String,
}

// ── Commands ──────────────────────────────────────────────────────────────────

pub async fn cmd_jobs(port: u16) -> Result<()> {
    let resp: JobsResponse = get_json(&format!("{}/jobs", base_url(port))).await?;

    if resp.jobs.is_empty() {
        println!("No jobs.");
        return Ok(());
    }

    println!("═══════════════════════════════════════");
    println!("  Jobs ({})", resp.jobs.len());
    println!("═══════════════════════════════════════");

    for j in &resp.jobs {
        println!("  ┌─ {}  {}", j.id, j.name);
        println!("  │  status     : {}", j.status);
        if let Some(phase) = &j.phase {
            println!("  │  phase      : {} ({:.0}%)", phase, j.progress * 100.0);
        }
        println!("  └─ iterations : {}", j.iterations);
    }

    Ok(())
}

pub async fn cmd_job(port: u16, id: &str) -> Result<()> {
    let job: JobRecord = get_json(&format!("{}/jobs/{}", base_url(port), id)).await?;

    println!("═══════════════════════════════════════");
    println!("  Job {}  {}", job.id, job.name);
    println!("═══════════════════════════════════════");
    println!("  Status : {}", job.status);
    println!();
    println!("  Phases:");
    for p in &job.phases {
        println!(
            "  │  {:<14} {:<12} {:>3.0}%",
            p.name,
            p.status,
            p.progress * 100.0
        );
        if let Some(e) = &p.error {
            println!("  │    error: {}", e);
        }
    }

    if let Some(last) = job.iterations.last() {
        println!();
        println!("  Iterations: {}", job.iterations.len());
        for (metric, series) in &job.smoothed {
            let raw = last.metrics.get(metric).copied().unwrap_or(f64::NAN);
            let avg = series.last().copied().unwrap_or(f64::NAN);
            println!("  │  {:<10} last {:.4}  avg {:.4}", metric, raw, avg);
        }
    }

    if !job.results.is_empty() {
        println!();
        println!("  Results:");
        for (k, v) in &job.results {
            println!("  │  {:<10} {}", k, v);
        }
    }

    if !job.logs.is_empty() {
        println!();
        println!("  Recent log:");
        for line in job.logs.iter().rev().take(10).rev() {
            println!("  │  {}", line);
        }
    }

    Ok(())
}

/// Submit the JSON job spec at `path`. Returns the new job id.
pub async fn cmd_submit(port: u16, path: &Path) -> Result<String> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading job spec {}", path.display()))?;
    let spec: serde_json::Value = serde_json::from_str(&text)
        .with_context(|| format!("{} is not valid JSON", path.display()))?;

    let resp: SubmitResponse = post_json_body(&format!("{}/jobs", base_url(port)), &spec).await?;
    println!("Submitted job {}", resp.id);
    Ok(resp.id)
}

pub async fn cmd_cancel(port: u16, id: &str) -> Result<()> {
    let resp: CancelResponse =
        post_json(&format!("{}/jobs/{}/cancel", base_url(port), id)).await?;
    match resp.outcome.as_str() {
        "requested" => println!("Cancellation requested for {}", resp.id),
        "already_finished" => println!("Job {} already finished", resp.id),
        other => println!("Job {}: {}", resp.id, other),
    }
    Ok(())
}
