//! Follow a job's live event stream (server-sent events).

use anyhow::{Context, Result};
use serde_json::Value;

use super::http::{base_url, get_stream};

/// One dispatched SSE message.
#[derive(Debug, Clone, PartialEq)]
pub struct SseMessage {
    pub event: String,
    pub data: String,
}

/// Incremental SSE decoder. Chunks may split lines (and UTF-8 sequences)
/// anywhere; only complete lines are decoded.
#[derive(Debug, Default)]
pub struct SseParser {
    buf: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseParser {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseMessage> {
        self.buf.extend_from_slice(chunk);
        let mut out = Vec::new();
        while let Some(nl) = self.buf.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buf.drain(..=nl).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);
            if line.is_empty() {
                if !self.data.is_empty() || self.event.is_some() {
                    out.push(SseMessage {
                        event: self.event.take().unwrap_or_else(|| "message".into()),
                        data: std::mem::take(&mut self.data).join("\n"),
                    });
                }
                continue;
            }
            if line.starts_with(':') {
                continue; // keep-alive comment
            }
            let (field, value) = line.split_once(':').unwrap_or((line, ""));
            let value = value.strip_prefix(' ').unwrap_or(value);
            match field {
                "event" => self.event = Some(value.to_string()),
                "data" => self.data.push(value.to_string()),
                _ => {}
            }
        }
        out
    }
}

fn metrics(v: &Value) -> String {
    v.as_object()
        .map(|m| {
            m.iter()
                .map(|(k, v)| match v.as_f64() {
                    Some(x) => format!("{}={:.4}", k, x),
                    None => format!("{}={}", k, v),
                })
                .collect::<Vec<_>>()
                .join(" ")
        })
        .unwrap_or_default()
}

/// One human-readable line per update. Returns `None` for events not worth
/// printing.
pub fn describe(update: &Value) -> Option<String> {
    let event = update.get("event")?;
    let kind = event.get("event")?.as_str()?;
    let phase = event.get("phase").and_then(Value::as_str).unwrap_or("-");
    let line = match kind {
        "submitted" => "submitted".to_string(),
        "phase_started" => format!("[{}] started", phase),
        "progress" => {
            let f = event.get("fraction").and_then(Value::as_f64).unwrap_or(0.0);
            format!("[{}] {:.0}%", phase, f * 100.0)
        }
        "log" => format!("[{}] {}", phase, event.get("line")?.as_str()?),
        "iteration" => format!(
            "[train] iteration {}: {}  (avg {})",
            event.get("index")?,
            metrics(event.get("metrics")?),
            metrics(event.get("smoothed")?)
        ),
        "result" => format!("[{}] result: {}", phase, metrics(event.get("metrics")?)),
        "phase_finished" => format!("[{}] done", phase),
        "phase_failed" => format!(
            "[{}] FAILED: {}",
            phase,
            event.get("detail").and_then(Value::as_str).unwrap_or("?")
        ),
        "finished" => format!("job {}", event.get("status")?.as_str()?),
        _ => return None,
    };
    Some(line)
}

pub async fn cmd_watch(port: u16, id: &str) -> Result<()> {
    let url = format!("{}/jobs/{}/events", base_url(port), id);
    let mut resp = get_stream(&url).await?;
    let mut parser = SseParser::default();

    while let Some(chunk) = resp.chunk().await.context("event stream interrupted")? {
        for msg in parser.push(&chunk) {
            match msg.event.as_str() {
                "snapshot" => {
                    let snap: Value =
                        serde_json::from_str(&msg.data).context("bad snapshot event")?;
                    println!(
                        "job {} ({}): {}",
                        snap.get("id").and_then(Value::as_str).unwrap_or(id),
                        snap.get("name").and_then(Value::as_str).unwrap_or("?"),
                        snap.get("status").and_then(Value::as_str).unwrap_or("?"),
                    );
                }
                "update" => {
                    let update: Value =
                        serde_json::from_str(&msg.data).context("bad update event")?;
                    if let Some(line) = describe(&update) {
                        println!("{}", line);
                    }
                }
                "lagged" => println!("(missed {} updates)", msg.data),
                _ => {}
            }
        }
    }
    Ok(())
}
