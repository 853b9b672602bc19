//! loom-worker — reference runtime for Loom jobs.
//!
//! Speaks the line protocol on stdin/stdout and logs to stderr.
//!
//!   loom-worker train <architecture.json>    perceptron train/test runtime
//!   loom-worker transform [--scale <f>]      per-record transform
//!
//! Exits 1 on a line that is not valid JSON and 2 on an unknown message type.

mod model;
mod session;

use std::path::Path;

use anyhow::{bail, Context, Result};
use futures::{SinkExt, StreamExt};
use tokio_util::codec::{FramedRead, FramedWrite};

use loom_core::wire::{EXIT_MALFORMED_INPUT, EXIT_UNKNOWN_TYPE};
use loom_core::{LineCodec, ProtocolError};

use model::Architecture;
use session::{Mode, Session};

fn read_architecture(path: &Path) -> Result<Architecture> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading architecture {}", path.display()))?;
    let value: serde_json::Value = serde_json::from_str(&text)
        .with_context(|| format!("{} is not valid JSON", path.display()))?;
    if value.is_null() {
        return Ok(Architecture::default());
    }
    serde_json::from_value(value).with_context(|| format!("bad architecture in {}", path.display()))
}

fn parse_mode(args: &[String]) -> Result<Mode> {
    let args: Vec<&str> = args.iter().map(String::as_str).collect();
    Ok(match args.as_slice() {
        [] | ["train"] => Mode::Train(Architecture::default()),
        ["train", artifact] => Mode::Train(read_architecture(Path::new(artifact))?),
        ["transform"] => Mode::Transform { scale: 1.0 },
        ["transform", "--scale", s] => Mode::Transform {
            scale: s.parse().context("--scale must be a number")?,
        },
        other => bail!("unknown arguments: {}", other.join(" ")),
    })
}

fn exit_code(err: &ProtocolError) -> i32 {
    match err {
        ProtocolError::UnknownType(_) => EXIT_UNKNOWN_TYPE,
        _ => EXIT_MALFORMED_INPUT,
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let mode = parse_mode(&args)?;
    tracing::info!(?mode, "loom-worker starting");
    let mut session = Session::new(mode);

    let mut input = FramedRead::new(tokio::io::stdin(), LineCodec::new());
    let mut output = FramedWrite::new(tokio::io::stdout(), LineCodec::new());

    while let Some(frame) = input.next().await {
        let msg = match frame {
            Ok(msg) => msg,
            Err(e) => {
                tracing::error!(error = %e, "unreadable input, exiting");
                std::process::exit(exit_code(&e));
            }
        };
        if output.send(session.handle(msg)).await.is_err() {
            tracing::info!("supervisor hung up");
            break;
        }
    }
    Ok(())
}
