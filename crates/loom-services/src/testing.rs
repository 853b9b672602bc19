//! In-memory worker runtimes for unit tests.
//!
//! `FakeLauncher` hands out clients attached to a task that speaks the line
//! protocol. Programs named `fake-transform` double numbers; everything else
//! behaves like a training runtime with scripted metrics.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Notify;

use loom_core::Message;

use crate::launcher::WorkerLauncher;
use crate::worker::tests::{connection, FakeWorker};
use crate::worker::{LaunchCommand, StartupError, WorkerClient, WorkerOptions};

#[derive(Debug, Clone, Default)]
pub(crate) struct FakeBehaviour {
    /// `accuracy` reported for each train iteration (0.5 when out of range).
    pub accuracy: Vec<f64>,
    /// Never answer this train iteration.
    pub hang_on_train: Option<u64>,
    /// Answer every train request only after this long.
    pub train_delay: Option<Duration>,
    /// Hang up on this train iteration, leaving the request pending.
    pub drop_on_train: Option<u64>,
    /// Answer `process` with outputs that never match.
    pub wrong_outputs: bool,
}

#[derive(Default)]
pub(crate) struct FakeStats {
    pub launched: AtomicUsize,
    /// Connections the client closed from its side.
    pub closed: AtomicUsize,
    pub commands: Mutex<Vec<LaunchCommand>>,
    /// Signalled whenever a train request arrives.
    pub train_received: Notify,
    /// Train replies actually written back.
    pub train_replies: AtomicUsize,
}

impl FakeStats {
    pub fn last_command(&self) -> Option<LaunchCommand> {
        self.commands.lock().unwrap().last().cloned()
    }

    pub async fn wait_closed(&self, n: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.closed.load(Ordering::SeqCst) < n {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("worker connections were not closed");
    }
}

#[derive(Clone, Default)]
pub(crate) struct FakeLauncher {
    pub behaviour: FakeBehaviour,
    pub stats: Arc<FakeStats>,
}

impl FakeLauncher {
    pub fn with_accuracy(accuracy: Vec<f64>) -> Self {
        Self {
            behaviour: FakeBehaviour {
                accuracy,
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

#[async_trait]
impl WorkerLauncher for FakeLauncher {
    async fn launch(
        &self,
        command: LaunchCommand,
        options: WorkerOptions,
    ) -> Result<WorkerClient, StartupError> {
        if let Some(dir) = command.working_dir.as_ref().filter(|d| !d.is_dir()) {
            return Err(StartupError::Spawn {
                program: command.program.clone(),
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("working directory {} does not exist", dir.display()),
                ),
            });
        }
        let (reader, writer, worker) = connection();
        let transform = command.program == "fake-transform";
        self.stats.launched.fetch_add(1, Ordering::SeqCst);
        self.stats.commands.lock().unwrap().push(command);
        tokio::spawn(serve(
            worker,
            self.behaviour.clone(),
            self.stats.clone(),
            transform,
        ));
        WorkerClient::attach(options, reader, writer).await
    }
}

fn result(id: String, value: Value) -> Message {
    Message::Result {
        id: Some(id),
        value,
    }
}

async fn serve(mut worker: FakeWorker, behaviour: FakeBehaviour, stats: Arc<FakeStats>, transform: bool) {
    let mut objects: HashMap<String, Value> = HashMap::new();
    while let Some(msg) = worker.recv().await {
        let reply = match msg {
            Message::Handshake { .. } => Message::Handshake {
                name: Some(if transform { "fake-transform" } else { "fake-runtime" }.into()),
                version: Some("1.0".into()),
            },
            Message::Transform { id, object } if object.get("reject").is_some() => Message::Error {
                id: Some(id),
                message: "rejected by script".into(),
            },
            Message::Transform { id, object } => {
                let value = object.as_f64().map(|n| json!(n * 2.0)).unwrap_or(object);
                result(id, value)
            }
            Message::LoadModel { id, .. } | Message::Save { id, .. } => result(id, json!(true)),
            Message::Load { id, output, .. } => {
                objects.insert(id.clone(), output);
                result(id, json!("loaded"))
            }
            Message::Train { id, iteration, .. } => {
                stats.train_received.notify_one();
                if behaviour.drop_on_train == Some(iteration) {
                    return;
                }
                if behaviour.hang_on_train == Some(iteration) {
                    continue;
                }
                if let Some(delay) = behaviour.train_delay {
                    tokio::time::sleep(delay).await;
                }
                stats.train_replies.fetch_add(1, Ordering::SeqCst);
                let acc = behaviour
                    .accuracy
                    .get(iteration as usize)
                    .copied()
                    .unwrap_or(0.5);
                result(id, json!({"accuracy": acc, "loss": 1.0 - acc}))
            }
            Message::Process { id, ids } => {
                let entries: Vec<Value> = ids
                    .iter()
                    .rev()
                    .map(|oid| {
                        let value = if behaviour.wrong_outputs {
                            json!("wrong")
                        } else {
                            objects.get(oid).cloned().unwrap_or(Value::Null)
                        };
                        json!({"id": oid, "value": value})
                    })
                    .collect();
                result(id, Value::Array(entries))
            }
            other => Message::Error {
                id: other.id().map(String::from),
                message: format!("unsupported {}", other.kind()),
            },
        };
        worker.send(reply).await;
    }
    stats.closed.fetch_add(1, Ordering::SeqCst);
}
