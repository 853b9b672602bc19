//! Request handling for one worker connection. Pure: frames in, frames out.

use std::collections::HashMap;
use std::path::Path;

use serde_json::{json, Value};

use loom_core::Message;

use crate::model::{Architecture, Example, ModelError, Perceptron};

pub const WORKER_NAME: &str = "loom-worker";

#[derive(Debug, Clone, PartialEq)]
pub enum Mode {
    /// Train/test runtime over a perceptron built from the architecture.
    Train(Architecture),
    /// Per-record transform: multiplies every number in the object.
    Transform { scale: f64 },
}

pub struct Session {
    mode: Mode,
    model: Perceptron,
    objects: HashMap<String, Example>,
}

type Reply = Result<Value, String>;

impl Session {
    pub fn new(mode: Mode) -> Self {
        let model = match &mode {
            Mode::Train(arch) => Perceptron::new(arch),
            Mode::Transform { .. } => Perceptron::new(&Architecture::default()),
        };
        Self {
            mode,
            model,
            objects: HashMap::new(),
        }
    }

    fn transform_scale(&self) -> Option<f64> {
        match self.mode {
            Mode::Transform { scale } => Some(scale),
            Mode::Train(_) => None,
        }
    }

    /// Reply frame for one incoming frame.
    pub fn handle(&mut self, msg: Message) -> Message {
        if let Message::Handshake { .. } = msg {
            return Message::Handshake {
                name: Some(WORKER_NAME.to_string()),
                version: Some(env!("CARGO_PKG_VERSION").to_string()),
            };
        }
        let Some(id) = msg.id().map(str::to_string) else {
            return Message::Error {
                id: None,
                message: format!("unexpected {} frame", msg.kind()),
            };
        };
        let kind = msg.kind();
        let reply = match (self.transform_scale(), msg) {
            (Some(scale), Message::Transform { object, .. }) => scale_numbers(object, scale),
            (None, Message::LoadModel { path, .. }) => self.load_model(&path),
            (None, Message::Load { input, output, .. }) => self.load(&id, &input, &output),
            (None, Message::Process { ids, .. }) => self.process(&ids),
            (None, Message::Train { ids, iteration, .. }) => self.train(&ids, iteration),
            (None, Message::Save { path, .. }) => self.save(&path),
            (_, m) if !m.is_request() => Err(format!("unexpected {kind} frame")),
            (None, _) => Err(format!("{kind} is not supported by the train runtime")),
            (Some(_), _) => Err(format!("{kind} is not supported by the transform runtime")),
        };
        match reply {
            Ok(value) => Message::Result {
                id: Some(id),
                value,
            },
            Err(message) => {
                tracing::warn!(id = %id, kind, error = %message, "request failed");
                Message::Error {
                    id: Some(id),
                    message,
                }
            }
        }
    }

    fn load_model(&mut self, path: &str) -> Reply {
        self.model = Perceptron::load(Path::new(path)).map_err(|e| e.to_string())?;
        tracing::info!(path, classes = self.model.classes(), "model state loaded");
        Ok(json!({"loaded": path}))
    }

    fn load(&mut self, id: &str, input: &Value, output: &Value) -> Reply {
        let example = Example::parse(input, output).map_err(|e| e.to_string())?;
        self.model.fit(&example).map_err(|e| e.to_string())?;
        self.objects.insert(id.to_string(), example);
        Ok(Value::Bool(true))
    }

    fn lookup<'a>(&'a self, ids: &'a [String]) -> Result<Vec<(&'a str, &'a Example)>, String> {
        ids.iter()
            .map(|id| {
                self.objects
                    .get(id)
                    .map(|ex| (id.as_str(), ex))
                    .ok_or_else(|| format!("object {id:?} was never loaded"))
            })
            .collect()
    }

    /// Predictions in the order of `ids`.
    fn process(&self, ids: &[String]) -> Reply {
        let found = self.lookup(ids)?;
        let predictions = found
            .into_iter()
            .map(|(_, ex)| self.model.prediction(ex))
            .collect::<Result<Vec<_>, ModelError>>()
            .map_err(|e| e.to_string())?;
        Ok(Value::Array(predictions))
    }

    fn train(&mut self, ids: &[String], iteration: u64) -> Reply {
        if ids.is_empty() {
            return Err("train needs at least one object".into());
        }
        let batch: Vec<Example> = {
            let found = self.lookup(ids)?;
            if let Some((id, _)) = found.iter().find(|(_, ex)| ex.class.is_none()) {
                return Err(ModelError::Unlabelled(id.to_string()).to_string());
            }
            found.into_iter().map(|(_, ex)| ex.clone()).collect()
        };
        let stats = self.model.train_epoch(&batch);
        let accuracy = stats.accuracy();
        tracing::info!(iteration, accuracy, objects = stats.total, "iteration complete");
        Ok(json!({"accuracy": accuracy, "loss": 1.0 - accuracy}))
    }

    fn save(&self, path: &str) -> Reply {
        self.model.save(Path::new(path)).map_err(|e| e.to_string())?;
        tracing::info!(path, "model state saved");
        Ok(json!({"saved": path}))
    }
}

fn scale_numbers(value: Value, scale: f64) -> Reply {
    Ok(match value {
        Value::Number(n) => {
            let x = n.as_f64().ok_or_else(|| format!("{n} is not representable"))?;
            json!(x * scale)
        }
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|v| scale_numbers(v, scale))
                .collect::<Result<_, _>>()?,
        ),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| -> Result<(String, Value), String> {
                    Ok((k, scale_numbers(v, scale)?))
                })
                .collect::<Result<_, _>>()?,
        ),
        Value::String(s) => return Err(format!("cannot scale string {s:?}")),
        other => other,
    })
}
