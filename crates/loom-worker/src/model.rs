//! Multi-class perceptron — the reference model behind `loom-worker train`.
//!
//! Inputs are flattened to a feature vector. Labels are class indices,
//! booleans, or one-hot/score vectors (the argmax is the class). Predictions
//! come back in the shape the labels used.

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("input must be a number or an array of numbers, got {0}")]
    Input(String),
    #[error("output must be a class index, a boolean, or a score vector, got {0}")]
    Label(String),
    #[error("object has {got} features, model expects {expected}")]
    Dimension { expected: usize, got: usize },
    #[error("object {0:?} has no label")]
    Unlabelled(String),
    #[error("model state {path}: {detail}")]
    State { path: String, detail: String },
}

/// Contents of the architecture artifact. Missing fields are inferred from
/// the data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Architecture {
    pub inputs: Option<usize>,
    pub classes: Option<usize>,
    pub learning_rate: f64,
}

impl Default for Architecture {
    fn default() -> Self {
        Self {
            inputs: None,
            classes: None,
            learning_rate: 0.1,
        }
    }
}

/// One loaded object.
#[derive(Debug, Clone, PartialEq)]
pub struct Example {
    pub features: Vec<f64>,
    pub class: Option<usize>,
    /// Width of the label vector when labels are one-hot.
    pub one_hot: Option<usize>,
}

impl Example {
    pub fn parse(input: &Value, output: &Value) -> Result<Self, ModelError> {
        let mut features = Vec::new();
        flatten(input, &mut features)?;
        let (class, one_hot) = match output {
            Value::Null => (None, None),
            Value::Bool(b) => (Some(*b as usize), None),
            Value::Number(n) => {
                let f = n.as_f64().unwrap_or(-1.0);
                if !f.is_finite() || f < -0.5 {
                    return Err(ModelError::Label(output.to_string()));
                }
                (Some(f.round() as usize), None)
            }
            Value::Array(items) => {
                let scores: Option<Vec<f64>> = items.iter().map(Value::as_f64).collect();
                match scores.as_deref().and_then(argmax) {
                    Some(i) => (Some(i), Some(items.len())),
                    None => return Err(ModelError::Label(output.to_string())),
                }
            }
            other => return Err(ModelError::Label(other.to_string())),
        };
        Ok(Self {
            features,
            class,
            one_hot,
        })
    }
}

fn flatten(value: &Value, out: &mut Vec<f64>) -> Result<(), ModelError> {
    match value {
        Value::Number(n) => {
            out.push(n.as_f64().ok_or_else(|| ModelError::Input(value.to_string()))?)
        }
        Value::Bool(b) => out.push(if *b { 1.0 } else { 0.0 }),
        Value::Array(items) => {
            for item in items {
                flatten(item, out)?;
            }
        }
        other => return Err(ModelError::Input(other.to_string())),
    }
    Ok(())
}

/// First index of the largest value.
fn argmax(values: &[f64]) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (i, v) in values.iter().copied().enumerate() {
        match best {
            Some((_, b)) if b >= v => {}
            _ => best = Some((i, v)),
        }
    }
    best.map(|(i, _)| i)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochStats {
    pub correct: usize,
    pub total: usize,
}

impl EpochStats {
    pub fn accuracy(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.correct as f64 / self.total as f64
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Perceptron {
    learning_rate: f64,
    /// 0 until the first example fixes it.
    inputs: usize,
    /// One row per class; the bias is the last column.
    weights: Vec<Vec<f64>>,
    one_hot: Option<usize>,
}

impl Perceptron {
    pub fn new(arch: &Architecture) -> Self {
        let inputs = arch.inputs.unwrap_or(0);
        let classes = arch.classes.unwrap_or(0);
        Self {
            learning_rate: arch.learning_rate,
            inputs,
            weights: vec![vec![0.0; inputs + 1]; classes],
            one_hot: None,
        }
    }

    pub fn classes(&self) -> usize {
        self.weights.len()
    }

    /// Fix the input width on first use and grow the class rows as needed.
    pub fn fit(&mut self, example: &Example) -> Result<(), ModelError> {
        let got = example.features.len();
        if self.inputs == 0 && self.weights.iter().all(|w| w.len() <= 1) {
            self.inputs = got;
            for row in &mut self.weights {
                row.resize(got + 1, 0.0);
            }
        } else if got != self.inputs {
            return Err(ModelError::Dimension {
                expected: self.inputs,
                got,
            });
        }
        let needed = example
            .class
            .map(|c| c + 1)
            .max(example.one_hot)
            .unwrap_or(0);
        if needed > self.weights.len() {
            self.weights.resize(needed, vec![0.0; self.inputs + 1]);
        }
        if example.one_hot.is_some() {
            self.one_hot = example.one_hot.max(self.one_hot);
        }
        Ok(())
    }

    fn scores(&self, features: &[f64]) -> Vec<f64> {
        self.weights
            .iter()
            .map(|row| {
                let (w, bias) = row.split_at(row.len() - 1);
                w.iter().zip(features).map(|(w, x)| w * x).sum::<f64>() + bias[0]
            })
            .collect()
    }

    pub fn predict(&self, features: &[f64]) -> Option<usize> {
        argmax(&self.scores(features))
    }

    /// The predicted class in the shape the labels used.
    pub fn prediction(&self, example: &Example) -> Result<Value, ModelError> {
        if example.features.len() != self.inputs {
            return Err(ModelError::Dimension {
                expected: self.inputs,
                got: example.features.len(),
            });
        }
        let class = self.predict(&example.features);
        Ok(match (self.one_hot, class) {
            (Some(width), Some(c)) => Value::from(
                (0..width.max(self.classes()))
                    .map(|i| if i == c { 1.0 } else { 0.0 })
                    .collect::<Vec<f64>>(),
            ),
            (None, Some(c)) => Value::from(c),
            (_, None) => Value::Null,
        })
    }

    /// One pass in the given order. Counts predictions made before each update.
    pub fn train_epoch<'a>(
        &mut self,
        examples: impl IntoIterator<Item = &'a Example>,
    ) -> EpochStats {
        let mut stats = EpochStats {
            correct: 0,
            total: 0,
        };
        for ex in examples {
            let Some(label) = ex.class else { continue };
            stats.total += 1;
            let predicted = self.predict(&ex.features);
            if predicted == Some(label) {
                stats.correct += 1;
                continue;
            }
            let lr = self.learning_rate;
            self.adjust(label, &ex.features, lr);
            if let Some(wrong) = predicted {
                self.adjust(wrong, &ex.features, -lr);
            }
        }
        stats
    }

    fn adjust(&mut self, class: usize, features: &[f64], step: f64) {
        if let Some(row) = self.weights.get_mut(class) {
            let bias = row.len() - 1;
            for (w, x) in row[..bias].iter_mut().zip(features) {
                *w += step * x;
            }
            row[bias] += step;
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), ModelError> {
        let err = |detail: String| ModelError::State {
            path: path.display().to_string(),
            detail,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| err(e.to_string()))?;
        }
        let json = serde_json::to_vec_pretty(self).map_err(|e| err(e.to_string()))?;
        std::fs::write(path, json).map_err(|e| err(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self, ModelError> {
        let err = |detail: String| ModelError::State {
            path: path.display().to_string(),
            detail,
        };
        let bytes = std::fs::read(path).map_err(|e| err(e.to_string()))?;
        serde_json::from_slice(&bytes).map_err(|e| err(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ex(input: Value, output: Value) -> Example {
        Example::parse(&input, &output).unwrap()
    }

    #[test]
    fn labels_in_every_supported_shape() {
        assert_eq!(ex(json!(1), json!(2)).class, Some(2));
        assert_eq!(ex(json!([1, [2, 3]]), json!(true)).features, vec![1.0, 2.0, 3.0]);
        let hot = ex(json!([0]), json!([0, 0, 1, 0]));
        assert_eq!((hot.class, hot.one_hot), (Some(2), Some(4)));
        assert_eq!(ex(json!([0]), Value::Null).class, None);

        assert!(matches!(
            Example::parse(&json!("x"), &json!(0)),
            Err(ModelError::Input(_))
        ));
        assert!(matches!(
            Example::parse(&json!(1), &json!(-3)),
            Err(ModelError::Label(_))
        ));
    }

    #[test]
    fn learns_a_separable_problem() {
        // Class is 1 when the first feature is large.
        let data: Vec<Example> = (0..8)
            .map(|i| {
                let x = i as f64;
                let label = if i >= 4 { 1 } else { 0 };
                ex(json!([x, 1.0]), json!(label))
            })
            .collect();
        let mut model = Perceptron::new(&Architecture::default());
        for e in &data {
            model.fit(e).unwrap();
        }
        let mut last = EpochStats { correct: 0, total: 0 };
        for _ in 0..100 {
            last = model.train_epoch(&data);
            if last.correct == last.total {
                break;
            }
        }
        assert_eq!(last.accuracy(), 1.0);
        assert_eq!(model.prediction(&data[7]).unwrap(), json!(1));
        assert_eq!(model.prediction(&data[0]).unwrap(), json!(0));
    }

    #[test]
    fn one_hot_labels_give_one_hot_predictions() {
        let data = [ex(json!([1, 0]), json!([1, 0])), ex(json!([0, 1]), json!([0, 1]))];
        let mut model = Perceptron::new(&Architecture::default());
        for e in &data {
            model.fit(e).unwrap();
        }
        for _ in 0..10 {
            model.train_epoch(&data);
        }
        assert_eq!(model.prediction(&data[1]).unwrap(), json!([0.0, 1.0]));
    }

    #[test]
    fn feature_width_is_fixed_after_first_object() {
        let mut model = Perceptron::new(&Architecture::default());
        model.fit(&ex(json!([1, 2]), json!(0))).unwrap();
        assert!(matches!(
            model.fit(&ex(json!([1, 2, 3]), json!(0))),
            Err(ModelError::Dimension { expected: 2, got: 3 })
        ));
    }

    #[test]
    fn state_survives_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/model.json");
        let mut model = Perceptron::new(&Architecture {
            classes: Some(3),
            ..Default::default()
        });
        model.fit(&ex(json!([1.0]), json!(2))).unwrap();
        model.train_epoch(&[ex(json!([1.0]), json!(2))]);
        model.save(&path).unwrap();
        assert_eq!(Perceptron::load(&path).unwrap(), model);
        assert!(Perceptron::load(&dir.path().join("missing.json")).is_err());
    }
}
