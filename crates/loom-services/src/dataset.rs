//! JSONL datasets: one `{"id"?, "input", "output"}` object per line.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum DatasetError {
    #[error("failed to read dataset {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{path}:{line}: {detail}")]
    Parse {
        path: PathBuf,
        line: usize,
        detail: String,
    },
    #[error("{path}: object id {id:?} appears more than once")]
    DuplicateId { path: PathBuf, id: String },
    #[error("dataset {0} has no objects")]
    Empty(PathBuf),
}

#[derive(Debug, Clone, PartialEq)]
pub struct DatasetObject {
    pub id: String,
    pub input: Value,
    pub output: Value,
}

#[derive(Deserialize)]
struct RawObject {
    #[serde(default)]
    id: Option<String>,
    input: Value,
    #[serde(default)]
    output: Value,
}

/// Parse dataset text. Objects without an id become `obj-<n>`, `n` counting
/// objects from zero.
pub fn parse_dataset(path: &Path, text: &str) -> Result<Vec<DatasetObject>, DatasetError> {
    let mut objects = Vec::new();
    let mut seen = HashSet::new();
    for (idx, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let raw: RawObject = serde_json::from_str(line).map_err(|e| DatasetError::Parse {
            path: path.to_path_buf(),
            line: idx + 1,
            detail: e.to_string(),
        })?;
        let id = raw.id.unwrap_or_else(|| format!("obj-{}", objects.len()));
        if !seen.insert(id.clone()) {
            return Err(DatasetError::DuplicateId {
                path: path.to_path_buf(),
                id,
            });
        }
        objects.push(DatasetObject {
            id,
            input: raw.input,
            output: raw.output,
        });
    }
    if objects.is_empty() {
        return Err(DatasetError::Empty(path.to_path_buf()));
    }
    Ok(objects)
}

pub async fn read_dataset(path: &Path) -> Result<Vec<DatasetObject>, DatasetError> {
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| DatasetError::Read {
            path: path.to_path_buf(),
            source,
        })?;
    parse_dataset(path, &text)
}

/// Split off the last `fraction` of objects as the test set. The training
/// set always keeps at least one object.
pub fn split_tail(
    mut objects: Vec<DatasetObject>,
    fraction: f64,
) -> (Vec<DatasetObject>, Vec<DatasetObject>) {
    let len = objects.len();
    let wanted = if fraction.is_finite() && fraction > 0.0 {
        (len as f64 * fraction).round() as usize
    } else {
        0
    };
    let test_len = wanted.min(len.saturating_sub(1));
    let test = objects.split_off(len - test_len);
    (objects, test)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn path() -> PathBuf {
        PathBuf::from("/data/set.jsonl")
    }

    #[test]
    fn missing_ids_are_numbered() {
        let text = "{\"input\": [1], \"output\": 0}\n\n{\"id\": \"named\", \"input\": [2]}\n{\"input\": [3], \"output\": 1}\n";
        let objects = parse_dataset(&path(), text).unwrap();
        let ids: Vec<_> = objects.iter().map(|o| o.id.as_str()).collect();
        assert_eq!(ids, ["obj-0", "named", "obj-2"]);
        assert_eq!(objects[1].output, Value::Null);
        assert_eq!(objects[2].input, json!([3]));
    }

    #[test]
    fn bad_line_reports_its_number() {
        let text = "{\"input\": 1}\n{\"input\": \n";
        match parse_dataset(&path(), text) {
            Err(DatasetError::Parse { line, .. }) => assert_eq!(line, 2),
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn duplicate_and_empty_are_rejected() {
        let dup = "{\"id\":\"a\",\"input\":1}\n{\"id\":\"a\",\"input\":2}\n";
        assert!(matches!(
            parse_dataset(&path(), dup),
            Err(DatasetError::DuplicateId { .. })
        ));
        assert!(matches!(
            parse_dataset(&path(), "\n \n"),
            Err(DatasetError::Empty(_))
        ));
    }

    #[test]
    fn test_split_comes_from_the_tail() {
        let objects: Vec<_> = (0..10)
            .map(|i| DatasetObject {
                id: format!("o{i}"),
                input: json!(i),
                output: json!(i),
            })
            .collect();
        let (train, test) = split_tail(objects.clone(), 0.2);
        assert_eq!(train.len(), 8);
        assert_eq!(test.iter().map(|o| o.id.as_str()).collect::<Vec<_>>(), ["o8", "o9"]);

        let (train, test) = split_tail(objects[..1].to_vec(), 0.9);
        assert_eq!((train.len(), test.len()), (1, 0));

        let (train, test) = split_tail(objects, 0.0);
        assert_eq!((train.len(), test.len()), (10, 0));
    }
}
