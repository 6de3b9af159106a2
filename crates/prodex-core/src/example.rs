//! Training examples and the JSON data loader

use crate::error::DataError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;

/// One supervised example: raw product markup in, structured record out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductExample {
    /// Source text to extract from (typically an HTML snippet).
    pub input: String,
    /// Structured product record, serialized into the rendered prompt.
    pub output: Value,
}

/// Load training examples from a JSON array file.
///
/// Every entry must carry both an `input` string and an `output` value; a
/// malformed entry aborts the whole load. There are no retries.
pub fn load_examples(path: impl AsRef<Path>) -> Result<Vec<ProductExample>, DataError> {
    let raw = std::fs::read_to_string(path)?;
    let entries: Vec<Value> = serde_json::from_str(&raw)?;
    if entries.is_empty() {
        return Err(DataError::Empty);
    }

    let mut examples = Vec::with_capacity(entries.len());
    for (index, entry) in entries.into_iter().enumerate() {
        let Value::Object(mut obj) = entry else {
            return Err(DataError::NotAnObject { index });
        };
        let input = match obj.get("input").and_then(Value::as_str) {
            Some(s) => s.to_string(),
            None => {
                return Err(DataError::MissingField {
                    index,
                    field: "input",
                });
            }
        };
        let output = match obj.remove("output") {
            Some(v) if !v.is_null() => v,
            _ => {
                return Err(DataError::MissingField {
                    index,
                    field: "output",
                });
            }
        };
        examples.push(ProductExample { input, output });
    }

    Ok(examples)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_data(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn loads_valid_examples() {
        let file = write_data(
            r#"[
                {"input": "<div>Phone</div>", "output": {"name": "Phone"}},
                {"input": "<div>Tablet</div>", "output": {"name": "Tablet", "preis": 599}}
            ]"#,
        );

        let examples = load_examples(file.path()).unwrap();
        assert_eq!(examples.len(), 2);
        assert_eq!(examples[0].input, "<div>Phone</div>");
        assert_eq!(examples[1].output["preis"], 599);
    }

    #[test]
    fn missing_output_field_is_a_data_error() {
        let file = write_data(r#"[{"input": "<div>Phone</div>"}]"#);

        let err = load_examples(file.path()).unwrap_err();
        assert!(matches!(
            err,
            DataError::MissingField {
                index: 0,
                field: "output"
            }
        ));
    }

    #[test]
    fn missing_input_field_is_a_data_error() {
        let file = write_data(r#"[{"output": {"name": "Phone"}}]"#);

        let err = load_examples(file.path()).unwrap_err();
        assert!(matches!(
            err,
            DataError::MissingField {
                index: 0,
                field: "input"
            }
        ));
    }

    #[test]
    fn missing_file_is_a_data_error() {
        let err = load_examples("does/not/exist.json").unwrap_err();
        assert!(matches!(err, DataError::Io(_)));
    }

    #[test]
    fn invalid_json_is_a_data_error() {
        let file = write_data("not json at all");
        let err = load_examples(file.path()).unwrap_err();
        assert!(matches!(err, DataError::Parse(_)));
    }

    #[test]
    fn empty_collection_is_a_data_error() {
        let file = write_data("[]");
        let err = load_examples(file.path()).unwrap_err();
        assert!(matches!(err, DataError::Empty));
    }

    #[test]
    fn null_output_counts_as_missing() {
        let file = write_data(r#"[{"input": "x", "output": null}]"#);
        let err = load_examples(file.path()).unwrap_err();
        assert!(matches!(err, DataError::MissingField { field: "output", .. }));
    }
}
