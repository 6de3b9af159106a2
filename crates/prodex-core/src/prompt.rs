//! Prompt rendering for training and inference

use crate::error::DataError;
use crate::example::ProductExample;
use serde::Serialize;
use serde_json::Value;
use std::io;

/// Prefix in front of the source text.
pub const INPUT_TAG: &str = "### Eingabe: ";
/// Prefix in front of the serialized product record.
pub const OUTPUT_TAG: &str = "### Ausgabe: ";
/// End-of-sequence marker appended to every rendered prompt.
pub const EOS_MARKER: &str = "<|endoftext|>";

/// Render one example into the fixed training template.
///
/// Deterministic; produces exactly one string per example. The only failure
/// mode is serialization of the output value.
pub fn render_prompt(example: &ProductExample) -> Result<String, DataError> {
    let output = to_json_text(&example.output)?;
    Ok(format!(
        "{INPUT_TAG}{}\n{OUTPUT_TAG}{output}{EOS_MARKER}",
        example.input
    ))
}

/// Serialize a JSON value with `", "` / `": "` separators and no ASCII
/// escaping.
///
/// The adapters were originally trained on prompts with this spacing, so the
/// rendered output segment has to keep it byte for byte.
pub fn to_json_text(value: &Value) -> Result<String, DataError> {
    let mut buf = Vec::new();
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, SpacedFormatter);
    value.serialize(&mut ser)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Compact JSON with a space after `,` and `:`.
struct SpacedFormatter;

impl serde_json::ser::Formatter for SpacedFormatter {
    fn begin_array_value<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_key<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_value<W>(&mut self, writer: &mut W) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        writer.write_all(b": ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn renders_the_reference_example() {
        let example = ProductExample {
            input: "<div>Phone</div>".to_string(),
            output: json!({"name": "Phone"}),
        };

        let prompt = render_prompt(&example).unwrap();
        assert_eq!(
            prompt,
            "### Eingabe: <div>Phone</div>\n### Ausgabe: {\"name\": \"Phone\"}<|endoftext|>"
        );
    }

    #[test]
    fn one_prompt_per_example() {
        let examples = vec![
            ProductExample {
                input: "a".to_string(),
                output: json!({"name": "A"}),
            },
            ProductExample {
                input: "b".to_string(),
                output: json!({"name": "B"}),
            },
        ];

        let prompts: Vec<String> = examples
            .iter()
            .map(|e| render_prompt(e).unwrap())
            .collect();
        assert_eq!(prompts.len(), examples.len());
    }

    #[test]
    fn output_segment_round_trips() {
        let output = json!({
            "name": "Samsung Galaxy Tab",
            "preis": "€ 599",
            "kategorie": "Tablet",
            "merkmale": ["10 Zoll", "WLAN"]
        });
        let example = ProductExample {
            input: "<div>...</div>".to_string(),
            output: output.clone(),
        };

        let prompt = render_prompt(&example).unwrap();
        let segment = prompt
            .strip_suffix(EOS_MARKER)
            .unwrap()
            .split(OUTPUT_TAG)
            .nth(1)
            .unwrap();

        let parsed: Value = serde_json::from_str(segment).unwrap();
        assert_eq!(parsed, output);
    }

    #[test]
    fn json_text_keeps_python_spacing() {
        let value = json!({"a": 1, "b": [1, 2], "c": "ü"});
        assert_eq!(
            to_json_text(&value).unwrap(),
            r#"{"a": 1, "b": [1, 2], "c": "ü"}"#
        );
    }
}
