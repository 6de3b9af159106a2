//! # prodex-core
//!
//! Data model and prompt rendering for the prodex fine-tuning toolkit.

pub mod config;
pub mod error;
pub mod example;
pub mod prompt;

pub use config::RunConfig;
pub use error::DataError;
pub use example::{ProductExample, load_examples};
pub use prompt::{EOS_MARKER, INPUT_TAG, OUTPUT_TAG, render_prompt, to_json_text};
