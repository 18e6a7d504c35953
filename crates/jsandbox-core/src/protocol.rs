//! Wire protocol between the host and a worker process
//!
//! One request is one JSON document inside one frame. The reply is the
//! manifested JSON on stdout or the diagnostic text on stderr, also framed.

use serde::{Deserialize, Serialize};

/// A named value supplied alongside the snippet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binding {
    pub key: String,
    pub value: String,
}

/// External variables and top-level arguments, in insertion order.
///
/// `*_vars` values are plain strings, `*_codes` values are snippets of code.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Bindings {
    pub ext_codes: Vec<Binding>,
    pub ext_vars: Vec<Binding>,
    pub tla_codes: Vec<Binding>,
    pub tla_vars: Vec<Binding>,
}

impl Bindings {
    pub fn ext_code(&mut self, key: impl Into<String>, value: impl Into<String>) {
        push(&mut self.ext_codes, key, value);
    }

    pub fn ext_var(&mut self, key: impl Into<String>, value: impl Into<String>) {
        push(&mut self.ext_vars, key, value);
    }

    pub fn tla_code(&mut self, key: impl Into<String>, value: impl Into<String>) {
        push(&mut self.tla_codes, key, value);
    }

    pub fn tla_var(&mut self, key: impl Into<String>, value: impl Into<String>) {
        push(&mut self.tla_vars, key, value);
    }
}

fn push(list: &mut Vec<Binding>, key: impl Into<String>, value: impl Into<String>) {
    list.push(Binding {
        key: key.into(),
        value: value.into(),
    });
}

/// Request to evaluate one snippet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationRequest {
    /// Name used in diagnostics
    pub filename: String,
    /// Source text
    pub snippet: String,
    #[serde(flatten)]
    pub bindings: Bindings,
}

impl EvaluationRequest {
    pub fn new(filename: impl Into<String>, snippet: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            snippet: snippet.into(),
            bindings: Bindings::default(),
        }
    }

    #[must_use]
    pub fn with_bindings(mut self, bindings: Bindings) -> Self {
        self.bindings = bindings;
        self
    }

    /// The trivial request used to warm up a fresh worker.
    #[must_use]
    pub fn warm_up() -> Self {
        Self::new("warm-up", "{}")
    }
}

/// Encode a message to JSON
pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(msg)
}

/// Decode a message from JSON
pub fn decode<'a, T: Deserialize<'a>>(data: &'a [u8]) -> Result<T, serde_json::Error> {
    serde_json::from_slice(data)
}
