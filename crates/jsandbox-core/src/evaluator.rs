//! Snippet evaluation inside a worker process
//!
//! The host never looks inside this: it only sees the framed result or the
//! framed diagnostic. The bundled [`Json5Evaluator`] accepts JSON5 documents
//! (bare keys, trailing commas, comments) and splices in external variables
//! referenced as `std.extVar("name")`.

use crate::protocol::{Bindings, EvaluationRequest};

const EXT_VAR_CALL: &str = "std.extVar(";

/// Turns one request into manifested JSON or a diagnostic.
pub trait Evaluator {
    fn evaluate(&self, request: &EvaluationRequest) -> Result<String, String>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Json5Evaluator;

impl Evaluator for Json5Evaluator {
    fn evaluate(&self, request: &EvaluationRequest) -> Result<String, String> {
        let filename = &request.filename;

        if is_top_level_function(&request.snippet) {
            return Err(format!(
                "RUNTIME ERROR: {filename}: top-level functions are not supported by this evaluator"
            ));
        }

        let source = expand_ext_vars(&request.snippet, &request.bindings)
            .map_err(|e| format!("RUNTIME ERROR: {filename}: {e}"))?;

        let value: serde_json::Value =
            json5::from_str(&source).map_err(|e| format!("STATIC ERROR: {filename}: {e}"))?;

        serde_json::to_string_pretty(&value).map_err(|e| format!("RUNTIME ERROR: {filename}: {e}"))
    }
}

fn is_top_level_function(snippet: &str) -> bool {
    snippet
        .trim_start()
        .strip_prefix("function")
        .is_some_and(|rest| rest.starts_with(|c: char| c == '(' || c.is_whitespace()))
}

/// Replace every `std.extVar("name")` with the bound value.
fn expand_ext_vars(snippet: &str, bindings: &Bindings) -> Result<String, String> {
    let mut out = String::with_capacity(snippet.len());
    let mut rest = snippet;

    while let Some(start) = rest.find(EXT_VAR_CALL) {
        out.push_str(&rest[..start]);
        let (name, tail) = split_call_argument(&rest[start + EXT_VAR_CALL.len()..])
            .ok_or_else(|| "std.extVar expects a single string literal argument".to_string())?;
        out.push_str(&resolve_ext_var(name, bindings)?);
        rest = tail;
    }

    out.push_str(rest);
    Ok(out)
}

/// Parse `"name")` / `'name')`, returning the name and what follows the `)`.
fn split_call_argument(s: &str) -> Option<(&str, &str)> {
    let s = s.trim_start();
    let quote = s.chars().next().filter(|c| *c == '"' || *c == '\'')?;
    let body = &s[1..];
    let close = body.find(quote)?;
    let tail = body[close + 1..].trim_start().strip_prefix(')')?;
    Some((&body[..close], tail))
}

// Code bindings shadow string bindings of the same name; the latest wins.
fn resolve_ext_var(name: &str, bindings: &Bindings) -> Result<String, String> {
    if let Some(binding) = bindings.ext_codes.iter().rev().find(|b| b.key == name) {
        return Ok(binding.value.clone());
    }
    if let Some(binding) = bindings.ext_vars.iter().rev().find(|b| b.key == name) {
        return serde_json::to_string(&binding.value).map_err(|e| e.to_string());
    }
    Err(format!("Undefined external variable: {name}"))
}
