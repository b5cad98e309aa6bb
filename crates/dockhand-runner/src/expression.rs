// Expression evaluation against a run context: `${{ … }}` interpolation,
// condition evaluation for `if:` guards, and in-place YAML node evaluation
// used to resolve dynamic matrix dimensions.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Result};
use parking_lot::RwLock;

use crate::matrix::format_value;
use crate::model::{JobResult, StepResult};

/// Step results shared between the step sequencer (single writer) and the
/// evaluators reading the `steps.*` context.
pub type SharedStepResults = Arc<RwLock<HashMap<String, StepResult>>>;

/// The two-and-a-half operations the core needs from an evaluator.
pub trait ExpressionEvaluator: Send + Sync {
    /// Substitute every `${{ … }}` occurrence. Unresolvable paths become
    /// the empty string; an unterminated expression is left verbatim.
    fn interpolate(&self, input: &str) -> String;

    /// Evaluate an `if:` guard. An empty guard means `success()`; a guard
    /// that names no status function is implicitly conjoined with it.
    fn evaluate_condition(&self, expression: &str) -> Result<bool>;

    /// Evaluate expressions inside a YAML node in place.
    fn evaluate_yaml_node(&self, node: &mut serde_yaml::Value) -> Result<()>;
}

/// An evaluator bound to one run context's data.
pub struct ContextEvaluator {
    /// Object with the static contexts: github, env, secrets, vars, matrix,
    /// inputs, needs.
    root: serde_json::Value,
    steps: SharedStepResults,
    job_status: JobResult,
    cancelled: bool,
}

impl ContextEvaluator {
    pub fn new(
        root: serde_json::Value,
        steps: SharedStepResults,
        job_status: JobResult,
        cancelled: bool,
    ) -> Self {
        Self {
            root,
            steps,
            job_status,
            cancelled,
        }
    }

    fn steps_value(&self) -> serde_json::Value {
        let steps = self.steps.read();
        let mut object = serde_json::Map::new();
        for (key, result) in steps.iter() {
            object.insert(
                key.clone(),
                serde_json::json!({
                    "outcome": result.outcome.as_str(),
                    "conclusion": result.conclusion.as_str(),
                    "outputs": result.outputs,
                }),
            );
        }
        serde_json::Value::Object(object)
    }

    fn lookup(&self, path: &str) -> serde_json::Value {
        let mut parts = path.split('.');
        let Some(root_key) = parts.next() else {
            return serde_json::Value::Null;
        };
        let mut current = if root_key == "steps" {
            self.steps_value()
        } else {
            self.root
                .get(root_key)
                .cloned()
                .unwrap_or(serde_json::Value::Null)
        };
        for part in parts {
            current = current.get(part).cloned().unwrap_or(serde_json::Value::Null);
        }
        current
    }

    fn evaluate(&self, expression: &str) -> Result<serde_json::Value> {
        let expression = expression.trim();
        if expression.is_empty() {
            bail!("empty expression");
        }

        if let Some((left, right)) = split_top_level(expression, "||") {
            let left = self.evaluate(left)?;
            if truthy(&left) {
                return Ok(serde_json::Value::Bool(true));
            }
            return Ok(serde_json::Value::Bool(truthy(&self.evaluate(right)?)));
        }
        if let Some((left, right)) = split_top_level(expression, "&&") {
            let left = self.evaluate(left)?;
            if !truthy(&left) {
                return Ok(serde_json::Value::Bool(false));
            }
            return Ok(serde_json::Value::Bool(truthy(&self.evaluate(right)?)));
        }
        if let Some((left, right)) = split_top_level(expression, "==") {
            let equal = loose_equal(&self.evaluate(left)?, &self.evaluate(right)?);
            return Ok(serde_json::Value::Bool(equal));
        }
        if let Some((left, right)) = split_top_level(expression, "!=") {
            let equal = loose_equal(&self.evaluate(left)?, &self.evaluate(right)?);
            return Ok(serde_json::Value::Bool(!equal));
        }
        if let Some(inner) = expression.strip_prefix('!') {
            return Ok(serde_json::Value::Bool(!truthy(&self.evaluate(inner)?)));
        }

        // Status functions.
        match expression {
            "success()" => {
                return Ok(serde_json::Value::Bool(
                    !self.cancelled && self.job_status != JobResult::Failure,
                ))
            }
            "failure()" => {
                return Ok(serde_json::Value::Bool(self.job_status == JobResult::Failure))
            }
            "cancelled()" => return Ok(serde_json::Value::Bool(self.cancelled)),
            "always()" => return Ok(serde_json::Value::Bool(true)),
            _ => {}
        }

        // Literals.
        if expression == "true" {
            return Ok(serde_json::Value::Bool(true));
        }
        if expression == "false" {
            return Ok(serde_json::Value::Bool(false));
        }
        if expression == "null" {
            return Ok(serde_json::Value::Null);
        }
        if let Some(stripped) = expression
            .strip_prefix('\'')
            .and_then(|rest| rest.strip_suffix('\''))
        {
            return Ok(serde_json::Value::String(stripped.replace("''", "'")));
        }
        if let Ok(integer) = expression.parse::<i64>() {
            return Ok(serde_json::Value::from(integer));
        }
        if let Ok(float) = expression.parse::<f64>() {
            return Ok(serde_json::Value::from(float));
        }

        // Context path.
        if expression
            .chars()
            .all(|c| c.is_alphanumeric() || matches!(c, '.' | '_' | '-'))
        {
            return Ok(self.lookup(expression));
        }

        bail!("unsupported expression: {expression}")
    }
}

impl ExpressionEvaluator for ContextEvaluator {
    fn interpolate(&self, input: &str) -> String {
        let mut output = String::with_capacity(input.len());
        let mut rest = input;
        while let Some(start) = rest.find("${{") {
            output.push_str(&rest[..start]);
            let after = &rest[start + 3..];
            match after.find("}}") {
                Some(end) => {
                    let inner = &after[..end];
                    match self.evaluate(inner) {
                        Ok(serde_json::Value::Null) => {}
                        Ok(value) => output.push_str(&format_value(&value)),
                        Err(error) => {
                            tracing::debug!("expression '{}' did not evaluate: {error}", inner.trim());
                        }
                    }
                    rest = &after[end + 2..];
                }
                None => {
                    // Unterminated expression: keep the remainder verbatim.
                    output.push_str(&rest[start..]);
                    rest = "";
                }
            }
        }
        output.push_str(rest);
        output
    }

    fn evaluate_condition(&self, expression: &str) -> Result<bool> {
        let trimmed = expression.trim();
        if trimmed.is_empty() {
            return Ok(!self.cancelled && self.job_status != JobResult::Failure);
        }
        let inner = trimmed
            .strip_prefix("${{")
            .and_then(|rest| rest.strip_suffix("}}"))
            .unwrap_or(trimmed)
            .trim();

        let names_status = ["success()", "failure()", "cancelled()", "always()"]
            .iter()
            .any(|function| inner.contains(*function));

        if !names_status && (self.cancelled || self.job_status == JobResult::Failure) {
            // Implicit success() conjunction.
            return Ok(false);
        }
        Ok(truthy(&self.evaluate(inner)?))
    }

    fn evaluate_yaml_node(&self, node: &mut serde_yaml::Value) -> Result<()> {
        match node {
            serde_yaml::Value::String(s) => {
                if s.contains("${{") {
                    if !s.contains("}}") {
                        bail!("unterminated expression in '{s}'");
                    }
                    *s = self.interpolate(s);
                }
                Ok(())
            }
            serde_yaml::Value::Sequence(items) => {
                for item in items {
                    self.evaluate_yaml_node(item)?;
                }
                Ok(())
            }
            serde_yaml::Value::Mapping(mapping) => {
                for (_, value) in mapping.iter_mut() {
                    self.evaluate_yaml_node(value)?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

fn truthy(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => false,
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        serde_json::Value::String(s) => !s.is_empty(),
        _ => true,
    }
}

fn loose_equal(left: &serde_json::Value, right: &serde_json::Value) -> bool {
    if left == right {
        return true;
    }
    format_value(left) == format_value(right)
}

/// Split at the first top-level occurrence of `op`, ignoring quoted text.
fn split_top_level<'a>(expression: &'a str, op: &str) -> Option<(&'a str, &'a str)> {
    let bytes = expression.as_bytes();
    let op_bytes = op.as_bytes();
    let mut in_quote = false;
    let mut i = 0;
    while i + op_bytes.len() <= bytes.len() {
        let c = bytes[i];
        if c == b'\'' {
            in_quote = !in_quote;
            i += 1;
            continue;
        }
        if !in_quote && &bytes[i..i + op_bytes.len()] == op_bytes {
            return Some((&expression[..i], &expression[i + op_bytes.len()..]));
        }
        i += 1;
    }
    None
}
