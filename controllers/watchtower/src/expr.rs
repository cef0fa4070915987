//! Boolean filter expressions.
//!
//! Filters are CEL programs evaluated against the event bindings. An empty or
//! whitespace-only expression accepts the event.

use cel_interpreter::{Context, Program, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExprError {
    #[error("expression compile error: {0}")]
    Compile(String),

    #[error("expression evaluation error: {0}")]
    Eval(String),

    #[error("result type is not bool")]
    NotBool,
}

pub fn evaluate_bool(
    expression: &str,
    bindings: &[(&str, &serde_json::Value)],
) -> Result<bool, ExprError> {
    if expression.trim().is_empty() {
        return Ok(true);
    }

    let program =
        Program::compile(expression).map_err(|err| ExprError::Compile(err.to_string()))?;

    let mut context = Context::default();
    for (name, value) in bindings {
        context
            .add_variable(*name, *value)
            .map_err(|err| ExprError::Eval(err.to_string()))?;
    }

    match program
        .execute(&context)
        .map_err(|err| ExprError::Eval(err.to_string()))?
    {
        Value::Bool(result) => Ok(result),
        _ => Err(ExprError::NotBool),
    }
}
