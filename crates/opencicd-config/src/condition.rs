//! Step condition predicates.
//!
//! A condition is interpolated first and then evaluated. The grammar is deliberately small:
//!
//! ```text
//! true | false
//! <operand> == <operand>
//! <operand> != <operand>
//! <operand>                 (true when non-empty and not "false")
//! ```
//!
//! Operands may be wrapped in single or double quotes.

use crate::variables::VariableContext;
use crate::{ConfigError, ConfigResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    Literal(bool),
    Equals(String, String),
    NotEquals(String, String),
    NonEmpty(String),
}

impl Condition {
    /// Parse a condition expression and check that every variable it references exists.
    pub fn parse(expression: &str) -> ConfigResult<Self> {
        let invalid = |message: &str| ConfigError::InvalidCondition {
            expression: expression.to_string(),
            message: message.to_string(),
        };

        for name in VariableContext::references(expression) {
            if !VariableContext::is_known(&name) {
                return Err(invalid(&format!("unknown variable ${{{name}}}")));
            }
        }

        let trimmed = expression.trim();
        if trimmed.is_empty() {
            return Err(invalid("empty expression"));
        }

        match trimmed {
            "true" => return Ok(Condition::Literal(true)),
            "false" => return Ok(Condition::Literal(false)),
            _ => {}
        }

        for (op, negate) in [("!=", true), ("==", false)] {
            if let Some((lhs, rhs)) = trimmed.split_once(op) {
                let lhs = operand(lhs).ok_or_else(|| invalid("missing left operand"))?;
                let rhs = operand(rhs).ok_or_else(|| invalid("missing right operand"))?;
                if [&lhs, &rhs]
                    .iter()
                    .any(|side| side.contains("==") || side.contains("!="))
                {
                    return Err(invalid("only one comparison is allowed"));
                }
                return Ok(if negate {
                    Condition::NotEquals(lhs, rhs)
                } else {
                    Condition::Equals(lhs, rhs)
                });
            }
        }

        let value = operand(trimmed).ok_or_else(|| invalid("empty operand"))?;
        Ok(Condition::NonEmpty(value))
    }

    pub fn evaluate(&self, ctx: &VariableContext) -> bool {
        match self {
            Condition::Literal(value) => *value,
            Condition::Equals(lhs, rhs) => {
                ctx.interpolate_or_empty(lhs) == ctx.interpolate_or_empty(rhs)
            }
            Condition::NotEquals(lhs, rhs) => {
                ctx.interpolate_or_empty(lhs) != ctx.interpolate_or_empty(rhs)
            }
            Condition::NonEmpty(value) => {
                let value = ctx.interpolate_or_empty(value);
                !value.is_empty() && value != "false"
            }
        }
    }
}

/// Parse and evaluate in one go.
pub fn evaluate(expression: &str, ctx: &VariableContext) -> ConfigResult<bool> {
    Ok(Condition::parse(expression)?.evaluate(ctx))
}

/// Trim and strip one pair of matching quotes. `None` for a missing operand; `''` is a valid
/// empty operand.
fn operand(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    for quote in ['\'', '"'] {
        if raw.len() >= 2 && raw.starts_with(quote) && raw.ends_with(quote) {
            return Some(raw[1..raw.len() - 1].to_string());
        }
    }
    Some(raw.to_string())
}
