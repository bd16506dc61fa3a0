//! Per-tenant create parameter overrides.
//!
//! Each tenant may carry a set of overrides applied to every `create` call it
//! issues, after checksum verification and before the call is forwarded.
//! An override is `(parameter, operator, operand)` with operators:
//!
//! - `=` assign/replace; an empty operand deletes the parameter
//! - `?` default-if-absent
//! - `<` clamp a numeric parameter to at most the operand
//! - `+` append operand items to a comma-separated list, deduplicating
//!
//! Overrides are persisted on the tenant as a JSON map
//! `{"param": "<operator><operand>"}` and parsed from `PARAM<op>VALUE`
//! strings by admin tooling.

use crate::bbb::Params;
use std::collections::BTreeMap;
use thiserror::Error;

/// The accepted override operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverrideOp {
    /// `=` force the parameter to the operand (empty operand deletes).
    Assign,
    /// `?` set the operand only when the parameter is absent or empty.
    Default,
    /// `<` cap a numeric parameter at the operand.
    ClampMax,
    /// `+` merge operand items into a comma-separated list.
    Append,
}

impl OverrideOp {
    /// Parse a single operator character.
    #[must_use]
    pub fn from_char(c: char) -> Option<Self> {
        match c {
            '=' => Some(Self::Assign),
            '?' => Some(Self::Default),
            '<' => Some(Self::ClampMax),
            '+' => Some(Self::Append),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_char(self) -> char {
        match self {
            Self::Assign => '=',
            Self::Default => '?',
            Self::ClampMax => '<',
            Self::Append => '+',
        }
    }
}

/// A single parameter override.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Override {
    pub name: String,
    pub op: OverrideOp,
    pub value: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OverrideError {
    #[error("failed to parse override {0:?}: expected NAME{{=?<+}}VALUE")]
    Parse(String),
}

impl Override {
    /// Parse an override from its `NAME<op>VALUE` string form.
    ///
    /// Parameter names are restricted to `[a-zA-Z0-9_-]`, matching the BBB
    /// create parameter grammar.
    ///
    /// # Errors
    ///
    /// Returns `OverrideError::Parse` for anything else.
    pub fn parse(spec: &str) -> Result<Self, OverrideError> {
        let op_idx = spec
            .char_indices()
            .find(|(_, c)| !c.is_ascii_alphanumeric() && *c != '_' && *c != '-')
            .ok_or_else(|| OverrideError::Parse(spec.to_string()))?;

        let (name, rest) = spec.split_at(op_idx.0);
        let mut rest_chars = rest.chars();
        let op = rest_chars
            .next()
            .and_then(OverrideOp::from_char)
            .ok_or_else(|| OverrideError::Parse(spec.to_string()))?;

        if name.is_empty() {
            return Err(OverrideError::Parse(spec.to_string()));
        }

        Ok(Self {
            name: name.to_string(),
            op,
            value: rest_chars.as_str().to_string(),
        })
    }

    /// The stored form: operator character followed by the operand.
    #[must_use]
    pub fn stored_value(&self) -> String {
        format!("{}{}", self.op.as_char(), self.value)
    }

    /// Reconstruct an override from a stored `(name, "<op><operand>")` pair.
    ///
    /// # Errors
    ///
    /// Returns `OverrideError::Parse` when the stored value has no operator.
    pub fn from_stored(name: &str, stored: &str) -> Result<Self, OverrideError> {
        let mut chars = stored.chars();
        let op = chars
            .next()
            .and_then(OverrideOp::from_char)
            .ok_or_else(|| OverrideError::Parse(format!("{name}{stored}")))?;
        Ok(Self {
            name: name.to_string(),
            op,
            value: chars.as_str().to_string(),
        })
    }

    /// Apply this override to a parameter map.
    pub fn apply(&self, params: &mut Params) {
        match self.op {
            OverrideOp::Assign => {
                if self.value.is_empty() {
                    params.remove(&self.name);
                } else {
                    params.set(&self.name, self.value.clone());
                }
            }
            OverrideOp::Default => {
                let missing = params.get(&self.name).is_none_or(str::is_empty);
                if missing {
                    params.set(&self.name, self.value.clone());
                }
            }
            OverrideOp::ClampMax => {
                let Ok(cap) = self.value.parse::<f64>() else {
                    tracing::debug!(
                        target: "lb.overrides",
                        name = %self.name,
                        "Clamp override with non-numeric operand, skipping"
                    );
                    return;
                };
                if let Some(current) = params.get(&self.name) {
                    match current.parse::<f64>() {
                        Ok(value) if value > cap => {
                            params.set(&self.name, self.value.clone());
                        }
                        Ok(_) => {}
                        Err(_) => {
                            // Non-numeric input for a numeric parameter:
                            // enforce the cap instead of passing it through.
                            params.set(&self.name, self.value.clone());
                        }
                    }
                }
            }
            OverrideOp::Append => {
                let current = params.get(&self.name).unwrap_or_default().to_string();
                let mut items: Vec<&str> = current
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .collect();
                for item in self.value.split(',').map(str::trim) {
                    if !item.is_empty() && !items.contains(&item) {
                        items.push(item);
                    }
                }
                params.set(&self.name, items.join(","));
            }
        }
    }
}

/// Apply a tenant's stored override map to create parameters.
///
/// Unparseable stored entries are skipped with a warning; a broken override
/// must not take the create path down.
pub fn apply_overrides(stored: &BTreeMap<String, String>, params: &mut Params) {
    for (name, value) in stored {
        match Override::from_stored(name, value) {
            Ok(override_) => override_.apply(params),
            Err(e) => {
                tracing::warn!(
                    target: "lb.overrides",
                    name = %name,
                    error = %e,
                    "Skipping unparseable stored override"
                );
            }
        }
    }
}
