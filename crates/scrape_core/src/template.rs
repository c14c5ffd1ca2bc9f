use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{ConfigError, Params};

pub const DEFAULT_PLACEHOLDER: &str = "id";

/// Identifiers to loop over and the name of the `{placeholder}` they replace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchConfig {
    #[serde(default, alias = "batch_identifiers")]
    pub identifiers: Vec<String>,
    #[serde(default = "default_placeholder", alias = "batch_variable_name")]
    pub placeholder: String,
}

fn default_placeholder() -> String {
    DEFAULT_PLACEHOLDER.to_string()
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            identifiers: Vec::new(),
            placeholder: default_placeholder(),
        }
    }
}

impl BatchConfig {
    pub fn new<I, S>(identifiers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            identifiers: identifiers.into_iter().map(Into::into).collect(),
            placeholder: default_placeholder(),
        }
    }

    pub fn with_placeholder(mut self, placeholder: impl Into<String>) -> Self {
        self.placeholder = placeholder.into();
        self
    }

    /// The literal token searched for, e.g. `{id}`.
    pub fn token(&self) -> String {
        format!("{{{}}}", self.placeholder)
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        let name = self.placeholder.trim();
        if name.is_empty() || name.contains(['{', '}']) || name != self.placeholder {
            return Err(ConfigError::InvalidPlaceholder(self.placeholder.clone()));
        }
        Ok(())
    }
}

/// One outer iteration: the identifier (if any) and the substituted request
/// parts, all still unencoded.
#[derive(Debug, Clone, PartialEq)]
pub struct Expansion {
    pub identifier: Option<String>,
    pub address: String,
    pub body: Option<Value>,
    pub params: Params,
}

/// Expands a batch into per-identifier request parts, in list order.
///
/// Substitution works on raw strings. Callers must encode the results only
/// afterwards: an encoded `{` no longer matches the token.
pub fn expand(
    address: &str,
    body: Option<&Value>,
    params: &Params,
    batch: &BatchConfig,
) -> Vec<Expansion> {
    if batch.identifiers.is_empty() {
        return vec![Expansion {
            identifier: None,
            address: address.to_string(),
            body: body.cloned(),
            params: params.clone(),
        }];
    }

    let token = batch.token();
    batch
        .identifiers
        .iter()
        .map(|identifier| Expansion {
            identifier: Some(identifier.clone()),
            address: address.replace(&token, identifier),
            body: body.map(|b| substitute_body(b, &batch.placeholder, &token, identifier)),
            params: substitute_params(params, &batch.placeholder, &token, identifier),
        })
        .collect()
}

fn substitute_params(params: &Params, name: &str, token: &str, identifier: &str) -> Params {
    params
        .iter()
        .map(|(key, value)| {
            let value = if key == name {
                Value::String(identifier.to_string())
            } else {
                replace_in_strings(value, token, identifier)
            };
            (key.clone(), value)
        })
        .collect()
}

/// Replaces the token in every string of the body, and sets top-level or
/// GraphQL `variables` keys named like the placeholder.
fn substitute_body(body: &Value, name: &str, token: &str, identifier: &str) -> Value {
    let mut out = replace_in_strings(body, token, identifier);
    if let Value::Object(map) = &mut out {
        if let Some(slot) = map.get_mut(name) {
            *slot = Value::String(identifier.to_string());
        }
        if let Some(Value::Object(vars)) = map.get_mut("variables") {
            if let Some(slot) = vars.get_mut(name) {
                *slot = Value::String(identifier.to_string());
            }
        }
    }
    out
}

fn replace_in_strings(value: &Value, token: &str, identifier: &str) -> Value {
    match value {
        Value::String(s) => Value::String(s.replace(token, identifier)),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| replace_in_strings(v, token, identifier))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), replace_in_strings(v, token, identifier)))
                .collect(),
        ),
        other => other.clone(),
    }
}
