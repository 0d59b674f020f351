// ABOUTME: Secret and environment values that may be read from the process environment.
// ABOUTME: Handles literal values and `{ env, default }` references resolved at use time.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum EnvValue {
    Literal(String),
    FromEnv {
        #[serde(rename = "env")]
        var: String,
        #[serde(default)]
        default: Option<String>,
    },
}

impl EnvValue {
    pub fn resolve(&self) -> Result<String> {
        match self {
            EnvValue::Literal(s) => Ok(s.clone()),
            EnvValue::FromEnv { var, default } => match std::env::var(var) {
                Ok(val) => Ok(val),
                Err(_) => default
                    .clone()
                    .ok_or_else(|| Error::MissingEnvVar(var.clone())),
            },
        }
    }
}

/// Resolve every value, sorted by name so the remote sees a stable order.
pub fn resolve_env_map(map: &HashMap<String, EnvValue>) -> Result<Vec<(String, String)>> {
    let mut resolved = map
        .iter()
        .map(|(k, v)| v.resolve().map(|value| (k.clone(), value)))
        .collect::<Result<Vec<_>>>()?;
    resolved.sort();
    Ok(resolved)
}
