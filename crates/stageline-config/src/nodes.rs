//! Helpers for extracting values from KDL nodes.

use crate::{ConfigError, ConfigResult, duration::parse_duration};
use kdl::{KdlNode, KdlValue};
use std::collections::HashMap;
use std::time::Duration;

pub(crate) fn first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

pub(crate) fn all_string_args(node: &KdlNode) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect()
}

pub(crate) fn positional_args(node: &KdlNode) -> Vec<&KdlValue> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .map(|e| e.value())
        .collect()
}

pub(crate) fn string_prop(node: &KdlNode, name: &str) -> Option<String> {
    node.get(name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

pub(crate) fn bool_prop(node: &KdlNode, name: &str) -> Option<bool> {
    node.get(name).and_then(|v| v.as_bool())
}

/// A duration given either as integer seconds or as a string like `"1h 30m"`.
pub(crate) fn duration_value(value: &KdlValue, field: &str) -> ConfigResult<Duration> {
    if let Some(seconds) = value.as_integer() {
        return u64::try_from(seconds)
            .map(Duration::from_secs)
            .map_err(|_| ConfigError::invalid(field, format!("{} is not a valid duration", seconds)));
    }
    match value.as_string() {
        Some(text) => parse_duration(text),
        None => Err(ConfigError::invalid(field, "expected seconds or a duration string")),
    }
}

pub(crate) fn duration_arg(node: &KdlNode, field: &str) -> ConfigResult<Option<Duration>> {
    match positional_args(node).first() {
        Some(value) => duration_value(value, field).map(Some),
        None => Ok(None),
    }
}

pub(crate) fn duration_prop(node: &KdlNode, name: &str) -> ConfigResult<Option<Duration>> {
    match node.get(name) {
        Some(value) => duration_value(value, name).map(Some),
        None => Ok(None),
    }
}

/// Collect `KEY "value"` children of an `env { ... }` block.
pub(crate) fn env_block(node: &KdlNode) -> HashMap<String, String> {
    let mut env = HashMap::new();
    if let Some(children) = node.children() {
        for child in children.nodes() {
            let key = child.name().value().to_string();
            if let Some(value) = first_scalar_arg(child) {
                env.insert(key, value);
            }
        }
    }
    env
}

/// First positional argument rendered as a string, whatever its KDL type.
fn first_scalar_arg(node: &KdlNode) -> Option<String> {
    let value = positional_args(node).into_iter().next()?;
    if let Some(s) = value.as_string() {
        return Some(s.to_string());
    }
    if let Some(i) = value.as_integer() {
        return Some(i.to_string());
    }
    if let Some(f) = value.as_float() {
        return Some(f.to_string());
    }
    value.as_bool().map(|b| b.to_string())
}
