// Helper functions for extracting values from KDL nodes

use crate::{ConfigError, ConfigResult};
use kdl::{KdlNode, KdlValue};
use std::collections::BTreeMap;
use std::time::Duration;

pub(crate) fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

pub(crate) fn get_all_string_args(node: &KdlNode) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect()
}

pub(crate) fn get_prop<'a>(node: &'a KdlNode, name: &str) -> Option<&'a KdlValue> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_some_and(|n| n.value() == name))
        .map(|e| e.value())
        .last()
}

pub(crate) fn get_string_prop(node: &KdlNode, name: &str) -> Option<String> {
    get_prop(node, name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

pub(crate) fn get_bool_prop(node: &KdlNode, name: &str) -> Option<bool> {
    get_prop(node, name).and_then(|v| v.as_bool())
}

pub(crate) fn get_u64_prop(node: &KdlNode, name: &str) -> ConfigResult<Option<u64>> {
    match get_prop(node, name) {
        None => Ok(None),
        Some(value) => value
            .as_integer()
            .and_then(|i| u64::try_from(i).ok())
            .map(Some)
            .ok_or_else(|| {
                ConfigError::invalid(name, format!("expected a non-negative integer, got {}", value))
            }),
    }
}

/// Collect repeated attributes (`paths="a" paths="b"`) and the arguments of
/// child nodes with the same name (`paths "a" "b"`). Both forms may be mixed.
pub(crate) fn get_string_list_prop(node: &KdlNode, name: &str) -> Vec<String> {
    let mut result: Vec<String> = node
        .entries()
        .iter()
        .filter(|e| e.name().is_some_and(|n| n.value() == name))
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect();

    if let Some(children) = node.children() {
        result.extend(
            children
                .nodes()
                .iter()
                .filter(|child| child.name().value() == name)
                .flat_map(get_all_string_args),
        );
    }

    result
}

/// Read `env { KEY "value" }` style children into a map.
pub(crate) fn get_env_block(node: &KdlNode) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    if let Some(children) = node.children() {
        for child in children.nodes() {
            let key = child.name().value().to_string();
            if let Some(val) = get_first_string_arg(child) {
                env.insert(key, val);
            }
        }
    }
    env
}

/// A duration given as integer seconds (`timeout=90`) or a string with a
/// unit suffix (`timeout="90s"`, `"15m"`, `"2h"`).
pub(crate) fn get_duration_prop(node: &KdlNode, name: &str) -> ConfigResult<Option<Duration>> {
    let Some(value) = get_prop(node, name) else {
        return Ok(None);
    };

    if let Some(secs) = value.as_integer() {
        return u64::try_from(secs)
            .map(|s| Some(Duration::from_secs(s)))
            .map_err(|_| ConfigError::invalid(name, "duration must not be negative"));
    }

    let text = value
        .as_string()
        .ok_or_else(|| ConfigError::invalid(name, format!("expected a duration, got {}", value)))?;
    parse_duration(text)
        .map(Some)
        .ok_or_else(|| ConfigError::invalid(name, format!("invalid duration '{}'", text)))
}

/// Parse `90`, `90s`, `15m` or `2h`.
pub fn parse_duration(text: &str) -> Option<Duration> {
    let text = text.trim();
    let split = text.find(|c: char| !c.is_ascii_digit()).unwrap_or(text.len());
    let (digits, unit) = text.split_at(split);
    let amount: u64 = digits.parse().ok()?;
    let secs = match unit {
        "" | "s" => amount,
        "m" => amount.checked_mul(60)?,
        "h" => amount.checked_mul(3600)?,
        _ => return None,
    };
    Some(Duration::from_secs(secs))
}
