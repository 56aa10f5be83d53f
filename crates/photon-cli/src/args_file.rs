//! Whitespace separated argument files, used for `--config` and the `cfg_args` written
//! next to every model.

use std::path::Path;

use anyhow::Context;
use clap::Parser;
use serde_json::{Map, Value};

use crate::RunConfig;

pub fn split_args_str(content: &str) -> Vec<String> {
    content.split_whitespace().map(|s| s.to_owned()).collect()
}

/// Parses an argument file into a full config, defaults filling the gaps.
pub fn load_args_file(path: &Path) -> anyhow::Result<RunConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let mut all_args = vec!["photon".to_owned()];
    all_args.extend(split_args_str(&content));
    RunConfig::try_parse_from(&all_args)
        .with_context(|| format!("Invalid arguments in {}", path.display()))
}

fn config_map(config: &RunConfig) -> Map<String, Value> {
    match serde_json::to_value(config) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    }
}

fn format_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .map(format_value)
            .collect::<Vec<_>>()
            .join(","),
        other => other.to_string(),
    }
}

/// Converts a config back to argument form. Only values that differ from the defaults
/// are included, one argument per entry.
pub fn config_to_args(config: &RunConfig) -> Vec<String> {
    let defaults = config_map(&RunConfig::default());

    let mut args = Vec::new();
    for (key, value) in config_map(config) {
        if defaults.get(&key) == Some(&value) || value.is_null() {
            continue;
        }
        let arg_name = format!("--{key}");
        match value {
            Value::Bool(true) => args.push(arg_name),
            // Only flags defaulting to on take a value.
            Value::Bool(false) => args.push(format!("{arg_name} false")),
            value => args.push(format!("{arg_name} {}", format_value(&value))),
        }
    }
    args
}

/// Merges a config loaded from a file with the command line. Everything the command line
/// changed from the defaults wins.
pub fn merge_configs(file_config: &RunConfig, cli_config: &RunConfig) -> anyhow::Result<RunConfig> {
    let defaults = config_map(&RunConfig::default());
    let mut merged = config_map(file_config);
    for (key, value) in config_map(cli_config) {
        if defaults.get(&key) != Some(&value) {
            merged.insert(key, value);
        }
    }
    serde_json::from_value(Value::Object(merged)).context("Failed to merge configs")
}
