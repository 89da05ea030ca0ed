pub mod types;

use anyhow::{Context, Result};
use std::path::Path;

pub use types::{Config, ForwardsConfig, LogConfig, PolicyConfig, StackConfig};

/// Read, expand and validate a YAML config file.
pub fn load_config(path: &str) -> Result<Config> {
    let content = load_config_content(path)?;
    let config: Config = serde_yml::from_str(&content)
        .with_context(|| format!("failed to parse config '{}'", path))?;
    config.validate()?;
    Ok(config)
}

pub fn load_config_content(path: &str) -> Result<String> {
    let raw = std::fs::read_to_string(Path::new(path))
        .with_context(|| format!("failed to read config '{}'", path))?;
    Ok(expand_env_vars(&raw))
}

/// Expand `${VAR}` and `${VAR:-default}`. Undefined variables without a
/// default expand to nothing; a lone `$` is kept.
pub fn expand_env_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            // 未闭合，原样保留
            out.push_str(&rest[start..]);
            return out;
        };
        let expr = &after[..end];
        match expr.split_once(":-") {
            Some((name, default)) => match std::env::var(name) {
                Ok(val) if !val.is_empty() => out.push_str(&val),
                _ => out.push_str(default),
            },
            None => {
                if let Ok(val) = std::env::var(expr) {
                    out.push_str(&val);
                }
            }
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    out
}
