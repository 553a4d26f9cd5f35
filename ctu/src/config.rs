#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};

use ctu_backend_c::EmitOptions;
use miette::Diagnostic;
use serde::Deserialize;
use thiserror::Error;

pub const CONFIG_FILE: &str = "ctu.toml";

#[derive(Debug, Error, Diagnostic)]
#[error("config error: {message}")]
#[diagnostic(code(ctu::config))]
pub struct ConfigError {
    pub message: String,
}

/// Options for one compilation, as read from `ctu.toml`.
///
/// ```toml
/// [emit]
/// line_directives = true
/// banner = false
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CompileOptions {
    pub emit: EmitOptions,
}

/// Nearest `ctu.toml` at or above `start`.
pub fn find_config(start: &Path) -> Option<PathBuf> {
    let mut cur = if start.is_file() {
        start.parent()?.to_path_buf()
    } else {
        start.to_path_buf()
    };

    loop {
        let candidate = cur.join(CONFIG_FILE);
        if candidate.is_file() {
            return Some(candidate);
        }
        match cur.parent() {
            Some(p) => cur = p.to_path_buf(),
            None => return None,
        }
    }
}

pub fn parse_config(raw: &str) -> Result<CompileOptions, ConfigError> {
    toml::from_str(raw).map_err(|e| ConfigError {
        message: e.to_string(),
    })
}

pub fn load_config(path: &Path) -> Result<CompileOptions, ConfigError> {
    let raw = fs::read_to_string(path).map_err(|e| ConfigError {
        message: format!("failed to read {}: {e}", path.display()),
    })?;
    toml::from_str(&raw).map_err(|e| ConfigError {
        message: format!("failed to parse {}: {e}", path.display()),
    })
}

/// Loads the config governing `start`, or defaults when there is none.
pub fn resolve_config(start: &Path) -> Result<(CompileOptions, Option<PathBuf>), ConfigError> {
    match find_config(start) {
        Some(path) => Ok((load_config(&path)?, Some(path))),
        None => Ok((CompileOptions::default(), None)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_is_all_defaults() {
        assert_eq!(parse_config("").unwrap(), CompileOptions::default());
        assert_eq!(parse_config("[emit]\n").unwrap(), CompileOptions::default());
    }

    #[test]
    fn emit_flags_are_read() {
        let opts = parse_config("[emit]\nline_directives = true\n").unwrap();
        assert!(opts.emit.line_directives);
        assert!(!opts.emit.banner);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = parse_config("[emit]\nlines = true\n").unwrap_err();
        assert!(err.message.contains("lines"), "{}", err.message);
        assert!(parse_config("[target]\n").is_err());
    }

    #[test]
    fn lookup_walks_up_from_the_input() {
        let root = std::env::temp_dir().join(format!("ctu-config-{}", std::process::id()));
        let nested = root.join("src").join("deep");
        fs::create_dir_all(&nested).unwrap();
        fs::write(root.join(CONFIG_FILE), "[emit]\nbanner = true\n").unwrap();
        let input = nested.join("main.ctu");
        fs::write(&input, "").unwrap();

        assert_eq!(find_config(&input), Some(root.join(CONFIG_FILE)));
        let (opts, path) = resolve_config(&input).unwrap();
        assert!(opts.emit.banner);
        assert_eq!(path, Some(root.join(CONFIG_FILE)));

        fs::remove_dir_all(&root).unwrap();
    }
}
