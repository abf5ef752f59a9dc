//! Config hot-reload watcher.
//!
//! Watches `cadence.toml` for modifications and invokes a callback with the
//! freshly parsed [`ReloadableConfig`] after a debounce window.

use cadence_core::{CadenceError, CadenceResult};
use cadence_orchestrator::GatePolicy;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::mpsc as std_mpsc;

/// The part of the configuration a running loop picks up without a restart.
///
/// Only the gate policy is reloadable; storage and scheduler settings need a
/// restart. A file without a `[gate]` section leaves the policy untouched.
#[derive(Debug, Clone, Deserialize)]
pub struct ReloadableConfig {
    #[serde(default)]
    pub gate: Option<GatePolicy>,
}

/// Watches a config file on disk and calls back on every (debounced) change.
///
/// Dropping it stops the watch.
pub struct ConfigWatcher {
    _watcher: RecommendedWatcher,
}

impl ConfigWatcher {
    /// Start watching `config_path`.
    ///
    /// `on_reload` runs on a background thread each time the file changes and
    /// parses. Parse errors are logged and skipped.
    pub fn start<F>(config_path: PathBuf, debounce_ms: u64, on_reload: F) -> CadenceResult<Self>
    where
        F: Fn(ReloadableConfig) + Send + Sync + 'static,
    {
        let (tx, rx) = std_mpsc::channel();

        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            if let Ok(event) = res {
                if matches!(event.kind, EventKind::Modify(_)) {
                    let _ = tx.send(());
                }
            }
        })
        .map_err(|e| CadenceError::Config(format!("Failed to create file watcher: {e}")))?;

        watcher
            .watch(config_path.as_ref(), RecursiveMode::NonRecursive)
            .map_err(|e| CadenceError::Config(format!("Failed to watch config file: {e}")))?;

        let path = config_path.clone();
        std::thread::spawn(move || {
            let mut last_reload = std::time::Instant::now();
            let debounce = std::time::Duration::from_millis(debounce_ms);

            while rx.recv().is_ok() {
                // Collapse a burst of writes into one reload.
                while rx.try_recv().is_ok() {}

                let since = last_reload.elapsed();
                if since < debounce {
                    std::thread::sleep(debounce - since);
                }
                last_reload = std::time::Instant::now();

                match parse_config(&path) {
                    Ok(config) => on_reload(config),
                    Err(e) => tracing::warn!(error = %e, "Failed to reload config"),
                }
            }

            tracing::debug!("Config watcher thread exiting");
        });

        tracing::info!(path = %config_path.display(), "Config hot-reload watcher started");

        Ok(Self { _watcher: watcher })
    }
}

/// Read and parse the reloadable part of a config file.
pub fn parse_config(path: &Path) -> CadenceResult<ReloadableConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        CadenceError::Config(format!("Failed to read config '{}': {}", path.display(), e))
    })?;
    toml::from_str(&content).map_err(|e| {
        CadenceError::Config(format!("Failed to parse config '{}': {}", path.display(), e))
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_gate_section() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            tmp.as_file_mut(),
            r#"
data_dir = "./state"

[gate]
escalate_at_failures = 4
require_artifacts = true
"#
        )
        .unwrap();

        let config = parse_config(tmp.path()).unwrap();
        let gate = config.gate.unwrap();
        assert_eq!(gate.escalate_at_failures, 4);
        assert!(gate.require_artifacts);
        // Unset fields keep their defaults.
        assert_eq!(gate.max_consecutive_rejections, 3);
        assert_eq!(gate.allowed_sizes, vec![1, 2, 3, 5, 8, 13]);
    }

    #[test]
    fn test_parse_without_gate_section() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        writeln!(tmp.as_file_mut(), "data_dir = \"./state\"").unwrap();
        let config = parse_config(tmp.path()).unwrap();
        assert!(config.gate.is_none());
    }

    #[test]
    fn test_parse_invalid_toml_returns_error() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        writeln!(tmp.as_file_mut(), "{{{{invalid toml!!!!").unwrap();
        let err = parse_config(tmp.path()).unwrap_err();
        assert!(
            err.to_string().contains("Failed to parse config"),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn test_parse_nonexistent_file_returns_error() {
        let err = parse_config(Path::new("/nonexistent/path/cadence.toml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config"));
    }
}
