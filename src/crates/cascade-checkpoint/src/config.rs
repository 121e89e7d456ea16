//! Checkpoint configuration and state-root resolution
//!
//! Settings come from environment variables:
//!
//! | Variable | Meaning | Default |
//! |----------|---------|---------|
//! | `CASCADE_STATE_DIR` | explicit state root | unset |
//! | `XDG_STATE_HOME` | state home; root is `$XDG_STATE_HOME/cascade` | unset |
//! | `CASCADE_LOCK_BASE_DELAY_MS` | first backoff delay | 100 |
//! | `CASCADE_LOCK_DELAY_STEP_MS` | added per failed attempt | 50 |
//! | `CASCADE_LOCK_MAX_DELAY_MS` | backoff cap | 500 |
//! | `CASCADE_RETENTION_KEEP` | versions kept per module by `prune` | 5 |
//!
//! State-root precedence is override, then XDG state home, then the per-user
//! cache directory (`~/.cache/cascade` on Linux), then the system temp
//! directory. Blank values are treated as unset.
//!
//! Everything is read through a lookup function so resolution stays a pure
//! function of its inputs; [`CheckpointSettings::from_env`] plugs in the
//! process environment.

use crate::error::{CheckpointError, Result};
use crate::lock::BackoffPolicy;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

pub const STATE_DIR_ENV: &str = "CASCADE_STATE_DIR";
pub const XDG_STATE_HOME_ENV: &str = "XDG_STATE_HOME";
pub const LOCK_BASE_DELAY_ENV: &str = "CASCADE_LOCK_BASE_DELAY_MS";
pub const LOCK_DELAY_STEP_ENV: &str = "CASCADE_LOCK_DELAY_STEP_MS";
pub const LOCK_MAX_DELAY_ENV: &str = "CASCADE_LOCK_MAX_DELAY_MS";
pub const RETENTION_KEEP_ENV: &str = "CASCADE_RETENTION_KEEP";

/// Directory name appended to the state home, cache and temp fallbacks
pub const APP_DIR: &str = "cascade";

/// Default number of versions `prune` keeps per module
pub const DEFAULT_RETENTION_KEEP: usize = 5;

/// Inputs to state-root resolution
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateRootSources {
    /// Explicit override, used as-is
    pub override_dir: Option<PathBuf>,
    /// XDG-style state home
    pub state_home: Option<PathBuf>,
    /// Per-user cache directory
    pub cache_dir: Option<PathBuf>,
    /// Last resort
    pub temp_dir: PathBuf,
}

impl StateRootSources {
    /// Collect sources through `lookup`, with the platform cache and temp dirs
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        Self {
            override_dir: non_blank(lookup(STATE_DIR_ENV)).map(PathBuf::from),
            state_home: non_blank(lookup(XDG_STATE_HOME_ENV)).map(PathBuf::from),
            cache_dir: dirs::cache_dir(),
            temp_dir: std::env::temp_dir(),
        }
    }

    /// Pick the state root by precedence
    pub fn resolve(&self) -> PathBuf {
        if let Some(dir) = &self.override_dir {
            return dir.clone();
        }
        if let Some(home) = &self.state_home {
            return home.join(APP_DIR);
        }
        if let Some(cache) = &self.cache_dir {
            return cache.join(APP_DIR);
        }
        self.temp_dir.join(APP_DIR)
    }
}

/// Settings for the filesystem store and locker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointSettings {
    pub state_root: PathBuf,
    pub backoff: BackoffPolicy,
    pub retention_keep: usize,
}

impl CheckpointSettings {
    /// Settings rooted at `state_root` with default backoff and retention
    pub fn new(state_root: impl Into<PathBuf>) -> Self {
        Self {
            state_root: state_root.into(),
            backoff: BackoffPolicy::default(),
            retention_keep: DEFAULT_RETENTION_KEEP,
        }
    }

    /// Load settings from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load settings through an arbitrary lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let state_root = StateRootSources::from_lookup(&lookup).resolve();
        let defaults = BackoffPolicy::default();

        let backoff = BackoffPolicy::new(
            parse_millis_or(&lookup, LOCK_BASE_DELAY_ENV, defaults.base)?,
            parse_millis_or(&lookup, LOCK_DELAY_STEP_ENV, defaults.step)?,
            parse_millis_or(&lookup, LOCK_MAX_DELAY_ENV, defaults.max)?,
        );
        let retention_keep = parse_or(&lookup, RETENTION_KEEP_ENV, DEFAULT_RETENTION_KEEP)?;
        if retention_keep == 0 {
            return Err(config_error(RETENTION_KEEP_ENV, "must be at least 1"));
        }

        Ok(Self {
            state_root,
            backoff,
            retention_keep,
        })
    }

    pub fn with_state_root(mut self, state_root: impl Into<PathBuf>) -> Self {
        self.state_root = state_root.into();
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_retention_keep(mut self, keep: usize) -> Self {
        self.retention_keep = keep;
        self
    }

    pub fn state_root(&self) -> &Path {
        &self.state_root
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match non_blank(lookup(key)) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| config_error(key, &format!("cannot parse {:?}: {}", raw, e))),
        None => Ok(default),
    }
}

fn parse_millis_or<F>(lookup: &F, key: &str, default: Duration) -> Result<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
    parse_or(lookup, key, default_ms).map(Duration::from_millis)
}

fn config_error(key: &str, msg: &str) -> CheckpointError {
    CheckpointError::Config(format!("{}: {}", key, msg))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    fn sources(
        override_dir: Option<&str>,
        state_home: Option<&str>,
        cache_dir: Option<&str>,
    ) -> StateRootSources {
        StateRootSources {
            override_dir: override_dir.map(PathBuf::from),
            state_home: state_home.map(PathBuf::from),
            cache_dir: cache_dir.map(PathBuf::from),
            temp_dir: PathBuf::from("/tmp"),
        }
    }

    #[test]
    fn test_override_wins() {
        let s = sources(Some("/srv/state"), Some("/home/u/.local/state"), Some("/home/u/.cache"));
        assert_eq!(s.resolve(), PathBuf::from("/srv/state"));
    }

    #[test]
    fn test_state_home_before_cache() {
        let s = sources(None, Some("/home/u/.local/state"), Some("/home/u/.cache"));
        assert_eq!(s.resolve(), PathBuf::from("/home/u/.local/state/cascade"));
    }

    #[test]
    fn test_cache_then_temp() {
        let s = sources(None, None, Some("/home/u/.cache"));
        assert_eq!(s.resolve(), PathBuf::from("/home/u/.cache/cascade"));

        let s = sources(None, None, None);
        assert_eq!(s.resolve(), PathBuf::from("/tmp/cascade"));
    }

    #[test]
    fn test_blank_values_are_unset() {
        let s = StateRootSources::from_lookup(lookup_from(&[
            (STATE_DIR_ENV, "   "),
            (XDG_STATE_HOME_ENV, "/xdg/state"),
        ]));
        assert_eq!(s.override_dir, None);
        assert_eq!(s.resolve(), PathBuf::from("/xdg/state/cascade"));
    }

    #[test]
    fn test_settings_defaults() {
        let settings = CheckpointSettings::from_lookup(lookup_from(&[(STATE_DIR_ENV, "/s")])).unwrap();
        assert_eq!(settings.state_root, PathBuf::from("/s"));
        assert_eq!(settings.backoff, BackoffPolicy::default());
        assert_eq!(settings.retention_keep, DEFAULT_RETENTION_KEEP);
    }

    #[test]
    fn test_settings_overrides() {
        let settings = CheckpointSettings::from_lookup(lookup_from(&[
            (STATE_DIR_ENV, "/s"),
            (LOCK_BASE_DELAY_ENV, "10"),
            (LOCK_DELAY_STEP_ENV, "5"),
            (LOCK_MAX_DELAY_ENV, "40"),
            (RETENTION_KEEP_ENV, "2"),
        ]))
        .unwrap();
        assert_eq!(settings.backoff.base, Duration::from_millis(10));
        assert_eq!(settings.backoff.step, Duration::from_millis(5));
        assert_eq!(settings.backoff.max, Duration::from_millis(40));
        assert_eq!(settings.retention_keep, 2);
    }

    #[test]
    fn test_settings_reject_garbage() {
        let result = CheckpointSettings::from_lookup(lookup_from(&[(LOCK_BASE_DELAY_ENV, "soon")]));
        assert!(result.is_err());

        let result = CheckpointSettings::from_lookup(lookup_from(&[(RETENTION_KEEP_ENV, "0")]));
        assert!(result.is_err());
    }
}
