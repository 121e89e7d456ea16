//! Injectable structured logger
//!
//! The manager reports through a [`Logger`] so embedding applications can
//! route checkpoint events wherever they like. [`NoopLogger`] is the default;
//! [`TracingLogger`] forwards to `tracing`.

use std::fmt::Write as _;

/// Key-value pairs attached to a log call
pub type Fields<'a> = &'a [(&'a str, &'a dyn std::fmt::Display)];

/// Structured logger with three levels
pub trait Logger: Send + Sync {
    fn debug(&self, msg: &str, fields: Fields<'_>);
    fn info(&self, msg: &str, fields: Fields<'_>);
    fn error(&self, msg: &str, fields: Fields<'_>);
}

/// Discards everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopLogger;

impl Logger for NoopLogger {
    fn debug(&self, _msg: &str, _fields: Fields<'_>) {}
    fn info(&self, _msg: &str, _fields: Fields<'_>) {}
    fn error(&self, _msg: &str, _fields: Fields<'_>) {}
}

/// Forwards to the `tracing` macros under the `cascade_checkpoint` target
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn debug(&self, msg: &str, fields: Fields<'_>) {
        tracing::debug!(target: "cascade_checkpoint", fields = %format_fields(fields), "{}", msg);
    }

    fn info(&self, msg: &str, fields: Fields<'_>) {
        tracing::info!(target: "cascade_checkpoint", fields = %format_fields(fields), "{}", msg);
    }

    fn error(&self, msg: &str, fields: Fields<'_>) {
        tracing::error!(target: "cascade_checkpoint", fields = %format_fields(fields), "{}", msg);
    }
}

/// Render fields as `key=value key=value`
pub fn format_fields(fields: Fields<'_>) -> String {
    let mut out = String::new();
    for (i, (key, value)) in fields.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let _ = write!(out, "{}={}", key, value);
    }
    out
}
