//! Diagnostic logging and feature flags handed to collections.

use crate::config::{LogMode, PgConfig};
use serde_json::Value;

/// Feature flags that change how statements are built.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Flags {
    /// Encode array cells as JSON text instead of native arrays.
    pub array_as_json: bool,
    /// Map `id` fields to `bigint`/`bigserial`.
    pub ids_as_big_int: bool,
}

impl From<&PgConfig> for Flags {
    fn from(c: &PgConfig) -> Self {
        Self {
            array_as_json: c.array_as_json,
            ids_as_big_int: c.ids_as_big_int,
        }
    }
}

/// Sink for failed-statement diagnostics.
pub trait Diagnostics: Send + Sync {
    /// Report a statement that failed with an unclassified error.
    fn statement_failed(
        &self,
        message: &str,
        sql: &str,
        params: &[Value],
        error: &(dyn std::error::Error + 'static),
    );
}

/// [`Diagnostics`] backed by `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingDiagnostics {
    pub mode: LogMode,
    pub log_params: bool,
}

impl From<&PgConfig> for TracingDiagnostics {
    fn from(c: &PgConfig) -> Self {
        Self { mode: c.logs, log_params: c.log_params }
    }
}

impl Diagnostics for TracingDiagnostics {
    fn statement_failed(
        &self,
        message: &str,
        sql: &str,
        params: &[Value],
        error: &(dyn std::error::Error + 'static),
    ) {
        if self.mode != LogMode::Errors {
            return;
        }
        if self.log_params {
            tracing::error!(query = sql, params = ?params, error = %error, "{}", message);
        } else {
            tracing::error!(query = sql, error = %error, "{}", message);
        }
    }
}
