//! Tracing initialization.
//!
//! Centralizes tracing config so the binary and the simulation behave the same.

use crate::ColorWhen;
use anyhow::Result;
use tracing_subscriber::{fmt, EnvFilter};

/// Default filter when `RUST_LOG` is unset.
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Initialize tracing subscriber.
///
/// - Respects `RUST_LOG` via `EnvFilter`, falling back to `default_filter`.
/// - ANSI color controlled by `ColorWhen`.
/// - Safe to call more than once; later calls are no-ops.
pub fn init_tracing(color: ColorWhen, default_filter: &str) -> Result<()> {
    // ---
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    // try_init fails only when a global subscriber is already installed
    let _ = fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_ansi(color.should_color_stderr())
        .with_writer(std::io::stderr)
        .try_init();

    Ok(())
}
