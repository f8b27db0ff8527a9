//! Logging setup for one run.
//!
//! The CLI verbosity vocabulary (`debug`/`info`/`warning`/`error`) maps
//! onto tracing filter directives; `RUST_LOG` overrides the CLI choice
//! when set. Output is kept bare (no timestamps, no module targets) so
//! cron mail and journald entries stay readable.

use tracing_subscriber::EnvFilter;

use crate::cli::Verbosity;

fn directive(verbosity: Verbosity) -> &'static str {
    match verbosity {
        Verbosity::Debug => "debug",
        Verbosity::Info => "info",
        Verbosity::Warning => "warn",
        Verbosity::Error => "error",
    }
}

/// Initialize the subscriber for the selected verbosity.
pub fn init(verbosity: Verbosity) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(from_env) => from_env,
        Err(_) => EnvFilter::new(directive(verbosity)),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .without_time()
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("installing tracing subscriber: {}", e))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directive_maps_cli_vocabulary() {
        assert_eq!(directive(Verbosity::Warning), "warn");
        assert_eq!(directive(Verbosity::Debug), "debug");
        assert_eq!(directive(Verbosity::Info), "info");
        assert_eq!(directive(Verbosity::Error), "error");
    }
}
