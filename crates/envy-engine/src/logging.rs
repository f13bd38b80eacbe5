//! Tracing setup for engine hosts
//!
//! Library code only emits `tracing` events; hosts that want them on a
//! terminal call [`init_tracing`] once at startup.

use std::io::IsTerminal;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

fn use_color() -> bool {
    std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none()
}

/// Initialize a compact tracing subscriber.
///
/// `RUST_LOG` wins when set; otherwise `verbose` selects between debug and
/// info level for envy crates. Returns an error if a subscriber is already
/// installed.
pub fn init_tracing(verbose: bool) -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| {
            if verbose {
                EnvFilter::try_new("envy=debug,info")
            } else {
                EnvFilter::try_new("envy=info,warn")
            }
        })
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(verbose)
                .with_ansi(use_color())
                .compact(),
        )
        .try_init()?;

    Ok(())
}
