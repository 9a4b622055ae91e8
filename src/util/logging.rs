//! Tracing setup for patchwork
//!
//! Engine messages and forwarded native codec messages (target
//! `patchwork_rs::native`) share one filter.

use std::sync::Once;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Environment variable switching the default filter to debug output
pub const DEBUG_ENV: &str = "PATCHWORK_DEBUG";

static INIT: Once = Once::new();

/// Install the tracing subscriber
///
/// `RUST_LOG` wins if it parses. Otherwise the crate logs at `info`, or at
/// `debug` when [`DEBUG_ENV`] is set. A subscriber already installed by the
/// host is left in place.
pub fn init_logging() {
	INIT.call_once(|| {
		let filter = EnvFilter::try_from_default_env()
			.unwrap_or_else(|_| EnvFilter::new(default_directives(std::env::var_os(DEBUG_ENV).is_some())));

		let installed = tracing_subscriber::registry()
			.with(fmt::layer().with_target(true))
			.with(filter)
			.try_init();
		if installed.is_err() {
			tracing::debug!("Keeping the host's tracing subscriber");
		}
	});
}

const fn default_directives(debug: bool) -> &'static str {
	if debug { "patchwork_rs=debug" } else { "patchwork_rs=info" }
}
