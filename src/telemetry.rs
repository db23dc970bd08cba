//! Console logging setup.
//!
//! Job log lines are mirrored to `tracing`; this installs the subscriber
//! that prints them. `RUST_LOG` wins over the directive passed in.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{EnvFilter, fmt};

/// Directive used when neither `RUST_LOG` nor the caller specify one.
pub const DEFAULT_DIRECTIVE: &str = "scanjob=info";

/// Install a global `fmt` subscriber filtered by `RUST_LOG` or `default_directive`.
///
/// Fails if a global subscriber is already set.
pub fn init(default_directive: &str) -> Result<(), TryInitError> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .try_init()
}
