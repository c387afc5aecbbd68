// SPDX-License-Identifier: PolyForm-Shield-1.0

//! Shared logging setup for the relay binaries.

pub mod logging {
    use tracing_subscriber::EnvFilter;

    /// Install a `tracing` subscriber that writes human-readable lines to
    /// stdout, honouring `RUST_LOG` and defaulting to `info` otherwise.
    pub fn init_tracing() {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    }
}
