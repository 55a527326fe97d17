//! Shared tracing setup for the roost crates.

use core::fmt;
use std::error::Error;

use anyhow::{Context as _, Result};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Installs the global subscriber: stdout, filtered by `RUST_LOG`,
/// defaulting to `info`.
pub fn setup() -> Result<()> {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env()
        .context("failed to parse RUST_LOG directives")?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to set global subscriber: {e}"))?;

    Ok(())
}

/// Returns a [`fmt::Display`] adapter that prints the error and all its sources.
pub fn err_with_src<'a>(e: &'a (dyn Error + 'static)) -> ErrorWithSources<'a> {
    ErrorWithSources { e }
}

pub struct ErrorWithSources<'a> {
    e: &'a (dyn Error + 'static),
}

impl fmt::Display for ErrorWithSources<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.e)?;

        for cause in anyhow::Chain::new(self.e).skip(1) {
            write!(f, ": {cause}")?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prints_errors_with_sources() {
        let error = Outer(Inner);

        assert_eq!(
            err_with_src(&error).to_string(),
            "failed to resolve: timed out"
        );
    }

    #[derive(thiserror::Error, Debug)]
    #[error("timed out")]
    struct Inner;

    #[derive(thiserror::Error, Debug)]
    #[error("failed to resolve")]
    struct Outer(#[source] Inner);
}
