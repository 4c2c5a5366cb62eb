// iSECTECH Security Integrations - Logging
// Structured logging initialization
// Copyright (c) 2024 iSECTECH. All rights reserved.

use tracing_subscriber::filter::{Directive, LevelFilter};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;
use crate::error::{IntegrationError, Result};

/// Install the global tracing subscriber.
///
/// `RUST_LOG` overrides the configured level. Fails if a subscriber is
/// already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let level: tracing::Level = config.level.parse().map_err(|_| {
        IntegrationError::Configuration(format!("Invalid log level: {}", config.level))
    })?;

    let mut env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(level).into())
        .from_env_lossy();
    for target in ["h2", "hyper", "tokio_util"] {
        let directive = format!("{}=warn", target)
            .parse::<Directive>()
            .map_err(|e| IntegrationError::Configuration(format!("Invalid log directive: {}", e)))?;
        env_filter = env_filter.add_directive(directive);
    }

    let registry = tracing_subscriber::registry().with(env_filter);

    let result = if config.format == "json" {
        registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(config.with_thread_ids)
                    .with_file(true)
                    .with_line_number(true)
                    .json(),
            )
            .try_init()
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(config.with_thread_ids),
            )
            .try_init()
    };

    result.map_err(|e| IntegrationError::Configuration(format!("Logging already initialized: {}", e)))
}
