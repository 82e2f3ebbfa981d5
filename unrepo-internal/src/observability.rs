use axum::Router;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tower_http::trace::{DefaultMakeSpan, DefaultOnFailure, DefaultOnResponse, TraceLayer};
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, reload, EnvFilter, Registry};

use crate::error::{Error, ErrorDetails};
use crate::quota::QUOTA_DECISIONS_METRIC;

const DEFAULT_LOG_FILTER: &str = "warn,gateway=info,unrepo_internal=info";
const DEBUG_LOG_FILTER: &str = "warn,gateway=debug,unrepo_internal=debug";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Lets the config file turn on debug logs after the subscriber is installed.
pub struct DelayedDebugLogs {
    handle: reload::Handle<EnvFilter, Registry>,
    env_filter_set: bool,
}

impl DelayedDebugLogs {
    pub fn enable_debug(&self) -> Result<(), Error> {
        if self.env_filter_set {
            tracing::info!("`RUST_LOG` is set; ignoring `gateway.debug` for log filtering");
            return Ok(());
        }
        self.handle
            .modify(|filter| *filter = EnvFilter::new(DEBUG_LOG_FILTER))
            .map_err(|e| {
                Error::new(ErrorDetails::Config {
                    message: format!("Failed to enable debug logs: {e}"),
                })
            })
    }
}

/// Installs the global subscriber. `RUST_LOG` overrides the default filter.
pub fn setup_observability(log_format: LogFormat) -> Result<DelayedDebugLogs, Error> {
    let env_filter = EnvFilter::try_from_default_env().ok();
    let env_filter_set = env_filter.is_some();
    let (filter, handle) =
        reload::Layer::new(env_filter.unwrap_or_else(|| EnvFilter::new(DEFAULT_LOG_FILTER)));

    let registry = tracing_subscriber::registry().with(filter);
    let result = match log_format {
        LogFormat::Pretty => registry.with(fmt::layer().with_target(true)).try_init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_current_span(true))
            .try_init(),
    };
    result.map_err(|e| {
        Error::new_without_logging(ErrorDetails::Config {
            message: format!("Failed to install tracing subscriber: {e}"),
        })
    })?;

    Ok(DelayedDebugLogs {
        handle,
        env_filter_set,
    })
}

/// Installs the global Prometheus recorder. The handle renders `/metrics`.
pub fn setup_metrics() -> Result<PrometheusHandle, Error> {
    let handle = PrometheusBuilder::new().install_recorder().map_err(|e| {
        Error::new_without_logging(ErrorDetails::Config {
            message: format!("Failed to install Prometheus exporter: {e}"),
        })
    })?;
    metrics::describe_counter!(
        QUOTA_DECISIONS_METRIC,
        "Quota decisions on gated routes, by outcome"
    );
    Ok(handle)
}

pub trait RouterExt<S> {
    fn apply_http_trace_layer(self) -> Self;
}

impl<S> RouterExt<S> for Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    fn apply_http_trace_layer(self) -> Self {
        self.layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::DEBUG))
                .on_failure(DefaultOnFailure::new().level(Level::WARN)),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::ValueEnum;

    #[test]
    fn test_log_format_values() {
        assert_eq!(LogFormat::default(), LogFormat::Pretty);
        assert_eq!(
            LogFormat::from_str("json", true).unwrap(),
            LogFormat::Json
        );
        assert!(LogFormat::from_str("xml", true).is_err());
    }
}
