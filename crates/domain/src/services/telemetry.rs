//! Process-wide tracing subscriber and Prometheus recorder. Both binaries
//! install them once at boot; every metric family the runtime emits is
//! described here so the exposition carries `# HELP` lines.

use std::{env, net::SocketAddr, sync::Arc};

use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::hydrate_env_file;

static SUBSCRIBER_INSTALLED: OnceCell<()> = OnceCell::new();
static METRICS_HANDLE: OnceCell<Arc<PrometheusHandle>> = OnceCell::new();

const DEFAULT_LOG_FILTER: &str = "info";

/// Distribution latency buckets in seconds; confirmation waits dominate.
const LATENCY_BUCKETS: &[f64] = &[0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Family {
    Counter,
    Gauge,
    Histogram,
}

struct MetricFamily {
    name: &'static str,
    family: Family,
    help: &'static str,
}

const METRIC_FAMILIES: &[MetricFamily] = &[
    MetricFamily {
        name: "rpc_connect_attempts_total",
        family: Family::Counter,
        help: "Endpoint connection attempts by transport and result.",
    },
    MetricFamily {
        name: "rpc_connection_mode",
        family: Family::Gauge,
        help: "Active provider: 0 none, 1 websocket, 2 http aggregate, 3 simulated.",
    },
    MetricFamily {
        name: "rpc_reconnects_total",
        family: Family::Counter,
        help: "Disconnects that scheduled a reconnect.",
    },
    MetricFamily {
        name: "rpc_aggregate_member_failures_total",
        family: Family::Counter,
        help: "Calls that failed on one member of the http aggregate.",
    },
    MetricFamily {
        name: "monitor_events_total",
        family: Family::Counter,
        help: "Contract and wallet events processed, by kind.",
    },
    MetricFamily {
        name: "monitor_alerts_total",
        family: Family::Counter,
        help: "Alerts raised, by kind.",
    },
    MetricFamily {
        name: "monitor_reattach_total",
        family: Family::Counter,
        help: "Listener re-attachments after a provider change.",
    },
    MetricFamily {
        name: "distribution_requests_total",
        family: Family::Counter,
        help: "Token distribution requests, by result.",
    },
    MetricFamily {
        name: "distribution_submissions_total",
        family: Family::Counter,
        help: "Signed distribution transactions handed to the node.",
    },
    MetricFamily {
        name: "distribution_latency_seconds",
        family: Family::Histogram,
        help: "Time from distribution request to result.",
    },
];

/// Registers a description for every metric family with the current recorder.
pub fn describe_metrics() {
    for metric in METRIC_FAMILIES {
        match metric.family {
            Family::Counter => describe_counter!(metric.name, metric.help),
            Family::Gauge => describe_gauge!(metric.name, metric.help),
            Family::Histogram => describe_histogram!(metric.name, Unit::Seconds, metric.help),
        }
    }
}

/// Observability knobs read from `<PREFIX>_LOG_FILTER` and
/// `<PREFIX>_METRICS_ADDRESS`.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    service: String,
    log_filter: String,
    metrics_address: Option<String>,
}

impl TelemetryConfig {
    pub fn from_env(prefix: &str) -> Self {
        let _ = hydrate_env_file();
        let prefix = prefix.trim();
        let upper = prefix.to_ascii_uppercase();
        let non_blank = |key: String| {
            env::var(key)
                .ok()
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        Self {
            service: prefix.to_ascii_lowercase(),
            log_filter: non_blank(format!("{upper}_LOG_FILTER"))
                .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string()),
            metrics_address: non_blank(format!("{upper}_METRICS_ADDRESS")),
        }
    }

    /// Lower-cased prefix, exported as the `service` label.
    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn log_filter(&self) -> &str {
        &self.log_filter
    }

    pub fn metrics_address(&self) -> Option<&str> {
        self.metrics_address.as_deref()
    }

    fn metrics_socket(&self) -> Result<Option<SocketAddr>, TelemetryError> {
        self.metrics_address
            .as_deref()
            .map(|addr| {
                addr.parse().map_err(|err: std::net::AddrParseError| {
                    TelemetryError::InvalidMetricsAddress(addr.to_string(), err.to_string())
                })
            })
            .transpose()
    }

    fn prometheus_builder(&self) -> Result<PrometheusBuilder, TelemetryError> {
        let mut builder = PrometheusBuilder::new()
            .add_global_label("service", self.service.clone())
            .set_buckets_for_metric(
                Matcher::Full("distribution_latency_seconds".to_string()),
                LATENCY_BUCKETS,
            )
            .map_err(|err| TelemetryError::Metrics(err.to_string()))?;
        if let Some(socket) = self.metrics_socket()? {
            builder = builder.with_http_listener(socket);
        }
        Ok(builder)
    }
}

/// Handle kept by the binaries to serve `/metrics`.
#[derive(Clone)]
pub struct TelemetryGuard {
    metrics: Arc<PrometheusHandle>,
}

impl TelemetryGuard {
    pub fn render_metrics(&self) -> String {
        self.metrics.render()
    }
}

/// Installs tracing and the metrics recorder. Later calls reuse the first
/// installation.
pub fn init_telemetry(config: &TelemetryConfig) -> Result<TelemetryGuard, TelemetryError> {
    install_tracing(config)?;
    let metrics = METRICS_HANDLE
        .get_or_try_init(|| {
            let handle = config
                .prometheus_builder()?
                .install_recorder()
                .map_err(|err| TelemetryError::Metrics(err.to_string()))?;
            describe_metrics();
            Ok::<_, TelemetryError>(Arc::new(handle))
        })?
        .clone();
    Ok(TelemetryGuard { metrics })
}

fn install_tracing(config: &TelemetryConfig) -> Result<(), TelemetryError> {
    if SUBSCRIBER_INSTALLED.get().is_some() {
        return Ok(());
    }
    let filter = EnvFilter::try_new(config.log_filter())
        .map_err(|err| TelemetryError::InvalidLogFilter(err.to_string()))?;
    if SUBSCRIBER_INSTALLED.set(()).is_ok() {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init()
            .map_err(|err| TelemetryError::Tracing(err.to_string()))?;
    }
    Ok(())
}

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("invalid log filter: {0}")]
    InvalidLogFilter(String),
    #[error("failed to install tracing subscriber: {0}")]
    Tracing(String),
    #[error("invalid metrics address `{0}`: {1}")]
    InvalidMetricsAddress(String, String),
    #[error("failed to install metrics recorder: {0}")]
    Metrics(String),
}
