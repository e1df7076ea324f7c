//! Single owner of the operational status shown by the diagnostics endpoint.
//! Components push [`StatusUpdate`]s through a [`StatusHandle`]; readers get
//! a copy of the last known state and never wait on chain calls.

use std::{
    collections::VecDeque,
    sync::{Arc, PoisonError, RwLock},
};

use alloy::primitives::U256;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;

use chainops_domain::model::{DistributionTotals, MonitorKind};

use crate::connection::{ConnectionMode, ConnectionSnapshot};

/// Most recent error strings kept for the snapshot.
pub const MAX_RECENT_ERRORS: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub initialized: bool,
    pub connection_mode: ConnectionMode,
    pub wallet_monitoring_active: bool,
    pub token_distribution_active: bool,
    pub learn2earn_monitoring_active: bool,
    /// Last polled service wallet balance in wei, as a decimal string.
    pub wallet_balance: Option<String>,
    pub distribution_count: u64,
    pub distributed_tokens: String,
    pub last_checked: Option<DateTime<Utc>>,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StatusUpdate {
    Initialized(bool),
    MonitorActive { kind: MonitorKind, active: bool },
    WalletBalance(U256),
    Totals(DistributionTotals),
    /// One more confirmed or submitted distribution of `tokens` base units.
    Distributed { tokens: U256 },
    Error(String),
}

#[derive(Debug, Default)]
struct StatusState {
    initialized: bool,
    wallet_active: bool,
    distribution_active: bool,
    learn2earn_active: bool,
    wallet_balance: Option<U256>,
    totals: DistributionTotals,
    last_checked: Option<DateTime<Utc>>,
    errors: VecDeque<String>,
}

impl StatusState {
    fn apply(&mut self, update: StatusUpdate) {
        match update {
            StatusUpdate::Initialized(value) => self.initialized = value,
            StatusUpdate::MonitorActive { kind, active } => match kind {
                MonitorKind::Wallet => self.wallet_active = active,
                MonitorKind::TokenDistribution => self.distribution_active = active,
                MonitorKind::Learn2earn => self.learn2earn_active = active,
            },
            StatusUpdate::WalletBalance(balance) => {
                self.wallet_balance = Some(balance);
                self.last_checked = Some(Utc::now());
            }
            StatusUpdate::Totals(totals) => self.totals = totals,
            StatusUpdate::Distributed { tokens } => {
                self.distribution_active = true;
                self.totals.count += 1;
                self.totals.tokens = self.totals.tokens.saturating_add(tokens);
            }
            StatusUpdate::Error(message) => {
                if self.errors.len() == MAX_RECENT_ERRORS {
                    self.errors.pop_front();
                }
                self.errors
                    .push_back(format!("{}: {message}", Utc::now().to_rfc3339()));
            }
        }
    }
}

struct Shared {
    state: RwLock<StatusState>,
    connection: RwLock<Option<watch::Receiver<ConnectionSnapshot>>>,
}

/// Read side. Cheap to clone.
#[derive(Clone)]
pub struct StatusReporter {
    shared: Arc<Shared>,
}

/// Write side handed to the components that report status.
#[derive(Clone)]
pub struct StatusHandle {
    shared: Arc<Shared>,
}

impl StatusReporter {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: RwLock::new(StatusState::default()),
                connection: RwLock::new(None),
            }),
        }
    }

    /// Wires the connection manager's state feed in. Until then the mode
    /// reads `none`.
    pub fn watch_connection(&self, connection: watch::Receiver<ConnectionSnapshot>) {
        *self
            .shared
            .connection
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(connection);
    }

    pub fn handle(&self) -> StatusHandle {
        StatusHandle {
            shared: self.shared.clone(),
        }
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let (mode, connection_checked) = self
            .shared
            .connection
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|rx| {
                let snapshot = rx.borrow();
                (snapshot.state.mode(), snapshot.last_checked)
            })
            .unwrap_or((ConnectionMode::None, None));

        let state = self
            .shared
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let last_checked = match (state.last_checked, connection_checked) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };

        StatusSnapshot {
            initialized: state.initialized,
            connection_mode: mode,
            wallet_monitoring_active: state.wallet_active,
            token_distribution_active: state.distribution_active,
            learn2earn_monitoring_active: state.learn2earn_active,
            wallet_balance: state.wallet_balance.map(|b| b.to_string()),
            distribution_count: state.totals.count,
            distributed_tokens: state.totals.tokens.to_string(),
            last_checked,
            errors: state.errors.iter().cloned().collect(),
        }
    }
}

impl Default for StatusReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusHandle {
    pub fn apply(&self, update: StatusUpdate) {
        self.shared
            .state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .apply(update);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.apply(StatusUpdate::Error(message.into()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionState;

    #[test]
    fn applies_updates_in_order() {
        let reporter = StatusReporter::new();
        let handle = reporter.handle();
        handle.apply(StatusUpdate::Initialized(true));
        handle.apply(StatusUpdate::MonitorActive {
            kind: MonitorKind::Wallet,
            active: true,
        });
        handle.apply(StatusUpdate::Totals(DistributionTotals {
            count: 2,
            tokens: U256::from(40u64),
        }));
        handle.apply(StatusUpdate::Distributed {
            tokens: U256::from(20u64),
        });

        let snapshot = reporter.snapshot();
        assert!(snapshot.initialized);
        assert!(snapshot.wallet_monitoring_active);
        assert!(snapshot.token_distribution_active);
        assert!(!snapshot.learn2earn_monitoring_active);
        assert_eq!(snapshot.distribution_count, 3);
        assert_eq!(snapshot.distributed_tokens, "60");
        assert_eq!(snapshot.connection_mode, ConnectionMode::None);
    }

    #[test]
    fn keeps_only_recent_errors() {
        let reporter = StatusReporter::new();
        let handle = reporter.handle();
        for i in 0..MAX_RECENT_ERRORS + 5 {
            handle.error(format!("failure {i}"));
        }
        let errors = reporter.snapshot().errors;
        assert_eq!(errors.len(), MAX_RECENT_ERRORS);
        assert!(errors[0].ends_with("failure 5"));
    }

    #[test]
    fn reads_mode_from_connection_feed() {
        let reporter = StatusReporter::new();
        let checked = Utc::now();
        let (_tx, rx) = watch::channel(ConnectionSnapshot {
            state: ConnectionState::ConnectedHttp,
            generation: 4,
            endpoint: Some("https://rpc".into()),
            last_checked: Some(checked),
            provider: None,
        });
        reporter.watch_connection(rx);

        let snapshot = reporter.snapshot();
        assert_eq!(snapshot.connection_mode, ConnectionMode::Http);
        assert_eq!(snapshot.last_checked, Some(checked));

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["connectionMode"], "http");
        assert_eq!(json["tokenDistributionActive"], false);
    }
}
