//! Attaches one listener per monitor target to the current provider and
//! routes what they observe into the event pipeline.

use std::{sync::Arc, time::Duration};

use alloy::primitives::{Address, U256};
use futures::StreamExt;
use thiserror::Error;
use tokio::{sync::Mutex as AsyncMutex, task::JoinHandle};
use tracing::{debug, info, warn};

use chainops_domain::model::{MonitorKind, MonitorTarget};

use crate::{
    connection::{ConnectionMode, ProviderHandle, ProviderSource},
    contracts::{available_supply_call, decode_uint},
    pipeline::{ChainEvent, EventPipeline},
    rpc::{with_timeout, CallRequest, ChainClient, LogFilter, RpcError},
    status::StatusUpdate,
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SubscriptionError {
    #[error("{target}: no contract deployed at this address")]
    ContractMissing { target: String },
    #[error("{target}: network unreachable: {reason}")]
    NetworkUnreachable { target: String, reason: String },
    #[error("{target}: the current provider cannot deliver events")]
    NoEventSource { target: String },
    #[error("token distribution monitoring failed to attach: {reason}")]
    CriticalTarget { target: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionSettings {
    pub probe_timeout: Duration,
    pub wallet_poll_interval: Duration,
}

impl Default for SubscriptionSettings {
    fn default() -> Self {
        Self {
            probe_timeout: Duration::from_secs(10),
            wallet_poll_interval: Duration::from_secs(60),
        }
    }
}

/// Outcome of one attach pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttachReport {
    pub generation: u64,
    pub active: Vec<String>,
    pub failed: Vec<(String, SubscriptionError)>,
}

#[derive(Default)]
struct Attached {
    generation: Option<u64>,
    tasks: Vec<JoinHandle<()>>,
}

pub struct SubscriptionManager {
    pipeline: Arc<EventPipeline>,
    source: Arc<dyn ProviderSource>,
    settings: SubscriptionSettings,
    attached: AsyncMutex<Attached>,
}

impl SubscriptionManager {
    pub fn new(
        pipeline: Arc<EventPipeline>,
        source: Arc<dyn ProviderSource>,
        settings: SubscriptionSettings,
    ) -> Self {
        Self {
            pipeline,
            source,
            settings,
            attached: AsyncMutex::new(Attached::default()),
        }
    }

    pub async fn attached_generation(&self) -> Option<u64> {
        self.attached.lock().await.generation
    }

    /// Detaches every listener, then attaches `targets` to `handle`. Failures
    /// are isolated per target; only a token distribution failure is
    /// returned as an error, after the other targets were attached.
    pub async fn attach(
        &self,
        handle: &ProviderHandle,
        targets: &[MonitorTarget],
    ) -> Result<AttachReport, SubscriptionError> {
        let mut attached = self.attached.lock().await;
        Self::detach_locked(&mut attached).await;

        let status = self.pipeline.status();
        let mut report = AttachReport {
            generation: handle.generation,
            ..AttachReport::default()
        };
        let mut critical = None;

        for target in targets {
            let label = target.label();
            match self.attach_target(handle, target).await {
                Ok(task) => {
                    info!(
                        target = %label,
                        generation = handle.generation,
                        mode = %handle.mode,
                        "monitor attached"
                    );
                    attached.tasks.push(task);
                    report.active.push(label);
                }
                Err(err) => {
                    let critical_failure = target.kind == MonitorKind::TokenDistribution
                        && !matches!(err, SubscriptionError::NoEventSource { .. });
                    if critical_failure {
                        critical.get_or_insert(SubscriptionError::CriticalTarget {
                            target: label.clone(),
                            reason: err.to_string(),
                        });
                    } else {
                        warn!(target = %label, error = %err, "monitor attach failed");
                    }
                    status.error(err.to_string());
                    report.failed.push((label, err));
                }
            }
        }

        for kind in [
            MonitorKind::TokenDistribution,
            MonitorKind::Learn2earn,
            MonitorKind::Wallet,
        ] {
            let active = targets
                .iter()
                .filter(|t| t.kind == kind)
                .any(|t| report.active.contains(&t.label()));
            // A distribution pushed through the engine keeps this flag on.
            if kind == MonitorKind::TokenDistribution && !active {
                continue;
            }
            status.apply(StatusUpdate::MonitorActive { kind, active });
        }
        attached.generation = Some(handle.generation);

        match critical {
            Some(err) => Err(err),
            None => Ok(report),
        }
    }

    pub async fn detach(&self) {
        let mut attached = self.attached.lock().await;
        Self::detach_locked(&mut attached).await;
    }

    async fn detach_locked(attached: &mut Attached) {
        if attached.tasks.is_empty() {
            return;
        }
        debug!(
            generation = ?attached.generation,
            listeners = attached.tasks.len(),
            "detaching listeners"
        );
        for task in &attached.tasks {
            task.abort();
        }
        for task in attached.tasks.drain(..) {
            let _ = task.await;
        }
        attached.generation = None;
    }

    async fn attach_target(
        &self,
        handle: &ProviderHandle,
        target: &MonitorTarget,
    ) -> Result<JoinHandle<()>, SubscriptionError> {
        if target.kind == MonitorKind::Wallet {
            return self.attach_wallet(handle, target).await;
        }
        let label = target.label();
        if handle.mode == ConnectionMode::Simulated {
            return Err(SubscriptionError::NoEventSource { target: label });
        }

        self.probe_contract(&handle.client, target).await?;
        let filter = LogFilter {
            address: target.contract_address,
            topics: target.event_signatures.clone(),
        };
        let mut stream = with_timeout(
            self.settings.probe_timeout,
            handle.client.subscribe_logs(&filter),
        )
        .await
        .map_err(|err| unreachable_target(&label, err))?;

        let pipeline = self.pipeline.clone();
        let source = self.source.clone();
        let generation = handle.generation;
        Ok(tokio::spawn(async move {
            while let Some(log) = stream.next().await {
                let Some(event) = ChainEvent::from_log(&log) else {
                    debug!(target = %label, "ignoring undecodable log");
                    continue;
                };
                if let Err(err) = pipeline.process_event(&event).await {
                    warn!(target = %label, error = %err, "failed to record chain event");
                    pipeline.status().error(format!("{label}: {err}"));
                }
            }
            warn!(target = %label, generation, "log stream ended");
            source.report_disconnect(generation, &format!("log stream for {label} ended"));
        }))
    }

    /// A view call on the distributor, falling back to a bytecode check;
    /// learn-to-earn contracts only get the bytecode check.
    async fn probe_contract(
        &self,
        client: &Arc<dyn ChainClient>,
        target: &MonitorTarget,
    ) -> Result<(), SubscriptionError> {
        let label = target.label();
        let timeout = self.settings.probe_timeout;
        if target.kind == MonitorKind::TokenDistribution {
            let request = CallRequest::new(target.contract_address, available_supply_call());
            match with_timeout(timeout, client.call(&request)).await {
                Ok(output) if decode_uint(&output).is_some() => return Ok(()),
                Ok(_) => debug!(target = %label, "view probe returned no data"),
                Err(err) if err.is_answer() => {
                    debug!(target = %label, error = %err, "view probe rejected")
                }
                Err(err) => return Err(unreachable_target(&label, err)),
            }
        }

        match with_timeout(timeout, client.code_at(target.contract_address)).await {
            Ok(code) if code.is_empty() => Err(SubscriptionError::ContractMissing { target: label }),
            Ok(_) => Ok(()),
            Err(err) => Err(unreachable_target(&label, err)),
        }
    }

    async fn attach_wallet(
        &self,
        handle: &ProviderHandle,
        target: &MonitorTarget,
    ) -> Result<JoinHandle<()>, SubscriptionError> {
        let label = target.label();
        let wallet = target.contract_address;
        let client = handle.client.clone();
        let timeout = self.settings.probe_timeout;
        let alerts = handle.mode != ConnectionMode::Simulated;

        let (balance, nonce) = read_wallet(&client, wallet, timeout)
            .await
            .map_err(|err| unreachable_target(&label, err))?;
        self.observe_balance(wallet, balance, alerts).await;

        let pipeline = self.pipeline.clone();
        let interval = self.settings.wallet_poll_interval;
        let mut previous = (balance, nonce);
        Ok(tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let (balance, nonce) = match read_wallet(&client, wallet, timeout).await {
                    Ok(read) => read,
                    Err(err) => {
                        warn!(target = %label, error = %err, "wallet poll failed");
                        continue;
                    }
                };

                let (previous_balance, previous_nonce) = previous;
                if nonce > previous_nonce {
                    let event = ChainEvent::WalletActivity {
                        wallet,
                        previous_nonce,
                        nonce,
                        previous_balance,
                        balance,
                    };
                    if let Err(err) = pipeline.process_event(&event).await {
                        warn!(target = %label, error = %err, "failed to record wallet activity");
                    }
                }
                if alerts {
                    if let Err(err) = pipeline.observe_wallet_balance(wallet, balance).await {
                        warn!(target = %label, error = %err, "failed to record balance alert");
                    }
                } else {
                    pipeline.status().apply(StatusUpdate::WalletBalance(balance));
                }
                previous = (balance, nonce);
            }
        }))
    }

    async fn observe_balance(&self, wallet: Address, balance: U256, alerts: bool) {
        if !alerts {
            self.pipeline
                .status()
                .apply(StatusUpdate::WalletBalance(balance));
            return;
        }
        if let Err(err) = self.pipeline.observe_wallet_balance(wallet, balance).await {
            warn!(error = %err, "failed to record balance alert");
        }
    }
}

async fn read_wallet(
    client: &Arc<dyn ChainClient>,
    wallet: Address,
    timeout: Duration,
) -> Result<(U256, u64), RpcError> {
    let balance = with_timeout(timeout, client.balance(wallet)).await?;
    let nonce = with_timeout(timeout, client.transaction_count(wallet)).await?;
    Ok((balance, nonce))
}

fn unreachable_target(label: &str, err: RpcError) -> SubscriptionError {
    SubscriptionError::NetworkUnreachable {
        target: label.to_string(),
        reason: err.to_string(),
    }
}
