//! Remediation action execution.
//!
//! Each action type maps to exactly one collaborator call. Actions that change
//! live state then wait for the change to settle with a bounded status poll;
//! running out of attempts is a failure, never a silent success.

use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

use crate::clock::Clock;
use crate::error::GuardError;
use crate::history::RemediationResult;
use crate::metrics::MetricSnapshot;
use crate::poll::{poll_until, with_timeout, PollPolicy};
use crate::services::{
    Alert, DataPlaneService, DeploymentStatus, FailoverParams, FlushMode, FlushParams,
    NotificationService, NotifyParams, OptimizeParams, OrchestrationService, PodInfo,
    RestartMode, RestartParams, ScaleParams, Target,
};

/// Kind of remediation action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionType {
    Restart,
    Scale,
    Failover,
    Flush,
    Optimize,
    Notify,
}

impl ActionType {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Restart => "restart",
            Self::Scale => "scale",
            Self::Failover => "failover",
            Self::Flush => "flush",
            Self::Optimize => "optimize",
            Self::Notify => "notify",
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One step of a rule's action list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemediationAction {
    #[serde(rename = "type")]
    pub action_type: ActionType,
    #[serde(default)]
    pub params: serde_json::Map<String, serde_json::Value>,
}

impl RemediationAction {
    #[must_use]
    pub fn new(action_type: ActionType) -> Self {
        Self {
            action_type,
            params: serde_json::Map::new(),
        }
    }

    #[must_use]
    pub fn with_param(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.params.insert(key.to_string(), value.into());
        self
    }

    /// Decode the parameter map into the action's typed parameters.
    pub fn typed_params<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(serde_json::Value::Object(self.params.clone()))
            .with_context(|| format!("Invalid parameters for {} action", self.action_type))
    }

    /// Check that the parameters decode for this action type.
    pub fn validate(&self) -> Result<()> {
        match self.action_type {
            ActionType::Restart => self.typed_params::<RestartParams>().map(drop),
            ActionType::Scale => {
                let params = self.typed_params::<ScaleParams>()?;
                if params.replicas.is_none()
                    && params.delta.is_none()
                    && params.cpu_limit.is_none()
                    && params.memory_limit.is_none()
                {
                    bail!("scale action needs replicas, delta, cpu_limit or memory_limit");
                }
                Ok(())
            }
            ActionType::Failover => self.typed_params::<FailoverParams>().map(drop),
            ActionType::Flush => self.typed_params::<FlushParams>().map(drop),
            ActionType::Optimize => self.typed_params::<OptimizeParams>().map(drop),
            ActionType::Notify => self.typed_params::<NotifyParams>().map(drop),
        }
    }
}

impl fmt::Display for RemediationAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.params.is_empty() {
            write!(f, "{}", self.action_type)
        } else {
            write!(
                f,
                "{}({})",
                self.action_type,
                serde_json::Value::Object(self.params.clone())
            )
        }
    }
}

/// Executes remediation actions against the collaborators.
pub struct ActionExecutor {
    orchestration: Arc<dyn OrchestrationService>,
    data_plane: Arc<dyn DataPlaneService>,
    notifications: Arc<dyn NotificationService>,
    clock: Arc<dyn Clock>,
    poll: PollPolicy,
    call_timeout: Duration,
}

impl ActionExecutor {
    /// Create an executor.
    #[must_use]
    pub fn new(
        orchestration: Arc<dyn OrchestrationService>,
        data_plane: Arc<dyn DataPlaneService>,
        notifications: Arc<dyn NotificationService>,
        clock: Arc<dyn Clock>,
        poll: PollPolicy,
        call_timeout: Duration,
    ) -> Self {
        Self {
            orchestration,
            data_plane,
            notifications,
            clock,
            poll,
            call_timeout,
        }
    }

    /// Execute a single action.
    #[instrument(skip(self, target), fields(target = %target.name, action = %action.action_type))]
    pub async fn execute(&self, target: &Target, action: &RemediationAction) -> Result<(), GuardError> {
        info!("Executing remediation action");

        let outcome: Result<()> = async {
            match action.action_type {
                ActionType::Restart => self.restart(target, action.typed_params()?).await,
                ActionType::Scale => self.scale(target, action.typed_params()?).await,
                ActionType::Failover => self.failover(target, action.typed_params()?).await,
                ActionType::Flush => self.flush(target, action.typed_params()?).await,
                ActionType::Optimize => self.optimize(target, action.typed_params()?).await,
                ActionType::Notify => self.notify(target, action.typed_params()?).await,
            }
        }
        .await;

        outcome.map_err(|cause| {
            warn!(error = %format!("{cause:#}"), "Remediation action failed");
            GuardError::ActionFailed {
                action: action.action_type,
                cause,
            }
        })
    }

    /// Execute `actions` strictly in order, stopping at the first failure.
    ///
    /// Returns one result per attempted action: every success plus the failing
    /// step, if any. Steps after a failure are never attempted.
    pub async fn execute_sequence(
        &self,
        target: &Target,
        actions: &[RemediationAction],
        snapshot: &MetricSnapshot,
    ) -> Vec<RemediationResult> {
        let mut results = Vec::with_capacity(actions.len());

        for (step, action) in actions.iter().enumerate() {
            let outcome = self.execute(target, action).await;
            let executed_at = self.clock.now();
            match outcome {
                Ok(()) => results.push(RemediationResult::succeeded(
                    action.clone(),
                    snapshot.clone(),
                    executed_at,
                )),
                Err(e) => {
                    warn!(
                        target = %target.name,
                        step = step + 1,
                        skipped = actions.len() - step - 1,
                        "Aborting remaining remediation actions"
                    );
                    results.push(RemediationResult::failed(
                        action.clone(),
                        &e,
                        snapshot.clone(),
                        executed_at,
                    ));
                    break;
                }
            }
        }

        results
    }

    async fn restart(&self, target: &Target, params: RestartParams) -> Result<()> {
        match params.mode {
            RestartMode::Rollout => {
                let before = self.deployment_status(target).await?;
                self.issue_restart(target, &params).await?;
                self.wait_for_rollout(target, Some(&before), None).await
            }
            RestartMode::Pods => {
                let replaced: HashSet<String> = self
                    .list_pods(target)
                    .await?
                    .into_iter()
                    .map(|p| p.name)
                    .collect();
                self.issue_restart(target, &params).await?;

                let operation = format!("pods of {} replaced", target.qualified());
                poll_until(self.poll, &operation, || async {
                    let pods = self.list_pods(target).await?;
                    Ok(!pods.is_empty()
                        && pods
                            .iter()
                            .all(|p| p.is_running() && p.ready && !replaced.contains(&p.name)))
                })
                .await
            }
        }
    }

    async fn issue_restart(&self, target: &Target, params: &RestartParams) -> Result<()> {
        with_timeout(
            self.call_timeout,
            "restart",
            self.orchestration.restart(target, params),
        )
        .await
    }

    async fn scale(&self, target: &Target, mut params: ScaleParams) -> Result<()> {
        let before = self.deployment_status(target).await?;
        if let (None, Some(delta)) = (params.replicas, params.delta) {
            params.replicas = Some((before.replicas + delta).max(0));
            params.delta = None;
        }

        if params.replicas.is_none() && params.cpu_limit.is_none() && params.memory_limit.is_none() {
            bail!("scale action needs replicas, delta, cpu_limit or memory_limit");
        }

        with_timeout(self.call_timeout, "scale", self.orchestration.scale(target, &params)).await?;

        // Scaling to the current count leaves the spec, and its generation, untouched.
        let changes_spec = params.replicas != Some(before.replicas)
            || params.cpu_limit.is_some()
            || params.memory_limit.is_some();
        self.wait_for_rollout(target, changes_spec.then_some(&before), params.replicas)
            .await
    }

    async fn failover(&self, target: &Target, params: FailoverParams) -> Result<()> {
        with_timeout(
            self.call_timeout,
            "failover",
            self.data_plane.failover(target, &params),
        )
        .await?;

        if !params.wait_for_sync {
            return Ok(());
        }

        let operation = format!("replication sync of {}", target.name);
        poll_until(self.poll, &operation, || async {
            with_timeout(
                self.call_timeout,
                "replication status",
                self.data_plane.replication_in_sync(target),
            )
            .await
        })
        .await
    }

    async fn flush(&self, target: &Target, params: FlushParams) -> Result<()> {
        with_timeout(
            self.call_timeout,
            "cache flush",
            self.data_plane.flush_cache(target, &params),
        )
        .await?;

        if params.mode == FlushMode::Async {
            return Ok(());
        }

        let operation = format!("cache flush of {}", target.name);
        poll_until(self.poll, &operation, || async {
            with_timeout(
                self.call_timeout,
                "flush status",
                self.data_plane.flush_complete(target),
            )
            .await
        })
        .await
    }

    async fn optimize(&self, target: &Target, params: OptimizeParams) -> Result<()> {
        with_timeout(
            self.call_timeout,
            "optimize",
            self.data_plane.optimize(target, &params),
        )
        .await
    }

    async fn notify(&self, target: &Target, params: NotifyParams) -> Result<()> {
        let alert = Alert {
            target: target.name.clone(),
            severity: params.severity,
            message: params
                .message
                .unwrap_or_else(|| format!("Automated remediation in progress for {}", target.name)),
            channel: params.channel,
        };
        with_timeout(
            self.call_timeout,
            "alert dispatch",
            self.notifications.dispatch_alert(&alert),
        )
        .await
    }

    async fn deployment_status(&self, target: &Target) -> Result<DeploymentStatus> {
        with_timeout(
            self.call_timeout,
            "deployment status",
            self.orchestration
                .deployment_status(&target.namespace, &target.deployment),
        )
        .await
    }

    async fn list_pods(&self, target: &Target) -> Result<Vec<PodInfo>> {
        with_timeout(
            self.call_timeout,
            "list pods",
            self.orchestration.pods(&target.namespace, &target.selector),
        )
        .await
    }

    /// Poll until the deployment is steady. With `before`, the status must
    /// also show a spec generation newer than `before`'s, so counts read
    /// before the controller reacted never pass.
    async fn wait_for_rollout(
        &self,
        target: &Target,
        before: Option<&DeploymentStatus>,
        replicas: Option<i32>,
    ) -> Result<()> {
        let operation = format!("rollout of {}", target.qualified());
        poll_until(self.poll, &operation, || async {
            let status = self.deployment_status(target).await?;
            let settled = match before {
                Some(before) => status.settled_since(before),
                None => status.is_steady(),
            };
            Ok(settled && replicas.map_or(true, |r| status.replicas == r))
        })
        .await
    }
}
