//! Deployment safety and automated remediation.
//!
//! - [`safeguard`]: pre-deployment checks that can refuse a deployment
//! - [`rules`] and [`executor`]: metric-driven remediation rules and the
//!   actions they run
//! - [`verifier`]: confirms an incident actually recovered
//! - [`rollback`]: restores the last stable revision of a deployment
//! - [`orchestrator`] and [`monitor`]: the periodic remediation loop and
//!   active rollout watches
//!
//! The engine talks to its environment only through the traits in
//! [`services`]; [`adapters`] holds the kubectl, Prometheus, data-plane and
//! notification implementations. [`DeployGuard`] wires everything together.

pub mod adapters;
pub mod clock;
pub mod config;
pub mod error;
pub mod executor;
pub mod guard;
pub mod history;
pub mod metrics;
pub mod monitor;
pub mod orchestrator;
pub mod poll;
pub mod report;
pub mod rollback;
pub mod rules;
pub mod safeguard;
pub mod services;
pub mod telemetry;
pub mod verifier;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::GuardConfig;
pub use error::{GuardError, Result};
pub use executor::{ActionExecutor, ActionType, RemediationAction};
pub use guard::{DeployGuard, DeployGuardBuilder};
pub use history::{CooldownTable, EventLog, RemediationEvent, RemediationResult};
pub use metrics::{Comparison, MetricName, MetricSnapshot};
pub use monitor::{DeploymentMonitor, MonitorHandle, RolloutOutcome};
pub use orchestrator::{RemediationOrchestrator, TargetOutcome, TickSummary};
pub use report::RemediationReport;
pub use rollback::{RollbackController, RollbackOutcome, RollbackTarget};
pub use rules::{Condition, RemediationRule, RuleEvaluator};
pub use safeguard::{CheckResult, GateReport, SafeguardCheck, SafeguardChecker, Severity};
pub use verifier::{IncidentType, RecoveryCriterion, RecoveryVerifier, Verification};
