//! Production implementations of the collaborator traits.

pub mod dataplane;
pub mod journal;
pub mod kubectl;
pub mod notifier;
pub mod prometheus;

pub use dataplane::HttpDataPlane;
pub use journal::EventJournal;
pub use kubectl::KubectlOrchestrator;
pub use notifier::ChannelNotifier;
pub use prometheus::PrometheusMetrics;
