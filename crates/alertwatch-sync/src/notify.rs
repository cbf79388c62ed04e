use alertwatch_core::{Notifier, Severity};
use async_trait::async_trait;
use tracing::{error, info, warn};

/// Routes operator notifications into the log stream.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, severity: Severity, message: &str) -> anyhow::Result<()> {
        match severity {
            Severity::Info => info!(target: "alertwatch::notify", "{message}"),
            Severity::Warning => warn!(target: "alertwatch::notify", "{message}"),
            Severity::Critical => error!(target: "alertwatch::notify", critical = true, "{message}"),
        }
        Ok(())
    }
}
