use crate::config::DISCORD_MESSAGE_LIMIT;
use crate::transport::Transport;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// Capability to report severity-tagged pipeline events.
pub trait Observer: Send + Sync {
    fn report(&self, severity: Severity, event: &str, detail: &str);
}

pub struct TracingObserver;

impl Observer for TracingObserver {
    fn report(&self, severity: Severity, event: &str, detail: &str) {
        match severity {
            Severity::Info => info!(event = event, "{} - {}", event, detail),
            Severity::Warning => warn!(event = event, "{} - {}", event, detail),
            Severity::Error => error!(event = event, "{} - {}", event, detail),
        }
    }
}

/// Logs everything and additionally DMs errors to the reviewer.
pub struct AlertObserver {
    transport: Arc<dyn Transport>,
}

impl AlertObserver {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }
}

impl Observer for AlertObserver {
    fn report(&self, severity: Severity, event: &str, detail: &str) {
        TracingObserver.report(severity, event, detail);
        if severity < Severity::Error {
            return;
        }

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let transport = self.transport.clone();
        let text: String = format!("🚨 {} - {}", event, detail)
            .chars()
            .take(DISCORD_MESSAGE_LIMIT)
            .collect();
        handle.spawn(async move {
            if let Err(e) = transport.alert_reviewer(&text).await {
                warn!("admin alert delivery failed: {}", e);
            }
        });
    }
}
