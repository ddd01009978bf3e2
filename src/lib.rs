pub mod access;
pub mod commands;
pub mod config;
pub mod context;
pub mod db;
pub mod deadline;
pub mod error;
pub mod llm;
pub mod model;
pub mod observer;
pub mod orchestrator;
pub mod prompt;
pub mod rag;
pub mod store;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

/// Custom data passed to all commands
pub struct Data {
    pub config: config::Config,
    pub orchestrator: std::sync::Arc<orchestrator::ResponseOrchestrator>,
    /// Feeds gateway events into the ingestion loop
    pub events: tokio::sync::mpsc::Sender<model::ChatEvent>,
    /// Bot's own user ID, used for mention rewriting
    pub bot_id: u64,
    pub shutdown: tokio_util::sync::CancellationToken,
}

pub type Error = Box<dyn std::error::Error + Send + Sync>;
pub type Context<'a> = poise::Context<'a, Data, Error>;
