use parley::commands::start;
use parley::db::Database;
use parley::llm::LlmClient;
use parley::model::{ChatEvent, User};
use parley::observer::AlertObserver;
use parley::orchestrator::{Collaborators, OrchestratorSettings, ResponseOrchestrator};
use parley::transport::discord::{self, DiscordTransport};
use parley::{config::Config, Data};
use poise::serenity_prelude as serenity;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Bound on events waiting for the ingestion loop.
const EVENT_QUEUE_CAPACITY: usize = 256;

async fn forward(data: &Data, event: Option<ChatEvent>) {
    let Some(event) = event else { return };
    if data.events.send(event).await.is_err() {
        warn!("Ingestion loop is gone, dropping event");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Load configuration
    let config = Config::from_env()?;
    info!("Loaded configuration: {:?}", config);
    let discord_token = config.discord_token.clone();

    std::fs::create_dir_all(&config.data_dir)?;
    let db = Database::open(&config.database_path())?;
    db.execute_init()?;

    let shutdown = CancellationToken::new();
    let tracker = TaskTracker::new();
    let setup_shutdown = shutdown.clone();
    let setup_tracker = tracker.clone();

    let framework = poise::Framework::builder()
        .options(poise::FrameworkOptions {
            commands: vec![start::start()],
            event_handler: |ctx, event, _framework, data| {
                Box::pin(async move {
                    let bot_name = &data.config.bot_name;
                    match event {
                        serenity::FullEvent::Message { new_message } => {
                            forward(data, discord::inbound_event(new_message, data.bot_id, bot_name))
                                .await;
                        }
                        serenity::FullEvent::MessageUpdate { event, .. } => {
                            forward(data, discord::edit_event(event, data.bot_id, bot_name)).await;
                        }
                        serenity::FullEvent::InteractionCreate {
                            interaction: serenity::Interaction::Component(component),
                        } => {
                            let decision = discord::decision_event(
                                &ctx.http,
                                component,
                                data.config.admin_user_id,
                            )
                            .await;
                            forward(data, decision).await;
                        }
                        _ => {}
                    }
                    Ok(())
                })
            },
            ..Default::default()
        })
        .setup(move |ctx, ready, framework| {
            Box::pin(async move {
                info!("Bot is ready as {}!", ready.user.name);
                poise::builtins::register_globally(ctx, &framework.options().commands).await?;

                let bot_id = ready.user.id.get();
                let llm_client = Arc::new(LlmClient::new(&config, bot_id as i64));
                let transport = Arc::new(DiscordTransport::new(ctx.http.clone(), config.admin_user_id));

                let orchestrator = ResponseOrchestrator::open(
                    OrchestratorSettings::from_config(&config, bot_id as i64),
                    db,
                    Collaborators {
                        embedder: llm_client.clone(),
                        generator: llm_client.clone(),
                        vision: llm_client,
                        transport: transport.clone(),
                        observer: Arc::new(AlertObserver::new(transport)),
                    },
                )
                .await?;

                let bot = User {
                    id: bot_id as i64,
                    first_name: Some(config.bot_name.clone()),
                    last_name: None,
                    handle: Some(ready.user.name.clone()),
                };
                orchestrator
                    .bootstrap(User::new(config.admin_user_id as i64), bot)
                    .await?;

                let orchestrator = Arc::new(orchestrator);
                let (events, receiver) = mpsc::channel(EVENT_QUEUE_CAPACITY);
                setup_tracker.spawn(orchestrator.clone().run(receiver, setup_shutdown.clone()));

                Ok(Data {
                    config,
                    orchestrator,
                    events,
                    bot_id,
                    shutdown: setup_shutdown,
                })
            })
        })
        .build();

    let intents = serenity::GatewayIntents::non_privileged()
        | serenity::GatewayIntents::MESSAGE_CONTENT
        | serenity::GatewayIntents::GUILD_MESSAGES
        | serenity::GatewayIntents::DIRECT_MESSAGES;

    let mut client = serenity::ClientBuilder::new(&discord_token, intents)
        .framework(framework)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create client: {}", e))?;

    let shard_manager = client.shard_manager.clone();
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutting down...");
            signal_shutdown.cancel();
            shard_manager.shutdown_all().await;
        }
    });

    info!("Starting bot...");
    if let Err(why) = client.start().await {
        error!("Client error: {:?}", why);
    }

    shutdown.cancel();
    tracker.close();
    tracker.wait().await;
    Ok(())
}
