use dotenvy::dotenv;
use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Clone)]
pub struct Config {
    pub discord_token: String,
    pub admin_user_id: u64,
    pub bot_name: String,
    pub bot_identity: String,
    pub data_dir: PathBuf,
    pub llm_url: String,
    pub llm_model: String,
    pub llm_api_key: Option<String>,
    pub embedding_url: String,
    pub embedding_model: String,
    pub embedding_api_key: Option<String>,
    pub embedding_dimensions: usize,
    pub vision_url: String,
    pub vision_model: String,
    pub vision_api_key: Option<String>,
    pub vision_prompt: String,
    // Context assembly settings
    pub context_window: Duration,
    pub rag_limit: usize,
    pub reaction_threshold: f32,
    // Timeout settings
    pub llm_timeout_secs: u64,
    pub embedding_timeout_secs: u64,
    pub vision_timeout_secs: u64,
    pub transport_timeout_secs: u64,
}

const DEFAULT_IDENTITY: &str = "You are a friendly member of this chat. \
You keep answers short, you remember what people told you earlier, \
and you are not afraid of a little sarcasm.";

const DEFAULT_VISION_PROMPT: &str =
    "Give a detailed description of this image. Including identification of any people or locations.";

fn var_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv().ok();
        Self::build()
    }

    fn build() -> anyhow::Result<Self> {
        let llm_url =
            env::var("LLM_URL").unwrap_or_else(|_| "http://localhost:8080/v1".to_string());
        let llm_model = env::var("LLM_MODEL").unwrap_or_else(|_| "local-model".to_string());
        let llm_api_key = env::var("LLM_API_KEY").ok();

        let context_window = env::var("CONTEXT_WINDOW").unwrap_or_else(|_| "12h".to_string());
        let context_window = humantime::parse_duration(&context_window).map_err(|e| {
            anyhow::anyhow!("CONTEXT_WINDOW is malformed ({}): {}", context_window, e)
        })?;

        let reaction_threshold: f32 = var_or("REACTION_THRESHOLD", 0.7);
        if !(0.0..=1.0).contains(&reaction_threshold) {
            anyhow::bail!("REACTION_THRESHOLD must be between 0 and 1");
        }

        Ok(Config {
            discord_token: env::var("DISCORD_TOKEN")
                .map_err(|_| anyhow::anyhow!("DISCORD_TOKEN must be set"))?,
            admin_user_id: env::var("ADMIN_USER_ID")
                .map_err(|_| anyhow::anyhow!("ADMIN_USER_ID must be set"))?
                .parse()
                .map_err(|_| anyhow::anyhow!("ADMIN_USER_ID must be a valid u64"))?,
            bot_name: env::var("BOT_NAME").unwrap_or_else(|_| "Parley".to_string()),
            bot_identity: Self::load_identity()?,
            data_dir: PathBuf::from(env::var("DATA_DIR").unwrap_or_else(|_| "data".to_string())),
            embedding_url: env::var("EMBEDDING_URL").unwrap_or_else(|_| llm_url.clone()),
            embedding_model: env::var("EMBEDDING_MODEL")
                .unwrap_or_else(|_| "local-model".to_string()),
            embedding_api_key: env::var("EMBEDDING_API_KEY")
                .ok()
                .or_else(|| llm_api_key.clone()),
            embedding_dimensions: var_or("EMBEDDING_DIMENSIONS", 1536),
            vision_url: env::var("VISION_URL").unwrap_or_else(|_| llm_url.clone()),
            vision_model: env::var("VISION_MODEL").unwrap_or_else(|_| llm_model.clone()),
            vision_api_key: env::var("VISION_API_KEY").ok().or_else(|| llm_api_key.clone()),
            vision_prompt: env::var("VISION_PROMPT")
                .unwrap_or_else(|_| DEFAULT_VISION_PROMPT.to_string()),
            llm_url,
            llm_model,
            llm_api_key,
            context_window,
            rag_limit: var_or("RAG_LIMIT", 10),
            reaction_threshold,
            llm_timeout_secs: var_or("LLM_TIMEOUT_SECS", 30),
            embedding_timeout_secs: var_or("EMBEDDING_TIMEOUT_SECS", 30),
            vision_timeout_secs: var_or("VISION_TIMEOUT_SECS", 60),
            transport_timeout_secs: var_or("TRANSPORT_TIMEOUT_SECS", 15),
        })
    }

    /// Persona text: inline `BOT_IDENTITY` wins over `BOT_IDENTITY_PATH`.
    fn load_identity() -> anyhow::Result<String> {
        if let Ok(identity) = env::var("BOT_IDENTITY") {
            return Ok(identity);
        }
        if let Ok(path) = env::var("BOT_IDENTITY_PATH") {
            return fs::read_to_string(&path)
                .map_err(|e| anyhow::anyhow!("identity file not found: {} ({})", path, e));
        }
        Ok(DEFAULT_IDENTITY.to_string())
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("parley.db")
    }

    pub fn images_dir(&self) -> PathBuf {
        self.data_dir.join("images")
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("discord_token", &"[REDACTED]")
            .field("admin_user_id", &self.admin_user_id)
            .field("bot_name", &self.bot_name)
            .field("data_dir", &self.data_dir)
            .field("llm_url", &self.llm_url)
            .field("llm_model", &self.llm_model)
            .field("llm_api_key", &self.llm_api_key.as_ref().map(|_| "[REDACTED]"))
            .field("embedding_url", &self.embedding_url)
            .field("embedding_model", &self.embedding_model)
            .field(
                "embedding_api_key",
                &self.embedding_api_key.as_ref().map(|_| "[REDACTED]"),
            )
            .field("embedding_dimensions", &self.embedding_dimensions)
            .field("vision_url", &self.vision_url)
            .field("vision_model", &self.vision_model)
            .field(
                "vision_api_key",
                &self.vision_api_key.as_ref().map(|_| "[REDACTED]"),
            )
            .field("context_window", &humantime::format_duration(self.context_window).to_string())
            .field("rag_limit", &self.rag_limit)
            .field("reaction_threshold", &self.reaction_threshold)
            .field("llm_timeout_secs", &self.llm_timeout_secs)
            .field("embedding_timeout_secs", &self.embedding_timeout_secs)
            .field("vision_timeout_secs", &self.vision_timeout_secs)
            .field("transport_timeout_secs", &self.transport_timeout_secs)
            .finish()
    }
}

/// Discord message limit is 2000 characters
pub const DISCORD_MESSAGE_LIMIT: usize = 2000;
