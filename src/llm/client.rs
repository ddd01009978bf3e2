use super::{EmbeddingBackend, GeneratedReply, GenerationBackend, VisionBackend};
use crate::config::Config;
use crate::model::Message;
use async_openai::{
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
        ChatCompletionRequestMessageContentPartImageArgs,
        ChatCompletionRequestMessageContentPartTextArgs, ChatCompletionRequestSystemMessageArgs,
        ChatCompletionRequestUserMessageArgs, ChatCompletionRequestUserMessageContentPart,
        CreateChatCompletionRequestArgs, CreateEmbeddingRequestArgs, ImageDetail, ImageUrlArgs,
        ResponseFormat, ResponseFormatJsonSchema,
    },
    Client,
};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use tracing::debug;

fn openai_config(url: &str, api_key: Option<&String>) -> OpenAIConfig {
    OpenAIConfig::new()
        .with_api_base(url)
        .with_api_key(api_key.map(String::as_str).unwrap_or("unused"))
}

/// OpenAI-compatible client covering generation, embeddings and vision.
pub struct LlmClient {
    chat_client: Client<OpenAIConfig>,
    embedding_client: Client<OpenAIConfig>,
    vision_client: Client<OpenAIConfig>,
    chat_model: String,
    embedding_model: String,
    embedding_dimensions: usize,
    vision_model: String,
    bot_id: i64,
}

impl LlmClient {
    pub fn new(config: &Config, bot_id: i64) -> Self {
        Self {
            chat_client: Client::with_config(openai_config(
                &config.llm_url,
                config.llm_api_key.as_ref(),
            )),
            embedding_client: Client::with_config(openai_config(
                &config.embedding_url,
                config.embedding_api_key.as_ref(),
            )),
            vision_client: Client::with_config(openai_config(
                &config.vision_url,
                config.vision_api_key.as_ref(),
            )),
            chat_model: config.llm_model.clone(),
            embedding_model: config.embedding_model.clone(),
            embedding_dimensions: config.embedding_dimensions,
            vision_model: config.vision_model.clone(),
            bot_id,
        }
    }
}

/// Prompt first, then each message preceded by a metadata line.
pub fn build_history(
    prompt: &str,
    messages: &[Message],
    bot_id: i64,
) -> anyhow::Result<Vec<ChatCompletionRequestMessage>> {
    let mut history: Vec<ChatCompletionRequestMessage> =
        vec![ChatCompletionRequestSystemMessageArgs::default()
            .content(prompt)
            .build()?
            .into()];

    for message in messages {
        history.push(
            ChatCompletionRequestSystemMessageArgs::default()
                .content(metadata_line(message))
                .build()?
                .into(),
        );

        let entry: ChatCompletionRequestMessage = if message.sender_id == bot_id {
            ChatCompletionRequestAssistantMessageArgs::default()
                .content(message.text.clone())
                .build()?
                .into()
        } else {
            ChatCompletionRequestUserMessageArgs::default()
                .content(message.text.clone())
                .build()?
                .into()
        };
        history.push(entry);
    }

    Ok(history)
}

fn metadata_line(message: &Message) -> String {
    let metadata = serde_json::json!({
        "id": message.id,
        "sender_id": message.sender_id,
        "created_at": message.created_at.to_rfc3339(),
        "reply_to_id": message.reply_to_id,
    });
    format!("Metadata of the next message: {}", metadata)
}

fn reply_format() -> anyhow::Result<ResponseFormat> {
    let schema = serde_json::to_value(schemars::schema_for!(GeneratedReply))?;
    Ok(ResponseFormat::JsonSchema {
        json_schema: ResponseFormatJsonSchema {
            description: Some("Reply to the conversation".to_string()),
            name: "reply".to_string(),
            schema: Some(schema),
            strict: None,
        },
    })
}

#[async_trait]
impl GenerationBackend for LlmClient {
    async fn generate(&self, prompt: &str, messages: &[Message]) -> anyhow::Result<GeneratedReply> {
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.chat_model)
            .messages(build_history(prompt, messages, self.bot_id)?)
            .response_format(reply_format()?)
            .build()?;

        let response = self.chat_client.chat().create(request).await?;
        let content = response
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .ok_or_else(|| anyhow::anyhow!("No response from LLM"))?;

        debug!("LLM raw output: {}", content);
        GeneratedReply::parse(&content)
    }
}

#[async_trait]
impl EmbeddingBackend for LlmClient {
    fn dimensions(&self) -> usize {
        self.embedding_dimensions
    }

    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        let request = CreateEmbeddingRequestArgs::default()
            .model(&self.embedding_model)
            .input(text)
            .dimensions(self.embedding_dimensions as u32)
            .build()?;

        let response = self.embedding_client.embeddings().create(request).await?;
        let embedding = response
            .data
            .first()
            .ok_or_else(|| anyhow::anyhow!("No embedding returned"))?
            .embedding
            .clone();

        Ok(embedding)
    }
}

#[async_trait]
impl VisionBackend for LlmClient {
    async fn analyze(&self, image: &[u8], prompt: &str) -> anyhow::Result<String> {
        let data_url = format!("data:image/jpeg;base64,{}", STANDARD.encode(image));
        let parts: Vec<ChatCompletionRequestUserMessageContentPart> = vec![
            ChatCompletionRequestMessageContentPartTextArgs::default()
                .text(prompt)
                .build()?
                .into(),
            ChatCompletionRequestMessageContentPartImageArgs::default()
                .image_url(
                    ImageUrlArgs::default()
                        .url(data_url)
                        .detail(ImageDetail::High)
                        .build()?,
                )
                .build()?
                .into(),
        ];

        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.vision_model)
            .messages(vec![ChatCompletionRequestUserMessageArgs::default()
                .content(parts)
                .build()?
                .into()])
            .build()?;

        let response = self.vision_client.chat().create(request).await?;
        response
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .ok_or_else(|| anyhow::anyhow!("No description from vision model"))
    }
}
