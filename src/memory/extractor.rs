use std::time::Duration;

use endpoints::chat::{
    ChatCompletionObject, ChatCompletionRequestBuilder, ChatCompletionRequestMessage,
    ChatCompletionUserMessageContent,
};
use reqwest::{
    StatusCode,
    header::{AUTHORIZATION, CONTENT_TYPE},
};

use crate::{
    config::MemoryConfig,
    dual_debug, dual_info, dual_warn,
    keys::Credential,
    memory::types::{SaveError, Turn},
};

/// Turns a conversation into a list of durable memories by asking an
/// OpenAI-compatible chat model to pull out facts, preferences and events.
///
/// The credential is supplied per call, so the caller decides which key pays
/// for the extraction and can retry with another one on quota errors.
pub struct MemoryExtractor {
    client: reqwest::Client,
    base_url: String,
    model: String,
    temperature: f64,
    max_tokens: i32,
}

impl MemoryExtractor {
    pub fn new(
        base_url: impl AsRef<str>,
        model: impl Into<String>,
        temperature: f64,
        max_tokens: i32,
        timeout: Duration,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                dual_warn!("Failed to build extraction client, using defaults: {}", e);
                reqwest::Client::new()
            });

        Self {
            client,
            base_url: base_url.as_ref().trim_end_matches('/').to_string(),
            model: model.into(),
            temperature,
            max_tokens,
        }
    }

    pub fn from_config(config: &MemoryConfig) -> Self {
        Self::new(
            &config.llm_base_url,
            config.llm_model.clone(),
            config.llm_temperature,
            config.llm_max_tokens,
            Duration::from_secs(config.llm_timeout_secs),
        )
    }

    /// Extract memories from `turns`.
    ///
    /// # Errors
    ///
    /// Returns a [`SaveError`] carrying the HTTP status (when there is one) and
    /// the provider's error body, so quota exhaustion can be recognised upstream.
    pub async fn extract(
        &self,
        turns: &[Turn],
        credential: &Credential,
    ) -> Result<Vec<String>, SaveError> {
        if turns.is_empty() {
            return Ok(Vec::new());
        }

        dual_info!(
            "Extracting memories from {} turns with {} (credential {})",
            turns.len(),
            self.model,
            credential
        );

        let prompt = build_extraction_prompt(turns);
        dual_debug!("Prompt for memory extraction:\n{}", prompt);

        let content = self.complete(prompt, credential).await?;
        let memories = parse_extraction(&content);

        dual_info!("Extracted {} memories", memories.len());

        Ok(memories)
    }

    async fn complete(&self, prompt: String, credential: &Credential) -> Result<String, SaveError> {
        let user_message = ChatCompletionRequestMessage::new_user_message(
            ChatCompletionUserMessageContent::Text(prompt),
            None,
        );
        let mut chat_completion = ChatCompletionRequestBuilder::new(&[user_message])
            .with_max_completion_tokens(self.max_tokens)
            .build();
        chat_completion.model = Some(self.model.clone());
        chat_completion.temperature = Some(self.temperature);

        let url = format!("{}/chat/completions", self.base_url);

        let response = self
            .client
            .post(&url)
            .header(CONTENT_TYPE, "application/json")
            .header(AUTHORIZATION, format!("Bearer {}", credential.expose()))
            .json(&chat_completion)
            .send()
            .await
            .map_err(|e| SaveError::new(format!("Failed to reach the extraction model: {e}")))?;

        let status = response.status();
        if status != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            return Err(SaveError::with_status(
                status.as_u16(),
                format!("Memory extraction failed ({status}): {body}"),
            ));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| SaveError::new(format!("Failed to read the extraction response: {e}")))?;

        let completion: ChatCompletionObject = serde_json::from_slice(&bytes)
            .map_err(|e| SaveError::new(format!("Failed to parse the extraction response: {e}")))?;

        completion
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .ok_or_else(|| SaveError::new("Extraction response contained no content"))
    }
}

fn build_extraction_prompt(turns: &[Turn]) -> String {
    let mut prompt = String::from(
        "You maintain the long-term memory of a personal assistant.\n\
         Read the conversation below and extract only information worth remembering \
         across sessions: facts about the user, preferences, upcoming events, \
         tasks and decisions. Ignore greetings, small talk and tool output.\n\n\
         Conversation:\n",
    );

    for turn in turns {
        prompt.push_str(&format!("{}: {}\n", turn.role, turn.content));
    }

    prompt.push_str(
        "\nRespond with a JSON array of short, self-contained statements, \
         for example [\"User's name is Ada\", \"Has a dentist appointment on Monday\"]. \
         Respond with [] if nothing is worth remembering.",
    );

    prompt
}

/// Parse the model's answer into individual memories.
///
/// Accepts a bare JSON array, an object with a `memories` or `facts` array,
/// either of those wrapped in a markdown code fence, or as a last resort a
/// bulleted or numbered list.
fn parse_extraction(content: &str) -> Vec<String> {
    let trimmed = strip_code_fence(content.trim());

    let parsed = serde_json::from_str::<serde_json::Value>(trimmed)
        .ok()
        .and_then(|value| match value {
            serde_json::Value::Array(items) => Some(items),
            serde_json::Value::Object(mut map) => match map.remove("memories") {
                Some(serde_json::Value::Array(items)) => Some(items),
                _ => match map.remove("facts") {
                    Some(serde_json::Value::Array(items)) => Some(items),
                    _ => None,
                },
            },
            _ => None,
        });

    match parsed {
        Some(items) => items
            .into_iter()
            .filter_map(|item| match item {
                serde_json::Value::String(s) => Some(s),
                serde_json::Value::Object(map) => map
                    .get("memory")
                    .or_else(|| map.get("text"))
                    .and_then(|v| v.as_str())
                    .map(str::to_string),
                _ => None,
            })
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        None => trimmed
            .lines()
            .filter_map(strip_list_marker)
            .map(|line| line.trim().to_string())
            .filter(|line| !line.is_empty())
            .collect(),
    }
}

/// Body of a bulleted (`-`, `*`, `•`) or numbered (`1.`, `2)`) list item.
fn strip_list_marker(line: &str) -> Option<&str> {
    let line = line.trim();
    if let Some(body) = ["- ", "* ", "• "].iter().find_map(|m| line.strip_prefix(m)) {
        return Some(body);
    }

    let digits = line.len() - line.trim_start_matches(|c: char| c.is_ascii_digit()).len();
    if digits == 0 {
        return None;
    }
    line[digits..]
        .strip_prefix(". ")
        .or_else(|| line[digits..].strip_prefix(") "))
}

fn strip_code_fence(content: &str) -> &str {
    let Some(rest) = content.strip_prefix("```") else {
        return content;
    };
    // drop the language tag line
    let rest = rest.split_once('\n').map(|(_, body)| body).unwrap_or("");
    rest.trim_end().trim_end_matches("```").trim()
}
