//! Narrative Transform: observation + instructional template -> hosted text generation.
//! One `reqwest::Client` per process, no retry. Callers surface errors inline.

use crate::prompts::{action_preamble, build_prompt, rewrite_preamble};
use crate::record::{Category, TargetType};
use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;

/// Incrementally delivered generation output.
pub type TextStream = BoxStream<'static, Result<String, NarrativeError>>;

#[derive(Debug, thiserror::Error)]
pub enum NarrativeError {
    #[error("observation is empty")]
    EmptyInput,
    #[error("generation returned no text")]
    EmptyResponse,
    #[error("generation API key is not configured")]
    MissingApiKey,
    #[error("generation request: {0}")]
    Http(#[from] reqwest::Error),
    #[error("generation API {status}: {body}")]
    Api { status: u16, body: String },
    #[error("generation response parse: {0}")]
    Parse(String),
    #[error("prompt blocked by provider: {0}")]
    Blocked(String),
}

/// A model the provider exposes, with its supported methods.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModelInfo {
    pub name: String,
    #[serde(default, rename = "supportedGenerationMethods")]
    pub supported_generation_methods: Vec<String>,
}

impl ModelInfo {
    pub fn supports_generate_content(&self) -> bool {
        self.supported_generation_methods
            .iter()
            .any(|m| m == "generateContent")
    }
}

/// Seam over the hosted generation service.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Single blocking call.
    async fn generate(&self, prompt: &str) -> Result<String, NarrativeError>;

    /// Token stream. Providers without streaming deliver the whole reply as one chunk.
    async fn generate_stream(&self, prompt: &str) -> Result<TextStream, NarrativeError> {
        let text = self.generate(prompt).await?;
        Ok(stream::once(async move { Ok(text) }).boxed())
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>, NarrativeError>;

    fn model(&self) -> &str;
}

// Generative-language REST wire types
#[derive(Serialize)]
struct GenerateRequest<'a> {
    contents: Vec<Content<'a>>,
}

#[derive(Serialize)]
struct Content<'a> {
    role: &'a str,
    parts: Vec<Part<'a>>,
}

#[derive(Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default, rename = "promptFeedback")]
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PromptFeedback {
    #[serde(rename = "blockReason")]
    block_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ModelList {
    #[serde(default)]
    models: Vec<ModelInfo>,
    #[serde(default, rename = "nextPageToken")]
    next_page_token: Option<String>,
}

/// Text of the first candidate, parts joined. Blocked prompts become `Blocked`.
fn extract_text(body: &str) -> Result<String, NarrativeError> {
    let parsed: GenerateResponse =
        serde_json::from_str(body).map_err(|e| NarrativeError::Parse(e.to_string()))?;
    if parsed.candidates.is_empty() {
        if let Some(reason) = parsed.prompt_feedback.and_then(|f| f.block_reason) {
            return Err(NarrativeError::Blocked(reason));
        }
    }
    Ok(parsed
        .candidates
        .into_iter()
        .next()
        .and_then(|c| c.content)
        .map(|c| {
            c.parts
                .into_iter()
                .filter_map(|p| p.text)
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default())
}

/// One SSE line from `streamGenerateContent?alt=sse`. Non-data lines yield `None`.
fn parse_sse_line(line: &str) -> Option<Result<String, NarrativeError>> {
    let data = line.trim().strip_prefix("data:")?.trim();
    if data.is_empty() || data == "[DONE]" {
        return None;
    }
    match extract_text(data) {
        Ok(t) if t.is_empty() => None,
        other => Some(other),
    }
}

/// Hosted generative-language API client (Gemini).
pub struct GeminiClient {
    api_key: String,
    model: String,
    base_url: String,
    client: reqwest::Client,
}

impl GeminiClient {
    pub fn new(api_key: &str, model: &str, base_url: &str) -> Result<Self, NarrativeError> {
        let key = api_key.trim();
        if key.is_empty() {
            return Err(NarrativeError::MissingApiKey);
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            api_key: key.to_string(),
            model: model.trim().trim_start_matches("models/").to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn from_config(cfg: &crate::config::GeminiConfig) -> Result<Self, NarrativeError> {
        let key = cfg.api_key().ok_or(NarrativeError::MissingApiKey)?;
        Self::new(key, cfg.model(), cfg.base_url())
    }

    fn endpoint(&self, method: &str) -> String {
        format!("{}/v1beta/models/{}:{}", self.base_url, self.model, method)
    }

    async fn post(&self, url: &str, prompt: &str, sse: bool) -> Result<reqwest::Response, NarrativeError> {
        let body = GenerateRequest {
            contents: vec![Content {
                role: "user",
                parts: vec![Part { text: prompt }],
            }],
        };
        let mut query: Vec<(&str, &str)> = vec![("key", self.api_key.as_str())];
        if sse {
            query.push(("alt", "sse"));
        }
        let res = self.client.post(url).query(&query).json(&body).send().await?;
        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(NarrativeError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(res)
    }
}

/// Line-buffered SSE decoding over the response body. Bytes are held until a full line
/// arrives so multi-byte characters split across chunks stay intact.
struct SseDecoder {
    body: BoxStream<'static, Result<Vec<u8>, reqwest::Error>>,
    buf: Vec<u8>,
    ready: VecDeque<Result<String, NarrativeError>>,
    done: bool,
}

impl SseDecoder {
    fn drain_lines(&mut self) {
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            if let Some(item) = parse_sse_line(&String::from_utf8_lossy(&line)) {
                self.ready.push_back(item);
            }
        }
    }

    fn into_stream(self) -> TextStream {
        stream::unfold(self, |mut st| async move {
            loop {
                if let Some(item) = st.ready.pop_front() {
                    return Some((item, st));
                }
                if st.done {
                    return None;
                }
                match st.body.next().await {
                    Some(Ok(chunk)) => {
                        st.buf.extend_from_slice(&chunk);
                        st.drain_lines();
                    }
                    Some(Err(e)) => {
                        st.done = true;
                        st.ready.push_back(Err(NarrativeError::Http(e)));
                    }
                    None => {
                        st.done = true;
                        st.buf.push(b'\n');
                        st.drain_lines();
                    }
                }
            }
        })
        .boxed()
    }
}

#[async_trait]
impl TextGenerator for GeminiClient {
    async fn generate(&self, prompt: &str) -> Result<String, NarrativeError> {
        tracing::info!(model = %self.model, "[HUB] generation call");
        let res = self.post(&self.endpoint("generateContent"), prompt, false).await?;
        let text = res.text().await?;
        extract_text(&text)
    }

    async fn generate_stream(&self, prompt: &str) -> Result<TextStream, NarrativeError> {
        tracing::info!(model = %self.model, "[HUB] streaming generation call");
        let res = self
            .post(&self.endpoint("streamGenerateContent"), prompt, true)
            .await?;
        let decoder = SseDecoder {
            body: res.bytes_stream().map(|r| r.map(|b| b.to_vec())).boxed(),
            buf: Vec::new(),
            ready: VecDeque::new(),
            done: false,
        };
        Ok(decoder.into_stream())
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>, NarrativeError> {
        let url = format!("{}/v1beta/models", self.base_url);
        let mut out = Vec::new();
        let mut page: Option<String> = None;
        loop {
            let mut query: Vec<(&str, &str)> = vec![("key", self.api_key.as_str())];
            if let Some(p) = page.as_deref() {
                query.push(("pageToken", p));
            }
            let res = self.client.get(&url).query(&query).send().await?;
            let status = res.status();
            let body = res.text().await?;
            if !status.is_success() {
                return Err(NarrativeError::Api {
                    status: status.as_u16(),
                    body,
                });
            }
            let list: ModelList =
                serde_json::from_str(&body).map_err(|e| NarrativeError::Parse(e.to_string()))?;
            out.extend(list.models);
            match list.next_page_token.filter(|t| !t.is_empty()) {
                Some(t) => page = Some(t),
                None => break,
            }
        }
        Ok(out)
    }

    fn model(&self) -> &str {
        &self.model
    }
}

/// Output of the two-call compose: write-up first, then actions/communication draft.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NarrativeDraft {
    pub write_up: String,
    pub actions: Option<String>,
    /// Set when the second call failed; the write-up is still usable.
    pub action_error: Option<String>,
}

impl NarrativeDraft {
    /// Concatenation persisted in the `generated_text` column.
    pub fn generated_text(&self) -> String {
        match self.actions.as_deref().map(str::trim).filter(|a| !a.is_empty()) {
            Some(a) => format!("{}\n\n{}", self.write_up.trim(), a),
            None => self.write_up.trim().to_string(),
        }
    }
}

fn non_empty(text: String) -> Result<String, NarrativeError> {
    if text.trim().is_empty() {
        Err(NarrativeError::EmptyResponse)
    } else {
        Ok(text)
    }
}

/// Rewrite a raw observation into a professional write-up for the given target type.
/// Returns a non-empty string or an error.
pub async fn rewrite(
    generator: &dyn TextGenerator,
    raw_text: &str,
    target: TargetType,
    category: Category,
) -> Result<String, NarrativeError> {
    if raw_text.trim().is_empty() {
        return Err(NarrativeError::EmptyInput);
    }
    let prompt = build_prompt(rewrite_preamble(target), category, raw_text);
    non_empty(generator.generate(&prompt).await?)
}

/// Streaming variant of [`rewrite`].
pub async fn rewrite_stream(
    generator: &dyn TextGenerator,
    raw_text: &str,
    target: TargetType,
    category: Category,
) -> Result<TextStream, NarrativeError> {
    if raw_text.trim().is_empty() {
        return Err(NarrativeError::EmptyInput);
    }
    let prompt = build_prompt(rewrite_preamble(target), category, raw_text);
    generator.generate_stream(&prompt).await
}

/// Action suggestions and a communication draft for an existing write-up.
pub async fn suggest_actions(
    generator: &dyn TextGenerator,
    write_up: &str,
    target: TargetType,
    category: Category,
) -> Result<String, NarrativeError> {
    let prompt = build_prompt(action_preamble(target), category, write_up);
    non_empty(generator.generate(&prompt).await?)
}

/// Both generation calls. Only the first is required to succeed.
pub async fn compose(
    generator: &dyn TextGenerator,
    raw_text: &str,
    target: TargetType,
    category: Category,
) -> Result<NarrativeDraft, NarrativeError> {
    let write_up = rewrite(generator, raw_text, target, category).await?;
    Ok(with_actions(generator, write_up, target, category).await)
}

/// Second call on a finished write-up. A failure is kept in `action_error`, never raised.
pub async fn with_actions(
    generator: &dyn TextGenerator,
    write_up: String,
    target: TargetType,
    category: Category,
) -> NarrativeDraft {
    let mut draft = NarrativeDraft {
        write_up,
        ..Default::default()
    };
    match suggest_actions(generator, &draft.write_up, target, category).await {
        Ok(a) => draft.actions = Some(a),
        Err(e) => {
            tracing::warn!("[HUB] action draft failed: {}", e);
            draft.action_error = Some(e.to_string());
        }
    }
    draft
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_joined_parts_of_first_candidate() {
        let body = r#"{"candidates":[{"content":{"parts":[{"text":"風險等級：低\n"},{"text":"內容"}]}},
            {"content":{"parts":[{"text":"ignored"}]}}]}"#;
        assert_eq!(extract_text(body).unwrap(), "風險等級：低\n內容");
    }

    #[test]
    fn blocked_prompt_is_an_error() {
        let body = r#"{"promptFeedback":{"blockReason":"SAFETY"}}"#;
        assert!(matches!(extract_text(body), Err(NarrativeError::Blocked(r)) if r == "SAFETY"));
    }

    #[test]
    fn sse_lines() {
        let line = r#"data: {"candidates":[{"content":{"parts":[{"text":"Hi"}]}}]}"#;
        assert_eq!(parse_sse_line(line).unwrap().unwrap(), "Hi");
        assert!(parse_sse_line(": keep-alive").is_none());
        assert!(parse_sse_line("").is_none());
        assert!(matches!(parse_sse_line("data: {not json"), Some(Err(NarrativeError::Parse(_)))));
    }

    #[tokio::test]
    async fn sse_decoder_keeps_split_multibyte_chars() {
        let full = "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"高風險\"}]}}]}\n\n".as_bytes();
        let (a, b) = full.split_at(full.len() - 13);
        let chunks: Vec<Result<Vec<u8>, reqwest::Error>> = vec![Ok(a.to_vec()), Ok(b.to_vec())];
        let decoder = SseDecoder {
            body: stream::iter(chunks).boxed(),
            buf: Vec::new(),
            ready: VecDeque::new(),
            done: false,
        };
        let out: Vec<String> = decoder
            .into_stream()
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(out, vec!["高風險".to_string()]);
    }

    #[test]
    fn model_filter() {
        let m = ModelInfo {
            name: "models/embedding-001".into(),
            supported_generation_methods: vec!["embedContent".into()],
        };
        assert!(!m.supports_generate_content());
    }

    #[test]
    fn missing_key_rejected() {
        assert!(matches!(
            GeminiClient::new("  ", "gemini-1.5-flash", "https://x"),
            Err(NarrativeError::MissingApiKey)
        ));
    }

    #[test]
    fn generated_text_joins_both_outputs() {
        let d = NarrativeDraft {
            write_up: "風險等級：中\n紀錄".into(),
            actions: Some("1. 追蹤".into()),
            action_error: None,
        };
        assert_eq!(d.generated_text(), "風險等級：中\n紀錄\n\n1. 追蹤");
        let only = NarrativeDraft {
            actions: None,
            ..d
        };
        assert_eq!(only.generated_text(), "風險等級：中\n紀錄");
    }
}
