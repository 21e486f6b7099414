use crate::cache::{CachedTranslation, TranslationCache};
use crate::config::{Config, ProviderKind};
use crate::event::EventRecord;
use crate::retry::{with_retry_if, RetryConfig};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// Detection + translation metadata attached to an event.
///
/// All-or-nothing: when `translated_text` is present, the detection fields
/// and provider are guaranteed present too. `cached` marks results served
/// from the enrichment cache without a provider call.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TranslationResult {
    pub detected_lang: String,
    pub confidence: f32,
    pub translated_text: Option<String>,
    pub target_lang: String,
    pub provider: String,
    pub cached: bool,
    /// Set when confidence fell below the configured threshold. The result
    /// is still returned; callers decide whether to trust it.
    pub low_confidence: bool,
}

/// What a provider reports for one detect+translate call.
///
/// `translated_text` is `None` when the provider judged translation
/// unnecessary (source already in the target language).
#[derive(Debug, Clone)]
pub struct Detection {
    pub detected_lang: String,
    pub confidence: f32,
    pub translated_text: Option<String>,
}

/// Pluggable translation backend, selected at configuration time.
///
/// Each variant exposes the same single capability: detect the source
/// language and translate to the target in one call. New backends slot in
/// as variants without touching dispatch logic.
pub enum Provider {
    OpenAi(OpenAiProvider),
    Libre(LibreProvider),
}

impl Provider {
    pub fn from_config(config: &Config, client: reqwest::Client) -> Result<Self> {
        match config.provider {
            ProviderKind::OpenAi => {
                let api_key = config
                    .openai_api_key
                    .clone()
                    .context("OPENAI_API_KEY not set")?;
                Ok(Self::OpenAi(OpenAiProvider {
                    client,
                    api_url: config.openai_api_url.clone(),
                    api_key,
                    model: config.openai_model.clone(),
                }))
            }
            ProviderKind::Libre => Ok(Self::Libre(LibreProvider {
                client,
                base_url: config.libre_api_url.trim_end_matches('/').to_string(),
                api_key: config.libre_api_key.clone(),
            })),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::OpenAi(_) => "openai",
            Self::Libre(_) => "libretranslate",
        }
    }

    pub async fn detect_and_translate(&self, message: &str, target_lang: &str) -> Result<Detection> {
        match self {
            Self::OpenAi(p) => p.detect_and_translate(message, target_lang).await,
            Self::Libre(p) => p.detect_and_translate(message, target_lang).await,
        }
    }
}

// ==================== OpenAI-compatible provider ====================

/// Chat Completion request for detect+translate
#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<Message>,
    max_completion_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Serialize, Deserialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Message,
}

/// The JSON object the model is instructed to reply with
#[derive(Debug, Deserialize)]
struct ModelVerdict {
    detected_lang: String,
    confidence: f32,
    translated_text: Option<String>,
}

fn build_detect_system_prompt(target_lang: &str) -> String {
    format!(
        r#"You are a language detection and translation engine for chat messages.

Given a message, detect its language and translate it to '{0}'.

Respond with ONLY a JSON object, no prose and no code fences:
{{"detected_lang": "<ISO 639-1 code>", "confidence": <0.0-1.0>, "translated_text": "<translation>"}}

Rules:
- If the message is already in '{0}', set "translated_text" to null.
- Do not translate @mentions, #hashtags, URLs, emotes, or usernames.
- Preserve emojis and formatting.
- "confidence" reflects how certain you are of the detected language."#,
        target_lang
    )
}

pub struct OpenAiProvider {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    model: String,
}

impl OpenAiProvider {
    async fn detect_and_translate(&self, message: &str, target_lang: &str) -> Result<Detection> {
        let request = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                Message {
                    role: "system".to_string(),
                    content: build_detect_system_prompt(target_lang),
                },
                Message {
                    role: "user".to_string(),
                    content: message.to_string(),
                },
            ],
            max_completion_tokens: 2000,
            temperature: 0.0,
        };

        let response = self
            .client
            .post(&self.api_url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await
            .context("Failed to send translation request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|e| format!("<failed to read body: {}>", e));
            anyhow::bail!("Translation provider error ({}): {}", status, body);
        }

        let chat_response: ChatResponse = response
            .json()
            .await
            .context("Failed to parse provider response")?;

        let content = chat_response
            .choices
            .first()
            .map(|c| c.message.content.clone())
            .context("Provider response contained no choices")?;

        let verdict: ModelVerdict = serde_json::from_str(strip_code_fences(&content))
            .context("Provider reply was not the expected JSON object")?;

        Ok(Detection {
            detected_lang: verdict.detected_lang,
            confidence: verdict.confidence.clamp(0.0, 1.0),
            translated_text: verdict.translated_text,
        })
    }
}

/// Models occasionally wrap the JSON reply in a markdown fence despite the
/// instructions. Unwrap it before parsing.
fn strip_code_fences(content: &str) -> &str {
    let trimmed = content.trim();
    trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .map(str::trim)
        .unwrap_or(trimmed)
}

// ==================== LibreTranslate-style provider ====================

#[derive(Debug, Serialize)]
struct DetectRequest<'a> {
    q: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    api_key: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct DetectCandidate {
    /// Reported on a 0-100 scale
    confidence: f32,
    language: String,
}

#[derive(Debug, Serialize)]
struct TranslateRequest<'a> {
    q: &'a str,
    source: &'a str,
    target: &'a str,
    format: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    api_key: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct TranslateResponse {
    #[serde(rename = "translatedText")]
    translated_text: String,
}

pub struct LibreProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl LibreProvider {
    async fn detect_and_translate(&self, message: &str, target_lang: &str) -> Result<Detection> {
        let detect_url = format!("{}/detect", self.base_url);
        let response = self
            .client
            .post(&detect_url)
            .json(&DetectRequest {
                q: message,
                api_key: self.api_key.as_deref(),
            })
            .send()
            .await
            .context("Failed to send detect request")?;

        if !response.status().is_success() {
            anyhow::bail!("Translation provider error ({}): detect failed", response.status());
        }

        let mut candidates: Vec<DetectCandidate> = response
            .json()
            .await
            .context("Failed to parse detect response")?;
        candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        let top = candidates
            .into_iter()
            .next()
            .context("Detect response contained no candidates")?;

        let confidence = (top.confidence / 100.0).clamp(0.0, 1.0);
        if top.language == target_lang {
            return Ok(Detection {
                detected_lang: top.language,
                confidence,
                translated_text: None,
            });
        }

        let translate_url = format!("{}/translate", self.base_url);
        let response = self
            .client
            .post(&translate_url)
            .json(&TranslateRequest {
                q: message,
                source: &top.language,
                target: target_lang,
                format: "text",
                api_key: self.api_key.as_deref(),
            })
            .send()
            .await
            .context("Failed to send translate request")?;

        if !response.status().is_success() {
            anyhow::bail!(
                "Translation provider error ({}): translate failed",
                response.status()
            );
        }

        let translated: TranslateResponse = response
            .json()
            .await
            .context("Failed to parse translate response")?;

        Ok(Detection {
            detected_lang: top.language,
            confidence,
            translated_text: Some(translated.translated_text),
        })
    }
}

/// Determine if a provider error is retryable (5xx, 429, network errors).
/// Other 4xx client errors are not retried.
fn is_retryable_error(error: &anyhow::Error) -> bool {
    let error_str = error.to_string();

    if error_str.contains("Translation provider error") {
        if let Some(start) = error_str.find('(') {
            if let Some(end) = error_str[start..].find(')') {
                let status_str = &error_str[start + 1..start + end];
                let status_num = status_str.split_whitespace().next().unwrap_or("");
                if let Ok(status) = status_num.parse::<u16>() {
                    return status == 429 || status >= 500;
                }
            }
        }
    }

    // Network errors, timeouts, and malformed responses may be transient
    true
}

// ==================== Enrichment service ====================

/// Detects the source language of an event and translates it to the
/// configured target, with a skip policy, write-through caching, and
/// degrade-to-untranslated on provider failure.
pub struct Enricher {
    provider: Provider,
    cache: Arc<TranslationCache>,
    target_lang: String,
    min_words: usize,
    confidence_threshold: f32,
    retry: RetryConfig,
}

impl Enricher {
    pub fn new(provider: Provider, cache: Arc<TranslationCache>, config: &Config) -> Self {
        Self {
            provider,
            cache,
            target_lang: config.target_lang.clone(),
            min_words: config.min_translation_words,
            confidence_threshold: config.confidence_threshold,
            retry: RetryConfig::provider_call(),
        }
    }

    #[cfg(test)]
    pub fn with_retry_config(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Enrich one event. Never fails the pipeline: provider errors are
    /// logged at warning level and the event proceeds untranslated.
    pub async fn enrich(&self, event: &EventRecord) -> Option<TranslationResult> {
        let message = event.message.as_str();

        // Short utterances are unreliable to detect and not worth the latency
        if message.split_whitespace().count() < self.min_words {
            debug!("Skipping enrichment: message under {} words", self.min_words);
            return None;
        }

        if let Some(hit) = self.cache.get(message, &self.target_lang) {
            debug!("Enrichment cache hit");
            return Some(TranslationResult {
                low_confidence: hit.confidence < self.confidence_threshold,
                detected_lang: hit.detected_lang,
                confidence: hit.confidence,
                translated_text: Some(hit.translated_text),
                target_lang: self.target_lang.clone(),
                provider: hit.provider,
                cached: true,
            });
        }

        let detection = match with_retry_if(
            &self.retry,
            "Detect and translate",
            || self.provider.detect_and_translate(message, &self.target_lang),
            is_retryable_error,
        )
        .await
        {
            Ok(detection) => detection,
            Err(e) => {
                warn!("Enrichment degraded to no translation: {e:#}");
                return None;
            }
        };

        // Already in the target language: detection metadata only
        let translated_text = if detection.detected_lang == self.target_lang {
            None
        } else {
            detection.translated_text
        };

        if let Some(text) = &translated_text {
            self.cache.insert(
                message,
                &self.target_lang,
                CachedTranslation {
                    detected_lang: detection.detected_lang.clone(),
                    confidence: detection.confidence,
                    translated_text: text.clone(),
                    provider: self.provider.name().to_string(),
                },
            );
        }

        Some(TranslationResult {
            detected_lang: detection.detected_lang,
            confidence: detection.confidence,
            translated_text,
            target_lang: self.target_lang.clone(),
            provider: self.provider.name().to_string(),
            cached: false,
            low_confidence: detection.confidence < self.confidence_threshold,
        })
    }
}
