use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use deskpilot_contracts::{Category, ClassificationResult, PromptVariant};
use deskpilot_kernel::{
    build_user_message, decide_next_step, fallback_classification, parse_classification,
    select_prompt, system_prompt, ClassifierFailure, ClassifierStep, FallbackUnavailable,
    PromptPolicy,
};
use reqwest::Client;
use serde_json::{json, Value};
use tokio::time::sleep;

#[derive(Debug, Clone, PartialEq)]
pub struct ClassifierRequest {
    pub variant: PromptVariant,
    pub system_instruction: String,
    pub user_message: String,
}

/// Opaque generative model. Returns the raw answer text.
#[async_trait]
pub trait ClassifierBackend: Send + Sync {
    async fn generate(&self, request: &ClassifierRequest) -> Result<String, ClassifierFailure>;
}

#[derive(Debug, Clone)]
pub struct GenerationSettings {
    pub temperature: f64,
    pub max_output_tokens: u32,
}

/// `generateContent` client for Gemini-style endpoints.
pub struct GeminiClassifier {
    client: Client,
    endpoint: String,
    model: String,
    api_key: String,
    generation: GenerationSettings,
}

impl GeminiClassifier {
    pub fn new(
        endpoint: &str,
        model: &str,
        api_key: String,
        timeout: Duration,
        generation: GenerationSettings,
    ) -> Result<Self, String> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| e.to_string())?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key,
            generation,
        })
    }

    fn body(&self, request: &ClassifierRequest) -> Value {
        json!({
            "systemInstruction": {"parts": [{"text": request.system_instruction}]},
            "contents": [{"role": "user", "parts": [{"text": request.user_message}]}],
            "generationConfig": {
                "temperature": self.generation.temperature,
                "maxOutputTokens": self.generation.max_output_tokens,
                "topP": 0.8,
                "responseMimeType": "application/json"
            }
        })
    }
}

fn answer_text(body: &Value) -> Option<String> {
    let parts = body
        .get("candidates")?
        .get(0)?
        .get("content")?
        .get("parts")?
        .as_array()?;
    let text: String = parts
        .iter()
        .filter_map(|p| p.get("text").and_then(Value::as_str))
        .collect();
    (!text.is_empty()).then_some(text)
}

#[async_trait]
impl ClassifierBackend for GeminiClassifier {
    async fn generate(&self, request: &ClassifierRequest) -> Result<String, ClassifierFailure> {
        let url = format!("{}/models/{}:generateContent", self.endpoint, self.model);
        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&self.body(request))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ClassifierFailure::Timeout(e.to_string())
                } else {
                    ClassifierFailure::Connection(e.to_string())
                }
            })?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ClassifierFailure::Connection(e.to_string()))?;
        if !status.is_success() {
            return Err(ClassifierFailure::from_http(status.as_u16(), &text));
        }
        let body: Value =
            serde_json::from_str(&text).map_err(|e| ClassifierFailure::Unparseable(e.to_string()))?;
        answer_text(&body).ok_or_else(|| {
            ClassifierFailure::Unparseable("response carries no candidate text".to_string())
        })
    }
}

#[derive(Debug, Clone)]
pub struct AdapterSettings {
    pub policy: PromptPolicy,
    pub reasoning_max_chars: usize,
    pub input_max_chars: usize,
    pub rate_limit_retry_delay: Duration,
}

/// What the adapter did, for the audit trail.
#[derive(Debug, Clone)]
pub struct ClassificationReport {
    pub result: ClassificationResult,
    pub variant: PromptVariant,
    pub attempts: u32,
    pub failure: Option<ClassifierFailure>,
}

/// Wraps the backend with prompt selection, one retry on rate limiting and a
/// deterministic fallback. Never surfaces a classifier failure to the caller.
pub struct ClassificationAdapter {
    backend: Arc<dyn ClassifierBackend>,
    settings: AdapterSettings,
}

impl ClassificationAdapter {
    pub fn new(backend: Arc<dyn ClassifierBackend>, settings: AdapterSettings) -> Self {
        Self { backend, settings }
    }

    /// `Err` only when no fallback exists for the category, meaning the
    /// ticket cannot be processed automatically at all.
    pub async fn classify(
        &self,
        ticket_id: i64,
        description: &str,
        category: Category,
    ) -> Result<ClassificationReport, FallbackUnavailable> {
        let variant = select_prompt(description, category, &self.settings.policy);
        let request = ClassifierRequest {
            variant,
            system_instruction: system_prompt(variant),
            user_message: build_user_message(category, description, self.settings.input_max_chars),
        };

        let mut attempts = 0;
        let failure = loop {
            attempts += 1;
            let outcome = match self.backend.generate(&request).await {
                Ok(raw) => parse_classification(&raw, self.settings.reasoning_max_chars, Utc::now()),
                Err(e) => Err(e),
            };
            let failure = match outcome {
                Ok(result) => {
                    tracing::info!(
                        ticket_id,
                        app_type = result.app_type().as_str(),
                        confidence = result.confidence(),
                        ?variant,
                        attempts,
                        "classification succeeded"
                    );
                    return Ok(ClassificationReport {
                        result,
                        variant,
                        attempts,
                        failure: None,
                    });
                }
                Err(failure) => failure,
            };
            match decide_next_step(&failure, attempts) {
                ClassifierStep::Retry => {
                    tracing::warn!(
                        ticket_id,
                        reason = failure.reason_code(),
                        delay_ms = self.settings.rate_limit_retry_delay.as_millis() as u64,
                        "classifier rate limited, retrying once"
                    );
                    sleep(self.settings.rate_limit_retry_delay).await;
                }
                ClassifierStep::Fallback => break failure,
            }
        };

        tracing::warn!(
            ticket_id,
            reason = failure.reason_code(),
            error = %failure,
            "classifier unavailable, using category fallback"
        );
        let result = fallback_classification(category.code(), Utc::now())?;
        Ok(ClassificationReport {
            result,
            variant,
            attempts,
            failure: Some(failure),
        })
    }
}
