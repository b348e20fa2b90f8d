//! Gemini-backed decision client.
//!
//! One `generateContent` call per step: text prompt plus the annotated
//! screenshot as inline PNG data, free-form text back. Everything beyond
//! "send parts, read the first candidate" lives in `crate::extract`.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::env;

use crate::agent::{AgentError, DecisionClient};

#[derive(Clone)]
pub struct GeminiConfig {
    pub api_base: String, // e.g. "https://generativelanguage.googleapis.com/v1beta"
    pub model: String,    // e.g. "gemini-2.0-flash"
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            api_base: env::var("GEMINI_BASE_URL")
                .unwrap_or_else(|_| "https://generativelanguage.googleapis.com/v1beta".into()),
            model: env::var("GEMINI_MODEL").unwrap_or_else(|_| "gemini-2.0-flash".into()),
        }
    }
}

#[derive(Clone, Default)]
pub struct GeminiClient {
    http: Client,
    cfg: GeminiConfig,
}

impl GeminiClient {
    pub fn new(cfg: GeminiConfig) -> Self {
        Self { http: Client::new(), cfg }
    }

    async fn generate(
        &self,
        api_key: &str,
        prompt: &str,
        image_png_b64: Option<&str>,
    ) -> Result<String> {
        // The key travels as a query parameter, not a header.
        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.cfg.api_base, self.cfg.model, api_key
        );

        let mut parts = vec![json!({ "text": prompt })];
        if let Some(data) = image_png_b64 {
            parts.push(json!({
                "inline_data": { "mime_type": "image/png", "data": data }
            }));
        }
        let req = json!({ "contents": [{ "parts": parts }] });

        let resp = self.http.post(url).json(&req).send().await?;
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            bail!("Gemini error {}: {}", status, text);
        }
        let v: Value = serde_json::from_str(&text).context("failed to parse Gemini response JSON")?;

        if let Some(reason) = v.pointer("/promptFeedback/blockReason").and_then(Value::as_str) {
            bail!("Gemini blocked the prompt: {}", reason);
        }

        let answer = v
            .pointer("/candidates/0/content/parts/0/text")
            .and_then(Value::as_str)
            .context("Gemini response has no text candidate")?
            .trim();
        if answer.is_empty() {
            bail!("Gemini returned an empty answer");
        }
        Ok(answer.to_string())
    }
}

#[async_trait]
impl DecisionClient for GeminiClient {
    async fn decide(
        &self,
        api_key: &str,
        prompt: &str,
        image_png_b64: Option<&str>,
    ) -> Result<String, AgentError> {
        self.generate(api_key, prompt, image_png_b64)
            .await
            .map_err(|e| AgentError::DecisionFailed(e.to_string()))
    }
}
