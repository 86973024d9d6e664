//! Text-generation providers.  The default talks to a local Ollama server
//! over its blocking HTTP API; tests substitute the trait with fakes.

use std::io::{BufRead, BufReader};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Deserialize;

use crate::errors::{CaliperError, CaliperResult};

/// A cancellable text-generation backend.
pub trait Provider: Send + Sync {
    /// Generate a complete answer for `prompt`.
    fn generate(&self, prompt: &str, cancel: &AtomicBool) -> CaliperResult<String>;

    /// Generate incrementally, invoking `on_chunk` per fragment, and return
    /// the fully assembled text.
    fn generate_stream(
        &self,
        prompt: &str,
        cancel: &AtomicBool,
        on_chunk: &mut dyn FnMut(&str),
    ) -> CaliperResult<String> {
        // Default: one chunk.
        let text = self.generate(prompt, cancel)?;
        on_chunk(&text);
        Ok(text)
    }
}

#[derive(Debug, Clone)]
pub struct ProviderOptions {
    pub base_url: String,
    pub model: String,
    /// Smaller model retried once when the primary runs out of memory.
    pub fallback_model: Option<String>,
    pub timeout_secs: u64,
}

impl Default for ProviderOptions {
    fn default() -> Self {
        ProviderOptions {
            base_url: "http://localhost:11434".to_string(),
            model: "llama3.1:8b".to_string(),
            fallback_model: Some("llama3.2:3b".to_string()),
            timeout_secs: 120,
        }
    }
}

/// Substrings Ollama emits when a model does not fit in memory.
const OOM_MARKERS: &[&str] = &[
    "more system memory",
    "unable to load full model",
    "out of memory",
];

pub fn is_oom(message: &str) -> bool {
    let lowered = message.to_lowercase();
    OOM_MARKERS.iter().any(|m| lowered.contains(m))
}

#[derive(Deserialize)]
struct GenerateChunk {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

pub struct OllamaProvider {
    options: ProviderOptions,
    client: Mutex<Option<reqwest::blocking::Client>>,
}

impl OllamaProvider {
    pub fn new(options: ProviderOptions) -> Self {
        OllamaProvider {
            options,
            client: Mutex::new(None),
        }
    }

    fn client(&self) -> CaliperResult<reqwest::blocking::Client> {
        let mut guard = self.client.lock();
        if let Some(client) = guard.as_ref() {
            return Ok(client.clone());
        }
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(self.options.timeout_secs))
            .build()?;
        *guard = Some(client.clone());
        Ok(client)
    }

    fn generate_once(&self, model: &str, prompt: &str) -> CaliperResult<String> {
        let url = format!("{}/api/generate", self.options.base_url);
        let response = self
            .client()?
            .post(&url)
            .json(&serde_json::json!({
                "model": model,
                "prompt": prompt,
                "stream": false,
            }))
            .send()?;

        let status = response.status();
        let body = response.text()?;
        if !status.is_success() {
            return Err(CaliperError::Provider(format!(
                "ollama returned {status}: {body}"
            )));
        }
        let chunk: GenerateChunk = serde_json::from_str(&body)?;
        if let Some(error) = chunk.error {
            return Err(CaliperError::Provider(error));
        }
        Ok(chunk.response)
    }

    fn stream_once(
        &self,
        model: &str,
        prompt: &str,
        cancel: &AtomicBool,
        on_chunk: &mut dyn FnMut(&str),
    ) -> CaliperResult<String> {
        let url = format!("{}/api/generate", self.options.base_url);
        let response = self
            .client()?
            .post(&url)
            .json(&serde_json::json!({
                "model": model,
                "prompt": prompt,
                "stream": true,
            }))
            .send()?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(CaliperError::Provider(format!(
                "ollama returned {status}: {body}"
            )));
        }

        let mut assembled = String::new();
        let reader = BufReader::new(response);
        for line in reader.lines() {
            if cancel.load(Ordering::Relaxed) {
                tracing::info!("generation cancelled by caller");
                return Err(CaliperError::Provider("generation cancelled".to_string()));
            }
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let chunk: GenerateChunk = serde_json::from_str(&line)?;
            if let Some(error) = chunk.error {
                return Err(CaliperError::Provider(error));
            }
            if !chunk.response.is_empty() {
                on_chunk(&chunk.response);
                assembled.push_str(&chunk.response);
            }
            if chunk.done {
                break;
            }
        }
        Ok(assembled)
    }

    /// Run `attempt` with the primary model; on an out-of-memory failure,
    /// retry once with the fallback model.
    fn with_oom_fallback<T>(
        &self,
        mut attempt: impl FnMut(&str) -> CaliperResult<T>,
    ) -> CaliperResult<T> {
        match attempt(&self.options.model) {
            Err(CaliperError::Provider(msg)) if is_oom(&msg) => {
                if let Some(fallback) = &self.options.fallback_model {
                    tracing::warn!(
                        primary = %self.options.model,
                        fallback = %fallback,
                        "model did not fit in memory, retrying with fallback"
                    );
                    attempt(fallback)
                } else {
                    Err(CaliperError::Provider(msg))
                }
            }
            other => other,
        }
    }
}

impl Provider for OllamaProvider {
    fn generate(&self, prompt: &str, cancel: &AtomicBool) -> CaliperResult<String> {
        if cancel.load(Ordering::Relaxed) {
            return Err(CaliperError::Provider("generation cancelled".to_string()));
        }
        self.with_oom_fallback(|model| self.generate_once(model, prompt))
    }

    fn generate_stream(
        &self,
        prompt: &str,
        cancel: &AtomicBool,
        on_chunk: &mut dyn FnMut(&str),
    ) -> CaliperResult<String> {
        self.with_oom_fallback(|model| self.stream_once(model, prompt, cancel, on_chunk))
    }
}
