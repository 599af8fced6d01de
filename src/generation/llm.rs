//! OpenAI-compatible subject line generator
//!
//! Talks to any `/v1/chat/completions` endpoint (OpenAI, LM Studio, vLLM,
//! Ollama's OpenAI shim). Rate limits and transient failures are retried with
//! exponential backoff and jitter; client errors are not.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::SubjectLineGenerator;
use crate::config::GenerationConfig;

const SYSTEM_PROMPT: &str =
    "You are an expert email marketer specializing in subject line optimization.";

/// Exponential backoff schedule for generator calls
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            max_attempts: 5,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Delay after failed attempt `attempt` (0-based), before jitter
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt as i32);
        let delay = self.initial_delay.as_secs_f64() * factor;
        Duration::from_secs_f64(delay.min(self.max_delay.as_secs_f64()))
    }

    /// Backoff scaled into [50%, 100%] so concurrent retries spread out
    pub fn jittered<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base = self.backoff(attempt);
        if !self.jitter {
            return base;
        }
        base.mul_f64(0.5 + rng.gen::<f64>() * 0.5)
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

/// Outcome of one HTTP attempt
enum AttemptError {
    Retryable(anyhow::Error),
    Fatal(anyhow::Error),
}

/// Subject line generator backed by a chat-completions API
pub struct OpenAiSubjectGenerator {
    client: reqwest::blocking::Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    lines_requested: usize,
    retry: RetryPolicy,
}

impl OpenAiSubjectGenerator {
    pub fn from_config(config: &GenerationConfig) -> Result<Self> {
        let retry = RetryPolicy {
            initial_delay: Duration::from_millis(config.initial_backoff_ms),
            max_delay: Duration::from_millis(config.max_backoff_ms),
            max_attempts: config.max_attempts.max(1),
            ..Default::default()
        };
        Self::new(
            &config.llm_endpoint,
            &config.llm_model,
            config.api_key.clone(),
            Duration::from_secs(config.request_timeout_secs),
            config.variants_per_test,
            retry,
        )
    }

    pub fn new(
        endpoint: &str,
        model: &str,
        api_key: Option<String>,
        timeout: Duration,
        lines_requested: usize,
        retry: RetryPolicy,
    ) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key,
            lines_requested,
            retry,
        })
    }

    fn build_prompt(&self, content: &str, original_subject: Option<&str>) -> String {
        let excerpt: String = content.chars().take(1000).collect();
        let n = self.lines_requested;
        format!(
            r#"Generate exactly {n} compelling email subject lines for the following email content. Each subject line must be 60 characters or less.

Email Content:
{excerpt}

Requirements:
- Maximum 60 characters per subject line
- Focus on urgency, curiosity, or value proposition
- Avoid spam trigger words
- Make them action-oriented
- Use a different psychological trigger for each line

Original subject: {}

Format your response as a numbered list, one subject line per line:
1. [Subject line 1]
2. [Subject line 2]"#,
            original_subject.unwrap_or("None provided")
        )
    }

    fn attempt(&self, prompt: &str) -> std::result::Result<String, AttemptError> {
        let request = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: SYSTEM_PROMPT.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: prompt.to_string(),
                },
            ],
            temperature: 0.85,
            max_tokens: 300,
        };

        let url = format!("{}/v1/chat/completions", self.endpoint);
        let mut builder = self.client.post(&url).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().map_err(|e| {
            let err = anyhow!("HTTP request failed: {e}");
            if e.is_timeout() || e.is_connect() || e.is_request() {
                AttemptError::Retryable(err)
            } else {
                AttemptError::Fatal(err)
            }
        })?;

        let status = response.status();
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(AttemptError::Retryable(anyhow!("API returned status: {status}")));
        }
        if !status.is_success() {
            return Err(AttemptError::Fatal(anyhow!("API returned status: {status}")));
        }

        let parsed: ChatResponse = response
            .json()
            .map_err(|e| AttemptError::Fatal(anyhow!("Failed to parse response: {e}")))?;

        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| AttemptError::Fatal(anyhow!("No choices in API response")))
    }
}

impl SubjectLineGenerator for OpenAiSubjectGenerator {
    fn generate(&self, content: &str, original_subject: Option<&str>) -> Result<Vec<String>> {
        let prompt = self.build_prompt(content, original_subject);
        let mut rng = rand::thread_rng();

        let mut attempt = 0;
        loop {
            match self.attempt(&prompt) {
                Ok(text) => {
                    let lines = parse_subject_lines(&text);
                    debug!(attempt, lines = lines.len(), "Generator returned subject lines");
                    return Ok(lines);
                }
                Err(AttemptError::Retryable(e)) if attempt + 1 < self.retry.max_attempts => {
                    let delay = self.retry.jittered(attempt, &mut rng);
                    warn!(attempt, ?delay, error = %e, "Generator call failed, backing off");
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                Err(AttemptError::Retryable(e)) | Err(AttemptError::Fatal(e)) => {
                    return Err(e.context(format!(
                        "subject line generation failed after {} attempt(s)",
                        attempt + 1
                    )));
                }
            }
        }
    }

    fn name(&self) -> &'static str {
        "openai"
    }
}

/// Whether a line starts like a list item: `1.`, `2)`, `-`, `*`, `•`
fn is_list_item(line: &str) -> bool {
    let digits = line.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits > 0 {
        return matches!(line[digits..].chars().next(), Some('.') | Some(')'));
    }
    line.starts_with("- ") || line.starts_with("* ") || line.starts_with('•')
}

/// Candidate lines from a completion.
///
/// Prefers list items so preambles like "Here are five options:" are dropped;
/// falls back to every non-empty line when the model ignored the list format.
pub fn parse_subject_lines(text: &str) -> Vec<String> {
    let lines: Vec<&str> = text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();

    let items: Vec<String> = lines
        .iter()
        .filter(|l| is_list_item(l))
        .map(|l| l.to_string())
        .collect();

    if items.is_empty() {
        lines.into_iter().map(str::to_string).collect()
    } else {
        items
    }
}
