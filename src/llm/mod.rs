//! LLM-backed stepping function.
//!
//! Uses rig-core for HTTP transport. Each step sends the session's messages
//! plus the trace so far and expects a small JSON object back:
//!
//! ```json
//! {"thinking": "...", "status": "...", "final_answer": "..."}
//! ```
//!
//! Every field is optional. A reply that is not JSON is taken as the final
//! answer.

use async_trait::async_trait;
use rig::client::CompletionClient;
use rig::completion::{Chat, CompletionError, CompletionModel, Message, PromptError};
use secrecy::ExposeSecret;
use serde::Deserialize;

use crate::error::{LlmError, StepError};
use crate::events::EventPayload;
use crate::worker::{StepContext, StepOutcome, Stepper};

const PREAMBLE: &str = r#"You are an orchestration agent working through a user's request one step at a time.

Reply with a single JSON object and nothing else:
{"thinking": "<your reasoning for this step>", "status": "<short progress marker>", "final_answer": "<answer, only when finished>"}

Omit "final_answer" until you are confident in it. Keep each step short."#;

/// Configuration for the Anthropic-backed stepper.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: secrecy::SecretString,
    pub model: String,
    pub max_tokens: u64,
}

impl LlmConfig {
    /// `ANTHROPIC_API_KEY` is required; `ORCH_MODEL` overrides the model.
    pub fn from_env() -> Result<Self, crate::error::ConfigError> {
        let api_key = std::env::var("ANTHROPIC_API_KEY")
            .map_err(|_| crate::error::ConfigError::MissingEnvVar("ANTHROPIC_API_KEY".into()))?;
        Ok(Self {
            api_key: secrecy::SecretString::from(api_key),
            model: std::env::var("ORCH_MODEL")
                .unwrap_or_else(|_| "claude-sonnet-4-20250514".to_string()),
            max_tokens: 2048,
        })
    }
}

/// Stepper driving a rig agent.
pub struct LlmStepper<M: CompletionModel> {
    agent: rig::agent::Agent<M>,
    model: String,
}

impl<M: CompletionModel> LlmStepper<M> {
    pub fn model_name(&self) -> &str {
        &self.model
    }
}

/// Build a stepper on Anthropic's API.
pub fn create_anthropic_stepper(
    config: &LlmConfig,
) -> Result<LlmStepper<impl CompletionModel + 'static>, LlmError> {
    use rig::providers::anthropic;

    let client: rig::client::Client<anthropic::client::AnthropicExt> =
        anthropic::Client::new(config.api_key.expose_secret()).map_err(|e| {
            LlmError::RequestFailed {
                provider: "anthropic".to_string(),
                reason: format!("Failed to create Anthropic client: {}", e),
            }
        })?;

    let agent = client
        .agent(&config.model)
        .preamble(PREAMBLE)
        .max_tokens(config.max_tokens)
        .build();
    tracing::info!("Using Anthropic (model: {})", config.model);
    Ok(LlmStepper {
        agent,
        model: config.model.clone(),
    })
}

#[async_trait]
impl<M> Stepper for LlmStepper<M>
where
    M: CompletionModel + 'static,
{
    async fn step(&self, ctx: &StepContext) -> Result<StepOutcome, StepError> {
        let (prompt, history) = build_conversation(ctx);
        let history: Vec<Message> = history
            .into_iter()
            .map(|(role, content)| match role {
                Role::User => Message::user(content),
                Role::Assistant => Message::assistant(content),
            })
            .collect();

        let reply = self
            .agent
            .chat(prompt.as_str(), history)
            .await
            .map_err(classify_prompt_error)?;

        tracing::debug!(session_id = %ctx.session_id, step = ctx.step, model = %self.model, "LLM step");
        parse_turn(&reply)
    }
}

impl From<LlmError> for StepError {
    fn from(e: LlmError) -> Self {
        match e {
            LlmError::RequestFailed { .. } | LlmError::RateLimited { .. } => {
                StepError::Transient(e.to_string())
            }
            LlmError::InvalidResponse { .. } => StepError::Fatal(e.to_string()),
        }
    }
}

/// Sort a rig failure into retryable and non-retryable.
fn classify_prompt_error(e: PromptError) -> LlmError {
    match e {
        PromptError::CompletionError(CompletionError::HttpError(e)) => LlmError::RequestFailed {
            provider: "anthropic".to_string(),
            reason: e.to_string(),
        },
        PromptError::CompletionError(CompletionError::ProviderError(body)) => {
            classify_provider_error(&body)
        }
        other => LlmError::InvalidResponse {
            provider: "anthropic".to_string(),
            reason: other.to_string(),
        },
    }
}

/// Classify a non-2xx body by Anthropic's `error.type`.
///
/// Rate limits and server-side overload are retried; bad requests, auth and
/// permission failures are not. An unparseable body is treated as a
/// transport failure.
fn classify_provider_error(body: &str) -> LlmError {
    let provider = "anthropic".to_string();
    let error_type = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v["error"]["type"].as_str().map(str::to_string));

    match error_type.as_deref() {
        Some("rate_limit_error") => LlmError::RateLimited {
            provider,
            retry_after: None,
        },
        Some("api_error" | "overloaded_error") | None => LlmError::RequestFailed {
            provider,
            reason: body.to_string(),
        },
        Some(_) => LlmError::InvalidResponse {
            provider,
            reason: body.to_string(),
        },
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    User,
    Assistant,
}

/// Split the context into a prompt and prior chat history.
///
/// Input messages become history; the session's own reasoning so far is
/// replayed as assistant turns so a reclaimed session picks up where it left
/// off.
fn build_conversation(ctx: &StepContext) -> (String, Vec<(Role, String)>) {
    let mut history: Vec<(Role, String)> = ctx
        .messages
        .iter()
        .map(|m| {
            let role = if m.role == "assistant" {
                Role::Assistant
            } else {
                Role::User
            };
            (role, m.content.clone())
        })
        .collect();

    for event in &ctx.history {
        if let Ok(EventPayload::Thinking(thinking)) = event.payload() {
            history.push((Role::Assistant, thinking.content));
        }
    }

    let prompt = if ctx.history.is_empty() && matches!(history.last(), Some((Role::User, _))) {
        // The last user message is the prompt itself.
        history.pop().map(|(_, c)| c).unwrap_or_default()
    } else {
        format!("Continue with step {}.", ctx.step + 1)
    };
    (prompt, history)
}

#[derive(Debug, Default, Deserialize)]
struct Turn {
    #[serde(default)]
    thinking: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    final_answer: Option<String>,
}

fn parse_turn(reply: &str) -> Result<StepOutcome, StepError> {
    let trimmed = reply.trim();
    if trimmed.is_empty() {
        return Err(LlmError::InvalidResponse {
            provider: "anthropic".to_string(),
            reason: "empty reply".to_string(),
        }
        .into());
    }

    let json = trimmed
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();
    let Ok(turn) = serde_json::from_str::<Turn>(json) else {
        return Ok(StepOutcome::done(vec![], trimmed));
    };

    let mut events = Vec::new();
    if let Some(thinking) = turn.thinking.filter(|t| !t.is_empty()) {
        events.push(EventPayload::thinking(thinking));
    }
    if let Some(status) = turn.status.filter(|s| !s.is_empty()) {
        events.push(EventPayload::status_update(status, None));
    }

    Ok(match turn.final_answer {
        Some(answer) => StepOutcome::done(events, answer),
        None => StepOutcome::next(events),
    })
}
