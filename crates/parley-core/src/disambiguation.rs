//! Clarification dialogue for conversations that match several agents
//!
//! Each clarification is a suspend point: the pipeline persists the
//! [`DisambiguationState`] and returns the question to the user. The next
//! user turn re-classifies over the persisted candidates and, if still
//! ambiguous, comes back here with `round` incremented.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::classifier::{RankedCandidate, describe_agents, extract_json_object};
use crate::error::{Result, RuntimeError, is_retryable_message};
use crate::providers::LlmProvider;
use crate::types::{AgentDescriptor, ConversationContext};

/// Clarification progress for one conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisambiguationState {
    /// Remaining candidates, highest confidence first
    pub candidates: Vec<RankedCandidate>,
    /// Clarification questions asked so far
    pub round: u32,
    #[serde(default)]
    pub last_question: Option<String>,
    pub started_at: DateTime<Utc>,
}

impl DisambiguationState {
    pub fn new(candidates: Vec<RankedCandidate>) -> Self {
        Self {
            candidates,
            round: 0,
            last_question: None,
            started_at: Utc::now(),
        }
    }

    pub fn candidate_ids(&self) -> Vec<&str> {
        self.candidates.iter().map(|c| c.agent_id.as_str()).collect()
    }

    pub fn top(&self) -> Option<&RankedCandidate> {
        self.candidates.first()
    }

    /// State after asking `question` with the narrowed `candidates`
    pub fn next_round(&self, question: String, candidates: Vec<RankedCandidate>) -> Self {
        Self {
            candidates,
            round: self.round + 1,
            last_question: Some(question),
            started_at: self.started_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DisambiguationOutcome {
    /// `fallback` is set when the pick was forced (round bound reached or
    /// unusable model output) rather than decided from the conversation
    Resolved { agent_id: String, fallback: bool },
    Clarify {
        question: String,
        candidates: Vec<RankedCandidate>,
    },
}

#[async_trait]
pub trait DisambiguationHandler: Send + Sync {
    /// Clarification rounds allowed before the top candidate is picked
    fn max_rounds(&self) -> u32;

    /// `candidates` are the descriptors for `state.candidates`, same order
    async fn disambiguate(
        &self,
        context: &ConversationContext,
        candidates: &[AgentDescriptor],
        state: &DisambiguationState,
    ) -> Result<DisambiguationOutcome>;
}

/// Top candidate as a forced resolution, if there is one
pub fn resolve_top(state: &DisambiguationState) -> Option<DisambiguationOutcome> {
    state.top().map(|top| DisambiguationOutcome::Resolved {
        agent_id: top.agent_id.clone(),
        fallback: true,
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisambiguationPrompts {
    /// System prompt for the first round
    #[serde(default = "default_introduction")]
    pub introduction: String,
    /// System prompt for follow-up rounds
    #[serde(default = "default_clarification")]
    pub clarification: String,
}

fn default_introduction() -> String {
    "You help route a customer to the right specialist. Several specialists could handle \
the request. If the conversation already makes the right one clear, pick it. Otherwise ask \
the customer one short, friendly question that tells the specialists apart. \
Respond with ONLY valid JSON."
        .to_string()
}

fn default_clarification() -> String {
    "You already asked the customer a clarifying question and they replied. Use their answer \
to pick the right specialist. If it is still unclear, ask one more short question that \
narrows the choice further. Respond with ONLY valid JSON."
        .to_string()
}

impl Default for DisambiguationPrompts {
    fn default() -> Self {
        Self {
            introduction: default_introduction(),
            clarification: default_clarification(),
        }
    }
}

/// Messages of history included in the prompt
const DEFAULT_HISTORY_LIMIT: usize = 20;

pub struct LlmDisambiguationHandler {
    provider: Arc<dyn LlmProvider>,
    prompts: DisambiguationPrompts,
    max_rounds: u32,
    history_limit: usize,
}

impl LlmDisambiguationHandler {
    pub fn new(provider: Arc<dyn LlmProvider>, prompts: DisambiguationPrompts) -> Self {
        Self {
            provider,
            prompts,
            max_rounds: 2,
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }

    pub fn with_max_rounds(mut self, max_rounds: u32) -> Self {
        self.max_rounds = max_rounds;
        self
    }

    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    fn system_prompt(&self, state: &DisambiguationState) -> &str {
        if state.round == 0 {
            &self.prompts.introduction
        } else {
            &self.prompts.clarification
        }
    }

    fn build_prompt(
        &self,
        context: &ConversationContext,
        candidates: &[AgentDescriptor],
        state: &DisambiguationState,
    ) -> String {
        let previous = state
            .last_question
            .as_deref()
            .map(|q| format!("\nYour previous question: {}\n", q))
            .unwrap_or_default();

        format!(
            r#"Specialists:
{agents}

Conversation:
{transcript}
{previous}
JSON schema to follow:
{{
  "agent": "<specialist id if clear, otherwise null>",
  "question": "<question for the customer if not clear, otherwise null>",
  "candidates": ["<ids still in question>"]
}}

JSON:"#,
            agents = describe_agents(candidates),
            transcript = context.transcript(self.history_limit),
            previous = previous,
        )
    }
}

/// Interpret the model's answer against the current state
fn parse_outcome(text: &str, state: &DisambiguationState) -> Option<DisambiguationOutcome> {
    let value = extract_json_object(text)?;

    if let Some(agent) = value.get("agent").and_then(|v| v.as_str()) {
        if state.candidates.iter().any(|c| c.agent_id == agent) {
            return Some(DisambiguationOutcome::Resolved {
                agent_id: agent.to_string(),
                fallback: false,
            });
        }
        debug!("Disambiguation picked unknown agent '{}'", agent);
    }

    let question = value
        .get("question")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|q| !q.is_empty())?;

    // Narrow to the ids the model kept, preserving ranking order
    let kept: Vec<&str> = value
        .get("candidates")
        .and_then(|v| v.as_array())
        .map(|arr| arr.iter().filter_map(|v| v.as_str()).collect())
        .unwrap_or_default();
    let narrowed: Vec<RankedCandidate> = state
        .candidates
        .iter()
        .filter(|c| kept.contains(&c.agent_id.as_str()))
        .cloned()
        .collect();

    Some(DisambiguationOutcome::Clarify {
        question: question.to_string(),
        candidates: if narrowed.len() > 1 {
            narrowed
        } else {
            state.candidates.clone()
        },
    })
}

#[async_trait]
impl DisambiguationHandler for LlmDisambiguationHandler {
    fn max_rounds(&self) -> u32 {
        self.max_rounds
    }

    async fn disambiguate(
        &self,
        context: &ConversationContext,
        candidates: &[AgentDescriptor],
        state: &DisambiguationState,
    ) -> Result<DisambiguationOutcome> {
        if state.round >= self.max_rounds {
            debug!(
                "Disambiguation for {} reached {} rounds, picking top candidate",
                context.conversation_id, state.round
            );
            return resolve_top(state)
                .ok_or_else(|| RuntimeError::classifier("no candidates left to disambiguate", false));
        }

        let prompt = self.build_prompt(context, candidates, state);
        let text = self
            .provider
            .complete(self.system_prompt(state), &prompt)
            .await
            .map_err(|e| {
                let cause = format!("{:#}", e);
                let transient = is_retryable_message(&cause);
                RuntimeError::classifier(cause, transient)
            })?;

        match parse_outcome(&text, state) {
            Some(outcome) => Ok(outcome),
            None => {
                warn!(
                    "Unusable disambiguation output for {}, picking top candidate: {:?}",
                    context.conversation_id, text
                );
                resolve_top(state)
                    .ok_or_else(|| RuntimeError::classifier("no candidates left to disambiguate", false))
            }
        }
    }
}
