//! Keyword classifier: scores capability tags against the user's words.
//! No model call, so it suits deployments without an LLM and tests.

use async_trait::async_trait;
use std::collections::HashSet;
use tracing::debug;

use super::{AgentClassifierService, ClassificationResult, RankedCandidate, SelectionThresholds};
use crate::error::{Result, RuntimeError};
use crate::types::{AgentDescriptor, ConversationContext};

/// Words shorter than this are ignored on both sides
const MIN_TERM_LEN: usize = 3;

#[derive(Debug, Default)]
pub struct KeywordAgentClassifier {
    thresholds: SelectionThresholds,
}

impl KeywordAgentClassifier {
    pub fn new(thresholds: SelectionThresholds) -> Self {
        Self { thresholds }
    }
}

fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() >= MIN_TERM_LEN)
        .map(|w| w.to_lowercase())
}

/// Terms an agent answers to: its id and capability tags
fn agent_terms(agent: &AgentDescriptor) -> HashSet<String> {
    std::iter::once(agent.id.as_str())
        .chain(agent.capabilities.iter().map(String::as_str))
        .flat_map(tokenize)
        .collect()
}

/// Crude stemming so "invoices" matches "invoice" and "billing" matches "bill"
fn matches(term: &str, word: &str) -> bool {
    term == word
        || (term.len() > MIN_TERM_LEN && word.starts_with(term))
        || (word.len() > MIN_TERM_LEN && term.starts_with(word))
}

#[async_trait]
impl AgentClassifierService for KeywordAgentClassifier {
    fn name(&self) -> &str {
        "keyword"
    }

    async fn classify(
        &self,
        context: &ConversationContext,
        candidates: &[AgentDescriptor],
    ) -> Result<ClassificationResult> {
        if candidates.is_empty() {
            return Err(RuntimeError::classifier("no candidate agents", false));
        }

        let words: HashSet<String> = tokenize(&context.user_text()).collect();
        let scores: Vec<(&str, usize)> = candidates
            .iter()
            .map(|agent| {
                let hits = agent_terms(agent)
                    .iter()
                    .filter(|term| words.iter().any(|w| matches(term, w)))
                    .count();
                (agent.id.as_str(), hits)
            })
            .collect();

        let total: usize = scores.iter().map(|(_, s)| s).sum();
        let ranked = scores
            .iter()
            .map(|(id, hits)| {
                let confidence = if total == 0 {
                    0.0
                } else {
                    *hits as f32 / total as f32
                };
                RankedCandidate::new(*id, confidence)
            })
            .collect();

        let result = if candidates.len() == 1 {
            ClassificationResult::selected(candidates[0].id.clone(), ranked)
        } else {
            self.thresholds.select(ranked)
        };
        debug!(
            "Keyword classification for conversation {}: {:?}",
            context.conversation_id, scores
        );
        Ok(result)
    }
}
