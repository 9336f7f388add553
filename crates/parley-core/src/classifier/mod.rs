//! Conversation classification against candidate agents
//!
//! A classifier ranks candidates by confidence; [`SelectionThresholds`]
//! turns that ranking into either a single winner or the plausible subset
//! that still needs disambiguation.

pub mod keyword;
pub mod llm;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::{AgentDescriptor, ConversationContext};

pub use keyword::KeywordAgentClassifier;
pub use llm::LlmAgentClassifier;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedCandidate {
    pub agent_id: String,
    /// 0.0..=1.0
    pub confidence: f32,
}

impl RankedCandidate {
    pub fn new(agent_id: impl Into<String>, confidence: f32) -> Self {
        Self {
            agent_id: agent_id.into(),
            confidence: confidence.clamp(0.0, 1.0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    /// Unique winner, if the ranking was decisive
    pub selected: Option<String>,
    /// Highest confidence first. When nothing was selected this is the
    /// plausible subset rather than the full ranking.
    pub candidates: Vec<RankedCandidate>,
}

impl ClassificationResult {
    pub fn selected(agent_id: impl Into<String>, candidates: Vec<RankedCandidate>) -> Self {
        Self {
            selected: Some(agent_id.into()),
            candidates,
        }
    }

    pub fn is_ambiguous(&self) -> bool {
        self.selected.is_none()
    }

    pub fn top(&self) -> Option<&RankedCandidate> {
        self.candidates.first()
    }

    pub fn candidate_ids(&self) -> Vec<String> {
        self.candidates.iter().map(|c| c.agent_id.clone()).collect()
    }
}

/// Decides when a ranking is decisive
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SelectionThresholds {
    /// Top candidate needs at least this confidence to win outright
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f32,
    /// ...and must lead the runner-up by at least this much
    #[serde(default = "default_min_margin")]
    pub min_margin: f32,
    /// Candidates below this are not kept in the plausible subset
    #[serde(default = "default_candidate_floor")]
    pub candidate_floor: f32,
}

fn default_min_confidence() -> f32 {
    0.7
}
fn default_min_margin() -> f32 {
    0.2
}
fn default_candidate_floor() -> f32 {
    0.2
}

impl Default for SelectionThresholds {
    fn default() -> Self {
        Self {
            min_confidence: default_min_confidence(),
            min_margin: default_min_margin(),
            candidate_floor: default_candidate_floor(),
        }
    }
}

impl SelectionThresholds {
    /// Sort `ranked` (stable, so ties keep configured order) and pick a winner
    /// or the plausible subset. With at most one plausible candidate left the
    /// whole ranking is returned so disambiguation still has a choice to offer.
    pub fn select(&self, mut ranked: Vec<RankedCandidate>) -> ClassificationResult {
        ranked.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

        let Some(top) = ranked.first() else {
            return ClassificationResult {
                selected: None,
                candidates: ranked,
            };
        };
        let runner_up = ranked.get(1).map_or(0.0, |c| c.confidence);

        if top.confidence >= self.min_confidence && top.confidence - runner_up >= self.min_margin {
            let winner = top.agent_id.clone();
            return ClassificationResult::selected(winner, ranked);
        }

        let plausible: Vec<RankedCandidate> = ranked
            .iter()
            .filter(|c| c.confidence >= self.candidate_floor)
            .cloned()
            .collect();

        ClassificationResult {
            selected: None,
            candidates: if plausible.len() > 1 { plausible } else { ranked },
        }
    }
}

/// Ranks candidate agents for a conversation
#[async_trait]
pub trait AgentClassifierService: Send + Sync {
    fn name(&self) -> &str;

    /// `candidates` is non-empty and in configured order
    async fn classify(
        &self,
        context: &ConversationContext,
        candidates: &[AgentDescriptor],
    ) -> Result<ClassificationResult>;
}

/// Extract the first `{...}` object from free-form model output
pub(crate) fn extract_json_object(text: &str) -> Option<serde_json::Value> {
    // Models like to wrap JSON in prose or code fences
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end < start {
        return None;
    }
    serde_json::from_str(&text[start..=end]).ok()
}

/// Bullet list of agents for prompts
pub(crate) fn describe_agents(candidates: &[AgentDescriptor]) -> String {
    candidates
        .iter()
        .map(|a| {
            let mut line = format!("- {}", a.id);
            if a.name.is_some() {
                line.push_str(&format!(" ({})", a.display_name()));
            }
            if !a.description.is_empty() {
                line.push_str(&format!(": {}", a.description));
            }
            if !a.capabilities.is_empty() {
                line.push_str(&format!(" [capabilities: {}]", a.capabilities.join(", ")));
            }
            line
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ranked(pairs: &[(&str, f32)]) -> Vec<RankedCandidate> {
        pairs.iter().map(|(id, c)| RankedCandidate::new(*id, *c)).collect()
    }

    #[test]
    fn test_decisive_ranking_selects_winner() {
        let result = SelectionThresholds::default().select(ranked(&[("sales", 0.1), ("support", 0.9)]));
        assert_eq!(result.selected.as_deref(), Some("support"));
        assert_eq!(result.candidates[0].agent_id, "support");
        assert!(!result.is_ambiguous());
    }

    #[test]
    fn test_close_ranking_is_ambiguous() {
        let result = SelectionThresholds::default().select(ranked(&[
            ("sales", 0.5),
            ("support", 0.45),
            ("billing", 0.05),
        ]));
        assert!(result.is_ambiguous());
        assert_eq!(result.candidate_ids(), vec!["sales", "support"]);
    }

    #[test]
    fn test_low_confidence_with_margin_is_ambiguous() {
        // Leads comfortably but is not confident enough on its own
        let result = SelectionThresholds::default().select(ranked(&[("sales", 0.5), ("support", 0.1)]));
        assert!(result.is_ambiguous());
        // Only one plausible candidate, so the full ranking comes back
        assert_eq!(result.candidate_ids(), vec!["sales", "support"]);
    }

    #[test]
    fn test_ties_keep_configured_order() {
        let result = SelectionThresholds::default().select(ranked(&[("sales", 0.5), ("support", 0.5)]));
        assert_eq!(result.candidate_ids(), vec!["sales", "support"]);
    }

    #[test]
    fn test_empty_ranking() {
        let result = SelectionThresholds::default().select(vec![]);
        assert!(result.is_ambiguous());
        assert!(result.top().is_none());
    }

    #[test]
    fn test_confidence_clamped() {
        assert_eq!(RankedCandidate::new("a", 1.7).confidence, 1.0);
        assert_eq!(RankedCandidate::new("a", -0.3).confidence, 0.0);
    }

    #[test]
    fn test_extract_json_object() {
        let text = "Sure! ```json\n{\"agents\": []}\n``` hope that helps";
        let value = extract_json_object(text).unwrap();
        assert!(value.get("agents").is_some());
        assert!(extract_json_object("no json here").is_none());
        assert!(extract_json_object("} backwards {").is_none());
    }

    #[test]
    fn test_describe_agents() {
        let agents = vec![
            AgentDescriptor::new("billing", "http://billing")
                .with_description("Invoices and payments")
                .with_capabilities(["refunds", "invoices"]),
        ];
        let text = describe_agents(&agents);
        assert_eq!(
            text,
            "- billing: Invoices and payments [capabilities: refunds, invoices]"
        );
    }
}
