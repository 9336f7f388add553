//! LLM-backed agent classifier

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use super::{
    AgentClassifierService, ClassificationResult, RankedCandidate, SelectionThresholds,
    describe_agents, extract_json_object,
};
use crate::error::{Result, RuntimeError, is_retryable_message};
use crate::providers::LlmProvider;
use crate::types::{AgentDescriptor, ConversationContext};

const SYSTEM_PROMPT: &str = "You route customer conversations to the agent best able to handle them. \
Respond with ONLY valid JSON, no explanation.";

/// Messages of history included in the prompt
const DEFAULT_HISTORY_LIMIT: usize = 20;

pub struct LlmAgentClassifier {
    provider: Arc<dyn LlmProvider>,
    thresholds: SelectionThresholds,
    history_limit: usize,
}

impl LlmAgentClassifier {
    pub fn new(provider: Arc<dyn LlmProvider>) -> Self {
        Self {
            provider,
            thresholds: SelectionThresholds::default(),
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }

    pub fn with_thresholds(mut self, thresholds: SelectionThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    fn build_prompt(&self, context: &ConversationContext, candidates: &[AgentDescriptor]) -> String {
        format!(
            r#"Rate how well each agent fits the conversation below.

Agents:
{agents}

Conversation:
{transcript}

JSON schema to follow:
{{
  "agents": [{{"id": "<agent id>", "confidence": <0.0 to 1.0>}}]
}}

Rules:
- use only the agent ids listed above
- confidence is how certain you are the agent can resolve the user's request
- when the request could belong to several agents, give them similar confidence

JSON:"#,
            agents = describe_agents(candidates),
            transcript = context.transcript(self.history_limit),
        )
    }
}

/// Parse the model's ranking, keeping only known candidates.
///
/// Candidates the model did not mention are appended with zero confidence.
/// Returns `None` when the output holds no usable JSON object.
fn parse_ranking(text: &str, candidates: &[AgentDescriptor]) -> Option<Vec<RankedCandidate>> {
    let value = extract_json_object(text)?;
    let entries = value
        .get("agents")
        .or_else(|| value.get("candidates"))
        .and_then(|v| v.as_array())?;

    let mut ranked: Vec<RankedCandidate> = Vec::new();
    for entry in entries {
        let id = entry
            .get("id")
            .or_else(|| entry.get("agent_id"))
            .or_else(|| entry.get("agent"))
            .and_then(|v| v.as_str());
        let Some(id) = id else { continue };
        if !candidates.iter().any(|c| c.id == id) || ranked.iter().any(|r| r.agent_id == id) {
            debug!("Ignoring unknown or repeated agent '{}' in classifier output", id);
            continue;
        }
        let confidence = entry
            .get("confidence")
            .or_else(|| entry.get("score"))
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0) as f32;
        ranked.push(RankedCandidate::new(id, confidence));
    }

    for candidate in candidates {
        if !ranked.iter().any(|r| r.agent_id == candidate.id) {
            ranked.push(RankedCandidate::new(candidate.id.clone(), 0.0));
        }
    }
    Some(ranked)
}

#[async_trait]
impl AgentClassifierService for LlmAgentClassifier {
    fn name(&self) -> &str {
        "llm"
    }

    async fn classify(
        &self,
        context: &ConversationContext,
        candidates: &[AgentDescriptor],
    ) -> Result<ClassificationResult> {
        match candidates {
            [] => return Err(RuntimeError::classifier("no candidate agents", false)),
            [only] => {
                return Ok(ClassificationResult::selected(
                    only.id.clone(),
                    vec![RankedCandidate::new(only.id.clone(), 1.0)],
                ));
            }
            _ => {}
        }

        let prompt = self.build_prompt(context, candidates);
        let text = self
            .provider
            .complete(SYSTEM_PROMPT, &prompt)
            .await
            .map_err(|e| {
                let cause = format!("{:#}", e);
                let transient = is_retryable_message(&cause);
                RuntimeError::classifier(cause, transient)
            })?;

        let ranked = parse_ranking(&text, candidates).ok_or_else(|| {
            debug!("Unparseable classifier output: {:?}", text);
            RuntimeError::classifier("model returned no JSON ranking", false)
        })?;

        let result = self.thresholds.select(ranked);
        debug!(
            "LLM classification for conversation {}: selected={:?}, candidates={:?}",
            context.conversation_id,
            result.selected,
            result.candidate_ids()
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::providers::types::{ChatMessage, ChatResponse};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Provider that returns a canned reply and records prompts
    struct CannedProvider {
        reply: std::result::Result<String, String>,
        calls: AtomicU32,
        last_prompt: Mutex<String>,
    }

    impl CannedProvider {
        fn ok(reply: &str) -> Arc<Self> {
            Arc::new(Self {
                reply: Ok(reply.to_string()),
                calls: AtomicU32::new(0),
                last_prompt: Mutex::new(String::new()),
            })
        }

        fn failing(error: &str) -> Arc<Self> {
            Arc::new(Self {
                reply: Err(error.to_string()),
                calls: AtomicU32::new(0),
                last_prompt: Mutex::new(String::new()),
            })
        }
    }

    #[async_trait]
    impl LlmProvider for CannedProvider {
        fn provider_name(&self) -> &str {
            "canned"
        }
        fn model(&self) -> &str {
            "canned-model"
        }
        async fn chat(&self, messages: &[ChatMessage], _system: &str) -> anyhow::Result<ChatResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_prompt.lock().unwrap() = messages[0].content.clone();
            match &self.reply {
                Ok(text) => Ok(ChatResponse::finished(text.clone())),
                Err(e) => Err(anyhow::anyhow!("{}", e)),
            }
        }
    }

    fn agents() -> Vec<AgentDescriptor> {
        vec![
            AgentDescriptor::new("sales", "http://sales").with_description("New contracts and upgrades"),
            AgentDescriptor::new("support", "http://support").with_capabilities(["troubleshooting"]),
        ]
    }

    fn context(text: &str) -> ConversationContext {
        ConversationContext {
            conversation_id: "conv-1".to_string(),
            channel_id: "c2".to_string(),
            tenant_id: "acme".to_string(),
            turn_id: "t1".to_string(),
            history: vec![],
            user_turn: text.to_string(),
        }
    }

    #[tokio::test]
    async fn test_decisive_ranking() {
        let provider = CannedProvider::ok(r#"{"agents":[{"id":"support","confidence":0.92},{"id":"sales","confidence":0.1}]}"#);
        let classifier = LlmAgentClassifier::new(provider.clone());
        let result = classifier.classify(&context("my router is broken"), &agents()).await.unwrap();
        assert_eq!(result.selected.as_deref(), Some("support"));

        let prompt = provider.last_prompt.lock().unwrap().clone();
        assert!(prompt.contains("- sales: New contracts and upgrades"));
        assert!(prompt.contains("user: my router is broken"));
    }

    #[tokio::test]
    async fn test_ambiguous_ranking() {
        let provider = CannedProvider::ok(
            "Here you go:\n{\"agents\":[{\"id\":\"sales\",\"confidence\":0.5},{\"id\":\"support\",\"confidence\":0.5}]}",
        );
        let classifier = LlmAgentClassifier::new(provider);
        let result = classifier.classify(&context("I have a question"), &agents()).await.unwrap();
        assert!(result.is_ambiguous());
        assert_eq!(result.candidate_ids(), vec!["sales", "support"]);
    }

    #[tokio::test]
    async fn test_single_candidate_skips_model() {
        let provider = CannedProvider::ok("{}");
        let classifier = LlmAgentClassifier::new(provider.clone());
        let only = vec![AgentDescriptor::new("billing", "http://billing")];
        let result = classifier.classify(&context("hi"), &only).await.unwrap();
        assert_eq!(result.selected.as_deref(), Some("billing"));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_no_candidates_is_error() {
        let classifier = LlmAgentClassifier::new(CannedProvider::ok("{}"));
        let err = classifier.classify(&context("hi"), &[]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ClassifierError);
    }

    #[tokio::test]
    async fn test_provider_error_transience() {
        let classifier = LlmAgentClassifier::new(CannedProvider::failing("status 503: overloaded"));
        let err = classifier.classify(&context("hi"), &agents()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ClassifierError);
        assert!(err.is_transient());

        let classifier = LlmAgentClassifier::new(CannedProvider::failing("status 401: bad key"));
        let err = classifier.classify(&context("hi"), &agents()).await.unwrap_err();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_garbage_output_is_error() {
        let classifier = LlmAgentClassifier::new(CannedProvider::ok("I think support?"));
        let err = classifier.classify(&context("hi"), &agents()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ClassifierError);
        assert!(!err.is_transient());
    }

    #[test]
    fn test_parse_ranking_tolerates_unknown_and_missing() {
        let ranked = parse_ranking(
            r#"{"agents":[{"agent_id":"ghost","confidence":0.9},{"agent":"support","score":0.6}]}"#,
            &agents(),
        )
        .unwrap();
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].agent_id, "support");
        assert!((ranked[0].confidence - 0.6).abs() < f32::EPSILON);
        assert_eq!(ranked[1].agent_id, "sales");
        assert_eq!(ranked[1].confidence, 0.0);
    }

    #[test]
    fn test_parse_ranking_requires_agents_array() {
        assert!(parse_ranking(r#"{"selected":"sales"}"#, &agents()).is_none());
    }
}
