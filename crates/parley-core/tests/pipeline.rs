//! End-to-end turns through the conversation handler with in-process collaborators

use async_trait::async_trait;
use parley_core::providers::types::{ChatMessage, ChatResponse};
use parley_core::{
    AgentClientService, AgentDescriptor, AgentResponse, CacheConfig, CachedChannelRoutingRepository,
    Channel, ChannelRepository, ChannelRoutingConfig, ChannelRoutingRepository, ConversationContext,
    ConversationHandler, ConversationStateStore, DisambiguationPrompts, ErrorKind, HandlerConfig,
    InMemoryStateStore, InboundTurn, KeywordAgentClassifier, LlmAgentRoutingService,
    LlmDisambiguationHandler, LlmProvider, ModeAgentRoutingService, PipelineState, Result,
    RetryPolicy, RoutingMode, RuntimeError, SelectionThresholds, TurnOutcome,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct StaticChannels(HashMap<String, Channel>);

#[async_trait]
impl ChannelRepository for StaticChannels {
    async fn lookup(&self, channel_id: &str) -> Result<Option<Channel>> {
        Ok(self.0.get(channel_id).cloned())
    }
}

struct StaticRouting(HashMap<String, ChannelRoutingConfig>);

#[async_trait]
impl ChannelRoutingRepository for StaticRouting {
    fn backend(&self) -> &str {
        "static"
    }

    async fn lookup(&self, channel_id: &str) -> Result<Option<ChannelRoutingConfig>> {
        Ok(self.0.get(channel_id).cloned())
    }
}

/// Agent client that records every dispatch
#[derive(Default)]
struct RecordingAgents {
    dispatched: Mutex<Vec<String>>,
    /// Transient failures to return before succeeding
    failures: AtomicU32,
    permanent_failure: bool,
    delay: Duration,
    active: AtomicU32,
    max_active: AtomicU32,
}

impl RecordingAgents {
    fn dispatched(&self) -> Vec<String> {
        self.dispatched.lock().unwrap().clone()
    }
}

#[async_trait]
impl AgentClientService for RecordingAgents {
    async fn send(&self, agent: &AgentDescriptor, context: &ConversationContext) -> Result<AgentResponse> {
        self.dispatched.lock().unwrap().push(agent.id.clone());
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);

        if self.permanent_failure {
            return Err(RuntimeError::dispatch(&agent.id, "status 400: rejected", false));
        }
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(RuntimeError::dispatch(&agent.id, "connection refused", true));
        }
        Ok(AgentResponse {
            agent_id: agent.id.clone(),
            content: format!("{} handled: {}", agent.id, context.user_turn),
            metadata: serde_json::Map::new(),
        })
    }
}

/// Disambiguation model that always asks the same question
struct AskingProvider {
    calls: AtomicU32,
}

#[async_trait]
impl LlmProvider for AskingProvider {
    fn provider_name(&self) -> &str {
        "asking"
    }
    fn model(&self) -> &str {
        "asking"
    }
    async fn chat(&self, _messages: &[ChatMessage], _system: &str) -> anyhow::Result<ChatResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(ChatResponse::finished(r#"{"agent": null, "question": "Are you looking to buy something, or do you need help with a problem?", "candidates": ["sales", "support"]}"#))
    }
}

struct Fixture {
    handler: ConversationHandler,
    agents: Arc<RecordingAgents>,
    store: InMemoryStateStore,
    provider: Arc<AskingProvider>,
}

fn channels() -> StaticChannels {
    StaticChannels(HashMap::from([
        ("c1".to_string(), Channel::new("c1", "acme")),
        ("c2".to_string(), Channel::new("c2", "acme")),
        ("orphan".to_string(), Channel::new("orphan", "acme")),
    ]))
}

fn routing() -> StaticRouting {
    StaticRouting(HashMap::from([
        (
            "c1".to_string(),
            ChannelRoutingConfig::new(
                "c1",
                RoutingMode::Explicit,
                vec![AgentDescriptor::new("billing", "http://billing.local")],
            ),
        ),
        (
            "c2".to_string(),
            ChannelRoutingConfig::new(
                "c2",
                RoutingMode::Llm,
                vec![
                    AgentDescriptor::new("sales", "http://sales.local")
                        .with_capabilities(["pricing", "upgrade", "purchase"]),
                    AgentDescriptor::new("support", "http://support.local")
                        .with_capabilities(["help", "broken device", "outage"]),
                ],
            ),
        ),
    ]))
}

fn handler_config() -> HandlerConfig {
    HandlerConfig {
        dispatch_retry: RetryPolicy::once(Duration::from_millis(1)),
        classifier_retry: RetryPolicy::once(Duration::from_millis(1)),
        ..HandlerConfig::default()
    }
}

fn fixture_with(agents: RecordingAgents, disambiguation: bool, llm_routing: bool) -> Fixture {
    let agents = Arc::new(agents);
    let store = InMemoryStateStore::new();
    let provider = Arc::new(AskingProvider {
        calls: AtomicU32::new(0),
    });

    let cache = Arc::new(CachedChannelRoutingRepository::new(
        Arc::new(routing()),
        CacheConfig::default(),
    ));
    let classifier = Arc::new(KeywordAgentClassifier::new(SelectionThresholds::default()));
    let llm_router: Option<Arc<dyn parley_core::AgentRoutingService>> = if llm_routing {
        Some(Arc::new(LlmAgentRoutingService::with_classifier(classifier.clone())))
    } else {
        None
    };

    let mut handler = ConversationHandler::new(
        Arc::new(channels()),
        cache,
        Arc::new(ModeAgentRoutingService::new(llm_router)),
        agents.clone(),
    )
    .with_classifier(classifier)
    .with_state_store(Arc::new(store.clone()))
    .with_config(handler_config());

    if disambiguation {
        handler = handler.with_disambiguation(Arc::new(
            LlmDisambiguationHandler::new(provider.clone(), DisambiguationPrompts::default()).with_max_rounds(2),
        ));
    }

    Fixture {
        handler,
        agents,
        store,
        provider,
    }
}

fn fixture() -> Fixture {
    fixture_with(RecordingAgents::default(), true, true)
}

#[tokio::test]
async fn explicit_channel_dispatches_configured_agent_once() {
    let f = fixture();
    let report = f
        .handler
        .handle(InboundTurn::new("conv-a", "c1", "Why was I charged twice?"))
        .await
        .unwrap();

    match &report.outcome {
        TurnOutcome::Completed { agent_id, response, fallback } => {
            assert_eq!(agent_id, "billing");
            assert_eq!(response.content, "billing handled: Why was I charged twice?");
            assert!(!fallback);
        }
        other => panic!("expected completion, got {:?}", other),
    }
    assert_eq!(
        report.trace,
        vec![
            PipelineState::Received,
            PipelineState::ChannelResolved,
            PipelineState::RoutingDecided,
            PipelineState::AgentSelected,
            PipelineState::Dispatched,
            PipelineState::Completed,
        ]
    );
    assert_eq!(f.agents.dispatched(), vec!["billing"]);
}

#[tokio::test]
async fn ambiguous_turn_clarifies_then_routes_to_support() {
    let f = fixture();

    let first = f
        .handler
        .handle(InboundTurn::new("conv-b", "c2", "I have a question").with_turn_id("t1"))
        .await
        .unwrap();
    let question = match &first.outcome {
        TurnOutcome::AwaitingClarification { question, round, candidates } => {
            assert_eq!(*round, 1);
            assert_eq!(candidates.len(), 2);
            question.clone()
        }
        other => panic!("expected clarification, got {:?}", other),
    };
    assert!(first.trace.contains(&PipelineState::Disambiguating));
    assert!(f.agents.dispatched().is_empty());

    let pending = f.store.load("conv-b").await.unwrap().unwrap();
    assert_eq!(pending.pending.as_ref().map(|p| p.round), Some(1));
    assert_eq!(pending.history.last().map(|m| m.content.clone()), Some(question));

    let second = f
        .handler
        .handle(InboundTurn::new("conv-b", "c2", "I need help with my broken device").with_turn_id("t2"))
        .await
        .unwrap();
    match &second.outcome {
        TurnOutcome::Completed { agent_id, fallback, .. } => {
            assert_eq!(agent_id, "support");
            assert!(!fallback);
        }
        other => panic!("expected completion, got {:?}", other),
    }
    assert_eq!(f.agents.dispatched(), vec!["support"]);
    assert_eq!(f.provider.calls.load(Ordering::SeqCst), 1);

    let state = f.store.load("conv-b").await.unwrap().unwrap();
    assert!(state.pending.is_none());
    assert_eq!(state.history.len(), 4);
}

#[tokio::test]
async fn unknown_channel_fails_without_dispatch() {
    let f = fixture();
    let failure = f
        .handler
        .handle(InboundTurn::new("conv-c", "nope", "hello"))
        .await
        .unwrap_err();

    assert_eq!(failure.kind(), ErrorKind::ChannelNotFoundError);
    assert_eq!(failure.trace, vec![PipelineState::Received, PipelineState::Failed]);
    assert!(f.agents.dispatched().is_empty());
}

#[tokio::test]
async fn channel_without_routing_is_not_found() {
    let f = fixture();
    let failure = f
        .handler
        .handle(InboundTurn::new("conv", "orphan", "hello"))
        .await
        .unwrap_err();
    assert_eq!(failure.kind(), ErrorKind::NotFoundError);
    assert_eq!(failure.error.status_class(), parley_core::StatusClass::Client);
}

#[tokio::test]
async fn foreign_tenant_is_treated_as_unknown_channel() {
    let f = fixture();
    let failure = f
        .handler
        .handle(InboundTurn::new("conv", "c1", "hello").with_tenant("globex"))
        .await
        .unwrap_err();
    assert_eq!(failure.kind(), ErrorKind::ChannelNotFoundError);

    let ok = f
        .handler
        .handle(InboundTurn::new("conv", "c1", "hello").with_tenant("acme"))
        .await;
    assert!(ok.is_ok());
}

#[tokio::test]
async fn clarification_rounds_are_bounded() {
    let f = fixture();
    let turns = ["hmm", "not sure", "whatever"];
    let mut outcomes = Vec::new();
    for (i, text) in turns.iter().enumerate() {
        let report = f
            .handler
            .handle(InboundTurn::new("conv-d", "c2", *text).with_turn_id(format!("t{}", i)))
            .await
            .unwrap();
        outcomes.push(report.outcome);
    }

    assert!(matches!(outcomes[0], TurnOutcome::AwaitingClarification { round: 1, .. }));
    assert!(matches!(outcomes[1], TurnOutcome::AwaitingClarification { round: 2, .. }));
    match &outcomes[2] {
        TurnOutcome::Completed { agent_id, fallback, .. } => {
            assert_eq!(agent_id, "sales");
            assert!(fallback);
        }
        other => panic!("expected forced completion, got {:?}", other),
    }
    // The bound is enforced without asking the model a third time
    assert_eq!(f.provider.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn ambiguity_without_disambiguation_falls_back_to_first_candidate() {
    let f = fixture_with(RecordingAgents::default(), false, true);
    let report = f
        .handler
        .handle(InboundTurn::new("conv", "c2", "I have a question"))
        .await
        .unwrap();
    match report.outcome {
        TurnOutcome::Completed { agent_id, fallback, .. } => {
            assert_eq!(agent_id, "sales");
            assert!(fallback);
        }
        other => panic!("expected completion, got {:?}", other),
    }
}

#[tokio::test]
async fn llm_channel_without_llm_router_is_configuration_error() {
    let f = fixture_with(RecordingAgents::default(), false, false);
    let failure = f
        .handler
        .handle(InboundTurn::new("conv", "c2", "hello"))
        .await
        .unwrap_err();
    assert_eq!(failure.kind(), ErrorKind::ConfigurationError);
    assert!(f.agents.dispatched().is_empty());
}

#[tokio::test]
async fn duplicate_turn_is_not_dispatched_twice() {
    let f = fixture();
    let turn = InboundTurn::new("conv-e", "c1", "refund please").with_turn_id("t-dup");

    f.handler.handle(turn.clone()).await.unwrap();
    let again = f.handler.handle(turn).await.unwrap();

    assert_eq!(
        again.outcome,
        TurnOutcome::Duplicate {
            turn_id: "t-dup".to_string()
        }
    );
    assert_eq!(f.agents.dispatched().len(), 1);
}

#[tokio::test]
async fn failed_turn_can_be_retried_with_same_id() {
    let agents = RecordingAgents {
        permanent_failure: true,
        ..RecordingAgents::default()
    };
    let f = fixture_with(agents, true, true);
    let turn = InboundTurn::new("conv", "c1", "hello").with_turn_id("t1");

    let failure = f.handler.handle(turn).await.unwrap_err();
    assert_eq!(failure.kind(), ErrorKind::DispatchError);

    let state = f.store.load("conv").await.unwrap();
    assert!(state.is_none_or(|s| !s.has_processed("t1")));
}

#[tokio::test]
async fn transient_dispatch_failure_is_retried_once() {
    let agents = RecordingAgents {
        failures: AtomicU32::new(1),
        ..RecordingAgents::default()
    };
    let f = fixture_with(agents, true, true);
    let report = f.handler.handle(InboundTurn::new("conv", "c1", "hello")).await.unwrap();
    assert!(matches!(report.outcome, TurnOutcome::Completed { .. }));
    assert_eq!(f.agents.dispatched().len(), 2);
}

#[tokio::test]
async fn persistent_dispatch_failure_fails_after_one_retry() {
    let agents = RecordingAgents {
        failures: AtomicU32::new(5),
        ..RecordingAgents::default()
    };
    let f = fixture_with(agents, true, true);
    let failure = f.handler.handle(InboundTurn::new("conv", "c1", "hello")).await.unwrap_err();
    assert_eq!(failure.kind(), ErrorKind::DispatchError);
    assert_eq!(f.agents.dispatched().len(), 2);
    assert_eq!(
        failure.trace.last(),
        Some(&PipelineState::Failed)
    );
}

#[tokio::test]
async fn deadline_expiry_is_timeout() {
    let agents = RecordingAgents {
        delay: Duration::from_millis(500),
        ..RecordingAgents::default()
    };
    let f = fixture_with(agents, true, true);
    let failure = f
        .handler
        .handle(InboundTurn::new("conv", "c1", "hello").with_deadline(Duration::from_millis(50)))
        .await
        .unwrap_err();

    assert_eq!(failure.kind(), ErrorKind::TimeoutError);
    assert_eq!(
        failure.trace,
        vec![
            PipelineState::Received,
            PipelineState::ChannelResolved,
            PipelineState::RoutingDecided,
            PipelineState::AgentSelected,
            PipelineState::Failed,
        ]
    );
}

#[tokio::test]
async fn unbounded_deadline_is_clamped() {
    let f = fixture();
    let report = f
        .handler
        .handle(InboundTurn::new("conv-max", "c1", "hello").with_deadline(Duration::MAX))
        .await
        .unwrap();

    assert!(matches!(report.outcome, TurnOutcome::Completed { .. }));
    assert_eq!(f.agents.dispatched(), vec!["billing"]);
}

#[tokio::test]
async fn same_conversation_turns_are_serialized() {
    let agents = RecordingAgents {
        delay: Duration::from_millis(10),
        ..RecordingAgents::default()
    };
    let f = Arc::new(fixture_with(agents, true, true));

    let mut handles = Vec::new();
    for i in 0..6 {
        let f = Arc::clone(&f);
        handles.push(tokio::spawn(async move {
            f.handler
                .handle(InboundTurn::new("conv-serial", "c1", format!("message {}", i)))
                .await
        }));
    }
    for handle in handles {
        assert!(handle.await.unwrap().is_ok());
    }

    assert_eq!(f.agents.dispatched().len(), 6);
    assert_eq!(f.agents.max_active.load(Ordering::SeqCst), 1);
    let state = f.store.load("conv-serial").await.unwrap().unwrap();
    assert_eq!(state.history.len(), 12);
}

#[tokio::test]
async fn different_conversations_run_in_parallel() {
    let agents = RecordingAgents {
        delay: Duration::from_millis(50),
        ..RecordingAgents::default()
    };
    let f = Arc::new(fixture_with(agents, true, true));

    let mut handles = Vec::new();
    for i in 0..4 {
        let f = Arc::clone(&f);
        handles.push(tokio::spawn(async move {
            f.handler
                .handle(InboundTurn::new(format!("conv-{}", i), "c1", "hello"))
                .await
        }));
    }
    for handle in handles {
        assert!(handle.await.unwrap().is_ok());
    }
    assert!(f.agents.max_active.load(Ordering::SeqCst) > 1);
}
