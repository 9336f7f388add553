//! Conversation handler: the per-turn routing pipeline
//!
//! ```text
//! RECEIVED -> CHANNEL_RESOLVED -> ROUTING_DECIDED -> (DISAMBIGUATING)* ->
//!     AGENT_SELECTED -> DISPATCHED -> COMPLETED | FAILED
//! ```
//!
//! Turns of the same conversation run one at a time in arrival order; turns
//! of different conversations run in parallel. Every stage that waits on a
//! collaborator is bounded by the turn's deadline.

use dashmap::DashMap;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::cache::CachedChannelRoutingRepository;
use crate::classifier::{AgentClassifierService, RankedCandidate};
use crate::disambiguation::{DisambiguationHandler, DisambiguationOutcome, DisambiguationState, resolve_top};
use crate::error::{ErrorKind, Result, RuntimeError};
use crate::repository::{AgentClientService, ChannelRepository};
use crate::retry::{RetryPolicy, retry_transient};
use crate::routing::{AgentRoutingService, RoutingDecision};
use crate::state::{ConversationState, ConversationStateStore, InMemoryStateStore};
use crate::types::{
    AgentResponse, Channel, ChannelRoutingConfig, ConversationContext, ConversationMessage,
    InboundTurn, RoutingMode,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineState {
    Received,
    ChannelResolved,
    RoutingDecided,
    Disambiguating,
    AgentSelected,
    Dispatched,
    Completed,
    Failed,
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Received => "RECEIVED",
            Self::ChannelResolved => "CHANNEL_RESOLVED",
            Self::RoutingDecided => "ROUTING_DECIDED",
            Self::Disambiguating => "DISAMBIGUATING",
            Self::AgentSelected => "AGENT_SELECTED",
            Self::Dispatched => "DISPATCHED",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        };
        write!(f, "{}", name)
    }
}

/// Longer caller deadlines are clamped; `Duration::MAX` means "no deadline"
const MAX_TURN_BUDGET: Duration = Duration::from_secs(365 * 24 * 60 * 60);

pub fn render_trace(trace: &[PipelineState]) -> String {
    trace
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" -> ")
}

#[derive(Debug, Clone)]
pub struct HandlerConfig {
    /// Turn budget when the caller supplies none
    pub default_deadline: Duration,
    pub dispatch_retry: RetryPolicy,
    /// Retry for transient classifier errors when re-classifying after a clarification
    pub classifier_retry: RetryPolicy,
    /// Messages kept per conversation
    pub history_limit: usize,
    /// Processed turn ids remembered for deduplication
    pub dedup_window: usize,
    /// Idle time after which a conversation starts over
    pub conversation_ttl: Duration,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            default_deadline: Duration::from_secs(60),
            dispatch_retry: RetryPolicy::once(Duration::from_millis(250)),
            classifier_retry: RetryPolicy::once(Duration::from_millis(250)),
            history_limit: 50,
            dedup_window: 64,
            conversation_ttl: Duration::from_secs(24 * 3600),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    Completed {
        agent_id: String,
        response: AgentResponse,
        /// The agent was picked without a decisive classification
        fallback: bool,
    },
    /// Suspended: `question` goes back to the user, the answer resumes routing
    AwaitingClarification {
        question: String,
        round: u32,
        candidates: Vec<RankedCandidate>,
    },
    /// The turn id was already processed for this conversation
    Duplicate { turn_id: String },
}

#[derive(Debug, Clone)]
pub struct TurnReport {
    pub outcome: TurnOutcome,
    pub trace: Vec<PipelineState>,
}

/// A turn that ended in FAILED
#[derive(Debug, Clone, thiserror::Error)]
#[error("{error}")]
pub struct PipelineFailure {
    pub error: RuntimeError,
    pub trace: Vec<PipelineState>,
}

impl PipelineFailure {
    pub fn kind(&self) -> ErrorKind {
        self.error.kind()
    }
}

/// FIFO async lock per conversation id; idle entries are dropped on release
#[derive(Default)]
struct ConversationLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

struct ConversationGuard<'a> {
    locks: &'a DashMap<String, Arc<Mutex<()>>>,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for ConversationGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        // Only the map still holds the mutex: nobody is waiting
        self.locks.remove_if(&self.key, |_, m| Arc::strong_count(m) == 1);
    }
}

impl ConversationLocks {
    async fn acquire(&self, conversation_id: &str) -> ConversationGuard<'_> {
        let mutex = Arc::clone(&*self.locks.entry(conversation_id.to_string()).or_default());
        let guard = mutex.lock_owned().await;
        ConversationGuard {
            locks: &self.locks,
            key: conversation_id.to_string(),
            guard: Some(guard),
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.len()
    }
}

async fn within<T, F>(deadline: Instant, stage: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout_at(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(RuntimeError::timeout(stage)),
    }
}

/// Where routing landed for this turn
enum Selection {
    Agent { agent_id: String, fallback: bool },
    Clarify { question: String, state: DisambiguationState },
}

pub struct ConversationHandler {
    channels: Arc<dyn ChannelRepository>,
    routing: Arc<CachedChannelRoutingRepository>,
    router: Arc<dyn AgentRoutingService>,
    classifier: Option<Arc<dyn AgentClassifierService>>,
    disambiguation: Option<Arc<dyn DisambiguationHandler>>,
    agents: Arc<dyn AgentClientService>,
    store: Arc<dyn ConversationStateStore>,
    locks: ConversationLocks,
    config: HandlerConfig,
}

impl ConversationHandler {
    pub fn new(
        channels: Arc<dyn ChannelRepository>,
        routing: Arc<CachedChannelRoutingRepository>,
        router: Arc<dyn AgentRoutingService>,
        agents: Arc<dyn AgentClientService>,
    ) -> Self {
        Self {
            channels,
            routing,
            router,
            classifier: None,
            disambiguation: None,
            agents,
            store: Arc::new(InMemoryStateStore::new()),
            locks: ConversationLocks::default(),
            config: HandlerConfig::default(),
        }
    }

    /// Classifier used to re-rank the remaining candidates after a clarification
    pub fn with_classifier(mut self, classifier: Arc<dyn AgentClassifierService>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn with_disambiguation(mut self, handler: Arc<dyn DisambiguationHandler>) -> Self {
        self.disambiguation = Some(handler);
        self
    }

    pub fn with_state_store(mut self, store: Arc<dyn ConversationStateStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_config(mut self, config: HandlerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn routing_cache(&self) -> &Arc<CachedChannelRoutingRepository> {
        &self.routing
    }

    pub fn disambiguation_enabled(&self) -> bool {
        self.disambiguation.is_some()
    }

    /// Drop conversations idle past the configured TTL
    pub async fn purge_expired(&self) -> Result<usize> {
        self.store.purge_expired(self.config.conversation_ttl).await
    }

    /// Run one inbound turn through the pipeline
    pub async fn handle(&self, turn: InboundTurn) -> std::result::Result<TurnReport, PipelineFailure> {
        let budget = turn.deadline.unwrap_or(self.config.default_deadline);
        let deadline = Instant::now() + budget.min(MAX_TURN_BUDGET);
        let mut trace = vec![PipelineState::Received];
        debug!(
            "Turn {} received for conversation {} on channel '{}'",
            turn.turn_id, turn.conversation_id, turn.channel_id
        );

        let result = match within(deadline, "conversation lock", async {
            Ok(self.locks.acquire(&turn.conversation_id).await)
        })
        .await
        {
            Ok(_guard) => self.run(&turn, deadline, &mut trace).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(outcome) => {
                match &outcome {
                    TurnOutcome::Completed { agent_id, fallback, .. } => info!(
                        "Conversation {} turn {} completed by '{}'{} [{}]",
                        turn.conversation_id,
                        turn.turn_id,
                        agent_id,
                        if *fallback { " (fallback)" } else { "" },
                        render_trace(&trace)
                    ),
                    TurnOutcome::AwaitingClarification { round, .. } => info!(
                        "Conversation {} turn {} awaiting clarification (round {}) [{}]",
                        turn.conversation_id,
                        turn.turn_id,
                        round,
                        render_trace(&trace)
                    ),
                    TurnOutcome::Duplicate { turn_id } => info!(
                        "Conversation {} turn {} already processed, skipping",
                        turn.conversation_id, turn_id
                    ),
                }
                Ok(TurnReport { outcome, trace })
            }
            Err(error) => {
                trace.push(PipelineState::Failed);
                error!(
                    "Conversation {} turn {} failed with {}: {} [{}]",
                    turn.conversation_id,
                    turn.turn_id,
                    error.kind(),
                    error,
                    render_trace(&trace)
                );
                Err(PipelineFailure { error, trace })
            }
        }
    }

    async fn run(
        &self,
        turn: &InboundTurn,
        deadline: Instant,
        trace: &mut Vec<PipelineState>,
    ) -> Result<TurnOutcome> {
        let loaded = within(deadline, "state load", self.store.load(&turn.conversation_id)).await?;
        if let Some(existing) = &loaded {
            if existing.has_processed(&turn.turn_id) {
                return Ok(TurnOutcome::Duplicate {
                    turn_id: turn.turn_id.clone(),
                });
            }
        }

        // RECEIVED -> CHANNEL_RESOLVED
        let channel = self.resolve_channel(turn, deadline).await?;
        trace.push(PipelineState::ChannelResolved);

        let mut state = self.prepare_state(loaded, turn, &channel);

        // CHANNEL_RESOLVED -> ROUTING_DECIDED
        let config = within(deadline, "routing lookup", self.routing.get(&channel.id)).await?;
        let context = ConversationContext {
            conversation_id: turn.conversation_id.clone(),
            channel_id: channel.id.clone(),
            tenant_id: channel.tenant_id.clone(),
            turn_id: turn.turn_id.clone(),
            history: state.history.clone(),
            user_turn: turn.message.clone(),
        };
        let pending = state.pending.take();
        let decision = self.decide(&context, &config, pending.as_ref(), deadline).await?;
        trace.push(PipelineState::RoutingDecided);

        let selection = match decision {
            RoutingDecision::Selected(agent_id) => Selection::Agent {
                agent_id,
                fallback: false,
            },
            RoutingDecision::NeedsDisambiguation(candidates) => {
                trace.push(PipelineState::Disambiguating);
                let dstate = match pending {
                    Some(previous) => DisambiguationState {
                        candidates,
                        ..previous
                    },
                    None => DisambiguationState::new(candidates),
                };
                self.disambiguate(&context, &config, dstate, deadline).await?
            }
        };

        let (agent_id, fallback) = match selection {
            Selection::Agent { agent_id, fallback } => (agent_id, fallback),
            Selection::Clarify { question, state: next } => {
                // Suspend until the user answers
                let round = next.round;
                let candidates = next.candidates.clone();
                state
                    .history
                    .push(ConversationMessage::user(&turn.message, Some(turn.turn_id.clone())));
                state
                    .history
                    .push(ConversationMessage::assistant(&question, None));
                state.pending = Some(next);
                self.commit(&mut state, &turn.turn_id, deadline).await?;
                return Ok(TurnOutcome::AwaitingClarification {
                    question,
                    round,
                    candidates,
                });
            }
        };

        // -> AGENT_SELECTED
        let agent = config.agent(&agent_id).cloned().ok_or_else(|| {
            RuntimeError::classifier(
                format!(
                    "selected agent '{}' is not configured for channel '{}'",
                    agent_id, config.channel_id
                ),
                false,
            )
        })?;
        trace.push(PipelineState::AgentSelected);
        debug!(
            "Dispatching conversation {} to '{}' at {}",
            context.conversation_id, agent.id, agent.endpoint
        );

        // AGENT_SELECTED -> DISPATCHED
        let response = within(
            deadline,
            "agent dispatch",
            retry_transient(self.config.dispatch_retry, "agent dispatch", || {
                self.agents.send(&agent, &context)
            }),
        )
        .await?;
        trace.push(PipelineState::Dispatched);

        state
            .history
            .push(ConversationMessage::user(&turn.message, Some(turn.turn_id.clone())));
        state.history.push(ConversationMessage::assistant(
            &response.content,
            Some(agent_id.clone()),
        ));
        self.commit(&mut state, &turn.turn_id, deadline).await?;
        trace.push(PipelineState::Completed);

        Ok(TurnOutcome::Completed {
            agent_id,
            response,
            fallback,
        })
    }

    async fn resolve_channel(&self, turn: &InboundTurn, deadline: Instant) -> Result<Channel> {
        let not_found = || RuntimeError::ChannelNotFound {
            channel_id: turn.channel_id.clone(),
        };
        let channel = within(deadline, "channel lookup", self.channels.lookup(&turn.channel_id))
            .await?
            .ok_or_else(not_found)?;

        // A channel of another tenant is indistinguishable from an unknown one
        if let Some(tenant) = &turn.tenant_id {
            if tenant != &channel.tenant_id {
                warn!(
                    "Turn {} names tenant '{}' but channel '{}' belongs to another tenant",
                    turn.turn_id, tenant, channel.id
                );
                return Err(not_found());
            }
        }
        Ok(channel)
    }

    /// Existing state unless it expired or belongs to another channel
    fn prepare_state(
        &self,
        loaded: Option<ConversationState>,
        turn: &InboundTurn,
        channel: &Channel,
    ) -> ConversationState {
        match loaded {
            Some(state) if state.is_expired(self.config.conversation_ttl, chrono::Utc::now()) => {
                debug!("Conversation {} expired, starting over", turn.conversation_id);
                ConversationState::new(&turn.conversation_id, &channel.id, &channel.tenant_id)
            }
            Some(mut state) => {
                if state.channel_id != channel.id && state.pending.is_some() {
                    debug!(
                        "Conversation {} moved to channel '{}', dropping pending clarification",
                        turn.conversation_id, channel.id
                    );
                    state.pending = None;
                }
                state.channel_id = channel.id.clone();
                state.tenant_id = channel.tenant_id.clone();
                state
            }
            None => ConversationState::new(&turn.conversation_id, &channel.id, &channel.tenant_id),
        }
    }

    async fn decide(
        &self,
        context: &ConversationContext,
        config: &ChannelRoutingConfig,
        pending: Option<&DisambiguationState>,
        deadline: Instant,
    ) -> Result<RoutingDecision> {
        let resumable = pending.filter(|_| config.mode == RoutingMode::Llm);
        let Some(pending) = resumable else {
            return within(deadline, "agent routing", self.router.route(context, config)).await;
        };

        // Answer to a clarification: re-rank only the remaining candidates
        let candidates = config.candidates(pending.candidate_ids());
        if candidates.is_empty() {
            debug!(
                "Pending candidates for {} no longer configured, routing afresh",
                context.conversation_id
            );
            return within(deadline, "agent routing", self.router.route(context, config)).await;
        }

        let Some(classifier) = &self.classifier else {
            return Ok(RoutingDecision::NeedsDisambiguation(pending.candidates.clone()));
        };

        let result = within(
            deadline,
            "agent classification",
            retry_transient(self.config.classifier_retry, "agent classification", || {
                classifier.classify(context, &candidates)
            }),
        )
        .await?;

        Ok(match result.selected {
            Some(agent_id) => RoutingDecision::Selected(agent_id),
            None => RoutingDecision::NeedsDisambiguation(result.candidates),
        })
    }

    async fn disambiguate(
        &self,
        context: &ConversationContext,
        config: &ChannelRoutingConfig,
        state: DisambiguationState,
        deadline: Instant,
    ) -> Result<Selection> {
        let no_candidates = || RuntimeError::classifier("no candidates left to disambiguate", false);

        let Some(handler) = &self.disambiguation else {
            // Deterministic fallback: highest-ranked candidate
            let top = state.top().ok_or_else(no_candidates)?;
            debug!(
                "No disambiguation configured, falling back to '{}' for {}",
                top.agent_id, context.conversation_id
            );
            return Ok(Selection::Agent {
                agent_id: top.agent_id.clone(),
                fallback: true,
            });
        };

        let outcome = if state.round >= handler.max_rounds() {
            resolve_top(&state).ok_or_else(no_candidates)?
        } else {
            let descriptors = config.candidates(state.candidate_ids());
            within(
                deadline,
                "disambiguation",
                handler.disambiguate(context, &descriptors, &state),
            )
            .await?
        };

        Ok(match outcome {
            DisambiguationOutcome::Resolved { agent_id, fallback } => {
                if fallback {
                    warn!(
                        "Disambiguation for {} ended after {} rounds, using '{}'",
                        context.conversation_id, state.round, agent_id
                    );
                }
                Selection::Agent { agent_id, fallback }
            }
            DisambiguationOutcome::Clarify { question, candidates } => {
                let next = state.next_round(question.clone(), candidates);
                Selection::Clarify {
                    question,
                    state: next,
                }
            }
        })
    }

    async fn commit(&self, state: &mut ConversationState, turn_id: &str, deadline: Instant) -> Result<()> {
        state.record_turn(turn_id, self.config.dedup_window);
        state.trim_history(self.config.history_limit);
        state.touch();
        within(deadline, "state save", self.store.save(state)).await
    }
}
