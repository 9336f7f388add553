//! Builds the routing runtime from a loaded config
//!
//! Everything that can be checked without traffic is checked here, so a bad
//! config stops the process at startup with a `ConfigurationError`.

use parley_a2a::HttpAgentClient;
use parley_channels::{
    ApiChannelRepository, ApiChannelRoutingRepository, FileBasedChannelRoutingRepository,
    OperatorChannelRepository,
};
use parley_core::{
    AgentClassifierService, AgentRoutingService, CachedChannelRoutingRepository, Channel,
    ChannelRepository, ChannelRoutingRepository, ConversationHandler, ConversationStateStore,
    HandlerConfig, InMemoryStateStore, KeywordAgentClassifier, LlmAgentClassifier,
    LlmAgentRoutingService, LlmDisambiguationHandler, ModeAgentRoutingService, Result,
    RetryPolicy, RoutingMode, RuntimeError, build_failover_provider, build_provider,
};
use parley_store::SqliteStateStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{
    ChannelSource, ClassifierKind, ParleyConfig, RepositoryKind, StateBackend, expand_home,
};

pub struct Runtime {
    pub handler: Arc<ConversationHandler>,
    pub channels: Arc<dyn ChannelRepository>,
    /// Channel ids known up front; empty when channels live behind an API
    pub known_channels: Vec<String>,
    /// One line per wired component, for `parley check`
    pub summary: Vec<String>,
    store: Arc<dyn ConversationStateStore>,
    sweep_interval: Duration,
}

impl Runtime {
    pub fn cache(&self) -> &Arc<CachedChannelRoutingRepository> {
        self.handler.routing_cache()
    }

    /// Evict expired routing entries and purge idle conversations every
    /// sweep interval until `cancel` fires
    pub fn spawn_sweeper(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let cache_sweeper = self.cache().spawn_sweeper(self.sweep_interval, cancel.clone());
        let handler = Arc::clone(&self.handler);
        let interval = self.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => match handler.purge_expired().await {
                        Ok(0) => {}
                        Ok(purged) => debug!("Purged {} idle conversations", purged),
                        Err(e) => warn!("Could not purge expired conversations: {}", e),
                    },
                }
            }
            if let Err(e) = cache_sweeper.await {
                warn!("Routing cache sweeper ended abnormally: {}", e);
            }
        })
    }
}

pub fn build(config: &ParleyConfig) -> Result<Runtime> {
    config.validate()?;
    let mut summary = Vec::new();

    // Routing repository, and the channel repository that may share it
    let repo_cfg = &config.routing_repository;
    let token = Some(repo_cfg.token.clone());
    let timeout = Duration::from_secs(repo_cfg.timeout_secs);
    // Channel ids are only enumerable from files
    let (routing, routed_channels, routed_ids): (
        Arc<dyn ChannelRoutingRepository>,
        Arc<dyn ChannelRepository>,
        Vec<String>,
    ) = match repo_cfg.kind {
        RepositoryKind::File => {
            let path = expand_home(repo_cfg.file_name.as_deref().unwrap_or_default());
            let repo = Arc::new(FileBasedChannelRoutingRepository::load(
                path,
                repo_cfg.subset.clone(),
            )?);
            summary.push(format!(
                "routing: file {} ({} channels{})",
                repo.path().display(),
                repo.channel_ids().len(),
                subset_note(repo.subset())
            ));
            let ids = repo.channels().into_iter().map(|c| c.id).collect();
            let routing: Arc<dyn ChannelRoutingRepository> = repo.clone();
            let channels: Arc<dyn ChannelRepository> = repo;
            (routing, channels, ids)
        }
        RepositoryKind::Api => {
            let base_url = repo_cfg.base_url.as_deref().unwrap_or_default();
            let repo = ApiChannelRoutingRepository::new(base_url, timeout)?
                .with_subset(repo_cfg.subset.clone())
                .with_token(token.clone());
            summary.push(format!(
                "routing: api {}{}",
                repo.base_url(),
                subset_note(repo_cfg.subset.as_deref())
            ));
            let routing: Arc<dyn ChannelRoutingRepository> = Arc::new(repo);
            let channels: Arc<dyn ChannelRepository> =
                Arc::new(ApiChannelRepository::new(base_url, timeout)?.with_token(token));
            (routing, channels, vec![])
        }
    };

    let (channels, known_channels): (Arc<dyn ChannelRepository>, Vec<String>) = match config.channels.source {
        ChannelSource::Static => {
            let list: Vec<Channel> = config
                .channels
                .entries
                .iter()
                .map(|e| {
                    let mut channel = Channel::new(&e.id, &e.tenant_id);
                    channel.display_name = e.display_name.clone();
                    channel
                })
                .collect();
            let ids = list.iter().map(|c| c.id.clone()).collect();
            summary.push(format!("channels: {} configured", list.len()));
            let repo: Arc<dyn ChannelRepository> = Arc::new(OperatorChannelRepository::from_channels(list));
            (repo, ids)
        }
        ChannelSource::Routing => {
            summary.push("channels: from the routing repository".to_string());
            (routed_channels, routed_ids)
        }
    };

    let cache = Arc::new(CachedChannelRoutingRepository::new(
        routing,
        config.cache.to_cache_config(),
    ));

    // Classifier and router
    let classifier_retry = RetryPolicy::once(Duration::from_millis(config.classifier.retry_backoff_ms));
    let classifier: Option<Arc<dyn AgentClassifierService>> = match config.router.kind {
        RoutingMode::Explicit => None,
        RoutingMode::Llm => Some(build_classifier(config)?),
    };
    let router = match &classifier {
        None => {
            summary.push("router: explicit only".to_string());
            ModeAgentRoutingService::explicit_only()
        }
        Some(classifier) => {
            let llm_routing = match (config.classifier.kind, &config.llm) {
                (ClassifierKind::Llm, Some(llm)) => {
                    LlmAgentRoutingService::new(classifier.clone(), &llm.params.api_key)?
                }
                (ClassifierKind::Llm, None) => {
                    return Err(RuntimeError::configuration(
                        "router type LLM with an llm classifier requires an [llm] section",
                    ));
                }
                (ClassifierKind::Keyword, _) => LlmAgentRoutingService::with_classifier(classifier.clone()),
            };
            summary.push(format!("router: explicit + {} classifier", classifier.name()));
            let llm_routing: Arc<dyn AgentRoutingService> = Arc::new(llm_routing.with_retry(classifier_retry));
            ModeAgentRoutingService::new(Some(llm_routing))
        }
    };

    // Agents
    let dispatch = &config.dispatch;
    let mut agents = HttpAgentClient::new(Duration::from_secs(dispatch.timeout_secs))?
        .with_default_token(Some(dispatch.token.clone()))
        .with_polling(Duration::from_millis(dispatch.poll_interval_ms), dispatch.max_polls);
    for entry in &dispatch.agents {
        agents = agents.with_agent_token(&entry.id, &entry.token);
    }

    // Conversation state
    let store: Arc<dyn ConversationStateStore> = match config.state.backend {
        StateBackend::Memory => {
            summary.push("state: in memory".to_string());
            Arc::new(InMemoryStateStore::new())
        }
        StateBackend::Sqlite => {
            let path = expand_home(&config.state.db_path);
            summary.push(format!("state: sqlite {}", path.display()));
            Arc::new(SqliteStateStore::open(path)?)
        }
    };

    let conv = &config.conversation;
    let mut handler = ConversationHandler::new(channels.clone(), cache, Arc::new(router), Arc::new(agents))
        .with_state_store(Arc::clone(&store))
        .with_config(HandlerConfig {
            default_deadline: Duration::from_secs(conv.default_deadline_secs),
            dispatch_retry: RetryPolicy::once(Duration::from_millis(dispatch.retry_backoff_ms)),
            classifier_retry,
            history_limit: conv.history_limit,
            dedup_window: conv.dedup_window,
            conversation_ttl: Duration::from_secs(conv.ttl_secs),
        });
    if let Some(classifier) = classifier {
        handler = handler.with_classifier(classifier);
    }

    let disambiguation = &config.disambiguation;
    if disambiguation.enabled {
        let Some(params) = &disambiguation.llm else {
            return Err(RuntimeError::configuration(
                "disambiguation is enabled but [disambiguation.llm] is missing",
            ));
        };
        let provider = build_provider(params, "disambiguation.llm")?;
        let clarifier = LlmDisambiguationHandler::new(provider, disambiguation.prompts.clone())
            .with_max_rounds(disambiguation.max_rounds)
            .with_history_limit(disambiguation.history_limit);
        handler = handler.with_disambiguation(Arc::new(clarifier));
        summary.push(format!(
            "disambiguation: {} (up to {} rounds)",
            params.model, disambiguation.max_rounds
        ));
    } else {
        summary.push("disambiguation: off".to_string());
    }

    info!("Runtime wired: {}", summary.join("; "));
    Ok(Runtime {
        handler: Arc::new(handler),
        channels,
        known_channels,
        summary,
        store,
        sweep_interval: Duration::from_secs(config.cache.sweep_interval_secs.max(1)),
    })
}

fn build_classifier(config: &ParleyConfig) -> Result<Arc<dyn AgentClassifierService>> {
    let cfg = &config.classifier;
    match cfg.kind {
        ClassifierKind::Keyword => Ok(Arc::new(KeywordAgentClassifier::new(cfg.thresholds))),
        ClassifierKind::Llm => {
            let Some(llm) = &config.llm else {
                return Err(RuntimeError::configuration(
                    "classifier type llm requires an [llm] section",
                ));
            };
            let provider = build_failover_provider(&llm.params, &llm.fallbacks, "llm")?;
            Ok(Arc::new(
                LlmAgentClassifier::new(provider)
                    .with_thresholds(cfg.thresholds)
                    .with_history_limit(cfg.history_limit),
            ))
        }
    }
}

fn subset_note(subset: Option<&str>) -> String {
    subset.map(|s| format!(", subset {}", s)).unwrap_or_default()
}
