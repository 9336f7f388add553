//! A2A client: dispatches turns to agents as HTTP tasks
//!
//! Agents that answer the submit call with a finished task are done in one
//! round trip; agents that accept the task for background work are polled
//! until it reaches a terminal status. The caller's deadline bounds the
//! whole exchange.

use async_trait::async_trait;
use parley_core::{
    AgentClientService, AgentDescriptor, AgentResponse, ConversationContext, Result, RuntimeError,
};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use crate::protocol::{TaskRequest, TaskResponse, TaskStatus};

const MAX_ERROR_BODY: usize = 200;

pub struct HttpAgentClient {
    client: Client,
    default_token: Option<String>,
    agent_tokens: HashMap<String, String>,
    poll_interval: Duration,
    max_polls: u32,
}

impl std::fmt::Debug for HttpAgentClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpAgentClient")
            .field("default_token", &self.default_token.as_ref().map(|_| "[REDACTED]"))
            .field("agent_tokens", &self.agent_tokens.keys().collect::<Vec<_>>())
            .field("poll_interval", &self.poll_interval)
            .field("max_polls", &self.max_polls)
            .finish()
    }
}

impl HttpAgentClient {
    /// `timeout` bounds each HTTP request, not the whole task
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RuntimeError::configuration(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            default_token: None,
            agent_tokens: HashMap::new(),
            poll_interval: Duration::from_millis(500),
            max_polls: 120,
        })
    }

    /// Bearer token sent to agents without a token of their own
    pub fn with_default_token(mut self, token: Option<String>) -> Self {
        self.default_token = token.filter(|t| !t.is_empty());
        self
    }

    pub fn with_agent_token(mut self, agent_id: impl Into<String>, token: impl Into<String>) -> Self {
        let token = token.into();
        if !token.is_empty() {
            self.agent_tokens.insert(agent_id.into(), token);
        }
        self
    }

    pub fn with_polling(mut self, interval: Duration, max_polls: u32) -> Self {
        self.poll_interval = interval;
        self.max_polls = max_polls;
        self
    }

    fn authorize(&self, agent: &AgentDescriptor, request: RequestBuilder) -> RequestBuilder {
        match self.agent_tokens.get(&agent.id).or(self.default_token.as_ref()) {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    fn tasks_url(agent: &AgentDescriptor, task_id: Option<&str>) -> Result<Url> {
        let mut url = Url::parse(&agent.endpoint).map_err(|e| {
            RuntimeError::dispatch(&agent.id, format!("invalid endpoint '{}': {}", agent.endpoint, e), false)
        })?;
        {
            let mut path = url.path_segments_mut().map_err(|_| {
                RuntimeError::dispatch(&agent.id, format!("endpoint '{}' cannot take a path", agent.endpoint), false)
            })?;
            path.pop_if_empty().extend(["a2a", "tasks"]);
            if let Some(id) = task_id {
                path.push(id);
            }
        }
        Ok(url)
    }

    async fn read_task(agent: &AgentDescriptor, response: Response) -> Result<TaskResponse> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let body: String = body.chars().take(MAX_ERROR_BODY).collect();
            let transient = status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS;
            return Err(RuntimeError::dispatch(
                &agent.id,
                format!("agent answered {}: {}", status, body),
                transient,
            ));
        }
        response
            .json::<TaskResponse>()
            .await
            .map_err(|e| RuntimeError::dispatch(&agent.id, format!("unreadable task response: {}", e), false))
    }

    /// Poll until the task is terminal. The task already exists upstream, so
    /// failed polls are retried here and never surface as transient errors.
    async fn poll(&self, agent: &AgentDescriptor, mut task: TaskResponse) -> Result<TaskResponse> {
        let url = Self::tasks_url(agent, Some(&task.task_id))?;
        let mut polls = 0;
        let mut last_error: Option<RuntimeError> = None;
        while !task.status.is_terminal() {
            if polls >= self.max_polls {
                let detail = match last_error {
                    Some(e) => format!("task {} unreachable after {} polls: {}", task.task_id, polls, e),
                    None => format!("task {} still {} after {} polls", task.task_id, task.status, polls),
                };
                return Err(RuntimeError::dispatch(&agent.id, detail, false));
            }
            tokio::time::sleep(self.poll_interval).await;
            polls += 1;

            match self.fetch_task(agent, &url).await {
                Ok(current) => {
                    task = current;
                    last_error = None;
                    debug!("Task {} at '{}' is {}", task.task_id, agent.id, task.status);
                }
                Err(e) if e.is_transient() => {
                    warn!(
                        "Polling task {} at '{}' failed ({}/{}): {}",
                        task.task_id, agent.id, polls, self.max_polls, e
                    );
                    last_error = Some(e);
                }
                Err(e) => {
                    return Err(RuntimeError::dispatch(
                        &agent.id,
                        format!("polling task {} failed: {}", task.task_id, e),
                        false,
                    ));
                }
            }
        }
        Ok(task)
    }

    async fn fetch_task(&self, agent: &AgentDescriptor, url: &Url) -> Result<TaskResponse> {
        let response = self
            .authorize(agent, self.client.get(url.clone()))
            .send()
            .await
            .map_err(|e| RuntimeError::dispatch(&agent.id, format!("polling task failed: {}", e), true))?;
        Self::read_task(agent, response).await
    }
}

#[async_trait]
impl AgentClientService for HttpAgentClient {
    async fn send(&self, agent: &AgentDescriptor, context: &ConversationContext) -> Result<AgentResponse> {
        let url = Self::tasks_url(agent, None)?;
        let request = TaskRequest::from(context);
        debug!("Submitting turn {} to '{}' at {}", context.turn_id, agent.id, url);

        let response = self
            .authorize(agent, self.client.post(url))
            .json(&request)
            .send()
            .await
            .map_err(|e| RuntimeError::dispatch(&agent.id, format!("request failed: {}", e), true))?;
        let task = Self::read_task(agent, response).await?;
        let task = self.poll(agent, task).await?;

        match task.status {
            TaskStatus::Completed => {
                let mut metadata = serde_json::Map::new();
                metadata.insert("task_id".to_string(), task.task_id.clone().into());
                if let Some(done) = task.completed_at {
                    metadata.insert("completed_at".to_string(), done.to_rfc3339().into());
                }
                Ok(AgentResponse {
                    agent_id: agent.id.clone(),
                    content: task.result.unwrap_or_default(),
                    metadata,
                })
            }
            status => {
                warn!("Agent '{}' ended task {} as {}", agent.id, task.task_id, status);
                Err(RuntimeError::dispatch(
                    &agent.id,
                    format!(
                        "task {} {}: {}",
                        task.task_id,
                        status,
                        task.result.unwrap_or_else(|| "no detail".to_string())
                    ),
                    false,
                ))
            }
        }
    }
}
