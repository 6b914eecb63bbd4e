//! Built-in work units for operator-declared tasks: shell commands and
//! HTTP requests, plus the mapping from `[[task]]` config tables to
//! [`TaskDefinition`]s.

use async_trait::async_trait;
use chrono::Duration;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::registry::{TaskDefinition, TaskOutcome, WorkUnit};
use crate::tasks::{BackoffKind, RetryPolicy, TaskCategory};
use warden_core::{Result, TaskConfig, WardenError};

/// Max characters of output kept in a run's detail.
const DETAIL_LIMIT: usize = 500;

/// Runs `sh -c <command>`. Exit status 0 is success.
#[derive(Debug, Clone)]
pub struct CommandUnit {
    pub command: String,
    pub timeout: std::time::Duration,
}

impl CommandUnit {
    pub fn new(command: impl Into<String>, timeout: std::time::Duration) -> Self {
        Self {
            command: command.into(),
            timeout,
        }
    }
}

#[async_trait]
impl WorkUnit for CommandUnit {
    async fn run(&self) -> TaskOutcome {
        tracing::debug!(command = %self.command, "🖥️ Running command");
        let child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .kill_on_drop(true)
            .output();

        match tokio::time::timeout(self.timeout, child).await {
            Ok(Ok(output)) => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                let stderr = String::from_utf8_lossy(&output.stderr);
                if output.status.success() {
                    let out = truncate(stdout.trim());
                    if out.is_empty() {
                        TaskOutcome::ok()
                    } else {
                        TaskOutcome::ok_with(out)
                    }
                } else {
                    let code = output.status.code().unwrap_or(-1);
                    let msg = if stderr.trim().is_empty() { stdout.trim() } else { stderr.trim() };
                    TaskOutcome::fail(format!("exit {code}: {}", truncate(msg)))
                }
            }
            Ok(Err(e)) => TaskOutcome::fail(format!("failed to spawn command: {e}")),
            Err(_) => TaskOutcome::fail(format!("timed out after {}s", self.timeout.as_secs())),
        }
    }
}

/// Sends one HTTP request. Any 2xx status is success.
#[derive(Debug, Clone)]
pub struct HttpUnit {
    client: reqwest::Client,
    pub url: String,
    pub method: String,
    pub body: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub timeout: std::time::Duration,
}

impl HttpUnit {
    pub fn new(url: impl Into<String>, method: impl Into<String>, timeout: std::time::Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            method: method.into(),
            body: None,
            headers: BTreeMap::new(),
            timeout,
        }
    }

    pub fn body(mut self, body: Option<String>) -> Self {
        self.body = body;
        self
    }

    pub fn headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers = headers;
        self
    }
}

#[async_trait]
impl WorkUnit for HttpUnit {
    async fn run(&self) -> TaskOutcome {
        tracing::debug!("🌐 {} {}", self.method, self.url);
        let req = match self.method.to_uppercase().as_str() {
            "POST" => self.client.post(&self.url),
            "PUT" => self.client.put(&self.url),
            "PATCH" => self.client.patch(&self.url),
            "DELETE" => self.client.delete(&self.url),
            "HEAD" => self.client.head(&self.url),
            _ => self.client.get(&self.url),
        };
        let mut req = match &self.body {
            Some(body) => req.header("Content-Type", "application/json").body(body.clone()),
            None => req,
        };
        for (key, value) in &self.headers {
            req = req.header(key.as_str(), value.as_str());
        }

        match req.timeout(self.timeout).send().await {
            Ok(resp) if resp.status().is_success() => TaskOutcome::ok_with(format!("HTTP {}", resp.status())),
            Ok(resp) => {
                let status = resp.status();
                let text = resp.text().await.unwrap_or_default();
                if text.trim().is_empty() {
                    TaskOutcome::fail(format!("HTTP {status}"))
                } else {
                    TaskOutcome::fail(format!("HTTP {status}: {}", truncate(text.trim())))
                }
            }
            Err(e) => TaskOutcome::fail(format!("request failed: {e}")),
        }
    }
}

fn truncate(s: &str) -> String {
    if s.chars().count() <= DETAIL_LIMIT {
        s.to_string()
    } else {
        let cut: String = s.chars().take(DETAIL_LIMIT).collect();
        format!("{cut}…")
    }
}

/// Build definitions for operator-declared tasks.
pub fn definitions_from_config(tasks: &[TaskConfig]) -> Result<Vec<TaskDefinition>> {
    tasks.iter().map(definition_from_config).collect()
}

fn definition_from_config(task: &TaskConfig) -> Result<TaskDefinition> {
    let category: TaskCategory = task.category.parse()?;
    let timeout = std::time::Duration::from_secs(task.timeout_secs.max(1));

    let unit: Arc<dyn WorkUnit> = match (&task.command, &task.url) {
        (Some(command), None) => Arc::new(CommandUnit::new(command, timeout)),
        (None, Some(url)) => Arc::new(
            HttpUnit::new(url, &task.method, timeout)
                .body(task.body.clone())
                .headers(task.headers.clone()),
        ),
        _ => {
            return Err(WardenError::Config(format!(
                "task '{}' must declare exactly one of `command` or `url`",
                task.name
            )));
        }
    };

    let mut def = TaskDefinition::new(&task.name, &task.schedule, category, unit).catch_up(task.catch_up);
    if let Some(retry) = &task.retry {
        let backoff: BackoffKind = retry.backoff.parse()?;
        let base_delay = Duration::try_seconds(retry.base_delay_secs as i64).ok_or_else(|| {
            WardenError::Config(format!("task '{}': retry.base_delay_secs too large", task.name))
        })?;
        def = def.retry(RetryPolicy {
            max_attempts: retry.max_attempts,
            backoff,
            base_delay,
        });
    }
    Ok(def)
}
