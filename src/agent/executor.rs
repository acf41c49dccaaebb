use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::process::Command;
use tokio::sync::Semaphore;

use crate::error::{Result, TaskGridError};
use crate::task::{TaskItem, TaskResult};

/// Where an executor reports finished tasks.
#[derive(Clone)]
pub struct CompletionSink {
    deliver: Arc<dyn Fn(TaskItem, TaskResult) + Send + Sync>,
}

impl CompletionSink {
    pub fn new<F>(deliver: F) -> Self
    where
        F: Fn(TaskItem, TaskResult) + Send + Sync + 'static,
    {
        Self {
            deliver: Arc::new(deliver),
        }
    }

    pub fn complete(&self, task: TaskItem, result: TaskResult) {
        (self.deliver)(task, result)
    }
}

/// Runs tasks on an agent.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Accept a job's opaque configuration. An error rejects the job.
    async fn initialize(&self, config: &Value) -> Result<()>;

    /// Start every task, returning one start result per task in order.
    /// Outcomes of started tasks go to `sink`.
    async fn start_tasks(&self, tasks: Vec<TaskItem>, sink: CompletionSink) -> Vec<TaskResult>;
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct ShellSettings {
    pub env: HashMap<String, String>,
    pub workdir: Option<PathBuf>,
}

impl ShellSettings {
    pub fn from_config(config: &Value) -> Result<Self> {
        match config {
            Value::Null => Ok(Self::default()),
            Value::Object(_) => Ok(serde_json::from_value(config.clone())?),
            other => Err(TaskGridError::InvalidPayload(format!(
                "expected an object, got {}",
                other
            ))),
        }
    }
}

/// Runs each task's data as `sh -c <command>`, at most `capacity` at a time.
pub struct ShellExecutor {
    permits: Arc<Semaphore>,
    settings: RwLock<Arc<ShellSettings>>,
}

impl ShellExecutor {
    pub fn new(capacity: u32) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(capacity.max(1) as usize)),
            settings: RwLock::new(Arc::new(ShellSettings::default())),
        }
    }

    fn settings(&self) -> Arc<ShellSettings> {
        self.settings
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Run one command to completion.
    pub async fn run(settings: &ShellSettings, command: &str) -> TaskResult {
        tracing::debug!(command, "Running task");
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .envs(&settings.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &settings.workdir {
            cmd.current_dir(dir);
        }

        Self::process_output(cmd.output().await)
    }

    fn process_output(result: std::result::Result<std::process::Output, std::io::Error>) -> TaskResult {
        match result {
            Ok(output) => {
                let stdout = String::from_utf8_lossy(&output.stdout).to_string();
                let stderr = String::from_utf8_lossy(&output.stderr).to_string();
                let exit_code = output.status.code();
                let data = json!({ "exit_code": exit_code, "stdout": stdout });

                if output.status.success() {
                    TaskResult::success(data)
                } else {
                    let message = if stderr.is_empty() {
                        format!("Exit code: {:?}", exit_code)
                    } else {
                        stderr
                    };
                    TaskResult {
                        success: false,
                        error_message: Some(message),
                        data,
                    }
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "Task execution failed");
                TaskResult::failure(e.to_string())
            }
        }
    }
}

#[async_trait]
impl TaskExecutor for ShellExecutor {
    async fn initialize(&self, config: &Value) -> Result<()> {
        let settings = ShellSettings::from_config(config)?;
        if let Some(dir) = &settings.workdir {
            if !dir.is_dir() {
                return Err(TaskGridError::InvalidPayload(format!(
                    "workdir {} does not exist",
                    dir.display()
                )));
            }
        }
        *self
            .settings
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Arc::new(settings);
        Ok(())
    }

    async fn start_tasks(&self, tasks: Vec<TaskItem>, sink: CompletionSink) -> Vec<TaskResult> {
        let settings = self.settings();
        let mut started = Vec::with_capacity(tasks.len());

        for task in tasks {
            let Some(command) = task.data.as_str().map(str::to_string) else {
                started.push(TaskResult::failure("task data must be a command string"));
                continue;
            };

            let permits = self.permits.clone();
            let settings = settings.clone();
            let sink = sink.clone();
            tokio::spawn(async move {
                let result = match permits.acquire_owned().await {
                    Ok(_permit) => Self::run(&settings, &command).await,
                    Err(_) => TaskResult::failure("executor closed"),
                };
                tracing::info!(task = %task.identifier, success = result.success, "Task finished");
                sink.complete(task, result);
            });
            started.push(TaskResult::success(Value::Null));
        }

        started
    }
}
