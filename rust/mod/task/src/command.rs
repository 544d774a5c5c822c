use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::classifier::{Builtin, Classification, CommandClassifier, respond};
use crate::engine::TaskEngine;
use crate::model::{CreateTaskRequest, StatusCounts};

/// Body for `POST /commands`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CommandRequest {
    pub text: String,
    #[serde(default)]
    pub chat_id: Option<String>,
}

/// Uniform envelope returned for every command, successful or not.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CommandOutcome {
    pub is_task: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CommandOutcome {
    fn reply(text: String) -> Self {
        Self {
            response: Some(text),
            ..Default::default()
        }
    }

    fn failed(error: String) -> Self {
        Self {
            error: Some(error),
            ..Default::default()
        }
    }
}

/// Entry point for chat input: classify, then either answer on the spot or
/// hand the command to the engine as a new task.
pub struct CommandRouter {
    classifier: CommandClassifier,
    engine: Arc<TaskEngine>,
}

impl CommandRouter {
    pub fn new(classifier: CommandClassifier, engine: Arc<TaskEngine>) -> Self {
        Self { classifier, engine }
    }

    /// Never fails: every error is folded into [`CommandOutcome::error`].
    pub async fn process_command(
        &self,
        owner: &str,
        text: &str,
        chat_id: Option<String>,
    ) -> CommandOutcome {
        if owner.trim().is_empty() {
            return CommandOutcome::failed("not authenticated".into());
        }
        let text = text.trim();
        if text.is_empty() {
            return CommandOutcome::failed("command must not be empty".into());
        }

        match self.classifier.classify(text) {
            Classification::Deferred => {
                let req = CreateTaskRequest {
                    command: text.to_string(),
                    chat_id,
                    ..Default::default()
                };
                match self.engine.create_task(owner, req).await {
                    Ok(created) => {
                        info!("command promoted to task {}", created.task.id);
                        CommandOutcome {
                            is_task: true,
                            task_id: Some(created.task.id),
                            response: Some(created.acknowledgement),
                            error: None,
                        }
                    }
                    Err(e) => {
                        warn!("task creation failed for command {text:?}: {e}");
                        CommandOutcome::failed(format!("Could not create task for \"{text}\": {e}"))
                    }
                }
            }
            Classification::Immediate(Builtin::Status) => {
                CommandOutcome::reply(self.status_text(owner).await)
            }
            Classification::Immediate(builtin) => CommandOutcome::reply(respond(&builtin)),
        }
    }

    async fn status_text(&self, owner: &str) -> String {
        match self.engine.stats(owner).await {
            Ok(counts) => format_counts(&counts),
            Err(e) => {
                warn!("status lookup failed: {e}");
                respond(&Builtin::Status)
            }
        }
    }
}

fn format_counts(c: &StatusCounts) -> String {
    format!(
        "Tasks: {} pending, {} running, {} completed, {} failed, {} cancelled.",
        c.pending, c.running, c.completed, c.failed, c.cancelled
    )
}
