//! Command classification.
//!
//! Decides whether chat input is answered on the spot (immediate) or turns
//! into a tracked task (deferred). No I/O, no state: everything here is a
//! plain function of the input text.

use crate::model::TaskKind;

/// Phrases that mark a command as long-running. Matched as case-insensitive
/// substrings anywhere in the input, so prose that merely mentions one of
/// them ("can you search your memory") is deferred too.
pub const DEFERRED_KEYWORDS: &[&str] = &[
    "/organize",
    "/search",
    "/cleanup",
    "/backup",
    "organize",
    "search",
    "cleanup",
    "backup",
    "analyze",
    "scan",
    "index",
    "process large",
    "batch",
    "bulk",
    "mass operation",
];

/// Commands answered synchronously by the router.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Builtin {
    Help,
    Status,
    /// Anything else. Always answered with a textual explanation.
    Unrecognized(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Immediate(Builtin),
    Deferred,
}

impl Classification {
    pub fn is_deferred(&self) -> bool {
        matches!(self, Classification::Deferred)
    }
}

/// Keyword-based classifier. `Default` carries [`DEFERRED_KEYWORDS`].
#[derive(Debug, Clone)]
pub struct CommandClassifier {
    keywords: Vec<String>,
}

impl Default for CommandClassifier {
    fn default() -> Self {
        Self::with_keywords(DEFERRED_KEYWORDS.iter().copied())
    }
}

impl CommandClassifier {
    pub fn with_keywords<I, S>(keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            keywords: keywords
                .into_iter()
                .map(|k| k.as_ref().to_lowercase())
                .filter(|k| !k.is_empty())
                .collect(),
        }
    }

    /// True when any keyword occurs in `text`, ignoring case.
    pub fn is_deferred(&self, text: &str) -> bool {
        let lower = text.to_lowercase();
        self.keywords.iter().any(|k| lower.contains(k.as_str()))
    }

    /// Classify non-empty input. Blank input is the caller's problem and
    /// is rejected before it gets here.
    pub fn classify(&self, text: &str) -> Classification {
        if self.is_deferred(text) {
            return Classification::Deferred;
        }
        Classification::Immediate(builtin_for(text))
    }
}

fn builtin_for(text: &str) -> Builtin {
    let trimmed = text.trim();
    let head = trimmed
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_lowercase();
    match head.as_str() {
        "/help" => Builtin::Help,
        "/status" => Builtin::Status,
        _ => Builtin::Unrecognized(trimmed.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Immediate responders
// ---------------------------------------------------------------------------

pub const HELP_TEXT: &str = "Available commands:\n\
/organize [path] - Organize files and folders\n\
/folder:name [create|navigate] - Create or navigate to a folder\n\
/search [query] - Search for files and content\n\
/cleanup - Clean temporary files and optimize storage\n\
/backup - Back up your files\n\
/status - Show your task counts\n\
/help - Show this help message\n\
Long-running commands run in the background; follow them in Tasks.";

/// Text for built-ins that need no data. `/status` is answered by the
/// router, which has access to task counts.
pub fn respond(builtin: &Builtin) -> String {
    match builtin {
        Builtin::Help => HELP_TEXT.to_string(),
        Builtin::Status => "Task status is currently unavailable.".to_string(),
        Builtin::Unrecognized(text) if text.starts_with('/') => {
            let name = text.split_whitespace().next().unwrap_or(text);
            format!("Unknown command: {name}. Type /help to see available commands.")
        }
        Builtin::Unrecognized(_) => {
            "Command not recognized. Type /help to see available commands.".to_string()
        }
    }
}

// ---------------------------------------------------------------------------
// Task type inference
// ---------------------------------------------------------------------------

/// Task type plus the parameters pulled out of the command text.
#[derive(Debug, Clone, PartialEq)]
pub struct InferredTask {
    pub kind: TaskKind,
    pub parameters: serde_json::Map<String, serde_json::Value>,
}

/// Work out the task type for a deferred command.
///
/// Slash commands carry their arguments (`/organize Downloads` → `path`);
/// free text falls back to keyword matching, then to analysis.
pub fn infer_task(command: &str) -> InferredTask {
    let lower = command.trim().to_lowercase();
    let mut parameters = serde_json::Map::new();
    let mut words = lower.split_whitespace();
    let head = words.next().unwrap_or_default();
    let rest: Vec<&str> = words.collect();

    let kind = match head {
        "/organize" => {
            if !rest.is_empty() {
                parameters.insert("path".into(), rest.join(" ").into());
            }
            TaskKind::Organize
        }
        "/search" => {
            if !rest.is_empty() {
                parameters.insert("query".into(), rest.join(" ").into());
            }
            TaskKind::Search
        }
        "/cleanup" => {
            if !rest.is_empty() {
                parameters.insert("options".into(), rest.clone().into());
            }
            TaskKind::Cleanup
        }
        "/backup" => TaskKind::Backup,
        h if h == "/folder" || h.starts_with("/folder:") => {
            if let Some((_, name)) = h.split_once(':') {
                if !name.is_empty() {
                    parameters.insert("folder_name".into(), name.into());
                }
            }
            let action = match rest.last() {
                Some(&"navigate") => "navigate",
                _ => "create",
            };
            parameters.insert("action".into(), action.into());
            TaskKind::FolderOperation
        }
        _ => kind_from_keywords(&lower),
    };

    InferredTask { kind, parameters }
}

fn kind_from_keywords(lower: &str) -> TaskKind {
    const ORDER: &[(&str, TaskKind)] = &[
        ("organize", TaskKind::Organize),
        ("search", TaskKind::Search),
        ("cleanup", TaskKind::Cleanup),
        ("backup", TaskKind::Backup),
        ("analyze", TaskKind::Analysis),
        ("analysis", TaskKind::Analysis),
    ];
    ORDER
        .iter()
        .find(|(kw, _)| lower.contains(kw))
        .map(|(_, kind)| *kind)
        .unwrap_or(TaskKind::Analysis)
}
