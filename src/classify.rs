//! Event classification.
//!
//! A pure decision table over the parsed envelope; first matching rule wins.
//! Cheap actor checks run before any text scanning, and every drop maps to an
//! acknowledged-but-ignored 200 so the platform does not retry.

use crate::envelope::{CodeAnchor, CommentTarget, EventKind, WebhookEnvelope};

/// Which pipeline flavor handles the event downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingMode {
    Issue,
    IssueComment,
    MrComment,
    MrCreation,
}

impl ProcessingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingMode::Issue => "issue",
            ProcessingMode::IssueComment => "issue-comment",
            ProcessingMode::MrComment => "mr-comment",
            ProcessingMode::MrCreation => "mr-creation",
        }
    }
}

/// A positive classification: how to process and what the actor asked for.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub mode: ProcessingMode,
    /// Extracted prompt for trigger-driven modes; `None` for the issue mode,
    /// which processes unconditionally. May be empty, which is still valid.
    pub prompt: Option<String>,
    /// File/line anchor copied through unchanged when the comment carried one.
    pub anchor: Option<CodeAnchor>,
}

/// Classifier output: process the event or acknowledge and ignore it.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Process(Classification),
    Ignore { reason: &'static str },
}

fn ignore(reason: &'static str) -> Decision {
    Decision::Ignore { reason }
}

/// Bot-naming fallback for platforms that do not flag bot accounts.
fn is_bot_handle(handle: &str) -> bool {
    let lower = handle.to_ascii_lowercase();
    lower.ends_with("bot") || lower.ends_with("[bot]") || lower.contains("-bot")
}

/// Remove fenced code blocks (```...```), then inline code spans (`...`).
///
/// Trigger mentions inside code samples are quotations, not requests. An
/// unterminated fence swallows the rest of the text; an unterminated inline
/// backtick is kept literally.
pub fn strip_code(text: &str) -> String {
    let without_fences = strip_delimited(text, "```", false);
    strip_delimited(&without_fences, "`", true)
}

fn strip_delimited(text: &str, delim: &str, keep_unterminated: bool) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find(delim) {
        out.push_str(&rest[..start]);
        let after_open = &rest[start + delim.len()..];
        match after_open.find(delim) {
            Some(end) => rest = &after_open[end + delim.len()..],
            None => {
                if keep_unterminated {
                    out.push_str(&rest[start..]);
                }
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

fn find_ignore_ascii_case(haystack: &str, needle: &str) -> Option<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }
    haystack
        .as_bytes()
        .windows(needle.len())
        .position(|window| window.eq_ignore_ascii_case(needle.as_bytes()))
}

/// Strip code, search case-insensitively for the trigger token, and extract
/// the trimmed remainder as the prompt. `None` means no trigger.
pub fn extract_prompt(text: &str, trigger: &str) -> Option<String> {
    let stripped = strip_code(text);
    let start = find_ignore_ascii_case(&stripped, trigger)?;
    // The trigger is ASCII, so the byte offset lands on a char boundary.
    let prompt = stripped[start + trigger.len()..].trim();
    Some(prompt.to_string())
}

/// Classify one envelope. Pure: same envelope and trigger, same decision.
pub fn classify(envelope: &WebhookEnvelope, trigger: &str) -> Decision {
    let actor = &envelope.actor;
    if actor.is_system {
        return ignore("system event");
    }
    if actor.is_bot || is_bot_handle(&actor.handle) {
        return ignore("bot actor");
    }

    match &envelope.kind {
        EventKind::Issue { .. } if envelope.action != "opened" => {
            ignore("non-opening issue action")
        }
        EventKind::MergeRequest { .. } if envelope.action != "opened" => {
            ignore("non-opening MR action")
        }
        EventKind::Comment {
            body,
            target,
            anchor,
            ..
        } => {
            let mode = match target {
                CommentTarget::Issue { .. } => ProcessingMode::IssueComment,
                CommentTarget::MergeRequest { .. } => ProcessingMode::MrComment,
                CommentTarget::Other(_) => return ignore("unsupported event kind"),
            };
            match extract_prompt(body, trigger) {
                Some(prompt) => Decision::Process(Classification {
                    mode,
                    prompt: Some(prompt),
                    anchor: anchor.clone(),
                }),
                None => ignore("no trigger"),
            }
        }
        EventKind::MergeRequest { description, .. } => match extract_prompt(description, trigger) {
            Some(prompt) => Decision::Process(Classification {
                mode: ProcessingMode::MrCreation,
                prompt: Some(prompt),
                anchor: None,
            }),
            None => ignore("no trigger"),
        },
        // Opened issues process unconditionally, no trigger token required.
        EventKind::Issue { .. } => Decision::Process(Classification {
            mode: ProcessingMode::Issue,
            prompt: None,
            anchor: None,
        }),
        EventKind::Other(_) => ignore("unsupported event kind"),
    }
}
