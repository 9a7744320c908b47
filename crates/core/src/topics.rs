//! Topic names used on the bus and the pattern syntax subscriptions use.
//!
//! Topics are dot-separated tokens. A pattern token `*` matches exactly one
//! token; a trailing `>` matches one or more remaining tokens.

use std::fmt;

pub const ANNOUNCE: &str = "agent.announce";
pub const STATUS_PATTERN: &str = "agent.*.status";
pub const TASKS_PATTERN: &str = "tasks.*";
pub const TASK_RESULT: &str = "task.result";
pub const BROADCAST: &str = "broadcast";
pub const DIRECTORY_LIST: &str = "directory.list";
pub const DIRECTORY_GET: &str = "directory.get";
pub const CAPABILITY_REQUEST: &str = "capability.request";
/// Shared topic the broker republishes capability requests on; agents answer here.
pub const CAPABILITY_DISPATCH: &str = "capability.dispatch";

const INBOX_PREFIX: &str = "_inbox";

/// Heartbeat channel for one agent.
pub fn status(agent_id: &str) -> String {
    format!("agent.{}.status", agent_id)
}

/// Agent-specific event topic.
pub fn events(agent_id: &str) -> String {
    format!("agent.{}.events", agent_id)
}

/// Type-scoped task topic.
pub fn tasks(task_type: &str) -> String {
    format!("tasks.{}", task_type)
}

/// A fresh, unique reply inbox for one request.
pub fn inbox() -> String {
    format!("{}.{}", INBOX_PREFIX, uuid::Uuid::new_v4().simple())
}

/// Extract `<id>` from `agent.<id>.status`.
pub fn agent_id_from_status(topic: &str) -> Option<&str> {
    let rest = topic.strip_prefix("agent.")?;
    let id = rest.strip_suffix(".status")?;
    if id.is_empty() || id.contains('.') {
        None
    } else {
        Some(id)
    }
}

/// Agent ids are embedded in topic names, so they must be a single token.
pub fn is_valid_token(token: &str) -> bool {
    !token.is_empty()
        && !token.contains(['.', '*', '>'])
        && !token.chars().any(char::is_whitespace)
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Any,
    Tail,
}

/// A parsed subscription pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicPattern {
    raw: String,
    segments: Vec<Segment>,
}

impl TopicPattern {
    pub fn parse(pattern: &str) -> crate::Result<Self> {
        if pattern.is_empty() {
            return Err(crate::Error::Validation("empty topic pattern".to_string()));
        }
        let tokens: Vec<&str> = pattern.split('.').collect();
        let mut segments = Vec::with_capacity(tokens.len());
        for (i, token) in tokens.iter().enumerate() {
            let segment = match *token {
                "" => {
                    return Err(crate::Error::Validation(format!(
                        "empty token in topic pattern '{}'",
                        pattern
                    )))
                }
                "*" => Segment::Any,
                ">" if i == tokens.len() - 1 => Segment::Tail,
                ">" => {
                    return Err(crate::Error::Validation(format!(
                        "'>' must be the last token in '{}'",
                        pattern
                    )))
                }
                literal => Segment::Literal(literal.to_string()),
            };
            segments.push(segment);
        }
        Ok(Self {
            raw: pattern.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn matches(&self, topic: &str) -> bool {
        let mut tokens = topic.split('.');
        for segment in &self.segments {
            match segment {
                Segment::Tail => return tokens.next().is_some_and(|t| !t.is_empty()),
                Segment::Any => match tokens.next() {
                    Some(t) if !t.is_empty() => {}
                    _ => return false,
                },
                Segment::Literal(lit) => match tokens.next() {
                    Some(t) if t == lit => {}
                    _ => return false,
                },
            }
        }
        tokens.next().is_none()
    }
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pat(p: &str) -> TopicPattern {
        TopicPattern::parse(p).unwrap()
    }

    #[test]
    fn test_literal_pattern() {
        assert!(pat("task.result").matches("task.result"));
        assert!(!pat("task.result").matches("task.results"));
        assert!(!pat("task.result").matches("task.result.extra"));
    }

    #[test]
    fn test_single_token_wildcard() {
        let p = pat(STATUS_PATTERN);
        assert!(p.matches("agent.agent-1.status"));
        assert!(!p.matches("agent.status"));
        assert!(!p.matches("agent.a.b.status"));
        assert!(pat(TASKS_PATTERN).matches("tasks.echo"));
        assert!(!pat(TASKS_PATTERN).matches("tasks"));
    }

    #[test]
    fn test_tail_wildcard() {
        let p = pat("agent.>");
        assert!(p.matches("agent.announce"));
        assert!(p.matches("agent.a1.events"));
        assert!(!p.matches("agent"));
        assert!(pat(">").matches("broadcast"));
    }

    #[test]
    fn test_invalid_patterns() {
        assert!(TopicPattern::parse("").is_err());
        assert!(TopicPattern::parse("a..b").is_err());
        assert!(TopicPattern::parse("a.>.b").is_err());
    }

    #[test]
    fn test_topic_helpers() {
        assert_eq!(status("a1"), "agent.a1.status");
        assert_eq!(events("a1"), "agent.a1.events");
        assert_eq!(tasks("echo"), "tasks.echo");
        assert_eq!(agent_id_from_status("agent.a1.status"), Some("a1"));
        assert_eq!(agent_id_from_status("agent.a.b.status"), None);
        assert_eq!(agent_id_from_status("agent.announce"), None);
        assert!(inbox().starts_with("_inbox."));
        assert_ne!(inbox(), inbox());
    }

    #[test]
    fn test_valid_token() {
        assert!(is_valid_token("agent-1"));
        assert!(!is_valid_token("agent.1"));
        assert!(!is_valid_token("a b"));
        assert!(!is_valid_token(""));
    }
}
