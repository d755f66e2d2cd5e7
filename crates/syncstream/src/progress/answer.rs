//! Aggregated state of a streamed query answer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::stream::event::QueryEvent;

/// Lifecycle of a streamed answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnswerStatus {
    /// Request sent, nothing received yet.
    Pending,
    Streaming,
    Completed,
    Failed,
}

/// Answer text and results accumulated for one query request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerSnapshot {
    /// Request sequence number this answer belongs to.
    pub sequence: u64,
    pub answer: String,
    /// Set once `completion_done` arrived; results may still follow.
    pub answer_complete: bool,
    pub results: Vec<serde_json::Value>,
    pub status: AnswerStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub last_event_at: DateTime<Utc>,
}

impl AnswerSnapshot {
    pub fn new(sequence: u64, now: DateTime<Utc>) -> Self {
        Self {
            sequence,
            answer: String::new(),
            answer_complete: false,
            results: Vec::new(),
            status: AnswerStatus::Pending,
            error_message: None,
            started_at: now,
            last_event_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, AnswerStatus::Completed | AnswerStatus::Failed)
    }

    /// Folds one event into the answer.
    ///
    /// Text deltas append; a results event replaces the list outright.
    pub fn apply(&self, event: &QueryEvent, at: DateTime<Utc>) -> Self {
        if self.is_terminal() {
            return self.clone();
        }

        let mut next = self.clone();
        next.last_event_at = at;

        match event {
            QueryEvent::CompletionStart => {
                next.answer.clear();
                next.answer_complete = false;
                next.status = AnswerStatus::Streaming;
            }
            QueryEvent::CompletionDelta { text } => {
                next.answer.push_str(text);
                next.status = AnswerStatus::Streaming;
            }
            QueryEvent::CompletionDone { text } => {
                if let Some(text) = text {
                    next.answer = text.clone();
                }
                next.answer_complete = true;
                next.status = AnswerStatus::Streaming;
            }
            QueryEvent::Results { results } => {
                next.results = results.clone();
                next.status = AnswerStatus::Streaming;
            }
            QueryEvent::Error { message } => {
                next.status = AnswerStatus::Failed;
                next.error_message = Some(
                    message
                        .clone()
                        .filter(|m| !m.trim().is_empty())
                        .unwrap_or_else(|| "Search failed".to_string()),
                );
            }
            QueryEvent::Done => {
                next.answer_complete = true;
                next.status = AnswerStatus::Completed;
            }
            QueryEvent::Connected | QueryEvent::Heartbeat | QueryEvent::Unknown => {}
        }

        next
    }

    /// Returns a failed copy for transport-level failures.
    pub fn failed(&self, message: &str, at: DateTime<Utc>) -> Self {
        if self.is_terminal() {
            return self.clone();
        }
        let mut next = self.clone();
        next.last_event_at = at;
        next.status = AnswerStatus::Failed;
        next.error_message = Some(message.to_string());
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn delta(text: &str) -> QueryEvent {
        QueryEvent::CompletionDelta {
            text: text.to_string(),
        }
    }

    #[test]
    fn test_deltas_accumulate() {
        let now = Utc::now();
        let snapshot = AnswerSnapshot::new(1, now)
            .apply(&QueryEvent::CompletionStart, now)
            .apply(&delta("The answer"), now)
            .apply(&delta(" is 42."), now);
        assert_eq!(snapshot.answer, "The answer is 42.");
        assert_eq!(snapshot.status, AnswerStatus::Streaming);
    }

    #[test]
    fn test_results_replace_wholesale() {
        let now = Utc::now();
        let snapshot = AnswerSnapshot::new(1, now)
            .apply(
                &QueryEvent::Results {
                    results: vec![json!({"id": "a"}), json!({"id": "b"})],
                },
                now,
            )
            .apply(
                &QueryEvent::Results {
                    results: vec![json!({"id": "b"})],
                },
                now,
            );
        assert_eq!(snapshot.results, vec![json!({"id": "b"})]);
    }

    #[test]
    fn test_completion_done_with_text_is_authoritative() {
        let now = Utc::now();
        let snapshot = AnswerSnapshot::new(1, now)
            .apply(&delta("partial"), now)
            .apply(
                &QueryEvent::CompletionDone {
                    text: Some("full answer".to_string()),
                },
                now,
            );
        assert_eq!(snapshot.answer, "full answer");
        assert!(snapshot.answer_complete);
        assert!(!snapshot.is_terminal());
    }

    #[test]
    fn test_done_freezes_answer() {
        let now = Utc::now();
        let done = AnswerSnapshot::new(1, now)
            .apply(&delta("final"), now)
            .apply(&QueryEvent::Done, now);
        assert_eq!(done.status, AnswerStatus::Completed);

        let after = done.apply(&delta(" more"), now).apply(
            &QueryEvent::Results {
                results: vec![json!(1)],
            },
            now,
        );
        assert_eq!(after, done);
    }

    #[test]
    fn test_error_event_fails_answer() {
        let now = Utc::now();
        let snapshot = AnswerSnapshot::new(3, now).apply(
            &QueryEvent::Error {
                message: Some("rate limited".to_string()),
            },
            now,
        );
        assert_eq!(snapshot.status, AnswerStatus::Failed);
        assert_eq!(snapshot.error_message.as_deref(), Some("rate limited"));
    }
}
