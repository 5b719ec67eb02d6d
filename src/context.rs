//! Conversation Memory and Context Budget
//!
//! Conversation turns plus the trimming that keeps every outbound LLM call
//! under a fixed token budget. Token counts are estimated from character
//! length (about four characters per token) with a fixed per-message
//! overhead; exactness is not required, only consistency.

use crate::error::{AnalystError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use tracing::debug;

/// Comfortably under a 128k-token window.
pub const DEFAULT_BUDGET_TOKENS: usize = 120_000;

/// Smallest budget accepted at startup.
pub const MIN_BUDGET_TOKENS: usize = 1_024;

/// Formatting overhead charged for every message.
pub const MESSAGE_OVERHEAD_TOKENS: usize = 4;

pub const CHARS_PER_TOKEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured data attached to an assistant turn.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TurnPayload {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub charts: Vec<PathBuf>,
}

/// One message of the conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: String,
    #[serde(default)]
    pub payload: Option<TurnPayload>,
    pub timestamp: DateTime<Utc>,
}

impl ConversationTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            payload: None,
            timestamp: Utc::now(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            payload: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_payload(mut self, payload: TurnPayload) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Only the text is sent to the model, so only the text is counted.
    pub fn estimated_tokens(&self) -> usize {
        estimate_tokens(self.role.as_str()) + estimate_tokens(&self.content) + MESSAGE_OVERHEAD_TOKENS
    }
}

pub fn estimate_tokens(text: &str) -> usize {
    let chars = text.chars().count();
    (chars + CHARS_PER_TOKEN - 1) / CHARS_PER_TOKEN
}

pub fn estimate_history_tokens(turns: &[ConversationTurn]) -> usize {
    turns.iter().map(ConversationTurn::estimated_tokens).sum()
}

/// A token budget validated at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextBudget {
    tokens: usize,
}

impl ContextBudget {
    pub fn new(tokens: usize) -> Result<Self> {
        if tokens < MIN_BUDGET_TOKENS {
            return Err(AnalystError::ContextBudgetExceeded(format!(
                "budget of {} tokens is below the minimum of {}",
                tokens, MIN_BUDGET_TOKENS
            )));
        }
        Ok(Self { tokens })
    }

    pub fn tokens(&self) -> usize {
        self.tokens
    }

    /// Largest question accepted: half the budget, leaving the rest for the
    /// stage prompts and schema.
    pub fn max_question_tokens(&self) -> usize {
        self.tokens / 2
    }

    /// Budget left for history once `reserved` tokens of prompt are accounted for.
    pub fn history_allowance(&self, reserved: usize) -> usize {
        self.tokens.saturating_sub(reserved)
    }
}

impl Default for ContextBudget {
    fn default() -> Self {
        Self {
            tokens: DEFAULT_BUDGET_TOKENS,
        }
    }
}

/// History after trimming, tagged with whether anything was evicted.
#[derive(Debug, Clone, PartialEq)]
pub enum TrimmedHistory {
    /// Everything fit.
    Intact(Vec<ConversationTurn>),
    /// Nothing was dropped, but the turns from the latest user question
    /// onward already exceed the budget.
    OverBudget(Vec<ConversationTurn>),
    /// The oldest `dropped` turns were evicted. `over_budget` is set when the
    /// mandatory suffix (the latest user question onward) alone exceeds the
    /// budget and was kept anyway.
    Evicted {
        turns: Vec<ConversationTurn>,
        dropped: usize,
        over_budget: bool,
    },
}

impl TrimmedHistory {
    pub fn turns(&self) -> &[ConversationTurn] {
        match self {
            TrimmedHistory::Intact(turns) | TrimmedHistory::OverBudget(turns) => turns,
            TrimmedHistory::Evicted { turns, .. } => turns,
        }
    }

    pub fn into_turns(self) -> Vec<ConversationTurn> {
        match self {
            TrimmedHistory::Intact(turns) | TrimmedHistory::OverBudget(turns) => turns,
            TrimmedHistory::Evicted { turns, .. } => turns,
        }
    }

    pub fn dropped(&self) -> usize {
        match self {
            TrimmedHistory::Intact(_) | TrimmedHistory::OverBudget(_) => 0,
            TrimmedHistory::Evicted { dropped, .. } => *dropped,
        }
    }

    pub fn was_evicted(&self) -> bool {
        self.dropped() > 0
    }

    /// True when the kept turns still exceed the budget.
    pub fn is_over_budget(&self) -> bool {
        matches!(
            self,
            TrimmedHistory::OverBudget(_) | TrimmedHistory::Evicted { over_budget: true, .. }
        )
    }

    pub fn estimated_tokens(&self) -> usize {
        estimate_history_tokens(self.turns())
    }
}

/// Drop the oldest turns until the history fits `budget_tokens`.
///
/// The result is always a contiguous suffix of `history`; turns are kept or
/// dropped whole. The suffix starting at the most recent user turn is always
/// kept, even when it alone exceeds the budget.
pub fn trim(history: &[ConversationTurn], budget_tokens: usize) -> TrimmedHistory {
    let mandatory_start = history
        .iter()
        .rposition(|t| t.role == Role::User)
        .unwrap_or(history.len());

    let mut used = estimate_history_tokens(&history[mandatory_start..]);
    let over_budget = used > budget_tokens;

    let mut start = mandatory_start;
    if !over_budget {
        while start > 0 {
            let cost = history[start - 1].estimated_tokens();
            if used + cost > budget_tokens {
                break;
            }
            used += cost;
            start -= 1;
        }
    }

    let turns = history[start..].to_vec();
    if start == 0 {
        return if over_budget {
            TrimmedHistory::OverBudget(turns)
        } else {
            TrimmedHistory::Intact(turns)
        };
    }

    debug!(
        "Context trim evicted {} of {} turns (~{} tokens kept, budget {})",
        start,
        history.len(),
        used,
        budget_tokens
    );
    TrimmedHistory::Evicted {
        turns,
        dropped: start,
        over_budget,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn turn(role: Role, chars: usize) -> ConversationTurn {
        let content = "x".repeat(chars);
        match role {
            Role::User => ConversationTurn::user(content),
            Role::Assistant => ConversationTurn::assistant(content),
        }
    }

    fn conversation(n: usize) -> Vec<ConversationTurn> {
        (0..n)
            .map(|i| {
                if i % 2 == 0 {
                    turn(Role::User, 40 + i * 10)
                } else {
                    turn(Role::Assistant, 400 + i * 25)
                }
            })
            .collect()
    }

    #[test]
    fn test_estimate_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
        // user = 1 token, content 8 chars = 2 tokens, overhead 4
        assert_eq!(ConversationTurn::user("12345678").estimated_tokens(), 7);
    }

    #[test]
    fn test_fitting_history_is_intact() {
        let history = conversation(6);
        let trimmed = trim(&history, 100_000);
        assert!(!trimmed.was_evicted());
        assert_eq!(trimmed.turns(), history.as_slice());
    }

    #[test]
    fn test_trim_is_suffix_and_within_budget() {
        let history = conversation(20);
        for budget in [50, 150, 300, 700, 1500, 4000] {
            let trimmed = trim(&history, budget);
            let kept = trimmed.turns();
            assert!(kept.len() <= history.len());
            assert_eq!(kept, &history[history.len() - kept.len()..]);
            assert_eq!(trimmed.dropped(), history.len() - kept.len());
            if !trimmed.is_over_budget() {
                assert!(trimmed.estimated_tokens() <= budget);
            }
        }
    }

    #[test]
    fn test_trim_is_idempotent() {
        let history = conversation(15);
        for budget in [10, 200, 900, 3000, 100_000] {
            let once = trim(&history, budget);
            let twice = trim(once.turns(), budget);
            assert_eq!(once.turns(), twice.turns());
        }
    }

    #[test]
    fn test_longer_history_never_keeps_more_tokens() {
        let history = conversation(16);
        // Prefixes of odd length end on a user turn, so each pair is comparable.
        for budget in [60, 300, 800, 2_000, 100_000] {
            for n in (1..history.len() - 1).step_by(2) {
                let shorter = trim(&history[..n], budget);
                let longer = trim(&history[..n + 2], budget);

                if !shorter.is_over_budget() && !longer.is_over_budget() {
                    assert!(shorter.estimated_tokens() <= budget);
                    assert!(longer.estimated_tokens() <= budget);
                }
                if longer.is_over_budget() {
                    // Only the mandatory question is kept, and it never grows.
                    assert_eq!(longer.turns().len(), 1);
                }
                // Appending turns never lets the kept window reach further back.
                let shorter_start = n - shorter.turns().len();
                let longer_start = n + 2 - longer.turns().len();
                assert!(longer_start >= shorter_start, "budget {} prefix {}", budget, n);
            }
        }
    }

    #[test]
    fn test_oversized_question_alone_is_flagged() {
        let history = vec![turn(Role::User, 4_000)];
        let trimmed = trim(&history, 100);
        assert_eq!(trimmed, TrimmedHistory::OverBudget(history.clone()));
        assert!(trimmed.is_over_budget());
        assert!(!trimmed.was_evicted());
        assert_eq!(trimmed.dropped(), 0);

        assert!(!trim(&history, 2_000).is_over_budget());
    }

    #[test]
    fn test_latest_user_question_always_kept() {
        let mut history = conversation(6);
        history.push(turn(Role::User, 4_000));
        let trimmed = trim(&history, 50);
        match &trimmed {
            TrimmedHistory::Evicted {
                turns,
                dropped,
                over_budget,
            } => {
                assert_eq!(turns.len(), 1);
                assert_eq!(turns[0].role, Role::User);
                assert_eq!(*dropped, 6);
                assert!(*over_budget);
            }
            other => panic!("expected eviction, got {:?}", other),
        }
    }

    #[test]
    fn test_assistant_tail_keeps_question_before_it() {
        let history = vec![
            turn(Role::User, 4_000),
            turn(Role::Assistant, 4_000),
            turn(Role::User, 20),
            turn(Role::Assistant, 20),
        ];
        let trimmed = trim(&history, 40);
        assert_eq!(trimmed.turns(), &history[2..]);
        assert_eq!(trimmed.dropped(), 2);
    }

    #[test]
    fn test_empty_history() {
        let trimmed = trim(&[], 100);
        assert_eq!(trimmed, TrimmedHistory::Intact(Vec::new()));
    }

    #[test]
    fn test_budget_below_minimum_is_rejected() {
        assert!(matches!(
            ContextBudget::new(MIN_BUDGET_TOKENS - 1),
            Err(AnalystError::ContextBudgetExceeded(_))
        ));
        let budget = ContextBudget::new(MIN_BUDGET_TOKENS).unwrap();
        assert_eq!(budget.history_allowance(MIN_BUDGET_TOKENS + 10), 0);
    }
}
