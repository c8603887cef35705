//! Per-query flow state and the validation-loop state machine.
//!
//! The loop is an explicit FSM with pure transitions so every path is
//! enumerable in tests. Flow state is owned by one query's task and
//! never shared.

use serde::Serialize;
use std::fmt;

/// Gate outcome for a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Routing {
    Continue,
    Stop,
}

/// Mutable state for a single query, owned by its task.
#[derive(Debug, Clone, Serialize)]
pub struct FlowState {
    /// The query as currently phrased; refinement rewrites it.
    pub current_query: String,
    /// Completed generation passes.
    pub retry_count: u32,
    pub last_answer: Option<String>,
    pub routing: Routing,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat_history: Option<String>,
}

impl FlowState {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            current_query: query.into(),
            retry_count: 0,
            last_answer: None,
            routing: Routing::Continue,
            chat_history: None,
        }
    }

    pub fn with_history(mut self, history: Option<String>) -> Self {
        self.chat_history = history;
        self
    }

    /// Bookkeeping after one generation pass: exactly one increment,
    /// whatever the pass produced.
    pub fn record_pass(&mut self, answer: Option<String>) {
        self.retry_count += 1;
        self.last_answer = answer;
    }
}

/// Validation-loop states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    /// A generation pass just completed.
    Answered,
    /// The answer is being judged.
    Validating,
    /// The query is being rewritten for another pass.
    Refining,
    /// The loop is over; `last_answer` is the result.
    Terminal,
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoopState::Answered => "answered",
            LoopState::Validating => "validating",
            LoopState::Refining => "refining",
            LoopState::Terminal => "terminal",
        };
        write!(f, "{}", name)
    }
}

/// Events fed to the loop by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopEvent {
    AnswerProduced,
    /// The pass deliberately produced nothing.
    SentinelAnswer,
    JudgedRelevant,
    JudgedIrrelevant,
    QueryRefined,
}

impl LoopState {
    /// Pure transition function.
    ///
    /// Events that do not apply to the current state leave it unchanged;
    /// `Terminal` absorbs everything. The only guarded edge is
    /// irrelevant-with-budget-left, which re-enters the loop.
    pub fn advance(self, event: LoopEvent, retry_count: u32, max_retry_count: u32) -> LoopState {
        use LoopEvent::*;
        use LoopState::*;
        match (self, event) {
            (Answered, AnswerProduced) => Validating,
            (Validating, SentinelAnswer) => Terminal,
            (Validating, JudgedRelevant) => Terminal,
            (Validating, JudgedIrrelevant) if retry_count < max_retry_count => Refining,
            (Validating, JudgedIrrelevant) => Terminal,
            (Refining, QueryRefined) => Answered,
            (Terminal, _) => Terminal,
            (state, _) => state,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use LoopEvent::*;
    use LoopState::*;

    #[test]
    fn test_happy_path_transitions() {
        let s = Answered.advance(AnswerProduced, 1, 3);
        assert_eq!(s, Validating);
        assert_eq!(s.advance(JudgedRelevant, 1, 3), Terminal);
    }

    #[test]
    fn test_sentinel_terminates_without_validation() {
        assert_eq!(Validating.advance(SentinelAnswer, 1, 3), Terminal);
    }

    #[test]
    fn test_irrelevant_refines_while_budget_remains() {
        assert_eq!(Validating.advance(JudgedIrrelevant, 1, 3), Refining);
        assert_eq!(Validating.advance(JudgedIrrelevant, 2, 3), Refining);
        assert_eq!(Validating.advance(JudgedIrrelevant, 3, 3), Terminal);
    }

    #[test]
    fn test_refined_query_restarts_loop() {
        assert_eq!(Refining.advance(QueryRefined, 1, 3), Answered);
    }

    #[test]
    fn test_terminal_absorbs_everything() {
        for event in [
            AnswerProduced,
            SentinelAnswer,
            JudgedRelevant,
            JudgedIrrelevant,
            QueryRefined,
        ] {
            assert_eq!(Terminal.advance(event, 0, 3), Terminal);
        }
    }

    #[test]
    fn test_non_applicable_events_are_ignored() {
        assert_eq!(Answered.advance(JudgedRelevant, 0, 3), Answered);
        assert_eq!(Validating.advance(QueryRefined, 0, 3), Validating);
        assert_eq!(Refining.advance(AnswerProduced, 0, 3), Refining);
    }

    /// Simulated driver with a validator that always rejects: the loop
    /// must stop after exactly `max_retry_count` generation passes.
    #[test]
    fn test_pass_count_is_bounded() {
        for max in 1..=5u32 {
            let mut state = FlowState::new("q");
            let mut loop_state = Answered;
            let mut passes = 0u32;
            loop {
                // One generation pass just happened on entry to Answered.
                passes += 1;
                state.record_pass(Some(format!("attempt {}", passes)));
                loop_state = loop_state.advance(AnswerProduced, state.retry_count, max);
                loop_state = loop_state.advance(JudgedIrrelevant, state.retry_count, max);
                match loop_state {
                    Terminal => break,
                    Refining => {
                        loop_state = loop_state.advance(QueryRefined, state.retry_count, max);
                    }
                    _ => unreachable!("loop left in {:?}", loop_state),
                }
            }
            assert_eq!(passes, max);
            assert!(state.retry_count <= max);
        }
    }

    #[test]
    fn test_record_pass_increments_once() {
        let mut state = FlowState::new("q");
        state.record_pass(None);
        state.record_pass(Some("a".to_string()));
        assert_eq!(state.retry_count, 2);
        assert_eq!(state.last_answer.as_deref(), Some("a"));
    }

    #[test]
    fn test_loop_state_display() {
        assert_eq!(Validating.to_string(), "validating");
        assert_eq!(Terminal.to_string(), "terminal");
    }
}
