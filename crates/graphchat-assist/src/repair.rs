//! Bounded automatic repair of diagrams that fail to render.
//!
//! One [`RepairController`] lives inside the chat shell per active
//! conversation. A render failure on a settled response becomes a corrective
//! user turn, at most [`MAX_AUTO_REGENERATIONS`] times per conversation and
//! dialect. The per-response flag, not the counter, is what keeps duplicate
//! failure reports for one response from dispatching twice.

use serde::Serialize;
use tracing::{debug, info};

use graphchat_core::classify::{classify, ClassifiedError};
use graphchat_core::Dialect;

use crate::prompt::{corrective_instruction, repair_budget_exhausted_notice};
use crate::shell::ResponseStatus;

pub const MAX_AUTO_REGENERATIONS: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RepairSessionState {
    pub attempts_used: u32,
    pub has_attempted_for_current_response: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum RepairPhase {
    #[default]
    Idle,
    AttemptPending,
    AwaitingModelResponse,
    CeilingReached,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RepairAttempt {
    /// 1-based, never above [`MAX_AUTO_REGENERATIONS`].
    pub attempt_number: u32,
    pub classified_error: ClassifiedError,
    pub corrective_instruction: String,
}

/// Who asked for a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOrigin {
    User,
    Repair,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// The failure belongs to a response other than the current one.
    StaleResponse,
    /// The response has not settled to `Ready`.
    NotSettled,
    AlreadyAttempted,
    CeilingReached,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepairDecision {
    /// Send this corrective instruction as the next user turn.
    Dispatch(RepairAttempt),
    /// Show the fixed exhaustion notice. Returned at most once per context.
    NotifyExhausted(&'static str),
    Ignore(IgnoreReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct RepairContext {
    chat_id: String,
    dialect: Option<Dialect>,
}

#[derive(Debug, Default)]
pub struct RepairController {
    context: Option<RepairContext>,
    state: RepairSessionState,
    phase: RepairPhase,
    current_response: Option<String>,
}

impl RepairController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> RepairSessionState {
        self.state
    }

    pub fn phase(&self) -> RepairPhase {
        self.phase
    }

    /// Switch to a conversation/dialect context. A different context starts
    /// with a fresh budget; returns whether a reset happened.
    pub fn enter_context(&mut self, chat_id: &str, dialect: Option<Dialect>) -> bool {
        let next = RepairContext {
            chat_id: chat_id.to_string(),
            dialect,
        };
        if self.context.as_ref() == Some(&next) {
            return false;
        }
        debug!(chat_id, ?dialect, "repair context reset");
        self.context = Some(next);
        self.state = RepairSessionState::default();
        self.phase = RepairPhase::Idle;
        self.current_response = None;
        true
    }

    /// A new assistant response has started streaming.
    pub fn begin_response(&mut self, response_id: &str, origin: TurnOrigin) {
        self.current_response = Some(response_id.to_string());
        match (origin, self.phase) {
            (_, RepairPhase::CeilingReached) => {}
            (TurnOrigin::Repair, _) => self.phase = RepairPhase::AwaitingModelResponse,
            (TurnOrigin::User, _) => {
                self.state.has_attempted_for_current_response = false;
                self.phase = RepairPhase::Idle;
            }
        }
    }

    /// The response finished streaming, whatever it contains.
    pub fn on_response_settled(&mut self, response_id: &str) {
        if self.current_response.as_deref() != Some(response_id) {
            return;
        }
        if self.phase == RepairPhase::AwaitingModelResponse {
            self.state.has_attempted_for_current_response = false;
            self.phase = RepairPhase::Idle;
        }
    }

    /// Stop pressed. An aborted response is never classified and costs nothing.
    pub fn on_user_abort(&mut self) {
        debug!(state = ?self.state, "response aborted; repair state unchanged");
    }

    pub fn on_render_failure(
        &mut self,
        response_id: &str,
        status: ResponseStatus,
        dialect: Dialect,
        error_message: &str,
        source: &str,
    ) -> RepairDecision {
        if self.current_response.as_deref() != Some(response_id) {
            return RepairDecision::Ignore(IgnoreReason::StaleResponse);
        }
        if status != ResponseStatus::Ready {
            return RepairDecision::Ignore(IgnoreReason::NotSettled);
        }
        if self.phase == RepairPhase::CeilingReached {
            return RepairDecision::Ignore(IgnoreReason::CeilingReached);
        }
        if self.state.has_attempted_for_current_response {
            return RepairDecision::Ignore(IgnoreReason::AlreadyAttempted);
        }

        if self.state.attempts_used >= MAX_AUTO_REGENERATIONS {
            self.phase = RepairPhase::CeilingReached;
            info!(attempts = self.state.attempts_used, "repair budget exhausted");
            return RepairDecision::NotifyExhausted(repair_budget_exhausted_notice());
        }

        self.phase = RepairPhase::AttemptPending;
        let classified_error = classify(error_message, source);
        self.state.has_attempted_for_current_response = true;
        self.state.attempts_used += 1;

        let attempt_number = self.state.attempts_used;
        info!(
            attempt = attempt_number,
            category = %classified_error.category,
            "dispatching corrective instruction"
        );
        RepairDecision::Dispatch(RepairAttempt {
            attempt_number,
            corrective_instruction: corrective_instruction(dialect, &classified_error, attempt_number),
            classified_error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use graphchat_core::classify::ErrorCategory;
    use proptest::prelude::*;

    const BROKEN: &str = "flowchart TD\nA[Start] --> B[Proc";
    const MESSAGE: &str =
        "Parse error on line 2:\nA[Start] --> B[Proc\n-------------------^\nExpecting 'SQE', got 'EOF'";

    fn controller() -> RepairController {
        let mut c = RepairController::new();
        c.enter_context("chat-1", Some(Dialect::Flowchart));
        c
    }

    fn fail(c: &mut RepairController, response: &str) -> RepairDecision {
        c.on_render_failure(response, ResponseStatus::Ready, Dialect::Flowchart, MESSAGE, BROKEN)
    }

    #[test]
    fn first_failure_dispatches_attempt_one_with_literal_error() {
        let mut c = controller();
        c.begin_response("r1", TurnOrigin::User);
        let RepairDecision::Dispatch(attempt) = fail(&mut c, "r1") else {
            panic!("expected dispatch");
        };
        assert_eq!(attempt.attempt_number, 1);
        assert_eq!(attempt.classified_error.category, ErrorCategory::UnclosedBracket);
        assert!(attempt.corrective_instruction.contains(MESSAGE));
        assert_eq!(c.phase(), RepairPhase::AttemptPending);
        assert!(c.state().has_attempted_for_current_response);
    }

    #[test]
    fn duplicate_failure_reports_dispatch_once() {
        let mut c = controller();
        c.begin_response("r1", TurnOrigin::User);
        assert!(matches!(fail(&mut c, "r1"), RepairDecision::Dispatch(_)));
        assert_eq!(
            fail(&mut c, "r1"),
            RepairDecision::Ignore(IgnoreReason::AlreadyAttempted)
        );
        assert_eq!(c.state().attempts_used, 1);
    }

    #[test]
    fn failures_before_ready_or_from_old_responses_are_ignored() {
        let mut c = controller();
        c.begin_response("r1", TurnOrigin::User);
        let streaming = c.on_render_failure("r1", ResponseStatus::Streaming, Dialect::Flowchart, MESSAGE, BROKEN);
        assert_eq!(streaming, RepairDecision::Ignore(IgnoreReason::NotSettled));
        assert_eq!(fail(&mut c, "r0"), RepairDecision::Ignore(IgnoreReason::StaleResponse));
        assert_eq!(c.state(), RepairSessionState::default());
    }

    #[test]
    fn ceiling_sends_exactly_one_notice() {
        let mut c = controller();
        c.begin_response("r1", TurnOrigin::User);
        assert!(matches!(fail(&mut c, "r1"), RepairDecision::Dispatch(_)));
        c.begin_response("r2", TurnOrigin::Repair);
        assert_eq!(c.phase(), RepairPhase::AwaitingModelResponse);
        c.on_response_settled("r2");
        assert!(matches!(fail(&mut c, "r2"), RepairDecision::Dispatch(a) if a.attempt_number == 2));
        c.begin_response("r3", TurnOrigin::Repair);
        c.on_response_settled("r3");

        assert_eq!(
            fail(&mut c, "r3"),
            RepairDecision::NotifyExhausted(repair_budget_exhausted_notice())
        );
        assert_eq!(fail(&mut c, "r3"), RepairDecision::Ignore(IgnoreReason::CeilingReached));
        assert_eq!(c.phase(), RepairPhase::CeilingReached);
        assert_eq!(c.state().attempts_used, MAX_AUTO_REGENERATIONS);

        c.begin_response("r4", TurnOrigin::User);
        c.on_response_settled("r4");
        assert_eq!(fail(&mut c, "r4"), RepairDecision::Ignore(IgnoreReason::CeilingReached));
    }

    #[test]
    fn abort_leaves_state_untouched() {
        let mut c = controller();
        c.begin_response("r1", TurnOrigin::User);
        fail(&mut c, "r1");
        c.begin_response("r2", TurnOrigin::Repair);
        let (state, phase) = (c.state(), c.phase());
        c.on_user_abort();
        assert_eq!(c.state(), state);
        assert_eq!(c.phase(), phase);
    }

    #[test]
    fn dialect_switch_resets_exhausted_budget() {
        let mut c = controller();
        for (i, origin) in [TurnOrigin::User, TurnOrigin::Repair, TurnOrigin::Repair].into_iter().enumerate() {
            let id = format!("r{i}");
            c.begin_response(&id, origin);
            c.on_response_settled(&id);
            fail(&mut c, &id);
        }
        assert_eq!(c.phase(), RepairPhase::CeilingReached);

        assert!(!c.enter_context("chat-1", Some(Dialect::Flowchart)));
        assert!(c.enter_context("chat-1", Some(Dialect::Outline)));
        assert_eq!(c.state(), RepairSessionState::default());
        assert_eq!(c.phase(), RepairPhase::Idle);
    }

    #[derive(Debug, Clone)]
    enum Event {
        UserTurn,
        RepairTurn,
        Settle,
        Failure { ready: bool },
        Abort,
        SwitchDialect,
    }

    fn event() -> impl Strategy<Value = Event> {
        prop_oneof![
            Just(Event::UserTurn),
            Just(Event::RepairTurn),
            Just(Event::Settle),
            any::<bool>().prop_map(|ready| Event::Failure { ready }),
            Just(Event::Abort),
            Just(Event::SwitchDialect),
        ]
    }

    proptest! {
        #[test]
        fn budget_never_exceeds_ceiling(events in prop::collection::vec(event(), 0..64)) {
            let mut c = controller();
            let mut response = 0u32;
            let mut dialect = Dialect::Flowchart;
            let mut notices = 0;
            for event in events {
                let id = format!("r{response}");
                match event {
                    Event::UserTurn | Event::RepairTurn => {
                        response += 1;
                        let origin = if matches!(event, Event::UserTurn) { TurnOrigin::User } else { TurnOrigin::Repair };
                        c.begin_response(&format!("r{response}"), origin);
                    }
                    Event::Settle => c.on_response_settled(&id),
                    Event::Failure { ready } => {
                        let status = if ready { ResponseStatus::Ready } else { ResponseStatus::Streaming };
                        if let RepairDecision::NotifyExhausted(_) =
                            c.on_render_failure(&id, status, dialect, MESSAGE, BROKEN)
                        {
                            notices += 1;
                        }
                    }
                    Event::Abort => {
                        let before = (c.state(), c.phase());
                        c.on_user_abort();
                        prop_assert_eq!(before, (c.state(), c.phase()));
                    }
                    Event::SwitchDialect => {
                        dialect = match dialect {
                            Dialect::Flowchart => Dialect::Outline,
                            Dialect::Outline => Dialect::Flowchart,
                        };
                        c.enter_context("chat-1", Some(dialect));
                        notices = 0;
                        prop_assert_eq!(c.state().attempts_used, 0);
                    }
                }
                prop_assert!(c.state().attempts_used <= MAX_AUTO_REGENERATIONS);
                prop_assert!(notices <= 1);
            }
        }
    }
}
