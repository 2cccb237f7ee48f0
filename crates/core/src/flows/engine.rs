use thiserror::Error;

use crate::flows::states::{QueryAction, QueryEvent, QueryState, TransitionOutcome};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum QueryTransitionError {
    #[error("invalid query transition from {state:?} on {event:?}")]
    InvalidTransition { state: QueryState, event: QueryEvent },
    #[error("query already reached terminal state {0:?}")]
    Terminal(QueryState),
}

/// Question lifecycle: `Received -> Planned -> Executing -> Merged -> Answered`,
/// with `Failed` reachable from every non-terminal state.
#[derive(Clone, Debug, Default)]
pub struct QueryFlow;

impl QueryFlow {
    pub fn initial_state(&self) -> QueryState {
        QueryState::Received
    }

    pub fn apply(
        &self,
        current: QueryState,
        event: &QueryEvent,
    ) -> Result<TransitionOutcome, QueryTransitionError> {
        use QueryAction::{
            DeliverResults, ExecutePlan, MergeResults, RequestClarification, SurfaceFailure,
        };
        use QueryEvent::{
            Cancelled, ClassificationFailed, Classified, ExecutionFailed, ExecutionStarted,
            ResultsDelivered, ResultsMerged,
        };
        use QueryState::{Answered, Executing, Failed, Merged, Planned, Received};

        if current.is_terminal() {
            return Err(QueryTransitionError::Terminal(current));
        }

        let (to, actions) = match (current, event) {
            (Received, Classified) => (Planned, vec![ExecutePlan]),
            (Received, ClassificationFailed) => (Failed, vec![RequestClarification]),
            (Planned, ExecutionStarted) => (Executing, Vec::new()),
            (Executing, ResultsMerged) => (Merged, vec![MergeResults]),
            (Merged, ResultsDelivered) => (Answered, vec![DeliverResults]),
            (_, ExecutionFailed { .. }) | (_, Cancelled) => (Failed, vec![SurfaceFailure]),
            _ => {
                return Err(QueryTransitionError::InvalidTransition {
                    state: current,
                    event: event.clone(),
                });
            }
        };

        Ok(TransitionOutcome { from: current, to, event: event.clone(), actions })
    }
}

#[cfg(test)]
mod tests {
    use crate::flows::engine::{QueryFlow, QueryTransitionError};
    use crate::flows::states::{QueryAction, QueryEvent, QueryState};

    #[test]
    fn happy_path_reaches_answered() {
        let flow = QueryFlow;
        let mut state = flow.initial_state();

        for event in [
            QueryEvent::Classified,
            QueryEvent::ExecutionStarted,
            QueryEvent::ResultsMerged,
            QueryEvent::ResultsDelivered,
        ] {
            state = flow.apply(state, &event).expect("valid transition").to;
        }

        assert_eq!(state, QueryState::Answered);
    }

    #[test]
    fn failure_is_reachable_from_every_non_terminal_state() {
        let flow = QueryFlow;
        for state in [
            QueryState::Received,
            QueryState::Planned,
            QueryState::Executing,
            QueryState::Merged,
        ] {
            let outcome = flow
                .apply(state, &QueryEvent::ExecutionFailed { reason: "storage timeout".into() })
                .expect("failure transition");
            assert_eq!(outcome.to, QueryState::Failed);
            assert_eq!(outcome.actions, vec![QueryAction::SurfaceFailure]);
        }
    }

    #[test]
    fn classification_failure_requests_clarification() {
        let outcome = QueryFlow
            .apply(QueryState::Received, &QueryEvent::ClassificationFailed)
            .expect("clarification transition");

        assert_eq!(outcome.to, QueryState::Failed);
        assert_eq!(outcome.actions, vec![QueryAction::RequestClarification]);
    }

    #[test]
    fn terminal_states_reject_further_events() {
        let flow = QueryFlow;
        assert_eq!(
            flow.apply(QueryState::Answered, &QueryEvent::Cancelled),
            Err(QueryTransitionError::Terminal(QueryState::Answered))
        );
        assert!(matches!(
            flow.apply(QueryState::Received, &QueryEvent::ResultsMerged),
            Err(QueryTransitionError::InvalidTransition { .. })
        ));
    }
}
