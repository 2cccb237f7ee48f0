pub mod engine;
pub mod states;

pub use engine::{QueryFlow, QueryTransitionError};
pub use states::{QueryAction, QueryEvent, QueryState, TransitionOutcome};
