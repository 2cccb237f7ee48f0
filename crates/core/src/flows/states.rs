use serde::{Deserialize, Serialize};

/// Lifecycle of one question. `Answered` and `Failed` are terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryState {
    Received,
    Planned,
    Executing,
    Merged,
    Answered,
    Failed,
}

impl QueryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Planned => "planned",
            Self::Executing => "executing",
            Self::Merged => "merged",
            Self::Answered => "answered",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "received" => Some(Self::Received),
            "planned" => Some(Self::Planned),
            "executing" => Some(Self::Executing),
            "merged" => Some(Self::Merged),
            "answered" => Some(Self::Answered),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Answered | Self::Failed)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryEvent {
    Classified,
    ClassificationFailed,
    ExecutionStarted,
    ResultsMerged,
    ResultsDelivered,
    ExecutionFailed { reason: String },
    Cancelled,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryAction {
    ExecutePlan,
    MergeResults,
    DeliverResults,
    RequestClarification,
    SurfaceFailure,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionOutcome {
    pub from: QueryState,
    pub to: QueryState,
    pub event: QueryEvent,
    pub actions: Vec<QueryAction>,
}
