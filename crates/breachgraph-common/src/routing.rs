use serde::{Deserialize, Serialize};

use crate::run::RunStatus;

/// How a run ends when the router reports a terminal step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalStatus {
    Completed,
    Failed,
}

impl From<TerminalStatus> for RunStatus {
    fn from(value: TerminalStatus) -> Self {
        match value {
            TerminalStatus::Completed => RunStatus::Completed,
            TerminalStatus::Failed => RunStatus::Failed,
        }
    }
}

/// Where a run goes after a stage reports an outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NextStep {
    /// Execute another stage.
    Stage { stage: String },
    /// Suspend before `stage` until a human picks one of `choices`.
    Pause {
        stage: String,
        prompt: String,
        choices: Vec<String>,
    },
    /// End the run.
    Terminal { status: TerminalStatus },
}

impl NextStep {
    pub fn stage(name: &str) -> Self {
        Self::Stage {
            stage: name.to_string(),
        }
    }

    pub fn pause(stage: &str, prompt: &str, choices: &[&str]) -> Self {
        Self::Pause {
            stage: stage.to_string(),
            prompt: prompt.to_string(),
            choices: choices.iter().map(|c| c.to_string()).collect(),
        }
    }

    pub fn completed() -> Self {
        Self::Terminal {
            status: TerminalStatus::Completed,
        }
    }

    pub fn failed() -> Self {
        Self::Terminal {
            status: TerminalStatus::Failed,
        }
    }

    /// The stage this step leads into, if any.
    pub fn target(&self) -> Option<&str> {
        match self {
            Self::Stage { stage } | Self::Pause { stage, .. } => Some(stage),
            Self::Terminal { .. } => None,
        }
    }
}

impl std::fmt::Display for NextStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stage { stage } => write!(f, "-> {}", stage),
            Self::Pause { stage, choices, .. } => {
                write!(f, "pause before {} [{}]", stage, choices.join("|"))
            }
            Self::Terminal { status } => match status {
                TerminalStatus::Completed => write!(f, "completed"),
                TerminalStatus::Failed => write!(f, "failed"),
            },
        }
    }
}
