use anyhow::{Result, bail};
use breachgraph_common::PendingApproval;
use dialoguer::{Select, theme::ColorfulTheme};

const LEAVE_PAUSED: &str = "Leave the run paused";

#[derive(Debug, Clone, PartialEq)]
pub enum GateDecision {
    /// One of the choices the run offered.
    Choose(String),
    /// Keep the run paused; decide later.
    Abort,
}

/// Collects a human decision for a paused run.
pub struct DecisionGate {
    pub skip_all: bool,
}

impl DecisionGate {
    pub fn new(skip_all: bool) -> Self {
        Self { skip_all }
    }

    pub fn decide(&self, approval: &PendingApproval) -> Result<GateDecision> {
        let Some(first) = approval.choices.first() else {
            bail!(
                "Decision point '{}' offers no choices",
                approval.decision_point
            );
        };

        // --yes takes the first offered choice
        if self.skip_all {
            println!(
                "  {} {} (--yes flag)",
                console::style("Auto-selected").dim(),
                console::style(first).cyan()
            );
            return Ok(GateDecision::Choose(first.clone()));
        }

        self.prompt_user(approval)
    }

    fn prompt_user(&self, approval: &PendingApproval) -> Result<GateDecision> {
        let mut options: Vec<String> = approval.choices.clone();
        options.push(LEAVE_PAUSED.to_string());

        let selection = Select::with_theme(&ColorfulTheme::default())
            .with_prompt(format!("{} [{}]", approval.prompt, approval.decision_point))
            .items(&options)
            .default(0)
            .interact()?;

        Ok(match approval.choices.get(selection) {
            Some(choice) => GateDecision::Choose(choice.clone()),
            None => GateDecision::Abort,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn approval(choices: &[&str]) -> PendingApproval {
        PendingApproval {
            decision_point: "review".into(),
            prompt: "approve remediation?".into(),
            choices: choices.iter().map(|c| c.to_string()).collect(),
            requested_at: Utc::now(),
        }
    }

    #[test]
    fn skip_all_takes_first_choice() {
        let gate = DecisionGate::new(true);
        let decision = gate.decide(&approval(&["approve", "reject"])).unwrap();
        assert_eq!(decision, GateDecision::Choose("approve".into()));
    }

    #[test]
    fn no_choices_is_an_error() {
        let gate = DecisionGate::new(true);
        assert!(gate.decide(&approval(&[])).is_err());
    }
}
