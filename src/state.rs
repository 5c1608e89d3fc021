use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use pipeline::{STEPS, StepStatus};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

const STATE_FILENAME: &str = "run.toml";

/// State of one run, stored in its workdir
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RunState {
    /// Plan file the run was started from
    pub plan: PathBuf,

    pub created: DateTime<Utc>,

    /// Last time any step changed state
    pub updated: DateTime<Utc>,

    /// Status of each step, by step name
    #[serde(default)]
    pub steps: BTreeMap<String, StepStatus>,
}

impl RunState {
    pub fn new(plan: impl Into<PathBuf>) -> Self {
        let now = Utc::now();
        Self {
            plan: plan.into(),
            created: now,
            updated: now,
            steps: STEPS
                .iter()
                .map(|step| ((*step).to_string(), StepStatus::Todo))
                .collect(),
        }
    }

    fn state_file(workdir: &Path) -> PathBuf {
        workdir.join(STATE_FILENAME)
    }

    pub fn exists(workdir: &Path) -> bool {
        Self::state_file(workdir).exists()
    }

    /// Load state from the run workdir
    pub fn load(workdir: &Path) -> Result<Self> {
        let path = Self::state_file(workdir);
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Could not read {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("Invalid state file {}", path.display()))
    }

    /// Save state to the run workdir
    pub fn save(&self, workdir: &Path) -> Result<()> {
        fs::create_dir_all(workdir)
            .with_context(|| format!("Could not create {}", workdir.display()))?;
        let path = Self::state_file(workdir);
        let content = toml::to_string_pretty(self).context("Failed to serialize run state")?;
        fs::write(&path, content).with_context(|| format!("Could not write {}", path.display()))
    }

    pub fn set_step(&mut self, step: &str, status: StepStatus) {
        self.steps.insert(step.to_string(), status);
        self.updated = Utc::now();
    }

    pub fn step(&self, step: &str) -> StepStatus {
        self.steps.get(step).copied().unwrap_or_default()
    }

    /// Whether every step is done
    pub fn is_complete(&self) -> bool {
        STEPS.iter().all(|step| self.step(step) == StepStatus::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_state_has_every_step_todo() {
        let state = RunState::new("plan.toml");
        assert_eq!(state.steps.len(), STEPS.len());
        assert!(state.steps.values().all(|status| *status == StepStatus::Todo));
        assert!(!state.is_complete());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = RunState::new("/plans/smoke.toml");
        state.set_step("provision", StepStatus::Done);
        state.save(dir.path()).unwrap();

        assert!(RunState::exists(dir.path()));
        let loaded = RunState::load(dir.path()).unwrap();
        assert_eq!(loaded.plan, PathBuf::from("/plans/smoke.toml"));
        assert_eq!(loaded.step("provision"), StepStatus::Done);
        assert_eq!(loaded.step("execute"), StepStatus::Todo);

        let raw = fs::read_to_string(dir.path().join(STATE_FILENAME)).unwrap();
        assert!(raw.contains("provision = \"done\""));
    }

    #[test]
    fn test_load_missing_state_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = RunState::load(dir.path()).unwrap_err();
        assert!(err.to_string().contains("Could not read"));
    }
}
