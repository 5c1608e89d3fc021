//! Per-step directory holding `step.yaml`, `guests.yaml` and `results.yaml`.

use crate::error::{Error, Result};
use crate::results::PhaseResult;
use crate::types::StepStatus;
use guestkit::GuestRecord;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub const STEP_FILENAME: &str = "step.yaml";
pub const GUESTS_FILENAME: &str = "guests.yaml";
pub const RESULTS_FILENAME: &str = "results.yaml";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct StepState {
    status: StepStatus,
}

/// Directory `{run}/{step}` with the step's persisted state.
#[derive(Debug, Clone)]
pub struct StepWorkdir {
    path: PathBuf,
}

impl StepWorkdir {
    /// Create (if needed) the directory of `step` inside the run workdir.
    pub fn create(run_workdir: &Path, step: &str) -> Result<Self> {
        let path = run_workdir.join(step);
        fs::create_dir_all(&path).map_err(|source| Error::Workdir {
            path: path.clone(),
            source,
        })?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load_status(&self) -> Result<StepStatus> {
        Ok(self
            .read::<StepState>(STEP_FILENAME)?
            .unwrap_or_default()
            .status)
    }

    pub fn save_status(&self, status: StepStatus) -> Result<()> {
        self.write(STEP_FILENAME, &StepState { status })
    }

    /// Guests of a previous invocation, keyed by guest name.
    pub fn load_guests(&self) -> Result<BTreeMap<String, GuestRecord>> {
        Ok(self.read(GUESTS_FILENAME)?.unwrap_or_default())
    }

    pub fn save_guests(&self, guests: &BTreeMap<String, GuestRecord>) -> Result<()> {
        self.write(GUESTS_FILENAME, guests)
    }

    pub fn load_results(&self) -> Result<Vec<PhaseResult>> {
        Ok(self.read(RESULTS_FILENAME)?.unwrap_or_default())
    }

    pub fn save_results(&self, results: &[PhaseResult]) -> Result<()> {
        self.write(RESULTS_FILENAME, &results)
    }

    fn read<T: DeserializeOwned>(&self, filename: &str) -> Result<Option<T>> {
        let path = self.path.join(filename);
        match fs::read_to_string(&path) {
            Ok(content) => Ok(Some(serde_yaml::from_str(&content)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(Error::Workdir { path, source }),
        }
    }

    fn write<T: Serialize + ?Sized>(&self, filename: &str, value: &T) -> Result<()> {
        let path = self.path.join(filename);
        let content = serde_yaml::to_string(value)?;
        fs::write(&path, content).map_err(|source| Error::Workdir { path, source })
    }
}
