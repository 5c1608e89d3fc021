//! Report plugins: `display` prints results, `json` writes them to a file.

use crate::ui;
use logkit::Logger;
use pipeline::{Error, Flow, Phase, PhaseData, PhaseResult, ReportPlugin, Result, ResultOutcome, summarize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// `3 passed, 1 failed` style totals, skipping outcomes with no results.
pub fn format_totals(results: &[PhaseResult]) -> String {
    let totals: Vec<String> = summarize(results)
        .into_iter()
        .filter(|(_, count)| *count > 0)
        .map(|(outcome, count)| {
            let label = match outcome {
                ResultOutcome::Pass => "passed",
                ResultOutcome::Fail => "failed",
                ResultOutcome::Info => "info",
                ResultOutcome::Warn => "warned",
                ResultOutcome::Error => "errored",
                ResultOutcome::Skip => "skipped",
            };
            format!("{count} {label}")
        })
        .collect();

    if totals.is_empty() {
        "no results".to_string()
    } else {
        totals.join(", ")
    }
}

pub struct ReportDisplay {
    data: PhaseData,
}

impl ReportDisplay {
    pub fn new(data: PhaseData) -> Self {
        Self { data }
    }
}

impl Phase for ReportDisplay {
    fn data(&self) -> &PhaseData {
        &self.data
    }
}

impl ReportPlugin for ReportDisplay {
    fn go(&self, results: &[PhaseResult], logger: &Logger) -> Result<Flow<()>> {
        let mut by_guest: BTreeMap<&str, Vec<&PhaseResult>> = BTreeMap::new();
        for result in results {
            by_guest.entry(result.guest.name.as_str()).or_default().push(result);
        }

        for (guest, results) in &by_guest {
            if by_guest.len() > 1 {
                logger.info("guest", guest);
            }
            for result in results {
                logger.print(format!("{} {}", ui::outcome(result.result), result.name));
                for note in &result.note {
                    logger.verbose("note", note, 1);
                }
            }
        }

        logger.info("summary", format_totals(results));
        Ok(Flow::Done(()))
    }
}

/// Write all results as a JSON array.
pub struct ReportJson {
    data: PhaseData,
    file: PathBuf,
}

impl ReportJson {
    pub fn new(data: PhaseData, default_file: &Path) -> Self {
        let file = data
            .option_str("file")
            .map_or_else(|| default_file.to_path_buf(), crate::paths::expand_path);
        Self { data, file }
    }
}

impl Phase for ReportJson {
    fn data(&self) -> &PhaseData {
        &self.data
    }
}

impl ReportPlugin for ReportJson {
    fn go(&self, results: &[PhaseResult], logger: &Logger) -> Result<Flow<()>> {
        let content = serde_json::to_string_pretty(results)
            .map_err(|e| Error::Other(format!("cannot serialize results: {e}")))?;
        if let Some(parent) = self.file.parent() {
            fs::create_dir_all(parent).map_err(|source| Error::Workdir {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        fs::write(&self.file, content).map_err(|source| Error::Workdir {
            path: self.file.clone(),
            source,
        })?;
        logger.info("report", self.file.display());
        Ok(Flow::Done(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn results() -> Vec<PhaseResult> {
        vec![
            PhaseResult::new("/a", ResultOutcome::Pass),
            PhaseResult::new("/b", ResultOutcome::Pass),
            PhaseResult::new("/c", ResultOutcome::Fail),
        ]
    }

    #[test]
    fn test_format_totals() {
        assert_eq!(format_totals(&results()), "2 passed, 1 failed");
        assert_eq!(format_totals(&[]), "no results");
    }

    #[test]
    fn test_display_accepts_any_results() {
        let plugin = ReportDisplay::new(PhaseData::new("default-0", "display"));
        assert_eq!(
            plugin.go(&results(), &Logger::new("report")).unwrap(),
            Flow::Done(())
        );
    }

    #[test]
    fn test_json_writes_results() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("out").join("results.json");
        let plugin = ReportJson::new(
            PhaseData::new("default-0", "json").with_option("file", json!(file.to_string_lossy())),
            Path::new("/nonexistent/results.json"),
        );

        plugin.go(&results(), &Logger::new("report")).unwrap();
        let written: Vec<PhaseResult> =
            serde_json::from_str(&fs::read_to_string(&file).unwrap()).unwrap();
        assert_eq!(written, results());
    }

    #[test]
    fn test_json_default_file() {
        let plugin = ReportJson::new(
            PhaseData::new("default-0", "json"),
            Path::new("/var/tmp/testrun/run-001/report/results.json"),
        );
        assert_eq!(
            plugin.file,
            PathBuf::from("/var/tmp/testrun/run-001/report/results.json")
        );
    }
}
