//! Plan files
//!
//! A plan is a TOML document describing a whole run:
//!
//! ```toml
//! [context]
//! distro = "fedora-41"
//!
//! [discover]
//! tests = [
//!     { name = "/smoke", test = "./smoke.sh", path = "~/tests", require = ["curl"] },
//! ]
//!
//! [[provision]]
//! how = "local"
//!
//! [[execute]]
//! how = "shell"
//! ```
//!
//! Phases without a name are called `default-N`, numbered per step.

use anyhow::{Context, Result, bail};
use pipeline::{Context as PlanContext, PhaseData, TestCase};
use serde::Deserialize;
use std::fs;
use std::path::Path;

use crate::paths::expand_path;

/// Test discovery section
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DiscoverConfig {
    pub tests: Vec<TestCase>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Plan {
    pub summary: Option<String>,
    pub context: PlanContext,
    pub discover: DiscoverConfig,
    pub provision: Vec<PhaseData>,
    pub prepare: Vec<PhaseData>,
    pub execute: Vec<PhaseData>,
    pub finish: Vec<PhaseData>,
    pub report: Vec<PhaseData>,
}

impl Plan {
    /// Load and normalize a plan file
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Could not read plan {}", path.display()))?;
        let plan: Self = toml::from_str(&content)
            .with_context(|| format!("Invalid plan {}", path.display()))?;
        plan.normalized()
    }

    fn normalized(mut self) -> Result<Self> {
        for (step, phases) in [
            ("provision", &mut self.provision),
            ("prepare", &mut self.prepare),
            ("execute", &mut self.execute),
            ("finish", &mut self.finish),
            ("report", &mut self.report),
        ] {
            name_phases(step, phases)?;
        }

        if self.provision.is_empty() {
            self.provision.push(PhaseData::new("default-0", "local"));
        }
        if self.execute.is_empty() {
            self.execute.push(PhaseData::new("default-0", "shell"));
        }
        if self.report.is_empty() {
            self.report.push(PhaseData::new("default-0", "display"));
        }

        for test in &mut self.discover.tests {
            if let Some(path) = &test.path {
                test.path = Some(expand_path(&path.to_string_lossy()));
            }
        }
        Ok(self)
    }

    /// Apply `KEY=VALUE` overrides given on the command line
    pub fn override_context(&mut self, overrides: &[String]) -> Result<()> {
        for entry in overrides {
            let Some((key, value)) = entry.split_once('=') else {
                bail!("Invalid context '{entry}', expected KEY=VALUE");
            };
            self.context
                .insert(key.trim().to_string(), value.trim().to_string());
        }
        Ok(())
    }
}

fn name_phases(step: &str, phases: &mut [PhaseData]) -> Result<()> {
    let mut seen = std::collections::BTreeSet::new();
    for (index, phase) in phases.iter_mut().enumerate() {
        if phase.name.is_empty() {
            phase.name = format!("default-{index}");
        }
        if phase.how.is_empty() {
            bail!("Phase '{}' of the {step} step has no 'how'", phase.name);
        }
        if !seen.insert(phase.name.clone()) {
            bail!("Duplicate {step} phase name '{}'", phase.name);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(content: &str) -> Result<Plan> {
        let plan: Plan = toml::from_str(content)?;
        plan.normalized()
    }

    #[test]
    fn test_minimal_plan_gets_defaults() {
        let plan = parse("").unwrap();
        assert_eq!(plan.provision.len(), 1);
        assert_eq!(plan.provision[0].how, "local");
        assert_eq!(plan.execute[0].how, "shell");
        assert_eq!(plan.report[0].how, "display");
        assert!(plan.prepare.is_empty());
        assert!(plan.discover.tests.is_empty());
    }

    #[test]
    fn test_full_plan() {
        let plan = parse(
            r#"
            summary = "Smoke"

            [context]
            distro = "fedora-41"

            [discover]
            tests = [
                { name = "/smoke", test = "true", require = ["curl"] },
                { name = "/slow", test = "sleep 1", duration = "10m", where = ["server"] },
            ]

            [[provision]]
            name = "server"
            how = "connect"
            role = "server"
            guest = "10.0.0.1"

            [[provision]]
            how = "local"
            role = "client"

            [[prepare]]
            how = "shell"
            script = "dnf makecache"
            order = 20
            "#,
        )
        .unwrap();

        assert_eq!(plan.context["distro"], "fedora-41");
        assert_eq!(plan.discover.tests.len(), 2);
        assert_eq!(plan.discover.tests[1].r#where, vec!["server"]);
        assert_eq!(plan.provision[0].name, "server");
        assert_eq!(plan.provision[0].option_str("guest"), Some("10.0.0.1"));
        assert_eq!(plan.provision[1].name, "default-1");
        assert_eq!(plan.prepare[0].order, 20);
    }

    #[test]
    fn test_phase_without_how() {
        assert!(parse("[[finish]]\nscript = \"true\"\n").is_err());

        let err = parse("[[finish]]\nhow = \"\"\nscript = \"true\"\n").unwrap_err();
        assert!(err.to_string().contains("has no 'how'"));
    }

    #[test]
    fn test_duplicate_phase_names() {
        let err = parse(
            "[[provision]]\nname = \"a\"\nhow = \"local\"\n[[provision]]\nname = \"a\"\nhow = \"local\"\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("Duplicate provision phase name 'a'"));
    }

    #[test]
    fn test_unknown_section() {
        assert!(parse("[deploy]\nhow = \"x\"\n").is_err());
    }

    #[test]
    fn test_context_override() {
        let mut plan = parse("[context]\narch = \"x86_64\"\n").unwrap();
        plan.override_context(&["arch=aarch64".to_string(), "distro = centos".to_string()])
            .unwrap();
        assert_eq!(plan.context["arch"], "aarch64");
        assert_eq!(plan.context["distro"], "centos");
        assert!(plan.override_context(&["broken".to_string()]).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plan.toml");
        fs::write(&path, "[[execute]]\nhow = \"shell\"\n").unwrap();
        let plan = Plan::load(&path).unwrap();
        assert_eq!(plan.execute[0].name, "default-0");

        assert!(Plan::load(&dir.path().join("missing.toml")).is_err());
    }
}
