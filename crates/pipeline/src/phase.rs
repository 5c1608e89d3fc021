//! Phases and actions, the orderable units every step is made of.

use crate::error::{Error, Result};
use crate::types::{Context, Dependency, Flow};
use guestkit::{Guest, GuestRef};
use logkit::Logger;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, LazyLock};

/// Order of phases that do not say otherwise.
pub const PHASE_ORDER_DEFAULT: i32 = 50;

/// Installation of packages the orchestrator itself needs on the guest.
pub const PHASE_ORDER_PREPARE_INSTALL_ESSENTIAL_REQUIRES: i32 = 30;
pub const PHASE_ORDER_PREPARE_INSTALL_REQUIRES: i32 = 70;
pub const PHASE_ORDER_PREPARE_INSTALL_RECOMMENDS: i32 = 75;

/// Order used for actions scheduled at the `start` of a step.
pub const PHASE_ORDER_START: i32 = 10;
/// Order used for actions scheduled at the `end` of a step.
pub const PHASE_ORDER_END: i32 = 90;

static WHEN_RULE_PATTERN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^\s*([\w.-]+)\s*(==|!=)\s*(.*?)\s*$").ok());

fn default_order() -> i32 {
    PHASE_ORDER_DEFAULT
}

/// Configuration of one phase, as written in the plan.
///
/// Keys not known here are kept in `options` for the plugin to interpret.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PhaseData {
    #[serde(default)]
    pub name: String,
    pub how: String,
    #[serde(default = "default_order")]
    pub order: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// Guest names or roles the phase is limited to
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub r#where: Vec<String>,
    /// Context rules, any of which enables the phase
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub when: Vec<String>,
    #[serde(flatten)]
    pub options: BTreeMap<String, serde_json::Value>,
}

impl Default for PhaseData {
    fn default() -> Self {
        Self {
            name: String::new(),
            how: String::new(),
            order: PHASE_ORDER_DEFAULT,
            summary: None,
            r#where: Vec::new(),
            when: Vec::new(),
            options: BTreeMap::new(),
        }
    }
}

impl PhaseData {
    pub fn new(name: impl Into<String>, how: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            how: how.into(),
            ..Self::default()
        }
    }

    pub fn with_order(mut self, order: i32) -> Self {
        self.order = order;
        self
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    pub fn with_where<I, S>(mut self, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.r#where = targets.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_when(mut self, rule: impl Into<String>) -> Self {
        self.when.push(rule.into());
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.options.insert(key.into(), value);
        self
    }

    pub fn option_str(&self, key: &str) -> Option<&str> {
        self.options.get(key).and_then(serde_json::Value::as_str)
    }

    pub fn option_bool(&self, key: &str) -> Option<bool> {
        self.options.get(key).and_then(serde_json::Value::as_bool)
    }

    /// A string option given either as one string or as a list of strings.
    pub fn option_strings(&self, key: &str) -> Vec<String> {
        match self.options.get(key) {
            Some(serde_json::Value::String(value)) => vec![value.clone()],
            Some(serde_json::Value::Array(values)) => values
                .iter()
                .filter_map(|value| value.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        }
    }

    pub fn enabled_on_guest(&self, name: &str, role: Option<&str>) -> bool {
        self.r#where.is_empty()
            || self
                .r#where
                .iter()
                .any(|target| target == name || Some(target.as_str()) == role)
    }

    pub fn enabled_by_when(&self, context: &Context) -> Result<bool> {
        evaluate_when(&self.when, context)
    }
}

/// One parsed `when` rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WhenRule {
    pub key: String,
    pub equal: bool,
    pub value: String,
}

impl WhenRule {
    pub fn parse(rule: &str) -> Result<Self> {
        let captures = WHEN_RULE_PATTERN
            .as_ref()
            .and_then(|pattern| pattern.captures(rule))
            .ok_or_else(|| Error::Specification(format!("invalid 'when' rule '{rule}'")))?;

        let value = captures[3].to_string();
        if value.is_empty() {
            return Err(Error::Specification(format!(
                "invalid 'when' rule '{rule}', missing value"
            )));
        }

        Ok(Self {
            key: captures[1].to_string(),
            equal: &captures[2] == "==",
            value,
        })
    }

    /// `None` when the context does not know the key.
    pub fn matches(&self, context: &Context) -> Option<bool> {
        context
            .get(&self.key)
            .map(|actual| (actual == &self.value) == self.equal)
    }
}

/// Any decidable rule that holds enables the phase. No rules, or no rule
/// the context can decide, leaves it enabled.
pub fn evaluate_when(rules: &[String], context: &Context) -> Result<bool> {
    let mut decided = false;
    for rule in rules {
        match WhenRule::parse(rule)?.matches(context) {
            Some(true) => return Ok(true),
            Some(false) => decided = true,
            None => {}
        }
    }
    Ok(!decided)
}

/// Behavior shared by the plugins of every step.
pub trait Phase: Send + Sync {
    fn data(&self) -> &PhaseData;

    fn name(&self) -> &str {
        &self.data().name
    }

    fn how(&self) -> &str {
        &self.data().how
    }

    fn order(&self) -> i32 {
        self.data().order
    }

    fn summary(&self) -> Option<&str> {
        self.data().summary.as_deref()
    }

    fn enabled_by_when(&self, context: &Context) -> Result<bool> {
        self.data().enabled_by_when(context)
    }

    fn enabled_on_guest(&self, guest: &dyn Guest) -> bool {
        self.data()
            .enabled_on_guest(guest.name(), guest.role().as_deref())
    }

    /// Packages needed on the guest for this phase to work at all.
    fn essential_requires(&self) -> Vec<Dependency> {
        Vec::new()
    }
}

/// Work inserted between plugins, e.g. a reboot or an interactive login.
///
/// Actions run once for all guests and never in parallel with anything.
pub trait Action: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    fn order(&self) -> i32;

    fn go(&self, guests: &[GuestRef], logger: &Logger) -> Result<Flow<()>>;
}

/// Entry of a step's phase list.
#[derive(Debug)]
pub enum StepPhase<P: ?Sized> {
    Action(Arc<dyn Action>),
    Plugin(Arc<P>),
}

impl<P: ?Sized> Clone for StepPhase<P> {
    fn clone(&self) -> Self {
        match self {
            StepPhase::Action(action) => StepPhase::Action(Arc::clone(action)),
            StepPhase::Plugin(plugin) => StepPhase::Plugin(Arc::clone(plugin)),
        }
    }
}

impl<P: Phase + ?Sized> StepPhase<P> {
    pub fn name(&self) -> &str {
        match self {
            StepPhase::Action(action) => action.name(),
            StepPhase::Plugin(plugin) => plugin.name(),
        }
    }

    pub fn order(&self) -> i32 {
        match self {
            StepPhase::Action(action) => action.order(),
            StepPhase::Plugin(plugin) => plugin.order(),
        }
    }

    pub fn plugin(&self) -> Option<&Arc<P>> {
        match self {
            StepPhase::Plugin(plugin) => Some(plugin),
            StepPhase::Action(_) => None,
        }
    }
}

/// Drop plugins disabled by `when` and sort the rest by order.
///
/// The sort is stable, equal orders keep their plan order. Actions are
/// always kept.
pub fn select_phases<P: Phase + ?Sized>(
    phases: &[StepPhase<P>],
    context: &Context,
) -> Result<Vec<StepPhase<P>>> {
    let mut selected = Vec::with_capacity(phases.len());
    for phase in phases {
        let enabled = match phase {
            StepPhase::Action(_) => true,
            StepPhase::Plugin(plugin) => plugin.enabled_by_when(context)?,
        };
        if enabled {
            selected.push(phase.clone());
        }
    }
    selected.sort_by_key(StepPhase::order);
    Ok(selected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use guestkit::MockGuest;

    struct Plain(PhaseData);

    impl Phase for Plain {
        fn data(&self) -> &PhaseData {
            &self.0
        }
    }

    #[derive(Debug)]
    struct Noop(i32);

    impl Action for Noop {
        fn name(&self) -> &str {
            "noop"
        }

        fn order(&self) -> i32 {
            self.0
        }

        fn go(&self, _guests: &[GuestRef], _logger: &Logger) -> Result<Flow<()>> {
            Ok(Flow::Done(()))
        }
    }

    fn plain(data: PhaseData) -> StepPhase<dyn Phase> {
        StepPhase::Plugin(Arc::new(Plain(data)))
    }

    fn context(pairs: &[(&str, &str)]) -> Context {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_phase_data_from_toml() {
        let data: PhaseData = toml::from_str(
            r#"
            name = "setup"
            how = "shell"
            where = ["client"]
            script = "dnf -y update"
            "#,
        )
        .unwrap();

        assert_eq!(data.order, PHASE_ORDER_DEFAULT);
        assert_eq!(data.r#where, vec!["client"]);
        assert_eq!(data.option_str("script"), Some("dnf -y update"));
        assert!(data.summary.is_none());
    }

    #[test]
    fn test_option_strings_accepts_string_or_list() {
        let data = PhaseData::new("install", "install")
            .with_option("package", serde_json::json!(["make", "gcc"]))
            .with_option("copr", serde_json::json!("foo/bar"));

        assert_eq!(data.option_strings("package"), vec!["make", "gcc"]);
        assert_eq!(data.option_strings("copr"), vec!["foo/bar"]);
        assert!(data.option_strings("missing").is_empty());
    }

    #[test]
    fn test_enabled_on_guest_by_name_or_role() {
        let data = PhaseData::new("p", "shell").with_where(["server", "client-1"]);

        assert!(data.enabled_on_guest("client-1", None));
        assert!(data.enabled_on_guest("guest-a", Some("server")));
        assert!(!data.enabled_on_guest("guest-b", Some("client")));
        assert!(PhaseData::new("p", "shell").enabled_on_guest("anything", None));
    }

    #[test]
    fn test_when_rules() {
        let ctx = context(&[("distro", "fedora"), ("arch", "x86_64")]);

        assert!(evaluate_when(&[], &ctx).unwrap());
        assert!(evaluate_when(&["distro == fedora".into()], &ctx).unwrap());
        assert!(!evaluate_when(&["distro == centos".into()], &ctx).unwrap());
        assert!(evaluate_when(&["distro != centos".into()], &ctx).unwrap());
        assert!(
            evaluate_when(&["distro == centos".into(), "arch == x86_64".into()], &ctx).unwrap()
        );
    }

    #[test]
    fn test_when_rule_with_unknown_key_is_skipped() {
        let ctx = context(&[("distro", "fedora")]);

        assert!(evaluate_when(&["initiator == human".into()], &ctx).unwrap());
        assert!(
            !evaluate_when(&["initiator == human".into(), "distro == centos".into()], &ctx)
                .unwrap()
        );
    }

    #[test]
    fn test_malformed_when_rule() {
        let err = evaluate_when(&["distro fedora".into()], &Context::new()).unwrap_err();
        assert!(matches!(err, Error::Specification(_)));

        let err = WhenRule::parse("distro ==").unwrap_err();
        assert!(err.to_string().contains("missing value"));
    }

    #[test]
    fn test_phase_enabled_on_mock_guest() {
        let phase = Plain(PhaseData::new("p", "shell").with_where(["server"]));
        let server = MockGuest::new("guest-1").with_role("server");
        let client = MockGuest::new("guest-2").with_role("client");

        assert!(phase.enabled_on_guest(&server));
        assert!(!phase.enabled_on_guest(&client));
    }

    #[test]
    fn test_select_phases_filters_and_sorts_stably() {
        let ctx = context(&[("distro", "fedora")]);
        let phases = vec![
            plain(PhaseData::new("late", "shell").with_order(80)),
            plain(PhaseData::new("first-50", "shell")),
            plain(PhaseData::new("disabled", "shell").with_when("distro == centos")),
            StepPhase::Action(Arc::new(Noop(PHASE_ORDER_START))),
            plain(PhaseData::new("second-50", "shell")),
        ];

        let selected = select_phases(&phases, &ctx).unwrap();
        let names: Vec<&str> = selected.iter().map(StepPhase::name).collect();
        assert_eq!(names, vec!["noop", "first-50", "second-50", "late"]);
    }
}
