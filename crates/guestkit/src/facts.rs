//! Lazily-synced guest facts.

use crate::command::{Command, ExecuteOptions};
use crate::guest::Guest;
use crate::lock;
use crate::package_manager::PackageManager;
use logkit::Logger;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Mutex;

/// Environmental properties of a guest.
///
/// Probes that fail leave their field unset. `in_sync` marks whether the
/// values were collected from the guest and are still trusted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct GuestFacts {
    pub in_sync: bool,
    pub arch: Option<String>,
    pub distro: Option<String>,
    pub kernel_release: Option<String>,
    pub package_manager: Option<PackageManager>,
    pub has_selinux: Option<bool>,
    pub has_systemd: Option<bool>,
    pub is_superuser: Option<bool>,
    pub is_ostree: Option<bool>,
    pub is_toolbox: Option<bool>,
    pub is_container: Option<bool>,
    pub os_release_content: BTreeMap<String, String>,
    pub lsb_release_content: BTreeMap<String, String>,
}

/// Parse `KEY=VALUE` lines, stripping optional quotes.
pub fn parse_keyval(content: &str) -> BTreeMap<String, String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .map(|(key, value)| {
            let value = value.trim();
            let value = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
                .unwrap_or(value);
            (key.trim().to_string(), value.to_string())
        })
        .collect()
}

fn probe<G: Guest + ?Sized>(guest: &G, command: &Command) -> Option<String> {
    guest
        .execute(command, &ExecuteOptions::silent())
        .ok()
        .map(|output| output.stdout.trim().to_string())
}

fn probe_ok<G: Guest + ?Sized>(guest: &G, command: &Command) -> bool {
    guest.execute(command, &ExecuteOptions::silent()).is_ok()
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

impl GuestFacts {
    /// Run the probe battery against `guest` and mark the facts in sync.
    pub fn sync<G: Guest + ?Sized>(&mut self, guest: &G, logger: &Logger) {
        logger.debug("Sync guest facts.", 2);

        self.os_release_content =
            probe(guest, &Command::new("cat").arg("/etc/os-release")).map_or_else(BTreeMap::new, |c| parse_keyval(&c));
        self.lsb_release_content =
            probe(guest, &Command::new("cat").arg("/etc/lsb-release")).map_or_else(BTreeMap::new, |c| parse_keyval(&c));

        self.arch = non_empty(probe(guest, &Command::new("arch")));
        self.distro = self.query_distro(guest);
        self.kernel_release = non_empty(probe(guest, &Command::new("uname").arg("-r")));
        self.package_manager = Self::query_package_manager(guest);
        self.has_selinux = probe(guest, &Command::new("cat").arg("/proc/filesystems"))
            .map(|content| content.contains("selinux"));
        self.has_systemd = Some(probe_ok(guest, &Command::new("systemctl").arg("--version")));
        self.is_superuser = probe(guest, &Command::new("whoami")).map(|user| user == "root");
        self.is_ostree = Some(probe_ok(guest, &Command::new("stat").arg("/run/ostree-booted")));
        self.is_toolbox = Some(probe_ok(guest, &Command::new("stat").arg("/run/.toolboxenv")));
        self.is_container = probe(guest, &Command::shell("echo -n \"$container\""))
            .map(|value| !value.is_empty());

        self.in_sync = true;
        logger.debug(
            format!(
                "Guest facts: arch={:?} distro={:?} package-manager={:?}",
                self.arch, self.distro, self.package_manager
            ),
            3,
        );
    }

    fn query_distro<G: Guest + ?Sized>(&self, guest: &G) -> Option<String> {
        if let Some(name) = self.os_release_content.get("PRETTY_NAME") {
            return Some(name.clone());
        }
        if let Some(name) = self.lsb_release_content.get("DISTRIB_DESCRIPTION") {
            return Some(name.clone());
        }
        ["/etc/redhat-release", "/etc/fedora-release"]
            .into_iter()
            .find_map(|path| non_empty(probe(guest, &Command::new("cat").arg(path))))
    }

    fn query_package_manager<G: Guest + ?Sized>(guest: &G) -> Option<PackageManager> {
        let found: Vec<PackageManager> = PackageManager::ALL
            .into_iter()
            .filter(|pm| probe_ok(guest, &pm.probe_command()))
            .collect();
        PackageManager::select(&found)
    }

    /// Distro id from os-release, e.g. `fedora`.
    pub fn distro_id(&self) -> Option<&str> {
        self.os_release_content.get("ID").map(String::as_str)
    }
}

/// Facts cache owned by a guest driver.
///
/// The facts are collected on first read and reused until invalidated.
#[derive(Debug, Default)]
pub struct FactsCache {
    facts: Mutex<GuestFacts>,
}

impl FactsCache {
    pub fn new(facts: GuestFacts) -> Self {
        Self {
            facts: Mutex::new(facts),
        }
    }

    /// Return the facts, syncing them from `guest` first when needed.
    pub fn get<G: Guest + ?Sized>(&self, guest: &G, logger: &Logger) -> GuestFacts {
        let mut facts = lock(&self.facts);
        if !facts.in_sync {
            facts.sync(guest, logger);
        }
        facts.clone()
    }

    /// Current value without syncing.
    pub fn snapshot(&self) -> GuestFacts {
        lock(&self.facts).clone()
    }

    /// Force the next read to re-probe the guest.
    pub fn invalidate(&self) {
        lock(&self.facts).in_sync = false;
    }
}
