//! Package managers a guest may use.
//!
//! Each manager knows how to detect itself on a guest (`probe_command`) and how
//! much to trust that detection (`probe_priority`) when several probes succeed.

use crate::command::Command;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PackageManager {
    Dnf5,
    Dnf,
    Yum,
    Apt,
    Apk,
    RpmOstree,
}

impl PackageManager {
    /// All known package managers, in registration order.
    pub const ALL: [PackageManager; 6] = [
        PackageManager::Dnf5,
        PackageManager::Dnf,
        PackageManager::Yum,
        PackageManager::Apt,
        PackageManager::Apk,
        PackageManager::RpmOstree,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            PackageManager::Dnf5 => "dnf5",
            PackageManager::Dnf => "dnf",
            PackageManager::Yum => "yum",
            PackageManager::Apt => "apt",
            PackageManager::Apk => "apk",
            PackageManager::RpmOstree => "rpm-ostree",
        }
    }

    /// Command whose success means the manager is usable on the guest.
    pub fn probe_command(&self) -> Command {
        match self {
            PackageManager::Dnf5 => Command::new("dnf5").arg("--version"),
            PackageManager::Dnf => Command::new("dnf").arg("--version"),
            PackageManager::Yum => Command::new("yum").arg("--version"),
            PackageManager::Apt => Command::new("apt").arg("--version"),
            PackageManager::Apk => Command::new("apk").arg("--version"),
            PackageManager::RpmOstree => Command::new("stat").arg("/run/ostree-booted"),
        }
    }

    /// Higher wins when more than one probe succeeds.
    pub fn probe_priority(&self) -> u32 {
        match self {
            PackageManager::RpmOstree => 130,
            PackageManager::Dnf5 => 120,
            PackageManager::Dnf => 50,
            PackageManager::Apt => 50,
            PackageManager::Apk => 45,
            PackageManager::Yum => 40,
        }
    }

    /// Pick the manager with the highest priority among successful probes.
    ///
    /// Ties keep the first one in `candidates` order.
    pub fn select(candidates: &[PackageManager]) -> Option<PackageManager> {
        candidates.iter().copied().fold(None, |best, candidate| match best {
            Some(best) if best.probe_priority() >= candidate.probe_priority() => Some(best),
            _ => Some(candidate),
        })
    }

    /// Shell command installing `packages`.
    ///
    /// With `skip_missing` unavailable packages are ignored where the manager
    /// supports it. `sudo` prefixes the command for non-root users.
    pub fn install_command<S: AsRef<str>>(&self, packages: &[S], skip_missing: bool, sudo: bool) -> Command {
        let mut script = String::new();
        if sudo {
            script.push_str("sudo ");
        }

        script.push_str(match self {
            PackageManager::Dnf5 => "dnf5 install -y",
            PackageManager::Dnf => "dnf install -y",
            PackageManager::Yum => "yum install -y",
            PackageManager::Apt => "DEBIAN_FRONTEND=noninteractive apt-get install -y",
            PackageManager::Apk => "apk add",
            PackageManager::RpmOstree => "rpm-ostree install --apply-live --idempotent --allow-inactive",
        });

        if skip_missing {
            match self {
                PackageManager::Dnf5 => script.push_str(" --skip-unavailable"),
                PackageManager::Dnf | PackageManager::Yum => script.push_str(" --skip-broken"),
                PackageManager::Apt => script.push_str(" --ignore-missing"),
                PackageManager::Apk | PackageManager::RpmOstree => {}
            }
        }

        packages
            .iter()
            .fold(Command::shell(script), |cmd, package| cmd.arg(package.as_ref()))
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|pm| pm.name() == name)
    }
}

impl fmt::Display for PackageManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}
