//! Serializable guest data, as stored in `guests.yaml`.

use crate::facts::GuestFacts;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default SSH login user.
pub const DEFAULT_USER: &str = "root";

/// Everything needed to re-attach to a guest.
///
/// Connection fields beyond the addresses are only meaningful for the SSH
/// driver; other drivers ignore them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct GuestData {
    pub primary_address: Option<String>,
    pub topology_address: Option<String>,
    pub role: Option<String>,
    /// Run commands via sudo when not logged in as root
    pub r#become: bool,
    pub facts: GuestFacts,
    /// Opaque hardware requirements
    pub hardware: Option<serde_yaml::Value>,

    pub port: Option<u16>,
    pub user: Option<String>,
    pub key: Vec<PathBuf>,
    pub password: Option<String>,
    pub ssh_option: Vec<String>,
    pub soft_reboot: Option<String>,
    pub hard_reboot: Option<String>,
}

impl GuestData {
    pub fn user(&self) -> &str {
        self.user.as_deref().unwrap_or(DEFAULT_USER)
    }

    pub fn with_primary_address(mut self, address: impl Into<String>) -> Self {
        self.primary_address = Some(address.into());
        self
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }
}

/// One entry of `guests.yaml`: driver key plus its data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuestRecord {
    pub how: String,
    #[serde(flatten)]
    pub data: GuestData,
}
