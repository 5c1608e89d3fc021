//! Provision plugins: `local` uses this machine, `connect` an existing SSH host.

use super::lock;
use guestkit::{GuestData, GuestLocal, GuestRecord, GuestRef, GuestSsh, SshConfig};
use logkit::Logger;
use pipeline::{Error, Flow, Phase, PhaseData, ProvisionPlugin, Result};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// Build a guest from its saved record.
pub fn guest_from_record(name: &str, record: &GuestRecord, ssh: &SshConfig, logger: &Logger) -> Result<GuestRef> {
    match record.how.as_str() {
        "local" => Ok(Arc::new(GuestLocal::new(name, record.data.clone(), logger.clone()))),
        "connect" => Ok(Arc::new(GuestSsh::new(
            name,
            record.data.clone(),
            ssh.clone(),
            logger.clone(),
        ))),
        how => Err(Error::Specification(format!(
            "cannot re-attach guest '{name}' provisioned by '{how}'"
        ))),
    }
}

/// Options shared by every provision plugin.
fn common_data(data: &PhaseData) -> GuestData {
    GuestData {
        role: data.option_str("role").map(str::to_string),
        r#become: data.option_bool("become").unwrap_or(false),
        ..GuestData::default()
    }
}

#[derive(Debug)]
pub struct ProvisionLocal {
    data: PhaseData,
    guest: Mutex<Option<GuestRef>>,
}

impl ProvisionLocal {
    pub fn new(data: PhaseData) -> Self {
        Self {
            data,
            guest: Mutex::new(None),
        }
    }
}

impl Phase for ProvisionLocal {
    fn data(&self) -> &PhaseData {
        &self.data
    }
}

impl ProvisionPlugin for ProvisionLocal {
    fn is_thread_safe(&self) -> bool {
        true
    }

    fn go(&self, logger: &Logger) -> Result<Flow<()>> {
        let guest: GuestRef = Arc::new(GuestLocal::new(
            self.name(),
            common_data(&self.data),
            logger.clone(),
        ));
        logger.verbose("how", "local", 1);
        *lock(&self.guest) = Some(guest);
        Ok(Flow::Done(()))
    }

    fn guest(&self) -> Option<GuestRef> {
        lock(&self.guest).clone()
    }

    fn wake(&self, record: &GuestRecord, logger: &Logger) -> Result<()> {
        let guest = GuestLocal::new(self.name(), record.data.clone(), logger.clone());
        *lock(&self.guest) = Some(Arc::new(guest));
        Ok(())
    }
}

#[derive(Debug)]
pub struct ProvisionConnect {
    data: PhaseData,
    ssh: SshConfig,
    guest: Mutex<Option<GuestRef>>,
}

impl ProvisionConnect {
    /// Create the plugin, failing early when the plan misses the address.
    pub fn new(data: PhaseData, ssh: SshConfig) -> Result<Self> {
        let plugin = Self {
            data,
            ssh,
            guest: Mutex::new(None),
        };
        plugin.guest_data()?;
        Ok(plugin)
    }

    fn guest_data(&self) -> Result<GuestData> {
        let address = self.data.option_str("guest").ok_or_else(|| {
            Error::Specification(format!(
                "provision phase '{}' needs a 'guest' address",
                self.name()
            ))
        })?;

        let port = match self.data.options.get("port") {
            None => None,
            Some(value) => Some(
                value
                    .as_u64()
                    .and_then(|port| u16::try_from(port).ok())
                    .ok_or_else(|| {
                        Error::Specification(format!(
                            "invalid port '{value}' in provision phase '{}'",
                            self.name()
                        ))
                    })?,
            ),
        };

        Ok(GuestData {
            primary_address: Some(address.to_string()),
            port,
            user: self.data.option_str("user").map(str::to_string),
            key: self
                .data
                .option_strings("key")
                .iter()
                .map(|key| crate::paths::expand_path(key))
                .collect::<Vec<PathBuf>>(),
            password: self.data.option_str("password").map(str::to_string),
            ssh_option: self.data.option_strings("ssh-option"),
            soft_reboot: self.data.option_str("soft-reboot").map(str::to_string),
            hard_reboot: self.data.option_str("hard-reboot").map(str::to_string),
            ..common_data(&self.data)
        })
    }
}

impl Phase for ProvisionConnect {
    fn data(&self) -> &PhaseData {
        &self.data
    }
}

impl ProvisionPlugin for ProvisionConnect {
    fn is_thread_safe(&self) -> bool {
        true
    }

    fn go(&self, logger: &Logger) -> Result<Flow<()>> {
        let data = self.guest_data()?;
        logger.verbose("how", "connect", 1);
        logger.info("guest", data.primary_address.as_deref().unwrap_or_default());

        let guest: GuestRef = Arc::new(GuestSsh::new(
            self.name(),
            data,
            self.ssh.clone(),
            logger.clone(),
        ));
        *lock(&self.guest) = Some(Arc::clone(&guest));

        if !guest.reconnect(None)? {
            return Err(guestkit::Error::Connection {
                guest: self.name().to_string(),
                message: "guest did not become reachable in time".to_string(),
            }
            .into());
        }
        Ok(Flow::Done(()))
    }

    fn guest(&self) -> Option<GuestRef> {
        lock(&self.guest).clone()
    }

    fn wake(&self, record: &GuestRecord, logger: &Logger) -> Result<()> {
        let guest = guest_from_record(self.name(), record, &self.ssh, logger)?;
        *lock(&self.guest) = Some(guest);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ssh() -> SshConfig {
        SshConfig::new("/tmp/sockets", "/tmp/run-001")
    }

    #[test]
    fn test_local_provisions_guest_with_role() {
        let plugin = ProvisionLocal::new(
            PhaseData::new("client", "local").with_option("role", json!("client")),
        );
        assert!(plugin.guest().is_none());
        assert!(plugin.is_thread_safe());

        plugin.go(&Logger::new("client")).unwrap();
        let guest = plugin.guest().unwrap();
        assert_eq!(guest.name(), "client");
        assert_eq!(guest.how(), "local");
        assert_eq!(guest.full_name(), "client (client)");
        assert!(guest.is_ready());
    }

    #[test]
    fn test_connect_guest_data() {
        let plugin = ProvisionConnect::new(
            PhaseData::new("server", "connect")
                .with_option("guest", json!("10.0.0.7"))
                .with_option("port", json!(2222))
                .with_option("user", json!("fedora"))
                .with_option("become", json!(true))
                .with_option("ssh-option", json!(["ServerAliveInterval=10"])),
            ssh(),
        )
        .unwrap();

        let data = plugin.guest_data().unwrap();
        assert_eq!(data.primary_address.as_deref(), Some("10.0.0.7"));
        assert_eq!(data.port, Some(2222));
        assert_eq!(data.user(), "fedora");
        assert!(data.r#become);
        assert_eq!(data.ssh_option, vec!["ServerAliveInterval=10"]);
    }

    #[test]
    fn test_connect_requires_address() {
        let err = ProvisionConnect::new(PhaseData::new("server", "connect"), ssh())
            .err()
            .unwrap();
        assert!(matches!(err, Error::Specification(_)));
        assert!(err.to_string().contains("needs a 'guest' address"));
    }

    #[test]
    fn test_connect_rejects_bad_port() {
        let data = PhaseData::new("server", "connect")
            .with_option("guest", json!("example.com"))
            .with_option("port", json!(70000));
        assert!(ProvisionConnect::new(data, ssh()).is_err());
    }

    #[test]
    fn test_wake_from_record() {
        let record = GuestRecord {
            how: "connect".to_string(),
            data: GuestData::default().with_primary_address("10.0.0.7"),
        };
        let plugin = ProvisionConnect::new(
            PhaseData::new("server", "connect").with_option("guest", json!("10.0.0.7")),
            ssh(),
        )
        .unwrap();
        plugin.wake(&record, &Logger::new("server")).unwrap();
        assert_eq!(plugin.guest().unwrap().how(), "connect");

        let unknown = GuestRecord {
            how: "beaker".to_string(),
            data: GuestData::default(),
        };
        assert!(guest_from_record("x", &unknown, &ssh(), &Logger::new("x")).is_err());
    }
}
