//! # guestkit
//!
//! The guest abstraction used by the test run orchestrator.
//!
//! A guest is one execution target: the local machine, a host reached over
//! SSH, or a scripted [`MockGuest`] in tests. The orchestrator only relies on
//! the [`Guest`] trait:
//!
//! - **execute**: run a command, capturing output, failing on non-zero exit
//! - **push / pull**: synchronize the run workdir
//! - **reboot / reconnect**: wait for the guest to come back using [`waiting`]
//! - **facts**: lazily probed distro, arch, package manager and capabilities
//! - **start / stop / suspend / remove**: lifecycle transitions
//!
//! ## Example
//!
//! ```no_run
//! use guestkit::{Command, ExecuteOptions, Guest, GuestData, GuestLocal};
//! use logkit::Logger;
//!
//! let guest = GuestLocal::new("default-0", GuestData::default(), Logger::new("default-0"));
//! let output = guest.execute(&Command::new("uname").arg("-r"), &ExecuteOptions::default())?;
//! println!("kernel {}", output.stdout.trim());
//! println!("package manager {:?}", guest.facts().package_manager);
//! # Ok::<(), guestkit::Error>(())
//! ```

pub mod command;
pub mod data;
pub mod error;
pub mod facts;
pub mod guest;
pub mod local;
pub mod mock;
pub mod package_manager;
pub mod ssh;

pub use command::{Command, CommandOutput, ExecuteOptions};
pub use data::{DEFAULT_USER, GuestData, GuestRecord};
pub use error::{Error, ErrorCategory, Result};
pub use facts::{FactsCache, GuestFacts};
pub use guest::{
    Guest, GuestRef, RebootMode, SyncRequest, default_connect_waiting, default_reboot_waiting,
    format_guest_full_name,
};
pub use local::GuestLocal;
pub use mock::MockGuest;
pub use package_manager::PackageManager;
pub use ssh::{GuestSsh, SshConfig};

use std::sync::{Mutex, MutexGuard};

/// Lock a mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
