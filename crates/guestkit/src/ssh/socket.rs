//! Socket path derivation for SSH connection multiplexing.
//!
//! UNIX socket paths are limited to 104 bytes on some platforms, and ssh
//! appends a random suffix while creating the socket. The derivation tries,
//! in order:
//!
//! 1. `{dir}/{guest_id}.socket`, when short enough.
//! 2. `{dir}/{sha256(guest_id)[..i]}.socket` for growing `i`, reserving each
//!    candidate with a create-exclusive `.reservation` marker so that two
//!    guests never share a socket.
//! 3. The trivial path regardless of its length. Multiplexing must then be
//!    disabled by the caller.

use sha2::{Digest, Sha256};
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

/// Longest socket path ssh accepts, minus room for its temporary suffix.
pub const SSH_MASTER_SOCKET_LENGTH_LIMIT: usize = 104 - 20;

pub const SSH_MASTER_SOCKET_MIN_HASH_LENGTH: usize = 4;
pub const SSH_MASTER_SOCKET_MAX_HASH_LENGTH: usize = 64;

const RESERVATION_SUFFIX: &str = ".reservation";

/// How a socket path was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketNaming {
    Trivial,
    Hashed,
    /// Trivial path ignoring the length limit
    Unbounded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketPath {
    pub path: PathBuf,
    pub naming: SocketNaming,
    pub limit: usize,
}

impl SocketPath {
    /// Whether ssh can use this path, i.e. multiplexing may be enabled.
    pub fn within_limit(&self) -> bool {
        path_len(&self.path) < self.limit
    }

    pub fn reservation(&self) -> PathBuf {
        reservation_path(&self.path)
    }
}

/// Identifier of one (address, port, user) combination.
pub fn guest_id(address: &str, port: Option<u16>, user: Option<&str>) -> String {
    let mut parts = vec![address.to_string()];
    if let Some(port) = port {
        parts.push(port.to_string());
    }
    if let Some(user) = user {
        parts.push(user.to_string());
    }
    parts.join("-")
}

fn path_len(path: &Path) -> usize {
    path.as_os_str().len()
}

fn reservation_path(socket: &Path) -> PathBuf {
    let mut reservation = socket.as_os_str().to_owned();
    reservation.push(RESERVATION_SUFFIX);
    PathBuf::from(reservation)
}

/// `{dir}/{guest_id}.socket`, or `None` when `limit` is given and reached.
pub fn trivial_socket_path(dir: &Path, guest_id: &str, limit: Option<usize>) -> Option<PathBuf> {
    let path = dir.join(format!("{guest_id}.socket"));
    match limit {
        Some(limit) if path_len(&path) >= limit => None,
        _ => Some(path),
    }
}

/// Shortest hashed path below `limit` whose reservation could be created.
pub fn hashed_socket_path(dir: &Path, guest_id: &str, limit: usize) -> io::Result<Option<PathBuf>> {
    let digest = format!("{:x}", Sha256::digest(guest_id.as_bytes()));

    for length in SSH_MASTER_SOCKET_MIN_HASH_LENGTH..=SSH_MASTER_SOCKET_MAX_HASH_LENGTH {
        let path = dir.join(format!("{}.socket", &digest[..length]));

        // Longer prefixes only make the path longer.
        if path_len(&path) >= limit {
            return Ok(None);
        }

        let reservation = reservation_path(&path);
        match OpenOptions::new().write(true).create_new(true).open(&reservation) {
            Ok(_) => {
                log::debug!("Reserved socket path {}", path.display());
                return Ok(Some(path));
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                log::debug!("Socket path {} already reserved", path.display());
            }
            Err(e) => return Err(e),
        }
    }

    Ok(None)
}

/// Derive the socket path for `guest_id` inside `dir`, creating `dir`.
pub fn derive_socket_path(dir: &Path, guest_id: &str, limit: usize) -> io::Result<SocketPath> {
    fs::create_dir_all(dir)?;

    if let Some(path) = trivial_socket_path(dir, guest_id, Some(limit)) {
        return Ok(SocketPath {
            path,
            naming: SocketNaming::Trivial,
            limit,
        });
    }

    if let Some(path) = hashed_socket_path(dir, guest_id, limit)? {
        return Ok(SocketPath {
            path,
            naming: SocketNaming::Hashed,
            limit,
        });
    }

    let path = dir.join(format!("{guest_id}.socket"));
    Ok(SocketPath {
        path,
        naming: SocketNaming::Unbounded,
        limit,
    })
}

/// Remove the socket and its reservation, ignoring files already gone.
pub fn release_socket_path(socket: &SocketPath) -> io::Result<()> {
    for path in [socket.path.clone(), socket.reservation()] {
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    #[test]
    fn test_guest_id() {
        assert_eq!(guest_id("10.0.0.1", None, None), "10.0.0.1");
        assert_eq!(guest_id("10.0.0.1", Some(22), None), "10.0.0.1-22");
        assert_eq!(guest_id("host", Some(2222), Some("fedora")), "host-2222-fedora");
        assert_eq!(guest_id("host", None, Some("root")), "host-root");
    }

    #[test]
    fn test_trivial_path_when_short() {
        let dir = tempfile::tempdir().unwrap();
        let socket = derive_socket_path(dir.path(), "host-22", 4096).unwrap();

        assert_eq!(socket.naming, SocketNaming::Trivial);
        assert_eq!(socket.path, dir.path().join("host-22.socket"));
        assert!(socket.within_limit());
        assert!(!socket.reservation().exists());
    }

    #[test]
    fn test_hashed_path_prefers_shortest_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let long_id = "x".repeat(200);
        let limit = path_len(dir.path()) + 40;

        let socket = derive_socket_path(dir.path(), &long_id, limit).unwrap();
        let digest = format!("{:x}", Sha256::digest(long_id.as_bytes()));

        assert_eq!(socket.naming, SocketNaming::Hashed);
        assert_eq!(
            socket.path,
            dir.path().join(format!("{}.socket", &digest[..SSH_MASTER_SOCKET_MIN_HASH_LENGTH]))
        );
        assert!(socket.reservation().exists());
        assert!(socket.within_limit());
    }

    #[test]
    fn test_reservation_collision_takes_longer_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let long_id = "y".repeat(200);
        let limit = path_len(dir.path()) + 40;

        let first = derive_socket_path(dir.path(), &long_id, limit).unwrap();
        let second = derive_socket_path(dir.path(), &long_id, limit).unwrap();

        assert_ne!(first.path, second.path);
        assert_eq!(
            path_len(&second.path),
            path_len(&first.path) + 1,
            "second reservation should use a one character longer hash"
        );
    }

    #[test]
    fn test_fallback_to_unbounded_trivial_path() {
        let dir = tempfile::tempdir().unwrap();
        // Even the shortest hash does not fit.
        let limit = path_len(dir.path()) + 5;

        let socket = derive_socket_path(dir.path(), "some-guest", limit).unwrap();

        assert_eq!(socket.naming, SocketNaming::Unbounded);
        assert_eq!(socket.path, dir.path().join("some-guest.socket"));
        assert!(!socket.within_limit());
    }

    #[test]
    fn test_release_removes_socket_and_reservation() {
        let dir = tempfile::tempdir().unwrap();
        let limit = path_len(dir.path()) + 40;
        let socket = derive_socket_path(dir.path(), &"z".repeat(100), limit).unwrap();
        fs::write(&socket.path, b"").unwrap();

        release_socket_path(&socket).unwrap();
        assert!(!socket.path.exists());
        assert!(!socket.reservation().exists());

        // Releasing twice is fine.
        release_socket_path(&socket).unwrap();
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_socket_paths_are_unique(
            hosts in proptest::collection::hash_set("[a-z0-9.]{1,60}", 1..40),
            port in proptest::option::of(1u16..65535),
        ) {
            let dir = tempfile::tempdir().unwrap();
            let limit = path_len(dir.path()) + 30;

            let mut seen = HashSet::new();
            for host in &hosts {
                let id = guest_id(&format!("host-{host}"), port, Some("root"));
                let socket = derive_socket_path(dir.path(), &id, limit).unwrap();
                prop_assert!(seen.insert(socket.path.clone()), "duplicate path {:?}", socket.path);
            }
        }

        #[test]
        fn prop_enabled_socket_paths_respect_limit(
            id in "[a-zA-Z0-9.-]{1,120}",
            extra in 0usize..80,
        ) {
            let dir = tempfile::tempdir().unwrap();
            let limit = path_len(dir.path()) + extra;

            let socket = derive_socket_path(dir.path(), &id, limit).unwrap();
            if socket.within_limit() {
                prop_assert!(path_len(&socket.path) < limit);
                prop_assert_ne!(socket.naming, SocketNaming::Unbounded);
            } else {
                prop_assert_eq!(socket.naming, SocketNaming::Unbounded);
            }
        }
    }
}
