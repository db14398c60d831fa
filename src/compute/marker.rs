use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, warn};

/// Marker asking this process to initiate a computation.
pub const INITIATE_MARKER: &str = "start_computation";

/// Marker asking this process to assist a computation as a peer.
pub const PEER_MARKER: &str = "start_peer";

/// Part a process plays in one computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Peer,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initiator => "initiator",
            Self::Peer => "peer",
        }
    }

    fn marker(&self) -> &'static str {
        match self {
            Self::Initiator => INITIATE_MARKER,
            Self::Peer => PEER_MARKER,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Role marker files of one client process, under `<root>/<pid>/`.
#[derive(Debug, Clone)]
pub struct RoleMarkers {
    dir: PathBuf,
}

impl RoleMarkers {
    pub fn new(root: &Path, pid: u32) -> Self {
        Self {
            dir: root.join(pid.to_string()),
        }
    }

    /// Creates the marker directory.
    pub fn create_dir(&self) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating marker directory {}", self.dir.display()))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, role: Role) -> PathBuf {
        self.dir.join(role.marker())
    }

    pub fn is_present(&self, role: Role) -> bool {
        self.path(role).is_file()
    }

    /// Creates the marker for `role`.
    pub fn set(&self, role: Role) -> Result<PathBuf> {
        self.create_dir()?;
        let path = self.path(role);
        std::fs::write(&path, b"")
            .with_context(|| format!("creating marker {}", path.display()))?;
        Ok(path)
    }

    /// Deletes the marker for `role`. Returns whether it existed.
    pub fn clear(&self, role: Role) -> Result<bool> {
        remove_if_present(&self.path(role))
    }

    /// Deletes the marker for `role` when the guard goes out of scope.
    pub fn guard(&self, role: Role) -> MarkerGuard {
        MarkerGuard {
            path: self.path(role),
        }
    }

    /// Deletes both markers and the directory itself.
    pub fn remove_all(&self) -> Result<()> {
        for role in [Role::Initiator, Role::Peer] {
            self.clear(role)?;
        }

        match std::fs::remove_dir_all(&self.dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e)
                .with_context(|| format!("removing marker directory {}", self.dir.display())),
        }
    }
}

/// Deletes a marker file on drop, on every exit path including unwinding.
#[must_use = "the marker is deleted when the guard is dropped"]
pub struct MarkerGuard {
    path: PathBuf,
}

impl Drop for MarkerGuard {
    fn drop(&mut self) {
        match remove_if_present(&self.path) {
            Ok(true) => debug!(marker = %self.path.display(), "role marker consumed"),
            Ok(false) => {}
            Err(e) => warn!(error = %e, "failed to delete role marker"),
        }
    }
}

fn remove_if_present(path: &Path) -> Result<bool> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e).with_context(|| format!("deleting marker {}", path.display())),
    }
}

/// Designates one initiator process and any number of peer processes.
pub fn designate(root: &Path, initiator: u32, peers: &[u32]) -> Result<Vec<PathBuf>> {
    let mut created = Vec::with_capacity(peers.len() + 1);

    created.push(RoleMarkers::new(root, initiator).set(Role::Initiator)?);
    for pid in peers {
        created.push(RoleMarkers::new(root, *pid).set(Role::Peer)?);
    }

    Ok(created)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_clear() {
        let root = tempfile::tempdir().expect("tempdir");
        let markers = RoleMarkers::new(root.path(), 42);

        assert!(!markers.is_present(Role::Initiator));
        let path = markers.set(Role::Initiator).expect("set");
        assert_eq!(path, root.path().join("42").join(INITIATE_MARKER));
        assert!(markers.is_present(Role::Initiator));
        assert!(!markers.is_present(Role::Peer));

        assert!(markers.clear(Role::Initiator).expect("clear"));
        assert!(!markers.clear(Role::Initiator).expect("clear again"));
    }

    #[test]
    fn test_guard_deletes_on_drop() {
        let root = tempfile::tempdir().expect("tempdir");
        let markers = RoleMarkers::new(root.path(), 7);
        markers.set(Role::Peer).expect("set");

        {
            let _guard = markers.guard(Role::Peer);
            assert!(markers.is_present(Role::Peer));
        }

        assert!(!markers.is_present(Role::Peer));
    }

    #[test]
    fn test_guard_deletes_on_panic() {
        let root = tempfile::tempdir().expect("tempdir");
        let markers = RoleMarkers::new(root.path(), 7);
        markers.set(Role::Initiator).expect("set");

        let guarded = markers.clone();
        let result = std::panic::catch_unwind(move || {
            let _guard = guarded.guard(Role::Initiator);
            panic!("engine blew up");
        });

        assert!(result.is_err());
        assert!(!markers.is_present(Role::Initiator));
    }

    #[test]
    fn test_remove_all() {
        let root = tempfile::tempdir().expect("tempdir");
        let markers = RoleMarkers::new(root.path(), 9);
        markers.set(Role::Initiator).expect("set");
        markers.set(Role::Peer).expect("set");

        markers.remove_all().expect("remove");
        assert!(!markers.dir().exists());

        // Already gone.
        markers.remove_all().expect("remove again");
    }

    #[test]
    fn test_designate() {
        let root = tempfile::tempdir().expect("tempdir");
        let created = designate(root.path(), 100, &[200, 300]).expect("designate");

        assert_eq!(created.len(), 3);
        assert!(RoleMarkers::new(root.path(), 100).is_present(Role::Initiator));
        assert!(RoleMarkers::new(root.path(), 200).is_present(Role::Peer));
        assert!(RoleMarkers::new(root.path(), 300).is_present(Role::Peer));
        assert!(!RoleMarkers::new(root.path(), 300).is_present(Role::Initiator));
    }
}
