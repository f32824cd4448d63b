//! Peer authentication for the control socket.
//!
//! A request is authorized when the peer is root, the daemon's own user, or
//! a member of the control group. On mobile the platform sandbox is the
//! boundary and no peer check applies.

use std::io;
use std::path::Path;

/// Unix group whose members may drive the service.
pub const CONTROL_GROUP: &str = "radiance";

#[cfg(target_os = "macos")]
const ADMIN_GROUP: &str = "admin";

#[cfg(any(target_os = "ios", target_os = "android"))]
pub fn authorize(_uid: u32, _gid: u32) -> bool {
    true
}

#[cfg(all(unix, not(any(target_os = "ios", target_os = "android"))))]
pub fn authorize(uid: u32, gid: u32) -> bool {
    if uid == 0 || uid == uzers::get_effective_uid() {
        return true;
    }
    in_control_group(uid, gid)
}

#[cfg(all(unix, not(any(target_os = "ios", target_os = "android"))))]
fn in_control_group(uid: u32, gid: u32) -> bool {
    let Some(user) = uzers::get_user_by_uid(uid) else {
        return false;
    };
    let name = user.name().to_string_lossy().to_string();
    let Some(groups) = uzers::get_user_groups(&name, gid) else {
        return false;
    };
    groups.iter().any(|group| {
        let group = group.name().to_string_lossy();
        if group == CONTROL_GROUP {
            return true;
        }
        #[cfg(target_os = "macos")]
        if group == ADMIN_GROUP {
            return true;
        }
        false
    })
}

/// Socket file permissions: group access for the control group when running
/// privileged, owner-only otherwise.
#[cfg(unix)]
pub fn set_socket_permissions(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    if uzers::get_effective_uid() == 0 {
        let group = control_group_gid();
        match group {
            Some(gid) => {
                std::os::unix::fs::chown(path, Some(0), Some(gid))?;
                std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o660))
            }
            None => {
                tracing::warn!(group = CONTROL_GROUP, "control group missing, restricting socket to root");
                std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            }
        }
    } else {
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
    }
}

#[cfg(unix)]
fn control_group_gid() -> Option<u32> {
    #[cfg(target_os = "macos")]
    let candidates = [CONTROL_GROUP, ADMIN_GROUP];
    #[cfg(not(target_os = "macos"))]
    let candidates = [CONTROL_GROUP];

    candidates
        .iter()
        .find_map(|name| uzers::get_group_by_name(name).map(|g| g.gid()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_user_is_authorized() {
        let uid = uzers::get_effective_uid();
        let gid = uzers::get_effective_gid();
        assert!(authorize(uid, gid));
    }

    #[test]
    fn root_is_authorized() {
        assert!(authorize(0, 0));
    }

    #[cfg(all(unix, not(any(target_os = "ios", target_os = "android"))))]
    #[test]
    fn unknown_uid_is_denied() {
        // uids this high do not exist on test systems
        assert!(!authorize(4_000_000_000, 4_000_000_000));
    }
}
