//! Outbound server sets: the Lantern-delivered group and the user group.
//!
//! Tags are unique across the union of both groups. Consumers always get
//! snapshots; every mutation saves atomically.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use std::fmt::{self, Display};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::{fs, io};

use crate::config::ServerLocation;
use crate::dirs;

pub mod tofu;

pub const FILE_NAME: &str = "servers.json";
const FILE_MODE: u32 = 0o600;

#[derive(Debug, Error)]
pub enum Error {
    #[error("unknown server group: {0}")]
    UnknownGroup(String),
    #[error("server tag not found: {0}")]
    TagNotFound(String),
    #[error("duplicate server tag: {0}")]
    DuplicateTag(String),
    #[error("server without a tag")]
    MissingTag,
    #[error("IO error: {0}")]
    IO(#[from] io::Error),
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Group {
    Lantern,
    User,
}

/// One outbound or endpoint option block plus where it belongs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Server {
    pub group: Group,
    pub tag: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub options: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<ServerLocation>,
}

#[derive(Clone)]
pub struct Manager {
    inner: Arc<Inner>,
}

struct Inner {
    path: PathBuf,
    servers: Mutex<Vec<Server>>,
}

impl Manager {
    pub fn open(data_dir: &Path) -> Result<Manager, Error> {
        let path = data_dir.join(FILE_NAME);
        let servers = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(Error::IO(e)),
        };
        Ok(Manager {
            inner: Arc::new(Inner {
                path,
                servers: Mutex::new(servers),
            }),
        })
    }

    /// Immutable snapshot of every server in both groups.
    pub fn get_servers(&self) -> Vec<Server> {
        self.lock().clone()
    }

    pub fn get_servers_in(&self, group: Group) -> Vec<Server> {
        self.lock().iter().filter(|s| s.group == group).cloned().collect()
    }

    pub fn get_server_by_tag(&self, tag: &str) -> Option<Server> {
        self.lock().iter().find(|s| s.tag == tag).cloned()
    }

    /// Replaces the whole `group` with `servers`. Tags must be non-empty,
    /// unique within the new set and not collide with the other group.
    pub fn set_servers(&self, group: Group, servers: Vec<Server>) -> Result<(), Error> {
        let mut incoming = servers;
        for server in &mut incoming {
            server.group = group;
            if server.tag.is_empty() {
                return Err(Error::MissingTag);
            }
        }

        let mut current = self.lock();
        let mut next: Vec<Server> = current.iter().filter(|s| s.group != group).cloned().collect();
        for server in incoming {
            if next.iter().any(|s| s.tag == server.tag) {
                return Err(Error::DuplicateTag(server.tag));
            }
            next.push(server);
        }
        self.save(&next)?;
        *current = next;
        Ok(())
    }

    /// Adds servers to `group`, skipping tags that already exist anywhere.
    /// Returns the skipped tags.
    pub fn add_servers(&self, group: Group, servers: Vec<Server>) -> Result<Vec<String>, Error> {
        let mut current = self.lock();
        let mut next = current.clone();
        let mut skipped = Vec::new();
        for mut server in servers {
            if server.tag.is_empty() {
                return Err(Error::MissingTag);
            }
            server.group = group;
            if next.iter().any(|s| s.tag == server.tag) {
                skipped.push(server.tag);
            } else {
                next.push(server);
            }
        }
        self.save(&next)?;
        *current = next;
        Ok(skipped)
    }

    pub fn remove_server(&self, tag: &str) -> Result<(), Error> {
        let mut current = self.lock();
        let before = current.len();
        let next: Vec<Server> = current.iter().filter(|s| s.tag != tag).cloned().collect();
        if next.len() == before {
            return Err(Error::TagNotFound(tag.to_string()));
        }
        self.save(&next)?;
        *current = next;
        Ok(())
    }

    fn save(&self, servers: &[Server]) -> Result<(), Error> {
        let bytes = serde_json::to_vec_pretty(servers)?;
        dirs::write_atomic(&self.inner.path, &bytes, FILE_MODE)?;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Server>> {
        match self.inner.servers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl FromStr for Group {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lantern" => Ok(Group::Lantern),
            "user" => Ok(Group::User),
            other => Err(Error::UnknownGroup(other.to_string())),
        }
    }
}

impl Display for Group {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Group::Lantern => write!(f, "lantern"),
            Group::User => write!(f, "user"),
        }
    }
}
