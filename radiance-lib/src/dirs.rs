use directories::ProjectDirs;
use thiserror::Error;

use std::path::{Path, PathBuf};
use std::{env, fs, io};

const DOMAIN: &str = "org";
const COMPANY: &str = "getlantern";
const PRODUCT: &str = "radiance";

pub const ENV_VAR_DATA_PATH: &str = "RADIANCE_DATA_PATH";

#[derive(Debug, Error)]
pub enum Error {
    #[error("Unable to determine project directories")]
    NoProjectDirs,
    #[error("IO error: {0}")]
    IO(#[from] io::Error),
}

fn project() -> Option<ProjectDirs> {
    ProjectDirs::from(DOMAIN, COMPANY, PRODUCT)
}

/// Resolves the data directory, creating it if needed.
///
/// `RADIANCE_DATA_PATH` overrides the platform default.
pub fn data_dir() -> Result<PathBuf, Error> {
    if let Ok(path) = env::var(ENV_VAR_DATA_PATH) {
        let dir = PathBuf::from(path);
        fs::create_dir_all(&dir)?;
        return Ok(dir);
    }
    let p_dirs = project().ok_or(Error::NoProjectDirs)?;
    let data_dir = p_dirs.data_local_dir();
    fs::create_dir_all(data_dir)?;
    Ok(data_dir.to_path_buf())
}

pub fn data_path(file: &str) -> Result<PathBuf, Error> {
    Ok(data_dir()?.join(file))
}

/// Writes `bytes` to `path` via a temporary sibling and a rename so readers
/// never observe a torn file.
pub fn write_atomic(path: &Path, bytes: &[u8], mode: u32) -> io::Result<()> {
    let mut tmp = path.as_os_str().to_os_string();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, bytes)?;
    set_mode(&tmp, mode)?;
    fs::rename(&tmp, path)
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}
