//! Central path resolution for all svakla data files.
//!
//! Resolved once at startup from: CLI `--data-dir` > `SVAKLA_DATA_DIR` env > `~/svakla`.
//! All callsites use these helpers instead of constructing paths from `HOME`.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

static DATA_DIR: RwLock<Option<PathBuf>> = RwLock::new(None);

/// Initialize the global data directory. Returns the resolved path.
///
/// Priority: `explicit` arg > `SVAKLA_DATA_DIR` env > `~/svakla` default.
/// Falls back to the working directory when no home directory exists.
pub fn init_data_dir(explicit: Option<&Path>) -> PathBuf {
    let dir = resolve_data_dir(explicit);

    let mut guard = DATA_DIR.write().unwrap_or_else(|e| e.into_inner());
    *guard = Some(dir.clone());
    dir
}

fn resolve_data_dir(explicit: Option<&Path>) -> PathBuf {
    if let Some(p) = explicit {
        return p.to_path_buf();
    }
    if let Ok(env_val) = std::env::var("SVAKLA_DATA_DIR") {
        if !env_val.trim().is_empty() {
            return PathBuf::from(env_val);
        }
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("svakla")
}

/// Return the current data directory, resolving the default if
/// `init_data_dir` hasn't been called.
pub fn data_dir() -> PathBuf {
    let guard = DATA_DIR.read().unwrap_or_else(|e| e.into_inner());
    match guard.as_ref() {
        Some(dir) => dir.clone(),
        None => resolve_data_dir(None),
    }
}

pub fn config_dir() -> PathBuf {
    data_dir().join("config")
}

pub fn config_file_path() -> PathBuf {
    config_dir().join("server.toml")
}

pub fn default_cert_path() -> PathBuf {
    config_dir().join("tls").join("fullchain.pem")
}

pub fn default_key_path() -> PathBuf {
    config_dir().join("tls").join("privkey.pem")
}

pub fn chat_dir() -> PathBuf {
    data_dir().join("chat")
}

pub fn log_dir() -> PathBuf {
    data_dir().join("logs")
}

/// Create all required subdirectories under the data dir.
pub fn ensure_dirs() -> io::Result<()> {
    let base = data_dir();
    std::fs::create_dir_all(&base)?;
    std::fs::create_dir_all(config_dir())?;
    std::fs::create_dir_all(chat_dir())?;
    std::fs::create_dir_all(log_dir())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_dir_wins() {
        let dir = resolve_data_dir(Some(Path::new("/srv/svakla")));
        assert_eq!(dir, PathBuf::from("/srv/svakla"));
    }

    #[test]
    fn layout_hangs_off_data_dir() {
        let tmp = tempfile::tempdir().unwrap();
        init_data_dir(Some(tmp.path()));
        ensure_dirs().unwrap();

        assert!(chat_dir().is_dir());
        assert!(log_dir().is_dir());
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 3);
        assert_eq!(config_file_path(), tmp.path().join("config/server.toml"));
        assert!(default_cert_path().starts_with(tmp.path()));
    }
}
