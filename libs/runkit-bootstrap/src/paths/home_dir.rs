use std::{
    env, fs,
    path::{Path, PathBuf},
};

/// Default directory name under the user's home (or `%APPDATA%` on Windows).
pub const DEFAULT_SUBDIR: &str = ".polyrun";

/// Errors for resolving the home directory
#[derive(Debug, thiserror::Error)]
pub enum HomeDirError {
    #[error("HOME environment variable is not set")]
    HomeMissing,
    #[error("APPDATA environment variable is not set")]
    AppDataMissing,
    #[error("home_dir must be an absolute path (after ~ expansion): {0}")]
    AbsoluteRequired(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Resolve the directory polyrun keeps its logs and state in.
///
/// - `config_home` given: a leading `~` expands to the user's home; the result must be absolute.
/// - `config_home` absent: `$HOME/<default_subdir>` (`%APPDATA%/<default_subdir>` on Windows).
///
/// With `create`, the directory is created if missing.
pub fn resolve_home_dir(
    config_home: Option<String>,
    default_subdir: &str,
    create: bool,
) -> Result<PathBuf, HomeDirError> {
    let path = match config_home {
        Some(raw) => {
            let expanded = expand_tilde(&raw)?;
            if !expanded.is_absolute() {
                return Err(HomeDirError::AbsoluteRequired(
                    expanded.to_string_lossy().into(),
                ));
            }
            expanded
        }
        None => platform_base()?.join(default_subdir),
    };

    if create {
        fs::create_dir_all(&path)?;
    }
    Ok(path)
}

fn user_home() -> Result<PathBuf, HomeDirError> {
    #[cfg(target_os = "windows")]
    let home = env::var("USERPROFILE").or_else(|_| env::var("HOME"));
    #[cfg(not(target_os = "windows"))]
    let home = env::var("HOME");

    home.map(PathBuf::from).map_err(|_| HomeDirError::HomeMissing)
}

#[cfg(target_os = "windows")]
fn platform_base() -> Result<PathBuf, HomeDirError> {
    env::var("APPDATA")
        .map(PathBuf::from)
        .map_err(|_| HomeDirError::AppDataMissing)
}

#[cfg(not(target_os = "windows"))]
fn platform_base() -> Result<PathBuf, HomeDirError> {
    user_home()
}

fn expand_tilde(raw: &str) -> Result<PathBuf, HomeDirError> {
    if raw == "~" {
        return user_home();
    }
    let rest = raw
        .strip_prefix("~/")
        .or_else(|| raw.strip_prefix("~\\"));
    match rest {
        Some(rest) => Ok(user_home()?.join(rest)),
        None => Ok(Path::new(raw).to_path_buf()),
    }
}
