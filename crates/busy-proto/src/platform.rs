use std::path::{Path, PathBuf};

pub const DAEMON_TCP_PORT: u16 = 9877;

pub fn data_dir() -> PathBuf {
    // On macOS and Linux, use ~/.local/share/busything/ (XDG standard)
    #[cfg(unix)]
    {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join(".local")
            .join("share")
            .join("busything")
    }
    #[cfg(windows)]
    {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("busything")
    }
}

pub fn config_dir() -> PathBuf {
    #[cfg(unix)]
    {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".config")
            .join("busything")
    }

    #[cfg(windows)]
    {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("busything")
    }
}

#[cfg(unix)]
fn binary_names(name: &str) -> Vec<String> {
    vec![name.to_string()]
}

#[cfg(windows)]
fn binary_names(name: &str) -> Vec<String> {
    vec![format!("{}.exe", name), name.to_string()]
}

fn find_beside_exe(names: &[String]) -> Option<PathBuf> {
    let current_exe = std::env::current_exe().ok()?;
    let dir = current_exe.parent()?;
    names.iter().map(|name| dir.join(name)).find(|p| p.exists())
}

fn find_on_path(names: &[String]) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path) {
        for name in names {
            let p = dir.join(name);
            if p.exists() {
                return Some(p);
            }
        }
    }
    None
}

/// Locate the audio player binary.  `player` may be an explicit path;
/// otherwise it is looked up beside the current exe, then on PATH.
pub fn find_player_binary(player: &str) -> Option<PathBuf> {
    let explicit = Path::new(player);
    if explicit.components().count() > 1 {
        return explicit.exists().then(|| explicit.to_path_buf());
    }
    let names = binary_names(player);
    find_beside_exe(&names).or_else(|| find_on_path(&names))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dirs_are_namespaced() {
        assert!(data_dir().ends_with("busything"));
        assert!(config_dir().ends_with("busything"));
    }

    #[test]
    fn test_missing_explicit_player_path() {
        assert!(find_player_binary("/definitely/not/here/mpv").is_none());
    }
}
