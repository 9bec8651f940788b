//! XDG directory helpers for the offline cache location.

use std::path::{Path, PathBuf};

/// Directory holding `<collection>.cache` files.
///
/// Uses the configured override if set, then `DDP_CACHE_DIR`, otherwise
/// `$XDG_CACHE_HOME/ddp-client` or `~/.cache/ddp-client`.
pub(crate) fn cache_dir(override_dir: Option<&Path>) -> PathBuf {
    if let Some(dir) = override_dir {
        return dir.to_path_buf();
    }

    if let Ok(dir) = std::env::var("DDP_CACHE_DIR")
        && !dir.trim().is_empty()
    {
        return PathBuf::from(dir);
    }

    std::env::var("XDG_CACHE_HOME")
        .ok()
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join(".cache")
        })
        .join("ddp-client")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_wins() {
        let dir = cache_dir(Some(Path::new("/srv/cache")));
        assert_eq!(dir, PathBuf::from("/srv/cache"));
    }
}
