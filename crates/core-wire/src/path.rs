//! Connection endpoint name resolution.

use std::path::PathBuf;

/// Resolve an endpoint name into a socket path.
///
/// Resolution order:
/// 1. an absolute path is taken verbatim,
/// 2. `$XDG_RUNTIME_DIR/<name>`,
/// 3. `$HOME/.<name>`.
///
/// `attempt` selects the fallback stage for retrying dials: attempt 0 tries
/// the runtime dir, attempt 1 the home prefix, anything later gives up.
pub fn resolve_connpath(name: &str, attempt: u32) -> Option<PathBuf> {
    if name.is_empty() {
        return None;
    }

    if name.starts_with('/') {
        return Some(PathBuf::from(name));
    }

    if attempt == 0 {
        if let Some(dir) = std::env::var_os("XDG_RUNTIME_DIR") {
            return Some(PathBuf::from(dir).join(name));
        }
    }

    if attempt <= 1 {
        if let Some(home) = std::env::var_os("HOME") {
            return Some(PathBuf::from(home).join(format!(".{name}")));
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absolute_path_is_verbatim() {
        assert_eq!(
            resolve_connpath("/tmp/sock", 0),
            Some(PathBuf::from("/tmp/sock"))
        );
        // absolute stays valid on every attempt
        assert_eq!(
            resolve_connpath("/tmp/sock", 5),
            Some(PathBuf::from("/tmp/sock"))
        );
    }

    #[test]
    fn empty_name_resolves_to_nothing() {
        assert_eq!(resolve_connpath("", 0), None);
    }
}
