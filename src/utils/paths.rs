use std::path::{Path, PathBuf};

/// Canonical manifest path form: forward slashes, no leading slash, no
/// empty or `.` components. Backslash input (Windows callers) is accepted.
pub fn normalize_rel(path: &str) -> String {
    path.replace('\\', "/")
        .split('/')
        .filter(|part| !part.is_empty() && *part != ".")
        .collect::<Vec<_>>()
        .join("/")
}

/// Convert a normalized manifest path into an on-disk path under `root`.
/// The only place separators are translated to the OS form.
pub fn to_os_path(root: &Path, rel: &str) -> PathBuf {
    let mut out = root.to_path_buf();
    for part in normalize_rel(rel).split('/') {
        out.push(part);
    }
    out
}

/// Expand `${VAR}` markers against the install dir and the environment.
pub fn expand_path_vars(raw: &str, install_dir: &Path) -> PathBuf {
    let mut out = raw.replace("${INSTALL_DIR}", &install_dir.to_string_lossy());
    for var in ["APPDATA", "LOCALAPPDATA", "TEMP", "HOME"] {
        let marker = format!("${{{var}}}");
        if out.contains(&marker) {
            if let Ok(value) = std::env::var(var) {
                out = out.replace(&marker, &value);
            }
        }
    }
    PathBuf::from(out)
}

/// True when `rel` falls under any of the preserved user-data prefixes.
pub fn is_user_data_path(rel: &str, prefixes: &[String]) -> bool {
    let rel = normalize_rel(rel);
    prefixes.iter().any(|prefix| {
        let prefix = normalize_rel(prefix);
        !prefix.is_empty()
            && (rel == prefix || rel.starts_with(&format!("{prefix}/")))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_backslashes_and_leading_separators() {
        assert_eq!(normalize_rel("data\\assets.dat"), "data/assets.dat");
        assert_eq!(normalize_rel("/data/assets.dat"), "data/assets.dat");
        assert_eq!(normalize_rel("./data//assets.dat"), "data/assets.dat");
    }

    #[test]
    fn os_path_translation_only_at_the_boundary() {
        let root = Path::new("install");
        let path = to_os_path(root, "data/new-assets.dat");
        assert_eq!(path, root.join("data").join("new-assets.dat"));
        let from_backslash = to_os_path(root, "data\\new-assets.dat");
        assert_eq!(path, from_backslash);
    }

    #[test]
    fn user_data_prefix_matching() {
        let prefixes = vec!["saves".to_string(), "profiles/local".to_string()];
        assert!(is_user_data_path("saves/slot1.dat", &prefixes));
        assert!(is_user_data_path("profiles\\local\\me.json", &prefixes));
        assert!(!is_user_data_path("savestate.bin", &prefixes));
        assert!(!is_user_data_path("profiles/roaming/me.json", &prefixes));
    }

    #[test]
    fn expands_install_dir_marker() {
        let expanded = expand_path_vars("${INSTALL_DIR}/cache", Path::new("/opt/app"));
        assert_eq!(expanded, PathBuf::from("/opt/app/cache"));
    }
}
