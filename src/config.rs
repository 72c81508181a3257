use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::Result;

/// Embedded `\0CONFIG` payload. Key names are camelCase on the wire.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase", default)]
pub struct InstallerConfig {
    pub app_name: String,
    pub publisher: String,
    pub exe_name: String,
    pub reg_name: String,
    pub program_files_path: String,
    pub uninstall_name: String,
    pub updater_name: String,
    /// Base update source URL; scheme prefix selects the source plugin.
    pub source: String,
    /// Normalized prefixes preserved across installs and uninstalls.
    pub user_data_paths: Vec<String>,
    /// Extra absolute paths (after `${VAR}` expansion) removed on uninstall.
    pub extra_uninstall_paths: Vec<String>,
    /// Name of the persisted manifest inside the install dir.
    pub metadata_name: String,
}

impl Default for InstallerConfig {
    fn default() -> Self {
        Self {
            app_name: "Kachina".into(),
            publisher: "Kachina".into(),
            exe_name: "main.exe".into(),
            reg_name: "Kachina".into(),
            program_files_path: "Kachina".into(),
            uninstall_name: "uninst.exe".into(),
            updater_name: "updater.exe".into(),
            source: String::new(),
            user_data_paths: Vec::new(),
            extra_uninstall_paths: Vec::new(),
            metadata_name: ".metadata.json".into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallDirSource {
    Argument,
    CurrentDir,
    ParentDir,
    Registration,
    Default,
}

#[derive(Debug, Clone)]
pub struct ResolvedInstallDir {
    pub path: PathBuf,
    pub exists: bool,
    pub source: InstallDirSource,
}

impl InstallerConfig {
    pub fn from_json(value: &serde_json::Value) -> Result<Self> {
        Ok(serde_json::from_value(value.clone())?)
    }

    /// Probe order: explicit argument, the exe's own directory, its parent,
    /// the recorded registration, then the platform default location.
    pub fn resolve_install_dir(
        &self,
        arg_target: Option<&Path>,
        exe_path: &Path,
        registered_location: Option<&Path>,
    ) -> ResolvedInstallDir {
        if let Some(target) = arg_target {
            return ResolvedInstallDir {
                path: target.to_path_buf(),
                exists: target.join(&self.exe_name).exists(),
                source: InstallDirSource::Argument,
            };
        }
        if let Some(exe_dir) = exe_path.parent() {
            if exe_dir.join(&self.exe_name).exists() {
                return ResolvedInstallDir {
                    path: exe_dir.to_path_buf(),
                    exists: true,
                    source: InstallDirSource::CurrentDir,
                };
            }
            if let Some(parent) = exe_dir.parent() {
                if parent.join(&self.exe_name).exists() {
                    return ResolvedInstallDir {
                        path: parent.to_path_buf(),
                        exists: true,
                        source: InstallDirSource::ParentDir,
                    };
                }
            }
        }
        if let Some(location) = registered_location {
            if location.join(&self.exe_name).exists() {
                return ResolvedInstallDir {
                    path: location.to_path_buf(),
                    exists: true,
                    source: InstallDirSource::Registration,
                };
            }
            let folded = location.join(&self.reg_name);
            if folded.join(&self.exe_name).exists() {
                return ResolvedInstallDir {
                    path: folded,
                    exists: true,
                    source: InstallDirSource::Registration,
                };
            }
        }
        let default = self.default_install_dir();
        ResolvedInstallDir {
            exists: default.join(&self.exe_name).exists(),
            path: default,
            source: InstallDirSource::Default,
        }
    }

    fn default_install_dir(&self) -> PathBuf {
        #[cfg(windows)]
        {
            let program_files =
                std::env::var("ProgramFiles").unwrap_or_else(|_| "C:\\Program Files".into());
            Path::new(&program_files).join(&self.program_files_path)
        }
        #[cfg(not(windows))]
        {
            directories::BaseDirs::new()
                .map(|dirs| dirs.data_local_dir().join(&self.program_files_path))
                .unwrap_or_else(|| PathBuf::from(&self.program_files_path))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_keys_are_camel_case() {
        let config = InstallerConfig {
            app_name: "Demo".into(),
            ..Default::default()
        };
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["appName"], "Demo");
        assert_eq!(json["metadataName"], ".metadata.json");
        assert!(json.get("app_name").is_none());
    }

    #[test]
    fn partial_config_fills_defaults() {
        let value = serde_json::json!({ "appName": "Demo", "exeName": "demo.exe" });
        let config = InstallerConfig::from_json(&value).unwrap();
        assert_eq!(config.exe_name, "demo.exe");
        assert_eq!(config.uninstall_name, "uninst.exe");
    }

    #[test]
    fn argument_wins_install_dir_resolution() {
        let dir = tempfile::tempdir().unwrap();
        let config = InstallerConfig::default();
        let resolved = config.resolve_install_dir(
            Some(dir.path()),
            Path::new("/nonexistent/updater.exe"),
            None,
        );
        assert_eq!(resolved.source, InstallDirSource::Argument);
        assert_eq!(resolved.path, dir.path());
        assert!(!resolved.exists);
    }

    #[test]
    fn sibling_exe_resolves_current_dir() {
        let dir = tempfile::tempdir().unwrap();
        let config = InstallerConfig::default();
        std::fs::write(dir.path().join(&config.exe_name), b"MZ").unwrap();
        let exe = dir.path().join(&config.updater_name);
        let resolved = config.resolve_install_dir(None, &exe, None);
        assert_eq!(resolved.source, InstallDirSource::CurrentDir);
        assert!(resolved.exists);
    }
}
