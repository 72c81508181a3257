use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::InstallerConfig;
use crate::errors::{InstallerError, Result};
use crate::models::Manifest;
use crate::package::reader::SelfPackage;
use crate::services::pipeline::SELF_PATCH_SUFFIX;
use crate::utils::file::{
    atomic_replace, clear_empty_dirs, prepare_target, rm_list, write_atomic,
};
use crate::utils::paths::{expand_path_vars, to_os_path};

/// Last-applied manifest, persisted inside the install dir for uninstall
/// and future diffs.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PersistedState {
    pub manifest: Manifest,
    pub installed_at: DateTime<Utc>,
    pub install_dir: String,
}

pub fn persisted_path(install_dir: &Path, config: &InstallerConfig) -> PathBuf {
    install_dir.join(&config.metadata_name)
}

pub async fn write_persisted_state(
    install_dir: &Path,
    config: &InstallerConfig,
    manifest: &Manifest,
) -> Result<()> {
    let state = PersistedState {
        manifest: manifest.clone(),
        installed_at: Utc::now(),
        install_dir: install_dir.to_string_lossy().to_string(),
    };
    let bytes = serde_json::to_vec_pretty(&state)?;
    write_atomic(&persisted_path(install_dir, config), &bytes)?;
    Ok(())
}

pub async fn read_persisted_state(
    install_dir: &Path,
    config: &InstallerConfig,
) -> Result<Option<PersistedState>> {
    let path = persisted_path(install_dir, config);
    if !path.exists() {
        return Ok(None);
    }
    let bytes = tokio::fs::read(&path).await?;
    Ok(Some(serde_json::from_slice(&bytes)?))
}

/// Platform application-registration record, shaped after the Windows
/// `Uninstall` registry entry.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AppRegistration {
    pub display_name: String,
    pub display_version: String,
    pub publisher: String,
    pub install_location: String,
    pub uninstall_string: String,
    /// KiB, matching the registry convention.
    pub estimated_size: u64,
    /// Serialized manifest enabling uninstall without a readable dir.
    pub metadata: String,
}

#[cfg(windows)]
mod registry {
    use super::*;

    fn key_path(reg_name: &str) -> String {
        format!("SOFTWARE\\Microsoft\\Windows\\CurrentVersion\\Uninstall\\{reg_name}")
    }

    pub fn write(reg_name: &str, reg: &AppRegistration) -> Result<()> {
        let (key, _) = winreg::RegKey::predef(winreg::enums::HKEY_LOCAL_MACHINE)
            .create_subkey(key_path(reg_name))
            .map_err(|err| InstallerError::Config(format!("registry open failed: {err}")))?;
        let set = |name: &str, value: &str| {
            key.set_value(name, &value.to_string())
                .map_err(|err| InstallerError::Config(format!("registry write failed: {err}")))
        };
        set("DisplayName", &reg.display_name)?;
        set("DisplayVersion", &reg.display_version)?;
        set("Publisher", &reg.publisher)?;
        set("InstallLocation", &reg.install_location)?;
        set("UninstallString", &reg.uninstall_string)?;
        set("InstallerMeta", &reg.metadata)?;
        key.set_value("EstimatedSize", &(reg.estimated_size as u32))
            .map_err(|err| InstallerError::Config(format!("registry write failed: {err}")))?;
        key.set_value("NoModify", &1u32)
            .map_err(|err| InstallerError::Config(format!("registry write failed: {err}")))?;
        key.set_value("NoRepair", &1u32)
            .map_err(|err| InstallerError::Config(format!("registry write failed: {err}")))?;
        Ok(())
    }

    pub fn read(reg_name: &str) -> Result<Option<AppRegistration>> {
        let key = match winreg::RegKey::predef(winreg::enums::HKEY_LOCAL_MACHINE)
            .open_subkey(key_path(reg_name))
        {
            Ok(key) => key,
            Err(_) => return Ok(None),
        };
        let get = |name: &str| key.get_value::<String, _>(name).unwrap_or_default();
        Ok(Some(AppRegistration {
            display_name: get("DisplayName"),
            display_version: get("DisplayVersion"),
            publisher: get("Publisher"),
            install_location: get("InstallLocation"),
            uninstall_string: get("UninstallString"),
            estimated_size: key.get_value::<u32, _>("EstimatedSize").unwrap_or(0) as u64,
            metadata: get("InstallerMeta"),
        }))
    }

    pub fn remove(reg_name: &str) -> Result<()> {
        let _ = winreg::RegKey::predef(winreg::enums::HKEY_LOCAL_MACHINE)
            .delete_subkey_all(key_path(reg_name));
        Ok(())
    }
}

#[cfg(not(windows))]
mod registry {
    use super::*;

    fn registration_path(reg_name: &str) -> Result<PathBuf> {
        let dir = match std::env::var("KACHINA_REGISTRY_DIR") {
            Ok(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => directories::BaseDirs::new()
                .ok_or_else(|| InstallerError::Config("no home directory".into()))?
                .data_local_dir()
                .join("kachina")
                .join("registrations"),
        };
        Ok(dir.join(format!("{reg_name}.json")))
    }

    pub fn write(reg_name: &str, reg: &AppRegistration) -> Result<()> {
        let path = registration_path(reg_name)?;
        write_atomic(&path, &serde_json::to_vec_pretty(reg)?)?;
        Ok(())
    }

    pub fn read(reg_name: &str) -> Result<Option<AppRegistration>> {
        let path = registration_path(reg_name)?;
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_slice(&std::fs::read(path)?)?))
    }

    pub fn remove(reg_name: &str) -> Result<()> {
        let path = registration_path(reg_name)?;
        let _ = std::fs::remove_file(path);
        Ok(())
    }
}

pub fn write_registration(reg_name: &str, reg: &AppRegistration) -> Result<()> {
    registry::write(reg_name, reg)
}

pub fn read_registration(reg_name: &str) -> Result<Option<AppRegistration>> {
    registry::read(reg_name)
}

pub fn remove_registration(reg_name: &str) -> Result<()> {
    registry::remove(reg_name)
}

/// Runs only after every file task succeeded: deferred self-patch rename,
/// maintenance binaries, delete sweep, persisted state, registration.
pub async fn finalize_install(
    config: &InstallerConfig,
    manifest: &Manifest,
    install_dir: &Path,
    package: Option<&Arc<SelfPackage>>,
    deletes: &[String],
) -> Result<()> {
    let updater_path = install_dir.join(&config.updater_name);

    if let Some(package) = package {
        write_maintenance_binaries(config, install_dir, package).await?;
    }
    let parked = PathBuf::from(format!("{}{SELF_PATCH_SUFFIX}", updater_path.display()));
    if parked.exists() {
        prepare_target(&updater_path).await?;
        atomic_replace(&parked, &updater_path).await?;
        tracing::info!(updater = %updater_path.display(), "self-patch applied");
    }

    if !deletes.is_empty() {
        let paths = deletes
            .iter()
            .map(|rel| to_os_path(install_dir, rel))
            .collect();
        for error in rm_list(paths).await {
            tracing::warn!("{error}");
        }
    }

    write_persisted_state(install_dir, config, manifest).await?;

    let uninstaller = install_dir.join(&config.uninstall_name);
    let registration = AppRegistration {
        display_name: config.app_name.clone(),
        display_version: manifest.tag_name.clone(),
        publisher: config.publisher.clone(),
        install_location: install_dir.to_string_lossy().to_string(),
        uninstall_string: format!("\"{}\" -U", uninstaller.display()),
        estimated_size: manifest.hashed.iter().map(|f| f.size).sum::<u64>() / 1024,
        metadata: serde_json::to_string(manifest)?,
    };
    write_registration(&config.reg_name, &registration)?;
    Ok(())
}

/// Uninstaller and updater siblings: the running package's stub plus its
/// configured segments, footer index fields zeroed. Byte-stable across
/// builds from identical inputs.
async fn write_maintenance_binaries(
    config: &InstallerConfig,
    install_dir: &Path,
    package: &Arc<SelfPackage>,
) -> Result<()> {
    let updater_path = install_dir.join(&config.updater_name);
    let uninstaller_path = install_dir.join(&config.uninstall_name);
    let current_exe = std::env::current_exe().ok();
    if current_exe.as_deref() == Some(updater_path.as_path()) {
        // running updater is already the maintenance binary
        return Ok(());
    }
    let base = package.base_with_config();
    write_atomic(&uninstaller_path, &base)?;
    if !updater_path.exists() {
        write_atomic(&updater_path, &base)?;
    }
    Ok(())
}

#[derive(Debug, Default)]
pub struct UninstallOutcome {
    pub removed: usize,
    pub errors: Vec<String>,
}

/// Remove recorded files, preserved-path exclusions expanded, then empty
/// dirs and the registration record. The manifest comes from the persisted
/// state, falling back to the registration's metadata copy.
pub async fn run_uninstall(
    config: &InstallerConfig,
    install_dir: &Path,
) -> Result<UninstallOutcome> {
    let manifest = match read_persisted_state(install_dir, config).await? {
        Some(state) => state.manifest,
        None => match read_registration(&config.reg_name)? {
            Some(reg) if !reg.metadata.is_empty() => serde_json::from_str(&reg.metadata)?,
            _ => {
                return Err(InstallerError::State(
                    "missing uninstall metadata, reinstall required".into(),
                ))
            }
        },
    };

    let current_exe = std::env::current_exe().ok();
    let mut paths: Vec<PathBuf> = manifest
        .hashed
        .iter()
        .map(|file| to_os_path(install_dir, &file.file_name))
        .collect();
    paths.push(install_dir.join(&config.updater_name));
    paths.push(install_dir.join(&config.uninstall_name));
    paths.push(persisted_path(install_dir, config));
    paths.retain(|path| Some(path.as_path()) != current_exe.as_deref());
    let total = paths.len();
    let errors = rm_list(paths).await;

    for raw in config
        .user_data_paths
        .iter()
        .chain(config.extra_uninstall_paths.iter())
    {
        let expanded = expand_path_vars(raw, install_dir);
        let absolute = if expanded.is_absolute() {
            expanded
        } else {
            install_dir.join(expanded)
        };
        if absolute.exists() {
            let removed = if absolute.is_dir() {
                tokio::fs::remove_dir_all(&absolute).await
            } else {
                tokio::fs::remove_file(&absolute).await
            };
            if let Err(err) = removed {
                tracing::warn!(path = %absolute.display(), "user data removal failed: {err}");
            }
        }
    }

    clear_empty_dirs(install_dir.to_path_buf()).await?;
    remove_registration(&config.reg_name)?;
    Ok(UninstallOutcome {
        removed: total - errors.len(),
        errors,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{HashRef, HashedFile};

    fn manifest() -> Manifest {
        Manifest {
            tag_name: "1.0.0".into(),
            hashed: vec![HashedFile {
                file_name: "app.bin".into(),
                size: 2048,
                hash: HashRef {
                    md5: None,
                    xxh: Some("00000000000000aa".into()),
                },
                installer: None,
            }],
            patches: None,
            deletes: None,
            installer: None,
        }
    }

    #[tokio::test]
    async fn persisted_state_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let config = InstallerConfig::default();
        let manifest = manifest();
        write_persisted_state(dir.path(), &config, &manifest)
            .await
            .unwrap();
        let state = read_persisted_state(dir.path(), &config)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.manifest.tag_name, "1.0.0");
        assert_eq!(state.manifest.hashed.len(), 1);
        assert!(dir.path().join(".metadata.json").exists());
    }

    #[cfg(not(windows))]
    #[tokio::test]
    async fn registration_roundtrip_and_uninstall_fallback() {
        let dir = tempfile::tempdir().unwrap();
        std::env::set_var("KACHINA_REGISTRY_DIR", dir.path().join("reg"));
        let manifest = manifest();
        let reg = AppRegistration {
            display_name: "Demo".into(),
            display_version: "1.0.0".into(),
            publisher: "Acme".into(),
            install_location: dir.path().to_string_lossy().to_string(),
            uninstall_string: "uninst -U".into(),
            estimated_size: 2,
            metadata: serde_json::to_string(&manifest).unwrap(),
        };
        write_registration("demo-app", &reg).unwrap();
        let read = read_registration("demo-app").unwrap().unwrap();
        assert_eq!(read.display_version, "1.0.0");

        // uninstall with no persisted state falls back to the registration
        let install = dir.path().join("install");
        std::fs::create_dir_all(&install).unwrap();
        std::fs::write(install.join("app.bin"), b"payload").unwrap();
        let config = InstallerConfig {
            reg_name: "demo-app".into(),
            ..Default::default()
        };
        let outcome = run_uninstall(&config, &install).await.unwrap();
        assert!(outcome.errors.is_empty());
        assert!(!install.join("app.bin").exists());
        assert!(read_registration("demo-app").unwrap().is_none());
        std::env::remove_var("KACHINA_REGISTRY_DIR");
    }

    #[tokio::test]
    async fn uninstall_without_metadata_is_a_state_error() {
        let dir = tempfile::tempdir().unwrap();
        std::env::set_var("KACHINA_REGISTRY_DIR", dir.path().join("reg-none"));
        let config = InstallerConfig {
            reg_name: "ghost-app".into(),
            ..Default::default()
        };
        let err = run_uninstall(&config, dir.path()).await.unwrap_err();
        assert!(matches!(err, InstallerError::State(_)));
        std::env::remove_var("KACHINA_REGISTRY_DIR");
    }
}
