#![allow(dead_code)]

pub mod server;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use kachina::builder;
use kachina::models::{HashAlgorithm, Manifest};
use kachina::package::{pack, PackInputs, RemotePackage, SelfPackage};
use kachina::services::{finalizer, install_context, planner, scheduler};

/// Point the registration store at a scratch location once per process so
/// tests never touch the real data dir.
pub fn isolate_registry() {
    static REGISTRY: once_cell::sync::Lazy<tempfile::TempDir> =
        once_cell::sync::Lazy::new(|| tempfile::tempdir().unwrap());
    std::env::set_var("KACHINA_REGISTRY_DIR", REGISTRY.path());
}

pub fn write_tree(root: &Path, files: &[(&str, Vec<u8>)]) {
    for (name, data) in files {
        let path = root.join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, data).unwrap();
    }
}

pub fn deterministic_bytes(len: usize, seed: u64) -> Vec<u8> {
    let mut state = seed;
    (0..len)
        .map(|_| {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            (state >> 56) as u8
        })
        .collect()
}

pub fn stub_bytes(marker: &[u8]) -> Vec<u8> {
    let mut stub = b"MZ".to_vec();
    stub.extend_from_slice(marker);
    stub.resize(4096, 0x90);
    stub
}

pub struct BuildSpec<'a> {
    pub work: &'a Path,
    pub app_dir: &'a Path,
    pub prev_dirs: Vec<PathBuf>,
    pub tag: &'a str,
    pub stub: Vec<u8>,
    pub updater: Option<Vec<u8>>,
    pub config: serde_json::Value,
}

/// Full builder pipeline: hash/stage, diff against prior versions, emit
/// the manifest, pack the final executable. Returns the package path and
/// its manifest.
pub async fn build_package(spec: BuildSpec<'_>) -> (PathBuf, Manifest) {
    let staged = spec.work.join(format!("staged-{}", spec.tag));
    std::fs::create_dir_all(&staged).unwrap();
    let mut hashed = builder::hash_tree(spec.app_dir, &staged, HashAlgorithm::Xxh, 4)
        .await
        .unwrap();

    let installer = match &spec.updater {
        Some(bytes) => {
            let updater_path = spec.work.join(format!("updater-{}.exe", spec.tag));
            std::fs::write(&updater_path, bytes).unwrap();
            let (info, mut entry) = builder::stage_updater(&updater_path, &staged, HashAlgorithm::Xxh)
                .await
                .unwrap();
            entry.file_name = "updater.exe".into();
            hashed.push(entry);
            Some(info)
        }
        None => None,
    };

    let (patches, deletes) = if spec.prev_dirs.is_empty() {
        (None, None)
    } else {
        let patches = builder::diff_tree(builder::DiffRequest {
            old_dirs: &spec.prev_dirs,
            new_dir: spec.app_dir,
            new_files: &hashed,
            output_dir: &staged,
            algorithm: HashAlgorithm::Xxh,
        })
        .await
        .unwrap();
        let deletes = builder::list_deletes(&spec.prev_dirs, &hashed).await.unwrap();
        (
            (!patches.is_empty()).then_some(patches),
            (!deletes.is_empty()).then_some(deletes),
        )
    };

    let manifest = Manifest {
        tag_name: spec.tag.to_string(),
        hashed,
        patches,
        deletes,
        installer,
    };
    manifest.validate().unwrap();

    let stub_path = spec.work.join(format!("stub-{}.exe", spec.tag));
    std::fs::write(&stub_path, &spec.stub).unwrap();
    let output = spec.work.join(format!("package-{}.exe", spec.tag));
    pack(PackInputs {
        stub: stub_path,
        config: spec.config,
        theme: None,
        metadata: Some(manifest.clone()),
        hashed_dir: Some(staged),
        output: output.clone(),
    })
    .await
    .unwrap();
    (output, manifest)
}

pub fn default_config_json() -> serde_json::Value {
    serde_json::json!({
        "appName": "Test App",
        "publisher": "Kachina Tests",
        "exeName": "app.exe",
        "regName": "kachina-test-app",
        "updaterName": "updater.exe",
        "uninstallName": "uninst.exe",
    })
}

/// Offline run: every payload comes out of the package's own region.
pub async fn install_offline(
    package_path: &Path,
    target: &Path,
) -> kachina::Result<scheduler::RunOutcome> {
    isolate_registry();
    let package = Arc::new(SelfPackage::open(package_path)?);
    let config = package.parsed.config.clone().unwrap_or_default();
    let manifest = package
        .parsed
        .manifest
        .clone()
        .expect("package has metadata");
    let (ctx, cancel, _progress) = install_context(reqwest::Client::new());
    let plan = planner::plan(planner::PlanRequest {
        manifest: &manifest,
        install_dir: target,
        embedded: Some(&package.parsed),
        remote: None,
        user_data_paths: &config.user_data_paths,
    })
    .await?;
    let outcome = scheduler::run_plan(
        &ctx,
        &cancel,
        &plan,
        Some(package.clone()),
        None,
        target,
        false,
    )
    .await?;
    finalizer::finalize_install(&config, &manifest, target, Some(&package), &plan.deletes).await?;
    Ok(outcome)
}

/// Online run: discovery plus payload ranges against a hosted package; the
/// local payload region is never consulted.
pub async fn install_online(
    url: &str,
    target: &Path,
    multipart: bool,
) -> kachina::Result<scheduler::RunOutcome> {
    isolate_registry();
    let client = reqwest::Client::new();
    let remote = RemotePackage::open(&client, url).await?;
    let config = remote.parsed.config.clone().unwrap_or_default();
    let manifest = remote
        .parsed
        .manifest
        .clone()
        .expect("remote package has metadata");
    let (ctx, cancel, _progress) = install_context(client);
    let plan = planner::plan(planner::PlanRequest {
        manifest: &manifest,
        install_dir: target,
        embedded: None,
        remote: Some(&remote.parsed),
        user_data_paths: &config.user_data_paths,
    })
    .await?;
    let outcome = scheduler::run_plan(
        &ctx,
        &cancel,
        &plan,
        None,
        Some(url.to_string()),
        target,
        multipart,
    )
    .await?;
    finalizer::finalize_install(&config, &manifest, target, None, &plan.deletes).await?;
    Ok(outcome)
}

pub fn assert_file_eq(path: &Path, expected: &[u8]) {
    let actual = std::fs::read(path).unwrap_or_else(|_| panic!("missing {}", path.display()));
    assert_eq!(
        actual,
        expected,
        "content mismatch for {}",
        path.display()
    );
}
