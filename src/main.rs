use std::cmp::Ordering;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use kachina::cli::InstallerCli;
use kachina::config::InstallerConfig;
use kachina::errors::{InstallerError, Result};
use kachina::models::{compare_tags, Manifest};
use kachina::package::{RemotePackage, SelfPackage};
use kachina::services::{self, finalizer, planner, scheduler, source_for, UpdateSource};

fn main() {
    let args = InstallerCli::parse();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("tokio runtime");
    let log_dir = std::env::temp_dir().join("kachina").join("logs");
    let _ = kachina::logging::init(&log_dir, args.silent);

    if let Err(err) = runtime.block_on(run(args)) {
        tracing::error!("{err}");
        eprintln!("error: {}", err.user_message());
        std::process::exit(err.exit_code());
    }
}

async fn run(args: InstallerCli) -> Result<()> {
    let exe_path = std::env::current_exe()?;
    let package = match SelfPackage::open(&exe_path) {
        Ok(pkg) => Some(Arc::new(pkg)),
        Err(err) => {
            tracing::debug!("running unpacked: {err}");
            None
        }
    };

    let config = resolve_config(&package, &exe_path).await?;
    let registered = finalizer::read_registration(&config.reg_name)?
        .map(|reg| PathBuf::from(reg.install_location));
    let resolved = config.resolve_install_dir(
        args.target.as_deref(),
        &exe_path,
        registered.as_deref(),
    );
    let install_dir = resolved.path.clone();
    tracing::info!(
        install_dir = %install_dir.display(),
        source = ?resolved.source,
        exists = resolved.exists,
        "resolved install directory"
    );

    let exe_name = exe_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    if args.uninstall || exe_name == config.uninstall_name {
        let outcome = finalizer::run_uninstall(&config, &install_dir).await?;
        for error in &outcome.errors {
            tracing::warn!("{error}");
        }
        if !args.silent {
            println!("uninstalled {} files", outcome.removed);
        }
        return Ok(());
    }

    let client = services::http::build_client(&format!(
        "KachinaInstaller/{}",
        env!("CARGO_PKG_VERSION")
    ))?;
    let (ctx, cancel, mut progress_rx) = services::install_context(client);
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("cancellation requested");
                cancel.cancel();
            }
        });
    }
    tokio::spawn(async move {
        while let Some(event) = progress_rx.recv().await {
            tracing::debug!(file = %event.file_name, bytes = event.downloaded, "progress");
        }
    });

    let embedded_manifest = package.as_ref().and_then(|p| p.parsed.manifest.clone());
    let source_spec = args
        .source
        .clone()
        .or_else(|| (!config.source.is_empty()).then(|| config.source.clone()));

    let mut source: Option<Box<dyn UpdateSource>> = None;
    let mut remote: Option<RemotePackage> = None;
    let manifest: Manifest = if args.online || embedded_manifest.is_none() {
        let spec = source_spec.ok_or_else(|| {
            InstallerError::Config("online install requested but no source is configured".into())
        })?;
        let src = source_for(&spec, args.dfs_extras.clone())?;
        let url = src.resolve_chunk_url(&ctx.client).await?;
        let remote_pkg = RemotePackage::open(&ctx.client, &url).await?;
        let online_manifest = remote_pkg.parsed.manifest.clone().ok_or_else(|| {
            InstallerError::Format("remote package has no metadata segment".into())
        })?;
        source = Some(src);
        match &embedded_manifest {
            // embedded copy already as new as the mirror: stay offline
            Some(embedded)
                if !args.online
                    && compare_tags(&embedded.tag_name, &online_manifest.tag_name)
                        != Ordering::Less =>
            {
                embedded.clone()
            }
            _ => {
                remote = Some(remote_pkg);
                online_manifest
            }
        }
    } else {
        embedded_manifest.clone().expect("checked above")
    };

    let previous = finalizer::read_persisted_state(&install_dir, &config).await?;
    planner::check_downgrade(
        previous.as_ref().map(|s| s.manifest.tag_name.as_str()),
        &manifest.tag_name,
    )?;

    // online-only runs must not touch the local payload region
    let embedded_for_plan = if args.online {
        None
    } else {
        package.as_ref().map(|p| &p.parsed)
    };
    let plan = planner::plan(planner::PlanRequest {
        manifest: &manifest,
        install_dir: &install_dir,
        embedded: embedded_for_plan,
        remote: remote.as_ref().map(|r| &r.parsed),
        user_data_paths: &config.user_data_paths,
    })
    .await?;

    if plan.is_empty() {
        tracing::info!(tag = %plan.tag_name, "already at latest");
        if !args.silent {
            println!("already at latest ({})", plan.tag_name);
        }
        return Ok(());
    }
    let locked = plan.unwritable_files();
    if !locked.is_empty() {
        return Err(InstallerError::LockedFiles(locked));
    }
    tracing::info!(
        tag = %plan.tag_name,
        tasks = plan.tasks.len(),
        satisfied = plan.satisfied,
        bytes = plan.total_bytes(),
        "install plan ready"
    );

    let multipart = std::env::var("KACHINA_MULTIPART_RANGES")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);
    let outcome = scheduler::run_plan(
        &ctx,
        &cancel,
        &plan,
        package.clone(),
        remote.as_ref().map(|r| r.url.clone()),
        &install_dir,
        multipart,
    )
    .await?;

    finalizer::finalize_install(
        &config,
        &manifest,
        &install_dir,
        package.as_ref(),
        &plan.deletes,
    )
    .await?;

    if let Some(source) = source {
        let _ = source.end_session(&ctx.client).await;
    }

    tracing::info!(
        installed = outcome.installed,
        merged_groups = outcome.merged_groups,
        forced_direct = outcome.forced_direct,
        "install complete"
    );
    if !args.silent {
        println!(
            "installed {} files to {} ({})",
            outcome.installed,
            install_dir.display(),
            manifest.tag_name
        );
    }
    Ok(())
}

/// Embedded config, with an unpacked-build fallback to a sibling
/// `.config.json` so development binaries stay runnable.
async fn resolve_config(
    package: &Option<Arc<SelfPackage>>,
    exe_path: &std::path::Path,
) -> Result<InstallerConfig> {
    if let Some(config) = package.as_ref().and_then(|p| p.parsed.config.clone()) {
        return Ok(config);
    }
    #[cfg(debug_assertions)]
    {
        if let Some(dir) = exe_path.parent() {
            let sidecar = dir.join(".config.json");
            if sidecar.exists() {
                let raw: serde_json::Value =
                    serde_json::from_slice(&tokio::fs::read(&sidecar).await?)?;
                return InstallerConfig::from_json(&raw);
            }
        }
    }
    let _ = exe_path;
    Ok(InstallerConfig::default())
}
