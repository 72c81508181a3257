use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_compression::tokio::bufread::ZstdDecoder;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};

use crate::delta;
use crate::errors::{InstallerError, Result};
use crate::models::{HashAlgorithm, HashValue};
use crate::package::format::normalize_footer;
use crate::package::reader::{PayloadReader, SelfPackage};
use crate::services::merger::MergedGroup;
use crate::services::planner::{DiffTask, InstallMode, SourceSpan, Span};
use crate::services::progress::{DownloadMonitor, ProgressEvent, ReadWithCallback};
use crate::services::{http, InstallContext};
use crate::utils::file::{atomic_replace, tmp_sibling};
use crate::utils::hash::StreamingHasher;
use crate::utils::paths::to_os_path;

/// Deferred self-patch artifact; the finalizer renames it once every other
/// task has succeeded.
pub const SELF_PATCH_SUFFIX: &str = ".kachina-selfpatch";

type ByteStream = Box<dyn AsyncRead + Unpin + Send>;

pub struct TaskEnv<'a> {
    pub ctx: &'a InstallContext,
    pub package: Option<&'a Arc<SelfPackage>>,
    pub remote_url: Option<&'a str>,
    pub algorithm: HashAlgorithm,
    pub install_dir: &'a Path,
}

impl TaskEnv<'_> {
    fn target_path(&self, task: &DiffTask) -> PathBuf {
        to_os_path(self.install_dir, &task.target.file_name)
    }

    fn embedded_reader(&self, span: Span) -> Result<PayloadReader> {
        let package = self.package.ok_or_else(|| {
            InstallerError::Config("embedded payload requested without a packed binary".into())
        })?;
        Ok(PayloadReader::new(
            Arc::clone(package),
            &crate::package::format::PayloadEntry {
                name: String::new(),
                offset: span.offset,
                size: span.size,
            },
        ))
    }

    async fn open_source(&self, source: SourceSpan) -> Result<(ByteStream, bool)> {
        match source {
            SourceSpan::Embedded(span) => Ok((Box::new(self.embedded_reader(span)?), false)),
            SourceSpan::Remote(span) => {
                let url = self.remote_url.ok_or_else(|| {
                    InstallerError::Config("remote payload requested without a package URL".into())
                })?;
                let stream =
                    http::open_range_stream(&self.ctx.client, url, span.offset, span.size).await?;
                Ok((stream, true))
            }
        }
    }
}

/// Drive one task through its install mode. `source → zstd → [patch] →
/// hash → temp file → atomic replace`, with the self-patch rename deferred.
pub async fn run_task(env: &TaskEnv<'_>, task: &DiffTask, mode: InstallMode) -> Result<()> {
    env.ctx.check_cancelled()?;
    match mode {
        InstallMode::Local { blob } => {
            let reader: ByteStream = Box::new(env.embedded_reader(blob)?);
            install_extract(env, task, reader, false).await
        }
        InstallMode::Direct { blob } => {
            let (reader, monitored) = env.open_source(SourceSpan::Remote(blob)).await?;
            install_extract(env, task, reader, monitored).await
        }
        InstallMode::Patch { diff } => {
            let (reader, monitored) = env.open_source(diff).await?;
            install_patch(env, task, reader, monitored, PatchBase::OnDisk).await
        }
        InstallMode::HybridPatch { base, diff } => {
            let (reader, monitored) = env.open_source(diff).await?;
            install_patch(env, task, reader, monitored, PatchBase::Embedded(base)).await
        }
    }
}

/// Fetch a merged group and install every member from the one response.
/// Per-member failures are isolated; sibling successes are preserved.
pub async fn run_merged_group(
    env: &TaskEnv<'_>,
    tasks: &[DiffTask],
    group: &MergedGroup,
    multipart: bool,
) -> Vec<(usize, Result<()>)> {
    match fetch_group_bodies(env, group, multipart).await {
        Ok(bodies) => {
            let mut results = Vec::with_capacity(group.files.len());
            for (member, body) in group.files.iter().zip(bodies) {
                let task = &tasks[member.task_index];
                let reader: ByteStream = Box::new(std::io::Cursor::new(body));
                let outcome = match task.mode {
                    InstallMode::Direct { .. } => install_extract(env, task, reader, false).await,
                    InstallMode::Patch { .. } => {
                        install_patch(env, task, reader, false, PatchBase::OnDisk).await
                    }
                    _ => Err(InstallerError::Config(
                        "merged group contains a non-mergeable task".into(),
                    )),
                };
                results.push((member.task_index, outcome));
            }
            results
        }
        Err(err) => {
            // the whole request failed; every member re-queues individually
            let mut results = Vec::with_capacity(group.files.len());
            let message = err.to_string();
            for member in &group.files {
                results.push((
                    member.task_index,
                    Err(InstallerError::Http(message.clone())),
                ));
            }
            results
        }
    }
}

/// One request per group. Contiguous encoding drains gap bytes from the
/// single stream; multipart asks for each sub-range explicitly.
async fn fetch_group_bodies(
    env: &TaskEnv<'_>,
    group: &MergedGroup,
    multipart: bool,
) -> Result<Vec<Vec<u8>>> {
    let url = env.remote_url.ok_or_else(|| {
        InstallerError::Config("merged download requested without a package URL".into())
    })?;
    if multipart {
        let spans: Vec<(u64, u64)> = group.files.iter().map(|m| (m.offset, m.size)).collect();
        return http::fetch_multipart_ranges(&env.ctx.client, url, &spans).await;
    }

    let (start, end) = group.range;
    let mut stream =
        http::open_range_stream(&env.ctx.client, url, start, end - start).await?;
    let mut monitor = DownloadMonitor::new();
    let mut cursor = start;
    let mut received = 0u64;
    let mut bodies = Vec::with_capacity(group.files.len());
    for member in &group.files {
        // wire order matches offset order; anything between is waste
        let gap = member.offset - cursor;
        if gap > 0 {
            tokio::io::copy(&mut (&mut stream).take(gap), &mut tokio::io::sink()).await?;
            received += gap;
        }
        let mut body = vec![0u8; member.size as usize];
        let mut filled = 0usize;
        while filled < body.len() {
            env.ctx.check_cancelled()?;
            let read = stream.read(&mut body[filled..]).await?;
            if read == 0 {
                return Err(InstallerError::Http("merged range ended early".into()));
            }
            filled += read;
            received += read as u64;
            monitor.check_stall(received)?;
        }
        cursor = member.offset + member.size;
        bodies.push(body);
    }
    Ok(bodies)
}

fn progress_tap(ctx: InstallContext, file_name: String) -> impl FnMut(usize) {
    let mut downloaded = 0u64;
    let mut last = Instant::now() - Duration::from_millis(100);
    move |chunk| {
        downloaded += chunk as u64;
        if last.elapsed() >= Duration::from_millis(20) {
            last = Instant::now();
            ctx.publish(ProgressEvent {
                file_name: file_name.clone(),
                downloaded,
            });
        }
    }
}

async fn install_extract(
    env: &TaskEnv<'_>,
    task: &DiffTask,
    source: ByteStream,
    monitored: bool,
) -> Result<()> {
    let target = env.target_path(task);
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = tmp_sibling(&target);

    let tapped = ReadWithCallback {
        reader: source,
        callback: progress_tap(env.ctx.clone(), task.target.file_name.clone()),
    };
    let mut decoder = ZstdDecoder::new(BufReader::new(tapped));
    let mut hasher = (!task.skip_hash).then(|| StreamingHasher::new(env.algorithm));
    let mut monitor = monitored.then(DownloadMonitor::new);

    let out = tokio::fs::File::create(&tmp).await?;
    let mut writer = tokio::io::BufWriter::new(out);
    let mut buffer = vec![0u8; 256 * 1024];
    let mut written = 0u64;
    let copy_result: Result<()> = async {
        loop {
            env.ctx.check_cancelled()?;
            let read = decoder.read(&mut buffer).await?;
            if read == 0 {
                break;
            }
            if let Some(hasher) = hasher.as_mut() {
                hasher.update(&buffer[..read]);
            }
            writer.write_all(&buffer[..read]).await?;
            written += read as u64;
            if let Some(monitor) = monitor.as_mut() {
                monitor.check_stall(written)?;
            }
        }
        writer.flush().await?;
        Ok(())
    }
    .await;
    drop(writer);
    if let Err(err) = copy_result {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(err);
    }

    if let Some(hasher) = hasher {
        verify_or_remove(&tmp, &task.target.file_name, task.target_hash, hasher.finalize())
            .await?;
    }
    finalize_file(env, task, &tmp, &target).await
}

enum PatchBase {
    /// Apply against the file currently on disk.
    OnDisk,
    /// Decompress an embedded old-version blob as the base.
    Embedded(Span),
}

async fn install_patch(
    env: &TaskEnv<'_>,
    task: &DiffTask,
    diff_source: ByteStream,
    monitored: bool,
    base: PatchBase,
) -> Result<()> {
    let target = env.target_path(task);
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    // the diff is bounded by the builder's size gate; buffer it fully
    let tapped = ReadWithCallback {
        reader: diff_source,
        callback: progress_tap(env.ctx.clone(), task.target.file_name.clone()),
    };
    let mut decoder = ZstdDecoder::new(BufReader::new(tapped));
    let mut diff_bytes = Vec::new();
    let mut monitor = monitored.then(DownloadMonitor::new);
    let mut buffer = vec![0u8; 256 * 1024];
    loop {
        env.ctx.check_cancelled()?;
        let read = decoder.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        diff_bytes.extend_from_slice(&buffer[..read]);
        if let Some(monitor) = monitor.as_mut() {
            monitor.check_stall(diff_bytes.len() as u64)?;
        }
    }
    let patch = delta::decode(&diff_bytes)?;
    drop(diff_bytes);

    let (base_path, base_is_temp) = match base {
        PatchBase::OnDisk => (target.clone(), false),
        PatchBase::Embedded(span) => {
            let base_tmp = target.with_file_name(format!(
                "{}.kachina-base",
                target
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default()
            ));
            extract_embedded_base(env, span, &base_tmp).await?;
            (base_tmp, true)
        }
    };

    let tmp = tmp_sibling(&target);
    let algorithm = env.algorithm;
    let skip_hash = task.skip_hash;
    let apply_base = base_path.clone();
    let apply_tmp = tmp.clone();
    let applied: std::result::Result<Option<HashValue>, std::io::Error> =
        tokio::task::spawn_blocking(move || {
            let mut base_file = std::fs::File::open(&apply_base)?;
            let out = std::fs::File::create(&apply_tmp)?;
            let mut writer = HashingWriter {
                inner: std::io::BufWriter::new(out),
                hasher: (!skip_hash).then(|| StreamingHasher::new(algorithm)),
            };
            delta::apply(&mut base_file, &patch, &mut writer)?;
            writer.inner.flush()?;
            Ok(writer.hasher.map(StreamingHasher::finalize))
        })
        .await
        .map_err(|err| InstallerError::Patch(format!("patch worker died: {err}")))?;

    if base_is_temp {
        let _ = tokio::fs::remove_file(&base_path).await;
    }
    let produced = match applied {
        Ok(hash) => hash,
        Err(err) => {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(InstallerError::Patch(err.to_string()));
        }
    };
    if let Some(actual) = produced {
        verify_or_remove(&tmp, &task.target.file_name, task.target_hash, actual).await?;
    }
    finalize_file(env, task, &tmp, &target).await
}

async fn extract_embedded_base(env: &TaskEnv<'_>, span: Span, dest: &Path) -> Result<()> {
    let reader = env.embedded_reader(span)?;
    let mut decoder = ZstdDecoder::new(BufReader::new(reader));
    let out = tokio::fs::File::create(dest).await?;
    let mut writer = tokio::io::BufWriter::new(out);
    tokio::io::copy(&mut decoder, &mut writer).await?;
    writer.flush().await?;
    Ok(())
}

struct HashingWriter<W: Write> {
    inner: W,
    hasher: Option<StreamingHasher>,
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let written = self.inner.write(buf)?;
        if let Some(hasher) = self.hasher.as_mut() {
            hasher.update(&buf[..written]);
        }
        Ok(written)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

async fn verify_or_remove(
    tmp: &Path,
    file_name: &str,
    expected: HashValue,
    actual: HashValue,
) -> Result<()> {
    if actual != expected {
        let _ = tokio::fs::remove_file(tmp).await;
        return Err(InstallerError::HashMismatch {
            file: file_name.to_string(),
            expected: expected.to_hex(),
            actual: actual.to_hex(),
        });
    }
    Ok(())
}

/// Self-patch artifacts stay parked next to the target with their footer
/// index fields zeroed; everything else replaces the target atomically.
async fn finalize_file(env: &TaskEnv<'_>, task: &DiffTask, tmp: &Path, target: &Path) -> Result<()> {
    if task.installer {
        normalize_footer_file(tmp).await?;
        let parked = PathBuf::from(format!("{}{SELF_PATCH_SUFFIX}", target.display()));
        let _ = tokio::fs::remove_file(&parked).await;
        tokio::fs::rename(tmp, &parked).await?;
    } else {
        atomic_replace(tmp, target).await?;
    }
    env.ctx.publish(ProgressEvent {
        file_name: task.target.file_name.clone(),
        downloaded: task.mode.transfer_size(),
    });
    Ok(())
}

/// Zero the footer's index/metadata size fields of a written artifact so
/// installer bytes stay comparable across packages.
pub async fn normalize_footer_file(path: &Path) -> Result<()> {
    let mut bytes = tokio::fs::read(path).await?;
    if normalize_footer(&mut bytes) {
        tokio::fs::write(path, bytes).await?;
    }
    Ok(())
}
