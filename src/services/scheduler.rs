use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::sleep;

use crate::errors::{InstallerError, Result};
use crate::models::HashAlgorithm;
use crate::package::reader::SelfPackage;
use crate::services::merger::{self, MergeCandidate};
use crate::services::pipeline::{self, TaskEnv};
use crate::services::planner::{DiffTask, InstallMode, InstallPlan};
use crate::services::{CancelHandle, InstallContext};

const LARGE_SLOTS: usize = 4;
const SMALL_SLOTS: usize = 6;
const LOCAL_SLOTS: usize = 16;
const MAX_ATTEMPTS: u32 = 3;
const BACKOFF_BASE: Duration = Duration::from_millis(500);

#[derive(Debug, Default)]
pub struct RunOutcome {
    pub installed: usize,
    pub merged_groups: usize,
    pub forced_direct: usize,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum QueueClass {
    Large,
    Small,
    Local,
}

enum Job {
    Single(usize),
    Group(merger::MergedGroup),
}

struct WorkerShared {
    ctx: InstallContext,
    cancel: CancelHandle,
    package: Option<Arc<SelfPackage>>,
    remote_url: Option<String>,
    algorithm: HashAlgorithm,
    install_dir: PathBuf,
    tasks: Arc<Vec<DiffTask>>,
    multipart_groups: bool,
}

impl WorkerShared {
    fn env(&self) -> TaskEnv<'_> {
        TaskEnv {
            ctx: &self.ctx,
            package: self.package.as_ref(),
            remote_url: self.remote_url.as_deref(),
            algorithm: self.algorithm,
            install_dir: &self.install_dir,
        }
    }
}

/// Large/small boundary: 80% of the N-th largest network transfer, where
/// N keeps two to four tasks in the large queue.
fn large_threshold(mut sizes: Vec<u64>) -> u64 {
    if sizes.is_empty() {
        return u64::MAX;
    }
    sizes.sort_unstable_by(|a, b| b.cmp(a));
    let n = ((sizes.len() as f64 * 0.3).ceil() as usize).clamp(2, 4);
    let nth = sizes[n.min(sizes.len()) - 1];
    nth - nth / 5
}

fn is_network(task: &DiffTask) -> bool {
    match &task.mode {
        InstallMode::Local { .. } => false,
        InstallMode::Direct { .. } => true,
        InstallMode::Patch { diff } => diff.remote_span().is_some(),
        InstallMode::HybridPatch { diff, .. } => diff.remote_span().is_some(),
    }
}

/// Execute every task in the plan under bounded concurrency: three queues
/// (large network, small network, local decode), range merging for small
/// remote payloads, per-task retries that progressively force `Direct`,
/// and a shared cancellation signal. Returns once every task has settled.
pub async fn run_plan(
    ctx: &InstallContext,
    cancel: &CancelHandle,
    plan: &InstallPlan,
    package: Option<Arc<SelfPackage>>,
    remote_url: Option<String>,
    install_dir: &Path,
    multipart_groups: bool,
) -> Result<RunOutcome> {
    let locked = plan.unwritable_files();
    if !locked.is_empty() {
        return Err(InstallerError::LockedFiles(locked));
    }
    if plan.is_empty() {
        return Ok(RunOutcome::default());
    }

    let threshold = large_threshold(
        plan.tasks
            .iter()
            .filter(|t| is_network(t))
            .map(|t| t.mode.transfer_size())
            .collect(),
    );

    // Only direct payloads and on-disk patch diffs may merge.
    let candidates: Vec<MergeCandidate> = plan
        .tasks
        .iter()
        .enumerate()
        .filter_map(|(task_index, task)| {
            task.mode.mergeable_span().map(|span| MergeCandidate {
                task_index,
                offset: span.offset,
                size: span.size,
            })
        })
        .collect();
    let merge_plan = merger::merge_ranges(candidates);
    let grouped: std::collections::HashSet<usize> = merge_plan
        .groups
        .iter()
        .flat_map(|g| g.files.iter().map(|f| f.task_index))
        .collect();

    let mut large_jobs = Vec::new();
    let mut small_jobs = Vec::new();
    let mut local_jobs = Vec::new();
    for (index, task) in plan.tasks.iter().enumerate() {
        if grouped.contains(&index) {
            continue;
        }
        let job = Job::Single(index);
        if !is_network(task) {
            local_jobs.push(job);
        } else if task.mode.transfer_size() >= threshold {
            large_jobs.push(job);
        } else {
            small_jobs.push(job);
        }
    }
    let merged_groups = merge_plan.groups.len();
    for group in merge_plan.groups {
        if group.total_download >= threshold {
            large_jobs.push(Job::Group(group));
        } else {
            small_jobs.push(Job::Group(group));
        }
    }

    // Interleave classes so no queue is starved at spawn time.
    let mut jobs = Vec::with_capacity(large_jobs.len() + small_jobs.len() + local_jobs.len());
    let mut sources = [
        (large_jobs.into_iter(), QueueClass::Large),
        (small_jobs.into_iter(), QueueClass::Small),
        (local_jobs.into_iter(), QueueClass::Local),
    ];
    loop {
        let mut any = false;
        for (iter, class) in sources.iter_mut() {
            if let Some(job) = iter.next() {
                jobs.push((job, *class));
                any = true;
            }
        }
        if !any {
            break;
        }
    }

    let shared = Arc::new(WorkerShared {
        ctx: ctx.clone(),
        cancel: cancel.clone(),
        package,
        remote_url,
        algorithm: plan.algorithm,
        install_dir: install_dir.to_path_buf(),
        tasks: Arc::new(plan.tasks.clone()),
        multipart_groups,
    });

    let large_sem = Arc::new(Semaphore::new(LARGE_SLOTS));
    let small_sem = Arc::new(Semaphore::new(SMALL_SLOTS));
    let local_sem = Arc::new(Semaphore::new(LOCAL_SLOTS));

    let mut set: JoinSet<std::result::Result<JobReport, InstallerError>> = JoinSet::new();
    for (job, class) in jobs {
        let shared = shared.clone();
        let semaphore = match class {
            QueueClass::Large => large_sem.clone(),
            QueueClass::Small => small_sem.clone(),
            QueueClass::Local => local_sem.clone(),
        };
        set.spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .map_err(|_| InstallerError::Cancelled)?;
            match job {
                Job::Single(index) => run_single(&shared, index).await,
                Job::Group(group) => run_group(&shared, group).await,
            }
        });
    }

    let mut outcome = RunOutcome {
        merged_groups,
        ..Default::default()
    };
    let mut first_error: Option<InstallerError> = None;
    while let Some(joined) = set.join_next().await {
        let result = joined
            .map_err(|err| InstallerError::Config(format!("worker died: {err}")))
            .and_then(|inner| inner);
        match result {
            Ok(report) => {
                outcome.installed += report.installed;
                outcome.forced_direct += report.forced_direct;
            }
            Err(err) => {
                let keep = match (&first_error, &err) {
                    (None, _) => true,
                    (Some(InstallerError::Cancelled), e)
                        if !matches!(e, InstallerError::Cancelled) =>
                    {
                        true
                    }
                    _ => false,
                };
                if keep {
                    first_error = Some(err);
                }
                // terminal task failure aborts the run
                shared.cancel.cancel();
            }
        }
    }
    match first_error {
        Some(err) => Err(err),
        None => Ok(outcome),
    }
}

#[derive(Default)]
struct JobReport {
    installed: usize,
    forced_direct: usize,
}

/// Retry loop for one task. From the second attempt on, `Local` and
/// `Patch` are disabled and the remote full payload is fetched instead.
async fn attempt_task(
    shared: &WorkerShared,
    index: usize,
    report: &mut JobReport,
    force_direct: bool,
) -> Result<()> {
    let task = &shared.tasks[index];
    let mut last_err = None;
    for attempt in 1..=MAX_ATTEMPTS {
        shared.ctx.check_cancelled()?;
        let (mode, demoted) = if attempt == 1 && !force_direct {
            (task.mode, false)
        } else {
            match task.direct_fallback {
                Some(blob) if !matches!(task.mode, InstallMode::Direct { .. }) => {
                    (InstallMode::Direct { blob }, true)
                }
                _ => (task.mode, false),
            }
        };
        match pipeline::run_task(&shared.env(), task, mode).await {
            Ok(()) => {
                if demoted {
                    report.forced_direct += 1;
                }
                report.installed += 1;
                return Ok(());
            }
            Err(InstallerError::Cancelled) => return Err(InstallerError::Cancelled),
            Err(err) => {
                tracing::warn!(
                    file = %task.target.file_name,
                    mode = mode.kind(),
                    attempt,
                    error = %err,
                    "task attempt failed"
                );
                // a terminal error only earns another attempt when a mode
                // demotion would change what we fetch
                let can_demote = task.direct_fallback.is_some()
                    && !matches!(mode, InstallMode::Direct { .. });
                if !err.is_retryable() && !can_demote && !force_direct {
                    return Err(err);
                }
                last_err = Some(err);
                if attempt < MAX_ATTEMPTS {
                    sleep(BACKOFF_BASE * 2u32.pow(attempt - 1)).await;
                }
            }
        }
    }
    Err(last_err.unwrap_or(InstallerError::Cancelled))
}

async fn run_single(shared: &WorkerShared, index: usize) -> Result<JobReport> {
    let mut report = JobReport::default();
    attempt_task(shared, index, &mut report, false).await?;
    Ok(report)
}

/// One merged request; members that fail inside the group re-queue as
/// individual direct downloads without disturbing their siblings.
async fn run_group(shared: &WorkerShared, group: merger::MergedGroup) -> Result<JobReport> {
    let mut report = JobReport::default();
    let results =
        pipeline::run_merged_group(&shared.env(), &shared.tasks, &group, shared.multipart_groups)
            .await;
    for (task_index, result) in results {
        match result {
            Ok(()) => report.installed += 1,
            Err(InstallerError::Cancelled) => return Err(InstallerError::Cancelled),
            Err(err) => {
                tracing::warn!(
                    file = %shared.tasks[task_index].target.file_name,
                    error = %err,
                    "merged member failed, retrying individually"
                );
                attempt_task(shared, task_index, &mut report, true).await?;
            }
        }
    }
    Ok(report)
}
