//! Range merger: fold many small payload fetches into fewer HTTP range
//! requests while keeping wasted bandwidth bounded.

/// Files above this size always download on their own connection.
pub const MERGE_MAX_FILE: u64 = 500 * 1024;
/// Hard cap on a merged request's span.
pub const MERGE_MAX_DOWNLOAD: u64 = 10 * 1024 * 1024;
/// Gap bytes may make up at most this share of a merged request.
pub const MERGE_MAX_WASTE: f64 = 0.20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeCandidate {
    /// Index of the owning task in the install plan; groups reference
    /// tasks, never the other way around.
    pub task_index: usize,
    pub offset: u64,
    pub size: u64,
}

#[derive(Debug, Clone)]
pub struct MergedGroup {
    pub files: Vec<MergeCandidate>,
    /// Absolute byte interval `[start, end)` of the single request.
    pub range: (u64, u64),
    pub total_download: u64,
    pub total_effective: u64,
    pub waste_ratio: f64,
    pub gaps: Vec<(u64, u64)>,
}

#[derive(Debug, Default)]
pub struct MergePlan {
    pub groups: Vec<MergedGroup>,
    /// Task indices left as individual requests.
    pub singles: Vec<usize>,
}

/// Greedy offset-order fold. A candidate joins the open group only while
/// the grown request stays under both the download cap and the waste
/// bound; groups that end up with a single member stay individual tasks.
pub fn merge_ranges(mut candidates: Vec<MergeCandidate>) -> MergePlan {
    let mut plan = MergePlan::default();
    candidates.retain(|candidate| {
        if candidate.size > MERGE_MAX_FILE {
            plan.singles.push(candidate.task_index);
            false
        } else {
            true
        }
    });
    candidates.sort_by_key(|candidate| candidate.offset);

    let mut open: Vec<MergeCandidate> = Vec::new();
    let mut close = |members: &mut Vec<MergeCandidate>, plan: &mut MergePlan| {
        if members.len() < 2 {
            plan.singles.extend(members.iter().map(|m| m.task_index));
        } else {
            plan.groups.push(build_group(members));
        }
        members.clear();
    };

    for candidate in candidates {
        if open.is_empty() {
            open.push(candidate);
            continue;
        }
        let start = open[0].offset;
        let end = open
            .iter()
            .map(|m| m.offset + m.size)
            .max()
            .unwrap_or(start)
            .max(candidate.offset + candidate.size);
        let download = end - start;
        let effective: u64 = open.iter().map(|m| m.size).sum::<u64>() + candidate.size;
        let waste = (download.saturating_sub(effective)) as f64 / download as f64;
        if download <= MERGE_MAX_DOWNLOAD && waste <= MERGE_MAX_WASTE {
            open.push(candidate);
        } else {
            close(&mut open, &mut plan);
            open.push(candidate);
        }
    }
    close(&mut open, &mut plan);
    plan
}

fn build_group(members: &[MergeCandidate]) -> MergedGroup {
    let start = members[0].offset;
    let end = members.iter().map(|m| m.offset + m.size).max().unwrap();
    let total_effective: u64 = members.iter().map(|m| m.size).sum();
    let total_download = end - start;
    let mut gaps = Vec::new();
    let mut cursor = start;
    for member in members {
        if member.offset > cursor {
            gaps.push((cursor, member.offset));
        }
        cursor = cursor.max(member.offset + member.size);
    }
    MergedGroup {
        files: members.to_vec(),
        range: (start, end),
        total_download,
        total_effective,
        waste_ratio: (total_download.saturating_sub(total_effective)) as f64
            / total_download as f64,
        gaps,
    }
}
