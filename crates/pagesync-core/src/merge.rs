//! Three-way line merge with explicit conflict surfacing.
//!
//! The merge walks an LCS-anchored diff3 over base/local/remote and either
//! produces clean content or brackets each divergent region in conflict
//! markers. It never fails for well-formed text: a fully divergent document
//! is simply a fully conflict-marked result.

use crate::normalize::normalize;
use serde::{Deserialize, Serialize};

pub const MARKER_LOCAL: &str = "<<<<<<< LOCAL";
pub const MARKER_SEPARATOR: &str = "=======";
pub const MARKER_REMOTE: &str = ">>>>>>> REMOTE";

/// One divergent region surfaced by the merge (or re-parsed from
/// marker-bearing text). Line numbers are 1-based positions of the
/// opening and closing markers in the containing document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictRegion {
    pub start_line: usize,
    pub end_line: usize,
    pub local_lines: Vec<String>,
    pub remote_lines: Vec<String>,
}

/// Result of a three-way merge.
#[derive(Debug, Clone)]
pub struct MergeOutcome {
    /// True when the merge completed without conflicts.
    pub success: bool,
    /// Merged content; contains conflict markers when `success` is false.
    pub content: String,
    pub conflict_count: usize,
    pub conflicts: Vec<ConflictRegion>,
}

impl MergeOutcome {
    fn clean(content: String) -> Self {
        Self {
            success: true,
            content,
            conflict_count: 0,
            conflicts: Vec::new(),
        }
    }
}

/// Which side of a conflict region to keep during resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictSide {
    Local,
    Remote,
}

/// Merge `local` and `remote` against their common ancestor `base`.
///
/// Fast paths: identical sides, only-remote-changed, only-local-changed.
/// Otherwise a line-level diff3 anchored on lines stable in all three
/// versions. Regions where exactly one side changed take that side's
/// lines; identical changes on both sides are applied once; genuinely
/// divergent regions are bracketed in conflict markers.
pub fn three_way_merge(base: &str, local: &str, remote: &str) -> MergeOutcome {
    let base = normalize(base);
    let local = normalize(local);
    let remote = normalize(remote);

    // Fast paths, in order
    if local == remote {
        return MergeOutcome::clean(local);
    }
    if local == base {
        return MergeOutcome::clean(remote);
    }
    if remote == base {
        return MergeOutcome::clean(local);
    }

    let base_lines: Vec<&str> = split_lines(&base);
    let local_lines: Vec<&str> = split_lines(&local);
    let remote_lines: Vec<&str> = split_lines(&remote);

    // Base positions matched by LCS against each side
    let local_match = lcs_pairs(&base_lines, &local_lines);
    let remote_match = lcs_pairs(&base_lines, &remote_lines);

    // Sync points: base lines stable in BOTH sides. Both pair lists are
    // strictly increasing in base index, so the intersection walk is linear.
    let mut anchors: Vec<(usize, usize, usize)> = Vec::new();
    {
        let mut ri = 0usize;
        for &(bi, li) in &local_match {
            while ri < remote_match.len() && remote_match[ri].0 < bi {
                ri += 1;
            }
            if ri < remote_match.len() && remote_match[ri].0 == bi {
                anchors.push((bi, li, remote_match[ri].1));
            }
        }
    }

    let mut out: Vec<String> = Vec::new();
    let mut conflicts: Vec<ConflictRegion> = Vec::new();

    // Cursor into each version; regions between anchors are reconciled,
    // anchor lines themselves are copied through.
    let (mut b, mut l, mut r) = (0usize, 0usize, 0usize);
    for &(ab, al, ar) in anchors.iter().chain(std::iter::once(&(
        base_lines.len(),
        local_lines.len(),
        remote_lines.len(),
    ))) {
        reconcile_region(
            &base_lines[b..ab],
            &local_lines[l..al],
            &remote_lines[r..ar],
            &mut out,
            &mut conflicts,
        );
        if ab < base_lines.len() {
            out.push(base_lines[ab].to_string());
        }
        b = ab + 1;
        l = al + 1;
        r = ar + 1;
    }

    let conflict_count = conflicts.len();
    let mut content = out.join("\n");
    content.push('\n');
    MergeOutcome {
        success: conflict_count == 0,
        content,
        conflict_count,
        conflicts,
    }
}

/// Reconcile one region between sync anchors.
fn reconcile_region(
    base: &[&str],
    local: &[&str],
    remote: &[&str],
    out: &mut Vec<String>,
    conflicts: &mut Vec<ConflictRegion>,
) {
    if local == remote {
        // Unchanged, or both sides made the identical change: apply once
        out.extend(local.iter().map(|s| s.to_string()));
        return;
    }
    if local == base {
        out.extend(remote.iter().map(|s| s.to_string()));
        return;
    }
    if remote == base {
        out.extend(local.iter().map(|s| s.to_string()));
        return;
    }

    // Both sides changed this region differently: conflict
    let start_line = out.len() + 1;
    out.push(MARKER_LOCAL.to_string());
    out.extend(local.iter().map(|s| s.to_string()));
    out.push(MARKER_SEPARATOR.to_string());
    out.extend(remote.iter().map(|s| s.to_string()));
    out.push(MARKER_REMOTE.to_string());
    conflicts.push(ConflictRegion {
        start_line,
        end_line: out.len(),
        local_lines: local.iter().map(|s| s.to_string()).collect(),
        remote_lines: remote.iter().map(|s| s.to_string()).collect(),
    });
}

/// Lines of normalized text, without the trailing empty segment.
fn split_lines(text: &str) -> Vec<&str> {
    let mut lines: Vec<&str> = text.split('\n').collect();
    if lines.last() == Some(&"") {
        lines.pop();
    }
    lines
}

/// Longest common subsequence as strictly increasing (a_index, b_index)
/// pairs. Standard O(n*m) dynamic program; documents are line-bounded so
/// this stays cheap in practice.
fn lcs_pairs(a: &[&str], b: &[&str]) -> Vec<(usize, usize)> {
    let (n, m) = (a.len(), b.len());
    let mut table = vec![0u32; (n + 1) * (m + 1)];
    let idx = |i: usize, j: usize| i * (m + 1) + j;

    for i in (0..n).rev() {
        for j in (0..m).rev() {
            table[idx(i, j)] = if a[i] == b[j] {
                table[idx(i + 1, j + 1)] + 1
            } else {
                table[idx(i + 1, j)].max(table[idx(i, j + 1)])
            };
        }
    }

    let mut pairs = Vec::new();
    let (mut i, mut j) = (0usize, 0usize);
    while i < n && j < m {
        if a[i] == b[j] {
            pairs.push((i, j));
            i += 1;
            j += 1;
        } else if table[idx(i + 1, j)] >= table[idx(i, j + 1)] {
            i += 1;
        } else {
            j += 1;
        }
    }
    pairs
}

/// True when the text carries all three conflict marker tokens.
pub fn has_conflict_markers(text: &str) -> bool {
    let mut seen = (false, false, false);
    for line in text.lines() {
        match line {
            MARKER_LOCAL => seen.0 = true,
            MARKER_SEPARATOR => seen.1 = true,
            MARKER_REMOTE => seen.2 = true,
            _ => {}
        }
    }
    seen.0 && seen.1 && seen.2
}

/// Re-extract conflict regions from marker-bearing text, independent of
/// how the markers were produced.
pub fn parse_conflict_markers(text: &str) -> Vec<ConflictRegion> {
    let mut regions = Vec::new();
    let mut current: Option<(usize, Vec<String>, Vec<String>, bool)> = None;

    for (i, line) in text.lines().enumerate() {
        let line_no = i + 1;
        match line {
            MARKER_LOCAL => {
                current = Some((line_no, Vec::new(), Vec::new(), false));
            }
            MARKER_SEPARATOR => {
                if let Some((_, _, _, in_remote)) = current.as_mut() {
                    *in_remote = true;
                }
            }
            MARKER_REMOTE => {
                if let Some((start, local_lines, remote_lines, _)) = current.take() {
                    regions.push(ConflictRegion {
                        start_line: start,
                        end_line: line_no,
                        local_lines,
                        remote_lines,
                    });
                }
            }
            _ => {
                if let Some((_, local_lines, remote_lines, in_remote)) = current.as_mut() {
                    if *in_remote {
                        remote_lines.push(line.to_string());
                    } else {
                        local_lines.push(line.to_string());
                    }
                }
            }
        }
    }
    regions
}

/// Replace each marked region with only the chosen side's lines,
/// preserving all non-conflicting content verbatim. Handles any number
/// of independent regions; no marker tokens survive.
pub fn resolve_conflicts(text: &str, side: ConflictSide) -> String {
    let mut out: Vec<&str> = Vec::new();
    let mut in_conflict = false;
    let mut in_remote = false;

    for line in text.lines() {
        match line {
            MARKER_LOCAL => {
                in_conflict = true;
                in_remote = false;
            }
            MARKER_SEPARATOR if in_conflict => {
                in_remote = true;
            }
            MARKER_REMOTE if in_conflict => {
                in_conflict = false;
                in_remote = false;
            }
            _ => {
                let keep = !in_conflict
                    || match side {
                        ConflictSide::Local => !in_remote,
                        ConflictSide::Remote => in_remote,
                    };
                if keep {
                    out.push(line);
                }
            }
        }
    }

    let mut result = out.join("\n");
    if text.ends_with('\n') || !result.is_empty() {
        result.push('\n');
    }
    result
}
