//! Filesystem scan: glob roots plus pipeline rules become an ordered candidate list.
//!
//! The scanner performs no mutation and is safe to call concurrently
//! with itself.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use glob::{MatchOptions, Pattern};
use tracing::warn;
use walkdir::WalkDir;

use crate::config::{Direction, PipelineConfig};

/// A file that passed glob and age filtering for a pipeline in the
/// current scan.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub path: PathBuf,
    pub pipeline_name: String,
    pub priority: i32,
    pub modified: SystemTime,
    pub direction: Direction,
}

/// Walk all pipeline globs, apply min/max age filters, and return a
/// deduplicated list sorted by ascending priority, then by mtime in
/// the owning pipeline's direction. The sort is stable, so ties keep
/// walk order.
pub fn scan_all(pipelines: &[PipelineConfig]) -> Vec<Candidate> {
    let now = SystemTime::now();
    let mut seen: HashSet<PathBuf> = HashSet::new();
    let mut candidates = Vec::new();

    for pipeline in pipelines {
        scan_pipeline(pipeline, now, &mut seen, &mut candidates);
    }

    candidates.sort_by(|a, b| {
        a.priority.cmp(&b.priority).then_with(|| match a.direction {
            Direction::Oldest => a.modified.cmp(&b.modified),
            Direction::Newest => b.modified.cmp(&a.modified),
        })
    });

    candidates
}

fn scan_pipeline(
    pipeline: &PipelineConfig,
    now: SystemTime,
    seen: &mut HashSet<PathBuf>,
    out: &mut Vec<Candidate>,
) {
    // `*` must not cross directory separators; `**` does.
    let options = MatchOptions {
        require_literal_separator: true,
        ..MatchOptions::default()
    };

    for raw_pattern in &pipeline.paths {
        let (root, rel_pattern) = split_pattern(raw_pattern);
        let pattern = match Pattern::new(&rel_pattern) {
            Ok(p) => p,
            Err(e) => {
                warn!(pipeline = %pipeline.name, pattern = %raw_pattern, error = %e, "invalid glob pattern, skipping");
                continue;
            }
        };

        for entry in WalkDir::new(&root).follow_links(false) {
            let entry = match entry {
                Ok(e) => e,
                // Unreadable entries and vanished roots are transient.
                Err(_) => continue,
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = match entry.path().strip_prefix(&root) {
                Ok(r) => r,
                Err(_) => continue,
            };
            if !pattern.matches_path_with(rel, options) {
                continue;
            }

            let abs_path = entry.path().to_path_buf();
            if seen.contains(&abs_path) {
                continue;
            }

            let modified = match entry.metadata().ok().and_then(|m| m.modified().ok()) {
                Some(m) => m,
                None => continue,
            };
            // Files with an mtime in the future count as age zero.
            let age = now.duration_since(modified).unwrap_or_default();

            if let Some(min_age) = &pipeline.min_age {
                if !min_age.is_zero() && age < min_age.as_duration() {
                    continue;
                }
            }
            if let Some(max_age) = &pipeline.max_age {
                if !max_age.is_zero() && age > max_age.as_duration() {
                    continue;
                }
            }

            seen.insert(abs_path.clone());
            out.push(Candidate {
                path: abs_path,
                pipeline_name: pipeline.name.clone(),
                priority: pipeline.priority,
                modified,
                direction: pipeline.direction,
            });
        }
    }
}

/// Separate an absolute glob like `/recordings/**/*.ts` into a walk
/// root (`/recordings`) and a relative pattern (`**/*.ts`). The root
/// is the directory containing the first glob metacharacter; the
/// recursive walker needs a real filesystem root plus a relative
/// pattern.
fn split_pattern(pattern: &str) -> (PathBuf, String) {
    let mut root = Path::new(pattern)
        .parent()
        .unwrap_or_else(|| Path::new("/"))
        .to_path_buf();

    while contains_glob(&root.to_string_lossy()) {
        match root.parent() {
            Some(parent) => root = parent.to_path_buf(),
            None => break,
        }
    }

    let rel = Path::new(pattern)
        .strip_prefix(&root)
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|_| pattern.to_string());

    (root, rel)
}

fn contains_glob(s: &str) -> bool {
    s.chars().any(|c| matches!(c, '*' | '?' | '[' | '{'))
}
