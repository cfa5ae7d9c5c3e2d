//! Capture file discovery.

use globset::{Glob, GlobSet, GlobSetBuilder};

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::{OpStatsError, OpStatsResult};

const CAPTURE_SUFFIX: &str = ".xspace.json";
const REPORT_SUFFIX: &str = ".op_stats.json";

/// Resolves plain paths, directories and glob patterns to capture files.
/// Plain file paths are accepted as-is; directories contribute every
/// `*.xspace.json` below them.
pub fn find_capture_files(patterns: &[String]) -> OpStatsResult<Vec<PathBuf>> {
    let mut out = BTreeSet::new();
    let mut globs = Vec::new();
    for pattern in patterns {
        let candidate = PathBuf::from(pattern);
        if !has_glob_meta(pattern) && candidate.is_file() {
            out.insert(candidate);
        } else if !has_glob_meta(pattern) && candidate.is_dir() {
            globs.push(format!("{}/**/*{CAPTURE_SUFFIX}", pattern.trim_end_matches('/')));
        } else {
            globs.push(pattern.clone());
        }
    }
    if globs.is_empty() {
        return Ok(out.into_iter().collect());
    }

    let set = compile_globset(&globs)?;
    for root in walk_roots(&globs) {
        for entry in WalkDir::new(&root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| !should_skip_dir(e.path()))
        {
            let entry = entry.map_err(|e| {
                let msg = e.to_string();
                OpStatsError::Io(e.into_io_error().unwrap_or_else(|| std::io::Error::other(msg)))
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let p = entry.path();
            let rel = p.strip_prefix(".").unwrap_or(p);
            if set.is_match(rel) || set.is_match(p) {
                out.insert(rel.to_path_buf());
            }
        }
    }
    Ok(out.into_iter().collect())
}

fn walk_roots(patterns: &[String]) -> BTreeSet<PathBuf> {
    let mut roots = BTreeSet::new();
    for pattern in patterns {
        let prefix = pattern
            .split(['*', '?', '[', ']', '{', '}'])
            .next()
            .unwrap_or_default()
            .trim_end_matches('/');
        if prefix.is_empty() {
            roots.insert(PathBuf::from("."));
            continue;
        }
        let p = PathBuf::from(prefix);
        if p.is_dir() {
            roots.insert(p);
        } else {
            match p.parent() {
                Some(parent) if !parent.as_os_str().is_empty() => {
                    roots.insert(parent.to_path_buf())
                }
                _ => roots.insert(PathBuf::from(".")),
            };
        }
    }
    roots
}

fn should_skip_dir(path: &Path) -> bool {
    path.file_name()
        .and_then(|s| s.to_str())
        .is_some_and(|name| matches!(name, ".git" | "target" | "node_modules"))
}

fn compile_globset(patterns: &[String]) -> OpStatsResult<GlobSet> {
    let mut b = GlobSetBuilder::new();
    for p in patterns {
        let g = Glob::new(p)
            .map_err(|e| OpStatsError::InvalidArgument(format!("invalid glob {p:?}: {e}")))?;
        b.add(g);
    }
    b.build()
        .map_err(|e| OpStatsError::InvalidArgument(format!("invalid globset: {e}")))
}

fn has_glob_meta(pattern: &str) -> bool {
    pattern.contains(['*', '?', '[', ']', '{', '}'])
}

/// `run.xspace.json` -> `run.op_stats.json`, next to the capture.
pub fn default_report_path(capture: &Path) -> PathBuf {
    let parent = capture
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let file_name = capture
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("capture");
    let stem = file_name
        .strip_suffix(CAPTURE_SUFFIX)
        .or_else(|| file_name.strip_suffix(".json"))
        .unwrap_or(file_name);
    parent.join(format!("{stem}{REPORT_SUFFIX}"))
}
