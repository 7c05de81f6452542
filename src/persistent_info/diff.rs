//! A-vs-B digest diff with optional duplicate-removal actions (spec §4.8
//! "diff").

use std::collections::HashSet;
use std::path::PathBuf;

use super::PersistentInfoSink;
use crate::error::Result;

/// Action applied to every A-file whose digest was also found in B.
#[derive(Debug, Clone)]
pub enum DiffAction {
    RemoveDuplicates,
    MoveDuplicates(PathBuf),
}

/// Outcome of one `diff` invocation.
#[derive(Debug, Clone, Default)]
pub struct DiffReport {
    /// Paths (relative to A's root) whose digest is absent from B.
    pub a_only: Vec<PathBuf>,
    /// Paths (relative to A's root) whose digest was found in B and were
    /// acted on by `action`, if one was given.
    pub actioned: Vec<PathBuf>,
    pub errors: Vec<String>,
}

/// Computes A\B by content digest and optionally removes or relocates
/// every A-file whose digest exists in B.
pub fn diff(a: &dyn PersistentInfoSink, b: &dyn PersistentInfoSink, action: Option<DiffAction>) -> Result<DiffReport> {
    let a_records = a.load()?;
    let b_records = b.load()?;
    let b_digests: HashSet<&str> = b_records.values().map(|r| r.current.digest.as_str()).collect();

    let mut report = DiffReport::default();
    let mut touched = Vec::new();

    for (rel, info) in &a_records {
        if b_digests.contains(info.current.digest.as_str()) {
            match &action {
                Some(DiffAction::RemoveDuplicates) => match a.remove_data_file(rel) {
                    Ok(()) => {
                        report.actioned.push(rel.clone());
                        touched.push(rel.clone());
                    }
                    Err(e) => report.errors.push(format!("{}: {}", rel.display(), e)),
                },
                Some(DiffAction::MoveDuplicates(dest_root)) => match a.move_data_file(rel, dest_root) {
                    Ok(()) => {
                        report.actioned.push(rel.clone());
                        touched.push(rel.clone());
                    }
                    Err(e) => report.errors.push(format!("{}: {}", rel.display(), e)),
                },
                None => {}
            }
        } else {
            report.a_only.push(rel.clone());
        }
    }

    if !touched.is_empty() {
        let mut remaining = a_records;
        for rel in &touched {
            remaining.remove(rel);
        }
        a.save(&remaining)?;
        remove_emptied_dirs(a.root());
    }

    Ok(report)
}

/// Removes directories under `root` left empty by a move/remove action.
/// Best-effort: failures (e.g. `root` itself, or a directory that picked
/// up a new file concurrently) are silently skipped.
fn remove_emptied_dirs(root: &std::path::Path) {
    let mut dirs: Vec<_> = walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_dir())
        .map(|e| e.path().to_path_buf())
        .collect();
    dirs.sort_by_key(|p| std::cmp::Reverse(p.components().count()));
    for dir in dirs {
        if dir == root {
            continue;
        }
        let _ = std::fs::remove_dir(&dir);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistent_info::{update_digests, ChangeDetectionType, PerFileSink};

    #[test]
    fn identical_trees_report_zero_a_only() {
        let a_dir = tempfile::tempdir().unwrap();
        let b_dir = tempfile::tempdir().unwrap();
        std::fs::write(a_dir.path().join("x.txt"), b"same").unwrap();
        std::fs::write(b_dir.path().join("y.txt"), b"same").unwrap();

        let sink_a = PerFileSink::new(a_dir.path());
        let sink_b = PerFileSink::new(b_dir.path());
        update_digests(&sink_a, ChangeDetectionType::DateSize).unwrap();
        update_digests(&sink_b, ChangeDetectionType::DateSize).unwrap();

        let report = diff(&sink_a, &sink_b, None).unwrap();
        assert!(report.a_only.is_empty());
    }

    #[test]
    fn remove_duplicates_deletes_data_file_and_sidecar() {
        let a_dir = tempfile::tempdir().unwrap();
        let b_dir = tempfile::tempdir().unwrap();
        std::fs::write(a_dir.path().join("dup.txt"), b"shared").unwrap();
        std::fs::write(a_dir.path().join("unique.txt"), b"only in a").unwrap();
        std::fs::write(b_dir.path().join("dup.txt"), b"shared").unwrap();

        let sink_a = PerFileSink::new(a_dir.path());
        let sink_b = PerFileSink::new(b_dir.path());
        update_digests(&sink_a, ChangeDetectionType::DateSize).unwrap();
        update_digests(&sink_b, ChangeDetectionType::DateSize).unwrap();

        let report = diff(&sink_a, &sink_b, Some(DiffAction::RemoveDuplicates)).unwrap();
        assert_eq!(report.actioned.len(), 1);
        assert_eq!(report.a_only.len(), 1);
        assert!(!a_dir.path().join("dup.txt").exists());
        assert!(!a_dir.path().join("dup.txt.atbu").exists());
        assert!(a_dir.path().join("unique.txt").exists());
    }
}
