//! Where a fileset's files come from
//!
//! Every source is resolved against the stage root: relative inputs are
//! joined onto it, and each file's `RelPath` is its location below it.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use stow_core::{RelPath, StowError, StowResult};
use tracing::{debug, warn};

use crate::index::FileEntry;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileSource {
    /// Every file below a directory, recursively
    Directory(PathBuf),
    /// An explicit list of files
    Files(Vec<PathBuf>),
    /// Files matching a glob pattern such as `four/five/six/*.dat`
    Glob(String),
}

impl From<PathBuf> for FileSource {
    fn from(dir: PathBuf) -> Self {
        FileSource::Directory(dir)
    }
}

impl From<&Path> for FileSource {
    fn from(dir: &Path) -> Self {
        FileSource::Directory(dir.to_path_buf())
    }
}

impl From<Vec<PathBuf>> for FileSource {
    fn from(files: Vec<PathBuf>) -> Self {
        FileSource::Files(files)
    }
}

/// Resolve a source to `(relative path, absolute path)` pairs, sorted by
/// relative path. Exclude patterns are matched against file and directory
/// names during walks and glob expansion; explicitly listed files are
/// always taken.
pub fn collect_paths(
    source: &FileSource,
    stage: &Path,
    exclude_patterns: &[String],
) -> StowResult<Vec<(RelPath, PathBuf)>> {
    let excludes = compile_excludes(exclude_patterns);

    let files = match source {
        FileSource::Directory(dir) => {
            let root = under_stage(stage, dir);
            let mut out = Vec::new();
            walk(&root, &mut out, &excludes)?;
            out
        }
        FileSource::Files(paths) => {
            let mut out = Vec::with_capacity(paths.len());
            for p in paths {
                let path = under_stage(stage, p);
                let meta = std::fs::metadata(&path)?;
                if !meta.is_file() {
                    return Err(StowError::conflict(format!("{} is not a file", path.display())));
                }
                out.push(path);
            }
            out
        }
        FileSource::Glob(pattern) => {
            let full = if Path::new(pattern).is_absolute() {
                pattern.clone()
            } else {
                stage.join(pattern).to_string_lossy().into_owned()
            };
            let paths = glob::glob(&full)
                .map_err(|e| StowError::conflict(format!("invalid glob '{pattern}': {e}")))?;
            let mut out = Vec::new();
            for entry in paths {
                let path = entry.map_err(std::io::Error::from)?;
                if !path.is_file() || is_excluded(&path, &excludes) {
                    continue;
                }
                out.push(path);
            }
            out
        }
    };

    let mut by_rel = BTreeMap::new();
    for path in files {
        let rel = RelPath::from_path(stage, &path)?;
        if let Some(previous) = by_rel.insert(rel.clone(), path) {
            return Err(StowError::conflict(format!(
                "{} and another input both map to {rel}",
                previous.display()
            )));
        }
    }
    debug!(files = by_rel.len(), stage = %stage.display(), "collected source files");
    Ok(by_rel.into_iter().collect())
}

/// Collect the source and read every file into memory.
pub async fn read_entries(
    source: &FileSource,
    stage: &Path,
    exclude_patterns: &[String],
) -> StowResult<Vec<FileEntry>> {
    let (source_owned, stage_owned, excludes) =
        (source.clone(), stage.to_path_buf(), exclude_patterns.to_vec());
    let paths = tokio::task::spawn_blocking(move || collect_paths(&source_owned, &stage_owned, &excludes))
        .await
        .map_err(|e| StowError::Other(e.into()))??;

    let mut entries = Vec::with_capacity(paths.len());
    for (rel, path) in paths {
        let data = tokio::fs::read(&path).await?;
        entries.push(FileEntry::new(rel, data));
    }
    Ok(entries)
}

fn under_stage(stage: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        stage.join(path)
    }
}

fn compile_excludes(patterns: &[String]) -> Vec<glob::Pattern> {
    patterns
        .iter()
        .filter_map(|p| match glob::Pattern::new(p) {
            Ok(pattern) => Some(pattern),
            Err(e) => {
                warn!(pattern = %p, "ignoring invalid exclude pattern: {e}");
                None
            }
        })
        .collect()
}

fn is_excluded(path: &Path, excludes: &[glob::Pattern]) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|name| excludes.iter().any(|p| p.matches(name)))
}

fn walk(dir: &Path, out: &mut Vec<PathBuf>, excludes: &[glob::Pattern]) -> StowResult<()> {
    let mut entries = std::fs::read_dir(dir)?.collect::<Result<Vec<_>, _>>()?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let path = entry.path();
        if is_excluded(&path, excludes) {
            continue;
        }
        // symlinks are neither followed nor stored
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            walk(&path, out, excludes)?;
        } else if file_type.is_file() {
            out.push(path);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn stage() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let deep = dir.path().join("four/five/six");
        fs::create_dir_all(&deep).unwrap();
        for i in 0..3 {
            fs::write(deep.join(format!("f{i}.dat")), format!("data {i}")).unwrap();
        }
        fs::write(deep.join("notes.tmp"), "scratch").unwrap();
        fs::create_dir_all(dir.path().join("four/empty")).unwrap();
        dir
    }

    fn rels(found: &[(RelPath, PathBuf)]) -> Vec<&str> {
        found.iter().map(|(r, _)| r.as_str()).collect()
    }

    #[test]
    fn directory_walk_is_recursive_sorted_and_skips_dirs() {
        let stage = stage();
        let found = collect_paths(&FileSource::Directory("four".into()), stage.path(), &[]).unwrap();
        assert_eq!(
            rels(&found),
            vec![
                "four/five/six/f0.dat",
                "four/five/six/f1.dat",
                "four/five/six/f2.dat",
                "four/five/six/notes.tmp",
            ]
        );
    }

    #[test]
    fn exclude_patterns_match_file_names() {
        let stage = stage();
        let found = collect_paths(
            &FileSource::Directory(stage.path().to_path_buf()),
            stage.path(),
            &["*.tmp".to_string()],
        )
        .unwrap();
        assert_eq!(found.len(), 3);
        assert!(found.iter().all(|(r, _)| r.as_str().ends_with(".dat")));
    }

    #[test]
    fn glob_is_resolved_against_stage() {
        let stage = stage();
        let found = collect_paths(&FileSource::Glob("four/five/six/f*.dat".into()), stage.path(), &[]).unwrap();
        assert_eq!(found.len(), 3);
        assert_eq!(found[0].1, stage.path().join("four/five/six/f0.dat"));
    }

    #[test]
    fn explicit_files_and_duplicates() {
        let stage = stage();
        let one = PathBuf::from("four/five/six/f1.dat");
        let found = collect_paths(&FileSource::Files(vec![one.clone()]), stage.path(), &[]).unwrap();
        assert_eq!(rels(&found), vec!["four/five/six/f1.dat"]);

        let absolute = stage.path().join(&one);
        let err = collect_paths(&FileSource::Files(vec![one, absolute]), stage.path(), &[]).unwrap_err();
        assert!(matches!(err, StowError::Conflict(_)));
    }

    #[test]
    fn file_outside_stage_is_rejected() {
        let stage = stage();
        let elsewhere = tempfile::tempdir().unwrap();
        let outside = elsewhere.path().join("x.dat");
        fs::write(&outside, "x").unwrap();
        let err = collect_paths(&FileSource::Files(vec![outside]), stage.path(), &[]).unwrap_err();
        assert!(matches!(err, StowError::Conflict(_)));
    }

    #[test]
    fn missing_file_is_io_not_found() {
        let stage = stage();
        let err = collect_paths(&FileSource::Files(vec!["nope.dat".into()]), stage.path(), &[]).unwrap_err();
        assert!(matches!(err, StowError::Io(ref e) if e.kind() == std::io::ErrorKind::NotFound));
    }

    #[tokio::test]
    async fn read_entries_loads_contents() {
        let stage = stage();
        let entries = read_entries(&FileSource::Glob("four/**/f2.dat".into()), stage.path(), &[])
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(&entries[0].data[..], b"data 2");
    }
}
