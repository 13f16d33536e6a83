use anyhow::{bail, Context, Result};
use filetime::{set_file_mtime, FileTime};
use std::{
    fs,
    path::{Path, PathBuf},
};
use walkdir::WalkDir;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyProgress {
    /// Files processed so far, failed ones included.
    pub current: usize,
    pub total: usize,
}

impl CopyProgress {
    pub fn percent(&self) -> u8 {
        if self.total == 0 {
            return 100;
        }
        let current = self.current.min(self.total);
        ((current * 100) / self.total) as u8
    }
}

/// Invoked from whichever thread runs the copy.
pub type ProgressFn<'a> = dyn Fn(CopyProgress) + Send + Sync + 'a;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyFailure {
    pub relative_path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CopyResult {
    pub copied_count: usize,
    pub failed_count: usize,
    pub failures: Vec<CopyFailure>,
}

impl CopyResult {
    fn fail(&mut self, relative_path: PathBuf, reason: String) {
        self.failed_count += 1;
        self.failures.push(CopyFailure {
            relative_path,
            reason,
        });
    }
}

/// Copies every file under `source_root` into `dest_root`, overwriting.
///
/// Individual file failures are recorded in the result and the walk carries
/// on. Only problems with the roots themselves are returned as errors.
pub fn copy_tree(
    source_root: &Path,
    dest_root: &Path,
    progress: Option<&ProgressFn<'_>>,
) -> Result<CopyResult> {
    if !source_root.is_dir() {
        bail!("source {} is not a directory", source_root.display());
    }
    fs::create_dir_all(dest_root)
        .with_context(|| format!("create snapshot dir {}", dest_root.display()))?;

    let mut result = CopyResult::default();
    let mut files = Vec::new();
    for entry in WalkDir::new(source_root)
        .follow_links(false)
        .sort_by_file_name()
    {
        match entry {
            Ok(entry) if entry.file_type().is_file() => files.push(entry.into_path()),
            Ok(_) => {}
            Err(err) => {
                let relative = err
                    .path()
                    .and_then(|path| path.strip_prefix(source_root).ok())
                    .map(Path::to_path_buf)
                    .unwrap_or_default();
                result.fail(relative, err.to_string());
            }
        }
    }

    let total = files.len();
    for (index, source) in files.iter().enumerate() {
        let relative = source
            .strip_prefix(source_root)
            .unwrap_or(source.as_path())
            .to_path_buf();
        match copy_file(source, &dest_root.join(&relative)) {
            Ok(()) => result.copied_count += 1,
            Err(err) => result.fail(relative, format!("{err:#}")),
        }
        if let Some(callback) = progress {
            callback(CopyProgress {
                current: index + 1,
                total,
            });
        }
    }

    Ok(result)
}

fn copy_file(source: &Path, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).context("create parent dir")?;
    }
    fs::copy(source, dest).context("copy file")?;
    if let Ok(meta) = fs::metadata(source) {
        // Best effort; the content is already in place.
        let _ = set_file_mtime(dest, FileTime::from_last_modification_time(&meta));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    const TREE: [&str; 12] = [
        "Schedule I.exe",
        "UnityPlayer.dll",
        "data/globalgamemanagers",
        "data/level0",
        "data/level1",
        "data/resources.assets",
        "data/managed/Assembly-CSharp.dll",
        "data/managed/UnityEngine.dll",
        "data/streaming/audio.bank",
        "data/streaming/music.bank",
        "mods/readme.txt",
        "version.txt",
    ];

    fn build_tree(root: &Path) {
        for (index, relative) in TREE.iter().enumerate() {
            let path = root.join(relative);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, format!("file {index}")).unwrap();
        }
    }

    #[test]
    fn copies_whole_tree_with_progress() {
        let source = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();
        build_tree(source.path());

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let callback: Arc<ProgressFn<'static>> = Arc::new(move |progress: CopyProgress| {
            sink.lock().unwrap().push(progress);
        });
        let target = dest.path().join("beta-branch");
        let result = copy_tree(source.path(), &target, Some(callback.as_ref())).unwrap();

        assert_eq!(result.copied_count, 12);
        assert_eq!(result.failed_count, 0);
        assert_eq!(
            fs::read_to_string(target.join("data/managed/UnityEngine.dll")).unwrap(),
            "file 7"
        );
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 12);
        assert_eq!(seen.last().copied(), Some(CopyProgress { current: 12, total: 12 }));
        assert_eq!(seen[2].percent(), 25);
    }

    #[test]
    fn per_file_failures_do_not_stop_the_walk() {
        let source = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();
        build_tree(source.path());

        // A directory sitting where a file should land makes that copy fail.
        let blocked = [TREE[3], TREE[8]];
        for relative in blocked {
            let path = dest.path().join(relative);
            fs::create_dir_all(path.join("occupied")).unwrap();
        }

        let result = copy_tree(source.path(), dest.path(), None).unwrap();
        assert_eq!(result.copied_count, 10);
        assert_eq!(result.failed_count, 2);
        let failed: Vec<PathBuf> = result
            .failures
            .iter()
            .map(|failure| failure.relative_path.clone())
            .collect();
        assert_eq!(failed, vec![PathBuf::from(TREE[3]), PathBuf::from(TREE[8])]);
        assert!(dest.path().join(TREE[11]).is_file());
    }

    #[test]
    fn source_file_vanishing_mid_walk_is_recorded() {
        let source = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();
        build_tree(source.path());

        let doomed = source.path().join(TREE[3]);
        let callback: Arc<ProgressFn<'static>> = Arc::new(move |progress: CopyProgress| {
            if progress.current == 1 {
                fs::remove_file(&doomed).unwrap();
            }
        });
        let result = copy_tree(source.path(), dest.path(), Some(callback.as_ref())).unwrap();

        assert_eq!(result.copied_count, 11);
        assert_eq!(result.failed_count, 1);
        assert_eq!(result.failures[0].relative_path, PathBuf::from(TREE[3]));
        assert!(!dest.path().join(TREE[3]).exists());
    }

    #[cfg(unix)]
    #[test]
    fn unreadable_source_entries_are_recorded() {
        use std::os::unix::fs::PermissionsExt;

        let source = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();
        build_tree(source.path());

        let locked_file = source.path().join(TREE[3]);
        let locked_dir = source.path().join("data/streaming");
        fs::set_permissions(&locked_file, fs::Permissions::from_mode(0o000)).unwrap();
        fs::set_permissions(&locked_dir, fs::Permissions::from_mode(0o000)).unwrap();
        let unlock = || {
            fs::set_permissions(&locked_file, fs::Permissions::from_mode(0o644)).unwrap();
            fs::set_permissions(&locked_dir, fs::Permissions::from_mode(0o755)).unwrap();
        };
        if fs::read(&locked_file).is_ok() {
            // Privileged users read through the mode bits.
            unlock();
            return;
        }

        let result = copy_tree(source.path(), dest.path(), None);
        unlock();
        let result = result.unwrap();

        assert_eq!(result.copied_count, 9);
        assert_eq!(result.failed_count, 2);
        let failed: Vec<PathBuf> = result
            .failures
            .iter()
            .map(|failure| failure.relative_path.clone())
            .collect();
        assert_eq!(
            failed,
            vec![PathBuf::from("data/streaming"), PathBuf::from(TREE[3])]
        );
    }

    #[test]
    fn overwrites_existing_files() {
        let source = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();
        build_tree(source.path());
        fs::write(dest.path().join("version.txt"), "stale").unwrap();

        copy_tree(source.path(), dest.path(), None).unwrap();
        assert_eq!(
            fs::read_to_string(dest.path().join("version.txt")).unwrap(),
            "file 11"
        );
    }

    #[test]
    fn missing_source_is_an_error() {
        let dest = TempDir::new().unwrap();
        let missing = dest.path().join("missing");
        assert!(copy_tree(&missing, dest.path(), None).is_err());
    }

    #[test]
    fn percent_floors() {
        assert_eq!(CopyProgress { current: 1, total: 3 }.percent(), 33);
        assert_eq!(CopyProgress { current: 2, total: 3 }.percent(), 66);
        assert_eq!(CopyProgress { current: 0, total: 0 }.percent(), 100);
    }
}
