use crate::{
    branch::Branch,
    clock::{CancelToken, Clock},
    config::Config,
    error::SyncError,
    manifest::RemoteBranch,
    observer::{Event, Observer},
    snapshot::{self, CopyProgress, CopyResult, ProgressFn},
};
use filetime::{set_file_mtime, FileTime};
use fs2::FileExt;
use std::{
    fmt,
    fs::{self, File, OpenOptions},
    path::{Path, PathBuf},
    time::Duration,
};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_SWITCH_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const LOCK_FILE_NAME: &str = ".branchsmith.lock";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    CopyingBranch { index: usize, branch: Branch },
    WaitingForSwitch { from: Option<Branch>, to: Branch },
    Completed,
    Aborted(String),
    TimedOut(Branch),
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncState::Idle => f.write_str("idle"),
            SyncState::CopyingBranch { index, branch } => {
                write!(f, "copying {branch} (#{})", index + 1)
            }
            SyncState::WaitingForSwitch { to, .. } => write!(f, "waiting for switch to {to}"),
            SyncState::Completed => f.write_str("completed"),
            SyncState::Aborted(reason) => write!(f, "aborted: {reason}"),
            SyncState::TimedOut(branch) => write!(f, "timed out waiting for {branch}"),
        }
    }
}

/// Copies one branch worth of files. Errors here abort the whole run.
pub trait BranchCopier: Send + Sync {
    fn copy_branch(
        &self,
        branch: Branch,
        source: &Path,
        dest: &Path,
        progress: &ProgressFn<'_>,
    ) -> anyhow::Result<CopyResult>;
}

pub struct TreeCopier;

impl BranchCopier for TreeCopier {
    fn copy_branch(
        &self,
        _branch: Branch,
        source: &Path,
        dest: &Path,
        progress: &ProgressFn<'_>,
    ) -> anyhow::Result<CopyResult> {
        snapshot::copy_tree(source, dest, Some(progress))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SyncOptions {
    pub poll_interval: Duration,
    pub switch_timeout: Duration,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            switch_timeout: DEFAULT_SWITCH_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub copied: Vec<(Branch, CopyResult)>,
    pub skipped: Vec<Branch>,
    pub wait_cycles: usize,
}

impl SyncReport {
    pub fn copied_branches(&self) -> Vec<Branch> {
        self.copied.iter().map(|(branch, _)| *branch).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Completed(SyncReport),
    Cancelled(SyncReport),
    TimedOut {
        branch: Branch,
        elapsed: Duration,
        budget: Duration,
        report: SyncReport,
    },
}

impl SyncOutcome {
    pub fn report(&self) -> &SyncReport {
        match self {
            SyncOutcome::Completed(report) | SyncOutcome::Cancelled(report) => report,
            SyncOutcome::TimedOut { report, .. } => report,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// `polls` counts queries made after a sleep; zero means it was already live.
    Switched { polls: usize },
    Cancelled { polls: usize },
    TimedOut { elapsed: Duration, polls: usize },
}

/// Exclusive advisory lock on a snapshot root, released on drop.
pub struct SnapshotLock {
    file: File,
    path: PathBuf,
}

impl SnapshotLock {
    pub fn acquire(root: &Path) -> Result<Self, SyncError> {
        let path = root.join(LOCK_FILE_NAME);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|source| SyncError::Lock {
                path: path.clone(),
                source,
            })?;
        if file.try_lock_exclusive().is_err() {
            return Err(SyncError::Busy {
                root: root.to_path_buf(),
            });
        }
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SnapshotLock {
    fn drop(&mut self) {
        // Closing the file releases the lock as well.
        let _ = self.file.unlock();
    }
}

/// Provisions every selected branch, pausing for the user to switch Steam
/// between branches.
pub struct SwitchOrchestrator<'a> {
    remote: &'a dyn RemoteBranch,
    copier: &'a dyn BranchCopier,
    clock: &'a dyn Clock,
    observer: &'a dyn Observer,
    cancel: CancelToken,
    options: SyncOptions,
    state: SyncState,
}

impl<'a> SwitchOrchestrator<'a> {
    pub fn new(
        remote: &'a dyn RemoteBranch,
        copier: &'a dyn BranchCopier,
        clock: &'a dyn Clock,
        observer: &'a dyn Observer,
    ) -> Self {
        Self {
            remote,
            copier,
            clock,
            observer,
            cancel: CancelToken::new(),
            options: SyncOptions::default(),
            state: SyncState::Idle,
        }
    }

    pub fn with_options(mut self, options: SyncOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> &SyncState {
        &self.state
    }

    pub fn run(&mut self, config: &mut Config) -> Result<SyncOutcome, SyncError> {
        let source = config.source_install_path.clone();
        if !source.is_dir() {
            return Err(SyncError::NoSourceInstall { path: source });
        }
        let root = config.snapshot_root_path.clone();
        fs::create_dir_all(&root).map_err(|source| SyncError::SnapshotRoot {
            path: root.clone(),
            source,
        })?;
        let _lock = SnapshotLock::acquire(&root)?;

        let branches = config.selected_branches.clone();
        let mut report = SyncReport::default();
        let mut requested: Option<Branch> = None;

        for (index, branch) in branches.iter().copied().enumerate() {
            if self.cancel.is_cancelled() {
                return Ok(self.cancelled(report));
            }
            self.set_state(SyncState::CopyingBranch { index, branch });

            let live = self.remote.current_branch();
            if live == Some(branch) && requested != Some(branch) {
                self.observer
                    .info(format!("{branch} is already live; skipping copy"));
                report.skipped.push(branch);
            } else {
                let result = self.copy_branch(branch, &source, &config.branch_folder(branch))?;
                if live == Some(branch) {
                    if let Some(build_id) = self.remote.current_build_id() {
                        config.set_build_id(branch, &build_id);
                    }
                }
                report.copied.push((branch, result));
            }

            let Some(next) = branches.get(index + 1).copied() else {
                continue;
            };
            self.set_state(SyncState::WaitingForSwitch {
                from: live,
                to: next,
            });
            match self.wait_for_switch(live, next) {
                WaitOutcome::Switched { polls } => {
                    if polls > 0 {
                        report.wait_cycles += 1;
                        requested = Some(next);
                    }
                    config.set_installed_branch(Some(next));
                }
                WaitOutcome::Cancelled { .. } => return Ok(self.cancelled(report)),
                WaitOutcome::TimedOut { elapsed, .. } => {
                    self.observer.warn(format!(
                        "Gave up waiting for {next} after {}s",
                        elapsed.as_secs()
                    ));
                    self.set_state(SyncState::TimedOut(next));
                    return Ok(SyncOutcome::TimedOut {
                        branch: next,
                        elapsed,
                        budget: self.options.switch_timeout,
                        report,
                    });
                }
            }
        }

        self.set_state(SyncState::Completed);
        Ok(SyncOutcome::Completed(report))
    }

    /// Polls the live branch until it becomes `to`.
    ///
    /// The timeout is measured from the first check; a sleep that would end
    /// past the budget is never started.
    pub fn wait_for_switch(&self, from: Option<Branch>, to: Branch) -> WaitOutcome {
        let start = self.clock.now();
        if self.remote.current_branch() == Some(to) {
            return WaitOutcome::Switched { polls: 0 };
        }

        self.observer.notify(Event::SwitchRequested { from, to });
        let interval = self.options.poll_interval;
        let budget = self.options.switch_timeout;
        let mut polls = 0;
        loop {
            if self.cancel.is_cancelled() {
                return WaitOutcome::Cancelled { polls };
            }
            let elapsed = self.clock.elapsed_since(start);
            if elapsed + interval > budget {
                return WaitOutcome::TimedOut { elapsed, polls };
            }
            self.clock.sleep(interval, &self.cancel);
            if self.cancel.is_cancelled() {
                return WaitOutcome::Cancelled { polls };
            }
            polls += 1;
            if self.remote.current_branch() == Some(to) {
                self.observer.info(format!("Steam switched to {to}"));
                return WaitOutcome::Switched { polls };
            }
        }
    }

    fn copy_branch(
        &mut self,
        branch: Branch,
        source: &Path,
        dest: &Path,
    ) -> Result<CopyResult, SyncError> {
        self.observer
            .info(format!("Copying {branch} into {}", dest.display()));
        let observer = self.observer;
        let progress = move |progress: CopyProgress| {
            observer.notify(Event::CopyProgress { branch, progress });
        };

        match self.copier.copy_branch(branch, source, dest, &progress) {
            Ok(result) => {
                self.stamp_folder(branch, dest);
                for failure in &result.failures {
                    self.observer.warn(format!(
                        "{branch}: could not copy {}: {}",
                        failure.relative_path.display(),
                        failure.reason
                    ));
                }
                self.observer.info(format!(
                    "{branch}: copied {} file(s), {} failed",
                    result.copied_count, result.failed_count
                ));
                Ok(result)
            }
            Err(err) => {
                self.observer
                    .error(format!("{branch}: copy failed: {err:#}"));
                self.set_state(SyncState::Aborted(format!("copy of {branch} failed")));
                Err(SyncError::BranchCopy {
                    branch,
                    source: err.into(),
                })
            }
        }
    }

    /// Copied files keep their source mtimes, so the folder itself marks the sync time.
    fn stamp_folder(&self, branch: Branch, dest: &Path) {
        if !dest.is_dir() {
            return;
        }
        let stamp = FileTime::from_system_time(self.clock.now());
        if let Err(err) = set_file_mtime(dest, stamp) {
            self.observer.warn(format!(
                "{branch}: could not update modified time of {}: {err}",
                dest.display()
            ));
        }
    }

    fn cancelled(&mut self, report: SyncReport) -> SyncOutcome {
        self.observer.warn("Sync cancelled".to_string());
        self.set_state(SyncState::Aborted("cancelled".to_string()));
        SyncOutcome::Cancelled(report)
    }

    fn set_state(&mut self, state: SyncState) {
        self.state = state.clone();
        self.observer.notify(Event::StateChanged(state));
    }
}
