use crate::{
    branch::Branch,
    catalog::TargetApp,
    clock::Clock,
    config::Config,
    manifest::{LiveManifest, RemoteBranch},
    observer::Observer,
};
use anyhow::{Context, Result};
use serde::Serialize;
use std::{
    fs,
    path::{Path, PathBuf},
    time::SystemTime,
};
use time::OffsetDateTime;
use walkdir::WalkDir;

const SECONDS_PER_DAY: f64 = 86_400.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchStatus {
    UpToDate,
    UpdateAvailable,
    NotInstalled,
    Error,
}

impl BranchStatus {
    pub fn label(self) -> &'static str {
        match self {
            BranchStatus::UpToDate => "Up to date",
            BranchStatus::UpdateAvailable => "Update available",
            BranchStatus::NotInstalled => "Not installed",
            BranchStatus::Error => "Error",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BranchRecord {
    pub name: Branch,
    pub display_name: String,
    pub folder_path: PathBuf,
    pub executable_path: PathBuf,
    pub local_build_id: Option<String>,
    pub remote_build_id: Option<String>,
    pub status: BranchStatus,
    pub file_count: u64,
    pub directory_size: u64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_modified: Option<OffsetDateTime>,
    pub is_current_remote_branch: bool,
    pub error: Option<String>,
}

impl BranchRecord {
    fn new(branch: Branch, folder_path: PathBuf, executable_path: PathBuf) -> Self {
        Self {
            name: branch,
            display_name: branch.display_name().to_string(),
            folder_path,
            executable_path,
            local_build_id: None,
            remote_build_id: None,
            status: BranchStatus::NotInstalled,
            file_count: 0,
            directory_size: 0,
            last_modified: None,
            is_current_remote_branch: false,
            error: None,
        }
    }
}

/// Works out the health of each branch snapshot on demand. Nothing is cached.
pub struct BranchStatusEvaluator<'a> {
    target: TargetApp,
    clock: &'a dyn Clock,
}

impl<'a> BranchStatusEvaluator<'a> {
    pub fn new(target: TargetApp, clock: &'a dyn Clock) -> Self {
        Self { target, clock }
    }

    /// Evaluates `branch` against the manifest of the install at `source_install_path`.
    pub fn evaluate(
        &self,
        branch: Branch,
        config: &Config,
        source_install_path: &Path,
        observer: &dyn Observer,
    ) -> BranchRecord {
        match LiveManifest::for_install(source_install_path, self.target.app_id) {
            Some(live) => {
                live.warn_if_missing(observer);
                self.evaluate_with(branch, config, &live, observer)
            }
            None => {
                observer.warn(format!(
                    "{} is not inside a Steam library; live branch unknown",
                    source_install_path.display()
                ));
                self.evaluate_with(branch, config, &UnknownRemote, observer)
            }
        }
    }

    /// Every selected branch; one branch failing does not affect the others.
    pub fn evaluate_all(
        &self,
        config: &Config,
        remote: &dyn RemoteBranch,
        observer: &dyn Observer,
    ) -> Vec<BranchRecord> {
        config
            .selected_branches
            .iter()
            .map(|branch| self.evaluate_with(*branch, config, remote, observer))
            .collect()
    }

    pub fn evaluate_with(
        &self,
        branch: Branch,
        config: &Config,
        remote: &dyn RemoteBranch,
        observer: &dyn Observer,
    ) -> BranchRecord {
        let folder = config.branch_folder(branch);
        let executable = self.target.executable_in(&folder);
        let mut record = BranchRecord::new(branch, folder, executable);
        record.local_build_id = config.build_id(branch).map(str::to_string);

        match record.executable_path.try_exists() {
            Ok(true) => {}
            Ok(false) => return record,
            Err(err) => {
                record.status = BranchStatus::Error;
                record.error = Some(err.to_string());
                observer.error(format!("{branch}: cannot check executable: {err}"));
                return record;
            }
        }

        if let Err(err) = self.classify_installed(&mut record, remote) {
            record.status = BranchStatus::Error;
            record.error = Some(format!("{err:#}"));
            observer.error(format!("{branch}: status check failed: {err:#}"));
        }
        record
    }

    fn classify_installed(&self, record: &mut BranchRecord, remote: &dyn RemoteBranch) -> Result<()> {
        let current = remote.current_branch();
        record.is_current_remote_branch = current == Some(record.name);
        if record.is_current_remote_branch {
            record.remote_build_id = remote.current_build_id();
        }

        let modified = fs::metadata(&record.folder_path)
            .and_then(|meta| meta.modified())
            .with_context(|| format!("stat {}", record.folder_path.display()))?;
        let (file_count, directory_size) = folder_stats(&record.folder_path)?;
        record.file_count = file_count;
        record.directory_size = directory_size;
        record.last_modified = Some(OffsetDateTime::from(modified));

        let age_days = age_in_days(self.clock.now(), modified);
        record.status = classify(
            record.local_build_id.as_deref(),
            record.remote_build_id.as_deref(),
            record.is_current_remote_branch,
            age_days,
        );
        Ok(())
    }
}

/// Status of an installed branch.
///
/// Without a remote build id only the folder age is available. A known remote
/// id is compared against the locally recorded one.
pub fn classify(
    local_build_id: Option<&str>,
    remote_build_id: Option<&str>,
    is_current_remote_branch: bool,
    age_days: f64,
) -> BranchStatus {
    let Some(remote) = remote_build_id else {
        return match age_days {
            age if age < 0.25 => BranchStatus::UpToDate,
            age if age < 1.0 => BranchStatus::UpToDate,
            age if age < 7.0 => BranchStatus::UpdateAvailable,
            _ => BranchStatus::UpdateAvailable,
        };
    };

    let local = local_build_id.unwrap_or_default();
    if local.is_empty() {
        return if is_current_remote_branch && age_days < 1.0 {
            BranchStatus::UpToDate
        } else {
            BranchStatus::UpdateAvailable
        };
    }

    if local == remote && (is_current_remote_branch || age_days < 0.25) {
        BranchStatus::UpToDate
    } else {
        BranchStatus::UpdateAvailable
    }
}

fn age_in_days(now: SystemTime, modified: SystemTime) -> f64 {
    now.duration_since(modified)
        .map(|age| age.as_secs_f64() / SECONDS_PER_DAY)
        .unwrap_or(0.0)
}

fn folder_stats(folder: &Path) -> Result<(u64, u64)> {
    let mut count = 0;
    let mut size = 0;
    for entry in WalkDir::new(folder).follow_links(false) {
        let entry = entry.with_context(|| format!("walk {}", folder.display()))?;
        if entry.file_type().is_file() {
            count += 1;
            size += entry.metadata().map(|meta| meta.len()).unwrap_or(0);
        }
    }
    Ok((count, size))
}

struct UnknownRemote;

impl RemoteBranch for UnknownRemote {
    fn current_branch(&self) -> Option<Branch> {
        None
    }

    fn current_build_id(&self) -> Option<String> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        catalog::TARGET_APP,
        clock::testing::FakeClock,
        observer::{testing::RecordingObserver, LogLevel, NullObserver},
    };
    use filetime::{set_file_mtime, FileTime};
    use std::time::Duration;
    use tempfile::TempDir;

    struct FixedRemote {
        branch: Option<Branch>,
        build_id: Option<&'static str>,
    }

    impl RemoteBranch for FixedRemote {
        fn current_branch(&self) -> Option<Branch> {
            self.branch
        }

        fn current_build_id(&self) -> Option<String> {
            self.build_id.map(str::to_string)
        }
    }

    struct Fixture {
        _dir: TempDir,
        config: Config,
        start: SystemTime,
    }

    fn fixture(installed: &[Branch], age: Duration) -> Fixture {
        let dir = TempDir::new().unwrap();
        let mut config = Config {
            snapshot_root_path: dir.path().join("branches"),
            ..Config::default()
        };
        config.select_branches(Branch::ALL);
        let start = SystemTime::now();
        for branch in installed {
            let folder = config.branch_folder(*branch);
            fs::create_dir_all(folder.join("data")).unwrap();
            fs::write(TARGET_APP.executable_in(&folder), b"MZ").unwrap();
            fs::write(folder.join("data").join("level0"), b"0123456789").unwrap();
            set_file_mtime(&folder, FileTime::from_system_time(start - age)).unwrap();
        }
        Fixture {
            _dir: dir,
            config,
            start,
        }
    }

    const HOUR: Duration = Duration::from_secs(3600);

    #[test]
    fn missing_executable_is_not_installed_whatever_the_ids() {
        let mut fx = fixture(&[], HOUR);
        fx.config.set_build_id(Branch::BetaBranch, "42");
        let clock = FakeClock::new(fx.start);
        let evaluator = BranchStatusEvaluator::new(TARGET_APP, &clock);
        let remote = FixedRemote {
            branch: Some(Branch::BetaBranch),
            build_id: Some("42"),
        };
        let record = evaluator.evaluate_with(Branch::BetaBranch, &fx.config, &remote, &NullObserver);
        assert_eq!(record.status, BranchStatus::NotInstalled);
        assert!(!record.is_current_remote_branch);
    }

    #[test]
    fn current_branch_with_matching_build_is_up_to_date() {
        let mut fx = fixture(&[Branch::BetaBranch], 30 * 24 * HOUR);
        fx.config.set_build_id(Branch::BetaBranch, "42");
        let clock = FakeClock::new(fx.start);
        let evaluator = BranchStatusEvaluator::new(TARGET_APP, &clock);
        let remote = FixedRemote {
            branch: Some(Branch::BetaBranch),
            build_id: Some("42"),
        };
        let record = evaluator.evaluate_with(Branch::BetaBranch, &fx.config, &remote, &NullObserver);
        assert_eq!(record.status, BranchStatus::UpToDate);
        assert!(record.is_current_remote_branch);
        assert_eq!(record.remote_build_id.as_deref(), Some("42"));
        assert_eq!(record.file_count, 2);
        assert_eq!(record.directory_size, 12);
        assert!(record.last_modified.is_some());
    }

    #[test]
    fn differing_build_is_update_available_even_when_fresh() {
        let mut fx = fixture(&[Branch::BetaBranch], Duration::from_secs(5));
        fx.config.set_build_id(Branch::BetaBranch, "41");
        let clock = FakeClock::new(fx.start);
        let evaluator = BranchStatusEvaluator::new(TARGET_APP, &clock);
        let remote = FixedRemote {
            branch: Some(Branch::BetaBranch),
            build_id: Some("42"),
        };
        let record = evaluator.evaluate_with(Branch::BetaBranch, &fx.config, &remote, &NullObserver);
        assert_eq!(record.status, BranchStatus::UpdateAvailable);
    }

    #[test]
    fn non_current_branch_falls_back_to_folder_age() {
        let fx = fixture(&[Branch::MainBranch], 2 * HOUR);
        let clock = FakeClock::new(fx.start);
        let evaluator = BranchStatusEvaluator::new(TARGET_APP, &clock);
        let remote = FixedRemote {
            branch: Some(Branch::BetaBranch),
            build_id: Some("42"),
        };
        let record = evaluator.evaluate_with(Branch::MainBranch, &fx.config, &remote, &NullObserver);
        assert_eq!(record.remote_build_id, None);
        assert_eq!(record.status, BranchStatus::UpToDate);

        clock.advance(2 * 24 * HOUR);
        let record = evaluator.evaluate_with(Branch::MainBranch, &fx.config, &remote, &NullObserver);
        assert_eq!(record.status, BranchStatus::UpdateAvailable);
    }

    #[test]
    fn batch_reports_each_branch() {
        let fx = fixture(&[Branch::MainBranch, Branch::AlternateBranch], HOUR);
        let clock = FakeClock::new(fx.start);
        let evaluator = BranchStatusEvaluator::new(TARGET_APP, &clock);
        let remote = FixedRemote {
            branch: None,
            build_id: None,
        };
        let observer = RecordingObserver::default();
        let records = evaluator.evaluate_all(&fx.config, &remote, &observer);
        let statuses: Vec<BranchStatus> = records.iter().map(|record| record.status).collect();
        assert_eq!(
            statuses,
            vec![
                BranchStatus::UpToDate,
                BranchStatus::NotInstalled,
                BranchStatus::UpToDate,
                BranchStatus::NotInstalled,
            ]
        );
        assert!(observer.messages(LogLevel::Error).is_empty());
    }

    #[test]
    fn evaluate_reads_the_source_manifest() {
        let mut fx = fixture(&[Branch::AlternateBranch], 3 * 24 * HOUR);
        fx.config.set_build_id(Branch::AlternateBranch, "77");
        let library = fx._dir.path().join("steamapps");
        let install = library.join("common").join("Schedule I");
        fs::create_dir_all(&install).unwrap();
        fs::write(
            library.join("appmanifest_3164500.acf"),
            "\"AppState\"\n{\n\"buildid\" \"77\"\n\"UserConfig\"\n{\n\"BetaKey\" \"alternate\"\n}\n}\n",
        )
        .unwrap();

        let clock = FakeClock::new(fx.start);
        let evaluator = BranchStatusEvaluator::new(TARGET_APP, &clock);
        let record = evaluator.evaluate(Branch::AlternateBranch, &fx.config, &install, &NullObserver);
        assert!(record.is_current_remote_branch);
        assert_eq!(record.status, BranchStatus::UpToDate);
    }

    #[test]
    fn evaluate_warns_when_the_manifest_is_missing() {
        let fx = fixture(&[Branch::MainBranch], HOUR);
        let install = fx._dir.path().join("steamapps").join("common").join("Schedule I");
        let clock = FakeClock::new(fx.start);
        let evaluator = BranchStatusEvaluator::new(TARGET_APP, &clock);
        let observer = RecordingObserver::default();

        let record = evaluator.evaluate(Branch::MainBranch, &fx.config, &install, &observer);
        assert_eq!(record.status, BranchStatus::UpToDate);
        assert!(!record.is_current_remote_branch);
        let warnings = observer.messages(LogLevel::Warn);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("appmanifest_3164500.acf"));
    }

    #[test]
    fn classify_table() {
        use BranchStatus::*;
        assert_eq!(classify(None, None, false, 0.1), UpToDate);
        assert_eq!(classify(None, None, false, 0.5), UpToDate);
        assert_eq!(classify(None, None, false, 3.0), UpdateAvailable);
        assert_eq!(classify(None, None, false, 30.0), UpdateAvailable);
        assert_eq!(classify(None, Some("9"), true, 0.5), UpToDate);
        assert_eq!(classify(None, Some("9"), true, 1.5), UpdateAvailable);
        assert_eq!(classify(Some(""), Some("9"), false, 0.1), UpdateAvailable);
        assert_eq!(classify(Some("9"), Some("9"), false, 0.1), UpToDate);
        assert_eq!(classify(Some("9"), Some("9"), false, 0.5), UpdateAvailable);
        assert_eq!(classify(Some("8"), Some("9"), true, 0.0), UpdateAvailable);
    }
}
