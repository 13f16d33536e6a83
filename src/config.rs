use crate::{branch::Branch, observer::Observer};
use anyhow::{Context, Result};
use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashSet},
    fs,
    path::{Path, PathBuf},
};
use time::OffsetDateTime;

pub const SCHEMA_VERSION: &str = "1";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub source_library_path: PathBuf,
    #[serde(default)]
    pub source_install_path: PathBuf,
    #[serde(default)]
    pub snapshot_root_path: PathBuf,
    #[serde(default = "default_selection")]
    pub selected_branches: Vec<Branch>,
    #[serde(default)]
    pub installed_branch: Option<Branch>,
    #[serde(default)]
    pub branch_build_ids: BTreeMap<Branch, String>,
    #[serde(with = "time::serde::rfc3339", default = "now_utc")]
    pub last_updated: OffsetDateTime,
    #[serde(default = "default_schema_version")]
    pub schema_version: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            source_library_path: PathBuf::new(),
            source_install_path: PathBuf::new(),
            snapshot_root_path: PathBuf::new(),
            selected_branches: default_selection(),
            installed_branch: None,
            branch_build_ids: BTreeMap::new(),
            last_updated: now_utc(),
            schema_version: default_schema_version(),
        }
    }
}

impl Config {
    pub fn branch_folder(&self, branch: Branch) -> PathBuf {
        self.snapshot_root_path.join(branch.folder_name())
    }

    /// Gives an empty snapshot root the default location and anchors a relative one.
    pub fn resolve_snapshot_root(&mut self) -> Result<()> {
        if self.snapshot_root_path.as_os_str().is_empty() {
            self.snapshot_root_path = default_snapshot_root()?;
        } else if self.snapshot_root_path.is_relative() {
            let cwd = std::env::current_dir().context("resolve working dir")?;
            self.snapshot_root_path = cwd.join(&self.snapshot_root_path);
        }
        Ok(())
    }

    pub fn build_id(&self, branch: Branch) -> Option<&str> {
        self.branch_build_ids
            .get(&branch)
            .map(|value| value.as_str())
            .filter(|value| !value.is_empty())
    }

    pub fn is_selected(&self, branch: Branch) -> bool {
        self.selected_branches.contains(&branch)
    }

    /// Replaces the selection; order is kept, repeats dropped.
    pub fn select_branches(&mut self, branches: impl IntoIterator<Item = Branch>) {
        self.selected_branches = branches.into_iter().collect();
        self.normalize();
        self.touch();
    }

    /// Ignored for branches that are not selected.
    pub fn set_build_id(&mut self, branch: Branch, build_id: &str) {
        if !self.is_selected(branch) {
            return;
        }
        self.branch_build_ids.insert(branch, build_id.to_string());
        self.touch();
    }

    pub fn set_installed_branch(&mut self, branch: Option<Branch>) {
        self.installed_branch = branch;
        self.touch();
    }

    pub fn touch(&mut self) {
        let now = now_utc();
        if now > self.last_updated {
            self.last_updated = now;
        }
    }

    fn normalize(&mut self) {
        let mut seen = HashSet::new();
        self.selected_branches.retain(|branch| seen.insert(*branch));
        let selected = self.selected_branches.clone();
        self.branch_build_ids
            .retain(|branch, _| selected.contains(branch));
    }
}

/// Whole-document store for [`Config`]. The location is decided by the caller.
#[derive(Debug, Clone)]
pub struct BranchRegistry {
    path: PathBuf,
}

impl BranchRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Missing or unreadable documents yield the default config.
    pub fn load(&self, observer: &dyn Observer) -> Config {
        if !self.path.exists() {
            return Config::default();
        }
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) => {
                observer.warn(format!(
                    "Could not read config {}: {err}; using defaults",
                    self.path.display()
                ));
                return Config::default();
            }
        };
        match serde_json::from_str::<Config>(&raw) {
            Ok(mut config) => {
                config.normalize();
                config
            }
            Err(err) => {
                observer.warn(format!(
                    "Could not parse config {}: {err}; using defaults",
                    self.path.display()
                ));
                Config::default()
            }
        }
    }

    /// Rewrites the whole document after refreshing `last_updated`.
    pub fn save(&self, config: &mut Config) -> Result<()> {
        config.normalize();
        config.touch();

        let parent = self.path.parent().context("config parent")?;
        fs::create_dir_all(parent).context("create config dir")?;
        let raw = serde_json::to_string_pretty(config).context("serialize config")?;
        let temp = self.path.with_extension("json.tmp");
        fs::write(&temp, raw).context("write config temp")?;
        fs::rename(&temp, &self.path).context("finalize config")?;
        Ok(())
    }
}

pub fn base_data_dir() -> Result<PathBuf> {
    let base = BaseDirs::new().context("resolve home dir")?;
    Ok(base.data_local_dir().join("branchsmith"))
}

pub fn default_config_path() -> Result<PathBuf> {
    Ok(base_data_dir()?.join("config.json"))
}

pub fn default_snapshot_root() -> Result<PathBuf> {
    Ok(base_data_dir()?.join("branches"))
}

fn default_selection() -> Vec<Branch> {
    vec![Branch::MainBranch]
}

fn default_schema_version() -> String {
    SCHEMA_VERSION.to_string()
}

fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc()
}
