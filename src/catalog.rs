use crate::{
    manifest::{self, AppManifest},
    observer::Observer,
};
use std::{
    fs,
    path::{Path, PathBuf},
};

/// The game whose branches are being tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetApp {
    pub app_id: &'static str,
    pub names: [&'static str; 2],
    pub executable: &'static str,
}

pub const TARGET_APP: TargetApp = TargetApp {
    app_id: "3164500",
    names: ["Schedule I", "Schedule 1"],
    executable: "Schedule I.exe",
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledApp {
    pub app_id: String,
    pub name: String,
    pub install_path: PathBuf,
    pub library_root: PathBuf,
    pub manifest_path: PathBuf,
}

impl InstalledApp {
    fn from_manifest(library_root: &Path, manifest_path: PathBuf, manifest: AppManifest) -> Self {
        Self {
            install_path: library_root.join("common").join(&manifest.install_dir),
            library_root: library_root.to_path_buf(),
            app_id: manifest.app_id,
            name: manifest.name,
            manifest_path,
        }
    }
}

impl TargetApp {
    /// Matches by app id, or by either known store name so renames still resolve.
    pub fn matches(&self, app: &InstalledApp) -> bool {
        if app.app_id == self.app_id {
            return true;
        }
        let name = app.name.to_ascii_lowercase();
        self.names
            .iter()
            .any(|known| name.contains(&known.to_ascii_lowercase()))
    }

    pub fn executable_in(&self, folder: &Path) -> PathBuf {
        folder.join(self.executable)
    }
}

/// Every app with a readable `appmanifest_*.acf` under `library_root`.
pub fn list_apps(library_root: &Path, observer: &dyn Observer) -> Vec<InstalledApp> {
    let entries = match fs::read_dir(library_root) {
        Ok(entries) => entries,
        Err(err) => {
            observer.warn(format!(
                "Could not list library {}: {err}",
                library_root.display()
            ));
            return Vec::new();
        }
    };

    let mut manifests: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| is_app_manifest(path))
        .collect();
    manifests.sort();

    let mut apps = Vec::new();
    for path in manifests {
        match manifest::read_app_manifest(&path) {
            Some(manifest) => apps.push(InstalledApp::from_manifest(library_root, path, manifest)),
            None => observer.warn(format!("Skipping unreadable manifest {}", path.display())),
        }
    }
    apps
}

/// First library, in the given order, that has the target installed.
pub fn find_target_across_roots(
    target: &TargetApp,
    roots: &[PathBuf],
    observer: &dyn Observer,
) -> Option<InstalledApp> {
    for root in roots {
        if let Some(app) = list_apps(root, observer)
            .into_iter()
            .find(|app| target.matches(app))
        {
            observer.info(format!(
                "Found {} ({}) in {}",
                app.name,
                app.app_id,
                root.display()
            ));
            return Some(app);
        }
    }
    None
}

fn is_app_manifest(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
        return false;
    };
    name.starts_with("appmanifest_") && name.ends_with(".acf") && path.is_file()
}
