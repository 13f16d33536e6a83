use crate::observer::Observer;
use directories::BaseDirs;
use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
};

pub const STEAMAPPS_DIR: &str = "steamapps";
const LIBRARY_FOLDERS_FILE: &str = "libraryfolders.vdf";

/// Finds every Steam library (`.../steamapps`) on this machine.
#[derive(Debug, Clone)]
pub struct LibraryLocator {
    steam_roots: Vec<PathBuf>,
    system_drive: char,
}

impl LibraryLocator {
    pub fn new(steam_roots: Vec<PathBuf>) -> Self {
        Self {
            steam_roots,
            system_drive: system_drive_letter(),
        }
    }

    pub fn with_default_roots() -> Self {
        Self::new(default_steam_roots())
    }

    pub fn with_system_drive(mut self, drive: char) -> Self {
        self.system_drive = drive.to_ascii_uppercase();
        self
    }

    /// Library roots, system volume first, duplicates removed. Never fails.
    pub fn discover(&self, observer: &dyn Observer) -> Vec<PathBuf> {
        let mut candidates = Vec::new();

        for steam_root in &self.steam_roots {
            let default_library = steam_root.join(STEAMAPPS_DIR);
            if default_library.is_dir() {
                candidates.push(default_library.clone());
            }

            let descriptor = default_library.join(LIBRARY_FOLDERS_FILE);
            if !descriptor.exists() {
                continue;
            }
            let raw = match fs::read_to_string(&descriptor) {
                Ok(raw) => raw,
                Err(err) => {
                    observer.warn(format!(
                        "Could not read {}: {err}",
                        descriptor.display()
                    ));
                    continue;
                }
            };
            for path in parse_library_paths(&raw) {
                let library = path.join(STEAMAPPS_DIR);
                if library.is_dir() {
                    candidates.push(library);
                }
            }
        }

        let roots = self.order_roots(dedupe_roots(candidates));
        if roots.is_empty() {
            observer.warn("No Steam library folders found".to_string());
        }
        roots
    }

    /// Stable partition: roots on the system volume first, discovery order kept.
    pub fn order_roots(&self, roots: Vec<PathBuf>) -> Vec<PathBuf> {
        let (mut system, other): (Vec<PathBuf>, Vec<PathBuf>) = roots
            .into_iter()
            .partition(|root| self.is_on_system_volume(root));
        system.extend(other);
        system
    }

    pub fn is_on_system_volume(&self, path: &Path) -> bool {
        if let Some(drive) = drive_letter(path) {
            return drive == self.system_drive;
        }
        same_filesystem_as_root(path)
    }
}

/// `"path"  "<value>"` lines of a `libraryfolders.vdf`.
pub fn parse_library_paths(raw: &str) -> Vec<PathBuf> {
    let mut paths = Vec::new();

    for line in raw.lines() {
        let line = line.trim();
        if !line.contains("\"path\"") {
            continue;
        }

        let parts: Vec<&str> = line.split('"').collect();
        if parts.len() >= 4 && parts[1] == "path" && !parts[3].is_empty() {
            let path = parts[3].replace("\\\\", "\\");
            paths.push(PathBuf::from(path));
        }
    }

    paths
}

/// Drops repeats by normalized path, keeping the first spelling seen.
pub fn dedupe_roots(roots: Vec<PathBuf>) -> Vec<PathBuf> {
    let mut seen = HashSet::new();
    roots
        .into_iter()
        .filter(|root| seen.insert(normalize_key(root)))
        .collect()
}

/// Case-insensitive identity of a path with separators unified and no trailing slash.
pub fn normalize_key(path: &Path) -> String {
    let resolved = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    let raw = resolved.to_string_lossy().replace('\\', "/");
    let mut key = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if ch == '/' && key.ends_with('/') {
            continue;
        }
        key.push(ch.to_ascii_lowercase());
    }
    while key.len() > 1 && key.ends_with('/') {
        key.pop();
    }
    key
}

pub fn default_steam_roots() -> Vec<PathBuf> {
    let mut roots = Vec::new();

    if cfg!(windows) {
        roots.push(PathBuf::from(r"C:\Program Files (x86)\Steam"));
        roots.push(PathBuf::from(r"C:\Program Files\Steam"));
    }

    if let Some(base) = BaseDirs::new() {
        let home = base.home_dir();
        roots.push(home.join(".local/share/Steam"));
        roots.push(home.join(".steam/steam"));
        roots.push(home.join(".var/app/com.valvesoftware.Steam/.local/share/Steam"));
    }

    roots
}

fn drive_letter(path: &Path) -> Option<char> {
    let raw = path.to_string_lossy();
    let mut chars = raw.chars();
    let letter = chars.next()?;
    if letter.is_ascii_alphabetic() && chars.next() == Some(':') {
        Some(letter.to_ascii_uppercase())
    } else {
        None
    }
}

fn system_drive_letter() -> char {
    std::env::var("SystemDrive")
        .ok()
        .and_then(|value| value.chars().next())
        .filter(|letter| letter.is_ascii_alphabetic())
        .map(|letter| letter.to_ascii_uppercase())
        .unwrap_or('C')
}

#[cfg(unix)]
fn same_filesystem_as_root(path: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;

    match (fs::metadata(path), fs::metadata("/")) {
        (Ok(target), Ok(root)) => target.dev() == root.dev(),
        _ => false,
    }
}

#[cfg(not(unix))]
fn same_filesystem_as_root(_path: &Path) -> bool {
    false
}
