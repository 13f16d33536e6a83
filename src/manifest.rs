use crate::{branch::Branch, observer::Observer};
use regex::Regex;
use std::{
    fs,
    path::{Path, PathBuf},
    sync::OnceLock,
};

/// Fields of an `appmanifest_<id>.acf` that the catalog cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppManifest {
    pub app_id: String,
    pub name: String,
    pub install_dir: String,
    pub build_id: Option<String>,
    pub branch: Option<Branch>,
}

/// Which branch the live install is on right now, and its build.
pub trait RemoteBranch: Send + Sync {
    fn current_branch(&self) -> Option<Branch>;
    fn current_build_id(&self) -> Option<String>;
}

/// The live install's manifest, queried fresh on every call.
#[derive(Debug, Clone)]
pub struct LiveManifest {
    path: PathBuf,
}

impl LiveManifest {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Manifest for an install living at `<libraryRoot>/common/<installdir>`.
    pub fn for_install(install_path: &Path, app_id: &str) -> Option<Self> {
        manifest_path_for_install(install_path, app_id).map(Self::new)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Warns when the manifest is absent; the live branch is unknown until it appears.
    pub fn warn_if_missing(&self, observer: &dyn Observer) -> bool {
        if self.path.is_file() {
            return false;
        }
        observer.warn(format!(
            "Steam manifest {} not found; live branch unknown",
            self.path.display()
        ));
        true
    }
}

impl RemoteBranch for LiveManifest {
    fn current_branch(&self) -> Option<Branch> {
        let raw = fs::read_to_string(&self.path).ok()?;
        extract_branch(&raw)
    }

    fn current_build_id(&self) -> Option<String> {
        let raw = fs::read_to_string(&self.path).ok()?;
        extract_build_id(&raw)
    }
}

pub fn manifest_file_name(app_id: &str) -> String {
    format!("appmanifest_{app_id}.acf")
}

pub fn manifest_path_for_install(install_path: &Path, app_id: &str) -> Option<PathBuf> {
    let common = install_path.parent()?;
    let library_root = common.parent()?;
    Some(library_root.join(manifest_file_name(app_id)))
}

/// Branch recorded in the `UserConfig` block.
///
/// A missing `UserConfig` block or a block without `BetaKey` means the default
/// branch. `None` is only returned when the block is present but its braces
/// never balance.
pub fn extract_branch(text: &str) -> Option<Branch> {
    let Some(start) = find_key(text, "UserConfig") else {
        return Some(Branch::MainBranch);
    };
    let block = balanced_block(&text[start..])?;
    let beta_key = match_value(block, beta_key_pattern()).unwrap_or_default();
    Some(Branch::from_beta_key(&beta_key))
}

/// First `BuildID` value anywhere in the manifest. Empty values count as absent.
pub fn extract_build_id(text: &str) -> Option<String> {
    let value = match_value(text, build_id_pattern())?;
    let value = value.trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// Line scanner for the top-level `appid`, `name`, `installdir` and `buildid` keys.
pub fn parse_app_manifest(text: &str) -> Option<AppManifest> {
    let mut app_id = None;
    let mut name = None;
    let mut install_dir = None;
    let mut build_id = None;

    for line in text.lines() {
        let Some((key, value)) = split_pair(line) else {
            continue;
        };
        let slot = match key.to_ascii_lowercase().as_str() {
            "appid" => &mut app_id,
            "name" => &mut name,
            "installdir" => &mut install_dir,
            "buildid" => &mut build_id,
            _ => continue,
        };
        if slot.is_none() {
            *slot = Some(value);
        }
    }

    let app_id = app_id.filter(|value| !value.is_empty())?;
    let install_dir = install_dir.filter(|value| !value.is_empty())?;
    Some(AppManifest {
        name: name.unwrap_or_else(|| app_id.clone()),
        app_id,
        install_dir,
        build_id: build_id.filter(|value| !value.is_empty()),
        branch: extract_branch(text),
    })
}

pub fn read_app_manifest(path: &Path) -> Option<AppManifest> {
    let raw = fs::read_to_string(path).ok()?;
    parse_app_manifest(&raw)
}

/// Splits `"key"  "value"` (value may be unquoted) into its parts.
fn split_pair(line: &str) -> Option<(String, String)> {
    let line = line.trim();
    let rest = line.strip_prefix('"')?;
    let (key, rest) = rest.split_once('"')?;
    let rest = rest.trim_start();
    if rest.is_empty() || rest.starts_with('{') {
        return None;
    }
    let value = match rest.strip_prefix('"') {
        Some(quoted) => quoted.split_once('"').map(|(value, _)| value)?,
        None => rest.split_whitespace().next()?,
    };
    Some((key.to_string(), value.replace("\\\\", "\\")))
}

/// Offset of the first quoted or bare occurrence of `key`.
///
/// Bare matches must stand alone, so `UserConfigVersion` is not `UserConfig`.
fn find_key(text: &str, key: &str) -> Option<usize> {
    let quoted = format!("\"{key}\"");
    text.find(&quoted).or_else(|| {
        text.match_indices(key).map(|(at, _)| at).find(|&at| {
            let before = text[..at].chars().next_back();
            let after = text[at + key.len()..].chars().next();
            !before.is_some_and(is_word_char) && !after.is_some_and(is_word_char)
        })
    })
}

fn is_word_char(ch: char) -> bool {
    ch.is_alphanumeric() || ch == '_'
}

/// The `{ ... }` block that follows the start of `text`, braces included.
fn balanced_block(text: &str) -> Option<&str> {
    let open = text.find('{')?;
    let mut depth = 0usize;
    let mut in_quotes = false;
    let mut escaped = false;

    for (offset, ch) in text[open..].char_indices() {
        if in_quotes {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_quotes = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_quotes = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[open..=open + offset]);
                }
            }
            _ => {}
        }
    }

    None
}

fn value_pattern(key: &str) -> Option<Regex> {
    let pattern = format!(r#"(?i)"{}"\s+(?:"([^"]*)"|([^\s"{{}}]+))"#, regex::escape(key));
    Regex::new(&pattern).ok()
}

fn beta_key_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN.get_or_init(|| value_pattern("BetaKey")).as_ref()
}

fn build_id_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN.get_or_init(|| value_pattern("BuildID")).as_ref()
}

fn match_value(text: &str, pattern: Option<&Regex>) -> Option<String> {
    let caps = pattern?.captures(text)?;
    caps.get(1)
        .or_else(|| caps.get(2))
        .map(|value| value.as_str().to_string())
}
