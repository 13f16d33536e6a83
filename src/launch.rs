use crate::{
    observer::Observer,
    status::{BranchRecord, BranchStatus},
};
use anyhow::{bail, Context, Result};
use std::{path::Path, process::Command};

/// Starts a branch's executable and returns the child's pid without waiting on it.
///
/// `launcher` wraps the executable (for example `wine` or a Proton script).
pub fn launch_branch(
    record: &BranchRecord,
    launcher: Option<&Path>,
    observer: &dyn Observer,
) -> Result<u32> {
    if record.status == BranchStatus::NotInstalled || !record.executable_path.is_file() {
        bail!(
            "{} is not installed at {}",
            record.name,
            record.folder_path.display()
        );
    }

    let mut command = match launcher {
        Some(launcher) => {
            let mut command = Command::new(launcher);
            command.arg(&record.executable_path);
            command
        }
        None => Command::new(&record.executable_path),
    };
    let child = command
        .current_dir(&record.folder_path)
        .spawn()
        .with_context(|| format!("launch {}", record.executable_path.display()))?;

    let pid = child.id();
    observer.info(format!("Launched {} (pid {pid})", record.name));
    Ok(pid)
}
