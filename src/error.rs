use crate::branch::Branch;
use std::{io, path::PathBuf};
use thiserror::Error;

/// Failures that stop a sync run. Timeouts and cancellation are outcomes, not errors.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("source install {} does not exist", path.display())]
    NoSourceInstall { path: PathBuf },

    #[error("cannot create snapshot root {}", path.display())]
    SnapshotRoot {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("another sync is already running against {}", root.display())]
    Busy { root: PathBuf },

    #[error("cannot open lock file {}", path.display())]
    Lock {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("copying {branch} failed")]
    BranchCopy {
        branch: Branch,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}
