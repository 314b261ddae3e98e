use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::error::StorageError;
use super::store::RepositoryState;

const SNAPSHOT_VERSION: u32 = 1;

#[derive(serde::Serialize, serde::Deserialize)]
struct SnapshotFile {
    version: u32,
    state: RepositoryState,
}

/// Default snapshot location
pub fn default_snapshot_path() -> Option<PathBuf> {
    dirs::data_dir().map(|p| p.join("git-ew/store.bin"))
}

/// Load a repository snapshot (binary format for speed)
///
/// Missing, unreadable or outdated snapshots yield `None`.
pub fn load_snapshot(path: &Path) -> Option<RepositoryState> {
    if !path.exists() {
        return None;
    }

    let file = match File::open(path) {
        Ok(f) => f,
        Err(err) => {
            warn!(path = %path.display(), %err, "cannot open snapshot");
            return None;
        }
    };

    let reader = BufReader::new(file);
    let snapshot: SnapshotFile = match bincode::deserialize_from(reader) {
        Ok(s) => s,
        Err(err) => {
            warn!(path = %path.display(), %err, "ignoring unreadable snapshot");
            return None;
        }
    };

    if snapshot.version != SNAPSHOT_VERSION {
        warn!(
            path = %path.display(),
            version = snapshot.version,
            "ignoring snapshot from another version"
        );
        return None;
    }

    debug!(path = %path.display(), "loaded snapshot");
    Some(snapshot.state)
}

/// Save a repository snapshot, replacing the previous one in a single rename
pub fn save_snapshot(path: &Path, state: &RepositoryState) -> Result<(), StorageError> {
    let io_err = |source| StorageError::Snapshot {
        path: path.to_path_buf(),
        source,
    };

    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir).map_err(io_err)?;

    #[derive(serde::Serialize)]
    struct SnapshotRef<'a> {
        version: u32,
        state: &'a RepositoryState,
    }

    let temp = tempfile::NamedTempFile::new_in(dir).map_err(io_err)?;
    {
        let mut writer = BufWriter::new(temp.as_file());
        bincode::serialize_into(
            &mut writer,
            &SnapshotRef {
                version: SNAPSHOT_VERSION,
                state,
            },
        )?;
        writer.flush().map_err(io_err)?;
    }
    temp.persist(path).map_err(|err| io_err(err.error))?;

    Ok(())
}
