use std::fs;
use std::io;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use uuid::Uuid;

use crate::error::WorkspaceError;
use crate::unix_millis;

/// Prefix shared by every workspace directory name
pub const WORKSPACE_PREFIX: &str = "test_";

const TOKEN_LEN: usize = 12;
const MAX_ALLOCATION_ATTEMPTS: u32 = 2;
const WORKSPACE_DIR_PERMISSIONS: u32 = 0o700;

/// Lifecycle of a workspace; it only ever moves forward
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum WorkspaceState {
    Created,
    Populated,
    Executing,
    Completed,
    Reclaimed,
}

/// An isolated directory owned by exactly one submission
///
/// Dropping a workspace that was never reclaimed removes it, so a panicking
/// job cannot leak its directory.
#[derive(Debug)]
pub struct Workspace {
    id: String,
    root: PathBuf,
    submission_id: u64,
    created_at_ms: i64,
    state: WorkspaceState,
}

impl Workspace {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn submission_id(&self) -> u64 {
        self.submission_id
    }

    pub fn created_at_ms(&self) -> i64 {
        self.created_at_ms
    }

    pub fn state(&self) -> WorkspaceState {
        self.state
    }

    pub fn exists(&self) -> bool {
        self.root.is_dir()
    }

    /// Writes `contents` to a file directly inside the workspace
    pub fn write_file(&mut self, name: &str, contents: &[u8]) -> io::Result<PathBuf> {
        let mut components = Path::new(name).components();
        let single_normal = matches!(
            (components.next(), components.next()),
            (Some(Component::Normal(_)), None)
        );
        if !single_normal {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{name:?} is not a plain file name"),
            ));
        }

        let path = self.root.join(name);
        fs::write(&path, contents)?;
        self.advance(WorkspaceState::Populated);
        Ok(path)
    }

    pub(crate) fn advance(&mut self, next: WorkspaceState) {
        if next > self.state {
            log::trace!("Workspace {} {:?} -> {:?}", self.id, self.state, next);
            self.state = next;
        }
    }

    /// Removes the directory tree. Safe to call any number of times.
    ///
    /// Cleanup errors are logged and swallowed. The workspace then stays
    /// unreclaimed, so a later call or the drop retries, and the orphan
    /// sweep picks up whatever still could not be removed.
    pub fn reclaim(&mut self) {
        if self.state == WorkspaceState::Reclaimed {
            return;
        }

        match fs::remove_dir_all(&self.root) {
            Ok(()) => log::debug!("Workspace {} reclaimed", self.id),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                log::debug!("Workspace {} was already gone", self.id)
            }
            Err(e) => {
                log::warn!("Cleanup error for workspace {}: {e}", self.id);
                return;
            }
        }
        self.state = WorkspaceState::Reclaimed;
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if self.state != WorkspaceState::Reclaimed {
            log::warn!("Workspace {} dropped before reclamation", self.id);
            self.reclaim();
        }
    }
}

/// Outcome of one orphan sweep
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub reclaimed: usize,
    pub failed: usize,
    /// Workspaces younger than the staleness threshold
    pub kept: usize,
}

/// Allocates and reclaims workspaces under a single root directory
#[derive(Debug)]
pub struct WorkspaceManager {
    root: PathBuf,
}

impl WorkspaceManager {
    pub fn new(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Creates a fresh, uniquely named workspace for `submission_id`
    pub fn allocate(&self, submission_id: u64) -> Result<Workspace, WorkspaceError> {
        let mut last_error = None;

        for attempt in 1..=MAX_ALLOCATION_ATTEMPTS {
            let created_at_ms = unix_millis();
            let id = workspace_name(created_at_ms, &random_token());
            let root = self.root.join(&id);

            // Non-recursive create so that an existing name surfaces as a collision
            match fs::DirBuilder::new()
                .mode(WORKSPACE_DIR_PERMISSIONS)
                .create(&root)
            {
                Ok(()) => {
                    log::debug!("Allocated workspace {id} for submission {submission_id}");
                    return Ok(Workspace {
                        id,
                        root,
                        submission_id,
                        created_at_ms,
                        state: WorkspaceState::Created,
                    });
                }
                Err(e) => {
                    log::warn!(
                        "Attempt {attempt} to create workspace {id} for submission {submission_id} failed: {e}"
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(WorkspaceError::Creation {
            root: self.root.clone(),
            attempts: MAX_ALLOCATION_ATTEMPTS,
            source: last_error.unwrap_or_else(|| io::Error::other("no creation attempt was made")),
        })
    }

    pub fn reclaim(&self, workspace: &mut Workspace) {
        workspace.reclaim();
    }

    /// Removes workspaces left behind by an earlier, unclean shutdown
    ///
    /// Only entries following the workspace naming scheme and older than
    /// `staleness` are touched.
    pub fn sweep_orphans(&self, staleness: Duration) -> SweepReport {
        let mut report = SweepReport::default();
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) => {
                log::warn!("Orphan sweep could not read {}: {e}", self.root.display());
                return report;
            }
        };

        let now = unix_millis();
        let staleness_ms = i64::try_from(staleness.as_millis()).unwrap_or(i64::MAX);

        for entry in entries.filter_map(Result::ok) {
            let name = entry.file_name();
            let Some(created_at) = name.to_str().and_then(parse_timestamp) else {
                continue;
            };

            if now.saturating_sub(created_at) < staleness_ms {
                report.kept += 1;
                continue;
            }

            let path = entry.path();
            let removal = if path.is_dir() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            match removal {
                Ok(()) => report.reclaimed += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => report.reclaimed += 1,
                Err(e) => {
                    log::warn!("Cleanup error for orphan {}: {e}", path.display());
                    report.failed += 1;
                }
            }
        }

        log::info!(
            "Orphan sweep of {}: {} reclaimed, {} failed, {} kept",
            self.root.display(),
            report.reclaimed,
            report.failed,
            report.kept
        );
        report
    }
}

/// `test_<unixMillis>_<token>`
pub fn workspace_name(created_at_ms: i64, token: &str) -> String {
    format!("{WORKSPACE_PREFIX}{created_at_ms}_{token}")
}

/// Creation time embedded in a workspace name, if `name` is one
pub fn parse_timestamp(name: &str) -> Option<i64> {
    let rest = name.strip_prefix(WORKSPACE_PREFIX)?;
    let (millis, token) = rest.split_once('_')?;
    if token.is_empty() || !token.bytes().all(|b| b.is_ascii_alphanumeric()) {
        return None;
    }
    if millis.is_empty() || !millis.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    millis.parse().ok()
}

pub fn is_workspace_name(name: &str) -> bool {
    parse_timestamp(name).is_some()
}

/// Lowercase hex drawn from the OS random source
fn random_token() -> String {
    let mut token = Uuid::new_v4().simple().to_string();
    token.truncate(TOKEN_LEN);
    token
}
