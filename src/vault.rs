//! File-backed vault — the single source of truth for task state.
//!
//! Task documents move between named locations; the location a document
//! resides in, never its filename, is the authoritative state signal. All
//! directory knowledge lives here: components above deal in `Location`
//! values and task identifiers. Every write is a temp-file-plus-rename so a
//! crash never leaves a half-written record behind.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::fs;

use crate::error::VaultError;
use crate::task::descriptor;

/// Well-known vault directory names.
pub mod dirs {
    pub const INBOX: &str = "Inbox";
    pub const IN_PROGRESS: &str = "In_Progress";
    pub const PENDING_APPROVAL: &str = "Pending_Approval";
    pub const APPROVED: &str = "Approved";
    pub const REJECTED: &str = "Rejected";
    pub const DONE: &str = "Done";
    pub const NEEDS_INTERVENTION: &str = "Needs_Intervention";
    pub const QUARANTINE: &str = "Quarantine";
    pub const STATE: &str = "State";
    pub const STATE_ARCHIVE: &str = "State/archive";
    pub const REGISTRY_FILE: &str = "agents.json";
}

/// A named location a document can reside in.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Location {
    /// Intake: validated descriptors wait here for assignment.
    Inbox,
    /// Owned by one agent; the path component is the agent id.
    InProgress(String),
    /// Approval requests awaiting a human decision.
    PendingApproval,
    /// Human moved the request here to approve it.
    Approved,
    /// Human moved the request here to reject it.
    Rejected,
    /// Terminal success. Only the step executor relocates tasks here.
    Done,
    /// Terminal non-success; holds tasks plus their intervention reports.
    NeedsIntervention,
    /// Descriptors rejected at admission, with their error report.
    Quarantine,
}

impl Location {
    /// Relative directory for this location.
    pub fn relative_dir(&self) -> PathBuf {
        match self {
            Self::Inbox => PathBuf::from(dirs::INBOX),
            Self::InProgress(agent) => Path::new(dirs::IN_PROGRESS).join(agent),
            Self::PendingApproval => PathBuf::from(dirs::PENDING_APPROVAL),
            Self::Approved => PathBuf::from(dirs::APPROVED),
            Self::Rejected => PathBuf::from(dirs::REJECTED),
            Self::Done => PathBuf::from(dirs::DONE),
            Self::NeedsIntervention => PathBuf::from(dirs::NEEDS_INTERVENTION),
            Self::Quarantine => PathBuf::from(dirs::QUARANTINE),
        }
    }
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InProgress(agent) => write!(f, "in_progress({agent})"),
            Self::Inbox => write!(f, "inbox"),
            Self::PendingApproval => write!(f, "pending_approval"),
            Self::Approved => write!(f, "approved"),
            Self::Rejected => write!(f, "rejected"),
            Self::Done => write!(f, "done"),
            Self::NeedsIntervention => write!(f, "needs_intervention"),
            Self::Quarantine => write!(f, "quarantine"),
        }
    }
}

/// The vault rooted at a directory.
pub struct Vault {
    root: PathBuf,
}

impl Vault {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute directory for a location.
    pub fn dir(&self, location: &Location) -> PathBuf {
        self.root.join(location.relative_dir())
    }

    /// Absolute path of the persisted registry record.
    pub fn registry_path(&self) -> PathBuf {
        self.root.join(dirs::REGISTRY_FILE)
    }

    /// Absolute path of a task's persisted execution state.
    pub fn state_path(&self, task_id: &str) -> PathBuf {
        self.root.join(dirs::STATE).join(format!("{task_id}.json"))
    }

    /// Absolute path of an archived execution state.
    pub fn archived_state_path(&self, task_id: &str) -> PathBuf {
        self.root
            .join(dirs::STATE_ARCHIVE)
            .join(format!("{task_id}.json"))
    }

    /// Ensure the fixed directory structure exists.
    pub async fn ensure_dirs(&self) -> Result<(), VaultError> {
        for dir in [
            dirs::INBOX,
            dirs::IN_PROGRESS,
            dirs::PENDING_APPROVAL,
            dirs::APPROVED,
            dirs::REJECTED,
            dirs::DONE,
            dirs::NEEDS_INTERVENTION,
            dirs::QUARANTINE,
            dirs::STATE,
            dirs::STATE_ARCHIVE,
        ] {
            fs::create_dir_all(self.root.join(dir)).await?;
        }
        Ok(())
    }

    /// Provision a per-agent workspace directory.
    pub async fn provision_agent_workspace(&self, agent_id: &str) -> Result<PathBuf, VaultError> {
        let dir = self.dir(&Location::InProgress(agent_id.to_string()));
        fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    /// Atomically write a file: temp file in the same directory, then rename.
    ///
    /// The temp name carries the pid and a process-wide sequence number, so
    /// writers of sibling files sharing a stem (or of the same file) never
    /// collide on it.
    pub async fn write_atomic(&self, path: &Path, content: &str) -> Result<(), VaultError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        static TMP_SEQ: AtomicU64 = AtomicU64::new(0);
        let mut tmp_name = path
            .file_name()
            .ok_or_else(|| VaultError::Malformed {
                path: path.display().to_string(),
                reason: "no filename".to_string(),
            })?
            .to_owned();
        tmp_name.push(format!(
            ".{}.{}.tmp",
            std::process::id(),
            TMP_SEQ.fetch_add(1, Ordering::Relaxed)
        ));
        let tmp = path.with_file_name(tmp_name);
        fs::write(&tmp, content).await?;
        fs::rename(&tmp, path).await?;
        Ok(())
    }

    /// Write a document into a location under the given filename.
    pub async fn write_doc(
        &self,
        location: &Location,
        filename: &str,
        content: &str,
    ) -> Result<PathBuf, VaultError> {
        let path = self.dir(location).join(filename);
        self.write_atomic(&path, content).await?;
        Ok(path)
    }

    pub async fn read_doc(&self, path: &Path) -> Result<String, VaultError> {
        Ok(fs::read_to_string(path).await?)
    }

    /// Relocate a document to another location, keeping its filename.
    ///
    /// The rename is the state transition; content is untouched.
    pub async fn relocate(&self, from: &Path, to: &Location) -> Result<PathBuf, VaultError> {
        let filename = from
            .file_name()
            .ok_or_else(|| VaultError::Malformed {
                path: from.display().to_string(),
                reason: "no filename".to_string(),
            })?
            .to_owned();
        let dest_dir = self.dir(to);
        fs::create_dir_all(&dest_dir).await?;
        let dest = dest_dir.join(filename);
        fs::rename(from, &dest).await?;
        Ok(dest)
    }

    /// List markdown documents in a location, sorted by filename.
    pub async fn list_docs(&self, location: &Location) -> Result<Vec<PathBuf>, VaultError> {
        self.list_md(&self.dir(location)).await
    }

    async fn list_md(&self, dir: &Path) -> Result<Vec<PathBuf>, VaultError> {
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut docs = Vec::new();
        let mut read_dir = fs::read_dir(dir).await?;
        while let Some(entry) = read_dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("md") {
                docs.push(path);
            }
        }
        docs.sort();
        Ok(docs)
    }

    /// List the agent ids that have a provisioned workspace.
    pub async fn agent_workspaces(&self) -> Result<Vec<String>, VaultError> {
        let dir = self.root.join(dirs::IN_PROGRESS);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut agents = Vec::new();
        let mut read_dir = fs::read_dir(&dir).await?;
        while let Some(entry) = read_dir.next_entry().await? {
            if entry.metadata().await?.is_dir()
                && let Some(name) = entry.file_name().to_str()
            {
                agents.push(name.to_string());
            }
        }
        agents.sort();
        Ok(agents)
    }

    /// Locate a task by its frontmatter identifier.
    ///
    /// Scans the locations a task document can legally reside in. Linear,
    /// but always consistent with on-disk reality even after a crash.
    pub async fn find_task(&self, task_id: &str) -> Result<Option<(Location, PathBuf)>, VaultError> {
        let mut locations = vec![
            Location::Done,
            Location::Inbox,
            Location::NeedsIntervention,
            Location::Quarantine,
        ];
        for agent in self.agent_workspaces().await? {
            locations.push(Location::InProgress(agent));
        }

        for location in locations {
            for path in self.list_docs(&location).await? {
                let content = match fs::read_to_string(&path).await {
                    Ok(c) => c,
                    Err(_) => continue, // raced with a relocation
                };
                if descriptor::extract_id(&content).as_deref() == Some(task_id) {
                    return Ok(Some((location, path)));
                }
            }
        }
        Ok(None)
    }

    /// Task ids with a live (non-archived) execution state record.
    pub async fn state_records(&self) -> Result<Vec<String>, VaultError> {
        let dir = self.root.join(dirs::STATE);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        let mut read_dir = fs::read_dir(&dir).await?;
        while let Some(entry) = read_dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json")
                && let Some(stem) = path.file_stem().and_then(|s| s.to_str())
            {
                ids.push(stem.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Whether the task document has been relocated to `Done`.
    pub async fn is_done(&self, task_id: &str) -> Result<bool, VaultError> {
        for path in self.list_docs(&Location::Done).await? {
            let content = match fs::read_to_string(&path).await {
                Ok(c) => c,
                Err(_) => continue,
            };
            if descriptor::extract_id(&content).as_deref() == Some(task_id) {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn test_vault() -> (Vault, TempDir) {
        let dir = TempDir::new().unwrap();
        let vault = Vault::new(dir.path().to_path_buf());
        vault.ensure_dirs().await.unwrap();
        (vault, dir)
    }

    fn task_doc(id: &str) -> String {
        format!("---\nid: {id}\npriority: medium\n---\nbody\n")
    }

    #[tokio::test]
    async fn ensure_dirs_creates_structure() {
        let (vault, dir) = test_vault().await;
        assert!(dir.path().join(dirs::INBOX).exists());
        assert!(dir.path().join(dirs::STATE_ARCHIVE).exists());
        let _ = vault;
    }

    #[tokio::test]
    async fn write_and_read_doc() {
        let (vault, _dir) = test_vault().await;
        let path = vault
            .write_doc(&Location::Inbox, "t1.md", &task_doc("t1"))
            .await
            .unwrap();
        let content = vault.read_doc(&path).await.unwrap();
        assert!(content.contains("id: t1"));
    }

    #[tokio::test]
    async fn atomic_write_leaves_no_temp_file() {
        let (vault, _dir) = test_vault().await;
        vault
            .write_doc(&Location::Inbox, "t1.md", &task_doc("t1"))
            .await
            .unwrap();
        let mut entries = tokio::fs::read_dir(vault.dir(&Location::Inbox)).await.unwrap();
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        assert_eq!(names, vec!["t1.md".to_string()]);
    }

    #[tokio::test]
    async fn atomic_write_does_not_clobber_stem_siblings() {
        let (vault, _dir) = test_vault().await;
        // A sibling sharing the stem, and one literally named `t1.tmp`.
        let json = vault.dir(&Location::Inbox).join("t1.json");
        let tmp_named = vault.dir(&Location::Inbox).join("t1.tmp");
        vault.write_atomic(&json, "{}").await.unwrap();
        vault.write_atomic(&tmp_named, "keep me").await.unwrap();

        vault
            .write_doc(&Location::Inbox, "t1.md", &task_doc("t1"))
            .await
            .unwrap();

        assert_eq!(vault.read_doc(&json).await.unwrap(), "{}");
        assert_eq!(vault.read_doc(&tmp_named).await.unwrap(), "keep me");
    }

    #[tokio::test]
    async fn relocate_moves_between_locations() {
        let (vault, _dir) = test_vault().await;
        let path = vault
            .write_doc(&Location::Inbox, "t1.md", &task_doc("t1"))
            .await
            .unwrap();
        let dest = vault.relocate(&path, &Location::Done).await.unwrap();
        assert!(!path.exists());
        assert!(dest.exists());
        assert!(vault.is_done("t1").await.unwrap());
    }

    #[tokio::test]
    async fn find_task_reports_location() {
        let (vault, _dir) = test_vault().await;
        vault.provision_agent_workspace("agent-a").await.unwrap();
        vault
            .write_doc(
                &Location::InProgress("agent-a".to_string()),
                "t2.md",
                &task_doc("t2"),
            )
            .await
            .unwrap();

        let (location, _path) = vault.find_task("t2").await.unwrap().unwrap();
        assert_eq!(location, Location::InProgress("agent-a".to_string()));
        assert!(vault.find_task("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn agent_workspaces_listed_sorted() {
        let (vault, _dir) = test_vault().await;
        vault.provision_agent_workspace("bravo").await.unwrap();
        vault.provision_agent_workspace("alpha").await.unwrap();
        let agents = vault.agent_workspaces().await.unwrap();
        assert_eq!(agents, vec!["alpha".to_string(), "bravo".to_string()]);
    }

    #[tokio::test]
    async fn list_docs_ignores_non_markdown() {
        let (vault, _dir) = test_vault().await;
        vault
            .write_doc(&Location::Inbox, "t1.md", &task_doc("t1"))
            .await
            .unwrap();
        let tmp = vault.dir(&Location::Inbox).join("scratch.txt");
        tokio::fs::write(&tmp, "noise").await.unwrap();
        let docs = vault.list_docs(&Location::Inbox).await.unwrap();
        assert_eq!(docs.len(), 1);
    }
}
