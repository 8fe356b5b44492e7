//! Approval gateway — turns human file relocations into resolutions.
//!
//! Detection is event-driven: a filesystem watcher triggers a sweep whenever
//! anything under the decision folders changes, with a bounded fallback poll
//! covering missed event delivery. The sweep compares a request's source and
//! destination locations through the pure transition table in
//! [`request::resolve_relocation`]; content is only consulted to detect an
//! edited proposal, which resolves as `modified` and re-files the request
//! pending after re-validation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use notify::{RecursiveMode, Watcher};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::approval::request::{self, ApprovalRequest, Resolution};
use crate::error::ApprovalError;
use crate::task::descriptor;
use crate::vault::{Location, Vault};

/// Handle returned to the suspended loop; resolved exactly once.
pub struct ApprovalTicket {
    pub request_id: Uuid,
    pub resolved: oneshot::Receiver<Resolution>,
}

struct PendingEntry {
    request: ApprovalRequest,
    tx: oneshot::Sender<Resolution>,
}

/// Detects human decisions expressed as file relocations.
pub struct ApprovalGateway {
    vault: Arc<Vault>,
    pending: Mutex<HashMap<Uuid, PendingEntry>>,
}

impl ApprovalGateway {
    pub fn new(vault: Arc<Vault>) -> Self {
        Self {
            vault,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// File a request into `Pending_Approval` and return its wake ticket.
    ///
    /// If a document for the same task and step survives from an interrupted
    /// run, it is adopted instead of filed anew: a decision the human already
    /// made on it, or is about to make, resolves the resumed loop rather than
    /// going ignored next to a duplicate.
    pub async fn submit(&self, request: ApprovalRequest) -> Result<ApprovalTicket, ApprovalError> {
        let request = match self.find_orphan(&request.task_id, &request.step_id).await? {
            Some(orphan) => {
                tracing::info!(
                    request = %orphan.id,
                    task = %orphan.task_id,
                    step = %orphan.step_id,
                    "Adopting request document from a previous run"
                );
                orphan
            }
            None => {
                self.vault
                    .write_doc(
                        &Location::PendingApproval,
                        &request.filename(),
                        &request.to_document(),
                    )
                    .await?;
                tracing::info!(
                    request = %request.id,
                    task = %request.task_id,
                    step = %request.step_id,
                    risk = %request.risk,
                    "Filed approval request"
                );
                request
            }
        };
        let (tx, rx) = oneshot::channel();
        let id = request.id;
        self.pending
            .lock()
            .await
            .insert(id, PendingEntry { request, tx });
        Ok(ApprovalTicket {
            request_id: id,
            resolved: rx,
        })
    }

    /// An untracked request document for this task and step, left behind by
    /// an interrupted run. Pending and already-decided locations both count;
    /// consumed decisions in `Rejected` stay where they are.
    async fn find_orphan(
        &self,
        task_id: &str,
        step_id: &str,
    ) -> Result<Option<ApprovalRequest>, ApprovalError> {
        let pending = self.pending.lock().await;
        for location in [Location::PendingApproval, Location::Approved] {
            for path in self.vault.list_docs(&location).await? {
                let Ok(content) = self.vault.read_doc(&path).await else {
                    continue;
                };
                let Ok(parsed) = ApprovalRequest::from_document(&content) else {
                    continue;
                };
                if parsed.task_id == task_id
                    && parsed.step_id == step_id
                    && !pending.contains_key(&parsed.id)
                {
                    return Ok(Some(parsed));
                }
            }
        }
        Ok(None)
    }

    /// Number of requests still awaiting a decision.
    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// One detection pass over all pending requests.
    ///
    /// Mutations to the pending table are serialized by the table lock, so a
    /// resolution is delivered exactly once.
    pub async fn sweep(&self) -> Result<(), ApprovalError> {
        let mut pending = self.pending.lock().await;
        let ids: Vec<Uuid> = pending.keys().copied().collect();
        let now = chrono::Utc::now();

        for id in ids {
            let Some(entry) = pending.get(&id) else {
                continue;
            };
            let filename = entry.request.filename();
            let approved_path = self.vault.dir(&Location::Approved).join(&filename);
            let rejected_path = self.vault.dir(&Location::Rejected).join(&filename);
            let pending_path = self.vault.dir(&Location::PendingApproval).join(&filename);

            if approved_path.exists() {
                let resolution =
                    request::resolve_relocation(&Location::PendingApproval, &Location::Approved)
                        .unwrap_or(Resolution::Approved);
                let content = self.vault.read_doc(&approved_path).await?;
                match edited_proposal(&entry.request, &content) {
                    ProposalCheck::Unchanged => {
                        self.deliver(&mut pending, id, resolution).await;
                    }
                    ProposalCheck::Edited(new_proposal) => {
                        // modified → pending self-loop: re-validate, re-file.
                        tracing::info!(request = %id, "Proposal edited, re-filing as pending");
                        if let Some(entry) = pending.get_mut(&id) {
                            entry.request.proposed_action = new_proposal;
                            self.vault
                                .write_atomic(&pending_path, &entry.request.to_document())
                                .await?;
                        }
                        tokio::fs::remove_file(&approved_path)
                            .await
                            .map_err(crate::error::VaultError::Io)?;
                    }
                    ProposalCheck::Invalid => {
                        tracing::warn!(request = %id, "Edited request no longer parses, rejecting");
                        self.deliver(&mut pending, id, Resolution::Rejected).await;
                    }
                }
            } else if rejected_path.exists() {
                let resolution =
                    request::resolve_relocation(&Location::PendingApproval, &Location::Rejected)
                        .unwrap_or(Resolution::Rejected);
                self.deliver(&mut pending, id, resolution).await;
            } else if entry.request.is_expired(now) {
                // No decision before expiry: implicit rejection, distinct reason.
                if pending_path.exists() {
                    let content = self.vault.read_doc(&pending_path).await?;
                    let expired = content.replacen("status: pending", "status: expired", 1);
                    self.vault.write_atomic(&pending_path, &expired).await?;
                    self.vault
                        .relocate(&pending_path, &Location::Rejected)
                        .await?;
                }
                self.deliver(&mut pending, id, Resolution::Expired).await;
            }
        }

        // Orphaned documents from a previous run sit untracked until a
        // resumed loop adopts them; once their window passes, expire them
        // like any other undecided request so they stop inviting decisions
        // nothing will consume.
        for path in self.vault.list_docs(&Location::PendingApproval).await? {
            let Ok(content) = self.vault.read_doc(&path).await else {
                continue;
            };
            let Ok(orphan) = ApprovalRequest::from_document(&content) else {
                continue;
            };
            if pending.contains_key(&orphan.id) || !orphan.is_expired(now) {
                continue;
            }
            tracing::info!(
                request = %orphan.id,
                task = %orphan.task_id,
                "Expiring orphaned request from a previous run"
            );
            let expired = content.replacen("status: pending", "status: expired", 1);
            self.vault.write_atomic(&path, &expired).await?;
            self.vault.relocate(&path, &Location::Rejected).await?;
        }
        Ok(())
    }

    async fn deliver(
        &self,
        pending: &mut HashMap<Uuid, PendingEntry>,
        id: Uuid,
        resolution: Resolution,
    ) {
        if let Some(entry) = pending.remove(&id) {
            tracing::info!(
                request = %id,
                task = %entry.request.task_id,
                resolution = resolution.reason_code(),
                "Approval resolved"
            );
            let _ = entry.tx.send(resolution);
        }
    }

    /// Run the watcher plus fallback poll until aborted.
    pub fn spawn(self: Arc<Self>, poll_interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let (tx, mut rx) = mpsc::unbounded_channel();
            // The watcher handle must stay alive for events to keep flowing.
            let mut watcher = match notify::recommended_watcher(
                move |res: notify::Result<notify::Event>| {
                    if res.is_ok() {
                        let _ = tx.send(());
                    }
                },
            ) {
                Ok(w) => Some(w),
                Err(e) => {
                    tracing::warn!("Filesystem watcher unavailable, poll only: {}", e);
                    None
                }
            };
            if let Some(w) = watcher.as_mut() {
                for location in [
                    Location::PendingApproval,
                    Location::Approved,
                    Location::Rejected,
                ] {
                    if let Err(e) = w.watch(&self.vault.dir(&location), RecursiveMode::NonRecursive)
                    {
                        tracing::warn!(location = %location, "Watch failed: {}", e);
                    }
                }
            }

            let mut interval = tokio::time::interval(poll_interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = rx.recv() => {}
                }
                if let Err(e) = self.sweep().await {
                    tracing::warn!("Approval sweep failed: {}", e);
                }
            }
        })
    }
}

enum ProposalCheck {
    Unchanged,
    Edited(String),
    Invalid,
}

/// Compare the relocated document's proposal against the recorded one.
fn edited_proposal(recorded: &ApprovalRequest, content: &str) -> ProposalCheck {
    let Ok((_, body)) = descriptor::split_frontmatter(content) else {
        return ProposalCheck::Invalid;
    };
    if ApprovalRequest::from_document(content).is_err() {
        return ProposalCheck::Invalid;
    }
    match request::extract_proposal(body) {
        Some(proposal) if proposal == recorded.proposed_action => ProposalCheck::Unchanged,
        Some(proposal) => ProposalCheck::Edited(proposal),
        None => ProposalCheck::Invalid,
    }
}
