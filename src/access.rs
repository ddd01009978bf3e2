//! Approval handshake gating every sender before anything is stored.
//!
//! `Unknown -> PendingApproval -> Approved`. A denial returns the sender to
//! `Unknown` without persisting anything, so they are prompted again on their
//! next message.

use crate::deadline::call;
use crate::error::{Backend, CoreResult};
use crate::model::{ReviewerDecision, Sender, User, Verdict};
use crate::store::MessageStore;
use crate::transport::Transport;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const APPROVE_VERB: &str = "approve";
const DENY_VERB: &str = "deny";
const TOKEN_DELIMITER: char = '_';

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalState {
    Approved(User),
    Pending,
}

impl ReviewerDecision {
    /// Opaque token round-tripped through the reviewer's approve/deny affordance.
    pub fn token(&self) -> String {
        let verb = match self.verdict {
            Verdict::Approve => APPROVE_VERB,
            Verdict::Deny => DENY_VERB,
        };
        format!("{}{}{}", verb, TOKEN_DELIMITER, self.sender_id)
    }

    pub fn parse_token(token: &str) -> Option<Self> {
        let (verb, sender_id) = token.split_once(TOKEN_DELIMITER)?;
        let verdict = match verb {
            APPROVE_VERB => Verdict::Approve,
            DENY_VERB => Verdict::Deny,
            _ => return None,
        };
        Some(ReviewerDecision {
            verdict,
            sender_id: sender_id.parse().ok()?,
        })
    }
}

/// Senders with an outstanding approval request.
#[derive(Debug, Default)]
pub struct PendingApprovals {
    inner: Mutex<HashSet<i64>>,
}

impl PendingApprovals {
    /// Marks the sender pending. Returns `false` when a request is already outstanding.
    pub fn begin(&self, sender_id: i64) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(sender_id)
    }

    pub fn clear(&self, sender_id: i64) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&sender_id)
    }

    pub fn contains(&self, sender_id: i64) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains(&sender_id)
    }
}

pub struct AccessGate {
    store: MessageStore,
    transport: Arc<dyn Transport>,
    pending: PendingApprovals,
    notify_timeout: Duration,
}

impl AccessGate {
    pub fn new(store: MessageStore, transport: Arc<dyn Transport>, notify_timeout: Duration) -> Self {
        Self {
            store,
            transport,
            pending: PendingApprovals::default(),
            notify_timeout,
        }
    }

    pub fn pending(&self) -> &PendingApprovals {
        &self.pending
    }

    /// Returns the approved user (with refreshed metadata), or asks the
    /// reviewer once and reports `Pending`.
    pub async fn check_or_request(
        &self,
        conversation_id: i64,
        sender: &Sender,
        token: &CancellationToken,
    ) -> CoreResult<ApprovalState> {
        if self.store.get_user(sender.id).await?.is_some() {
            let user = User::from(sender);
            self.store.refresh_user(conversation_id, user.clone()).await?;
            return Ok(ApprovalState::Approved(user));
        }

        if !self.pending.begin(sender.id) {
            return Ok(ApprovalState::Pending);
        }

        let notified = call(
            Backend::Transport,
            self.notify_timeout,
            token,
            self.transport.notify_reviewer(sender),
        )
        .await;
        match notified {
            Ok(()) => info!("approval_requested - sender_id: {}", sender.id),
            Err(e) => {
                // Allow the next message from this sender to ask again.
                self.pending.clear(sender.id);
                warn!("approval_request_failed - sender_id: {} - error: {}", sender.id, e);
            }
        }
        Ok(ApprovalState::Pending)
    }

    /// Applies a reviewer decision. Approval is idempotent.
    pub async fn decide(&self, decision: ReviewerDecision) -> CoreResult<Option<User>> {
        self.pending.clear(decision.sender_id);
        match decision.verdict {
            Verdict::Approve => {
                let user = User::new(decision.sender_id);
                let created = self.store.ensure_user(user.clone()).await?;
                info!(
                    "sender_approved - sender_id: {} - created: {}",
                    decision.sender_id, created
                );
                Ok(Some(user))
            }
            Verdict::Deny => {
                info!("sender_denied - sender_id: {}", decision.sender_id);
                Ok(None)
            }
        }
    }
}
