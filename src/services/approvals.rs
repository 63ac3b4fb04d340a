//! Assisted-mode approval queue.
//!
//! Automated orders park here until the user explicitly approves them. Each
//! entry carries a TTL; expiry cancels the order before it ever reaches an
//! adapter.

use crate::error::AppError;
use crate::types::{ApprovalStatus, PendingApproval, TradeOrder};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum ApprovalError {
    #[error("approval {0} not found")]
    NotFound(String),

    #[error("approval belongs to another user")]
    WrongOwner,

    #[error("approval expired")]
    Expired,

    #[error("approval already resolved")]
    AlreadyResolved,
}

impl From<ApprovalError> for AppError {
    fn from(e: ApprovalError) -> Self {
        match e {
            ApprovalError::NotFound(id) => AppError::NotFound(format!("approval {id}")),
            ApprovalError::WrongOwner => AppError::Forbidden("not your approval".to_string()),
            ApprovalError::Expired => AppError::Conflict("approval expired".to_string()),
            ApprovalError::AlreadyResolved => {
                AppError::Conflict("approval already resolved".to_string())
            }
        }
    }
}

pub struct ApprovalQueue {
    pending: DashMap<String, PendingApproval>,
    ttl: Duration,
}

impl ApprovalQueue {
    pub fn new(ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            pending: DashMap::new(),
            ttl,
        })
    }

    /// Park an automated order for explicit approval.
    pub fn enqueue(&self, user_id: &str, order: TradeOrder) -> PendingApproval {
        let now = chrono::Utc::now().timestamp_millis();
        let approval = PendingApproval {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            order,
            status: ApprovalStatus::Pending,
            created_at: now,
            expires_at: now + self.ttl.as_millis() as i64,
        };
        self.pending.insert(approval.id.clone(), approval.clone());
        info!(approval_id = %approval.id, user_id, "order parked for approval");
        approval
    }

    /// Approve and take the order; the caller submits it.
    pub fn approve(&self, approval_id: &str, user_id: &str) -> Result<TradeOrder, ApprovalError> {
        let mut entry = self
            .pending
            .get_mut(approval_id)
            .ok_or_else(|| ApprovalError::NotFound(approval_id.to_string()))?;
        if entry.user_id != user_id {
            return Err(ApprovalError::WrongOwner);
        }
        if entry.status != ApprovalStatus::Pending {
            return Err(ApprovalError::AlreadyResolved);
        }
        if chrono::Utc::now().timestamp_millis() > entry.expires_at {
            entry.status = ApprovalStatus::Expired;
            return Err(ApprovalError::Expired);
        }
        entry.status = ApprovalStatus::Approved;
        info!(approval_id, user_id, "order approved");
        Ok(entry.order.clone())
    }

    pub fn reject(&self, approval_id: &str, user_id: &str) -> Result<(), ApprovalError> {
        let mut entry = self
            .pending
            .get_mut(approval_id)
            .ok_or_else(|| ApprovalError::NotFound(approval_id.to_string()))?;
        if entry.user_id != user_id {
            return Err(ApprovalError::WrongOwner);
        }
        if entry.status != ApprovalStatus::Pending {
            return Err(ApprovalError::AlreadyResolved);
        }
        entry.status = ApprovalStatus::Rejected;
        info!(approval_id, user_id, "order rejected");
        Ok(())
    }

    /// Pending, unexpired approvals for one user.
    pub fn pending_for(&self, user_id: &str) -> Vec<PendingApproval> {
        let now = chrono::Utc::now().timestamp_millis();
        let mut out: Vec<PendingApproval> = self
            .pending
            .iter()
            .filter(|e| {
                e.user_id == user_id && e.status == ApprovalStatus::Pending && e.expires_at >= now
            })
            .map(|e| e.clone())
            .collect();
        out.sort_by_key(|a| a.created_at);
        out
    }

    /// Expire overdue entries; returns how many were cancelled. Called from
    /// a periodic task.
    pub fn sweep_expired(&self) -> usize {
        let now = chrono::Utc::now().timestamp_millis();
        let mut expired = 0;
        for mut entry in self.pending.iter_mut() {
            if entry.status == ApprovalStatus::Pending && now > entry.expires_at {
                entry.status = ApprovalStatus::Expired;
                expired += 1;
                debug!(approval_id = %entry.id, "approval expired");
            }
        }
        // Resolved entries older than a day fall out of memory.
        let cutoff = now - 24 * 60 * 60 * 1000;
        self.pending
            .retain(|_, a| a.status == ApprovalStatus::Pending || a.created_at > cutoff);
        expired
    }
}
