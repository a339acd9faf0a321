use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Read-only lookup of CRM records by email address.
#[async_trait]
pub trait EntityDirectory: Send + Sync {
    /// Most recently created booking for the address, if any.
    async fn find_booking_by_email(&self, email: &str) -> Result<Option<i64>>;
    async fn find_user_by_email(&self, email: &str) -> Result<Option<i64>>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityLinks {
    pub booking_id: Option<i64>,
    pub user_id: Option<i64>,
}

/// Best-effort association of a new thread with a booking and a user.
/// Lookup failures and misses both leave the thread unlinked.
#[derive(Clone)]
pub struct EntityLinker {
    directory: Arc<dyn EntityDirectory>,
}

impl EntityLinker {
    pub fn new(directory: Arc<dyn EntityDirectory>) -> Self {
        Self { directory }
    }

    pub async fn link(&self, address: &str) -> EntityLinks {
        let email = address.trim().to_lowercase();
        if email.is_empty() {
            return EntityLinks::default();
        }
        let booking_id = match self.directory.find_booking_by_email(&email).await {
            Ok(found) => found,
            Err(err) => {
                warn!(email = %email, error = %err, "booking lookup failed");
                None
            }
        };
        let user_id = match self.directory.find_user_by_email(&email).await {
            Ok(found) => found,
            Err(err) => {
                warn!(email = %email, error = %err, "user lookup failed");
                None
            }
        };
        debug!(email = %email, ?booking_id, ?user_id, "entity links resolved");
        EntityLinks {
            booking_id,
            user_id,
        }
    }
}
