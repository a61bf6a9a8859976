//! Alert Group Repository

use crate::StorageError;
use alert_model::Alert;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

/// Alerts accumulated for one group during one window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    /// Row identity
    pub uid: Uuid,
    /// Group identifier, shared by every window of the same group
    pub id: String,
    /// End of the window
    pub exp_at: DateTime<Utc>,
    /// Occurrences in arrival order
    pub alerts: Vec<Alert>,
}

impl Group {
    pub fn new(id: impl Into<String>, exp_at: DateTime<Utc>, alerts: Vec<Alert>) -> Self {
        Self {
            uid: Uuid::new_v4(),
            id: id.into(),
            exp_at,
            alerts,
        }
    }
}

/// Selects groups. Empty lists match everything.
#[derive(Debug, Clone, Default)]
pub struct GroupFilter {
    pub ids: Vec<String>,
    pub uids: Vec<Uuid>,
    /// Only groups expiring at or before this time
    pub exp_not_after: Option<DateTime<Utc>>,
}

impl GroupFilter {
    pub fn by_id(id: impl Into<String>) -> Self {
        Self {
            ids: vec![id.into()],
            ..Default::default()
        }
    }

    pub fn by_uids(uids: Vec<Uuid>) -> Self {
        Self {
            uids,
            ..Default::default()
        }
    }

    pub fn expiring_by(mut self, exp_not_after: DateTime<Utc>) -> Self {
        self.exp_not_after = Some(exp_not_after);
        self
    }

    pub fn matches(&self, group: &Group) -> bool {
        (self.ids.is_empty() || self.ids.contains(&group.id))
            && (self.uids.is_empty() || self.uids.contains(&group.uid))
            && self.exp_not_after.map_or(true, |bound| group.exp_at <= bound)
    }
}

/// Persistence for alert groups
#[async_trait]
pub trait GroupRepository: Send + Sync {
    async fn create_group(&self, group: &Group) -> Result<(), StorageError>;

    /// Replace a stored group; `StorageError::NotFound` if its row is gone
    async fn update_group(&self, group: &Group) -> Result<(), StorageError>;

    /// Matching groups, earliest expiry first
    async fn find_groups(&self, filter: &GroupFilter) -> Result<Vec<Group>, StorageError>;

    /// Delete matching groups, returning how many were removed
    async fn delete(&self, filter: &GroupFilter) -> Result<usize, StorageError>;
}

/// Repository kept in process memory
pub struct MemoryGroupRepository {
    groups: Mutex<HashMap<Uuid, Group>>,
}

impl MemoryGroupRepository {
    /// Create a new in-memory repository
    pub fn new() -> Self {
        info!("Creating in-memory group repository");
        Self {
            groups: Mutex::new(HashMap::new()),
        }
    }

    /// Get total group count
    pub fn group_count(&self) -> usize {
        self.groups.lock().map(|g| g.len()).unwrap_or(0)
    }
}

impl Default for MemoryGroupRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GroupRepository for MemoryGroupRepository {
    async fn create_group(&self, group: &Group) -> Result<(), StorageError> {
        let mut groups = self
            .groups
            .lock()
            .map_err(|e| StorageError::BackendError(format!("Lock error: {}", e)))?;

        groups.insert(group.uid, group.clone());
        debug!("Created group {} ({}), expires {}", group.id, group.uid, group.exp_at);
        Ok(())
    }

    async fn update_group(&self, group: &Group) -> Result<(), StorageError> {
        let mut groups = self
            .groups
            .lock()
            .map_err(|e| StorageError::BackendError(format!("Lock error: {}", e)))?;

        match groups.get_mut(&group.uid) {
            Some(stored) => {
                *stored = group.clone();
                Ok(())
            }
            None => Err(StorageError::NotFound),
        }
    }

    async fn find_groups(&self, filter: &GroupFilter) -> Result<Vec<Group>, StorageError> {
        let groups = self
            .groups
            .lock()
            .map_err(|e| StorageError::BackendError(format!("Lock error: {}", e)))?;

        let mut found: Vec<Group> = groups
            .values()
            .filter(|g| filter.matches(g))
            .cloned()
            .collect();
        found.sort_by_key(|g| g.exp_at);
        Ok(found)
    }

    async fn delete(&self, filter: &GroupFilter) -> Result<usize, StorageError> {
        let mut groups = self
            .groups
            .lock()
            .map_err(|e| StorageError::BackendError(format!("Lock error: {}", e)))?;

        let before = groups.len();
        groups.retain(|_, g| !filter.matches(g));
        Ok(before - groups.len())
    }
}
