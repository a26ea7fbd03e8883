//! Persistence for users, services, bans and the audit log.
//!
//! Every method is a single atomic read or write. Callers that need a
//! read-modify-write on one service hold that service's lock from the
//! supervisor while doing so.

mod sqlite;

pub use sqlite::SqliteStore;

use crate::model::{ActivityLogEntry, Ban, Service, ServiceStatus, User};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("service already exists: {0}")]
    Duplicate(String),
    #[error("service not found: {0}")]
    Missing(String),
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error("store lock poisoned")]
    Poisoned,
}

pub trait Store: Send + Sync {
    /// Returns the user, creating a default row on first sight.
    fn user(&self, user_id: i64) -> Result<User, StoreError>;
    fn set_premium(&self, user_id: i64, premium: bool) -> Result<(), StoreError>;
    /// Applies `delta` to the deployment counter, clamping at zero.
    fn adjust_deployment_count(&self, user_id: i64, delta: i64) -> Result<u32, StoreError>;

    fn insert_service(&self, service: &Service) -> Result<(), StoreError>;
    fn service(&self, service_id: &str) -> Result<Option<Service>, StoreError>;
    fn save_service(&self, service: &Service) -> Result<(), StoreError>;
    fn delete_service(&self, service_id: &str) -> Result<(), StoreError>;
    fn services_for_user(&self, user_id: i64) -> Result<Vec<Service>, StoreError>;
    fn services_with_status(&self, status: ServiceStatus) -> Result<Vec<Service>, StoreError>;
    fn assigned_ports(&self) -> Result<HashSet<u16>, StoreError>;

    fn ban(&self, ban: &Ban) -> Result<(), StoreError>;
    fn ban_for(&self, user_id: i64) -> Result<Option<Ban>, StoreError>;
    /// Lifts a ban. Returns whether one was in place.
    fn unban(&self, user_id: i64) -> Result<bool, StoreError>;

    fn log_activity(&self, entry: &ActivityLogEntry) -> Result<(), StoreError>;
    fn activity_for(&self, user_id: i64) -> Result<Vec<ActivityLogEntry>, StoreError>;
}

#[derive(Default)]
struct Tables {
    users: HashMap<i64, User>,
    services: BTreeMap<String, Service>,
    bans: HashMap<i64, Ban>,
    activity: Vec<ActivityLogEntry>,
}

/// Mutex-guarded maps, for tests and embedding without a database file.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tables>, StoreError> {
        self.tables.lock().map_err(|_| StoreError::Poisoned)
    }
}

impl Store for MemoryStore {
    fn user(&self, user_id: i64) -> Result<User, StoreError> {
        let mut t = self.lock()?;
        Ok(t.users
            .entry(user_id)
            .or_insert_with(|| User::new(user_id))
            .clone())
    }

    fn set_premium(&self, user_id: i64, premium: bool) -> Result<(), StoreError> {
        let mut t = self.lock()?;
        t.users
            .entry(user_id)
            .or_insert_with(|| User::new(user_id))
            .premium = premium;
        Ok(())
    }

    fn adjust_deployment_count(&self, user_id: i64, delta: i64) -> Result<u32, StoreError> {
        let mut t = self.lock()?;
        let user = t.users.entry(user_id).or_insert_with(|| User::new(user_id));
        let next = (i64::from(user.deployment_count) + delta).max(0);
        user.deployment_count = u32::try_from(next).unwrap_or(u32::MAX);
        Ok(user.deployment_count)
    }

    fn insert_service(&self, service: &Service) -> Result<(), StoreError> {
        let mut t = self.lock()?;
        if t.services.contains_key(&service.id)
            || t.services.values().any(|s| s.port == service.port)
        {
            return Err(StoreError::Duplicate(service.id.clone()));
        }
        t.services.insert(service.id.clone(), service.clone());
        Ok(())
    }

    fn service(&self, service_id: &str) -> Result<Option<Service>, StoreError> {
        Ok(self.lock()?.services.get(service_id).cloned())
    }

    fn save_service(&self, service: &Service) -> Result<(), StoreError> {
        let mut t = self.lock()?;
        match t.services.get_mut(&service.id) {
            Some(row) => {
                *row = service.clone();
                Ok(())
            }
            None => Err(StoreError::Missing(service.id.clone())),
        }
    }

    fn delete_service(&self, service_id: &str) -> Result<(), StoreError> {
        self.lock()?.services.remove(service_id);
        Ok(())
    }

    fn services_for_user(&self, user_id: i64) -> Result<Vec<Service>, StoreError> {
        Ok(self
            .lock()?
            .services
            .values()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect())
    }

    fn services_with_status(&self, status: ServiceStatus) -> Result<Vec<Service>, StoreError> {
        Ok(self
            .lock()?
            .services
            .values()
            .filter(|s| s.status == status)
            .cloned()
            .collect())
    }

    fn assigned_ports(&self) -> Result<HashSet<u16>, StoreError> {
        Ok(self.lock()?.services.values().map(|s| s.port).collect())
    }

    fn ban(&self, ban: &Ban) -> Result<(), StoreError> {
        self.lock()?.bans.insert(ban.user_id, ban.clone());
        Ok(())
    }

    fn ban_for(&self, user_id: i64) -> Result<Option<Ban>, StoreError> {
        Ok(self.lock()?.bans.get(&user_id).cloned())
    }

    fn unban(&self, user_id: i64) -> Result<bool, StoreError> {
        Ok(self.lock()?.bans.remove(&user_id).is_some())
    }

    fn log_activity(&self, entry: &ActivityLogEntry) -> Result<(), StoreError> {
        self.lock()?.activity.push(entry.clone());
        Ok(())
    }

    fn activity_for(&self, user_id: i64) -> Result<Vec<ActivityLogEntry>, StoreError> {
        Ok(self
            .lock()?
            .activity
            .iter()
            .filter(|e| e.user_id == user_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
pub(crate) fn sample_service(id: &str, user_id: i64, port: u16) -> Service {
    use crate::model::ProjectType;
    let now = chrono::Utc::now();
    Service {
        id: id.to_string(),
        user_id,
        port,
        status: ServiceStatus::Running,
        project_type: ProjectType::Static,
        path: format!("/srv/{id}"),
        created_at: now,
        last_restart: now,
        domain: None,
        domain_token: None,
        domain_verified: false,
    }
}
