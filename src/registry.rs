use crate::error::DeployError;
use crate::model::{Actor, Service, ServiceStatus};
use crate::store::Store;
use chrono::{DateTime, TimeDelta, Utc};
use std::sync::Arc;

/// Lifecycle state and persisted record of every service.
///
/// All status changes go through [`ServiceRegistry::transition`], which rejects
/// moves the state machine does not allow and refreshes `last_restart` whenever
/// a service enters `running`.
#[derive(Clone)]
pub struct ServiceRegistry {
    store: Arc<dyn Store>,
}

impl ServiceRegistry {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn find(&self, service_id: &str) -> Result<Option<Service>, DeployError> {
        Ok(self.store.service(service_id)?)
    }

    pub fn get(&self, service_id: &str) -> Result<Service, DeployError> {
        self.find(service_id)?
            .ok_or_else(|| DeployError::NotFound(service_id.to_string()))
    }

    /// Loads a service the actor may act on: its owner, or any admin.
    pub fn authorized(&self, actor: Actor, service_id: &str) -> Result<Service, DeployError> {
        match self.find(service_id)? {
            Some(s) if actor.admin || s.user_id == actor.user_id => Ok(s),
            Some(_) => Err(DeployError::AuthorizationFailed(service_id.to_string())),
            None if actor.admin => Err(DeployError::NotFound(service_id.to_string())),
            // Non-owners cannot tell a missing id from someone else's
            None => Err(DeployError::AuthorizationFailed(service_id.to_string())),
        }
    }

    pub fn create(&self, service: &Service) -> Result<(), DeployError> {
        Ok(self.store.insert_service(service)?)
    }

    pub fn save(&self, service: &Service) -> Result<(), DeployError> {
        Ok(self.store.save_service(service)?)
    }

    pub fn remove(&self, service_id: &str) -> Result<(), DeployError> {
        Ok(self.store.delete_service(service_id)?)
    }

    /// Checks that `service` may move to `next` without persisting anything.
    pub fn check(
        &self,
        service: &Service,
        next: ServiceStatus,
        op: &'static str,
    ) -> Result<(), DeployError> {
        if service.status.can_transition_to(next) {
            Ok(())
        } else {
            Err(DeployError::InvalidState {
                id: service.id.clone(),
                op,
                status: service.status,
            })
        }
    }

    /// Persists `next` for the service, re-reading the row first so a
    /// concurrent change is judged against the current state.
    pub fn transition(
        &self,
        service_id: &str,
        next: ServiceStatus,
        op: &'static str,
    ) -> Result<Service, DeployError> {
        let mut service = self.get(service_id)?;
        self.check(&service, next, op)?;
        service.status = next;
        if next == ServiceStatus::Running {
            service.last_restart = advance(service.last_restart);
        }
        self.store.save_service(&service)?;
        Ok(service)
    }

    /// Refreshes `last_restart` of a service that stays `running`.
    pub fn touch_restart(&self, service_id: &str) -> Result<Service, DeployError> {
        let mut service = self.get(service_id)?;
        service.last_restart = advance(service.last_restart);
        self.store.save_service(&service)?;
        Ok(service)
    }

    pub fn running(&self) -> Result<Vec<Service>, DeployError> {
        Ok(self.store.services_with_status(ServiceStatus::Running)?)
    }

    pub fn owned_by(&self, user_id: i64) -> Result<Vec<Service>, DeployError> {
        Ok(self.store.services_for_user(user_id)?)
    }
}

/// `now`, but never earlier than one microsecond past `previous`.
fn advance(previous: DateTime<Utc>) -> DateTime<Utc> {
    let now = Utc::now();
    let floor = previous + TimeDelta::microseconds(1);
    if now > floor { now } else { floor }
}
