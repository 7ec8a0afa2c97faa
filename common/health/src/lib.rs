//! Liveness reporting for the long-running loops of a service.
//!
//! Each loop registers a component with a `HealthRegistry` and receives a
//! `HealthHandle`. The loop must report healthy more often than its deadline;
//! a component that stops reporting is marked `Stalled`. The process is healthy
//! only when every registered component is.
use std::collections::HashMap;
use std::ops::Add;
use std::sync::{Arc, RwLock};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use time::{Duration, OffsetDateTime};
use tracing::{info, warn};

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ComponentStatus {
    /// Set on registration, until the first report.
    Starting,
    /// Reported healthy, must report again before the deadline.
    HealthyUntil(OffsetDateTime),
    /// Reported unhealthy.
    Unhealthy,
    /// The `HealthyUntil` deadline went by without a new report.
    Stalled,
}

#[derive(Default, Debug)]
pub struct HealthStatus {
    pub healthy: bool,
    pub components: HashMap<String, ComponentStatus>,
}

impl IntoResponse for HealthStatus {
    fn into_response(self) -> Response {
        let body = format!("{:?}", self);
        let status = if self.healthy {
            StatusCode::OK
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        (status, body).into_response()
    }
}

type Components = Arc<RwLock<HashMap<String, ComponentStatus>>>;

#[derive(Clone)]
pub struct HealthHandle {
    component: String,
    deadline: Duration,
    components: Components,
}

impl HealthHandle {
    /// Report healthy until now + deadline.
    pub fn report_healthy(&self) {
        self.report_status(ComponentStatus::HealthyUntil(
            OffsetDateTime::now_utc().add(self.deadline),
        ))
    }

    pub fn report_status(&self, status: ComponentStatus) {
        match self.components.write() {
            Ok(mut components) => {
                components.insert(self.component.clone(), status);
            }
            Err(_) => warn!("poisoned HealthRegistry lock, dropping status report"),
        }
    }
}

#[derive(Clone)]
pub struct HealthRegistry {
    name: String,
    components: Components,
}

impl HealthRegistry {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            components: Default::default(),
        }
    }

    /// Register a component. The returned handle should be moved into the
    /// loop it watches.
    pub fn register(&self, component: String, deadline: Duration) -> HealthHandle {
        let handle = HealthHandle {
            component,
            deadline,
            components: self.components.clone(),
        };
        handle.report_status(ComponentStatus::Starting);
        handle
    }

    /// Overall status, usable directly as an axum handler body.
    pub fn get_status(&self) -> HealthStatus {
        let now = OffsetDateTime::now_utc();
        let mut status = HealthStatus::default();

        let Ok(components) = self.components.read() else {
            warn!("poisoned HealthRegistry lock, reporting unhealthy");
            return status;
        };

        // No component registered yet means nothing is running.
        status.healthy = !components.is_empty();
        for (name, component_status) in components.iter() {
            let effective = match component_status {
                ComponentStatus::HealthyUntil(until) if *until > now => component_status.clone(),
                ComponentStatus::HealthyUntil(_) => ComponentStatus::Stalled,
                other => other.clone(),
            };
            if !matches!(effective, ComponentStatus::HealthyUntil(_)) {
                status.healthy = false;
            }
            status.components.insert(name.clone(), effective);
        }

        if status.healthy {
            info!("{} health check ok", self.name);
        } else {
            warn!("{} health check failed: {:?}", self.name, status.components);
        }
        status
    }
}
