use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use std::collections::HashMap;
use std::ops::Add;
use std::sync::{Arc, RwLock};

use time::Duration;
use tokio::sync::mpsc;
use tracing::warn;

/// Health reporting for the components of the service.
///
/// The process only deserves a 200 if every registered component is in a
/// good state: the consumer loop proves liveness by reporting on a
/// deadline, while the writer reports an explicit good/bad status after
/// each submission (open breaker with no successful write yet means bad).
/// A component that stops reporting before its deadline is considered
/// stalled and fails the check.

#[derive(Default, Debug)]
pub struct HealthStatus {
    /// The overall status: true if all components are healthy.
    pub healthy: bool,
    /// Current status of each registered component, for display.
    pub components: HashMap<String, ComponentStatus>,
}

impl IntoResponse for HealthStatus {
    /// Computes the status code from the overall health status and prints
    /// each component status in the body for debugging.
    fn into_response(self) -> Response {
        let body = format!("{:?}", self);
        match self.healthy {
            true => (StatusCode::OK, body),
            false => (StatusCode::SERVICE_UNAVAILABLE, body),
        }
        .into_response()
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ComponentStatus {
    /// Automatically set when a component is newly registered.
    Starting,
    /// Healthy with no reporting deadline; for event-driven components.
    Healthy,
    /// Recently reported healthy, will need to report again before the date.
    HealthyUntil(time::OffsetDateTime),
    /// Reported unhealthy.
    Unhealthy,
    /// Automatically set when the HealthyUntil deadline is reached.
    Stalled,
}

struct HealthMessage {
    component: String,
    status: ComponentStatus,
}

pub struct HealthHandle {
    component: String,
    deadline: Duration,
    sender: mpsc::Sender<HealthMessage>,
}

impl HealthHandle {
    /// Report healthy with a deadline. Must be called more frequently than
    /// the deadline configured at registration.
    pub async fn report_healthy(&self) {
        self.report_status(ComponentStatus::HealthyUntil(
            time::OffsetDateTime::now_utc().add(self.deadline),
        ))
        .await
    }

    /// Report an arbitrary component status, returns when the message is queued.
    pub async fn report_status(&self, status: ComponentStatus) {
        let message = HealthMessage {
            component: self.component.clone(),
            status,
        };
        if let Err(err) = self.sender.send(message).await {
            warn!("failed to report health status: {}", err)
        }
    }
}

#[derive(Clone)]
pub struct HealthRegistry {
    name: String,
    components: Arc<RwLock<HashMap<String, ComponentStatus>>>,
    sender: mpsc::Sender<HealthMessage>,
}

impl HealthRegistry {
    pub fn new(name: &str) -> Self {
        let (tx, mut rx) = mpsc::channel::<HealthMessage>(16);
        let registry = Self {
            name: name.to_owned(),
            components: Default::default(),
            sender: tx,
        };

        let components = registry.components.clone();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if let Ok(mut map) = components.write() {
                    _ = map.insert(message.component, message.status);
                } else {
                    // Poisoned mutex: just warn, the probes will fail and
                    // the orchestrator will restart the process.
                    warn!("poisoned HealthRegistry mutex")
                }
            }
        });

        registry
    }

    /// Registers a new component. The returned handle should be passed to
    /// the component so it can report its health status.
    pub async fn register(&self, component: String, deadline: Duration) -> HealthHandle {
        let handle = HealthHandle {
            component,
            deadline,
            sender: self.sender.clone(),
        };
        handle.report_status(ComponentStatus::Starting).await;
        handle
    }

    /// Returns the overall process status, computed from the status of all
    /// registered components. Usable as an axum handler.
    pub fn get_status(&self) -> HealthStatus {
        let components = self
            .components
            .read()
            .expect("poisoned HealthRegistry mutex");

        let mut result = HealthStatus {
            healthy: !components.is_empty(), // unhealthy until a component registers
            components: Default::default(),
        };
        let now = time::OffsetDateTime::now_utc();

        for (name, status) in components.iter() {
            match status {
                ComponentStatus::Healthy => {
                    _ = result.components.insert(name.clone(), status.clone());
                }
                ComponentStatus::HealthyUntil(until) => {
                    if until.gt(&now) {
                        _ = result.components.insert(name.clone(), status.clone());
                    } else {
                        result.healthy = false;
                        _ = result
                            .components
                            .insert(name.clone(), ComponentStatus::Stalled);
                    }
                }
                _ => {
                    result.healthy = false;
                    _ = result.components.insert(name.clone(), status.clone());
                }
            }
        }
        if !result.healthy {
            warn!("{} health check failed: {:?}", self.name, result.components);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use std::ops::Sub;
    use time::OffsetDateTime;

    async fn assert_or_retry<F>(check: F)
    where
        F: Fn() -> bool,
    {
        let deadline = OffsetDateTime::now_utc().add(Duration::seconds(5));
        while !check() && OffsetDateTime::now_utc().lt(&deadline) {
            tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
        }
        assert!(check())
    }

    #[tokio::test]
    async fn defaults_to_unhealthy() {
        let registry = HealthRegistry::new("liveness");
        assert!(!registry.get_status().healthy);
    }

    #[tokio::test]
    async fn deadline_component_reports_and_stalls() {
        let registry = HealthRegistry::new("liveness");
        let handle = registry
            .register("loop".to_string(), Duration::seconds(30))
            .await;
        assert_or_retry(|| registry.get_status().components.len() == 1).await;
        assert!(!registry.get_status().healthy);

        handle.report_healthy().await;
        assert_or_retry(|| registry.get_status().healthy).await;

        // An expired deadline marks the component stalled.
        handle
            .report_status(ComponentStatus::HealthyUntil(
                OffsetDateTime::now_utc().sub(Duration::seconds(1)),
            ))
            .await;
        assert_or_retry(|| !registry.get_status().healthy).await;
        assert_eq!(
            registry.get_status().components.get("loop"),
            Some(&ComponentStatus::Stalled)
        );
    }

    #[tokio::test]
    async fn event_driven_component_has_no_deadline() {
        let registry = HealthRegistry::new("liveness");
        let handle = registry
            .register("writer".to_string(), Duration::seconds(0))
            .await;

        handle.report_status(ComponentStatus::Healthy).await;
        assert_or_retry(|| registry.get_status().healthy).await;

        handle.report_status(ComponentStatus::Unhealthy).await;
        assert_or_retry(|| !registry.get_status().healthy).await;

        handle.report_status(ComponentStatus::Healthy).await;
        assert_or_retry(|| registry.get_status().healthy).await;
    }

    #[tokio::test]
    async fn any_unhealthy_component_fails_the_check() {
        let registry = HealthRegistry::new("liveness");
        let one = registry
            .register("one".to_string(), Duration::seconds(30))
            .await;
        let two = registry
            .register("two".to_string(), Duration::seconds(30))
            .await;
        assert_or_retry(|| registry.get_status().components.len() == 2).await;

        one.report_healthy().await;
        assert_or_retry(|| {
            registry.get_status().components.get("one") != Some(&ComponentStatus::Starting)
        })
        .await;
        assert!(!registry.get_status().healthy);

        two.report_status(ComponentStatus::Healthy).await;
        assert_or_retry(|| registry.get_status().healthy).await;

        two.report_status(ComponentStatus::Unhealthy).await;
        assert_or_retry(|| !registry.get_status().healthy).await;
    }

    #[tokio::test]
    async fn into_response() {
        let nok = HealthStatus::default().into_response();
        assert_eq!(nok.status(), StatusCode::SERVICE_UNAVAILABLE);

        let ok = HealthStatus {
            healthy: true,
            components: Default::default(),
        }
        .into_response();
        assert_eq!(ok.status(), StatusCode::OK);
    }
}
