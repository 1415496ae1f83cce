//! Health check module
//! Reports on the database and the registered payment providers

use serde::Serialize;
use std::collections::HashMap;
#[cfg(feature = "database")]
use std::time::{Duration, Instant};
#[cfg(feature = "database")]
use tokio::time::timeout;
#[cfg(feature = "database")]
use tracing::error;

use crate::payments::types::ProviderName;

#[derive(Debug, Serialize, Clone)]
pub struct HealthStatus {
    pub status: HealthState,
    pub checks: HashMap<String, ComponentHealth>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Serialize, Clone)]
pub struct ComponentHealth {
    pub status: ComponentState,
    pub response_time_ms: Option<u128>,
    pub details: Option<String>,
}

#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub enum ComponentState {
    Up,
    Down,
    Warning,
}

impl HealthStatus {
    pub fn new() -> Self {
        Self {
            status: HealthState::Healthy,
            checks: HashMap::new(),
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self.status, HealthState::Healthy)
    }

    fn record(&mut self, name: &str, component: ComponentHealth) {
        match component.status {
            ComponentState::Down => self.status = HealthState::Unhealthy,
            ComponentState::Warning if self.status == HealthState::Healthy => {
                self.status = HealthState::Degraded
            }
            _ => {}
        }
        self.checks.insert(name.to_string(), component);
    }
}

impl Default for HealthStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl ComponentHealth {
    pub fn up(response_time_ms: Option<u128>) -> Self {
        Self {
            status: ComponentState::Up,
            response_time_ms,
            details: None,
        }
    }

    pub fn down(details: Option<String>) -> Self {
        Self {
            status: ComponentState::Down,
            response_time_ms: None,
            details,
        }
    }

    pub fn warning(response_time_ms: Option<u128>, details: Option<String>) -> Self {
        Self {
            status: ComponentState::Warning,
            response_time_ms,
            details,
        }
    }
}

#[derive(Clone)]
pub struct HealthChecker {
    #[cfg(feature = "database")]
    db_pool: Option<sqlx::PgPool>,
    providers: Vec<ProviderName>,
}

impl HealthChecker {
    pub fn new(providers: Vec<ProviderName>) -> Self {
        Self {
            #[cfg(feature = "database")]
            db_pool: None,
            providers,
        }
    }

    #[cfg(feature = "database")]
    pub fn with_database(mut self, pool: sqlx::PgPool) -> Self {
        self.db_pool = Some(pool);
        self
    }

    pub async fn check_health(&self) -> HealthStatus {
        let mut health_status = HealthStatus::new();

        self.check_database(&mut health_status).await;

        let providers = if self.providers.is_empty() {
            ComponentHealth::warning(None, Some("no payment provider enabled".to_string()))
        } else {
            let names: Vec<&str> = self.providers.iter().map(|p| p.as_str()).collect();
            ComponentHealth {
                details: Some(names.join(",")),
                ..ComponentHealth::up(None)
            }
        };
        health_status.record("payment_providers", providers);

        health_status
    }

    #[cfg(feature = "database")]
    async fn check_database(&self, health_status: &mut HealthStatus) {
        let Some(pool) = &self.db_pool else {
            return;
        };
        let component = match timeout(Duration::from_secs(5), check_database_health(pool)).await {
            Ok(Ok(response_time)) => ComponentHealth::up(Some(response_time)),
            Ok(Err(e)) => {
                error!(error = %e, "Database health check failed");
                ComponentHealth::down(Some(e.to_string()))
            }
            Err(_) => {
                error!("Database health check timed out");
                ComponentHealth::down(Some("Timeout".to_string()))
            }
        };
        health_status.record("database", component);
    }

    #[cfg(not(feature = "database"))]
    async fn check_database(&self, _health_status: &mut HealthStatus) {}
}

#[cfg(feature = "database")]
pub async fn check_database_health(
    pool: &sqlx::PgPool,
) -> Result<u128, crate::database::error::DatabaseError> {
    let start = Instant::now();
    crate::database::health_check(pool).await?;
    Ok(start.elapsed().as_millis())
}
