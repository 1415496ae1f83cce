use crate::payments::error::{PaymentError, PaymentResult};
use crate::payments::provider::PaymentProvider;
use crate::payments::providers::{MidtransConfig, MidtransProvider, XenditConfig, XenditProvider};
use crate::payments::types::{Environment, ProviderName};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;

/// Startup configuration of a single provider.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub name: String,
    pub enabled: bool,
    pub environment: Environment,
    pub credentials: HashMap<String, String>,
}

/// Configured adapters keyed by provider, built once at startup and read-only afterwards.
pub struct AdapterRegistry {
    providers: HashMap<ProviderName, Arc<dyn PaymentProvider>>,
    order: Vec<ProviderName>,
}

impl AdapterRegistry {
    /// Builds every enabled provider; a bad entry aborts the whole build so the
    /// process never starts with a half-initialized adapter.
    pub fn from_configs(configs: &[ProviderConfig]) -> PaymentResult<Self> {
        let mut adapters: Vec<Arc<dyn PaymentProvider>> = Vec::new();
        for config in configs {
            if !config.enabled {
                info!(provider = %config.name, "payment provider disabled, skipping");
                continue;
            }

            let name = ProviderName::from_str(&config.name)?;
            let adapter: Arc<dyn PaymentProvider> = match name {
                ProviderName::Midtrans => Arc::new(MidtransProvider::new(
                    MidtransConfig::from_credentials(config.environment, &config.credentials)?,
                )?),
                ProviderName::Xendit => Arc::new(XenditProvider::new(
                    XenditConfig::from_credentials(config.environment, &config.credentials)?,
                )?),
            };
            info!(
                provider = %name,
                environment = ?config.environment,
                "payment provider registered"
            );
            adapters.push(adapter);
        }
        Self::with_providers(adapters)
    }

    /// Registers already-built adapters in the given order.
    pub fn with_providers(adapters: Vec<Arc<dyn PaymentProvider>>) -> PaymentResult<Self> {
        let mut providers = HashMap::new();
        let mut order = Vec::new();
        for adapter in adapters {
            let name = adapter.name();
            if providers.contains_key(&name) {
                return Err(PaymentError::ValidationError {
                    message: format!("provider {} registered twice", name),
                    field: Some("provider".to_string()),
                });
            }
            order.push(name.clone());
            providers.insert(name, adapter);
        }
        Ok(Self { providers, order })
    }

    pub fn get(&self, provider: &ProviderName) -> PaymentResult<Arc<dyn PaymentProvider>> {
        self.providers
            .get(provider)
            .cloned()
            .ok_or(PaymentError::NotConfigured {
                provider: provider.to_string(),
            })
    }

    pub fn get_by_name(&self, provider: &str) -> PaymentResult<Arc<dyn PaymentProvider>> {
        let name = ProviderName::from_str(provider).map_err(|_| PaymentError::NotConfigured {
            provider: provider.to_string(),
        })?;
        self.get(&name)
    }

    /// First registered provider. Money-moving callers should name their provider instead.
    pub fn default_provider(&self) -> PaymentResult<Arc<dyn PaymentProvider>> {
        let first = self.order.first().ok_or(PaymentError::NotConfigured {
            provider: "default".to_string(),
        })?;
        self.get(first)
    }

    pub fn list_available_providers(&self) -> Vec<ProviderName> {
        self.order.clone()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
