//! Webhook subscription registry
//!
//! Readers take an `Arc` snapshot of the whole table and never hold a lock while
//! delivering. Every mutation clones the table, applies the change and swaps the
//! snapshot in.

use chrono::{DateTime, Utc};
use health::Severity;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RegistryError {
    #[error("Invalid subscription: {reason}")]
    InvalidSubscription { reason: String },

    #[error("Subscription not found: {id}")]
    NotFound { id: String },
}

pub type RegistryResult<T> = Result<T, RegistryError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Post,
    Put,
    Patch,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn all_severities() -> BTreeSet<Severity> {
    [Severity::Info, Severity::Warning, Severity::Critical]
        .into_iter()
        .collect()
}

fn default_enabled() -> bool {
    true
}

/// Create/update payload for a subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionDraft {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub http_method: HttpMethod,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Severities this endpoint wants. Defaults to all of them.
    #[serde(default = "all_severities")]
    pub alert_types: BTreeSet<Severity>,
}

impl SubscriptionDraft {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            http_method: HttpMethod::default(),
            headers: BTreeMap::new(),
            enabled: true,
            alert_types: all_severities(),
        }
    }

    pub fn with_method(mut self, method: HttpMethod) -> Self {
        self.http_method = method;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_severities(mut self, severities: impl IntoIterator<Item = Severity>) -> Self {
        self.alert_types = severities.into_iter().collect();
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn validate(&self) -> RegistryResult<()> {
        let invalid = |reason: &str| RegistryError::InvalidSubscription {
            reason: reason.to_string(),
        };

        if self.name.trim().is_empty() {
            return Err(invalid("name is required"));
        }

        if self.url.trim().is_empty() {
            return Err(invalid("url is required"));
        }

        let url = Url::parse(self.url.trim()).map_err(|e| RegistryError::InvalidSubscription {
            reason: format!("malformed url: {}", e),
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(RegistryError::InvalidSubscription {
                reason: format!("unsupported url scheme {}", url.scheme()),
            });
        }
        if url.host_str().map_or(true, str::is_empty) {
            return Err(invalid("url must include a host"));
        }

        if self.alert_types.is_empty() {
            return Err(invalid("at least one alert severity is required"));
        }

        let mut seen = HashSet::new();
        for name in self.headers.keys() {
            if name.trim().is_empty() {
                return Err(invalid("header names cannot be empty"));
            }
            if !seen.insert(name.to_ascii_lowercase()) {
                return Err(RegistryError::InvalidSubscription {
                    reason: format!("duplicate header: {}", name),
                });
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookSubscription {
    pub id: String,
    pub name: String,
    pub url: String,
    pub http_method: HttpMethod,
    pub headers: BTreeMap<String, String>,
    pub enabled: bool,
    pub alert_types: BTreeSet<Severity>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WebhookSubscription {
    pub fn wants(&self, severity: Severity) -> bool {
        self.enabled && self.alert_types.contains(&severity)
    }
}

pub type SubscriptionTable = BTreeMap<String, WebhookSubscription>;

#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    table: RwLock<Arc<SubscriptionTable>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current table. Later mutations do not affect a snapshot already taken.
    pub fn snapshot(&self) -> Arc<SubscriptionTable> {
        self.table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn mutate<T>(
        &self,
        change: impl FnOnce(&mut SubscriptionTable) -> RegistryResult<T>,
    ) -> RegistryResult<T> {
        let mut guard = self.table.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = SubscriptionTable::clone(&guard);
        let result = change(&mut next)?;
        *guard = Arc::new(next);
        Ok(result)
    }

    pub fn create(&self, draft: SubscriptionDraft) -> RegistryResult<WebhookSubscription> {
        draft.validate()?;
        let now = Utc::now();
        let subscription = WebhookSubscription {
            id: Uuid::new_v4().to_string(),
            name: draft.name.trim().to_string(),
            url: draft.url.trim().to_string(),
            http_method: draft.http_method,
            headers: draft.headers,
            enabled: draft.enabled,
            alert_types: draft.alert_types,
            created_at: now,
            updated_at: now,
        };

        self.mutate(|table| {
            table.insert(subscription.id.clone(), subscription.clone());
            Ok(())
        })?;
        info!(
            "Registered webhook subscription {} ({})",
            subscription.name, subscription.id
        );
        Ok(subscription)
    }

    pub fn update(
        &self,
        id: &str,
        draft: SubscriptionDraft,
    ) -> RegistryResult<WebhookSubscription> {
        draft.validate()?;
        self.mutate(|table| {
            let existing = table.get_mut(id).ok_or_else(|| RegistryError::NotFound {
                id: id.to_string(),
            })?;
            existing.name = draft.name.trim().to_string();
            existing.url = draft.url.trim().to_string();
            existing.http_method = draft.http_method;
            existing.headers = draft.headers;
            existing.enabled = draft.enabled;
            existing.alert_types = draft.alert_types;
            existing.updated_at = Utc::now();
            Ok(existing.clone())
        })
    }

    pub fn set_enabled(&self, id: &str, enabled: bool) -> RegistryResult<WebhookSubscription> {
        self.mutate(|table| {
            let existing = table.get_mut(id).ok_or_else(|| RegistryError::NotFound {
                id: id.to_string(),
            })?;
            existing.enabled = enabled;
            existing.updated_at = Utc::now();
            Ok(existing.clone())
        })
    }

    pub fn delete(&self, id: &str) -> RegistryResult<WebhookSubscription> {
        let removed = self.mutate(|table| {
            table.remove(id).ok_or_else(|| RegistryError::NotFound {
                id: id.to_string(),
            })
        })?;
        info!("Removed webhook subscription {} ({})", removed.name, removed.id);
        Ok(removed)
    }

    pub fn get(&self, id: &str) -> RegistryResult<WebhookSubscription> {
        self.snapshot()
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound { id: id.to_string() })
    }

    pub fn list(&self) -> Vec<WebhookSubscription> {
        let mut subscriptions: Vec<WebhookSubscription> =
            self.snapshot().values().cloned().collect();
        subscriptions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.name.cmp(&b.name)));
        subscriptions
    }

    /// Enabled subscriptions that accept `severity`.
    pub fn matching(&self, severity: Severity) -> Vec<WebhookSubscription> {
        self.snapshot()
            .values()
            .filter(|s| s.wants(severity))
            .cloned()
            .collect()
    }

    /// Whether the subscription still exists and is enabled.
    pub fn is_active(&self, id: &str) -> bool {
        self.snapshot().get(id).map(|s| s.enabled).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft(name: &str) -> SubscriptionDraft {
        SubscriptionDraft::new(name, "https://hooks.example.com/alerts")
    }

    #[test]
    fn test_create_and_get() {
        let registry = SubscriptionRegistry::new();
        let created = registry
            .create(draft("ops").with_header("Authorization", "Bearer token"))
            .unwrap();

        let fetched = registry.get(&created.id).unwrap();
        assert_eq!(fetched, created);
        assert_eq!(fetched.http_method, HttpMethod::Post);
        assert_eq!(fetched.alert_types.len(), 3);
        assert!(registry.is_active(&created.id));
    }

    #[test]
    fn test_validation() {
        let registry = SubscriptionRegistry::new();
        assert!(registry.create(draft("  ")).is_err());
        assert!(registry
            .create(SubscriptionDraft::new("ops", "hooks.example.com"))
            .is_err());
        assert!(registry
            .create(SubscriptionDraft::new("ops", "https://"))
            .is_err());
        assert!(registry
            .create(SubscriptionDraft::new("ops", "ftp://hooks.example.com/fip"))
            .is_err());
        assert!(registry.list().is_empty());
    }

    #[test]
    fn test_malformed_url_is_rejected_on_create_and_update() {
        let registry = SubscriptionRegistry::new();
        let err = registry
            .create(SubscriptionDraft::new("ops", "http://exa mple.com/hook"))
            .unwrap_err();
        assert!(err.to_string().contains("malformed url"));

        let created = registry.create(draft("ops")).unwrap();
        assert!(registry
            .update(&created.id, SubscriptionDraft::new("ops", "https://hooks example/fip"))
            .is_err());
        assert_eq!(registry.get(&created.id).unwrap().url, created.url);
        assert!(registry.create(draft("ops").with_severities([])).is_err());
        assert!(registry
            .create(
                draft("ops")
                    .with_header("X-Token", "a")
                    .with_header("x-token", "b")
            )
            .is_err());
        assert!(registry.list().is_empty());
    }

    #[test]
    fn test_snapshots_are_isolated_from_mutation() {
        let registry = SubscriptionRegistry::new();
        let created = registry.create(draft("ops")).unwrap();
        let before = registry.snapshot();

        registry.delete(&created.id).unwrap();

        assert!(before.contains_key(&created.id));
        assert!(registry.snapshot().is_empty());
        assert!(!registry.is_active(&created.id));
    }

    #[test]
    fn test_update_and_disable() {
        let registry = SubscriptionRegistry::new();
        let created = registry.create(draft("ops")).unwrap();

        let updated = registry
            .update(
                &created.id,
                draft("ops-critical").with_severities([Severity::Critical]),
            )
            .unwrap();
        assert_eq!(updated.id, created.id);
        assert_eq!(updated.name, "ops-critical");
        assert!(registry.matching(Severity::Warning).is_empty());
        assert_eq!(registry.matching(Severity::Critical).len(), 1);

        registry.set_enabled(&created.id, false).unwrap();
        assert!(registry.matching(Severity::Critical).is_empty());
        assert!(!registry.is_active(&created.id));
    }

    #[test]
    fn test_missing_ids() {
        let registry = SubscriptionRegistry::new();
        assert_eq!(
            registry.delete("nope"),
            Err(RegistryError::NotFound {
                id: "nope".to_string()
            })
        );
        assert!(registry.update("nope", draft("ops")).is_err());
        assert!(registry.get("nope").is_err());
    }

    #[test]
    fn test_draft_deserializes_with_defaults() {
        let draft: SubscriptionDraft =
            serde_json::from_str(r#"{"name":"ops","url":"http://localhost:9000/hook"}"#).unwrap();
        assert!(draft.enabled);
        assert_eq!(draft.http_method, HttpMethod::Post);
        assert_eq!(draft.alert_types.len(), 3);
        assert!(draft.validate().is_ok());
    }
}
