//! Per-side record of named subscriptions
//!
//! The registry is the source of truth for what a side should be subscribed
//! to. After a reconnect it re-installs every recorded subscription on the
//! connector; subscriptions that cannot be re-installed are dropped from
//! the registry and handed back so the caller can retry them.

use crate::error::{BrokerError, Result};
use crate::routes::Side;
use fedbroker_core_interface::{Connector, Delivery};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn, Span};

/// Parameters a subscription was installed with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionSpec {
    pub name: String,
    pub subject: String,
    pub group: String,
    pub capacity: usize,
}

struct Entry {
    spec: SubscriptionSpec,
    delivery: Delivery,
}

pub struct SubscriptionRegistry {
    side: Side,
    connector: Arc<dyn Connector>,
    entries: BTreeMap<String, Entry>,
    span: Span,
}

impl SubscriptionRegistry {
    pub fn new(side: Side, connector: Arc<dyn Connector>, span: Span) -> Self {
        Self {
            side,
            connector,
            entries: BTreeMap::new(),
            span,
        }
    }

    pub fn connector(&self) -> &Arc<dyn Connector> {
        &self.connector
    }

    /// Subscribe `name`, returning its delivery handle
    ///
    /// Identical parameters return the existing handle without touching the
    /// transport. Different parameters tear the old subscription down first.
    pub async fn add(
        &mut self,
        name: &str,
        subject: &str,
        group: &str,
        capacity: usize,
    ) -> Result<Delivery> {
        let spec = SubscriptionSpec {
            name: name.to_string(),
            subject: subject.to_string(),
            group: group.to_string(),
            capacity,
        };

        if let Some(entry) = self.entries.get(name) {
            if entry.spec == spec {
                return Ok(entry.delivery.clone());
            }

            debug!(
                parent: &self.span,
                name,
                old_subject = %entry.spec.subject,
                subject,
                "Replacing subscription"
            );
            self.remove(name).await?;
        }

        let delivery = self.install(&spec).await?;
        self.entries.insert(
            spec.name.clone(),
            Entry {
                spec,
                delivery: delivery.clone(),
            },
        );

        Ok(delivery)
    }

    /// Unsubscribe and forget `name`; unknown names are fine
    pub async fn remove(&mut self, name: &str) -> Result<()> {
        if self.entries.remove(name).is_none() {
            return Ok(());
        }

        self.connector
            .unsubscribe(name)
            .await
            .map_err(|source| BrokerError::Subscription {
                name: name.to_string(),
                source,
            })
    }

    /// Names in sorted order
    pub fn list(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn get(&self, name: &str) -> Option<Delivery> {
        self.entries.get(name).map(|entry| entry.delivery.clone())
    }

    pub fn spec(&self, name: &str) -> Option<&SubscriptionSpec> {
        self.entries.get(name).map(|entry| &entry.spec)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Re-install every subscription on `connector`
    ///
    /// Entries that fail are removed and returned.
    pub async fn rebuild(&mut self, connector: Arc<dyn Connector>) -> Vec<SubscriptionSpec> {
        self.connector = connector;

        let mut failed = Vec::new();
        let entries = std::mem::take(&mut self.entries);

        for (name, entry) in entries {
            match self.install(&entry.spec).await {
                Ok(delivery) => {
                    self.entries.insert(
                        name,
                        Entry {
                            spec: entry.spec,
                            delivery,
                        },
                    );
                }
                Err(e) => {
                    warn!(parent: &self.span, name = %name, error = %e, "Could not restore subscription");
                    failed.push(entry.spec);
                }
            }
        }

        debug!(
            parent: &self.span,
            restored = self.entries.len(),
            failed = failed.len(),
            "Subscriptions rebuilt"
        );

        failed
    }

    /// Unsubscribe everything; errors are logged and skipped
    pub async fn clear(&mut self) {
        let entries = std::mem::take(&mut self.entries);
        for name in entries.keys() {
            if let Err(e) = self.connector.unsubscribe(name).await {
                warn!(parent: &self.span, name = %name, error = %e, "Unsubscribe failed");
            }
        }
    }

    async fn install(&self, spec: &SubscriptionSpec) -> Result<Delivery> {
        debug!(
            parent: &self.span,
            side = %self.side,
            name = %spec.name,
            subject = %spec.subject,
            group = %spec.group,
            "Subscribing"
        );

        self.connector
            .chan_queue_subscribe(&spec.name, &spec.subject, &spec.group, spec.capacity)
            .await
            .map_err(|source| BrokerError::Subscription {
                name: spec.name.clone(),
                source,
            })
    }
}
