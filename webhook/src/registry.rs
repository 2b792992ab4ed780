//! Process-wide trigger registry: a deep-copied snapshot of every
//! `WebhookTrigger` spec, keyed by `(namespace, name)`, kept in sync by the
//! `WebhookTrigger` reconciler. Many readers (request handlers), one writer
//! (the reconciler) at a time.

use std::{collections::HashMap, sync::Arc};

use tokio::sync::RwLock;

use kubetask_types::WebhookTriggerSpec;

pub type TriggerKey = (String, String);

#[derive(Clone, Default)]
pub struct Registry {
    inner: Arc<RwLock<HashMap<TriggerKey, WebhookTriggerSpec>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, namespace: &str, name: &str, spec: WebhookTriggerSpec) {
        self.inner
            .write()
            .await
            .insert((namespace.to_string(), name.to_string()), spec);
    }

    pub async fn unregister(&self, namespace: &str, name: &str) {
        self.inner
            .write()
            .await
            .remove(&(namespace.to_string(), name.to_string()));
    }

    pub async fn get(&self, namespace: &str, name: &str) -> Option<WebhookTriggerSpec> {
        self.inner
            .read()
            .await
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_then_get_roundtrips() {
        let registry = Registry::new();
        registry
            .register("default", "t1", WebhookTriggerSpec::default())
            .await;
        assert!(registry.get("default", "t1").await.is_some());
        assert!(registry.get("default", "missing").await.is_none());
    }

    #[tokio::test]
    async fn unregister_removes_entry() {
        let registry = Registry::new();
        registry
            .register("default", "t1", WebhookTriggerSpec::default())
            .await;
        registry.unregister("default", "t1").await;
        assert!(registry.get("default", "t1").await.is_none());
    }
}
