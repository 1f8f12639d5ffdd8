//! Registry of messaging client factories.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use super::client::MessagingClientFactory;

/// Factories currently available, by messaging type.
#[derive(Default)]
pub struct MessagingFactoryRegistry {
    factories: RwLock<HashMap<String, Arc<dyn MessagingClientFactory>>>,
}

impl MessagingFactoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a factory. Returns the one it replaced, if any.
    pub fn register(
        &self,
        factory: Arc<dyn MessagingClientFactory>,
    ) -> Option<Arc<dyn MessagingClientFactory>> {
        self.factories
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(factory.messaging_type().to_string(), factory)
    }

    pub fn unregister(&self, messaging_type: &str) -> Option<Arc<dyn MessagingClientFactory>> {
        self.factories
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(messaging_type)
    }

    pub fn get(&self, messaging_type: &str) -> Option<Arc<dyn MessagingClientFactory>> {
        self.factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(messaging_type)
            .cloned()
    }

    pub fn messaging_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        types.sort();
        types
    }
}
