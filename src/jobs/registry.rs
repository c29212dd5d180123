//! Factory registry for named job types.

use std::collections::HashMap;
use std::sync::Arc;

use super::DataJob;

type JobFactory = Arc<dyn Fn() -> Box<dyn DataJob> + Send + Sync>;

/// Maps a class identity (e.g. `BackfillUserNames`) to a job constructor.
#[derive(Clone, Default)]
pub struct JobRegistry {
    factories: HashMap<String, JobFactory>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, identity: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn() -> Box<dyn DataJob> + Send + Sync + 'static,
    {
        self.factories.insert(identity.into(), Arc::new(factory));
        self
    }

    /// Builder-style `register`.
    pub fn with<F>(mut self, identity: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> Box<dyn DataJob> + Send + Sync + 'static,
    {
        self.register(identity, factory);
        self
    }

    /// A fresh instance for `identity`, if registered.
    pub fn create(&self, identity: &str) -> Option<Box<dyn DataJob>> {
        self.factories.get(identity).map(|factory| factory())
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.factories.contains_key(identity)
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl std::fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut identities: Vec<_> = self.factories.keys().collect();
        identities.sort();
        f.debug_struct("JobRegistry")
            .field("identities", &identities)
            .finish()
    }
}
