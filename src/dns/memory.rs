use std::collections::HashSet;
use thiserror::Error;
use tokio::sync::Mutex;
use crate::{
    context::{Cancelled, Context},
    endpoint::{Endpoint, RecordType},
    plan::Changes,
};
use super::{Provider, ProviderError};

/// A zone kept in process memory.
///
/// Changesets are validated in full before anything is written, so a failed
/// `apply_changes` never leaves the zone half updated.
#[derive(Debug, Default)]
pub struct InMemoryProvider {
    zone: Mutex<Vec<Endpoint>>,
}

impl InMemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

impl From<Vec<Endpoint>> for InMemoryProvider {
    fn from(records: Vec<Endpoint>) -> Self {
        Self { zone: Mutex::new(records) }
    }
}

#[async_trait::async_trait]
impl Provider for InMemoryProvider {
    type Error = InMemoryError;

    async fn records(&self, ctx: &Context) -> Result<Vec<Endpoint>, Self::Error> {
        Ok(ctx.run(self.zone.lock()).await?.clone())
    }

    #[tracing::instrument(skip_all)]
    async fn apply_changes(
        &self,
        ctx: &Context,
        changes: &Changes,
        _cached: Option<&[Endpoint]>,
    ) -> Result<(), Self::Error> {
        let mut zone = ctx.run(self.zone.lock()).await?;

        let mut keys: HashSet<(String, RecordType)> = zone.iter().map(Endpoint::key).collect();
        for e in changes.delete.iter().chain(&changes.update_old) {
            if !keys.contains(&e.key()) {
                return Err(InMemoryError::NotFound(e.dns_name.clone()));
            }
        }
        for e in &changes.delete {
            keys.remove(&e.key());
        }
        for e in &changes.create {
            if !keys.insert(e.key()) {
                return Err(InMemoryError::AlreadyExists(e.dns_name.clone()));
            }
        }

        let gone: HashSet<_> = changes.delete.iter().map(Endpoint::key).collect();
        zone.retain(|e| !gone.contains(&e.key()));

        for new in &changes.update_new {
            if let Some(slot) = zone.iter_mut().find(|e| e.key() == new.key()) {
                *slot = new.clone();
            }
        }
        zone.extend(changes.create.iter().cloned());

        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum InMemoryError {
    #[error("record {0} already exists")]
    AlreadyExists(String),
    #[error("record {0} not found")]
    NotFound(String),
    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

impl ProviderError for InMemoryError {}
