//! Repository discovery seam.
//!
//! Admission asks a [`RepositoryDiscovery`] for the ordered repository list of
//! a campaign on every pass. The list order drives batch boundaries, so an
//! implementation should return a stable order for unchanged input.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::{Error, Result};
use crate::resource::{Campaign, ObjectKey, Resource};

/// Source of the repositories a campaign should cover.
#[async_trait]
pub trait RepositoryDiscovery: Send + Sync {
    async fn discover(&self, campaign: &Campaign) -> Result<Vec<String>>;
}

/// Discovery backed by a fixed table, keyed by campaign.
///
/// Campaigns without an entry discover nothing.
#[derive(Debug, Default)]
pub struct StaticDiscovery {
    repositories: RwLock<HashMap<ObjectKey, Vec<String>>>,
}

impl StaticDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the repository list for a campaign, replacing any previous one.
    pub fn set(&self, campaign: ObjectKey, repositories: impl IntoIterator<Item = impl Into<String>>) {
        self.repositories
            .write()
            .insert(campaign, repositories.into_iter().map(Into::into).collect());
    }

    pub fn with(self, campaign: ObjectKey, repositories: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.set(campaign, repositories);
        self
    }
}

#[async_trait]
impl RepositoryDiscovery for StaticDiscovery {
    async fn discover(&self, campaign: &Campaign) -> Result<Vec<String>> {
        Ok(self
            .repositories
            .read()
            .get(&campaign.key())
            .cloned()
            .unwrap_or_default())
    }
}

/// Discovery that always fails; useful to exercise the retry path.
#[derive(Debug, Clone)]
pub struct UnavailableDiscovery {
    pub message: String,
}

#[async_trait]
impl RepositoryDiscovery for UnavailableDiscovery {
    async fn discover(&self, _campaign: &Campaign) -> Result<Vec<String>> {
        Err(Error::discovery(self.message.clone()))
    }
}
