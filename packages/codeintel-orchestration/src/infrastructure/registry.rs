use async_trait::async_trait;
use std::collections::HashMap;

use crate::collaborators::{Repository, RepositoryRegistry};
use crate::config::RepositoryConfig;
use crate::error::Result;

/// Fixed set of repositories, typically taken from the config file
#[derive(Debug, Clone, Default)]
pub struct StaticRegistry {
    repositories: HashMap<i64, Repository>,
}

impl StaticRegistry {
    pub fn new(repositories: impl IntoIterator<Item = Repository>) -> Self {
        Self {
            repositories: repositories.into_iter().map(|r| (r.id, r)).collect(),
        }
    }

    pub fn from_config(entries: &[RepositoryConfig]) -> Self {
        Self::new(
            entries
                .iter()
                .map(|entry| Repository::new(entry.id, entry.name.clone())),
        )
    }

    pub fn len(&self) -> usize {
        self.repositories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.repositories.is_empty()
    }
}

#[async_trait]
impl RepositoryRegistry for StaticRegistry {
    async fn get_repository(&self, id: i64) -> Result<Option<Repository>> {
        Ok(self.repositories.get(&id).cloned())
    }
}
