//! Dashboard catalog: categories of embeddable reports with optional allow-lists.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::descriptor::DashboardDescriptor;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("failed to read catalog {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse catalog: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("duplicate dashboard id {0}")]
    DuplicateId(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub report_id: String,
    #[serde(default)]
    pub dataset_id: String,
    #[serde(default)]
    pub allowed_users: Option<Vec<String>>,
}

impl CatalogEntry {
    pub fn is_visible_to(&self, user: &str) -> bool {
        let Some(allowed) = &self.allowed_users else {
            return true;
        };
        let wanted = user.trim().to_lowercase();
        allowed
            .iter()
            .any(|candidate| candidate.trim().to_lowercase() == wanted)
    }

    pub fn descriptor(&self) -> DashboardDescriptor {
        DashboardDescriptor::new(&self.id, &self.title, &self.report_id, &self.dataset_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub dashboards: Vec<CatalogEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Catalog {
    #[serde(default, rename = "category")]
    pub categories: Vec<Category>,
}

impl Catalog {
    pub fn from_toml_str(raw: &str) -> Result<Self, CatalogError> {
        let catalog: Catalog = toml::from_str(raw)?;
        catalog.check_unique_ids()?;
        Ok(catalog)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| CatalogError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    fn check_unique_ids(&self) -> Result<(), CatalogError> {
        let mut seen = std::collections::HashSet::new();
        for entry in self.entries() {
            if !seen.insert(entry.id.as_str()) {
                return Err(CatalogError::DuplicateId(entry.id.clone()));
            }
        }
        Ok(())
    }

    pub fn entries(&self) -> impl Iterator<Item = &CatalogEntry> {
        self.categories
            .iter()
            .flat_map(|category| category.dashboards.iter())
    }

    pub fn find(&self, id: &str) -> Option<&CatalogEntry> {
        self.entries().find(|entry| entry.id == id)
    }

    pub fn descriptor(&self, id: &str) -> Option<DashboardDescriptor> {
        self.find(id).map(CatalogEntry::descriptor)
    }

    /// Categories trimmed to what `user` may open; empty categories are dropped.
    pub fn visible_to(&self, user: &str) -> Vec<Category> {
        self.categories
            .iter()
            .filter_map(|category| {
                let dashboards: Vec<CatalogEntry> = category
                    .dashboards
                    .iter()
                    .filter(|entry| entry.is_visible_to(user))
                    .cloned()
                    .collect();
                (!dashboards.is_empty()).then(|| Category {
                    id: category.id.clone(),
                    name: category.name.clone(),
                    dashboards,
                })
            })
            .collect()
    }
}
