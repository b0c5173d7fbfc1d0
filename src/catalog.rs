//! Game catalog seeding.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::ledger::{Ledger, LedgerError};
use crate::model::Resource;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSeed {
    pub name: String,
    /// Max players.
    pub capacity: u32,
    pub duration_minutes: u32,
}

impl ResourceSeed {
    fn new(name: &str, capacity: u32, duration_minutes: u32) -> Self {
        Self {
            name: name.into(),
            capacity,
            duration_minutes,
        }
    }
}

pub fn default_catalog() -> Vec<ResourceSeed> {
    vec![
        ResourceSeed::new("Basketball", 10, 60),
        ResourceSeed::new("Football", 22, 90),
        ResourceSeed::new("Tennis", 4, 90),
        ResourceSeed::new("Badminton", 4, 60),
        ResourceSeed::new("Table Tennis", 4, 30),
        ResourceSeed::new("Volleyball", 12, 60),
        ResourceSeed::new("Cricket", 22, 180),
        ResourceSeed::new("Swimming", 8, 45),
    ]
}

#[derive(Debug)]
pub enum CatalogError {
    Io(String),
    Parse(String),
}

impl std::fmt::Display for CatalogError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CatalogError::Io(e) => write!(f, "cannot read catalog: {e}"),
            CatalogError::Parse(e) => write!(f, "bad catalog: {e}"),
        }
    }
}

impl std::error::Error for CatalogError {}

/// A JSON array of `{"name", "capacity", "duration_minutes"}` objects.
pub fn load(path: &Path) -> Result<Vec<ResourceSeed>, CatalogError> {
    let json = std::fs::read_to_string(path)
        .map_err(|e| CatalogError::Io(format!("{}: {e}", path.display())))?;
    serde_json::from_str(&json).map_err(|e| CatalogError::Parse(e.to_string()))
}

/// Create every seeded game not yet present. Returns the seeded games,
/// existing or new, in seed order.
pub async fn seed(ledger: &dyn Ledger, seeds: &[ResourceSeed]) -> Result<Vec<Resource>, LedgerError> {
    let mut existing: HashMap<String, Resource> = ledger
        .list_resources()
        .await?
        .into_iter()
        .map(|r| (r.name.clone(), r))
        .collect();

    let mut out = Vec::with_capacity(seeds.len());
    let mut created = 0;
    for s in seeds {
        if let Some(r) = existing.get(&s.name) {
            out.push(r.clone());
            continue;
        }
        let r = ledger
            .create_resource(&s.name, s.capacity, s.duration_minutes)
            .await?;
        existing.insert(r.name.clone(), r.clone());
        out.push(r);
        created += 1;
    }
    if created > 0 {
        info!("catalog: added {created} games");
    }
    Ok(out)
}
