//! Where the reconciler gets its catalog snapshot from.

use std::path::PathBuf;

use arena_core::{Catalog, ConfigResult};

/// Source of the game catalog, read once per reconciler pass.
pub trait CatalogSource: Send + Sync {
    fn load(&self) -> ConfigResult<Catalog>;
}

/// Catalog re-read from a TOML file on every pass.
#[derive(Debug, Clone)]
pub struct FileCatalog {
    path: PathBuf,
}

impl FileCatalog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl CatalogSource for FileCatalog {
    fn load(&self) -> ConfigResult<Catalog> {
        Catalog::from_file(&self.path)
    }
}

/// A fixed catalog.
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog(pub Catalog);

impl CatalogSource for StaticCatalog {
    fn load(&self) -> ConfigResult<Catalog> {
        Ok(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_catalog_picks_up_edits() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.toml");
        std::fs::write(&path, "").unwrap();
        let source = FileCatalog::new(&path);
        assert!(source.load().unwrap().games.is_empty());

        std::fs::write(
            &path,
            "[[games]]\nname = \"valheim\"\nimage = \"valheim:latest\"\n",
        )
        .unwrap();
        assert!(source.load().unwrap().game("valheim").is_some());
    }

    #[test]
    fn missing_file_is_an_error() {
        let source = FileCatalog::new("/nonexistent/catalog.toml");
        assert!(source.load().is_err());
    }
}
