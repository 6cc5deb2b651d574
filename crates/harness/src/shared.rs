use remap_engine::{Engine, EngineConfig, EngineError};
use remap_storage::{SqliteStorage, StorageError};
use tempfile::TempDir;

/// Several engines, each on its own connection to one database file.
pub struct SharedDatabase {
    engines: Vec<Engine>,
    path: String,
    // Dropped last so the file outlives every connection.
    _dir: TempDir,
}

impl SharedDatabase {
    pub fn new() -> Result<Self, std::io::Error> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("remap.db").to_string_lossy().into_owned();
        Ok(Self {
            engines: Vec::new(),
            path,
            _dir: dir,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Opens another connection and returns its index.
    pub fn add_engine(&mut self, config: EngineConfig) -> Result<usize, EngineError> {
        let storage = SqliteStorage::open(&self.path).map_err(EngineError::from)?;
        let index = self.engines.len();
        self.engines.push(Engine::new(config, storage)?);
        Ok(index)
    }

    /// A fresh connection for inspecting the file directly.
    pub fn open(&self) -> Result<SqliteStorage, StorageError> {
        SqliteStorage::open(&self.path)
    }

    pub fn engine(&self, index: usize) -> &Engine {
        &self.engines[index]
    }

    pub fn engine_mut(&mut self, index: usize) -> &mut Engine {
        &mut self.engines[index]
    }
}
