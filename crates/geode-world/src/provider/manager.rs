//! Registry of level provider formats.
//!
//! An explicit, process-scoped object: constructed at startup, handed by
//! reference to the world-loading and world-creation flows. Probing order is
//! registration order.

use std::path::Path;

use super::anvil::AnvilProvider;
use super::leveldb::LevelDbProvider;
use super::{ProviderError, ProviderFormat};

pub struct LevelProviderManager {
    formats: Vec<ProviderFormat>,
    default: Option<&'static str>,
}

impl Default for LevelProviderManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LevelProviderManager {
    /// An empty registry with no default format.
    pub fn new() -> Self {
        Self {
            formats: Vec::new(),
            default: None,
        }
    }

    /// The built-in formats, with the region format as the default for new
    /// worlds.
    pub fn with_defaults() -> Self {
        let mut manager = Self::new();
        manager
            .add_provider(AnvilProvider::format())
            .expect("built-in format name is well-formed");
        manager
            .add_provider(LevelDbProvider::format())
            .expect("built-in format name is well-formed");
        manager
            .set_default(AnvilProvider::format())
            .expect("built-in format name is well-formed");
        manager
    }

    /// Register a format. The descriptor must carry a usable registry key;
    /// a malformed one is rejected immediately rather than ignored.
    /// Re-registering a name replaces the earlier descriptor in place,
    /// keeping its probe position.
    pub fn add_provider(&mut self, format: ProviderFormat) -> Result<(), ProviderError> {
        let name = format.name;
        if name.is_empty()
            || !name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        {
            return Err(ProviderError::InvalidFormatName(name.to_string()));
        }

        if let Some(existing) = self.formats.iter_mut().find(|f| f.name == name) {
            *existing = format;
        } else {
            self.formats.push(format);
        }
        Ok(())
    }

    /// First registered format whose probe accepts the directory.
    pub fn get_provider(&self, path: &Path) -> Option<&ProviderFormat> {
        self.formats.iter().find(|format| (format.is_valid)(path))
    }

    /// Look up a format by name, case-insensitively.
    pub fn get_provider_by_name(&self, name: &str) -> Option<&ProviderFormat> {
        let name = name.trim().to_lowercase();
        self.formats.iter().find(|format| format.name == name)
    }

    /// Register a format and make it the one used for newly created worlds.
    pub fn set_default(&mut self, format: ProviderFormat) -> Result<(), ProviderError> {
        let name = format.name;
        self.add_provider(format)?;
        self.default = Some(name);
        Ok(())
    }

    /// The format used for newly created worlds, if one was designated.
    pub fn default_format(&self) -> Option<&ProviderFormat> {
        self.default
            .and_then(|name| self.formats.iter().find(|f| f.name == name))
    }
}
