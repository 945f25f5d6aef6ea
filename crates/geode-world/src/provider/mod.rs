//! Pluggable level persistence: the provider contract, its error taxonomy,
//! and the on-disk format implementations.

pub mod anvil;
pub mod leveldb;
pub mod manager;
mod region;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut};
use thiserror::Error;

use crate::chunk::Chunk;
use crate::level_data::{LevelData, WorldCreationOptions};

/// Legacy extra-data stream shared by the on-disk formats: u32_le entry
/// count, then i32_le key / i16_le value pairs.
pub(crate) fn extra_data_to_bytes(extra: &HashMap<u16, u16>) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + extra.len() * 6);
    buf.put_u32_le(extra.len() as u32);
    let mut entries: Vec<_> = extra.iter().collect();
    entries.sort_unstable();
    for (&key, &value) in entries {
        buf.put_i32_le(key as i32);
        buf.put_i16_le(value as i16);
    }
    buf
}

pub(crate) fn extra_data_from_bytes(bytes: &[u8]) -> Result<HashMap<u16, u16>, String> {
    let mut buf = bytes;
    if buf.remaining() < 4 {
        return Err("truncated extra data".into());
    }
    let count = buf.get_u32_le() as usize;
    if buf.remaining() < count * 6 {
        return Err("truncated extra data entries".into());
    }
    let mut extra = HashMap::with_capacity(count);
    for _ in 0..count {
        let key = buf.get_i32_le() as u16;
        let value = buf.get_i16_le() as u16;
        extra.insert(key, value);
    }
    Ok(extra)
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A chunk exists but cannot be decoded. Distinct from an absent chunk,
    /// which is `Ok(None)` on load.
    #[error("corrupt chunk {x},{z}: {reason}")]
    CorruptChunk { x: i32, z: i32, reason: String },

    #[error("corrupt region file {path}: {reason}")]
    CorruptRegion { path: PathBuf, reason: String },

    #[error("corrupt level data: {0}")]
    CorruptLevelData(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("{path}: not a valid {format} world")]
    InvalidWorld { format: &'static str, path: PathBuf },

    #[error("invalid provider format name {0:?}")]
    InvalidFormatName(String),
}

/// Lazy chunk stream over a whole world. Each `all_chunks` call starts a
/// fresh pass; bodies are loaded one at a time.
pub type ChunkIter<'a> = Box<dyn Iterator<Item = Result<Chunk, ProviderError>> + 'a>;

/// One open world directory. An instance owns its files exclusively for its
/// lifetime; the format-specific statics (probe, generate, open) live on the
/// [`ProviderFormat`] descriptor so the trait stays object-safe.
pub trait LevelProvider {
    fn path(&self) -> &Path;

    /// Build height limit in blocks.
    fn world_height(&self) -> u32 {
        256
    }

    fn level_data(&self) -> &LevelData;

    fn level_data_mut(&mut self) -> &mut LevelData;

    fn world_name(&self) -> String {
        self.level_data().name.clone()
    }

    fn time(&self) -> i64 {
        self.level_data().time
    }

    fn set_time(&mut self, value: i64) {
        self.level_data_mut().time = value;
    }

    fn seed(&self) -> i64 {
        self.level_data().seed
    }

    fn set_seed(&mut self, value: i64) {
        self.level_data_mut().seed = value;
    }

    fn spawn(&self) -> (i32, i32, i32) {
        self.level_data().spawn
    }

    fn set_spawn(&mut self, spawn: (i32, i32, i32)) {
        self.level_data_mut().spawn = spawn;
    }

    fn difficulty(&self) -> i32 {
        self.level_data().difficulty
    }

    fn set_difficulty(&mut self, value: i32) {
        self.level_data_mut().difficulty = value;
    }

    fn rain_time(&self) -> i32 {
        self.level_data().rain_time
    }

    fn set_rain_time(&mut self, ticks: i32) {
        self.level_data_mut().rain_time = ticks;
    }

    fn rain_level(&self) -> f32 {
        self.level_data().rain_level
    }

    fn set_rain_level(&mut self, level: f32) {
        self.level_data_mut().rain_level = level.clamp(0.0, 1.0);
    }

    fn lightning_time(&self) -> i32 {
        self.level_data().lightning_time
    }

    fn set_lightning_time(&mut self, ticks: i32) {
        self.level_data_mut().lightning_time = ticks;
    }

    fn lightning_level(&self) -> f32 {
        self.level_data().lightning_level
    }

    fn set_lightning_level(&mut self, level: f32) {
        self.level_data_mut().lightning_level = level.clamp(0.0, 1.0);
    }

    fn generator(&self) -> String {
        self.level_data().generator.clone()
    }

    fn generator_options(&self) -> serde_json::Value {
        self.level_data().generator_options.clone()
    }

    /// Load one chunk. `Ok(None)` when the chunk was never saved; an error
    /// only for I/O failure or undecodable data.
    fn load_chunk(&mut self, x: i32, z: i32) -> Result<Option<Chunk>, ProviderError>;

    fn save_chunk(&mut self, chunk: &Chunk) -> Result<(), ProviderError>;

    /// Persist the world metadata (time, weather, spawn, ...).
    fn save_level_data(&mut self) -> Result<(), ProviderError>;

    /// Format-specific housekeeping (compacting region files, flushing the
    /// database).
    fn do_garbage_collection(&mut self) -> Result<(), ProviderError>;

    /// Stream every chunk in the world without holding more than one in
    /// memory. Restartable: each call begins a new pass.
    fn all_chunks(&mut self) -> Result<ChunkIter<'_>, ProviderError>;

    /// Release file handles. The provider is unusable afterwards.
    fn close(&mut self) -> Result<(), ProviderError>;
}

/// Format descriptor: the static half of a provider implementation, used by
/// the registry to probe directories and create or open worlds.
#[derive(Clone)]
pub struct ProviderFormat {
    /// Lowercase format identifier (registry key).
    pub name: &'static str,
    /// Side-effect-free probe: is this directory a world of this format?
    pub is_valid: fn(&Path) -> bool,
    /// Write the files of a brand-new world into the directory.
    pub generate: fn(&Path, &WorldCreationOptions) -> Result<(), ProviderError>,
    /// Open an existing world of this format.
    pub open: fn(&Path) -> Result<Box<dyn LevelProvider>, ProviderError>,
}
