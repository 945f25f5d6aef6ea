//! LevelDB world format: Bedrock-style per-chunk keys in a `db/` database
//! next to a little-endian level.dat.

use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut, BytesMut};
use rusty_leveldb::{LdbIterator, Options, DB};
use tracing::debug;

use geode_nbt::{read_nbt_le, write_nbt_le, CompoundExt, NbtCompound, NbtRoot, NbtTag};

use super::{
    extra_data_from_bytes, extra_data_to_bytes, ChunkIter, LevelProvider, ProviderError,
    ProviderFormat,
};
use crate::chunk::{Chunk, ChunkData, MAX_SUBCHUNKS};
use crate::level_data::{LevelData, WorldCreationOptions};
use crate::subchunk::{SubChunk, FAST_SERIALIZED_LEN};

const FORMAT_NAME: &str = "leveldb";
const DB_DIR: &str = "db";
const LEVEL_DAT: &str = "level.dat";

const STORAGE_VERSION: i32 = 10;
const CHUNK_VERSION: u8 = 7;
const SUB_CHUNK_VERSION: u8 = 0;

// ─── Key tags ───────────────────────────────────────────────────────────────

const TAG_DATA_2D: u8 = 0x2d;
const TAG_SUB_CHUNK_PREFIX: u8 = 0x2f;
const TAG_BLOCK_ENTITY: u8 = 0x31;
const TAG_ENTITY: u8 = 0x32;
const TAG_EXTRA_DATA: u8 = 0x34;
const TAG_FLAGS: u8 = 0x36;
const TAG_VERSION: u8 = 0x76;

/// Build a chunk key: `[X:i32_le][Z:i32_le][tag]`.
fn chunk_key(x: i32, z: i32, tag: u8) -> Vec<u8> {
    let mut key = Vec::with_capacity(9);
    key.extend_from_slice(&x.to_le_bytes());
    key.extend_from_slice(&z.to_le_bytes());
    key.push(tag);
    key
}

/// Build a sub-chunk key: `[X:i32_le][Z:i32_le][0x2F][y_index]`.
fn sub_chunk_key(x: i32, z: i32, y: u8) -> Vec<u8> {
    let mut key = Vec::with_capacity(10);
    key.extend_from_slice(&x.to_le_bytes());
    key.extend_from_slice(&z.to_le_bytes());
    key.push(TAG_SUB_CHUNK_PREFIX);
    key.push(y);
    key
}

fn status_err(status: rusty_leveldb::Status) -> ProviderError {
    ProviderError::Database(status.to_string())
}

fn corrupt(x: i32, z: i32, reason: impl Into<String>) -> ProviderError {
    ProviderError::CorruptChunk {
        x,
        z,
        reason: reason.into(),
    }
}

// ─── Concatenated NBT values ────────────────────────────────────────────────

fn compounds_to_bytes(compounds: &[NbtCompound]) -> Vec<u8> {
    let mut buf = Vec::new();
    for compound in compounds {
        write_nbt_le(&mut buf, &NbtRoot::new("", compound.clone()));
    }
    buf
}

fn compounds_from_bytes(bytes: &[u8]) -> Result<Vec<NbtCompound>, String> {
    let mut buf = bytes;
    let mut out = Vec::new();
    while buf.has_remaining() {
        let root = read_nbt_le(&mut buf).map_err(|e| e.to_string())?;
        out.push(root.compound);
    }
    Ok(out)
}

// ─── level.dat ──────────────────────────────────────────────────────────────

fn level_data_to_nbt(data: &LevelData) -> NbtRoot {
    let mut c = NbtCompound::new();
    c.insert("LevelName".into(), NbtTag::String(data.name.clone()));
    c.insert("RandomSeed".into(), NbtTag::Long(data.seed));
    c.insert("Time".into(), NbtTag::Long(data.time));
    c.insert("SpawnX".into(), NbtTag::Int(data.spawn.0));
    c.insert("SpawnY".into(), NbtTag::Int(data.spawn.1));
    c.insert("SpawnZ".into(), NbtTag::Int(data.spawn.2));
    c.insert("Difficulty".into(), NbtTag::Int(data.difficulty));
    c.insert("rainTime".into(), NbtTag::Int(data.rain_time));
    c.insert("rainLevel".into(), NbtTag::Float(data.rain_level));
    c.insert("lightningTime".into(), NbtTag::Int(data.lightning_time));
    c.insert("lightningLevel".into(), NbtTag::Float(data.lightning_level));
    c.insert("Generator".into(), NbtTag::String(data.generator.clone()));
    c.insert(
        "generatorOptions".into(),
        NbtTag::String(data.generator_options.to_string()),
    );
    c.insert("StorageVersion".into(), NbtTag::Int(STORAGE_VERSION));
    NbtRoot::new("", c)
}

fn level_data_from_nbt(root: &NbtRoot) -> LevelData {
    let c = &root.compound;
    let generator_options = c
        .get_string("generatorOptions")
        .and_then(|s| serde_json::from_str(s).ok())
        .unwrap_or(serde_json::Value::Null);

    LevelData {
        name: c.get_string("LevelName").unwrap_or("world").to_string(),
        seed: c.get_long("RandomSeed").unwrap_or(0),
        time: c.get_long("Time").unwrap_or(0),
        spawn: (
            c.get_int("SpawnX").unwrap_or(128),
            c.get_int("SpawnY").unwrap_or(70),
            c.get_int("SpawnZ").unwrap_or(128),
        ),
        difficulty: c.get_int("Difficulty").unwrap_or(2),
        rain_time: c.get_int("rainTime").unwrap_or(0),
        rain_level: c.get_float("rainLevel").unwrap_or(0.0),
        lightning_time: c.get_int("lightningTime").unwrap_or(0),
        lightning_level: c.get_float("lightningLevel").unwrap_or(0.0),
        generator: c.get_string("Generator").unwrap_or("normal").to_string(),
        generator_options,
    }
}

/// level.dat layout: i32_le storage version, i32_le payload length, then
/// little-endian NBT.
fn write_level_dat(path: &Path, data: &LevelData) -> Result<(), ProviderError> {
    let mut nbt = Vec::new();
    write_nbt_le(&mut nbt, &level_data_to_nbt(data));

    let mut file = Vec::with_capacity(8 + nbt.len());
    file.put_i32_le(STORAGE_VERSION);
    file.put_i32_le(nbt.len() as i32);
    file.extend_from_slice(&nbt);
    std::fs::write(path.join(LEVEL_DAT), &file)?;
    Ok(())
}

fn read_level_dat(path: &Path) -> Result<LevelData, ProviderError> {
    let bytes = std::fs::read(path.join(LEVEL_DAT))?;
    if bytes.len() < 8 {
        return Err(ProviderError::CorruptLevelData("level.dat too short".into()));
    }
    let payload_len =
        i32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;
    if bytes.len() < 8 + payload_len {
        return Err(ProviderError::CorruptLevelData(
            "level.dat payload truncated".into(),
        ));
    }
    let root = read_nbt_le(&mut &bytes[8..8 + payload_len])
        .map_err(|e| ProviderError::CorruptLevelData(e.to_string()))?;
    Ok(level_data_from_nbt(&root))
}

// ─── Provider ───────────────────────────────────────────────────────────────

/// LevelDB-backed provider. One instance owns the world directory.
pub struct LevelDbProvider {
    path: PathBuf,
    level_data: LevelData,
    db: Option<DB>,
}

impl LevelDbProvider {
    /// Registry descriptor for this format.
    pub fn format() -> ProviderFormat {
        ProviderFormat {
            name: FORMAT_NAME,
            is_valid: Self::is_valid,
            generate: Self::generate,
            open: |path| Ok(Box::new(Self::open(path)?)),
        }
    }

    /// Side-effect-free probe: level.dat plus a database manifest.
    pub fn is_valid(path: &Path) -> bool {
        path.join(LEVEL_DAT).is_file() && path.join(DB_DIR).join("CURRENT").is_file()
    }

    /// Write the files of a brand-new world.
    pub fn generate(path: &Path, options: &WorldCreationOptions) -> Result<(), ProviderError> {
        std::fs::create_dir_all(path)?;
        write_level_dat(path, &options.level_data())?;

        let opts = Options {
            create_if_missing: true,
            ..Options::default()
        };
        let mut db = DB::open(path.join(DB_DIR), opts).map_err(status_err)?;
        db.flush().map_err(status_err)?;
        Ok(())
    }

    pub fn open(path: &Path) -> Result<Self, ProviderError> {
        if !Self::is_valid(path) {
            return Err(ProviderError::InvalidWorld {
                format: FORMAT_NAME,
                path: path.to_path_buf(),
            });
        }
        let level_data = read_level_dat(path)?;
        let db = DB::open(path.join(DB_DIR), Options::default()).map_err(status_err)?;
        Ok(Self {
            path: path.to_path_buf(),
            level_data,
            db: Some(db),
        })
    }

    fn db(&mut self) -> Result<&mut DB, ProviderError> {
        self.db
            .as_mut()
            .ok_or_else(|| ProviderError::Database("provider is closed".into()))
    }
}

impl LevelProvider for LevelDbProvider {
    fn path(&self) -> &Path {
        &self.path
    }

    fn level_data(&self) -> &LevelData {
        &self.level_data
    }

    fn level_data_mut(&mut self) -> &mut LevelData {
        &mut self.level_data
    }

    fn load_chunk(&mut self, x: i32, z: i32) -> Result<Option<Chunk>, ProviderError> {
        let db = self.db()?;
        if db.get(&chunk_key(x, z, TAG_VERSION)).is_none() {
            return Ok(None);
        }

        let mut data = ChunkData::default();

        for y in 0..MAX_SUBCHUNKS {
            let Some(raw) = db.get(&sub_chunk_key(x, z, y as u8)) else {
                continue;
            };
            if raw.len() < 1 + FAST_SERIALIZED_LEN {
                return Err(corrupt(x, z, format!("sub-chunk {y} truncated")));
            }
            if raw[0] != SUB_CHUNK_VERSION {
                return Err(corrupt(x, z, format!("sub-chunk {y} version {}", raw[0])));
            }
            let sub = SubChunk::fast_deserialize(&raw[1..])
                .ok_or_else(|| corrupt(x, z, format!("sub-chunk {y} undecodable")))?;
            data.sub_chunks.push((y, sub));
        }

        if let Some(raw) = db.get(&chunk_key(x, z, TAG_DATA_2D)) {
            if raw.len() < 768 {
                return Err(corrupt(x, z, "2D data truncated"));
            }
            let mut buf = &raw[..512];
            let mut height_map = Vec::with_capacity(256);
            for _ in 0..256 {
                height_map.push(buf.get_u16_le());
            }
            data.height_map = height_map;
            data.biome_ids = raw[512..768].to_vec();
        }

        if let Some(raw) = db.get(&chunk_key(x, z, TAG_ENTITY)) {
            data.entities = compounds_from_bytes(&raw)
                .map_err(|reason| corrupt(x, z, format!("entities: {reason}")))?;
        }
        if let Some(raw) = db.get(&chunk_key(x, z, TAG_BLOCK_ENTITY)) {
            data.tiles = compounds_from_bytes(&raw)
                .map_err(|reason| corrupt(x, z, format!("tiles: {reason}")))?;
        }
        if let Some(raw) = db.get(&chunk_key(x, z, TAG_EXTRA_DATA)) {
            data.extra_data = extra_data_from_bytes(&raw)
                .map_err(|reason| corrupt(x, z, format!("extra data: {reason}")))?;
        }

        let flags = db
            .get(&chunk_key(x, z, TAG_FLAGS))
            .and_then(|raw| raw.first().copied())
            .unwrap_or(0);

        let mut chunk = Chunk::with_data(x, z, data);
        chunk.set_light_populated(flags & 4 != 0);
        chunk.set_populated(flags & 2 != 0);
        chunk.set_generated(flags & 1 != 0);
        Ok(Some(chunk))
    }

    fn save_chunk(&mut self, chunk: &Chunk) -> Result<(), ProviderError> {
        let (x, z) = (chunk.x(), chunk.z());
        let db = self.db()?;

        db.put(&chunk_key(x, z, TAG_VERSION), &[CHUNK_VERSION])
            .map_err(status_err)?;

        for (y, slot) in chunk.get_sub_chunks().iter().enumerate() {
            let key = sub_chunk_key(x, z, y as u8);
            match slot.as_sub() {
                Some(sub) => {
                    let mut value = BytesMut::with_capacity(1 + FAST_SERIALIZED_LEN);
                    value.put_u8(SUB_CHUNK_VERSION);
                    sub.fast_serialize(&mut value);
                    db.put(&key, &value).map_err(status_err)?;
                }
                None => {
                    if db.get(&key).is_some() {
                        db.delete(&key).map_err(status_err)?;
                    }
                }
            }
        }

        let mut data_2d = BytesMut::with_capacity(768);
        for &height in chunk.height_map_array() {
            data_2d.put_u16_le(height);
        }
        data_2d.put_slice(chunk.biome_id_array());
        db.put(&chunk_key(x, z, TAG_DATA_2D), &data_2d)
            .map_err(status_err)?;

        for (tag, compounds) in [
            (TAG_ENTITY, chunk.savable_entity_nbt()),
            (TAG_BLOCK_ENTITY, chunk.savable_tile_nbt()),
        ] {
            let key = chunk_key(x, z, tag);
            if compounds.is_empty() {
                if db.get(&key).is_some() {
                    db.delete(&key).map_err(status_err)?;
                }
            } else {
                db.put(&key, &compounds_to_bytes(&compounds))
                    .map_err(status_err)?;
            }
        }

        let extra_key = chunk_key(x, z, TAG_EXTRA_DATA);
        if chunk.block_extra_data_array().is_empty() {
            if db.get(&extra_key).is_some() {
                db.delete(&extra_key).map_err(status_err)?;
            }
        } else {
            db.put(
                &extra_key,
                &extra_data_to_bytes(chunk.block_extra_data_array()),
            )
            .map_err(status_err)?;
        }

        let flags = (chunk.is_light_populated() as u8) << 2
            | (chunk.is_populated() as u8) << 1
            | chunk.is_generated() as u8;
        db.put(&chunk_key(x, z, TAG_FLAGS), &[flags])
            .map_err(status_err)?;

        Ok(())
    }

    fn save_level_data(&mut self) -> Result<(), ProviderError> {
        write_level_dat(&self.path, &self.level_data)
    }

    fn do_garbage_collection(&mut self) -> Result<(), ProviderError> {
        // LevelDB compacts itself in the background; making sure the
        // memtable reaches disk is all that is useful here.
        self.db()?.flush().map_err(status_err)?;
        debug!("leveldb flush finished");
        Ok(())
    }

    fn all_chunks(&mut self) -> Result<ChunkIter<'_>, ProviderError> {
        let coords = {
            let db = self.db()?;
            let mut iter = db.new_iter().map_err(status_err)?;
            let mut coords = Vec::new();
            while let Some((key, _)) = iter.next() {
                if key.len() == 9 && key[8] == TAG_VERSION {
                    let x = i32::from_le_bytes([key[0], key[1], key[2], key[3]]);
                    let z = i32::from_le_bytes([key[4], key[5], key[6], key[7]]);
                    coords.push((x, z));
                }
            }
            coords
        };

        Ok(Box::new(coords.into_iter().filter_map(
            move |(x, z)| match self.load_chunk(x, z) {
                Ok(Some(chunk)) => Some(Ok(chunk)),
                Ok(None) => None,
                Err(e) => Some(Err(e)),
            },
        )))
    }

    fn close(&mut self) -> Result<(), ProviderError> {
        if let Some(mut db) = self.db.take() {
            db.flush().map_err(status_err)?;
        }
        Ok(())
    }
}
