//! Region-file world format: gzipped big-endian level.dat plus
//! `region/r.<rx>.<rz>.mca` files of zlib-compressed chunk NBT.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::debug;

use geode_nbt::{read_nbt_be, write_nbt_be, CompoundExt, NbtCompound, NbtRoot, NbtTag};

use super::region::{RegionFile, REGION_EDGE};
use super::{
    extra_data_from_bytes, extra_data_to_bytes, ChunkIter, LevelProvider, ProviderError,
    ProviderFormat,
};
use crate::chunk::{Chunk, ChunkData, MAX_SUBCHUNKS};
use crate::level_data::{LevelData, WorldCreationOptions};
use crate::subchunk::{SubChunk, NIBBLE_LAYER_LEN, SUB_CHUNK_VOLUME};

const FORMAT_NAME: &str = "anvil";
const REGION_DIR: &str = "region";
const LEVEL_DAT: &str = "level.dat";

fn region_file_name(rx: i32, rz: i32) -> String {
    format!("r.{rx}.{rz}.mca")
}

fn parse_region_name(name: &str) -> Option<(i32, i32)> {
    let mut parts = name.split('.');
    if parts.next() != Some("r") {
        return None;
    }
    let rx = parts.next()?.parse().ok()?;
    let rz = parts.next()?.parse().ok()?;
    if parts.next() != Some("mca") || parts.next().is_some() {
        return None;
    }
    Some((rx, rz))
}

// ---------------------------------------------------------------------------
// Chunk <-> NBT
// ---------------------------------------------------------------------------

fn chunk_to_nbt(chunk: &Chunk) -> NbtRoot {
    let mut sections = Vec::new();
    for (y, slot) in chunk.get_sub_chunks().iter().enumerate() {
        let Some(sub) = slot.as_sub() else { continue };
        let mut section = NbtCompound::new();
        section.insert("Y".into(), NbtTag::Byte(y as i8));
        section.insert("Blocks".into(), NbtTag::byte_array_from(&sub.ids()[..]));
        section.insert("Data".into(), NbtTag::byte_array_from(&sub.data()[..]));
        section.insert("SkyLight".into(), NbtTag::byte_array_from(&sub.sky_light()[..]));
        section.insert(
            "BlockLight".into(),
            NbtTag::byte_array_from(&sub.block_light()[..]),
        );
        sections.push(NbtTag::Compound(section));
    }

    let height_map: Vec<i32> = chunk.height_map_array().iter().map(|&h| h as i32).collect();

    let mut level = NbtCompound::new();
    level.insert("xPos".into(), NbtTag::Int(chunk.x()));
    level.insert("zPos".into(), NbtTag::Int(chunk.z()));
    level.insert("V".into(), NbtTag::Byte(1));
    level.insert("InhabitedTime".into(), NbtTag::Long(0));
    level.insert("Sections".into(), NbtTag::List(sections));
    level.insert("Biomes".into(), NbtTag::byte_array_from(&chunk.biome_id_array()[..]));
    level.insert("HeightMap".into(), NbtTag::IntArray(height_map));
    level.insert(
        "Entities".into(),
        NbtTag::List(
            chunk
                .savable_entity_nbt()
                .into_iter()
                .map(NbtTag::Compound)
                .collect(),
        ),
    );
    level.insert(
        "TileEntities".into(),
        NbtTag::List(
            chunk
                .savable_tile_nbt()
                .into_iter()
                .map(NbtTag::Compound)
                .collect(),
        ),
    );
    if !chunk.block_extra_data_array().is_empty() {
        level.insert(
            "ExtraData".into(),
            NbtTag::byte_array_from(&extra_data_to_bytes(chunk.block_extra_data_array())),
        );
    }
    level.insert(
        "LightPopulated".into(),
        NbtTag::Byte(chunk.is_light_populated() as i8),
    );
    level.insert(
        "TerrainPopulated".into(),
        NbtTag::Byte(chunk.is_populated() as i8),
    );
    level.insert(
        "TerrainGenerated".into(),
        NbtTag::Byte(chunk.is_generated() as i8),
    );

    let mut root = NbtCompound::new();
    root.insert("Level".into(), NbtTag::Compound(level));
    NbtRoot::new("", root)
}

fn chunk_from_nbt(root: &NbtRoot) -> Result<Chunk, String> {
    let level = root
        .compound
        .get_compound("Level")
        .ok_or("missing Level compound")?;

    let x = level.get_int("xPos").ok_or("missing xPos")?;
    let z = level.get_int("zPos").ok_or("missing zPos")?;

    let mut data = ChunkData::default();

    for section in level.get_list("Sections").unwrap_or_default() {
        let section = section.as_compound().ok_or("non-compound section")?;
        let y = section.get_byte("Y").ok_or("section missing Y")? as usize;
        if y >= MAX_SUBCHUNKS {
            return Err(format!("section index {y} out of range"));
        }
        let blocks = section
            .get_byte_array_u8("Blocks")
            .filter(|b| b.len() == SUB_CHUNK_VOLUME)
            .ok_or("bad Blocks array")?;
        let meta = section
            .get_byte_array_u8("Data")
            .filter(|b| b.len() == NIBBLE_LAYER_LEN)
            .ok_or("bad Data array")?;
        let sky = section
            .get_byte_array_u8("SkyLight")
            .filter(|b| b.len() == NIBBLE_LAYER_LEN)
            .ok_or("bad SkyLight array")?;
        let block_light = section
            .get_byte_array_u8("BlockLight")
            .filter(|b| b.len() == NIBBLE_LAYER_LEN)
            .ok_or("bad BlockLight array")?;
        data.sub_chunks
            .push((y, SubChunk::from_layers(&blocks, &meta, &sky, &block_light)));
    }

    if let Some(height_map) = level.get_int_array("HeightMap") {
        if height_map.len() != 256 {
            return Err(format!("bad HeightMap length {}", height_map.len()));
        }
        data.height_map = height_map.iter().map(|&h| h as u16).collect();
    }

    if let Some(biomes) = level.get_byte_array_u8("Biomes") {
        if biomes.len() != 256 {
            return Err(format!("bad Biomes length {}", biomes.len()));
        }
        data.biome_ids = biomes;
    }

    data.entities = level
        .get_list("Entities")
        .unwrap_or_default()
        .iter()
        .filter_map(|t| t.as_compound().cloned())
        .collect();
    data.tiles = level
        .get_list("TileEntities")
        .unwrap_or_default()
        .iter()
        .filter_map(|t| t.as_compound().cloned())
        .collect();

    if let Some(extra) = level.get_byte_array_u8("ExtraData") {
        data.extra_data = extra_data_from_bytes(&extra)?;
    }

    let light_populated = level.get_byte("LightPopulated").unwrap_or(0) != 0;
    let terrain_populated = level.get_byte("TerrainPopulated").unwrap_or(0) != 0;
    let terrain_generated = level.get_byte("TerrainGenerated").unwrap_or(0) != 0;

    let mut chunk = Chunk::with_data(x, z, data);
    chunk.set_light_populated(light_populated);
    chunk.set_populated(terrain_populated);
    chunk.set_generated(terrain_generated);
    Ok(chunk)
}

// ---------------------------------------------------------------------------
// level.dat
// ---------------------------------------------------------------------------

fn level_data_to_nbt(data: &LevelData) -> NbtRoot {
    let mut d = NbtCompound::new();
    d.insert("LevelName".into(), NbtTag::String(data.name.clone()));
    d.insert("RandomSeed".into(), NbtTag::Long(data.seed));
    d.insert("Time".into(), NbtTag::Long(data.time));
    d.insert("SpawnX".into(), NbtTag::Int(data.spawn.0));
    d.insert("SpawnY".into(), NbtTag::Int(data.spawn.1));
    d.insert("SpawnZ".into(), NbtTag::Int(data.spawn.2));
    d.insert("Difficulty".into(), NbtTag::Int(data.difficulty));
    d.insert("rainTime".into(), NbtTag::Int(data.rain_time));
    d.insert("rainLevel".into(), NbtTag::Float(data.rain_level));
    d.insert("thunderTime".into(), NbtTag::Int(data.lightning_time));
    d.insert("thunderLevel".into(), NbtTag::Float(data.lightning_level));
    d.insert("generatorName".into(), NbtTag::String(data.generator.clone()));
    d.insert(
        "generatorOptions".into(),
        NbtTag::String(data.generator_options.to_string()),
    );

    let mut root = NbtCompound::new();
    root.insert("Data".into(), NbtTag::Compound(d));
    NbtRoot::new("", root)
}

fn level_data_from_nbt(root: &NbtRoot) -> Result<LevelData, ProviderError> {
    let d = root
        .compound
        .get_compound("Data")
        .ok_or_else(|| ProviderError::CorruptLevelData("missing Data compound".into()))?;

    let generator_options = d
        .get_string("generatorOptions")
        .and_then(|s| serde_json::from_str(s).ok())
        .unwrap_or(serde_json::Value::Null);

    Ok(LevelData {
        name: d.get_string("LevelName").unwrap_or("world").to_string(),
        seed: d.get_long("RandomSeed").unwrap_or(0),
        time: d.get_long("Time").unwrap_or(0),
        spawn: (
            d.get_int("SpawnX").unwrap_or(128),
            d.get_int("SpawnY").unwrap_or(70),
            d.get_int("SpawnZ").unwrap_or(128),
        ),
        difficulty: d.get_int("Difficulty").unwrap_or(2),
        rain_time: d.get_int("rainTime").unwrap_or(0),
        rain_level: d.get_float("rainLevel").unwrap_or(0.0),
        lightning_time: d.get_int("thunderTime").unwrap_or(0),
        lightning_level: d.get_float("thunderLevel").unwrap_or(0.0),
        generator: d.get_string("generatorName").unwrap_or("normal").to_string(),
        generator_options,
    })
}

fn write_level_dat(path: &Path, data: &LevelData) -> Result<(), ProviderError> {
    let mut nbt = Vec::new();
    write_nbt_be(&mut nbt, &level_data_to_nbt(data));

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&nbt)?;
    std::fs::write(path.join(LEVEL_DAT), encoder.finish()?)?;
    Ok(())
}

fn read_level_dat(path: &Path) -> Result<LevelData, ProviderError> {
    let compressed = std::fs::read(path.join(LEVEL_DAT))?;
    let mut nbt = Vec::new();
    GzDecoder::new(&compressed[..])
        .read_to_end(&mut nbt)
        .map_err(|e| ProviderError::CorruptLevelData(format!("gzip: {e}")))?;
    let root = read_nbt_be(&mut &nbt[..])
        .map_err(|e| ProviderError::CorruptLevelData(e.to_string()))?;
    level_data_from_nbt(&root)
}

// ---------------------------------------------------------------------------
// Provider
// ---------------------------------------------------------------------------

/// Region-file provider. One instance owns the world directory.
pub struct AnvilProvider {
    path: PathBuf,
    level_data: LevelData,
    regions: HashMap<(i32, i32), RegionFile>,
}

impl AnvilProvider {
    /// Registry descriptor for this format.
    pub fn format() -> ProviderFormat {
        ProviderFormat {
            name: FORMAT_NAME,
            is_valid: Self::is_valid,
            generate: Self::generate,
            open: |path| Ok(Box::new(Self::open(path)?)),
        }
    }

    /// Side-effect-free probe: level.dat plus at least one region file.
    pub fn is_valid(path: &Path) -> bool {
        if !path.join(LEVEL_DAT).is_file() {
            return false;
        }
        let region_dir = path.join(REGION_DIR);
        let Ok(entries) = std::fs::read_dir(region_dir) else {
            return false;
        };
        entries
            .flatten()
            .any(|e| parse_region_name(&e.file_name().to_string_lossy()).is_some())
    }

    /// Write the files of a brand-new world.
    pub fn generate(path: &Path, options: &WorldCreationOptions) -> Result<(), ProviderError> {
        let region_dir = path.join(REGION_DIR);
        std::fs::create_dir_all(&region_dir)?;
        write_level_dat(path, &options.level_data())?;
        // seed an empty region so the directory probes as this format
        RegionFile::open(&region_dir.join(region_file_name(0, 0)))?;
        Ok(())
    }

    pub fn open(path: &Path) -> Result<Self, ProviderError> {
        if !path.join(LEVEL_DAT).is_file() {
            return Err(ProviderError::InvalidWorld {
                format: FORMAT_NAME,
                path: path.to_path_buf(),
            });
        }
        Ok(Self {
            path: path.to_path_buf(),
            level_data: read_level_dat(path)?,
            regions: HashMap::new(),
        })
    }

    fn ensure_region(&mut self, rx: i32, rz: i32) -> Result<&mut RegionFile, ProviderError> {
        use std::collections::hash_map::Entry;
        let region_dir = self.path.join(REGION_DIR);
        let file_path = region_dir.join(region_file_name(rx, rz));
        match self.regions.entry((rx, rz)) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                std::fs::create_dir_all(&region_dir)?;
                Ok(entry.insert(RegionFile::open(&file_path)?))
            }
        }
    }

    fn existing_region(
        &mut self,
        rx: i32,
        rz: i32,
    ) -> Result<Option<&mut RegionFile>, ProviderError> {
        let file_path = self.path.join(REGION_DIR).join(region_file_name(rx, rz));
        if !self.regions.contains_key(&(rx, rz)) {
            if !file_path.is_file() {
                return Ok(None);
            }
            self.regions.insert((rx, rz), RegionFile::open(&file_path)?);
        }
        Ok(self.regions.get_mut(&(rx, rz)))
    }
}

impl LevelProvider for AnvilProvider {
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
        let Some(region) = self.existing_region(x >> 5, z >> 5)? else {
            return Ok(None);
        };
        let Some(raw) = region.read_chunk((x & 31) as u32, (z & 31) as u32)? else {
            return Ok(None);
        };

        let root = read_nbt_be(&mut &raw[..]).map_err(|e| ProviderError::CorruptChunk {
            x,
            z,
            reason: e.to_string(),
        })?;
        chunk_from_nbt(&root)
            .map(Some)
            .map_err(|reason| ProviderError::CorruptChunk { x, z, reason })
    }

    fn save_chunk(&mut self, chunk: &Chunk) -> Result<(), ProviderError> {
        let (x, z) = (chunk.x(), chunk.z());
        let mut raw = Vec::new();
        write_nbt_be(&mut raw, &chunk_to_nbt(chunk));

        let region = self.ensure_region(x >> 5, z >> 5)?;
        region.write_chunk(
            (x & (REGION_EDGE - 1)) as u32,
            (z & (REGION_EDGE - 1)) as u32,
            &raw,
        )
    }

    fn save_level_data(&mut self) -> Result<(), ProviderError> {
        write_level_dat(&self.path, &self.level_data)
    }

    fn do_garbage_collection(&mut self) -> Result<(), ProviderError> {
        let mut reclaimed = 0u64;
        for region in self.regions.values_mut() {
            reclaimed += region.compact()?;
        }
        debug!(reclaimed, "region garbage collection finished");
        // idle handles are cheap to reopen; drop them all
        self.regions.clear();
        Ok(())
    }

    fn all_chunks(&mut self) -> Result<ChunkIter<'_>, ProviderError> {
        let mut coords = Vec::new();
        let region_dir = self.path.join(REGION_DIR);
        if region_dir.is_dir() {
            let mut region_coords = Vec::new();
            for entry in std::fs::read_dir(&region_dir)? {
                let entry = entry?;
                if let Some(rc) = parse_region_name(&entry.file_name().to_string_lossy()) {
                    region_coords.push(rc);
                }
            }
            region_coords.sort_unstable();
            for (rx, rz) in region_coords {
                if let Some(region) = self.existing_region(rx, rz)? {
                    for (lx, lz) in region.chunks_present() {
                        coords.push(((rx << 5) | lx as i32, (rz << 5) | lz as i32));
                    }
                }
            }
        }

        Ok(Box::new(coords.into_iter().filter_map(
            move |(x, z)| match self.load_chunk(x, z) {
                Ok(Some(chunk)) => Some(Ok(chunk)),
                Ok(None) => None,
                Err(e) => Some(Err(e)),
            },
        )))
    }

    fn close(&mut self) -> Result<(), ProviderError> {
        for region in self.regions.values_mut() {
            region.flush()?;
        }
        self.regions.clear();
        Ok(())
    }
}
