//! Chunk columns: 16 sub-chunk slots, height map, biomes, entity and tile
//! registries, and the three serialization paths (network, fast, persisted
//! via the provider layer).

use std::collections::HashMap;
use std::rc::Rc;

use bytes::{Buf, BufMut, BytesMut};
use tracing::warn;

use geode_nbt::{write_nbt_network, CompoundExt, NbtCompound, NbtRoot, NbtTag};

use crate::block_table::BlockLightTable;
use crate::entity::{EntityFactory, EntityRef};
use crate::subchunk::{SubChunk, SubChunkSlot, FAST_SERIALIZED_LEN, NIBBLE_LAYER_LEN};
use crate::tile::{TileFactory, TileRef};

/// Sub-chunk slots per chunk; fixed for the chunk's lifetime.
pub const MAX_SUBCHUNKS: usize = 16;

static EMPTY_SLOT: SubChunkSlot = SubChunkSlot::Empty;

/// Raw persisted payload a chunk can be constructed from. Missing pieces fall
/// back to sane empties.
pub struct ChunkData {
    /// Materialized sub-chunks keyed by slot index (0-15).
    pub sub_chunks: Vec<(usize, SubChunk)>,
    /// Raw entity compounds, kept until [`Chunk::init_chunk`].
    pub entities: Vec<NbtCompound>,
    /// Raw tile compounds, kept until [`Chunk::init_chunk`].
    pub tiles: Vec<NbtCompound>,
    /// 256 biome ids, z-major, or empty for all-zero.
    pub biome_ids: Vec<u8>,
    /// 256 height map entries, z-major, or empty for the default.
    pub height_map: Vec<u16>,
    /// Legacy extra-data values keyed by packed local coordinates.
    pub extra_data: HashMap<u16, u16>,
}

impl Default for ChunkData {
    fn default() -> Self {
        Self {
            sub_chunks: Vec::new(),
            entities: Vec::new(),
            tiles: Vec::new(),
            biome_ids: Vec::new(),
            height_map: Vec::new(),
            extra_data: HashMap::new(),
        }
    }
}

struct PendingNbt {
    entities: Vec<NbtCompound>,
    tiles: Vec<NbtCompound>,
}

/// One 16x256x16 column of the world.
///
/// A chunk is owned by the world-tick thread; it crosses execution contexts
/// only as [`fast_serialize`](Self::fast_serialize) bytes, never as a live
/// value (the entity/tile handles are deliberately not `Send`).
pub struct Chunk {
    x: i32,
    z: i32,

    sub_chunks: [SubChunkSlot; MAX_SUBCHUNKS],
    height_map: [u16; 256],
    biome_ids: [u8; 256],
    extra_data: HashMap<u16, u16>,

    entities: HashMap<i64, EntityRef>,
    tiles: HashMap<u64, TileRef>,
    /// Positional tile index keyed by packed local coordinates.
    tile_list: HashMap<u16, TileRef>,

    /// Raw records waiting for `init_chunk`; consumed exactly once.
    pending: Option<PendingNbt>,

    has_changed: bool,
    is_init: bool,
    light_populated: bool,
    terrain_generated: bool,
    terrain_populated: bool,
}

impl Chunk {
    pub fn new(x: i32, z: i32) -> Self {
        Self::with_data(x, z, ChunkData::default())
    }

    /// Construct from persisted payload. Wrong-size biome or height-map
    /// arrays are a storage-contract violation and panic.
    pub fn with_data(x: i32, z: i32, data: ChunkData) -> Self {
        let mut sub_chunks: [SubChunkSlot; MAX_SUBCHUNKS] = Default::default();
        for (index, sub) in data.sub_chunks {
            assert!(index < MAX_SUBCHUNKS, "sub-chunk index {index} out of range");
            sub_chunks[index] = SubChunkSlot::Sub(Box::new(sub));
        }

        let mut height_map = [(MAX_SUBCHUNKS * 16) as u16; 256];
        if !data.height_map.is_empty() {
            assert_eq!(
                data.height_map.len(),
                256,
                "wrong height map entry count: {}",
                data.height_map.len()
            );
            height_map.copy_from_slice(&data.height_map);
        }

        let mut biome_ids = [0u8; 256];
        if !data.biome_ids.is_empty() {
            assert_eq!(
                data.biome_ids.len(),
                256,
                "wrong biome id count: {}",
                data.biome_ids.len()
            );
            biome_ids.copy_from_slice(&data.biome_ids);
        }

        Self {
            x,
            z,
            sub_chunks,
            height_map,
            biome_ids,
            extra_data: data.extra_data,
            entities: HashMap::new(),
            tiles: HashMap::new(),
            tile_list: HashMap::new(),
            pending: Some(PendingNbt {
                entities: data.entities,
                tiles: data.tiles,
            }),
            has_changed: false,
            is_init: false,
            light_populated: false,
            terrain_generated: false,
            terrain_populated: false,
        }
    }

    pub fn x(&self) -> i32 {
        self.x
    }

    pub fn z(&self) -> i32 {
        self.z
    }

    pub fn set_x(&mut self, x: i32) {
        self.x = x;
    }

    pub fn set_z(&mut self, z: i32) {
        self.z = z;
    }

    /// Chunk height in sub-chunks.
    pub fn height(&self) -> usize {
        MAX_SUBCHUNKS
    }

    // -----------------------------------------------------------------------
    // Block access
    // -----------------------------------------------------------------------

    /// Combined `(id << 4) | meta` at local coordinates.
    pub fn get_full_block(&self, x: usize, y: usize, z: usize) -> u16 {
        self.get_sub_chunk((y >> 4) as i32).get_full_block(x, y & 0x0f, z)
    }

    /// Set id and/or meta in one call; `None` leaves that layer alone.
    /// Returns whether anything changed.
    pub fn set_block(
        &mut self,
        x: usize,
        y: usize,
        z: usize,
        id: Option<u8>,
        meta: Option<u8>,
    ) -> bool {
        let Some(sub) = self.materialize(y >> 4) else {
            return false;
        };
        if sub.set_block(x, y & 0x0f, z, id, meta) {
            self.has_changed = true;
            true
        } else {
            false
        }
    }

    pub fn get_block_id(&self, x: usize, y: usize, z: usize) -> u8 {
        self.get_sub_chunk((y >> 4) as i32).get_block_id(x, y & 0x0f, z)
    }

    pub fn set_block_id(&mut self, x: usize, y: usize, z: usize, id: u8) {
        if let Some(sub) = self.materialize(y >> 4) {
            if sub.set_block_id(x, y & 0x0f, z, id) {
                self.has_changed = true;
            }
        }
    }

    pub fn get_block_data(&self, x: usize, y: usize, z: usize) -> u8 {
        self.get_sub_chunk((y >> 4) as i32).get_block_data(x, y & 0x0f, z)
    }

    pub fn set_block_data(&mut self, x: usize, y: usize, z: usize, data: u8) {
        if let Some(sub) = self.materialize(y >> 4) {
            if sub.set_block_data(x, y & 0x0f, z, data) {
                self.has_changed = true;
            }
        }
    }

    // -----------------------------------------------------------------------
    // Legacy extra data
    // -----------------------------------------------------------------------

    /// Legacy `(meta << 8) | id` value, 0 if unset.
    pub fn get_block_extra_data(&self, x: usize, y: usize, z: usize) -> u16 {
        self.extra_data
            .get(&Self::chunk_block_hash(x, y, z))
            .copied()
            .unwrap_or(0)
    }

    /// Writing 0 clears the entry.
    pub fn set_block_extra_data(&mut self, x: usize, y: usize, z: usize, data: u16) {
        let key = Self::chunk_block_hash(x, y, z);
        if data == 0 {
            self.extra_data.remove(&key);
        } else {
            self.extra_data.insert(key, data);
        }
        self.has_changed = true;
    }

    /// Pack local coordinates into the extra-data/tile-index key space.
    pub fn chunk_block_hash(x: usize, y: usize, z: usize) -> u16 {
        ((x << 12) | (z << 8) | y) as u16
    }

    // -----------------------------------------------------------------------
    // Light access
    // -----------------------------------------------------------------------

    pub fn get_block_sky_light(&self, x: usize, y: usize, z: usize) -> u8 {
        self.get_sub_chunk((y >> 4) as i32)
            .get_block_sky_light(x, y & 0x0f, z)
    }

    pub fn set_block_sky_light(&mut self, x: usize, y: usize, z: usize, level: u8) {
        if let Some(sub) = self.materialize(y >> 4) {
            if sub.set_block_sky_light(x, y & 0x0f, z, level) {
                self.has_changed = true;
            }
        }
    }

    pub fn get_block_light(&self, x: usize, y: usize, z: usize) -> u8 {
        self.get_sub_chunk((y >> 4) as i32)
            .get_block_light(x, y & 0x0f, z)
    }

    pub fn set_block_light(&mut self, x: usize, y: usize, z: usize, level: u8) {
        if let Some(sub) = self.materialize(y >> 4) {
            if sub.set_block_light(x, y & 0x0f, z, level) {
                self.has_changed = true;
            }
        }
    }

    /// Flood every sub-chunk up to the highest materialized one with a
    /// uniform sky light level.
    pub fn set_all_block_sky_light(&mut self, level: u8) {
        let packed = (level & 0x0f) | (level << 4);
        let layer = [packed; NIBBLE_LAYER_LEN];
        for y in (0..=self.get_highest_sub_chunk_index()).rev() {
            if let Some(sub) = self.materialize(y as usize) {
                sub.set_sky_light_layer(layer);
            }
        }
    }

    /// Flood every sub-chunk up to the highest materialized one with a
    /// uniform block light level.
    pub fn set_all_block_light(&mut self, level: u8) {
        let packed = (level & 0x0f) | (level << 4);
        let layer = [packed; NIBBLE_LAYER_LEN];
        for y in (0..=self.get_highest_sub_chunk_index()).rev() {
            if let Some(sub) = self.materialize(y as usize) {
                sub.set_block_light_layer(layer);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Height map and sky light
    // -----------------------------------------------------------------------

    /// Y of the highest non-air block in the column, or -1 if none.
    pub fn get_highest_block_at(&self, x: usize, z: usize) -> i32 {
        let index = self.get_highest_sub_chunk_index();
        if index == -1 {
            return -1;
        }
        for y in (0..=index).rev() {
            let height = self.get_sub_chunk(y).highest_block_at(x, z);
            if height != -1 {
                return height | (y << 4);
            }
        }
        -1
    }

    /// Highest block Y covered by a materialized sub-chunk, or -1.
    pub fn get_max_y(&self) -> i32 {
        (self.get_highest_sub_chunk_index() << 4) | 0x0f
    }

    pub fn get_height_map(&self, x: usize, z: usize) -> u16 {
        self.height_map[(z << 4) | x]
    }

    pub fn set_height_map(&mut self, x: usize, z: usize, value: u16) {
        self.height_map[(z << 4) | x] = value;
    }

    /// Recalculate every height map column.
    pub fn recalculate_height_map(&mut self, table: &BlockLightTable) {
        for z in 0..16 {
            for x in 0..16 {
                self.recalculate_height_map_column(x, z, table);
            }
        }
    }

    /// Scan down from the highest block until something filters or diffuses
    /// sky light; the height is one above that block (0 for an all-clear
    /// column). Also stores the result.
    pub fn recalculate_height_map_column(
        &mut self,
        x: usize,
        z: usize,
        table: &BlockLightTable,
    ) -> u16 {
        let mut y = self.get_highest_block_at(x, z);
        while y >= 0 {
            let id = self.get_block_id(x, y as usize, z);
            if table.light_filter(id) > 1 || table.diffuses_sky_light(id) {
                break;
            }
            y -= 1;
        }

        let height = (y + 1) as u16;
        self.set_height_map(x, z, height);
        height
    }

    /// Direct vertical sky light pass: full brightness down to the height-map
    /// boundary, then attenuate by each block's filter until the light dies.
    /// No lateral spreading happens here; adjacent-column artifacts are an
    /// accepted limitation of this pass.
    pub fn populate_sky_light(&mut self, table: &BlockLightTable) {
        let max_y = self.get_max_y();

        self.set_all_block_sky_light(0);

        for x in 0..16 {
            for z in 0..16 {
                let height = self.get_height_map(x, z) as i32;

                let mut y = max_y;
                while y >= height {
                    self.set_block_sky_light(x, y as usize, z, 15);
                    y -= 1;
                }

                let mut light: i32 = 15;
                while y >= 0 {
                    if light > 0 {
                        light -= table.light_filter(self.get_block_id(x, y as usize, z)) as i32;
                        if light <= 0 {
                            break;
                        }
                    }
                    self.set_block_sky_light(x, y as usize, z, light as u8);
                    y -= 1;
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Biomes
    // -----------------------------------------------------------------------

    pub fn get_biome_id(&self, x: usize, z: usize) -> u8 {
        self.biome_ids[(z << 4) | x]
    }

    pub fn set_biome_id(&mut self, x: usize, z: usize, biome_id: u8) {
        self.has_changed = true;
        self.biome_ids[(z << 4) | x] = biome_id;
    }

    // -----------------------------------------------------------------------
    // Column snapshots
    // -----------------------------------------------------------------------

    /// All 256 block ids of one column, bottom to top.
    pub fn block_id_column(&self, x: usize, z: usize) -> [u8; 256] {
        let mut column = [0u8; 256];
        for (i, slot) in self.sub_chunks.iter().enumerate() {
            column[i * 16..(i + 1) * 16].copy_from_slice(&slot.block_id_column(x, z));
        }
        column
    }

    /// All 256 meta nibbles of one column, packed two per byte.
    pub fn block_data_column(&self, x: usize, z: usize) -> [u8; 128] {
        let mut column = [0u8; 128];
        for (i, slot) in self.sub_chunks.iter().enumerate() {
            column[i * 8..(i + 1) * 8].copy_from_slice(&slot.block_data_column(x, z));
        }
        column
    }

    /// All 256 sky light nibbles of one column, packed two per byte.
    pub fn sky_light_column(&self, x: usize, z: usize) -> [u8; 128] {
        let mut column = [0u8; 128];
        for (i, slot) in self.sub_chunks.iter().enumerate() {
            column[i * 8..(i + 1) * 8].copy_from_slice(&slot.sky_light_column(x, z));
        }
        column
    }

    /// All 256 block light nibbles of one column, packed two per byte.
    pub fn block_light_column(&self, x: usize, z: usize) -> [u8; 128] {
        let mut column = [0u8; 128];
        for (i, slot) in self.sub_chunks.iter().enumerate() {
            column[i * 8..(i + 1) * 8].copy_from_slice(&slot.block_light_column(x, z));
        }
        column
    }

    // -----------------------------------------------------------------------
    // Generation milestones and dirty tracking
    // -----------------------------------------------------------------------

    pub fn is_light_populated(&self) -> bool {
        self.light_populated
    }

    pub fn set_light_populated(&mut self, value: bool) {
        self.light_populated = value;
    }

    pub fn is_populated(&self) -> bool {
        self.terrain_populated
    }

    pub fn set_populated(&mut self, value: bool) {
        self.terrain_populated = value;
    }

    pub fn is_generated(&self) -> bool {
        self.terrain_generated
    }

    pub fn set_generated(&mut self, value: bool) {
        self.terrain_generated = value;
    }

    pub fn has_changed(&self) -> bool {
        self.has_changed
    }

    pub fn set_changed(&mut self, value: bool) {
        self.has_changed = value;
    }

    pub fn is_init(&self) -> bool {
        self.is_init
    }

    // -----------------------------------------------------------------------
    // Entities and tiles
    // -----------------------------------------------------------------------

    /// Closed entities are garbage; registering one is a caller bug.
    pub fn add_entity(&mut self, entity: EntityRef) {
        let (id, player) = {
            let e = entity.borrow();
            assert!(!e.is_closed(), "attempted to add a closed entity to a chunk");
            (e.id(), e.is_player())
        };
        self.entities.insert(id, entity);
        if !player && self.is_init {
            self.has_changed = true;
        }
    }

    pub fn remove_entity(&mut self, entity: &EntityRef) {
        let (id, player) = {
            let e = entity.borrow();
            (e.id(), e.is_player())
        };
        self.entities.remove(&id);
        if !player && self.is_init {
            self.has_changed = true;
        }
    }

    pub fn get_entities(&self) -> Vec<EntityRef> {
        self.entities.values().cloned().collect()
    }

    /// Entities that should be written out with the chunk: persistable and
    /// not already closed.
    pub fn get_savable_entities(&self) -> Vec<EntityRef> {
        self.entities
            .values()
            .filter(|e| {
                let e = e.borrow();
                e.can_save_with_chunk() && !e.is_closed()
            })
            .cloned()
            .collect()
    }

    /// Register a tile in both indexes. A different tile already occupying
    /// the position is closed before being displaced from the positional
    /// index; its registration under its own id stays behind until that id
    /// is removed separately.
    pub fn add_tile(&mut self, tile: TileRef) {
        let (id, (x, y, z)) = {
            let t = tile.borrow();
            assert!(!t.is_closed(), "attempted to add a closed tile to a chunk");
            (t.id(), t.position())
        };
        self.tiles.insert(id, Rc::clone(&tile));

        let index = (((x & 0x0f) as u16) << 12) | (((z & 0x0f) as u16) << 8) | ((y & 0xff) as u16);
        if let Some(prev) = self.tile_list.get(&index) {
            if !Rc::ptr_eq(prev, &tile) {
                prev.borrow_mut().close();
            }
        }
        self.tile_list.insert(index, tile);

        if self.is_init {
            self.has_changed = true;
        }
    }

    pub fn remove_tile(&mut self, tile: &TileRef) {
        let (id, (x, y, z)) = {
            let t = tile.borrow();
            (t.id(), t.position())
        };
        self.tiles.remove(&id);
        let index = (((x & 0x0f) as u16) << 12) | (((z & 0x0f) as u16) << 8) | ((y & 0xff) as u16);
        self.tile_list.remove(&index);
        if self.is_init {
            self.has_changed = true;
        }
    }

    pub fn get_tiles(&self) -> Vec<TileRef> {
        self.tiles.values().cloned().collect()
    }

    /// O(1) positional lookup by local coordinates.
    pub fn get_tile(&self, x: usize, y: usize, z: usize) -> Option<TileRef> {
        self.tile_list
            .get(&(((x << 12) | (z << 8) | y) as u16))
            .cloned()
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Materialize entities and tiles from the raw records queued at
    /// construction. Idempotent; the queues are consumed on the first call.
    /// Records missing their type identifier, unknown to the factories, or
    /// failing construction are dropped, and the chunk is marked dirty so
    /// they are not persisted again.
    pub fn init_chunk(&mut self, entity_factory: &EntityFactory, tile_factory: &TileFactory) {
        if self.is_init {
            return;
        }

        let mut changed = false;
        if let Some(pending) = self.pending.take() {
            for nbt in pending.entities {
                // leveldb worlds carry non-string id tags; stringify those
                let type_id = match nbt.get("id") {
                    Some(NbtTag::String(s)) => s.clone(),
                    Some(other) => other.to_string(),
                    None => {
                        changed = true;
                        continue;
                    }
                };
                match entity_factory.create(&type_id, &nbt) {
                    Some(entity) => self.add_entity(entity),
                    None => {
                        warn!(
                            chunk_x = self.x,
                            chunk_z = self.z,
                            type_id = %type_id,
                            "dropping unusable entity record"
                        );
                        changed = true;
                    }
                }
            }

            for nbt in pending.tiles {
                let Some(type_id) = nbt.get_string("id").map(str::to_string) else {
                    changed = true;
                    continue;
                };
                match tile_factory.create(&type_id, &nbt) {
                    Some(tile) => self.add_tile(tile),
                    None => {
                        warn!(
                            chunk_x = self.x,
                            chunk_z = self.z,
                            type_id = %type_id,
                            "dropping unusable tile record"
                        );
                        changed = true;
                    }
                }
            }
        }

        self.has_changed = changed;
        self.is_init = true;
    }

    /// Close every non-player entity and every tile ahead of releasing the
    /// chunk.
    pub fn on_unload(&mut self) {
        for entity in self.entities.values() {
            if entity.borrow().is_player() {
                continue;
            }
            entity.borrow_mut().close();
        }
        for tile in self.tiles.values() {
            tile.borrow_mut().close();
        }
    }

    // -----------------------------------------------------------------------
    // Sub-chunk management
    // -----------------------------------------------------------------------

    /// The slot at the given index; out-of-range indexes read as the shared
    /// empty stub.
    pub fn get_sub_chunk(&self, y: i32) -> &SubChunkSlot {
        if y < 0 || y as usize >= MAX_SUBCHUNKS {
            &EMPTY_SLOT
        } else {
            &self.sub_chunks[y as usize]
        }
    }

    /// Writable sub-chunk at the index, materializing the stub in place.
    /// `None` only for out-of-range indexes.
    fn materialize(&mut self, index: usize) -> Option<&mut SubChunk> {
        if index >= MAX_SUBCHUNKS {
            return None;
        }
        let slot = &mut self.sub_chunks[index];
        if slot.is_empty_stub() {
            *slot = SubChunkSlot::Sub(Box::new(SubChunk::new()));
        }
        match slot {
            SubChunkSlot::Sub(sub) => Some(sub),
            SubChunkSlot::Empty => unreachable!("slot was just materialized"),
        }
    }

    /// Replace a slot. `None` or (unless `allow_empty`) an all-air sub-chunk
    /// installs the shared stub. Returns false for out-of-range indexes.
    pub fn set_sub_chunk(&mut self, y: i32, sub: Option<SubChunk>, allow_empty: bool) -> bool {
        if y < 0 || y as usize >= MAX_SUBCHUNKS {
            return false;
        }
        self.sub_chunks[y as usize] = match sub {
            None => SubChunkSlot::Empty,
            Some(s) if s.is_empty() && !allow_empty => SubChunkSlot::Empty,
            Some(s) => SubChunkSlot::Sub(Box::new(s)),
        };
        self.has_changed = true;
        true
    }

    pub fn get_sub_chunks(&self) -> &[SubChunkSlot; MAX_SUBCHUNKS] {
        &self.sub_chunks
    }

    /// Index of the highest materialized slot, or -1. Materialized-but-air
    /// sub-chunks count; thorough pruning at runtime would cost more than it
    /// saves.
    pub fn get_highest_sub_chunk_index(&self) -> i32 {
        for y in (0..MAX_SUBCHUNKS).rev() {
            if !self.sub_chunks[y].is_empty_stub() {
                return y as i32;
            }
        }
        -1
    }

    /// Count of sub-chunks that need sending to clients.
    pub fn get_sub_chunk_send_count(&self) -> usize {
        (self.get_highest_sub_chunk_index() + 1) as usize
    }

    /// Swap materialized-but-air sub-chunks back to the shared stub.
    pub fn prune_empty_sub_chunks(&mut self) {
        for slot in self.sub_chunks.iter_mut() {
            if slot.is_empty_stub() || !slot.is_empty() {
                continue;
            }
            *slot = SubChunkSlot::Empty;
            self.has_changed = true;
        }
    }

    // -----------------------------------------------------------------------
    // Serialization
    // -----------------------------------------------------------------------

    pub fn biome_id_array(&self) -> &[u8; 256] {
        &self.biome_ids
    }

    pub fn height_map_array(&self) -> &[u16; 256] {
        &self.height_map
    }

    pub fn block_extra_data_array(&self) -> &HashMap<u16, u16> {
        &self.extra_data
    }

    /// Entity compounds to persist: the untouched raw queue before
    /// `init_chunk`, the live savable entities after.
    pub fn savable_entity_nbt(&self) -> Vec<NbtCompound> {
        if let Some(pending) = &self.pending {
            return pending.entities.clone();
        }
        self.get_savable_entities()
            .iter()
            .map(|e| e.borrow().save_nbt())
            .collect()
    }

    /// Tile compounds to persist, same two-state rule as entities.
    pub fn savable_tile_nbt(&self) -> Vec<NbtCompound> {
        if let Some(pending) = &self.pending {
            return pending.tiles.clone();
        }
        self.tiles
            .values()
            .filter(|t| !t.borrow().is_closed())
            .map(|t| t.borrow().save_nbt())
            .collect()
    }

    /// Wire-format snapshot for chunk packets. Byte layout is a client
    /// protocol contract: send count, sub-chunk blobs bottom-up, height map
    /// as u16_le, biome ids, the always-empty border block count, then the
    /// spawn compound of every spawnable tile.
    pub fn network_serialize(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();

        let send_count = self.get_sub_chunk_send_count();
        buf.put_u8(send_count as u8);
        for y in 0..send_count {
            self.sub_chunks[y].network_serialize(&mut buf);
        }

        for &height in &self.height_map {
            buf.put_u16_le(height);
        }
        buf.put_slice(&self.biome_ids);
        buf.put_u8(0); // border blocks; populated entries crash the client

        for tile in self.tiles.values() {
            if let Some(compound) = tile.borrow().spawn_compound() {
                write_nbt_network(&mut buf, &NbtRoot::new("", compound));
            }
        }

        buf.to_vec()
    }

    /// Dense inter-thread encoding: coordinates, materialized sub-chunks with
    /// their indexes, height map, biomes, and the generation flags. Entities
    /// and tiles do not cross this boundary.
    pub fn fast_serialize(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_i32(self.x);
        buf.put_i32(self.z);

        let mut count: u8 = 0;
        let mut subs = BytesMut::new();
        for (y, slot) in self.sub_chunks.iter().enumerate() {
            if let SubChunkSlot::Sub(sub) = slot {
                count += 1;
                subs.put_u8(y as u8);
                sub.fast_serialize(&mut subs);
            }
        }
        buf.put_u8(count);
        buf.extend_from_slice(&subs);

        for &height in &self.height_map {
            buf.put_u16_le(height);
        }
        buf.put_slice(&self.biome_ids);
        buf.put_u8(
            (if self.light_populated { 4 } else { 0 })
                | (if self.terrain_populated { 2 } else { 0 })
                | (if self.terrain_generated { 1 } else { 0 }),
        );

        buf.to_vec()
    }

    /// Exact inverse of [`fast_serialize`](Self::fast_serialize). `None` on
    /// truncated or structurally invalid input.
    pub fn fast_deserialize(data: &[u8]) -> Option<Chunk> {
        let mut buf = data;
        if buf.remaining() < 9 {
            return None;
        }
        let x = buf.get_i32();
        let z = buf.get_i32();

        let count = buf.get_u8();
        let mut sub_chunks = Vec::with_capacity(count as usize);
        for _ in 0..count {
            if buf.remaining() < 1 + FAST_SERIALIZED_LEN {
                return None;
            }
            let y = buf.get_u8() as usize;
            if y >= MAX_SUBCHUNKS {
                return None;
            }
            let sub = SubChunk::fast_deserialize(&buf[..FAST_SERIALIZED_LEN])?;
            buf.advance(FAST_SERIALIZED_LEN);
            sub_chunks.push((y, sub));
        }

        if buf.remaining() < 512 + 256 + 1 {
            return None;
        }
        let mut height_map = vec![0u16; 256];
        for height in height_map.iter_mut() {
            *height = buf.get_u16_le();
        }
        let mut biome_ids = vec![0u8; 256];
        buf.copy_to_slice(&mut biome_ids);
        let flags = buf.get_u8();

        let mut chunk = Chunk::with_data(
            x,
            z,
            ChunkData {
                sub_chunks,
                biome_ids,
                height_map,
                ..ChunkData::default()
            },
        );
        chunk.light_populated = flags & 4 != 0;
        chunk.terrain_populated = flags & 2 != 0;
        chunk.terrain_generated = flags & 1 != 0;
        Some(chunk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    use crate::entity::Entity;
    use crate::tile::{Sign, Tile, TileFactory};

    struct TestEntity {
        id: i64,
        player: bool,
        savable: bool,
        closed: bool,
    }

    impl TestEntity {
        fn new(id: i64) -> EntityRef {
            Rc::new(RefCell::new(TestEntity {
                id,
                player: false,
                savable: true,
                closed: false,
            }))
        }

        fn player(id: i64) -> EntityRef {
            Rc::new(RefCell::new(TestEntity {
                id,
                player: true,
                savable: false,
                closed: false,
            }))
        }
    }

    impl Entity for TestEntity {
        fn id(&self) -> i64 {
            self.id
        }

        fn is_player(&self) -> bool {
            self.player
        }

        fn is_closed(&self) -> bool {
            self.closed
        }

        fn close(&mut self) {
            self.closed = true;
        }

        fn can_save_with_chunk(&self) -> bool {
            self.savable
        }

        fn save_nbt(&self) -> NbtCompound {
            let mut c = NbtCompound::new();
            c.insert("id".into(), NbtTag::String("Test".into()));
            c
        }
    }

    fn init_empty(chunk: &mut Chunk) {
        chunk.init_chunk(&EntityFactory::new(), &TileFactory::new());
    }

    fn sign_at(id: u64, x: i32, y: i32, z: i32) -> TileRef {
        Rc::new(RefCell::new(Sign::new(id, (x, y, z))))
    }

    // -- block access --

    #[test]
    fn full_block_composition() {
        let mut chunk = Chunk::new(0, 0);
        for (x, y, z, id, meta) in [
            (0usize, 0usize, 0usize, 1u8, 0u8),
            (15, 255, 15, 255, 15),
            (7, 100, 9, 42, 11),
        ] {
            assert!(chunk.set_block(x, y, z, Some(id), Some(meta)));
            assert_eq!(
                chunk.get_full_block(x, y, z),
                ((id as u16) << 4) | meta as u16
            );
            assert_eq!(chunk.get_block_id(x, y, z), id);
            assert_eq!(chunk.get_block_data(x, y, z), meta);
        }
        assert!(chunk.has_changed());
    }

    #[test]
    fn unchanged_write_does_not_dirty() {
        let mut chunk = Chunk::new(0, 0);
        chunk.set_block(1, 1, 1, Some(5), Some(0));
        chunk.set_changed(false);
        assert!(!chunk.set_block(1, 1, 1, Some(5), Some(0)));
        assert!(!chunk.has_changed());
    }

    #[test]
    fn write_materializes_only_target_slot() {
        let mut chunk = Chunk::new(3, -4);
        chunk.set_block_id(4, 71, 12, 1); // slot 4

        for (y, slot) in chunk.get_sub_chunks().iter().enumerate() {
            if y == 4 {
                assert!(!slot.is_empty_stub(), "target slot materialized");
            } else {
                assert!(slot.is_empty_stub(), "slot {y} still the shared stub");
            }
        }
    }

    #[test]
    fn reads_never_materialize() {
        let chunk = Chunk::new(0, 0);
        assert_eq!(chunk.get_block_id(8, 200, 8), 0);
        assert_eq!(chunk.get_block_sky_light(8, 200, 8), 15);
        assert!(chunk.get_sub_chunks().iter().all(SubChunkSlot::is_empty_stub));
    }

    #[test]
    fn light_set_get() {
        let mut chunk = Chunk::new(0, 0);
        chunk.set_block_sky_light(3, 40, 3, 9);
        chunk.set_block_light(3, 40, 3, 12);
        assert_eq!(chunk.get_block_sky_light(3, 40, 3), 9);
        assert_eq!(chunk.get_block_light(3, 40, 3), 12);
        assert!(chunk.has_changed());
    }

    #[test]
    fn extra_data_set_clear() {
        let mut chunk = Chunk::new(0, 0);
        assert_eq!(chunk.get_block_extra_data(1, 2, 3), 0);
        chunk.set_block_extra_data(1, 2, 3, 0x0102);
        assert_eq!(chunk.get_block_extra_data(1, 2, 3), 0x0102);
        chunk.set_block_extra_data(1, 2, 3, 0);
        assert_eq!(chunk.get_block_extra_data(1, 2, 3), 0);
        assert!(chunk.block_extra_data_array().is_empty());
    }

    // -- height map and light --

    #[test]
    fn height_map_column_single_opaque_block() {
        let mut chunk = Chunk::new(0, 0);
        let table = BlockLightTable::new();
        chunk.set_block_id(2, 5, 2, 1); // stone at y=5
        assert_eq!(chunk.recalculate_height_map_column(2, 2, &table), 6);
        assert_eq!(chunk.get_height_map(2, 2), 6);
    }

    #[test]
    fn height_map_column_all_air() {
        let mut chunk = Chunk::new(0, 0);
        let table = BlockLightTable::new();
        assert_eq!(chunk.recalculate_height_map_column(0, 0, &table), 0);
    }

    #[test]
    fn height_map_sees_through_transparent_blocks() {
        let mut chunk = Chunk::new(0, 0);
        let table = BlockLightTable::new();
        chunk.set_block_id(0, 10, 0, 1); // stone
        chunk.set_block_id(0, 20, 0, 20); // glass above it
        // glass is fully transparent, the scan stops at the stone
        assert_eq!(chunk.recalculate_height_map_column(0, 0, &table), 11);
    }

    #[test]
    fn height_map_stops_at_diffuser() {
        let mut chunk = Chunk::new(0, 0);
        let table = BlockLightTable::new();
        chunk.set_block_id(0, 30, 0, 18); // leaves diffuse sky light
        assert_eq!(chunk.recalculate_height_map_column(0, 0, &table), 31);
    }

    #[test]
    fn highest_block() {
        let mut chunk = Chunk::new(0, 0);
        assert_eq!(chunk.get_highest_block_at(0, 0), -1);
        chunk.set_block_id(0, 5, 0, 1);
        chunk.set_block_id(0, 37, 0, 1);
        assert_eq!(chunk.get_highest_block_at(0, 0), 37);
        assert_eq!(chunk.get_highest_block_at(1, 0), -1);
    }

    #[test]
    fn sky_light_population_direct_column() {
        let mut chunk = Chunk::new(0, 0);
        let table = BlockLightTable::new();
        // flat stone floor at y=4
        for x in 0..16 {
            for z in 0..16 {
                chunk.set_block_id(x, 4, z, 1);
            }
        }
        chunk.recalculate_height_map(&table);
        chunk.populate_sky_light(&table);

        assert_eq!(chunk.get_block_sky_light(8, 10, 8), 15, "above terrain");
        assert_eq!(chunk.get_block_sky_light(8, 5, 8), 15, "at height boundary");
        assert_eq!(chunk.get_block_sky_light(8, 3, 8), 0, "below opaque floor");
    }

    #[test]
    fn sky_light_attenuates_through_water() {
        let mut chunk = Chunk::new(0, 0);
        let table = BlockLightTable::new();
        // water column from y=10 down to y=0 at one position
        for y in 0..=10 {
            chunk.set_block_id(6, y, 6, 9);
        }
        chunk.recalculate_height_map(&table);
        chunk.populate_sky_light(&table);

        // boundary sits above the water; each water block filters 2
        assert_eq!(chunk.get_height_map(6, 6), 11);
        assert_eq!(chunk.get_block_sky_light(6, 11, 6), 15);
        assert_eq!(chunk.get_block_sky_light(6, 10, 6), 13);
        assert_eq!(chunk.get_block_sky_light(6, 9, 6), 11);
    }

    // -- entities and tiles --

    #[test]
    fn entity_dirty_rules() {
        let mut chunk = Chunk::new(0, 0);
        init_empty(&mut chunk);
        assert!(!chunk.has_changed());

        let mob = TestEntity::new(1);
        chunk.add_entity(Rc::clone(&mob));
        assert!(chunk.has_changed(), "mob add dirties an initialized chunk");

        chunk.set_changed(false);
        let player = TestEntity::player(2);
        chunk.add_entity(Rc::clone(&player));
        assert!(!chunk.has_changed(), "players never dirty the chunk");

        chunk.remove_entity(&mob);
        assert!(chunk.has_changed());
        assert_eq!(chunk.get_entities().len(), 1);
    }

    #[test]
    fn savable_entities_filtered() {
        let mut chunk = Chunk::new(0, 0);
        init_empty(&mut chunk);

        let keep = TestEntity::new(1);
        let player = TestEntity::player(2);
        let dying = TestEntity::new(3);
        chunk.add_entity(Rc::clone(&keep));
        chunk.add_entity(player);
        chunk.add_entity(Rc::clone(&dying));
        dying.borrow_mut().close();

        let savable = chunk.get_savable_entities();
        assert_eq!(savable.len(), 1);
        assert_eq!(savable[0].borrow().id(), 1);
    }

    #[test]
    fn tile_position_lookup() {
        let mut chunk = Chunk::new(0, 0);
        init_empty(&mut chunk);
        let sign = sign_at(1, 3, 64, 9);
        chunk.add_tile(Rc::clone(&sign));

        let found = chunk.get_tile(3, 64, 9).expect("indexed by position");
        assert!(Rc::ptr_eq(&found, &sign));
        assert!(chunk.get_tile(3, 65, 9).is_none());
    }

    #[test]
    fn tile_displacement_closes_previous() {
        let mut chunk = Chunk::new(0, 0);
        init_empty(&mut chunk);

        let old = sign_at(1, 5, 70, 5);
        let new = sign_at(2, 5, 70, 5);
        chunk.add_tile(Rc::clone(&old));
        chunk.add_tile(Rc::clone(&new));

        assert!(old.borrow().is_closed(), "displaced tile is closed");
        assert!(!new.borrow().is_closed());
        let found = chunk.get_tile(5, 70, 5).unwrap();
        assert!(Rc::ptr_eq(&found, &new));
        // the superseded tile stays registered under its own id
        assert_eq!(chunk.get_tiles().len(), 2);
    }

    #[test]
    fn re_adding_same_tile_does_not_close_it() {
        let mut chunk = Chunk::new(0, 0);
        init_empty(&mut chunk);
        let sign = sign_at(1, 0, 0, 0);
        chunk.add_tile(Rc::clone(&sign));
        chunk.add_tile(Rc::clone(&sign));
        assert!(!sign.borrow().is_closed());
    }

    #[test]
    fn remove_tile_clears_both_indexes() {
        let mut chunk = Chunk::new(0, 0);
        init_empty(&mut chunk);
        let sign = sign_at(1, 2, 3, 4);
        chunk.add_tile(Rc::clone(&sign));
        chunk.remove_tile(&sign);
        assert!(chunk.get_tiles().is_empty());
        assert!(chunk.get_tile(2, 3, 4).is_none());
    }

    #[test]
    fn unload_closes_non_players_and_tiles() {
        let mut chunk = Chunk::new(0, 0);
        init_empty(&mut chunk);
        let mob = TestEntity::new(1);
        let player = TestEntity::player(2);
        let sign = sign_at(1, 0, 0, 0);
        chunk.add_entity(Rc::clone(&mob));
        chunk.add_entity(Rc::clone(&player));
        chunk.add_tile(Rc::clone(&sign));

        chunk.on_unload();
        assert!(mob.borrow().is_closed());
        assert!(!player.borrow().is_closed());
        assert!(sign.borrow().is_closed());
    }

    // -- init_chunk --

    fn sign_nbt(x: i32, y: i32, z: i32) -> NbtCompound {
        let mut c = NbtCompound::new();
        c.insert("id".into(), NbtTag::String("Sign".into()));
        c.insert("x".into(), NbtTag::Int(x));
        c.insert("y".into(), NbtTag::Int(y));
        c.insert("z".into(), NbtTag::Int(z));
        c
    }

    #[test]
    fn init_materializes_tiles_once() {
        let mut chunk = Chunk::with_data(
            0,
            0,
            ChunkData {
                tiles: vec![sign_nbt(1, 64, 2)],
                ..ChunkData::default()
            },
        );
        let entities = EntityFactory::new();
        let tiles = TileFactory::with_defaults();

        chunk.init_chunk(&entities, &tiles);
        assert!(chunk.is_init());
        assert_eq!(chunk.get_tiles().len(), 1);
        assert!(!chunk.has_changed(), "clean records leave the chunk clean");

        // second call is a no-op
        chunk.init_chunk(&entities, &tiles);
        assert_eq!(chunk.get_tiles().len(), 1);
    }

    #[test]
    fn init_drops_record_missing_id_and_dirties() {
        let mut bad = NbtCompound::new();
        bad.insert("x".into(), NbtTag::Int(0));
        let mut chunk = Chunk::with_data(
            0,
            0,
            ChunkData {
                tiles: vec![bad],
                ..ChunkData::default()
            },
        );
        chunk.init_chunk(&EntityFactory::new(), &TileFactory::with_defaults());
        assert!(chunk.get_tiles().is_empty());
        assert!(chunk.has_changed(), "dirty so the bad record is not re-saved");
    }

    #[test]
    fn init_drops_unknown_entity_type_and_dirties() {
        let mut unknown = NbtCompound::new();
        unknown.insert("id".into(), NbtTag::String("Dragon".into()));
        let mut chunk = Chunk::with_data(
            0,
            0,
            ChunkData {
                entities: vec![unknown],
                ..ChunkData::default()
            },
        );
        chunk.init_chunk(&EntityFactory::new(), &TileFactory::new());
        assert!(chunk.get_entities().is_empty());
        assert!(chunk.has_changed());
    }

    // -- sub-chunk management --

    #[test]
    fn prune_resets_air_subchunks() {
        let mut chunk = Chunk::new(0, 0);
        chunk.set_block_id(0, 16, 0, 7); // slot 1
        chunk.set_block_id(0, 32, 0, 7); // slot 2
        chunk.set_block_id(0, 16, 0, 0); // slot 1 back to air, stays materialized
        chunk.set_changed(false);

        chunk.prune_empty_sub_chunks();
        assert!(chunk.get_sub_chunks()[1].is_empty_stub(), "air slot pruned");
        assert!(!chunk.get_sub_chunks()[2].is_empty_stub(), "live slot kept");
        assert!(chunk.has_changed());
    }

    #[test]
    fn prune_is_noop_on_stubs() {
        let mut chunk = Chunk::new(0, 0);
        chunk.prune_empty_sub_chunks();
        assert!(!chunk.has_changed());
    }

    #[test]
    fn set_sub_chunk_empty_policy() {
        let mut chunk = Chunk::new(0, 0);
        assert!(chunk.set_sub_chunk(3, Some(SubChunk::new()), false));
        assert!(chunk.get_sub_chunks()[3].is_empty_stub(), "air collapses to stub");

        assert!(chunk.set_sub_chunk(3, Some(SubChunk::new()), true));
        assert!(!chunk.get_sub_chunks()[3].is_empty_stub(), "allow_empty keeps it");

        assert!(chunk.set_sub_chunk(3, None, false));
        assert!(chunk.get_sub_chunks()[3].is_empty_stub());

        assert!(!chunk.set_sub_chunk(16, None, false), "out of range rejected");
    }

    // -- serialization --

    #[test]
    fn network_layout_empty_chunk() {
        let mut chunk = Chunk::new(0, 0);
        init_empty(&mut chunk);
        let bytes = chunk.network_serialize();
        assert_eq!(chunk.get_sub_chunk_send_count(), 0);
        // count byte + height map + biomes + border byte
        assert_eq!(bytes.len(), 1 + 512 + 256 + 1);
        assert_eq!(bytes[0], 0);
    }

    #[test]
    fn network_layout_counts_subchunks() {
        let mut chunk = Chunk::new(0, 0);
        init_empty(&mut chunk);
        chunk.set_block_id(0, 33, 0, 1); // slot 2 -> send count 3

        let bytes = chunk.network_serialize();
        assert_eq!(chunk.get_sub_chunk_send_count(), 3);
        assert_eq!(bytes[0], 3);
        assert_eq!(bytes.len(), 1 + 3 * 10240 + 512 + 256 + 1);
    }

    #[test]
    fn network_includes_spawnable_tiles() {
        let mut chunk = Chunk::new(0, 0);
        init_empty(&mut chunk);
        let without_tiles = chunk.network_serialize().len();

        chunk.add_tile(sign_at(1, 0, 10, 0));
        let with_tiles = chunk.network_serialize().len();
        assert!(with_tiles > without_tiles);
    }

    #[test]
    fn fast_roundtrip_reproduces_chunk() {
        let mut chunk = Chunk::new(-12, 34);
        chunk.set_block(0, 0, 0, Some(7), Some(3));
        chunk.set_block(15, 255, 15, Some(20), Some(1));
        chunk.set_block_sky_light(4, 100, 4, 8);
        chunk.set_biome_id(3, 3, 21);
        chunk.set_height_map(5, 5, 99);
        chunk.set_generated(true);
        chunk.set_populated(true);

        let restored = Chunk::fast_deserialize(&chunk.fast_serialize()).unwrap();
        assert_eq!(restored.x(), -12);
        assert_eq!(restored.z(), 34);
        assert_eq!(restored.get_full_block(0, 0, 0), chunk.get_full_block(0, 0, 0));
        assert_eq!(
            restored.get_full_block(15, 255, 15),
            chunk.get_full_block(15, 255, 15)
        );
        assert_eq!(restored.get_block_sky_light(4, 100, 4), 8);
        assert_eq!(restored.get_biome_id(3, 3), 21);
        assert_eq!(restored.get_height_map(5, 5), 99);
        assert!(restored.is_generated());
        assert!(restored.is_populated());
        assert!(!restored.is_light_populated());

        // untouched slots come back as the shared stub
        for y in [1usize, 2, 3, 4, 5, 7, 8, 14] {
            assert!(restored.get_sub_chunks()[y].is_empty_stub());
        }
    }

    #[test]
    fn fast_serialize_skips_stub_slots() {
        let mut chunk = Chunk::new(0, 0);
        chunk.set_block_id(0, 0, 0, 1); // only slot 0 materialized
        let bytes = chunk.fast_serialize();
        // x + z + count + (index + sub-chunk) + height map + biomes + flags
        assert_eq!(bytes.len(), 4 + 4 + 1 + (1 + 10240) + 512 + 256 + 1);
        assert_eq!(bytes[8], 1, "one sub-chunk transmitted");
    }

    #[test]
    fn fast_deserialize_rejects_truncated() {
        let mut chunk = Chunk::new(0, 0);
        chunk.set_block_id(0, 0, 0, 1);
        let bytes = chunk.fast_serialize();
        assert!(Chunk::fast_deserialize(&bytes[..bytes.len() - 100]).is_none());
        assert!(Chunk::fast_deserialize(&[]).is_none());
    }

    #[test]
    #[should_panic(expected = "height map")]
    fn wrong_height_map_length_panics() {
        Chunk::with_data(
            0,
            0,
            ChunkData {
                height_map: vec![0; 100],
                ..ChunkData::default()
            },
        );
    }

    #[test]
    #[should_panic(expected = "biome")]
    fn wrong_biome_length_panics() {
        Chunk::with_data(
            0,
            0,
            ChunkData {
                biome_ids: vec![0; 17],
                ..ChunkData::default()
            },
        );
    }
}
