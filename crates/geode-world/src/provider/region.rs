//! Region file access: 32x32 chunks per file, 4 KiB sectors, zlib payloads.
//!
//! Header layout: 1024 big-endian u32 location entries
//! (`sector_offset << 8 | sector_count`), then 1024 big-endian u32 modify
//! timestamps. Chunk payloads start with a big-endian u32 length covering the
//! compression byte plus the compressed bytes.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use flate2::read::{GzDecoder, ZlibDecoder};
use flate2::write::ZlibEncoder;
use flate2::Compression;

use super::ProviderError;

pub(crate) const REGION_EDGE: i32 = 32;

const SECTOR_BYTES: u64 = 4096;
const HEADER_SECTORS: u64 = 2;

const COMPRESSION_GZIP: u8 = 1;
const COMPRESSION_ZLIB: u8 = 2;

pub(crate) struct RegionFile {
    file: File,
    path: PathBuf,
    locations: [u32; 1024],
    timestamps: [u32; 1024],
}

fn entry_index(x: u32, z: u32) -> usize {
    debug_assert!(x < 32 && z < 32);
    ((z << 5) | x) as usize
}

fn now_secs() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as u32
}

impl RegionFile {
    /// Open a region file, creating an empty one (header only) if absent.
    pub fn open(path: &Path) -> Result<Self, ProviderError> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let len = file.metadata()?.len();
        let mut locations = [0u32; 1024];
        let mut timestamps = [0u32; 1024];

        if len < HEADER_SECTORS * SECTOR_BYTES {
            // fresh file: write a zeroed header
            file.set_len(0)?;
            file.seek(SeekFrom::Start(0))?;
            file.write_all(&[0u8; (HEADER_SECTORS * SECTOR_BYTES) as usize])?;
        } else {
            let mut header = [0u8; (HEADER_SECTORS * SECTOR_BYTES) as usize];
            file.seek(SeekFrom::Start(0))?;
            file.read_exact(&mut header)?;
            for i in 0..1024 {
                locations[i] = u32::from_be_bytes(header[i * 4..i * 4 + 4].try_into().unwrap());
                timestamps[i] =
                    u32::from_be_bytes(header[4096 + i * 4..4096 + i * 4 + 4].try_into().unwrap());
            }
        }

        Ok(Self {
            file,
            path: path.to_path_buf(),
            locations,
            timestamps,
        })
    }

    fn corrupt(&self, reason: impl Into<String>) -> ProviderError {
        ProviderError::CorruptRegion {
            path: self.path.clone(),
            reason: reason.into(),
        }
    }

    /// Local coordinates of every stored chunk.
    pub fn chunks_present(&self) -> Vec<(u32, u32)> {
        let mut present = Vec::new();
        for z in 0..32u32 {
            for x in 0..32u32 {
                if self.locations[entry_index(x, z)] != 0 {
                    present.push((x, z));
                }
            }
        }
        present
    }

    /// Read and decompress one chunk payload. `Ok(None)` when the slot is
    /// unused.
    pub fn read_chunk(&mut self, x: u32, z: u32) -> Result<Option<Vec<u8>>, ProviderError> {
        let location = self.locations[entry_index(x, z)];
        if location == 0 {
            return Ok(None);
        }

        let stored = self.read_stored(location)?;
        let compression = stored[0];
        let payload = &stored[1..];

        let mut raw = Vec::new();
        match compression {
            COMPRESSION_ZLIB => ZlibDecoder::new(payload)
                .read_to_end(&mut raw)
                .map_err(|e| self.corrupt(format!("zlib: {e}")))?,
            COMPRESSION_GZIP => GzDecoder::new(payload)
                .read_to_end(&mut raw)
                .map_err(|e| self.corrupt(format!("gzip: {e}")))?,
            other => return Err(self.corrupt(format!("unknown compression type {other}"))),
        };
        Ok(Some(raw))
    }

    /// The stored block for one location entry: compression byte + compressed
    /// payload.
    fn read_stored(&mut self, location: u32) -> Result<Vec<u8>, ProviderError> {
        let sector_offset = (location >> 8) as u64;
        let sector_count = (location & 0xff) as u64;
        if sector_offset < HEADER_SECTORS || sector_count == 0 {
            return Err(self.corrupt(format!("bad location entry {location:#010x}")));
        }

        self.file.seek(SeekFrom::Start(sector_offset * SECTOR_BYTES))?;
        let mut length_bytes = [0u8; 4];
        self.file.read_exact(&mut length_bytes)?;
        let length = u32::from_be_bytes(length_bytes) as u64;
        if length == 0 || length > sector_count * SECTOR_BYTES - 4 {
            return Err(self.corrupt(format!("bad payload length {length}")));
        }

        let mut stored = vec![0u8; length as usize];
        self.file.read_exact(&mut stored)?;
        Ok(stored)
    }

    /// Compress and store one chunk payload, reusing the old sector span when
    /// it still fits and appending otherwise.
    pub fn write_chunk(&mut self, x: u32, z: u32, raw: &[u8]) -> Result<(), ProviderError> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(raw)?;
        let compressed = encoder.finish()?;

        let stored_len = 1 + compressed.len() as u64; // compression byte + data
        let total_len = 4 + stored_len; // length prefix
        let sectors_needed = total_len.div_ceil(SECTOR_BYTES);
        if sectors_needed > 0xff {
            return Err(self.corrupt(format!("chunk too large: {total_len} bytes")));
        }

        let index = entry_index(x, z);
        let old = self.locations[index];
        let old_offset = (old >> 8) as u64;
        let old_count = (old & 0xff) as u64;

        let sector_offset = if old != 0 && sectors_needed <= old_count {
            old_offset
        } else {
            let len = self.file.metadata()?.len();
            len.div_ceil(SECTOR_BYTES).max(HEADER_SECTORS)
        };

        self.file.seek(SeekFrom::Start(sector_offset * SECTOR_BYTES))?;
        self.file.write_all(&(stored_len as u32).to_be_bytes())?;
        self.file.write_all(&[COMPRESSION_ZLIB])?;
        self.file.write_all(&compressed)?;
        let padding = sectors_needed * SECTOR_BYTES - total_len;
        self.file.write_all(&vec![0u8; padding as usize])?;

        let location = ((sector_offset as u32) << 8) | sectors_needed as u32;
        self.set_location(index, location, now_secs())?;
        Ok(())
    }

    fn set_location(&mut self, index: usize, location: u32, timestamp: u32) -> Result<(), ProviderError> {
        self.locations[index] = location;
        self.timestamps[index] = timestamp;
        self.file.seek(SeekFrom::Start(index as u64 * 4))?;
        self.file.write_all(&location.to_be_bytes())?;
        self.file.seek(SeekFrom::Start(4096 + index as u64 * 4))?;
        self.file.write_all(&timestamp.to_be_bytes())?;
        Ok(())
    }

    /// Rewrite the file with chunks packed back to back, dropping the gaps
    /// that in-place rewrites leave behind. Returns the bytes reclaimed.
    pub fn compact(&mut self) -> Result<u64, ProviderError> {
        let old_len = self.file.metadata()?.len();

        let mut entries = Vec::new();
        for index in 0..1024 {
            let location = self.locations[index];
            if location == 0 {
                continue;
            }
            let stored = self.read_stored(location)?;
            entries.push((index, self.timestamps[index], stored));
        }

        let mut next_sector = HEADER_SECTORS;
        self.locations = [0; 1024];
        self.timestamps = [0; 1024];
        for (index, timestamp, stored) in &entries {
            let total_len = 4 + stored.len() as u64;
            let sectors = total_len.div_ceil(SECTOR_BYTES);

            self.file.seek(SeekFrom::Start(next_sector * SECTOR_BYTES))?;
            self.file.write_all(&(stored.len() as u32).to_be_bytes())?;
            self.file.write_all(stored)?;
            let padding = sectors * SECTOR_BYTES - total_len;
            self.file.write_all(&vec![0u8; padding as usize])?;

            self.locations[*index] = ((next_sector as u32) << 8) | sectors as u32;
            self.timestamps[*index] = *timestamp;
            next_sector += sectors;
        }

        // rewrite the whole header and drop the tail
        let mut header = vec![0u8; (HEADER_SECTORS * SECTOR_BYTES) as usize];
        for i in 0..1024 {
            header[i * 4..i * 4 + 4].copy_from_slice(&self.locations[i].to_be_bytes());
            header[4096 + i * 4..4096 + i * 4 + 4].copy_from_slice(&self.timestamps[i].to_be_bytes());
        }
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&header)?;

        let new_len = next_sector * SECTOR_BYTES;
        self.file.set_len(new_len)?;
        self.file.flush()?;
        Ok(old_len.saturating_sub(new_len))
    }

    pub fn flush(&mut self) -> Result<(), ProviderError> {
        self.file.flush()?;
        Ok(())
    }
}
