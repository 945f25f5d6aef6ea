//! NBT (Named Binary Tag) implementation covering the three layouts the
//! storage stack needs:
//!
//! - **Big-endian**: Java layout, used inside region files and the region
//!   format's gzipped level.dat. Ints are i32_be, string lengths u16_be.
//! - **Little-endian**: Bedrock disk layout, used for LevelDB values and the
//!   LevelDB format's level.dat. Ints are i32_le, string lengths u16_le.
//! - **Network**: used for tile spawn compounds in chunk packets. Ints are
//!   VarInt (ZigZag), string lengths VarUInt32.

pub mod error;
pub mod tag;

mod be;
mod io;
mod le;
mod network;

pub use error::NbtError;
pub use tag::{CompoundExt, NbtCompound, NbtRoot, NbtTag};

use bytes::{Buf, BufMut};

/// Read big-endian (Java layout) NBT from a buffer.
pub fn read_nbt_be(buf: &mut impl Buf) -> Result<NbtRoot, NbtError> {
    io::read_nbt::<be::BeVariant>(buf)
}

/// Write big-endian (Java layout) NBT to a buffer.
pub fn write_nbt_be(buf: &mut impl BufMut, root: &NbtRoot) {
    io::write_nbt::<be::BeVariant>(buf, root)
}

/// Read little-endian (Bedrock disk layout) NBT from a buffer.
pub fn read_nbt_le(buf: &mut impl Buf) -> Result<NbtRoot, NbtError> {
    io::read_nbt::<le::LeVariant>(buf)
}

/// Write little-endian (Bedrock disk layout) NBT to a buffer.
pub fn write_nbt_le(buf: &mut impl BufMut, root: &NbtRoot) {
    io::write_nbt::<le::LeVariant>(buf, root)
}

/// Read network NBT (VarInt variant) from a buffer.
pub fn read_nbt_network(buf: &mut impl Buf) -> Result<NbtRoot, NbtError> {
    io::read_nbt::<network::NetworkVariant>(buf)
}

/// Write network NBT (VarInt variant) to a buffer.
pub fn write_nbt_network(buf: &mut impl BufMut, root: &NbtRoot) {
    io::write_nbt::<network::NetworkVariant>(buf, root)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    fn sample_root() -> NbtRoot {
        let mut pos = NbtCompound::new();
        pos.insert("x".into(), NbtTag::Int(128));
        pos.insert("y".into(), NbtTag::Int(70));
        pos.insert("z".into(), NbtTag::Int(-32));

        let mut c = NbtCompound::new();
        c.insert("id".into(), NbtTag::String("Chest".into()));
        c.insert("pos".into(), NbtTag::Compound(pos));
        c.insert("Damage".into(), NbtTag::Short(-3));
        c.insert("Seed".into(), NbtTag::Long(i64::MIN + 7));
        c.insert("Health".into(), NbtTag::Float(19.5));
        c.insert("FallDistance".into(), NbtTag::Double(0.25));
        c.insert("Data".into(), NbtTag::ByteArray(vec![1, -2, 3, -4]));
        c.insert("HeightMap".into(), NbtTag::IntArray(vec![256, 0, -1, 70]));
        c.insert("Times".into(), NbtTag::LongArray(vec![i64::MIN, 0, i64::MAX]));
        c.insert(
            "Items".into(),
            NbtTag::List(vec![
                NbtTag::Compound({
                    let mut item = NbtCompound::new();
                    item.insert("Slot".into(), NbtTag::Byte(0));
                    item.insert("Count".into(), NbtTag::Byte(64));
                    item
                }),
                NbtTag::Compound({
                    let mut item = NbtCompound::new();
                    item.insert("Slot".into(), NbtTag::Byte(9));
                    item.insert("Count".into(), NbtTag::Byte(1));
                    item
                }),
            ]),
        );
        NbtRoot::new("", c)
    }

    #[test]
    fn be_roundtrip() {
        let root = sample_root();
        let mut buf = BytesMut::new();
        write_nbt_be(&mut buf, &root);
        assert_eq!(read_nbt_be(&mut buf.freeze()).unwrap(), root);
    }

    #[test]
    fn le_roundtrip() {
        let root = sample_root();
        let mut buf = BytesMut::new();
        write_nbt_le(&mut buf, &root);
        assert_eq!(read_nbt_le(&mut buf.freeze()).unwrap(), root);
    }

    #[test]
    fn network_roundtrip() {
        let root = sample_root();
        let mut buf = BytesMut::new();
        write_nbt_network(&mut buf, &root);
        assert_eq!(read_nbt_network(&mut buf.freeze()).unwrap(), root);
    }

    #[test]
    fn empty_compound_all_variants() {
        let root = NbtRoot::new("level", NbtCompound::new());

        let mut buf = BytesMut::new();
        write_nbt_be(&mut buf, &root);
        assert_eq!(read_nbt_be(&mut buf.freeze()).unwrap(), root);

        let mut buf = BytesMut::new();
        write_nbt_le(&mut buf, &root);
        assert_eq!(read_nbt_le(&mut buf.freeze()).unwrap(), root);

        let mut buf = BytesMut::new();
        write_nbt_network(&mut buf, &root);
        assert_eq!(read_nbt_network(&mut buf.freeze()).unwrap(), root);
    }

    #[test]
    fn be_and_le_encodings_differ() {
        let mut c = NbtCompound::new();
        c.insert("val".into(), NbtTag::Int(0x01020304));
        let root = NbtRoot::new("", c);

        let mut be_buf = BytesMut::new();
        write_nbt_be(&mut be_buf, &root);
        let mut le_buf = BytesMut::new();
        write_nbt_le(&mut le_buf, &root);

        assert_eq!(be_buf.len(), le_buf.len());
        assert_ne!(be_buf, le_buf);
    }

    #[test]
    fn network_int_is_compact() {
        let mut c = NbtCompound::new();
        c.insert("v".into(), NbtTag::Int(1));
        let root = NbtRoot::new("", c);

        let mut le_buf = BytesMut::new();
        write_nbt_le(&mut le_buf, &root);
        let mut net_buf = BytesMut::new();
        write_nbt_network(&mut net_buf, &root);

        // zigzag(1) fits in one byte against four for i32_le
        assert!(net_buf.len() < le_buf.len());
    }

    #[test]
    fn be_int_layout() {
        // TAG_Int named "n" = 5: 03 | u16_be len | "n" | i32_be
        let mut c = NbtCompound::new();
        c.insert("n".into(), NbtTag::Int(5));
        let mut buf = BytesMut::new();
        write_nbt_be(&mut buf, &NbtRoot::new("", c));
        assert_eq!(
            &buf[..],
            &[
                10, 0, 0, // root compound, name ""
                3, 0, 1, b'n', // TAG_Int "n"
                0, 0, 0, 5, // value
                0, // TAG_End
            ]
        );
    }

    #[test]
    fn empty_buffer_error() {
        let data = bytes::Bytes::new();
        assert!(read_nbt_be(&mut data.clone()).is_err());
        assert!(read_nbt_le(&mut data.clone()).is_err());
        assert!(read_nbt_network(&mut data.clone()).is_err());
    }

    #[test]
    fn wrong_root_type_error() {
        // TAG_Byte instead of TAG_Compound
        let data = bytes::Bytes::from_static(&[1]);
        assert!(matches!(
            read_nbt_be(&mut data.clone()),
            Err(NbtError::ExpectedCompound { got: 1 })
        ));
    }

    #[test]
    fn truncated_payload_error() {
        let mut c = NbtCompound::new();
        c.insert("big".into(), NbtTag::LongArray(vec![1, 2, 3]));
        let mut buf = BytesMut::new();
        write_nbt_be(&mut buf, &NbtRoot::new("", c));

        let full = buf.freeze();
        let mut truncated = full.slice(0..full.len() - 10);
        assert!(matches!(
            read_nbt_be(&mut truncated),
            Err(NbtError::UnexpectedEof)
        ));
    }
}
