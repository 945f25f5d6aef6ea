//! Network NBT variant (VarInt ints and array lengths, VarUInt32 string
//! lengths; remaining widths match the little-endian disk layout).

use bytes::{Buf, BufMut};

use crate::error::NbtError;
use crate::io::NbtVariant;

pub(crate) struct NetworkVariant;

fn write_varuint32(buf: &mut impl BufMut, mut value: u32) {
    loop {
        if value & !0x7F == 0 {
            buf.put_u8(value as u8);
            return;
        }
        buf.put_u8((value & 0x7F | 0x80) as u8);
        value >>= 7;
    }
}

fn read_varuint32(buf: &mut impl Buf) -> Result<u32, NbtError> {
    let mut value: u32 = 0;
    for shift in 0..5 {
        if !buf.has_remaining() {
            return Err(NbtError::UnexpectedEof);
        }
        let byte = buf.get_u8();
        value |= u32::from(byte & 0x7F) << (shift * 7);
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(NbtError::VarIntTooLong)
}

fn write_zigzag32(buf: &mut impl BufMut, value: i32) {
    write_varuint32(buf, ((value << 1) ^ (value >> 31)) as u32);
}

fn read_zigzag32(buf: &mut impl Buf) -> Result<i32, NbtError> {
    let raw = read_varuint32(buf)?;
    Ok((raw >> 1) as i32 ^ -((raw & 1) as i32))
}

macro_rules! need {
    ($buf:expr, $n:expr) => {
        if $buf.remaining() < $n {
            return Err(NbtError::UnexpectedEof);
        }
    };
}

impl NbtVariant for NetworkVariant {
    fn write_short(buf: &mut impl BufMut, value: i16) {
        buf.put_i16_le(value);
    }

    fn read_short(buf: &mut impl Buf) -> Result<i16, NbtError> {
        need!(buf, 2);
        Ok(buf.get_i16_le())
    }

    fn write_int(buf: &mut impl BufMut, value: i32) {
        write_zigzag32(buf, value);
    }

    fn read_int(buf: &mut impl Buf) -> Result<i32, NbtError> {
        read_zigzag32(buf)
    }

    fn write_long(buf: &mut impl BufMut, value: i64) {
        buf.put_i64_le(value);
    }

    fn read_long(buf: &mut impl Buf) -> Result<i64, NbtError> {
        need!(buf, 8);
        Ok(buf.get_i64_le())
    }

    fn write_float(buf: &mut impl BufMut, value: f32) {
        buf.put_f32_le(value);
    }

    fn read_float(buf: &mut impl Buf) -> Result<f32, NbtError> {
        need!(buf, 4);
        Ok(buf.get_f32_le())
    }

    fn write_double(buf: &mut impl BufMut, value: f64) {
        buf.put_f64_le(value);
    }

    fn read_double(buf: &mut impl Buf) -> Result<f64, NbtError> {
        need!(buf, 8);
        Ok(buf.get_f64_le())
    }

    fn write_array_len(buf: &mut impl BufMut, len: i32) {
        write_zigzag32(buf, len);
    }

    fn read_array_len(buf: &mut impl Buf) -> Result<i32, NbtError> {
        read_zigzag32(buf)
    }

    fn write_string_len(buf: &mut impl BufMut, len: usize) {
        write_varuint32(buf, len as u32);
    }

    fn read_string_len(buf: &mut impl Buf) -> Result<usize, NbtError> {
        Ok(read_varuint32(buf)? as usize)
    }
}
