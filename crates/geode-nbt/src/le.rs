//! Little-endian NBT variant (Bedrock disk layout; LevelDB values and
//! LevelDB-format level.dat).

use bytes::{Buf, BufMut};

use crate::error::NbtError;
use crate::io::NbtVariant;

pub(crate) struct LeVariant;

macro_rules! need {
    ($buf:expr, $n:expr) => {
        if $buf.remaining() < $n {
            return Err(NbtError::UnexpectedEof);
        }
    };
}

impl NbtVariant for LeVariant {
    fn write_short(buf: &mut impl BufMut, value: i16) {
        buf.put_i16_le(value);
    }

    fn read_short(buf: &mut impl Buf) -> Result<i16, NbtError> {
        need!(buf, 2);
        Ok(buf.get_i16_le())
    }

    fn write_int(buf: &mut impl BufMut, value: i32) {
        buf.put_i32_le(value);
    }

    fn read_int(buf: &mut impl Buf) -> Result<i32, NbtError> {
        need!(buf, 4);
        Ok(buf.get_i32_le())
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
        buf.put_i32_le(len);
    }

    fn read_array_len(buf: &mut impl Buf) -> Result<i32, NbtError> {
        need!(buf, 4);
        Ok(buf.get_i32_le())
    }

    fn write_string_len(buf: &mut impl BufMut, len: usize) {
        buf.put_u16_le(len as u16);
    }

    fn read_string_len(buf: &mut impl Buf) -> Result<usize, NbtError> {
        need!(buf, 2);
        Ok(buf.get_u16_le() as usize)
    }
}
