use std::time::SystemTime;

use bytes::Bytes;

use crate::error::ProtocolError;
use crate::util::buf_ext::BufExt;

/// A position in a [`ReadCursor`] that can be returned to later
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct CursorMark(usize);

/// Typed, bounds-checked reads over a packet body. A failed read leaves the cursor where it was.
#[derive(Debug, Clone)]
pub struct ReadCursor {
    data: Bytes,
    pos: usize,
}

macro_rules! read_impl {
    ($name: ident, $ty:ty, $try_getter: ident) => {
        pub fn $name(&mut self) -> Result<$ty, ProtocolError> {
            self.read_with(|b| b.$try_getter())
        }
    }
}

impl ReadCursor {
    pub fn new(data: Bytes) -> ReadCursor {
        ReadCursor { data, pos: 0 }
    }

    fn read_with<T>(&mut self, f: impl FnOnce(&mut &[u8]) -> Result<T, ProtocolError>) -> Result<T, ProtocolError> {
        let mut slice = &self.data[self.pos..];
        let before = slice.len();
        let result = f(&mut slice)?;
        self.pos += before - slice.len();
        Ok(result)
    }

    read_impl!(read_u8, u8, try_get_u8);
    read_impl!(read_bool, bool, try_get_bool);
    read_impl!(read_i16, i16, try_get_i16_le);
    read_impl!(read_u16, u16, try_get_u16_le);
    read_impl!(read_i32, i32, try_get_i32_le);
    read_impl!(read_u32, u32, try_get_u32_le);
    read_impl!(read_i64, i64, try_get_i64_le);
    read_impl!(read_f32, f32, try_get_f32_le);
    read_impl!(read_f64, f64, try_get_f64_le);
    read_impl!(read_date, SystemTime, try_get_date);
    read_impl!(read_string, String, try_get_string);

    pub fn read_bytes(&mut self, len: usize) -> Result<Bytes, ProtocolError> {
        if self.remaining() < len {
            return Err(ProtocolError::Incomplete);
        }
        let result = self.data.slice(self.pos..self.pos + len);
        self.pos += len;
        Ok(result)
    }

    pub fn read_remaining(&mut self) -> Bytes {
        let result = self.data.slice(self.pos..);
        self.pos = self.data.len();
        result
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn save_cursor(&self) -> CursorMark {
        CursorMark(self.pos)
    }

    pub fn restore_cursor(&mut self, mark: CursorMark) {
        // marks can only be created by this cursor's save_cursor(), so they are in range
        debug_assert!(mark.0 <= self.data.len());
        self.pos = mark.0.min(self.data.len());
    }
}
