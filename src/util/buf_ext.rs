use std::time::{Duration, SystemTime};

use crate::error::ProtocolError;


macro_rules! get_try_impl {
    ($try_getter: ident, $ty:ty, $getter: ident) => {
        fn $try_getter(&mut self) -> Result<$ty, ProtocolError> {
            if self.remaining() < size_of::<$ty>() {
                return Err(ProtocolError::Incomplete);
            }
            Ok(self.$getter())
        }
    }
}

/// Checked little-endian getters for everything that goes over the wire. Running out of bytes is
///  reported as [`ProtocolError::Incomplete`] so stream reassembly can wait for more data.
pub trait BufExt: bytes::Buf {
    get_try_impl!(try_get_u8, u8, get_u8);
    get_try_impl!(try_get_u16_le, u16, get_u16_le);
    get_try_impl!(try_get_u32_le, u32, get_u32_le);
    get_try_impl!(try_get_u64_le, u64, get_u64_le);

    get_try_impl!(try_get_i8, i8, get_i8);
    get_try_impl!(try_get_i16_le, i16, get_i16_le);
    get_try_impl!(try_get_i32_le, i32, get_i32_le);
    get_try_impl!(try_get_i64_le, i64, get_i64_le);

    get_try_impl!(try_get_f32_le, f32, get_f32_le);
    get_try_impl!(try_get_f64_le, f64, get_f64_le);

    fn try_get_bool(&mut self) -> Result<bool, ProtocolError> {
        Ok(self.try_get_u8()? != 0)
    }

    fn try_get_bytes(&mut self, len: usize) -> Result<bytes::Bytes, ProtocolError> {
        if self.remaining() < len {
            return Err(ProtocolError::Incomplete);
        }
        Ok(self.copy_to_bytes(len))
    }

    fn try_get_string(&mut self) -> Result<String, ProtocolError> {
        let len: usize = self.try_get_u16_le()?.into();
        let raw = self.try_get_bytes(len)?;
        String::from_utf8(raw.to_vec())
            .map_err(|e| ProtocolError::Malformed(format!("string is not valid UTF-8: {}", e)))
    }

    /// dates are milliseconds since the epoch, negative for dates before 1970
    fn try_get_date(&mut self) -> Result<SystemTime, ProtocolError> {
        let millis = self.try_get_i64_le()?;
        let offset = Duration::from_millis(millis.unsigned_abs());
        let date = if millis >= 0 {
            SystemTime::UNIX_EPOCH.checked_add(offset)
        }
        else {
            SystemTime::UNIX_EPOCH.checked_sub(offset)
        };
        date.ok_or_else(|| ProtocolError::Malformed(format!("date out of range: {}", millis)))
    }
}

pub trait BufMutExt: bytes::BufMut {
    fn put_bool(&mut self, v: bool) {
        self.put_u8(if v { 1 } else { 0 });
    }

    /// Strings have a u16 length prefix. Nothing is written for a longer string.
    fn put_string(&mut self, s: &str) -> Result<(), ProtocolError> {
        let len = string_len(s)?;
        self.put_u16_le(len);
        self.put_slice(s.as_bytes());
        Ok(())
    }

    fn put_date(&mut self, date: SystemTime) {
        let millis = match date.duration_since(SystemTime::UNIX_EPOCH) {
            Ok(d) => d.as_millis() as i64,
            Err(e) => -(e.duration().as_millis() as i64),
        };
        self.put_i64_le(millis);
    }
}

pub fn string_len(s: &str) -> Result<u16, ProtocolError> {
    u16::try_from(s.len())
        .map_err(|_| ProtocolError::StringTooLong(s.len()))
}

impl <T: bytes::Buf> BufExt for T {
}

impl <T: bytes::BufMut> BufMutExt for T {
}
