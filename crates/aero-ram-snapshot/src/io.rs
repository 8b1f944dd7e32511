use std::io::{Read, Write};

use crate::error::{RamSnapshotError, Result};

/// Longest LEB128 encoding of a `u64`.
const MAX_PACKED_LEN: usize = 10;

pub trait WriteBeExt: Write {
    fn write_u8(&mut self, v: u8) -> Result<()> {
        self.write_all(&[v])?;
        Ok(())
    }

    fn write_u32_be(&mut self, v: u32) -> Result<()> {
        self.write_all(&v.to_be_bytes())?;
        Ok(())
    }

    fn write_u64_be(&mut self, v: u64) -> Result<()> {
        self.write_all(&v.to_be_bytes())?;
        Ok(())
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.write_all(bytes)?;
        Ok(())
    }

    /// 7 bits per byte, least significant group first, high bit set on all but the last byte.
    fn write_packed_u64(&mut self, mut v: u64) -> Result<()> {
        let mut buf = [0u8; MAX_PACKED_LEN];
        let mut len = 0;
        loop {
            let byte = (v & 0x7f) as u8;
            v >>= 7;
            if v == 0 {
                buf[len] = byte;
                len += 1;
                break;
            }
            buf[len] = byte | 0x80;
            len += 1;
        }
        self.write_bytes(&buf[..len])
    }

    /// Sign goes into the lowest bit, magnitude into the rest.
    fn write_packed_i64(&mut self, v: i64) -> Result<()> {
        let encoded = if v >= 0 {
            (v as u64) << 1
        } else {
            (v.unsigned_abs() << 1) | 1
        };
        self.write_packed_u64(encoded)
    }

    /// One length byte followed by the UTF-8 bytes. Used for block names.
    fn write_short_string(&mut self, s: &str) -> Result<()> {
        let len: u8 = s
            .len()
            .try_into()
            .map_err(|_| RamSnapshotError::InvalidConfig("block name longer than 255 bytes"))?;
        self.write_u8(len)?;
        self.write_bytes(s.as_bytes())
    }

    /// Big-endian `u32` length followed by the UTF-8 bytes.
    fn write_string_u32(&mut self, s: &str) -> Result<()> {
        let len: u32 = s
            .len()
            .try_into()
            .map_err(|_| RamSnapshotError::Corrupt("length does not fit in u32"))?;
        self.write_u32_be(len)?;
        self.write_bytes(s.as_bytes())
    }
}

impl<T: Write + ?Sized> WriteBeExt for T {}

pub trait ReadBeExt: Read {
    fn read_u8(&mut self) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    fn read_u32_be(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf)?;
        Ok(u32::from_be_bytes(buf))
    }

    fn read_u64_be(&mut self) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.read_exact(&mut buf)?;
        Ok(u64::from_be_bytes(buf))
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut buf = [0u8; N];
        self.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn read_packed_u64(&mut self) -> Result<u64> {
        let mut value = 0u64;
        for i in 0..MAX_PACKED_LEN {
            let byte = self.read_u8()?;
            let bits = u64::from(byte & 0x7f);
            let shift = 7 * i as u32;
            if shift == 63 && bits > 1 {
                return Err(RamSnapshotError::Corrupt("packed number overflow"));
            }
            value |= bits << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(RamSnapshotError::Corrupt("packed number too long"))
    }

    fn read_packed_i64(&mut self) -> Result<i64> {
        let encoded = self.read_packed_u64()?;
        let magnitude = encoded >> 1;
        // Every `u64 >> 1` fits in an i64.
        let magnitude = magnitude as i64;
        Ok(if encoded & 1 == 0 {
            magnitude
        } else {
            -magnitude
        })
    }

    fn read_exact_vec(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        buf.try_reserve_exact(len)
            .map_err(|_| RamSnapshotError::OutOfMemory { len })?;
        buf.resize(len, 0);
        self.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn read_short_string(&mut self) -> Result<String> {
        let len = self.read_u8()? as usize;
        let bytes = self.read_exact_vec(len)?;
        Ok(String::from_utf8(bytes)?)
    }

    fn read_string_u32(&mut self, max_len: usize) -> Result<String> {
        let len = self.read_u32_be()? as usize;
        if len > max_len {
            return Err(RamSnapshotError::Corrupt("string too long"));
        }
        let bytes = self.read_exact_vec(len)?;
        Ok(String::from_utf8(bytes)?)
    }
}

impl<T: Read + ?Sized> ReadBeExt for T {}
