// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::internal_utils::*;

use bitreader::BitReader;
use byteorder::{BigEndian, ReadBytesExt};

/// A bounded big-endian byte reader over a borrowed slice. Every read is
/// length-checked against the slice; reads never wrap and never go past the
/// end of the supplied data.
#[derive(Debug)]
pub struct IStream<'a> {
    // The bytes to parse.
    pub data: &'a [u8],
    // The number of bytes read so far within self.data.
    pub offset: usize,
}

impl IStream<'_> {
    pub(crate) fn create(data: &[u8]) -> IStream<'_> {
        IStream { data, offset: 0 }
    }

    fn check(&self, size: usize) -> AvifResult<()> {
        if self.bytes_left() < size {
            return AvifError::bmff_parse_failed("not enough bytes");
        }
        Ok(())
    }

    /// Splits off a sub-reader covering the next `size` bytes. The parent
    /// advances past them, so a misbehaving box parser can never read outside
    /// of its own box.
    pub(crate) fn sub_stream<'a>(&'a mut self, size: usize) -> AvifResult<IStream<'a>> {
        self.check(size)?;
        let offset = self.offset;
        checked_incr!(self.offset, size);
        Ok(IStream {
            data: &self.data[offset..self.offset],
            offset: 0,
        })
    }

    /// Splits off a bit reader covering the next `num_bytes` bytes.
    pub(crate) fn sub_bit_stream<'a>(&'a mut self, num_bytes: usize) -> AvifResult<IBitStream<'a>> {
        self.check(num_bytes)?;
        let offset = self.offset;
        checked_incr!(self.offset, num_bytes);
        Ok(IBitStream {
            reader: BitReader::new(&self.data[offset..self.offset]),
        })
    }

    pub(crate) fn bytes_left(&self) -> usize {
        self.data.len().saturating_sub(self.offset)
    }

    pub(crate) fn has_bytes_left(&self) -> bool {
        self.bytes_left() > 0
    }

    pub(crate) fn get_slice(&mut self, size: usize) -> AvifResult<&[u8]> {
        self.check(size)?;
        let start = self.offset;
        checked_incr!(self.offset, size);
        Ok(&self.data[start..start + size])
    }

    pub(crate) fn read_u8(&mut self) -> AvifResult<u8> {
        self.get_slice(1)?
            .read_u8()
            .or(Err(AvifError::BmffParseFailed("not enough bytes".into())))
    }

    pub(crate) fn read_u16(&mut self) -> AvifResult<u16> {
        self.get_slice(2)?
            .read_u16::<BigEndian>()
            .or(Err(AvifError::BmffParseFailed("not enough bytes".into())))
    }

    pub(crate) fn read_u24(&mut self) -> AvifResult<u32> {
        self.get_slice(3)?
            .read_u24::<BigEndian>()
            .or(Err(AvifError::BmffParseFailed("not enough bytes".into())))
    }

    pub(crate) fn read_u32(&mut self) -> AvifResult<u32> {
        self.get_slice(4)?
            .read_u32::<BigEndian>()
            .or(Err(AvifError::BmffParseFailed("not enough bytes".into())))
    }

    pub(crate) fn read_u64(&mut self) -> AvifResult<u64> {
        self.get_slice(8)?
            .read_u64::<BigEndian>()
            .or(Err(AvifError::BmffParseFailed("not enough bytes".into())))
    }

    pub(crate) fn read_i32(&mut self) -> AvifResult<i32> {
        Ok(self.read_u32()? as i32)
    }

    // Reads an xx-byte unsigned integer, as used by the variable field widths
    // of iloc.
    pub(crate) fn read_uxx(&mut self, xx: u8) -> AvifResult<u64> {
        match xx {
            0 => Ok(0),
            1 => Ok(self.read_u8()? as u64),
            2 => Ok(self.read_u16()? as u64),
            3 => Ok(self.read_u24()? as u64),
            4 => Ok(self.read_u32()? as u64),
            8 => self.read_u64(),
            5..=7 => self
                .get_slice(xx as usize)?
                .read_uint::<BigEndian>(xx as usize)
                .or(Err(AvifError::BmffParseFailed("not enough bytes".into()))),
            _ => Err(AvifError::NotImplemented),
        }
    }

    pub(crate) fn read_fraction(&mut self) -> AvifResult<Fraction> {
        Ok(Fraction(self.read_i32()?, self.read_u32()?))
    }

    pub(crate) fn read_ufraction(&mut self) -> AvifResult<UFraction> {
        Ok(UFraction(self.read_u32()?, self.read_u32()?))
    }

    // Reads size characters of a non-null-terminated string.
    pub(crate) fn read_string(&mut self, size: usize) -> AvifResult<String> {
        Ok(String::from_utf8(self.get_slice(size)?.to_vec()).unwrap_or("".into()))
    }

    // Reads a null-terminated string of at most max_len bytes (terminator
    // included).
    pub(crate) fn read_c_string(&mut self, max_len: usize) -> AvifResult<String> {
        self.check(1)?;
        let null_position = self.data[self.offset..]
            .iter()
            .take(std::cmp::min(max_len, self.bytes_left()))
            .position(|&x| x == b'\0')
            .ok_or(AvifError::BmffParseFailed("unterminated string".into()))?;
        let range = self.offset..self.offset + null_position;
        self.offset += null_position + 1;
        Ok(String::from_utf8(self.data[range].to_vec()).unwrap_or("".into()))
    }

    pub(crate) fn read_version_and_flags(&mut self) -> AvifResult<(u8, u32)> {
        let version = self.read_u8()?;
        let flags = self.read_u24()?;
        Ok((version, flags))
    }

    pub(crate) fn read_and_enforce_version_and_flags(
        &mut self,
        enforced_version: u8,
    ) -> AvifResult<(u8, u32)> {
        let (version, flags) = self.read_version_and_flags()?;
        if version != enforced_version {
            return AvifError::bmff_parse_failed("unexpected box version");
        }
        Ok((version, flags))
    }

    pub(crate) fn skip(&mut self, size: usize) -> AvifResult<()> {
        self.check(size)?;
        checked_incr!(self.offset, size);
        Ok(())
    }

    // See Section 4.10.5. leb128() of the AV1 specification.
    pub(crate) fn read_uleb128(&mut self) -> AvifResult<u32> {
        let mut value: u64 = 0;
        for i in 0..8 {
            let leb128_byte = self.read_u8()? as u64;
            // The bottom 7 bits contribute to the value; the most significant
            // bit indicates that more bytes follow.
            value |= (leb128_byte & 0x7F) << (i * 7);
            if (leb128_byte & 0x80) == 0 {
                // Bitstream conformance requires the decoded value to fit in
                // 32 bits.
                return u32_from_u64(value);
            }
        }
        AvifError::bmff_parse_failed("uleb value did not terminate after 8 bytes")
    }

    pub(crate) fn skip_u32(&mut self) -> AvifResult<()> {
        self.skip(4)
    }

    pub(crate) fn skip_u64(&mut self) -> AvifResult<()> {
        self.skip(8)
    }
}

/// A bounded big-endian bit reader, used for the bit-packed portions of boxes
/// (iloc size nibbles, av1C, ipma essential flags) and for OBU headers.
pub struct IBitStream<'a> {
    reader: BitReader<'a>,
}

impl IBitStream<'_> {
    pub(crate) fn read(&mut self, n: u8) -> AvifResult<u32> {
        assert!(n <= 32);
        self.reader
            .read_u32(n)
            .or(Err(AvifError::BmffParseFailed("not enough bits".into())))
    }

    pub(crate) fn read_bool(&mut self) -> AvifResult<bool> {
        self.reader
            .read_bool()
            .or(Err(AvifError::BmffParseFailed("not enough bits".into())))
    }

    pub(crate) fn skip(&mut self, n: u64) -> AvifResult<()> {
        self.reader
            .skip(n)
            .or(Err(AvifError::BmffParseFailed("not enough bits".into())))
    }

    // See Section 4.10.3. uvlc() of the AV1 specification.
    pub(crate) fn skip_uvlc(&mut self) -> AvifResult<()> {
        let mut leading_zeros = 0u64;
        while !self.read_bool()? {
            leading_zeros += 1;
        }
        if leading_zeros < 32 {
            self.skip(leading_zeros)?;
        }
        Ok(())
    }

    pub(crate) fn remaining_bits(&self) -> u64 {
        self.reader.remaining()
    }
}
