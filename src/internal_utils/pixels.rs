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
use crate::*;

/// Backing storage for one image plane.
#[derive(Clone, Debug)]
pub enum Pixels {
    // Used for 8-bit images.
    Buffer(Vec<u8>),
    // Used for 10-bit, 12-bit and 16-bit images.
    Buffer16(Vec<u16>),
}

impl Pixels {
    pub fn size(&self) -> usize {
        match self {
            Pixels::Buffer(buffer) => buffer.len(),
            Pixels::Buffer16(buffer) => buffer.len(),
        }
    }

    pub fn has_data(&self) -> bool {
        self.size() > 0
    }

    pub fn resize(&mut self, size: usize, default: u16) -> AvifResult<()> {
        match self {
            Pixels::Buffer(buffer) => {
                if buffer.capacity() < size && buffer.try_reserve_exact(size).is_err() {
                    return Err(AvifError::OutOfMemory);
                }
                buffer.resize(size, default as u8);
            }
            Pixels::Buffer16(buffer) => {
                if buffer.capacity() < size && buffer.try_reserve_exact(size).is_err() {
                    return Err(AvifError::OutOfMemory);
                }
                buffer.resize(size, default);
            }
        }
        Ok(())
    }

    pub fn slice(&self, offset: usize, size: usize) -> AvifResult<&[u8]> {
        match self {
            Pixels::Buffer(buffer) => {
                let end = checked_add!(offset, size)?;
                if end > buffer.len() {
                    return Err(AvifError::NoContent);
                }
                Ok(&buffer[offset..end])
            }
            Pixels::Buffer16(_) => Err(AvifError::NoContent),
        }
    }

    pub fn slice_mut(&mut self, offset: usize, size: usize) -> AvifResult<&mut [u8]> {
        match self {
            Pixels::Buffer(buffer) => {
                let end = checked_add!(offset, size)?;
                if end > buffer.len() {
                    return Err(AvifError::NoContent);
                }
                Ok(&mut buffer[offset..end])
            }
            Pixels::Buffer16(_) => Err(AvifError::NoContent),
        }
    }

    pub fn slice16(&self, offset: usize, size: usize) -> AvifResult<&[u16]> {
        match self {
            Pixels::Buffer(_) => Err(AvifError::NoContent),
            Pixels::Buffer16(buffer) => {
                let end = checked_add!(offset, size)?;
                if end > buffer.len() {
                    return Err(AvifError::NoContent);
                }
                Ok(&buffer[offset..end])
            }
        }
    }

    pub fn slice16_mut(&mut self, offset: usize, size: usize) -> AvifResult<&mut [u16]> {
        match self {
            Pixels::Buffer(_) => Err(AvifError::NoContent),
            Pixels::Buffer16(buffer) => {
                let end = checked_add!(offset, size)?;
                if end > buffer.len() {
                    return Err(AvifError::NoContent);
                }
                Ok(&mut buffer[offset..end])
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resize_and_slice() {
        let mut pixels = Pixels::Buffer(Vec::new());
        assert!(!pixels.has_data());
        assert!(pixels.resize(10, 0).is_ok());
        assert_eq!(pixels.size(), 10);
        assert!(pixels.slice(0, 10).is_ok());
        assert!(pixels.slice(5, 6).is_err());
        assert!(pixels.slice16(0, 10).is_err());

        let mut pixels = Pixels::Buffer16(Vec::new());
        assert!(pixels.resize(4, 1023).is_ok());
        assert_eq!(pixels.slice16(0, 4).unwrap(), &[1023; 4]);
        assert!(pixels.slice(0, 4).is_err());
    }
}
