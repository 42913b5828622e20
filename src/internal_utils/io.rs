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

use crate::decoder::IO;
use crate::AvifError;
use crate::AvifResult;

use std::fs::File;
use std::io::Read;
use std::io::Seek;
use std::io::SeekFrom;

/// File-backed IO. Reads are buffered into a scratch buffer that is only
/// valid until the next read call.
#[derive(Debug, Default)]
pub struct DecoderFileIO {
    file: Option<File>,
    buffer: Vec<u8>,
}

impl DecoderFileIO {
    pub fn create(filename: &str) -> AvifResult<DecoderFileIO> {
        let file = File::open(filename).or(Err(AvifError::IoError))?;
        Ok(DecoderFileIO {
            file: Some(file),
            buffer: Vec::new(),
        })
    }
}

impl IO for DecoderFileIO {
    fn read(&mut self, offset: u64, size: usize) -> AvifResult<&[u8]> {
        let file_size = self.size_hint();
        if offset > file_size {
            return Err(AvifError::IoError);
        }
        let available_size = usize::try_from(file_size - offset).unwrap_or(usize::MAX);
        let size_to_read = std::cmp::min(size, available_size);
        if size_to_read > 0 {
            if self.buffer.capacity() < size_to_read
                && self.buffer.try_reserve(size_to_read).is_err()
            {
                return Err(AvifError::OutOfMemory);
            }
            self.buffer.resize(size_to_read, 0);
            let file = self.file.as_mut().unwrap();
            if file.seek(SeekFrom::Start(offset)).is_err()
                || file.read_exact(self.buffer.as_mut_slice()).is_err()
            {
                return Err(AvifError::IoError);
            }
        } else {
            self.buffer.clear();
        }
        Ok(self.buffer.as_slice())
    }

    fn size_hint(&self) -> u64 {
        match self.file.as_ref().unwrap().metadata() {
            Ok(metadata) => metadata.len(),
            Err(_) => 0,
        }
    }

    fn persistent(&self) -> bool {
        false
    }
}

/// Memory-backed IO over a buffer owned by the reader. Returned slices point
/// directly into the buffer and remain valid for the lifetime of the reader.
#[derive(Debug, Default)]
pub struct DecoderMemoryIO {
    pub data: Vec<u8>,
}

impl DecoderMemoryIO {
    pub fn create(data: impl Into<Vec<u8>>) -> DecoderMemoryIO {
        DecoderMemoryIO { data: data.into() }
    }
}

impl IO for DecoderMemoryIO {
    fn read(&mut self, offset: u64, size: usize) -> AvifResult<&[u8]> {
        let data_size = self.data.len() as u64;
        if offset > data_size {
            return Err(AvifError::IoError);
        }
        let offset = offset as usize;
        let available_size = self.data.len() - offset;
        let size_to_read = std::cmp::min(size, available_size);
        Ok(&self.data[offset..offset + size_to_read])
    }

    fn size_hint(&self) -> u64 {
        self.data.len() as u64
    }

    fn persistent(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_io_clamps_reads() {
        let mut io = DecoderMemoryIO::create(vec![1, 2, 3, 4]);
        assert_eq!(io.read(0, 4).unwrap(), &[1, 2, 3, 4]);
        assert_eq!(io.read(2, 10).unwrap(), &[3, 4]);
        assert_eq!(io.read(4, 1).unwrap(), &[] as &[u8]);
        assert!(io.read(5, 1).is_err());
        assert_eq!(io.size_hint(), 4);
        assert!(io.persistent());
    }
}
