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

use crate::internal_utils::stream::*;
use crate::*;

/// Validates the payload of an Exif item: a 4-byte offset to the TIFF header
/// followed by the Exif payload itself. On success the stream is left at the
/// start of the payload.
pub fn parse(stream: &mut IStream) -> AvifResult<()> {
    // unsigned int(32) exif_tiff_header_offset;
    let offset = stream.read_u32()? as usize;
    if offset > stream.bytes_left() {
        return Err(AvifError::InvalidExifPayload);
    }
    // The TIFF header must start with the byte-order marker.
    let tiff = &stream.data[stream.offset + offset..];
    if tiff.len() < 4 || (!tiff.starts_with(b"II") && !tiff.starts_with(b"MM")) {
        return Err(AvifError::InvalidExifPayload);
    }
    Ok(())
}
