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

use crate::decoder::item::Item;
use crate::decoder::track::Track;
use crate::decoder::*;
use crate::image::Image;
use crate::internal_utils::*;
use crate::parser::mp4box::*;
use crate::*;

pub const MAX_AV1_LAYER_COUNT: usize = 4;

/// One unit of input for the codec: either a whole item payload, one layer
/// of a layered item, or one sample of a track.
#[derive(Debug, Default)]
pub struct DecodeSample {
    // 1-based. 0 if the sample comes from a track.
    pub item_id: u32,
    // Absolute file offset when the item is stored in a single file extent,
    // otherwise an offset into the item's merged data buffer.
    pub offset: u64,
    pub size: usize,
    // 0xFF means "do not filter by spatial id".
    pub spatial_id: u8,
    pub sync: bool,
}

impl DecodeSample {
    /// Returns the first `size` bytes of the sample, reading them from the
    /// merged item buffer when one exists and from the IO otherwise.
    pub(crate) fn partial_data<'a>(
        &self,
        io: &'a mut GenericIO,
        buffer: &'a Option<Vec<u8>>,
        size: usize,
    ) -> AvifResult<&'a [u8]> {
        match buffer {
            Some(buffer) => {
                let start = usize_from_u64(self.offset)?;
                let end = checked_add!(start, size)?;
                if end > buffer.len() {
                    return Err(AvifError::TruncatedData);
                }
                Ok(&buffer[start..end])
            }
            None => {
                let data = io.read(self.offset, size)?;
                if data.len() != size {
                    return Err(AvifError::TruncatedData);
                }
                Ok(data)
            }
        }
    }

    pub(crate) fn data<'a>(
        &self,
        io: &'a mut GenericIO,
        buffer: &'a Option<Vec<u8>>,
    ) -> AvifResult<&'a [u8]> {
        self.partial_data(io, buffer, self.size)
    }
}

#[derive(Debug, Default)]
pub struct DecodeInput {
    pub samples: Vec<DecodeSample>,
    pub all_layers: bool,
    pub category: Category,
}

/// The properties every tile of a grid must agree on. Recorded from the
/// first decoded tile, then enforced on the rest.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct TileProperties {
    pub width: u32,
    pub height: u32,
    pub depth: u8,
    pub yuv_format: PixelFormat,
    pub yuv_range: YuvRange,
    pub color_primaries: ColorPrimaries,
    pub transfer_characteristics: TransferCharacteristics,
    pub matrix_coefficients: MatrixCoefficients,
}

impl From<&Image> for TileProperties {
    fn from(image: &Image) -> Self {
        Self {
            width: image.width,
            height: image.height,
            depth: image.depth,
            yuv_format: image.yuv_format,
            yuv_range: image.yuv_range,
            color_primaries: image.color_primaries,
            transfer_characteristics: image.transfer_characteristics,
            matrix_coefficients: image.matrix_coefficients,
        }
    }
}

/// Per-category bookkeeping of tile decode progress.
#[derive(Debug, Default)]
pub(crate) struct TileInfo {
    pub tile_count: u32,
    pub decoded_tile_count: u32,
    pub grid: Grid,
    pub expected_tile_properties: Option<TileProperties>,
}

impl TileInfo {
    pub(crate) fn is_grid(&self) -> bool {
        self.grid.rows > 0 && self.grid.columns > 0
    }

    pub(crate) fn grid_tile_count(&self) -> AvifResult<u32> {
        if self.is_grid() {
            checked_mul!(self.grid.rows, self.grid.columns)
        } else {
            Ok(1)
        }
    }

    pub(crate) fn is_fully_decoded(&self) -> bool {
        self.tile_count == self.decoded_tile_count
    }

    /// Records the properties of the first decoded tile, then rejects any
    /// later tile that disagrees with them.
    pub(crate) fn check_tile_consistency(&mut self, image: &Image) -> AvifResult<()> {
        let properties = TileProperties::from(image);
        match &self.expected_tile_properties {
            Some(expected) => {
                if *expected != properties {
                    return AvifError::invalid_image_grid(
                        "grid tile does not match the first tile's properties",
                    );
                }
            }
            None => self.expected_tile_properties = Some(properties),
        }
        Ok(())
    }

    /// Number of fully decoded rows of the output image. Partial tile rows do
    /// not count: only completed rows of tiles contribute.
    pub(crate) fn decoded_row_count(&self, image_height: u32, tile_height: u32) -> u32 {
        if self.decoded_tile_count == 0 {
            return 0;
        }
        if self.decoded_tile_count == self.tile_count || !self.is_grid() {
            return image_height;
        }
        std::cmp::min(
            (self.decoded_tile_count / self.grid.columns) * tile_height,
            image_height,
        )
    }
}

/// A tile owns the sample list to feed the codec, the codec instance index
/// it decodes with, and the image holding its decoded output.
pub struct Tile {
    pub width: u32,
    pub height: u32,
    pub operating_point: u8,
    pub image: Image,
    pub input: DecodeInput,
    pub codec_index: usize,
    pub codec_config: CodecConfiguration,
}

impl Tile {
    pub(crate) fn create_from_item(
        item: &mut Item,
        allow_progressive: bool,
        image_count_limit: u32,
        size_hint: u64,
    ) -> AvifResult<Tile> {
        if size_hint != 0 && u64_from_usize(item.size)? > size_hint {
            return AvifError::bmff_parse_failed("item size exceeds the io size hint");
        }
        let mut tile = Tile {
            width: item.width,
            height: item.height,
            operating_point: item.operating_point(),
            image: Image::default(),
            input: DecodeInput::default(),
            codec_index: 0,
            codec_config: item
                .av1C()
                .ok_or(AvifError::BmffParseFailed("missing av1C property".into()))?
                .clone(),
        };
        let mut layer_sizes: [usize; MAX_AV1_LAYER_COUNT] = [0; MAX_AV1_LAYER_COUNT];
        let mut layer_count: usize = 0;
        let a1lx = item.a1lx();
        let has_a1lx = a1lx.is_some();
        if let Some(a1lx) = a1lx {
            // Derive the per-layer sizes from the a1lx hints. A hint of 0
            // means "the rest of the item".
            let mut remaining_size: usize = item.size;
            for i in 0usize..3 {
                layer_count += 1;
                if a1lx[i] > 0 {
                    // >= instead of > because there must be room for the last
                    // layer.
                    if a1lx[i] >= remaining_size {
                        return AvifError::bmff_parse_failed(format!(
                            "a1lx layer index [{i}] does not fit in item size"
                        ));
                    }
                    layer_sizes[i] = a1lx[i];
                    remaining_size -= a1lx[i];
                } else {
                    layer_sizes[i] = remaining_size;
                    remaining_size = 0;
                    break;
                }
            }
            if remaining_size > 0 {
                assert!(layer_count == 3);
                layer_count += 1;
                layer_sizes[3] = remaining_size;
            }
        }
        let lsel = item.lsel();
        // Progressive images offer layers via a1lx but do not select one
        // with lsel.
        item.progressive = has_a1lx && (lsel.is_none() || lsel == Some(0xFFFF));
        let base_item_offset = if item.extents.len() == 1 && !item.idat_stored() {
            item.extents[0].offset
        } else {
            0
        };
        if lsel.is_some() && lsel != Some(0xFFFF) {
            // Layer selection. The underlying codec decodes all layers and
            // returns only the requested one, so a single sample is emitted
            // covering the layers up to and including the selected layer.
            tile.input.all_layers = true;
            let mut sample_size: usize = 0;
            let layer_id = usize_from_u16(lsel.unwrap())?;
            if layer_count > 0 {
                // The layer payload sizes are hinted via a1lx; the sample can
                // end at the selected layer.
                if layer_id >= layer_count {
                    return AvifError::invalid_image_grid("lsel layer index not found in a1lx");
                }
                for layer_size in layer_sizes.iter().take(layer_id + 1) {
                    checked_incr!(sample_size, *layer_size);
                }
            } else {
                // The layer payload subsection is unknown. Use the whole
                // payload.
                sample_size = item.size;
            }
            tile.input.samples.push(DecodeSample {
                item_id: item.id,
                offset: base_item_offset,
                size: sample_size,
                spatial_id: lsel.unwrap() as u8,
                sync: true,
            });
        } else if item.progressive && allow_progressive {
            // Progressive image: expose one sample per layer.
            if image_count_limit != 0 && layer_count as u32 > image_count_limit {
                return AvifError::bmff_parse_failed("exceeded image_count_limit (progressive)");
            }
            tile.input.all_layers = true;
            let mut offset = 0u64;
            for (i, layer_size) in layer_sizes.iter().take(layer_count).enumerate() {
                tile.input.samples.push(DecodeSample {
                    item_id: item.id,
                    offset: checked_add!(base_item_offset, offset)?,
                    size: *layer_size,
                    spatial_id: 0xff,
                    // Assume all layers depend on the first layer.
                    sync: i == 0,
                });
                checked_incr!(offset, u64_from_usize(*layer_size)?);
            }
        } else {
            // Typical case: the entire payload is a single frame.
            tile.input.samples.push(DecodeSample {
                item_id: item.id,
                offset: base_item_offset,
                size: item.size,
                spatial_id: 0xff,
                sync: true,
            });
        }
        Ok(tile)
    }

    pub(crate) fn create_from_track(
        track: &Track,
        image_count_limit: u32,
        size_hint: u64,
    ) -> AvifResult<Tile> {
        let properties = track
            .get_properties()
            .ok_or(AvifError::BmffParseFailed("missing av01 track properties".into()))?;
        let codec_config = find_property!(properties, CodecConfiguration)
            .ok_or(AvifError::BmffParseFailed("missing av1C property".into()))?
            .clone();
        let mut tile = Tile {
            width: track.width,
            height: track.height,
            // There is no way to set the operating point via tracks.
            operating_point: 0,
            image: Image::default(),
            input: DecodeInput::default(),
            codec_index: 0,
            codec_config,
        };
        let sample_table = track.sample_table.as_ref().unwrap();

        if image_count_limit != 0 {
            let mut limit = image_count_limit;
            for chunk_index in 0..sample_table.chunk_offsets.len() {
                // Figure out how many samples are in this chunk.
                let sample_count = sample_table.get_sample_count_of_chunk(chunk_index as u32);
                if sample_count == 0 {
                    return AvifError::bmff_parse_failed("chunk with 0 samples found");
                }
                if sample_count > limit {
                    return AvifError::bmff_parse_failed("exceeded image_count_limit");
                }
                limit -= sample_count;
            }
        }

        let mut sample_size_index: usize = 0;
        for (chunk_index, chunk_offset) in sample_table.chunk_offsets.iter().enumerate() {
            let sample_count = sample_table.get_sample_count_of_chunk(chunk_index as u32);
            if sample_count == 0 {
                return AvifError::bmff_parse_failed("chunk with 0 samples found");
            }
            let mut sample_offset = *chunk_offset;
            for _ in 0..sample_count {
                let sample_size = sample_table.sample_size(sample_size_index)?;
                let sample_end = checked_add!(sample_offset, u64_from_usize(sample_size)?)?;
                if size_hint != 0 && sample_end > size_hint {
                    return AvifError::bmff_parse_failed("sample exceeds the io size hint");
                }
                tile.input.samples.push(DecodeSample {
                    item_id: 0,
                    offset: sample_offset,
                    size: sample_size,
                    spatial_id: 0xff,
                    // The first sample is assumed to be sync, in case the
                    // stss box is missing.
                    sync: tile.input.samples.is_empty(),
                });
                sample_offset = sample_end;
                checked_incr!(sample_size_index, 1);
            }
        }
        for sync_sample_number in &sample_table.sync_samples {
            // sample_table.sync_samples is 1-based.
            let index = usize_from_u32(*sync_sample_number)?;
            if index == 0 || index > tile.input.samples.len() {
                return AvifError::bmff_parse_failed(format!(
                    "invalid sync sample number {index}"
                ));
            }
            tile.input.samples[index - 1].sync = true;
        }
        Ok(tile)
    }

    pub(crate) fn max_sample_size(&self) -> usize {
        match self.input.samples.iter().max_by_key(|sample| sample.size) {
            Some(sample) => sample.size,
            None => 0,
        }
    }
}
