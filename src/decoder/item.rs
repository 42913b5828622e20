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

use crate::decoder::tile::DecodeSample;
use crate::decoder::*;
use crate::internal_utils::stream::*;
use crate::internal_utils::*;
use crate::parser::mp4box::*;
use crate::utils::clap::CropRect;
use crate::*;

use std::collections::HashMap;
use std::collections::HashSet;

/// An item of the root (or a track-local) meta box. Items are created lazily
/// the first time any box references their id and accumulate fields as
/// iinf/iloc/ipma/iref are folded in; they are never removed once created.
#[derive(Debug, Default)]
pub struct Item {
    pub id: u32,
    pub item_type: String,
    pub size: usize,
    pub width: u32,
    pub height: u32,
    pub content_type: String,
    pub properties: Vec<ItemProperty>,
    pub extents: Vec<Extent>,
    pub thumbnail_for_id: u32,
    pub aux_for_id: u32,
    pub desc_for_id: u32,
    pub dimg_for_id: u32,
    pub dimg_index: u32,
    pub prem_by_id: u32,
    pub has_unsupported_essential_property: bool,
    pub progressive: bool,
    pub idat: Vec<u8>,
    pub grid_item_ids: Vec<u32>,
    // All extents merged into one contiguous buffer. Merging happens at most
    // once so that repeated reads (progressive layers, sequence header
    // probing) see a stable buffer.
    pub data_buffer: Option<Vec<u8>>,
    // Set when the merge stopped early because the IO could not provide all
    // bytes yet. The next prepare pass retries the merge.
    pub partial_data_buffer: bool,
}

impl Item {
    pub fn data_offset(&self) -> u64 {
        self.extents[0].offset
    }

    pub fn idat_stored(&self) -> bool {
        !self.idat.is_empty()
    }

    /// Reads the item's whole payload, merging extents if necessary, and
    /// returns a stream over it. Used for payloads consumed at parse time
    /// (grid configuration, Exif, XMP).
    pub fn stream<'a>(&'a mut self, io: &'a mut GenericIO) -> AvifResult<IStream<'a>> {
        if self.idat_stored() {
            self.merge_extents_from_idat()?;
        } else if self.extents.len() == 1 {
            let io_data = io.read(self.data_offset(), self.size)?;
            if io_data.len() != self.size {
                return Err(AvifError::TruncatedData);
            }
            return Ok(IStream::create(io_data));
        } else {
            self.merge_extents(io, false)?;
        }
        if self.partial_data_buffer {
            return Err(AvifError::TruncatedData);
        }
        Ok(IStream::create(
            self.data_buffer.as_ref().ok_or(AvifError::NoContent)?,
        ))
    }

    fn merge_extents_from_idat(&mut self) -> AvifResult<()> {
        if self.data_buffer.is_some() {
            return Ok(());
        }
        let mut data: Vec<u8> = Vec::new();
        if data.try_reserve(self.size).is_err() {
            return Err(AvifError::OutOfMemory);
        }
        for extent in &self.extents {
            let start = usize_from_u64(extent.offset)?;
            let end = checked_add!(start, extent.size)?;
            if end > self.idat.len() {
                return AvifError::bmff_parse_failed("idat extent out of range");
            }
            data.extend_from_slice(&self.idat[start..end]);
        }
        self.data_buffer = Some(data);
        self.partial_data_buffer = false;
        Ok(())
    }

    /// Merges all file extents into one contiguous buffer. With
    /// `allow_partial`, an IO that cannot provide all bytes yet produces a
    /// truncated buffer flagged via `partial_data_buffer` instead of an
    /// error.
    pub fn merge_extents(&mut self, io: &mut GenericIO, allow_partial: bool) -> AvifResult<()> {
        if self.data_buffer.is_some() && !self.partial_data_buffer {
            return Ok(());
        }
        if self.idat_stored() {
            return self.merge_extents_from_idat();
        }
        let mut data: Vec<u8> = Vec::new();
        if data.try_reserve(self.size).is_err() {
            return Err(AvifError::OutOfMemory);
        }
        let mut partial = false;
        for extent in &self.extents {
            let io_data = io.read(extent.offset, extent.size)?;
            data.extend_from_slice(io_data);
            if io_data.len() != extent.size {
                if !allow_partial {
                    return Err(AvifError::TruncatedData);
                }
                partial = true;
                break;
            }
        }
        self.data_buffer = Some(data);
        self.partial_data_buffer = partial;
        Ok(())
    }

    /// Parses the payload of a grid item into grid geometry.
    pub fn read_and_parse(
        &mut self,
        io: &mut GenericIO,
        grid: &mut Grid,
        size_limit: u32,
        dimension_limit: u32,
    ) -> AvifResult<()> {
        if self.item_type != "grid" {
            return Ok(());
        }
        let mut stream = self.stream(io)?;
        // unsigned int(8) version = 0;
        let version = stream.read_u8()?;
        if version != 0 {
            return AvifError::invalid_image_grid("unsupported version for grid");
        }
        // unsigned int(8) flags;
        let flags = stream.read_u8()?;
        // unsigned int(8) rows_minus_one;
        grid.rows = stream.read_u8()? as u32 + 1;
        // unsigned int(8) columns_minus_one;
        grid.columns = stream.read_u8()? as u32 + 1;
        if (flags & 1) == 1 {
            // unsigned int(32) output_width;
            grid.width = stream.read_u32()?;
            // unsigned int(32) output_height;
            grid.height = stream.read_u32()?;
        } else {
            // unsigned int(16) output_width;
            grid.width = stream.read_u16()? as u32;
            // unsigned int(16) output_height;
            grid.height = stream.read_u16()? as u32;
        }
        if grid.width == 0 || grid.height == 0 {
            return AvifError::invalid_image_grid("invalid dimensions in grid box");
        }
        if !check_limits(grid.width, grid.height, size_limit, dimension_limit) {
            return AvifError::invalid_image_grid("grid dimensions too large");
        }
        Ok(())
    }

    pub fn operating_point(&self) -> u8 {
        match find_property!(self.properties, OperatingPointSelector) {
            Some(operating_point) => *operating_point,
            None => 0, // default operating point.
        }
    }

    pub fn harvest_ispe(
        &mut self,
        alpha_ispe_required: bool,
        size_limit: u32,
        dimension_limit: u32,
    ) -> AvifResult<()> {
        if self.should_skip() {
            return Ok(());
        }
        match find_property!(self.properties, ImageSpatialExtents) {
            Some(ispe) => {
                self.width = ispe.width;
                self.height = ispe.height;
                if self.width == 0 || self.height == 0 {
                    return AvifError::bmff_parse_failed("item has invalid ispe size");
                }
                if !check_limits(ispe.width, ispe.height, size_limit, dimension_limit) {
                    return AvifError::bmff_parse_failed("item dimensions too large");
                }
            }
            None => {
                // No ispe was found.
                if self.is_auxiliary_alpha() {
                    if alpha_ispe_required {
                        return AvifError::bmff_parse_failed(
                            "alpha auxiliary image is missing mandatory ispe",
                        );
                    }
                } else {
                    return AvifError::bmff_parse_failed(
                        "item is missing mandatory ispe property",
                    );
                }
            }
        }
        Ok(())
    }

    /// Validates an AV1 image item: a codec configuration is mandatory, grid
    /// children must agree on it, pixi (when present or required) must match
    /// the configured depth, and a clean aperture (when strict validation is
    /// on) must convert to a valid crop rectangle.
    #[allow(non_snake_case)]
    pub fn validate_properties(
        &self,
        items: &Items,
        pixi_required: bool,
        clap_validation: bool,
    ) -> AvifResult<()> {
        let av1C = self
            .av1C()
            .ok_or(AvifError::BmffParseFailed("missing av1C property".into()))?;
        if self.item_type == "grid" {
            for grid_item_id in &self.grid_item_ids {
                let grid_item = items.get(grid_item_id).unwrap();
                let grid_av1C = grid_item.av1C().ok_or(AvifError::BmffParseFailed(
                    "missing av1C property for grid item".into(),
                ))?;
                if av1C != grid_av1C {
                    return AvifError::bmff_parse_failed("av1C of grid items do not match");
                }
            }
        }
        match self.pixi() {
            Some(pixi) => {
                for depth in &pixi.plane_depths[..pixi.plane_count as usize] {
                    if *depth != av1C.depth() {
                        return AvifError::bmff_parse_failed(
                            "pixi depth does not match av1C depth",
                        );
                    }
                }
            }
            None => {
                if pixi_required {
                    return AvifError::bmff_parse_failed("missing pixi property");
                }
            }
        }
        if clap_validation {
            if let Some(clap) = find_property!(self.properties, CleanAperture) {
                CropRect::create_from(clap, self.width, self.height, av1C.pixel_format())?;
            }
        }
        Ok(())
    }

    #[allow(non_snake_case)]
    pub fn av1C(&self) -> Option<&CodecConfiguration> {
        find_property!(self.properties, CodecConfiguration)
    }

    pub fn pixi(&self) -> Option<&PixelInformation> {
        find_property!(self.properties, PixelInformation)
    }

    pub fn a1lx(&self) -> Option<&[usize; 3]> {
        find_property!(self.properties, AV1LayeredImageIndexing)
    }

    pub fn lsel(&self) -> Option<u16> {
        find_property!(self.properties, LayerSelector).copied()
    }

    pub fn is_auxiliary_alpha(&self) -> bool {
        match find_property!(self.properties, AuxiliaryType) {
            Some(aux_type) => {
                aux_type == "urn:mpeg:mpegB:cicp:systems:auxiliary:alpha"
                    || aux_type == "urn:mpeg:hevc:2015:auxid:1"
            }
            None => false,
        }
    }

    pub fn should_skip(&self) -> bool {
        self.size == 0
            || self.has_unsupported_essential_property
            || (self.item_type != "av01" && self.item_type != "grid")
            || self.thumbnail_for_id != 0
    }

    fn is_metadata(&self, item_type: &str, color_id: u32) -> bool {
        self.size != 0
            && !self.has_unsupported_essential_property
            && (color_id == 0 || self.desc_for_id == color_id)
            && self.item_type == *item_type
    }

    pub fn is_exif(&self, color_id: u32) -> bool {
        self.is_metadata("Exif", color_id)
    }

    pub fn is_xmp(&self, color_id: u32) -> bool {
        self.is_metadata("mime", color_id) && self.content_type == "application/rdf+xml"
    }

    /// Computes the smallest `[min, max)` byte span of the file needed to
    /// materialize `sample`, walking the extents in declaration order.
    pub fn max_extent(&self, sample: &DecodeSample) -> AvifResult<Extent> {
        if self.extents.is_empty() {
            return Err(AvifError::TruncatedData);
        }
        if self.idat_stored() {
            // The payload was materialized from idat during parse; no file
            // bytes are needed.
            return Ok(Extent::default());
        }
        if sample.size == 0 {
            return Err(AvifError::TruncatedData);
        }
        if self.extents.len() == 1 {
            return Ok(Extent {
                offset: sample.offset,
                size: sample.size,
            });
        }
        // The sample begins at an intra-item offset; skip whole extents
        // before it and truncate the one it starts in.
        let mut remaining_offset = sample.offset;
        let mut remaining_size = sample.size;
        let mut min_offset = u64::MAX;
        let mut max_offset = 0;
        for extent in &self.extents {
            let mut start_offset = extent.offset;
            let mut size = extent.size;
            let size_u64 = u64_from_usize(size)?;
            if remaining_offset != 0 {
                if remaining_offset >= size_u64 {
                    remaining_offset -= size_u64;
                    continue;
                }
                start_offset = checked_add!(start_offset, remaining_offset)?;
                size -= usize_from_u64(remaining_offset)?;
                remaining_offset = 0;
            }
            // Cover no more than sample.size bytes.
            let used_extent_size = std::cmp::min(size, remaining_size);
            let end_offset = checked_add!(start_offset, u64_from_usize(used_extent_size)?)?;
            min_offset = std::cmp::min(min_offset, start_offset);
            max_offset = std::cmp::max(max_offset, end_offset);
            remaining_size -= used_extent_size;
            if remaining_size == 0 {
                break;
            }
        }
        if remaining_size != 0 {
            return Err(AvifError::TruncatedData);
        }
        Ok(Extent {
            offset: min_offset,
            size: usize_from_u64(max_offset - min_offset)?,
        })
    }
}

pub type Items = HashMap<u32, Item, NonRandomHasherState>;

fn find_or_create_item(items: &mut Items, item_id: u32) -> AvifResult<&mut Item> {
    if item_id == 0 {
        return AvifError::bmff_parse_failed("item id must be nonzero");
    }
    Ok(items.entry(item_id).or_insert_with(|| Item {
        id: item_id,
        ..Item::default()
    }))
}

/// Folds the parsed meta box into the item store: iinf types the items, iloc
/// supplies extents, ipma attaches properties (enforcing the essential-flag
/// contract) and iref records the cross-item references.
pub fn construct_items(meta: &MetaBox) -> AvifResult<Items> {
    let mut items: Items = HashMap::with_hasher(NonRandomHasherState);
    for iinf in &meta.iinf {
        let item = find_or_create_item(&mut items, iinf.item_id)?;
        if !item.item_type.is_empty() {
            return AvifError::bmff_parse_failed("duplicate item id in iinf");
        }
        item.item_type = iinf.item_type.clone();
        item.content_type = iinf.content_type.clone();
    }
    for iloc in &meta.iloc.items {
        let construction_method = iloc.construction_method;
        if construction_method == 1 && meta.idat.is_empty() {
            return AvifError::bmff_parse_failed("item is stored in idat but no idat was found");
        }
        let item = find_or_create_item(&mut items, iloc.item_id)?;
        if !item.extents.is_empty() {
            return AvifError::bmff_parse_failed("item already has extents");
        }
        if construction_method == 1 {
            item.idat = meta.idat.clone();
        }
        for extent in &iloc.extents {
            item.extents.push(Extent {
                offset: checked_add!(iloc.base_offset, extent.offset)?,
                size: usize_from_u64(extent.length)?,
            });
            item.size = checked_add!(item.size, usize_from_u64(extent.length)?)?;
        }
    }
    let mut ipma_seen: HashSet<u32> = HashSet::new();
    for association in &meta.iprp.associations {
        if ipma_seen.contains(&association.item_id) {
            return AvifError::bmff_parse_failed("item has duplicate ipma entry");
        }
        ipma_seen.insert(association.item_id);
        let property_count = meta.iprp.properties.len();
        let item = find_or_create_item(&mut items, association.item_id)?;
        for (property_index, essential) in &association.associations {
            let property_index = *property_index as usize;
            let essential = *essential;
            if property_index == 0 {
                // Not associated with any property.
                continue;
            }
            if property_index > property_count {
                return AvifError::bmff_parse_failed("invalid property_index in ipma");
            }
            // property_index is 1-based.
            let property = meta.iprp.properties[property_index - 1].clone();
            match property {
                ItemProperty::Unknown(_) => {
                    if essential {
                        // The item cannot be used without understanding this
                        // property. The item is skipped rather than failing
                        // the whole file.
                        item.has_unsupported_essential_property = true;
                    }
                }
                ItemProperty::AV1LayeredImageIndexing(_) => {
                    // HEIF: a1lx shall not be essential.
                    if essential {
                        return AvifError::bmff_parse_failed("a1lx must not be essential");
                    }
                    item.properties.push(property);
                }
                ItemProperty::OperatingPointSelector(_) | ItemProperty::LayerSelector(_) => {
                    // AV1-ISOBMFF: a1op and lsel shall be essential.
                    if !essential {
                        return AvifError::bmff_parse_failed("a1op and lsel must be essential");
                    }
                    item.properties.push(property);
                }
                _ => item.properties.push(property),
            }
        }
    }
    for reference in &meta.iref {
        let item = find_or_create_item(&mut items, reference.from_item_id)?;
        match reference.reference_type.as_str() {
            "thmb" => item.thumbnail_for_id = reference.to_item_id,
            "auxl" => item.aux_for_id = reference.to_item_id,
            "cdsc" => item.desc_for_id = reference.to_item_id,
            "prem" => item.prem_by_id = reference.to_item_id,
            "dimg" => {
                // Derived image references point in the opposite direction.
                let dimg_item = find_or_create_item(&mut items, reference.to_item_id)?;
                dimg_item.dimg_for_id = reference.from_item_id;
                dimg_item.dimg_index = reference.index;
            }
            _ => {
                // Unknown reference type, ignore.
            }
        }
    }
    Ok(items)
}
