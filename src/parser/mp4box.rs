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

use crate::decoder::track::*;
use crate::decoder::GenericIO;
use crate::image::MAX_PLANE_COUNT;
use crate::internal_utils::stream::*;
use crate::internal_utils::*;
use crate::utils::clap::CleanAperture;
use crate::*;

use std::collections::HashSet;

#[derive(Debug, PartialEq)]
pub enum BoxSize {
    FixedSize(usize),
    // A size of 0 in the box header means that the box extends to the end of
    // its container (the file for a top-level box).
    UntilEndOfStream,
}

#[derive(Debug)]
pub struct BoxHeader {
    pub size: BoxSize,
    pub box_type: String,
    // Number of bytes the header itself occupied.
    pub header_size: usize,
}

#[derive(Debug)]
pub struct FileTypeBox {
    pub major_brand: String,
    #[allow(unused)]
    minor_version: u32,
    compatible_brands: Vec<String>,
}

impl FileTypeBox {
    fn has_brand(&self, brand: &str) -> bool {
        if self.major_brand.as_str() == brand {
            return true;
        }
        self.compatible_brands.iter().any(|x| x.as_str() == brand)
    }

    pub fn is_avif(&self) -> bool {
        self.has_brand("avif") || self.has_brand("avis")
    }

    pub fn needs_meta(&self) -> bool {
        self.has_brand("avif")
    }

    pub fn needs_moov(&self) -> bool {
        self.has_brand("avis")
    }
}

#[derive(Debug)]
pub struct ItemLocationExtent {
    pub offset: u64,
    pub length: u64,
}

#[derive(Debug, Default)]
pub struct ItemLocationEntry {
    pub item_id: u32,
    pub construction_method: u8,
    pub base_offset: u64,
    pub extents: Vec<ItemLocationExtent>,
}

#[derive(Debug, Default)]
pub struct ItemLocationBox {
    offset_size: u8,
    length_size: u8,
    base_offset_size: u8,
    index_size: u8,
    pub items: Vec<ItemLocationEntry>,
}

#[derive(Clone, Copy, Debug)]
pub struct ImageSpatialExtents {
    pub width: u32,
    pub height: u32,
}

#[derive(Clone, Debug, Default)]
pub struct PixelInformation {
    pub plane_count: u8,
    pub plane_depths: [u8; MAX_PLANE_COUNT],
}

/// The av1C payload: the packed configuration bits of the AV1 sequence
/// header, repeated at the container level.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CodecConfiguration {
    pub seq_profile: u8,
    pub seq_level_idx0: u8,
    pub seq_tier0: u8,
    pub high_bitdepth: bool,
    pub twelve_bit: bool,
    pub monochrome: bool,
    pub chroma_subsampling_x: u8,
    pub chroma_subsampling_y: u8,
    pub chroma_sample_position: ChromaSamplePosition,
}

impl CodecConfiguration {
    pub fn depth(&self) -> u8 {
        match self.twelve_bit {
            true => 12,
            false => match self.high_bitdepth {
                true => 10,
                false => 8,
            },
        }
    }

    pub fn pixel_format(&self) -> PixelFormat {
        if self.monochrome {
            PixelFormat::Yuv400
        } else if self.chroma_subsampling_x == 1 && self.chroma_subsampling_y == 1 {
            PixelFormat::Yuv420
        } else if self.chroma_subsampling_x == 1 {
            PixelFormat::Yuv422
        } else {
            PixelFormat::Yuv444
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct Nclx {
    pub color_primaries: ColorPrimaries,
    pub transfer_characteristics: TransferCharacteristics,
    pub matrix_coefficients: MatrixCoefficients,
    pub yuv_range: YuvRange,
}

#[derive(Clone, Debug)]
pub enum ColorInformation {
    Icc(Vec<u8>),
    Nclx(Nclx),
}

#[derive(Clone, Copy, Debug, Default)]
pub struct PixelAspectRatio {
    pub h_spacing: u32,
    pub v_spacing: u32,
}

/// Grid geometry as declared by a grid item's payload.
#[derive(Clone, Copy, Debug, Default)]
pub struct Grid {
    pub rows: u32,
    pub columns: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Clone, Debug)]
pub enum ItemProperty {
    ImageSpatialExtents(ImageSpatialExtents),
    PixelInformation(PixelInformation),
    CodecConfiguration(CodecConfiguration),
    ColorInformation(ColorInformation),
    PixelAspectRatio(PixelAspectRatio),
    AuxiliaryType(String),
    CleanAperture(CleanAperture),
    ImageRotation(u8),
    ImageMirror(u8),
    OperatingPointSelector(u8),
    LayerSelector(u16),
    AV1LayeredImageIndexing([usize; 3]),
    Unknown(String),
}

#[derive(Debug, Default)]
pub struct ItemPropertyAssociation {
    pub version: u8,
    pub flags: u32,
    pub item_id: u32,
    // (1-based property index, essential flag).
    pub associations: Vec<(u16, bool)>,
}

#[derive(Debug, Default)]
pub struct ItemInfo {
    pub item_id: u32,
    #[allow(unused)]
    pub(crate) item_protection_index: u16,
    pub item_type: String,
    pub content_type: String,
}

#[derive(Debug, Default)]
pub struct ItemPropertyBox {
    pub properties: Vec<ItemProperty>,
    pub associations: Vec<ItemPropertyAssociation>,
}

#[derive(Debug)]
pub struct ItemReference {
    // Read this reference as "{from_item_id} is a {reference_type} for
    // {to_item_id}" (except for dimg, where it is in the opposite direction).
    pub from_item_id: u32,
    pub to_item_id: u32,
    pub reference_type: String,
    // Index of the reference within its iref type.
    pub index: u32,
}

#[derive(Debug, Default)]
pub struct MetaBox {
    pub iinf: Vec<ItemInfo>,
    pub iloc: ItemLocationBox,
    pub primary_item_id: u32,
    pub iprp: ItemPropertyBox,
    pub iref: Vec<ItemReference>,
    pub idat: Vec<u8>,
}

#[derive(Debug)]
pub struct AvifBoxes {
    pub ftyp: FileTypeBox,
    pub meta: MetaBox,
    pub tracks: Vec<Track>,
}

fn parse_header(stream: &mut IStream) -> AvifResult<BoxHeader> {
    let start_offset = stream.offset;
    let mut size = stream.read_u32()? as u64;
    let box_type = stream.read_string(4)?;
    if size == 1 {
        // The box carries a 64-bit largesize.
        size = stream.read_u64()?;
    }
    if box_type == "uuid" {
        stream.skip(16)?;
    }
    let header_size = stream.offset - start_offset;
    if size == 0 {
        return Ok(BoxHeader {
            size: BoxSize::UntilEndOfStream,
            box_type,
            header_size,
        });
    }
    // The declared size includes the header.
    let size = size
        .checked_sub(header_size as u64)
        .ok_or(AvifError::BmffParseFailed("box size too small".into()))?;
    Ok(BoxHeader {
        size: BoxSize::FixedSize(usize_from_u64(size)?),
        box_type,
        header_size,
    })
}

fn sub_stream_for<'a>(stream: &'a mut IStream, header: &BoxHeader) -> AvifResult<IStream<'a>> {
    let size = match header.size {
        BoxSize::FixedSize(size) => size,
        BoxSize::UntilEndOfStream => stream.bytes_left(),
    };
    stream.sub_stream(size)
}

fn parse_ftyp(stream: &mut IStream) -> AvifResult<FileTypeBox> {
    let major_brand = stream.read_string(4)?;
    let minor_version = stream.read_u32()?;
    let mut compatible_brands: Vec<String> = Vec::new();
    while stream.bytes_left() >= 4 {
        compatible_brands.push(stream.read_string(4)?);
    }
    Ok(FileTypeBox {
        major_brand,
        minor_version,
        compatible_brands,
    })
}

fn parse_hdlr(stream: &mut IStream) -> AvifResult<()> {
    let (_version, _flags) = stream.read_and_enforce_version_and_flags(0)?;
    // unsigned int(32) pre_defined = 0;
    let predefined = stream.read_u32()?;
    if predefined != 0 {
        return AvifError::bmff_parse_failed("invalid pre_defined value in hdlr");
    }
    // unsigned int(32) handler_type;
    let handler_type = stream.read_string(4)?;
    if handler_type != "pict" {
        return AvifError::bmff_parse_failed("handler type is not pict");
    }
    // const unsigned int(32)[3] reserved = 0;
    stream.skip(4 * 3)?;
    // string name;
    // Verify that a valid string is present, but do not store it.
    stream.read_c_string(stream.bytes_left())?;
    Ok(())
}

fn parse_iloc(stream: &mut IStream) -> AvifResult<ItemLocationBox> {
    let (version, _flags) = stream.read_version_and_flags()?;
    if version > 2 {
        return AvifError::bmff_parse_failed("invalid version in iloc");
    }
    let mut iloc = ItemLocationBox::default();
    let mut bits = stream.sub_bit_stream(2)?;
    // unsigned int(4) offset_size;
    iloc.offset_size = bits.read(4)? as u8;
    // unsigned int(4) length_size;
    iloc.length_size = bits.read(4)? as u8;
    // unsigned int(4) base_offset_size;
    iloc.base_offset_size = bits.read(4)? as u8;
    // unsigned int(4) index_size for version 1 and 2, reserved otherwise.
    iloc.index_size = if version == 1 || version == 2 { bits.read(4)? as u8 } else { 0 };
    for size in [
        iloc.offset_size,
        iloc.length_size,
        iloc.base_offset_size,
        iloc.index_size,
    ] {
        if !matches!(size, 0 | 4 | 8) {
            return AvifError::bmff_parse_failed("invalid field size in iloc");
        }
    }
    let item_count: u32 = if version < 2 {
        // unsigned int(16) item_count;
        stream.read_u16()? as u32
    } else {
        // unsigned int(32) item_count;
        stream.read_u32()?
    };
    for _ in 0..item_count {
        let mut entry = ItemLocationEntry {
            item_id: if version < 2 {
                // unsigned int(16) item_ID;
                stream.read_u16()? as u32
            } else {
                // unsigned int(32) item_ID;
                stream.read_u32()?
            },
            ..ItemLocationEntry::default()
        };
        if entry.item_id == 0 {
            return AvifError::bmff_parse_failed("invalid item id in iloc");
        }
        if version == 1 || version == 2 {
            // unsigned int(12) reserved = 0;
            // unsigned int(4) construction_method;
            stream.skip(1)?;
            let mut bits = stream.sub_bit_stream(1)?;
            bits.read(4)?;
            entry.construction_method = bits.read(4)? as u8;
            // 0: file, 1: idat.
            if entry.construction_method != 0 && entry.construction_method != 1 {
                return AvifError::bmff_parse_failed("unknown construction_method in iloc");
            }
        }
        // unsigned int(16) data_reference_index;
        stream.skip(2)?;
        // unsigned int(base_offset_size*8) base_offset;
        entry.base_offset = stream.read_uxx(iloc.base_offset_size)?;
        // unsigned int(16) extent_count;
        let extent_count = stream.read_u16()?;
        for _ in 0..extent_count {
            if (version == 1 || version == 2) && iloc.index_size > 0 {
                // unsigned int(index_size*8) extent_index;
                stream.read_uxx(iloc.index_size)?;
            }
            let extent = ItemLocationExtent {
                // unsigned int(offset_size*8) extent_offset;
                offset: stream.read_uxx(iloc.offset_size)?,
                // unsigned int(length_size*8) extent_length;
                length: stream.read_uxx(iloc.length_size)?,
            };
            entry.extents.push(extent);
        }
        iloc.items.push(entry);
    }
    Ok(iloc)
}

fn parse_pitm(stream: &mut IStream) -> AvifResult<u32> {
    let (version, _flags) = stream.read_version_and_flags()?;
    let primary_item_id = if version == 0 {
        stream.read_u16()? as u32
    } else {
        stream.read_u32()?
    };
    if primary_item_id == 0 {
        return AvifError::bmff_parse_failed("invalid primary item id in pitm");
    }
    Ok(primary_item_id)
}

fn parse_ispe(stream: &mut IStream) -> AvifResult<ItemProperty> {
    let (_version, _flags) = stream.read_and_enforce_version_and_flags(0)?;
    let ispe = ImageSpatialExtents {
        // unsigned int(32) image_width;
        width: stream.read_u32()?,
        // unsigned int(32) image_height;
        height: stream.read_u32()?,
    };
    Ok(ItemProperty::ImageSpatialExtents(ispe))
}

fn parse_pixi(stream: &mut IStream) -> AvifResult<ItemProperty> {
    let (_version, _flags) = stream.read_and_enforce_version_and_flags(0)?;
    let mut pixi = PixelInformation {
        // unsigned int(8) num_channels;
        plane_count: stream.read_u8()?,
        ..PixelInformation::default()
    };
    if usize::from(pixi.plane_count) > MAX_PLANE_COUNT {
        return AvifError::bmff_parse_failed("invalid plane count in pixi");
    }
    for i in 0..pixi.plane_count {
        // unsigned int(8) bits_per_channel;
        pixi.plane_depths[i as usize] = stream.read_u8()?;
    }
    Ok(ItemProperty::PixelInformation(pixi))
}

#[allow(non_snake_case)]
fn parse_av1C(stream: &mut IStream) -> AvifResult<ItemProperty> {
    // unsigned int(1) marker = 1;
    // unsigned int(7) version = 1;
    let mut bits = stream.sub_bit_stream(3)?;
    let marker = bits.read(1)?;
    if marker != 1 {
        return AvifError::bmff_parse_failed("invalid marker in av1C");
    }
    let version = bits.read(7)?;
    if version != 1 {
        return AvifError::bmff_parse_failed("invalid version in av1C");
    }
    let av1C = CodecConfiguration {
        // unsigned int(3) seq_profile;
        // unsigned int(5) seq_level_idx_0;
        seq_profile: bits.read(3)? as u8,
        seq_level_idx0: bits.read(5)? as u8,
        // unsigned int(1) seq_tier_0;
        // unsigned int(1) high_bitdepth;
        // unsigned int(1) twelve_bit;
        // unsigned int(1) monochrome;
        // unsigned int(1) chroma_subsampling_x;
        // unsigned int(1) chroma_subsampling_y;
        // unsigned int(2) chroma_sample_position;
        seq_tier0: bits.read(1)? as u8,
        high_bitdepth: bits.read_bool()?,
        twelve_bit: bits.read_bool()?,
        monochrome: bits.read_bool()?,
        chroma_subsampling_x: bits.read(1)? as u8,
        chroma_subsampling_y: bits.read(1)? as u8,
        chroma_sample_position: bits.read(2)?.into(),
    };
    // The initial presentation delay byte and any configOBUs are skipped.
    Ok(ItemProperty::CodecConfiguration(av1C))
}

fn parse_colr(stream: &mut IStream) -> AvifResult<Option<ItemProperty>> {
    // unsigned int(32) colour_type;
    let color_type = stream.read_string(4)?;
    if color_type == "rICC" || color_type == "prof" {
        let icc = stream.get_slice(stream.bytes_left())?.to_vec();
        return Ok(Some(ItemProperty::ColorInformation(ColorInformation::Icc(
            icc,
        ))));
    }
    if color_type == "nclx" {
        let mut nclx = Nclx {
            // unsigned int(16) colour_primaries;
            color_primaries: stream.read_u16()?.into(),
            // unsigned int(16) transfer_characteristics;
            transfer_characteristics: stream.read_u16()?.into(),
            // unsigned int(16) matrix_coefficients;
            matrix_coefficients: stream.read_u16()?.into(),
            ..Nclx::default()
        };
        // unsigned int(1) full_range_flag;
        // unsigned int(7) reserved = 0;
        let mut bits = stream.sub_bit_stream(1)?;
        nclx.yuv_range = if bits.read_bool()? { YuvRange::Full } else { YuvRange::Limited };
        if bits.read(7)? != 0 {
            return AvifError::bmff_parse_failed("invalid reserved bits in colr");
        }
        return Ok(Some(ItemProperty::ColorInformation(
            ColorInformation::Nclx(nclx),
        )));
    }
    // Unknown color types are ignored.
    Ok(None)
}

fn parse_pasp(stream: &mut IStream) -> AvifResult<ItemProperty> {
    let pasp = PixelAspectRatio {
        // unsigned int(32) hSpacing;
        h_spacing: stream.read_u32()?,
        // unsigned int(32) vSpacing;
        v_spacing: stream.read_u32()?,
    };
    Ok(ItemProperty::PixelAspectRatio(pasp))
}

#[allow(non_snake_case)]
fn parse_auxC(stream: &mut IStream) -> AvifResult<ItemProperty> {
    let (_version, _flags) = stream.read_and_enforce_version_and_flags(0)?;
    // string aux_type;
    let auxiliary_type = stream.read_c_string(stream.bytes_left())?;
    Ok(ItemProperty::AuxiliaryType(auxiliary_type))
}

fn parse_clap(stream: &mut IStream) -> AvifResult<ItemProperty> {
    let clap = CleanAperture {
        // unsigned int(32) cleanApertureWidthN;
        // unsigned int(32) cleanApertureWidthD;
        width: stream.read_ufraction()?,
        // unsigned int(32) cleanApertureHeightN;
        // unsigned int(32) cleanApertureHeightD;
        height: stream.read_ufraction()?,
        // unsigned int(32) horizOffN;
        // unsigned int(32) horizOffD;
        horiz_off: stream.read_ufraction()?,
        // unsigned int(32) vertOffN;
        // unsigned int(32) vertOffD;
        vert_off: stream.read_ufraction()?,
    };
    Ok(ItemProperty::CleanAperture(clap))
}

fn parse_irot(stream: &mut IStream) -> AvifResult<ItemProperty> {
    let mut bits = stream.sub_bit_stream(1)?;
    // unsigned int(6) reserved = 0;
    if bits.read(6)? != 0 {
        return AvifError::bmff_parse_failed("invalid reserved bits in irot");
    }
    // unsigned int(2) angle;
    let angle = bits.read(2)? as u8;
    Ok(ItemProperty::ImageRotation(angle))
}

fn parse_imir(stream: &mut IStream) -> AvifResult<ItemProperty> {
    let mut bits = stream.sub_bit_stream(1)?;
    // unsigned int(7) reserved = 0;
    if bits.read(7)? != 0 {
        return AvifError::bmff_parse_failed("invalid reserved bits in imir");
    }
    // unsigned int(1) axis;
    let axis = bits.read(1)? as u8;
    Ok(ItemProperty::ImageMirror(axis))
}

fn parse_a1op(stream: &mut IStream) -> AvifResult<ItemProperty> {
    // unsigned int(8) op_index;
    let op_index = stream.read_u8()?;
    if op_index > 31 {
        // 31 is AV1's maximum operating point value.
        return AvifError::bmff_parse_failed("invalid op_index in a1op");
    }
    Ok(ItemProperty::OperatingPointSelector(op_index))
}

fn parse_lsel(stream: &mut IStream) -> AvifResult<ItemProperty> {
    // unsigned int(16) layer_id;
    let layer_id = stream.read_u16()?;
    if layer_id != 0xFFFF && layer_id >= 4 {
        return AvifError::bmff_parse_failed("invalid layer_id in lsel");
    }
    Ok(ItemProperty::LayerSelector(layer_id))
}

fn parse_a1lx(stream: &mut IStream) -> AvifResult<ItemProperty> {
    let mut bits = stream.sub_bit_stream(1)?;
    // unsigned int(7) reserved = 0;
    if bits.read(7)? != 0 {
        return AvifError::bmff_parse_failed("invalid reserved bits in a1lx");
    }
    // unsigned int(1) large_size;
    let large_size = bits.read_bool()?;
    let mut layer_sizes: [usize; 3] = [0; 3];
    for layer_size in &mut layer_sizes {
        if large_size {
            // unsigned int(32) layer_size;
            *layer_size = usize_from_u32(stream.read_u32()?)?;
        } else {
            // unsigned int(16) layer_size;
            *layer_size = usize_from_u16(stream.read_u16()?)?;
        }
    }
    Ok(ItemProperty::AV1LayeredImageIndexing(layer_sizes))
}

fn parse_ipco(stream: &mut IStream) -> AvifResult<Vec<ItemProperty>> {
    let mut properties: Vec<ItemProperty> = Vec::new();
    while stream.has_bytes_left() {
        let header = parse_header(stream)?;
        let mut sub_stream = sub_stream_for(stream, &header)?;
        match header.box_type.as_str() {
            "ispe" => properties.push(parse_ispe(&mut sub_stream)?),
            "pixi" => properties.push(parse_pixi(&mut sub_stream)?),
            "av1C" => properties.push(parse_av1C(&mut sub_stream)?),
            "colr" => {
                if let Some(colr) = parse_colr(&mut sub_stream)? {
                    properties.push(colr)
                }
            }
            "pasp" => properties.push(parse_pasp(&mut sub_stream)?),
            "auxC" => properties.push(parse_auxC(&mut sub_stream)?),
            "clap" => properties.push(parse_clap(&mut sub_stream)?),
            "irot" => properties.push(parse_irot(&mut sub_stream)?),
            "imir" => properties.push(parse_imir(&mut sub_stream)?),
            "a1op" => properties.push(parse_a1op(&mut sub_stream)?),
            "lsel" => properties.push(parse_lsel(&mut sub_stream)?),
            "a1lx" => properties.push(parse_a1lx(&mut sub_stream)?),
            _ => {
                log::debug!("unknown property box {}", header.box_type);
                properties.push(ItemProperty::Unknown(header.box_type));
            }
        }
    }
    Ok(properties)
}

fn parse_ipma(stream: &mut IStream) -> AvifResult<Vec<ItemPropertyAssociation>> {
    let (version, flags) = stream.read_version_and_flags()?;
    // unsigned int(32) entry_count;
    let entry_count = stream.read_u32()?;
    let mut ipma: Vec<ItemPropertyAssociation> = Vec::new();
    for _ in 0..entry_count {
        let mut entry = ItemPropertyAssociation {
            version,
            flags,
            ..ItemPropertyAssociation::default()
        };
        // ISO/IEC 23008-12, Section 9.3.1: Each ItemPropertyAssociation box
        // shall be ordered by increasing item_ID, and there shall be at most
        // one association box for each item_ID, in any ItemPropertyAssociation
        // box.
        if version < 1 {
            // unsigned int(16) item_ID;
            entry.item_id = stream.read_u16()? as u32;
        } else {
            // unsigned int(32) item_ID;
            entry.item_id = stream.read_u32()?;
        }
        if entry.item_id == 0 {
            return AvifError::bmff_parse_failed("invalid item id in ipma");
        }
        if let Some(previous_entry) = ipma.last() {
            if entry.item_id <= previous_entry.item_id {
                return AvifError::bmff_parse_failed("ipma item ids are not strictly increasing");
            }
        }
        // unsigned int(8) association_count;
        let association_count = stream.read_u8()?;
        for _ in 0..association_count {
            // bit(1) essential;
            let mut bits = stream.sub_bit_stream(1)?;
            let essential = bits.read_bool()?;
            // unsigned int(7 or 15) property_index;
            let mut property_index: u16 = bits.read(7)? as u16;
            if (flags & 0x1) == 1 {
                let property_index_lsb: u16 = stream.read_u8()? as u16;
                property_index <<= 8;
                property_index |= property_index_lsb;
            }
            entry.associations.push((property_index, essential));
        }
        ipma.push(entry);
    }
    Ok(ipma)
}

fn parse_iprp(stream: &mut IStream) -> AvifResult<ItemPropertyBox> {
    let header = parse_header(stream)?;
    if header.box_type != "ipco" {
        return AvifError::bmff_parse_failed("first box in iprp is not ipco");
    }
    let mut iprp = ItemPropertyBox::default();
    // Parse the ipco box.
    {
        let mut sub_stream = sub_stream_for(stream, &header)?;
        iprp.properties = parse_ipco(&mut sub_stream)?;
    }
    // Parse the ipma boxes. There must be at most one for each unique
    // (version, flags) pair, and at most 4 pairs overall.
    let mut version_and_flags_seen: HashSet<(u8, u32)> = HashSet::new();
    while stream.has_bytes_left() {
        let header = parse_header(stream)?;
        if header.box_type != "ipma" {
            return AvifError::bmff_parse_failed("found non ipma box in iprp");
        }
        let mut sub_stream = sub_stream_for(stream, &header)?;
        let mut associations = parse_ipma(&mut sub_stream)?;
        if let Some(association) = associations.first() {
            if !version_and_flags_seen.insert((association.version, association.flags)) {
                return AvifError::bmff_parse_failed("duplicate ipma version and flags");
            }
            if version_and_flags_seen.len() > 4 {
                return AvifError::bmff_parse_failed("too many ipma boxes in iprp");
            }
        }
        iprp.associations.append(&mut associations);
    }
    Ok(iprp)
}

fn parse_infe(stream: &mut IStream) -> AvifResult<ItemInfo> {
    let (version, _flags) = stream.read_version_and_flags()?;
    if version != 2 && version != 3 {
        return AvifError::bmff_parse_failed("infe box version 2 or 3 expected");
    }
    let mut entry = ItemInfo::default();
    if version == 2 {
        // unsigned int(16) item_ID;
        entry.item_id = stream.read_u16()? as u32;
    } else {
        // unsigned int(32) item_ID;
        entry.item_id = stream.read_u32()?;
    }
    if entry.item_id == 0 {
        return AvifError::bmff_parse_failed("invalid item id in infe");
    }
    // unsigned int(16) item_protection_index;
    entry.item_protection_index = stream.read_u16()?;
    // unsigned int(32) item_type;
    entry.item_type = stream.read_string(4)?;
    if entry.item_type == "mime" {
        // string item_name;
        stream.read_c_string(stream.bytes_left())?;
        // string content_type;
        entry.content_type = stream.read_c_string(stream.bytes_left())?;
    }
    Ok(entry)
}

fn parse_iinf(stream: &mut IStream) -> AvifResult<Vec<ItemInfo>> {
    let (version, _flags) = stream.read_version_and_flags()?;
    let entry_count: u32 = if version == 0 {
        // unsigned int(16) entry_count;
        stream.read_u16()? as u32
    } else {
        // unsigned int(32) entry_count;
        stream.read_u32()?
    };
    let mut iinf: Vec<ItemInfo> = Vec::new();
    for _ in 0..entry_count {
        let header = parse_header(stream)?;
        if header.box_type != "infe" {
            return AvifError::bmff_parse_failed("found non infe box in iinf");
        }
        let mut sub_stream = sub_stream_for(stream, &header)?;
        iinf.push(parse_infe(&mut sub_stream)?);
    }
    Ok(iinf)
}

fn parse_iref(stream: &mut IStream) -> AvifResult<Vec<ItemReference>> {
    let (version, _flags) = stream.read_version_and_flags()?;
    let mut iref: Vec<ItemReference> = Vec::new();
    // Versions > 1 are not supported and ignored.
    if version <= 1 {
        while stream.has_bytes_left() {
            let header = parse_header(stream)?;
            let from_item_id: u32 = if version == 0 {
                // unsigned int(16) from_item_ID;
                stream.read_u16()? as u32
            } else {
                // unsigned int(32) from_item_ID;
                stream.read_u32()?
            };
            if from_item_id == 0 {
                return AvifError::bmff_parse_failed("invalid from_item_id in iref");
            }
            // unsigned int(16) reference_count;
            let reference_count = stream.read_u16()?;
            for index in 0..reference_count {
                let to_item_id: u32 = if version == 0 {
                    // unsigned int(16) to_item_ID;
                    stream.read_u16()? as u32
                } else {
                    // unsigned int(32) to_item_ID;
                    stream.read_u32()?
                };
                if to_item_id == 0 {
                    return AvifError::bmff_parse_failed("invalid to_item_id in iref");
                }
                iref.push(ItemReference {
                    from_item_id,
                    to_item_id,
                    reference_type: header.box_type.clone(),
                    index: index as u32,
                });
            }
        }
    }
    Ok(iref)
}

fn parse_idat(stream: &mut IStream) -> AvifResult<Vec<u8>> {
    if !stream.has_bytes_left() {
        return AvifError::bmff_parse_failed("invalid idat size");
    }
    Ok(stream.get_slice(stream.bytes_left())?.to_vec())
}

pub(crate) fn parse_meta(stream: &mut IStream) -> AvifResult<MetaBox> {
    let (_version, _flags) = stream.read_and_enforce_version_and_flags(0)?;
    let mut meta = MetaBox::default();

    // Parse the first hdlr box.
    {
        let header = parse_header(stream)?;
        if header.box_type != "hdlr" {
            return AvifError::bmff_parse_failed("first box in meta is not hdlr");
        }
        let mut sub_stream = sub_stream_for(stream, &header)?;
        parse_hdlr(&mut sub_stream)?;
    }

    let mut boxes_seen = HashSet::from([String::from("hdlr")]);
    while stream.has_bytes_left() {
        let header = parse_header(stream)?;
        match header.box_type.as_str() {
            "hdlr" | "iloc" | "pitm" | "iprp" | "iinf" | "iref" | "idat" => {
                if boxes_seen.contains(&header.box_type) {
                    return AvifError::bmff_parse_failed(format!(
                        "duplicate {} box in meta",
                        header.box_type
                    ));
                }
                boxes_seen.insert(header.box_type.clone());
            }
            _ => {}
        }
        let mut sub_stream = sub_stream_for(stream, &header)?;
        match header.box_type.as_str() {
            "iloc" => meta.iloc = parse_iloc(&mut sub_stream)?,
            "pitm" => meta.primary_item_id = parse_pitm(&mut sub_stream)?,
            "iprp" => meta.iprp = parse_iprp(&mut sub_stream)?,
            "iinf" => meta.iinf = parse_iinf(&mut sub_stream)?,
            "iref" => meta.iref = parse_iref(&mut sub_stream)?,
            "idat" => meta.idat = parse_idat(&mut sub_stream)?,
            _ => log::debug!("skipping box {} in meta", header.box_type),
        }
    }
    Ok(meta)
}

fn parse_tkhd(stream: &mut IStream, track: &mut Track) -> AvifResult<()> {
    let (version, _flags) = stream.read_version_and_flags()?;
    if version == 1 {
        // unsigned int(64) creation_time;
        stream.skip_u64()?;
        // unsigned int(64) modification_time;
        stream.skip_u64()?;
        // unsigned int(32) track_ID;
        track.id = stream.read_u32()?;
        // const unsigned int(32) reserved = 0;
        stream.skip_u32()?;
        // unsigned int(64) duration;
        track.track_duration = stream.read_u64()?;
    } else if version == 0 {
        // unsigned int(32) creation_time;
        stream.skip_u32()?;
        // unsigned int(32) modification_time;
        stream.skip_u32()?;
        // unsigned int(32) track_ID;
        track.id = stream.read_u32()?;
        // const unsigned int(32) reserved = 0;
        stream.skip_u32()?;
        // unsigned int(32) duration;
        track.track_duration = stream.read_u32()? as u64;
    } else {
        return AvifError::bmff_parse_failed("unsupported version in tkhd");
    }

    // Skip the following 52 bytes:
    // const unsigned int(32)[2] reserved = 0;
    // template int(16) layer = 0;
    // template int(16) alternate_group = 0;
    // template int(16) volume = {if track_is_audio 0x0100 else 0};
    // const unsigned int(16) reserved = 0;
    // template int(32)[9] matrix;
    stream.skip(52)?;

    // unsigned int(32) width; (16.16 fixed point)
    track.width = stream.read_u32()? >> 16;
    // unsigned int(32) height; (16.16 fixed point)
    track.height = stream.read_u32()? >> 16;

    if track.width == 0 || track.height == 0 {
        return AvifError::bmff_parse_failed("invalid track dimensions");
    }
    Ok(())
}

fn parse_mdhd(stream: &mut IStream, track: &mut Track) -> AvifResult<()> {
    let (version, _flags) = stream.read_version_and_flags()?;
    if version == 1 {
        // unsigned int(64) creation_time;
        stream.skip_u64()?;
        // unsigned int(64) modification_time;
        stream.skip_u64()?;
        // unsigned int(32) timescale;
        track.media_timescale = stream.read_u32()?;
        // unsigned int(64) duration;
        track.media_duration = stream.read_u64()?;
    } else if version == 0 {
        // unsigned int(32) creation_time;
        stream.skip_u32()?;
        // unsigned int(32) modification_time;
        stream.skip_u32()?;
        // unsigned int(32) timescale;
        track.media_timescale = stream.read_u32()?;
        // unsigned int(32) duration;
        track.media_duration = stream.read_u32()? as u64;
    } else {
        return AvifError::bmff_parse_failed("unsupported version in mdhd");
    }

    // Skip the following 4 bytes:
    // bit(1) pad = 0;
    // unsigned int(5)[3] language;
    // unsigned int(16) pre_defined = 0;
    stream.skip(4)?;
    Ok(())
}

fn parse_stco(
    stream: &mut IStream,
    sample_table: &mut SampleTable,
    large_offset: bool,
) -> AvifResult<()> {
    let (_version, _flags) = stream.read_and_enforce_version_and_flags(0)?;
    // unsigned int(32) entry_count;
    let entry_count = usize_from_u32(stream.read_u32()?)?;
    for _ in 0..entry_count {
        let chunk_offset: u64 = if large_offset {
            // unsigned int(64) chunk_offset;
            stream.read_u64()?
        } else {
            // unsigned int(32) chunk_offset;
            stream.read_u32()? as u64
        };
        sample_table.chunk_offsets.push(chunk_offset);
    }
    Ok(())
}

fn parse_stsc(stream: &mut IStream, sample_table: &mut SampleTable) -> AvifResult<()> {
    let (_version, _flags) = stream.read_and_enforce_version_and_flags(0)?;
    // unsigned int(32) entry_count;
    let entry_count = usize_from_u32(stream.read_u32()?)?;
    for i in 0..entry_count {
        let stsc = SampleToChunk {
            // unsigned int(32) first_chunk;
            first_chunk: stream.read_u32()?,
            // unsigned int(32) samples_per_chunk;
            samples_per_chunk: stream.read_u32()?,
            // unsigned int(32) sample_description_index;
            sample_description_index: stream.read_u32()?,
        };
        if i == 0 {
            if stsc.first_chunk != 1 {
                return AvifError::bmff_parse_failed("stsc does not begin with chunk 1");
            }
        } else if stsc.first_chunk <= sample_table.sample_to_chunk.last().unwrap().first_chunk {
            return AvifError::bmff_parse_failed("stsc chunks are not strictly increasing");
        }
        sample_table.sample_to_chunk.push(stsc);
    }
    Ok(())
}

fn parse_stsz(stream: &mut IStream, sample_table: &mut SampleTable) -> AvifResult<()> {
    let (_version, _flags) = stream.read_and_enforce_version_and_flags(0)?;
    // unsigned int(32) sample_size;
    let sample_size = stream.read_u32()?;
    // unsigned int(32) sample_count;
    let sample_count = usize_from_u32(stream.read_u32()?)?;
    if sample_size > 0 {
        sample_table.sample_size = SampleSize::FixedSize(sample_size);
        return Ok(());
    }
    let mut sample_sizes: Vec<u32> = Vec::new();
    for _ in 0..sample_count {
        // unsigned int(32) entry_size;
        sample_sizes.push(stream.read_u32()?);
    }
    sample_table.sample_size = SampleSize::Sizes(sample_sizes);
    Ok(())
}

fn parse_stss(stream: &mut IStream, sample_table: &mut SampleTable) -> AvifResult<()> {
    let (_version, _flags) = stream.read_and_enforce_version_and_flags(0)?;
    // unsigned int(32) entry_count;
    let entry_count = usize_from_u32(stream.read_u32()?)?;
    for _ in 0..entry_count {
        // unsigned int(32) sample_number;
        sample_table.sync_samples.push(stream.read_u32()?);
    }
    Ok(())
}

fn parse_stts(stream: &mut IStream, sample_table: &mut SampleTable) -> AvifResult<()> {
    let (_version, _flags) = stream.read_and_enforce_version_and_flags(0)?;
    // unsigned int(32) entry_count;
    let entry_count = usize_from_u32(stream.read_u32()?)?;
    for _ in 0..entry_count {
        let stts = TimeToSample {
            // unsigned int(32) sample_count;
            sample_count: stream.read_u32()?,
            // unsigned int(32) sample_delta;
            sample_delta: stream.read_u32()?,
        };
        sample_table.time_to_sample.push(stts);
    }
    Ok(())
}

fn parse_stsd(stream: &mut IStream, sample_table: &mut SampleTable) -> AvifResult<()> {
    let (_version, _flags) = stream.read_and_enforce_version_and_flags(0)?;
    // unsigned int(32) entry_count;
    let entry_count = usize_from_u32(stream.read_u32()?)?;
    for _ in 0..entry_count {
        let header = parse_header(stream)?;
        let mut stsd = SampleDescription {
            format: header.box_type.clone(),
            ..SampleDescription::default()
        };
        let mut sub_stream = sub_stream_for(stream, &header)?;
        if stsd.format == "av01" {
            // Skip 78 bytes of the VisualSampleEntry.
            if sub_stream.bytes_left() <= 78 {
                return AvifError::bmff_parse_failed("not enough bytes in av01 sample entry");
            }
            sub_stream.skip(78)?;
            stsd.properties = parse_ipco(&mut sub_stream)?;
        }
        sample_table.sample_descriptions.push(stsd);
    }
    Ok(())
}

fn parse_stbl(stream: &mut IStream, track: &mut Track) -> AvifResult<()> {
    if track.sample_table.is_some() {
        return AvifError::bmff_parse_failed("duplicate stbl for track");
    }
    let mut sample_table = SampleTable::default();
    while stream.has_bytes_left() {
        let header = parse_header(stream)?;
        let mut sub_stream = sub_stream_for(stream, &header)?;
        match header.box_type.as_str() {
            "stco" => parse_stco(&mut sub_stream, &mut sample_table, false)?,
            "co64" => parse_stco(&mut sub_stream, &mut sample_table, true)?,
            "stsc" => parse_stsc(&mut sub_stream, &mut sample_table)?,
            "stsz" => parse_stsz(&mut sub_stream, &mut sample_table)?,
            "stss" => parse_stss(&mut sub_stream, &mut sample_table)?,
            "stts" => parse_stts(&mut sub_stream, &mut sample_table)?,
            "stsd" => parse_stsd(&mut sub_stream, &mut sample_table)?,
            _ => log::debug!("skipping box {} in stbl", header.box_type),
        }
    }
    track.sample_table = Some(sample_table);
    Ok(())
}

fn parse_minf(stream: &mut IStream, track: &mut Track) -> AvifResult<()> {
    while stream.has_bytes_left() {
        let header = parse_header(stream)?;
        let mut sub_stream = sub_stream_for(stream, &header)?;
        match header.box_type.as_str() {
            "stbl" => parse_stbl(&mut sub_stream, track)?,
            _ => log::debug!("skipping box {} in minf", header.box_type),
        }
    }
    Ok(())
}

fn parse_mdia(stream: &mut IStream, track: &mut Track) -> AvifResult<()> {
    while stream.has_bytes_left() {
        let header = parse_header(stream)?;
        let mut sub_stream = sub_stream_for(stream, &header)?;
        match header.box_type.as_str() {
            "mdhd" => parse_mdhd(&mut sub_stream, track)?,
            "minf" => parse_minf(&mut sub_stream, track)?,
            _ => log::debug!("skipping box {} in mdia", header.box_type),
        }
    }
    Ok(())
}

fn parse_tref(stream: &mut IStream, track: &mut Track) -> AvifResult<()> {
    while stream.has_bytes_left() {
        let header = parse_header(stream)?;
        let mut sub_stream = sub_stream_for(stream, &header)?;
        match header.box_type.as_str() {
            "auxl" => {
                // unsigned int(32) track_IDs[];
                // Use only the first one and skip the rest.
                track.aux_for_id = sub_stream.read_u32()?;
            }
            "prem" => {
                // unsigned int(32) track_IDs[];
                // Use only the first one and skip the rest.
                track.prem_by_id = sub_stream.read_u32()?;
            }
            _ => log::debug!("skipping box {} in tref", header.box_type),
        }
    }
    Ok(())
}

fn parse_elst(stream: &mut IStream, track: &mut Track) -> AvifResult<()> {
    if track.elst_seen {
        return AvifError::bmff_parse_failed("more than one elst box was found for track");
    }
    track.elst_seen = true;
    let (version, flags) = stream.read_version_and_flags()?;
    if (flags & 1) == 0 {
        track.is_repeating = false;
        return Ok(());
    }
    track.is_repeating = true;
    // unsigned int(32) entry_count;
    let entry_count = stream.read_u32()?;
    if entry_count != 1 {
        return AvifError::bmff_parse_failed("elst has entry_count != 1");
    }
    if version == 1 {
        // unsigned int(64) segment_duration;
        track.segment_duration = stream.read_u64()?;
    } else if version == 0 {
        // unsigned int(32) segment_duration;
        track.segment_duration = stream.read_u32()? as u64;
    } else {
        return AvifError::bmff_parse_failed("unsupported version in elst");
    }
    if track.segment_duration == 0 {
        return AvifError::bmff_parse_failed("invalid value for segment_duration (0)");
    }
    Ok(())
}

fn parse_edts(stream: &mut IStream, track: &mut Track) -> AvifResult<()> {
    if track.elst_seen {
        // This function always exits with track.elst_seen set to true, so
        // track.elst_seen also verifies the uniqueness of the edts box.
        return AvifError::bmff_parse_failed("multiple edts boxes found for track");
    }
    while stream.has_bytes_left() {
        let header = parse_header(stream)?;
        let mut sub_stream = sub_stream_for(stream, &header)?;
        match header.box_type.as_str() {
            "elst" => parse_elst(&mut sub_stream, track)?,
            _ => log::debug!("skipping box {} in edts", header.box_type),
        }
    }
    if !track.elst_seen {
        return AvifError::bmff_parse_failed("elst box was not found in edts");
    }
    Ok(())
}

fn parse_trak(stream: &mut IStream) -> AvifResult<Track> {
    let mut track = Track::default();
    while stream.has_bytes_left() {
        let header = parse_header(stream)?;
        let mut sub_stream = sub_stream_for(stream, &header)?;
        match header.box_type.as_str() {
            "tkhd" => parse_tkhd(&mut sub_stream, &mut track)?,
            "mdia" => parse_mdia(&mut sub_stream, &mut track)?,
            "tref" => parse_tref(&mut sub_stream, &mut track)?,
            "edts" => parse_edts(&mut sub_stream, &mut track)?,
            "meta" => track.meta = Some(parse_meta(&mut sub_stream)?),
            _ => log::debug!("skipping box {} in trak", header.box_type),
        }
    }
    Ok(track)
}

fn parse_moov(stream: &mut IStream) -> AvifResult<Vec<Track>> {
    let mut tracks: Vec<Track> = Vec::new();
    while stream.has_bytes_left() {
        let header = parse_header(stream)?;
        let mut sub_stream = sub_stream_for(stream, &header)?;
        match header.box_type.as_str() {
            "trak" => tracks.push(parse_trak(&mut sub_stream)?),
            _ => log::debug!("skipping box {} in moov", header.box_type),
        }
    }
    Ok(tracks)
}

/// Pulls boxes from the IO until ftyp and the boxes its brands require (meta
/// and/or moov) have been seen. Unknown top-level boxes are skipped without
/// being read into memory.
pub fn parse(io: &mut GenericIO) -> AvifResult<AvifBoxes> {
    let mut ftyp: Option<FileTypeBox> = None;
    let mut meta: Option<MetaBox> = None;
    let mut tracks: Option<Vec<Track>> = None;
    let mut parse_offset: u64 = 0;
    loop {
        // Read just enough to parse the next box header (at most 32 bytes).
        let header_data = io.read(parse_offset, 32)?;
        if header_data.is_empty() {
            // No error and no bytes: end of stream.
            break;
        }
        let mut header_stream = IStream::create(header_data);
        let header = parse_header(&mut header_stream)?;
        checked_incr!(parse_offset, header.header_size as u64);

        let box_size: u64 = match header.size {
            BoxSize::FixedSize(size) => u64_from_usize(size)?,
            BoxSize::UntilEndOfStream => {
                let size_hint = io.size_hint();
                if size_hint == 0 || size_hint < parse_offset {
                    return AvifError::bmff_parse_failed("cannot determine top-level box size");
                }
                size_hint - parse_offset
            }
        };

        // Read the rest of the box if necessary.
        match header.box_type.as_str() {
            "ftyp" | "meta" | "moov" => {
                let box_data = io.read(parse_offset, usize_from_u64(box_size)?)?;
                if u64_from_usize(box_data.len())? != box_size {
                    return Err(AvifError::TruncatedData);
                }
                let mut box_stream = IStream::create(box_data);
                match header.box_type.as_str() {
                    "ftyp" => {
                        let file_type = parse_ftyp(&mut box_stream)?;
                        if !file_type.is_avif() {
                            return Err(AvifError::InvalidFtyp);
                        }
                        ftyp = Some(file_type);
                    }
                    "meta" => meta = Some(parse_meta(&mut box_stream)?),
                    "moov" => tracks = Some(parse_moov(&mut box_stream)?),
                    _ => {} // Not reached.
                }
                if let Some(ftyp) = &ftyp {
                    if (!ftyp.needs_meta() || meta.is_some())
                        && (!ftyp.needs_moov() || tracks.is_some())
                    {
                        // Enough information has been parsed to consider parse
                        // a success.
                        break;
                    }
                }
            }
            _ => log::debug!("skipping top-level box {}", header.box_type),
        }
        checked_incr!(parse_offset, box_size);
    }
    let ftyp = ftyp.ok_or(AvifError::InvalidFtyp)?;
    if (ftyp.needs_meta() && meta.is_none()) || (ftyp.needs_moov() && tracks.is_none()) {
        return Err(AvifError::TruncatedData);
    }
    Ok(AvifBoxes {
        ftyp,
        meta: meta.unwrap_or_default(),
        tracks: tracks.unwrap_or_default(),
    })
}

pub fn peek_compatible_file_type(data: &[u8]) -> AvifResult<bool> {
    let mut stream = IStream::create(data);
    let header = parse_header(&mut stream)?;
    if header.box_type != "ftyp" {
        return Ok(false);
    }
    let mut sub_stream = sub_stream_for(&mut stream, &header)?;
    let ftyp = parse_ftyp(&mut sub_stream)?;
    Ok(ftyp.is_avif())
}
