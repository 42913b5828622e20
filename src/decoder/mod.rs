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

pub mod item;
pub mod tile;
pub mod track;

use crate::codecs::Codec;
use crate::codecs::CodecRegistry;
use crate::codecs::DecoderConfig;
use crate::decoder::item::*;
use crate::decoder::tile::*;
use crate::decoder::track::*;
use crate::image::*;
use crate::internal_utils::io::*;
use crate::internal_utils::*;
use crate::parser::exif;
use crate::parser::mp4box;
use crate::parser::mp4box::*;
use crate::parser::obu::Av1SequenceHeader;
use crate::*;

use std::cmp::max;
use std::cmp::min;

/// The byte source the decoder pulls from. `read` may return fewer bytes
/// than requested when the underlying source does not have them yet; the
/// decoder reports `WaitingOnIo` in that case and the call can be retried.
pub trait IO {
    fn read(&mut self, offset: u64, size: usize) -> AvifResult<&[u8]>;
    /// Total size of the stream, or 0 if unknown.
    fn size_hint(&self) -> u64;
    /// Whether returned buffers remain valid past the next call to `read`.
    fn persistent(&self) -> bool;
}

pub type GenericIO = Box<dyn IO>;

/// Which registered codec to use for decoding.
#[derive(Debug, Default)]
pub enum CodecChoice {
    #[default]
    Auto,
    ByName(String),
}

#[derive(Debug, Copy, Clone, Default, PartialEq)]
pub enum Source {
    #[default]
    Auto = 0,
    PrimaryItem = 1,
    Tracks = 2,
}

pub const DEFAULT_IMAGE_SIZE_LIMIT: u32 = 16384 * 16384;
pub const DEFAULT_IMAGE_DIMENSION_LIMIT: u32 = 32768;
pub const DEFAULT_IMAGE_COUNT_LIMIT: u32 = 12 * 3600 * 60;

#[derive(Debug)]
pub struct Settings {
    pub source: Source,
    pub ignore_exif: bool,
    pub ignore_xmp: bool,
    pub strictness: Strictness,
    pub allow_progressive: bool,
    pub allow_incremental: bool,
    pub codec_choice: CodecChoice,
    // Forwarded opaquely to the codec, which may decode with worker threads.
    pub max_threads: u32,
    pub image_size_limit: u32,
    pub image_dimension_limit: u32,
    pub image_count_limit: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            source: Default::default(),
            ignore_exif: false,
            ignore_xmp: false,
            strictness: Default::default(),
            allow_progressive: false,
            allow_incremental: false,
            codec_choice: Default::default(),
            max_threads: 1,
            image_size_limit: DEFAULT_IMAGE_SIZE_LIMIT,
            image_dimension_limit: DEFAULT_IMAGE_DIMENSION_LIMIT,
            image_count_limit: DEFAULT_IMAGE_COUNT_LIMIT,
        }
    }
}

/// A byte range of the decoder's IO.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Extent {
    pub offset: u64,
    pub size: usize,
}

impl Extent {
    fn merge(&mut self, extent: &Extent) -> AvifResult<()> {
        if self.size == 0 {
            *self = *extent;
            return Ok(());
        }
        if extent.size == 0 {
            return Ok(());
        }
        let max_extent_1 = checked_add!(self.offset, u64_from_usize(self.size)?)?;
        let max_extent_2 = checked_add!(extent.offset, u64_from_usize(extent.size)?)?;
        self.offset = min(self.offset, extent.offset);
        self.size = usize_from_u64(max(max_extent_1, max_extent_2) - self.offset)?;
        Ok(())
    }
}

#[derive(Debug)]
pub enum StrictnessFlag {
    PixiRequired,
    ClapValid,
    AlphaIspeRequired,
}

/// Compliance policy: which of the optional-in-practice requirements are
/// enforced as hard parse failures.
#[derive(Debug, Default)]
pub enum Strictness {
    None,
    #[default]
    All,
    SpecificInclude(Vec<StrictnessFlag>),
    SpecificExclude(Vec<StrictnessFlag>),
}

impl Strictness {
    pub fn pixi_required(&self) -> bool {
        match self {
            Strictness::All => true,
            Strictness::SpecificInclude(flags) => flags
                .iter()
                .any(|x| matches!(x, StrictnessFlag::PixiRequired)),
            Strictness::SpecificExclude(flags) => !flags
                .iter()
                .any(|x| matches!(x, StrictnessFlag::PixiRequired)),
            _ => false,
        }
    }

    pub fn clap_valid(&self) -> bool {
        match self {
            Strictness::All => true,
            Strictness::SpecificInclude(flags) => {
                flags.iter().any(|x| matches!(x, StrictnessFlag::ClapValid))
            }
            Strictness::SpecificExclude(flags) => {
                !flags.iter().any(|x| matches!(x, StrictnessFlag::ClapValid))
            }
            _ => false,
        }
    }

    pub fn alpha_ispe_required(&self) -> bool {
        match self {
            Strictness::All => true,
            Strictness::SpecificInclude(flags) => flags
                .iter()
                .any(|x| matches!(x, StrictnessFlag::AlphaIspeRequired)),
            Strictness::SpecificExclude(flags) => !flags
                .iter()
                .any(|x| matches!(x, StrictnessFlag::AlphaIspeRequired)),
            _ => false,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub enum ProgressiveState {
    #[default]
    Unavailable,
    Available,
    Active,
}

#[derive(Debug, Default, PartialEq)]
enum ParseState {
    #[default]
    None,
    AwaitingSequenceHeader,
    Complete,
}

/// The decode state machine. A decoder is driven with `parse` once and then
/// `next_image`/`nth_image` repeatedly; every call either completes, fails
/// terminally, or (with incremental decoding allowed) returns `WaitingOnIo`
/// and may be retried without corrupting state.
#[derive(Default)]
pub struct Decoder {
    pub settings: Settings,
    pub image_count: u32,
    pub image_index: i32,
    pub image_timing: ImageTiming,
    pub timescale: u64,
    pub duration_in_timescales: u64,
    pub duration: f64,
    pub repetition_count: RepetitionCount,
    image: Image,
    source: Source,
    ftyp: Option<FileTypeBox>,
    meta: MetaBox,
    tile_info: [TileInfo; Category::COUNT],
    tiles: [Vec<Tile>; Category::COUNT],
    items: Items,
    tracks: Vec<Track>,
    io: Option<GenericIO>,
    codecs: Vec<Codec>,
    codec_registry: CodecRegistry,
    color_track_id: Option<u32>,
    parse_state: ParseState,
}

impl Decoder {
    pub fn set_io_file(&mut self, filename: &str) -> AvifResult<()> {
        self.io = Some(Box::new(DecoderFileIO::create(filename)?));
        self.parse_state = ParseState::None;
        Ok(())
    }

    pub fn set_io_vec(&mut self, data: Vec<u8>) {
        self.io = Some(Box::new(DecoderMemoryIO::create(data)));
        self.parse_state = ParseState::None;
    }

    pub fn set_io(&mut self, io: GenericIO) {
        self.io = Some(io);
        self.parse_state = ParseState::None;
    }

    /// Injects the set of codecs available for tile decoding. Must be called
    /// before the first `next_image`/`nth_image` call.
    pub fn set_codec_registry(&mut self, codec_registry: CodecRegistry) {
        self.codec_registry = codec_registry;
    }

    fn parsing_complete(&self) -> bool {
        self.parse_state == ParseState::Complete
    }

    pub fn image(&self) -> &Image {
        &self.image
    }

    fn reset(&mut self) {
        let decoder = Decoder::default();
        // Reset all fields except settings, io and the codec registry.
        self.image_count = decoder.image_count;
        self.image_index = decoder.image_index;
        self.image_timing = decoder.image_timing;
        self.timescale = decoder.timescale;
        self.duration_in_timescales = decoder.duration_in_timescales;
        self.duration = decoder.duration;
        self.repetition_count = decoder.repetition_count;
        self.image = decoder.image;
        self.source = decoder.source;
        self.ftyp = decoder.ftyp;
        self.meta = decoder.meta;
        self.tile_info = decoder.tile_info;
        self.tiles = decoder.tiles;
        self.items = decoder.items;
        self.tracks = decoder.tracks;
        self.codecs = decoder.codecs;
        self.color_track_id = decoder.color_track_id;
        self.parse_state = decoder.parse_state;
    }

    /// Parses the container and prepares tiles for decoding. With a
    /// streaming IO this may return `WaitingOnIo`/`TruncatedData`; calling
    /// `parse` again resumes where it left off.
    pub fn parse(&mut self) -> AvifResult<()> {
        if self.io.is_none() {
            return Err(AvifError::IoNotSet);
        }
        if self.settings.image_size_limit > DEFAULT_IMAGE_SIZE_LIMIT
            || self.settings.image_dimension_limit > DEFAULT_IMAGE_DIMENSION_LIMIT
            || self.settings.image_count_limit > DEFAULT_IMAGE_COUNT_LIMIT
        {
            // Limits can only be lowered from their defaults.
            return Err(AvifError::NotImplemented);
        }
        if self.parsing_complete() {
            // Parse was called again. Reset the state and start over.
            self.parse_state = ParseState::None;
        }
        if self.parse_state == ParseState::None {
            self.reset();
            let avif_boxes = mp4box::parse(self.io.as_mut().unwrap())?;
            self.tracks = avif_boxes.tracks;
            if !self.tracks.is_empty() {
                self.image.image_sequence_track_present = true;
                for track in &self.tracks {
                    if !track.check_limits(
                        self.settings.image_size_limit,
                        self.settings.image_dimension_limit,
                    ) {
                        return AvifError::bmff_parse_failed("track dimensions too large");
                    }
                }
            }
            self.items = construct_items(&avif_boxes.meta)?;
            let alpha_ispe_required = self.settings.strictness.alpha_ispe_required();
            for item in self.items.values_mut() {
                item.harvest_ispe(
                    alpha_ispe_required,
                    self.settings.image_size_limit,
                    self.settings.image_dimension_limit,
                )?;
            }
            self.ftyp = Some(avif_boxes.ftyp);
            self.meta = avif_boxes.meta;
            self.select_source_and_build_tiles()?;
        }
        if self.parse_state == ParseState::AwaitingSequenceHeader {
            // No colr box determined the color information; probe the first
            // sample's sequence header for it.
            self.harvest_cicp_from_sequence_header()?;
        }
        self.parse_state = ParseState::Complete;
        Ok(())
    }

    /// The Reset half of parsing: chooses the decoding source, locates the
    /// color and alpha inputs, builds tiles and resolves color information.
    fn select_source_and_build_tiles(&mut self) -> AvifResult<()> {
        let ftyp = self.ftyp.as_ref().unwrap();
        self.source = match self.settings.source {
            // Decide the source based on the major brand.
            Source::Auto => match ftyp.major_brand.as_str() {
                "avis" => Source::Tracks,
                "avif" => Source::PrimaryItem,
                _ => {
                    if self.tracks.is_empty() {
                        Source::PrimaryItem
                    } else {
                        Source::Tracks
                    }
                }
            },
            source => source,
        };
        match self.source {
            Source::Tracks => self.build_tiles_from_tracks()?,
            Source::PrimaryItem => self.build_tiles_from_primary_item()?,
            Source::Auto => return Err(AvifError::UnknownError("".into())), // not reached.
        }

        // No sample may have a zero size.
        for tiles in &self.tiles {
            for tile in tiles {
                for sample in &tile.input.samples {
                    if sample.size == 0 {
                        return AvifError::bmff_parse_failed("sample has invalid size");
                    }
                }
            }
        }

        let color_properties: Vec<ItemProperty> = self.color_properties()?.clone();
        let color_properties = color_properties.as_slice();

        // Find and adopt all colr boxes, "at most one for a given value of
        // colour type" (HEIF 6.5.5.1, from Amendment 3). An explicit nclx
        // takes precedence over the sequence header.
        let mut cicp_set = false;
        match find_nclx(color_properties) {
            Ok(nclx) => {
                self.image.color_primaries = nclx.color_primaries;
                self.image.transfer_characteristics = nclx.transfer_characteristics;
                self.image.matrix_coefficients = nclx.matrix_coefficients;
                self.image.yuv_range = nclx.yuv_range;
                cicp_set = true;
            }
            Err(multiple_nclx_found) => {
                if multiple_nclx_found {
                    return AvifError::bmff_parse_failed("multiple nclx were found");
                }
            }
        }
        match find_icc(color_properties) {
            Ok(icc) => {
                self.image.icc = icc.to_vec();
            }
            Err(multiple_icc_found) => {
                if multiple_icc_found {
                    return AvifError::bmff_parse_failed("multiple icc were found");
                }
            }
        }

        self.image.pasp = find_pasp(color_properties);
        self.image.clap = find_clap(color_properties);
        self.image.irot_angle = find_irot_angle(color_properties);
        self.image.imir_axis = find_imir_axis(color_properties);

        let av1C = find_av1C(color_properties).ok_or(AvifError::BmffParseFailed(
            "missing av1C property".into(),
        ))?;
        self.image.depth = av1C.depth();
        self.image.yuv_format = av1C.pixel_format();
        self.image.chroma_sample_position = av1C.chroma_sample_position;

        self.parse_state = if cicp_set {
            ParseState::Complete
        } else {
            ParseState::AwaitingSequenceHeader
        };
        Ok(())
    }

    fn build_tiles_from_tracks(&mut self) -> AvifResult<()> {
        let size_hint = self.io.as_ref().unwrap().size_hint();
        let color_track = self
            .tracks
            .iter()
            .find(|x| x.is_color())
            .ok_or(AvifError::NoContent)?;
        self.color_track_id = Some(color_track.id);

        let mut color_tile =
            Tile::create_from_track(color_track, self.settings.image_count_limit, size_hint)?;
        color_tile.input.category = Category::Color;
        self.image_count = u32_from_usize(color_tile.input.samples.len())?;
        self.tiles[Category::Color.usize()].push(color_tile);
        self.tile_info[Category::Color.usize()].tile_count = 1;

        if let Some(alpha_track) = self.tracks.iter().find(|x| x.is_aux(color_track.id)) {
            let mut alpha_tile =
                Tile::create_from_track(alpha_track, self.settings.image_count_limit, size_hint)?;
            alpha_tile.input.category = Category::Alpha;
            self.tiles[Category::Alpha.usize()].push(alpha_tile);
            self.tile_info[Category::Alpha.usize()].tile_count = 1;
            self.image.alpha_present = true;
            self.image.alpha_premultiplied = color_track.prem_by_id == alpha_track.id;
        }

        self.image_index = -1;
        self.timescale = color_track.media_timescale as u64;
        self.duration_in_timescales = color_track.media_duration;
        self.duration = if self.timescale != 0 {
            self.duration_in_timescales as f64 / self.timescale as f64
        } else {
            0.0
        };
        self.repetition_count = color_track.repetition_count()?;
        self.image_timing = Default::default();

        self.image.width = color_track.width;
        self.image.height = color_track.height;
        Ok(())
    }

    fn build_tiles_from_primary_item(&mut self) -> AvifResult<()> {
        // Mandatory color item.
        let color_item_id = *self
            .items
            .iter()
            .find(|x| !x.1.should_skip() && x.1.id != 0 && x.1.id == self.meta.primary_item_id)
            .ok_or(AvifError::NoContent)?
            .0;
        self.read_and_parse_item(color_item_id, Category::Color)?;
        self.populate_grid_item_ids(color_item_id, Category::Color)?;

        // Optional alpha auxiliary item.
        let mut item_ids = [color_item_id, 0];
        let mut validate_alpha_pixi = true;
        let (alpha_item_id, synthesized_alpha_item) = self.find_alpha_item(color_item_id);
        if alpha_item_id != 0 {
            item_ids[Category::Alpha.usize()] = alpha_item_id;
            self.read_and_parse_item(alpha_item_id, Category::Alpha)?;
            self.populate_grid_item_ids(alpha_item_id, Category::Alpha)?;
        } else if let Some(alpha_item) = synthesized_alpha_item {
            // The alpha input is a set of auxiliary items attached to the
            // color grid's tiles. A grid item tying them together is
            // synthesized since the file carries none.
            item_ids[Category::Alpha.usize()] = alpha_item.id;
            self.tile_info[Category::Alpha.usize()].grid =
                self.tile_info[Category::Color.usize()].grid;
            self.items.insert(alpha_item.id, alpha_item);
            // The synthesized item has no pixi property.
            validate_alpha_pixi = false;
        }

        self.search_exif_or_xmp_metadata(color_item_id)?;

        self.image_index = -1;
        self.image_count = 1;
        self.timescale = 1;
        self.duration = 1.0;
        self.duration_in_timescales = 1;
        self.image_timing = ImageTiming {
            timescale: 1,
            duration: 1.0,
            duration_in_timescales: 1,
            ..ImageTiming::default()
        };

        for category in Category::ALL {
            let item_id = item_ids[category.usize()];
            if item_id == 0 {
                continue;
            }
            {
                let item = self.items.get(&item_id).unwrap();
                if category == Category::Alpha && item.width == 0 && item.height == 0 {
                    // NON-STANDARD: the alpha item does not have an ispe
                    // property; adopt the width and height of the color item.
                    let color_item = self.items.get(&color_item_id).unwrap();
                    let width = color_item.width;
                    let height = color_item.height;
                    let alpha_item = self.items.get_mut(&item_id).unwrap();
                    alpha_item.width = width;
                    alpha_item.height = height;
                }
            }
            self.tiles[category.usize()] = self.generate_tiles(item_id, category)?;
            let pixi_required = self.settings.strictness.pixi_required()
                && (category != Category::Alpha || validate_alpha_pixi);
            let item = self.items.get(&item_id).unwrap();
            item.validate_properties(
                &self.items,
                pixi_required,
                self.settings.strictness.clap_valid(),
            )?;
        }

        let color_item = self.items.get(&color_item_id).unwrap();
        self.image.width = color_item.width;
        self.image.height = color_item.height;
        self.image.alpha_present = item_ids[Category::Alpha.usize()] != 0;

        if color_item.progressive {
            self.image.progressive_state = ProgressiveState::Available;
            let sample_count = self.tiles[Category::Color.usize()][0].input.samples.len();
            if sample_count > 1 {
                self.image.progressive_state = ProgressiveState::Active;
                self.image_count = u32_from_usize(sample_count)?;
            }
        }
        Ok(())
    }

    fn color_properties(&self) -> AvifResult<&Vec<ItemProperty>> {
        match self.source {
            Source::Tracks => {
                let color_track_id = self.color_track_id.unwrap();
                self.tracks
                    .iter()
                    .find(|x| x.id == color_track_id)
                    .ok_or(AvifError::NoContent)?
                    .get_properties()
                    .ok_or(AvifError::BmffParseFailed("missing av01 track properties".into()))
            }
            _ => {
                let color_item_id = self.meta.primary_item_id;
                Ok(&self
                    .items
                    .get(&color_item_id)
                    .ok_or(AvifError::MissingImageItem)?
                    .properties)
            }
        }
    }

    fn read_and_parse_item(&mut self, item_id: u32, category: Category) -> AvifResult<()> {
        if item_id == 0 {
            return Ok(());
        }
        let io = self.io.as_mut().unwrap();
        self.items.get_mut(&item_id).unwrap().read_and_parse(
            io,
            &mut self.tile_info[category.usize()].grid,
            self.settings.image_size_limit,
            self.settings.image_dimension_limit,
        )
    }

    /// Finds the alpha auxiliary input for the given color item: either a
    /// direct auxl item, or one auxl item per color grid tile (in which case
    /// a synthesized grid item is returned).
    fn find_alpha_item(&self, color_item_id: u32) -> (u32, Option<Item>) {
        let color_item = self.items.get(&color_item_id).unwrap();
        if let Some(item) = self.items.iter().find(|x| {
            !x.1.should_skip() && x.1.aux_for_id == color_item.id && x.1.is_auxiliary_alpha()
        }) {
            return (*item.0, None);
        }
        if color_item.item_type != "grid" || color_item.grid_item_ids.is_empty() {
            return (0, None);
        }
        // If the color item is a grid, check whether the alpha channel is
        // represented as an auxl item for each color tile item.
        let mut alpha_item_indices: Vec<u32> = Vec::new();
        for color_grid_item_id in &color_item.grid_item_ids {
            match self
                .items
                .iter()
                .find(|x| x.1.aux_for_id == *color_grid_item_id && x.1.is_auxiliary_alpha())
            {
                Some(item) => alpha_item_indices.push(*item.0),
                None => return (0, None),
            }
        }
        let first_item = self.items.get(&alpha_item_indices[0]).unwrap();
        let properties = match first_item.av1C() {
            Some(av1C) => vec![ItemProperty::CodecConfiguration(av1C.clone())],
            None => return (0, None),
        };
        (
            0,
            Some(Item {
                id: self.items.keys().max().unwrap() + 1,
                item_type: String::from("grid"),
                width: color_item.width,
                height: color_item.height,
                grid_item_ids: alpha_item_indices,
                properties,
                ..Item::default()
            }),
        )
    }

    /// Collects the dimg children of a grid item, in iinf order, and adopts
    /// the first tile's codec configuration onto the grid item itself.
    #[allow(non_snake_case)]
    fn populate_grid_item_ids(&mut self, item_id: u32, category: Category) -> AvifResult<()> {
        if self.items.get(&item_id).unwrap().item_type != "grid" {
            return Ok(());
        }
        let mut grid_item_ids: Vec<u32> = Vec::new();
        let mut first_av1C: Option<CodecConfiguration> = None;
        // The dimg items cannot be iterated over directly because the item
        // map is unordered; the iinf order defines the tile order.
        for item_info in &self.meta.iinf {
            let dimg_item = self
                .items
                .get(&item_info.item_id)
                .ok_or(AvifError::InvalidImageGrid("missing grid tile item".into()))?;
            if dimg_item.dimg_for_id != item_id {
                continue;
            }
            if dimg_item.item_type != "av01" {
                return AvifError::invalid_image_grid("invalid item_type in dimg grid");
            }
            if dimg_item.has_unsupported_essential_property {
                return AvifError::invalid_image_grid(
                    "grid tile has an unsupported property marked essential",
                );
            }
            if first_av1C.is_none() {
                // Adopt the configuration property of the first tile.
                first_av1C = Some(
                    dimg_item
                        .av1C()
                        .ok_or(AvifError::BmffParseFailed(
                            "grid tile is missing av1C property".into(),
                        ))?
                        .clone(),
                );
            }
            grid_item_ids.push(item_info.item_id);
        }
        if u32_from_usize(grid_item_ids.len())?
            != self.tile_info[category.usize()].grid_tile_count()?
        {
            return AvifError::invalid_image_grid("expected number of tiles not found");
        }
        let item = self.items.get_mut(&item_id).unwrap();
        item.properties
            .push(ItemProperty::CodecConfiguration(first_av1C.unwrap()));
        item.grid_item_ids = grid_item_ids;
        Ok(())
    }

    fn search_exif_or_xmp_metadata(&mut self, color_item_id: u32) -> AvifResult<()> {
        if self.settings.ignore_exif && self.settings.ignore_xmp {
            return Ok(());
        }
        let io = self.io.as_mut().unwrap();
        if !self.settings.ignore_exif {
            if let Some(exif_item) = self
                .items
                .values_mut()
                .find(|x| x.is_exif(color_item_id))
            {
                let mut stream = exif_item.stream(io)?;
                match exif::parse(&mut stream) {
                    Ok(()) => self
                        .image
                        .exif
                        .extend_from_slice(stream.get_slice(stream.bytes_left())?),
                    // A malformed Exif payload loses the metadata, not the
                    // image.
                    Err(_) => log::warn!("malformed exif payload, ignoring"),
                }
            }
        }
        if !self.settings.ignore_xmp {
            if let Some(xmp_item) = self.items.values_mut().find(|x| x.is_xmp(color_item_id)) {
                let mut stream = xmp_item.stream(io)?;
                self.image
                    .xmp
                    .extend_from_slice(stream.get_slice(stream.bytes_left())?);
            }
        }
        Ok(())
    }

    /// Tiles must cover the whole grid canvas and the last row and column
    /// must overlap it (not merely touch its edge).
    fn validate_grid_geometry(grid: &Grid, tile_width: u32, tile_height: u32) -> AvifResult<()> {
        if tile_width == 0 || tile_height == 0 {
            return AvifError::invalid_image_grid("grid tile has no dimensions");
        }
        if checked_mul!(tile_width, grid.columns)? < grid.width
            || checked_mul!(tile_height, grid.rows)? < grid.height
        {
            return AvifError::invalid_image_grid("tiles do not cover the grid canvas");
        }
        if checked_mul!(tile_width, grid.columns - 1)? >= grid.width
            || checked_mul!(tile_height, grid.rows - 1)? >= grid.height
        {
            return AvifError::invalid_image_grid("last tile row or column is out of the canvas");
        }
        Ok(())
    }

    fn generate_tiles(&mut self, item_id: u32, category: Category) -> AvifResult<Vec<Tile>> {
        let mut tiles: Vec<Tile> = Vec::new();
        let size_hint = self.io.as_ref().unwrap().size_hint();
        let item = self.items.get(&item_id).ok_or(AvifError::MissingImageItem)?;
        if !item.grid_item_ids.is_empty() {
            if !self.tile_info[category.usize()].is_grid() {
                return AvifError::invalid_image_grid(
                    "dimg items were found but image is not a grid",
                );
            }
            let grid_item_ids = item.grid_item_ids.clone();
            let (item_width, item_height) = (item.width, item.height);
            for grid_item_id in &grid_item_ids {
                let grid_item = self
                    .items
                    .get_mut(grid_item_id)
                    .ok_or(AvifError::InvalidImageGrid("missing grid tile item".into()))?;
                let mut tile = Tile::create_from_item(
                    grid_item,
                    self.settings.allow_progressive,
                    self.settings.image_count_limit,
                    size_hint,
                )?;
                tile.input.category = category;
                tiles.push(tile);
            }
            let grid = &self.tile_info[category.usize()].grid;
            Self::validate_grid_geometry(grid, tiles[0].width, tiles[0].height)?;
            if item_width != grid.width || item_height != grid.height {
                return AvifError::invalid_image_grid(
                    "grid item ispe does not match the grid dimensions",
                );
            }
            if category == Category::Color
                && self.items.get(&grid_item_ids[0]).unwrap().progressive
            {
                // Propagate the progressive status to the top-level grid item.
                self.items.get_mut(&item_id).unwrap().progressive = true;
            }
        } else {
            if item.size == 0 {
                return Err(AvifError::MissingImageItem);
            }
            let item = self.items.get_mut(&item_id).unwrap();
            let mut tile = Tile::create_from_item(
                item,
                self.settings.allow_progressive,
                self.settings.image_count_limit,
                size_hint,
            )?;
            tile.input.category = category;
            tiles.push(tile);
        }
        self.tile_info[category.usize()].tile_count = u32_from_usize(tiles.len())?;
        Ok(tiles)
    }

    /// Probes successively larger prefixes of the first sample (in 64-byte
    /// steps up to 4096 bytes) until the AV1 sequence header parses, and
    /// adopts its color information.
    fn harvest_cicp_from_sequence_header(&mut self) -> AvifResult<()> {
        if self.tiles[Category::Color.usize()].is_empty() {
            return Ok(());
        }
        self.prepare_sample(0, Category::Color, 0)?;
        let io = self.io.as_mut().unwrap();
        let sample = &self.tiles[Category::Color.usize()][0].input.samples[0];
        let item_data_buffer = if sample.item_id == 0 {
            &None
        } else {
            &self.items.get(&sample.item_id).unwrap().data_buffer
        };
        let mut search_size = 64;
        loop {
            let size = min(search_size, sample.size);
            if let Ok(data) = sample.partial_data(io, item_data_buffer, size) {
                if let Ok(sequence_header) = Av1SequenceHeader::parse_from_obus(data) {
                    self.image.color_primaries = sequence_header.color_primaries;
                    self.image.transfer_characteristics =
                        sequence_header.transfer_characteristics;
                    self.image.matrix_coefficients = sequence_header.matrix_coefficients;
                    self.image.yuv_range = sequence_header.yuv_range;
                    return Ok(());
                }
            }
            if search_size >= 4096 || size == sample.size {
                // Could not find a sequence header; av1C alone determines the
                // image configuration.
                return Ok(());
            }
            search_size += 64;
        }
    }

    fn can_use_single_codec(&self) -> AvifResult<bool> {
        let total_tile_count = checked_add!(
            self.tiles[Category::Color.usize()].len(),
            self.tiles[Category::Alpha.usize()].len()
        )?;
        if total_tile_count == 1 {
            return Ok(true);
        }
        if self.image_count != 1 {
            return Ok(false);
        }
        let mut image_buffers = 0;
        let mut stolen_image_buffers = 0;
        for category in Category::ALL {
            if self.tile_info[category.usize()].tile_count > 0 {
                image_buffers += 1;
            }
            if self.tile_info[category.usize()].tile_count > 1 {
                stolen_image_buffers += 1;
            }
        }
        if stolen_image_buffers > 0 && image_buffers > 1 {
            // Stealing will cause problems, so separate codec instances are
            // needed.
            return Ok(false);
        }
        let operating_point = self.tiles[Category::Color.usize()][0].operating_point;
        let all_layers = self.tiles[Category::Color.usize()][0].input.all_layers;
        for tiles in &self.tiles {
            for tile in tiles {
                if tile.operating_point != operating_point || tile.input.all_layers != all_layers {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    fn create_codec(&mut self, category: Category, tile_index: usize) -> AvifResult<()> {
        let tile = &self.tiles[category.usize()][tile_index];
        let config = DecoderConfig {
            operating_point: tile.operating_point,
            all_layers: tile.input.all_layers,
            width: tile.width,
            height: tile.height,
            depth: self.image.depth,
            max_threads: self.settings.max_threads,
            image_size_limit: self.settings.image_size_limit,
            max_input_size: tile.max_sample_size(),
            codec_config: tile.codec_config.clone(),
            category,
        };
        let name = match &self.settings.codec_choice {
            CodecChoice::Auto => None,
            CodecChoice::ByName(name) => Some(name.as_str()),
        };
        let mut codec = self.codec_registry.create(name)?;
        codec.initialize(&config)?;
        self.codecs.push(codec);
        Ok(())
    }

    fn create_codecs(&mut self) -> AvifResult<()> {
        if !self.codecs.is_empty() {
            return Ok(());
        }
        if self.source == Source::Tracks {
            // At most two codec instances are used: one for the color planes
            // and one for the alpha plane.
            self.create_codec(Category::Color, 0)?;
            self.tiles[Category::Color.usize()][0].codec_index = 0;
            if !self.tiles[Category::Alpha.usize()].is_empty() {
                self.create_codec(Category::Alpha, 0)?;
                self.tiles[Category::Alpha.usize()][0].codec_index = 1;
            }
        } else if self.can_use_single_codec()? {
            self.create_codec(Category::Color, 0)?;
            for tiles in &mut self.tiles {
                for tile in tiles {
                    tile.codec_index = 0;
                }
            }
        } else {
            for category in Category::ALL {
                for tile_index in 0..self.tiles[category.usize()].len() {
                    self.create_codec(category, tile_index)?;
                    self.tiles[category.usize()][tile_index].codec_index = self.codecs.len() - 1;
                }
            }
        }
        Ok(())
    }

    /// Ensures the bytes of the sample at `image_index` can be served:
    /// multi-extent and idat-stored items are merged into one contiguous
    /// buffer. With incremental decoding allowed, a short read leaves a
    /// partial buffer behind instead of failing.
    fn prepare_sample(
        &mut self,
        image_index: usize,
        category: Category,
        tile_index: usize,
    ) -> AvifResult<()> {
        let tile = &self.tiles[category.usize()][tile_index];
        if tile.input.samples.len() <= image_index {
            return Err(AvifError::NoImagesRemaining);
        }
        let sample = &tile.input.samples[image_index];
        if sample.item_id == 0 {
            // The sample comes from a track; bytes are read straight from
            // the IO at decode time.
            return Ok(());
        }
        let io = self.io.as_mut().unwrap();
        let item = self
            .items
            .get_mut(&sample.item_id)
            .ok_or(AvifError::BmffParseFailed("sample references unknown item".into()))?;
        if item.idat_stored() || item.extents.len() > 1 {
            item.merge_extents(io, self.settings.allow_incremental)?;
        }
        Ok(())
    }

    fn prepare_samples(&mut self, image_index: usize) -> AvifResult<()> {
        for category in Category::ALL {
            for tile_index in 0..self.tiles[category.usize()].len() {
                self.prepare_sample(image_index, category, tile_index)?;
            }
        }
        Ok(())
    }

    fn decode_tiles(&mut self, image_index: usize) -> AvifResult<()> {
        let mut incomplete = false;
        for category in Category::ALL {
            let category_index = category.usize();
            let is_grid = self.tile_info[category_index].is_grid();
            if is_grid {
                self.image.allocate_planes(category)?;
            }
            let previous_decoded_tile_count =
                self.tile_info[category_index].decoded_tile_count as usize;
            for tile_index in previous_decoded_tile_count..self.tiles[category_index].len() {
                let tile = &mut self.tiles[category_index][tile_index];
                let sample = &tile.input.samples[image_index];
                let io = self.io.as_mut().unwrap();
                let item_data_buffer = if sample.item_id == 0 {
                    &None
                } else {
                    &self.items.get(&sample.item_id).unwrap().data_buffer
                };
                let data = match sample.data(io, item_data_buffer) {
                    Ok(data) => data,
                    Err(AvifError::TruncatedData) if self.settings.allow_incremental => {
                        // This tile's bytes have not arrived yet. Tiles
                        // decoded so far stay composited; the next call picks
                        // up from here.
                        incomplete = true;
                        break;
                    }
                    Err(err) => return Err(err),
                };
                let codec = &mut self.codecs[tile.codec_index];
                codec.get_next_image(data, sample.spatial_id, &mut tile.image, category)?;
                self.tile_info[category_index].decoded_tile_count += 1;

                if tile.image.width != tile.width || tile.image.height != tile.height {
                    // The codec output must match the declared tile size;
                    // this core performs no rescaling.
                    return Err(AvifError::IspeSizeMismatch);
                }
                if is_grid {
                    self.tile_info[category_index].check_tile_consistency(&tile.image)?;
                    let grid = self.tile_info[category_index].grid;
                    self.image
                        .copy_from_tile(&tile.image, &grid, u32_from_usize(tile_index)?, category)?;
                } else {
                    // Not a grid; the planes are moved out of the single
                    // tile.
                    if category == Category::Color {
                        self.image.width = tile.image.width;
                        self.image.height = tile.image.height;
                        self.image.depth = tile.image.depth;
                        self.image.yuv_format = tile.image.yuv_format;
                        self.image.yuv_range = tile.image.yuv_range;
                    } else if tile.image.width != self.image.width
                        || tile.image.height != self.image.height
                    {
                        return Err(AvifError::ColorAlphaSizeMismatch);
                    }
                    self.image.steal_planes(&mut tile.image, category);
                }
            }
        }
        if incomplete {
            return Err(AvifError::WaitingOnIo);
        }
        Ok(())
    }

    fn is_current_frame_fully_decoded(&self) -> bool {
        if !self.parsing_complete() {
            return false;
        }
        for category in Category::ALL {
            if !self.tile_info[category.usize()].is_fully_decoded() {
                return false;
            }
        }
        true
    }

    /// Decodes the next frame. All color and alpha tiles of a frame must
    /// complete before `image_index` advances; with incremental decoding
    /// allowed, a frame whose bytes are not all available yet reports
    /// `WaitingOnIo` and the call can simply be repeated.
    pub fn next_image(&mut self) -> AvifResult<()> {
        if self.io.is_none() {
            return Err(AvifError::IoNotSet);
        }
        if !self.parsing_complete() {
            return Err(AvifError::NoContent);
        }
        if self.is_current_frame_fully_decoded() {
            for category in Category::ALL {
                self.tile_info[category.usize()].decoded_tile_count = 0;
                self.tile_info[category.usize()].expected_tile_properties = None;
            }
        }
        let next_image_index = self.image_index + 1;
        if next_image_index as u32 >= self.image_count {
            return Err(AvifError::NoImagesRemaining);
        }
        self.create_codecs()?;
        self.prepare_samples(next_image_index as usize)?;
        self.decode_tiles(next_image_index as usize)?;
        self.image_index = next_image_index;
        self.image_timing = self.nth_image_timing(self.image_index as u32)?;
        Ok(())
    }

    /// Decodes the nth frame, rewinding to the nearest preceding keyframe
    /// when necessary. `nth_image(image_index + 1)` is equivalent to
    /// `next_image()`.
    pub fn nth_image(&mut self, index: u32) -> AvifResult<()> {
        if !self.parsing_complete() {
            return Err(AvifError::NoContent);
        }
        if index >= self.image_count {
            return Err(AvifError::NoImagesRemaining);
        }
        let requested_index = i32_from_u32(index)?;
        if requested_index == self.image_index + 1 {
            return self.next_image();
        }
        if requested_index == self.image_index && self.is_current_frame_fully_decoded() {
            // The current fully decoded frame was requested. Nothing to do.
            return Ok(());
        }
        let nearest_keyframe = i32_from_u32(self.nearest_keyframe(index))?;
        if nearest_keyframe > self.image_index + 1 || requested_index <= self.image_index {
            // Decoding cannot continue from the current position; flush the
            // codecs and replay from the nearest keyframe.
            self.codecs.clear();
            for category in Category::ALL {
                self.tile_info[category.usize()].decoded_tile_count = 0;
                self.tile_info[category.usize()].expected_tile_properties = None;
            }
            self.image_index = nearest_keyframe - 1;
        }
        loop {
            self.next_image()?;
            if requested_index == self.image_index {
                break;
            }
        }
        Ok(())
    }

    pub fn nth_image_timing(&self, n: u32) -> AvifResult<ImageTiming> {
        if !self.parsing_complete() {
            return Err(AvifError::NoContent);
        }
        if n > self.settings.image_count_limit {
            return Err(AvifError::NoImagesRemaining);
        }
        let color_track_id = match self.color_track_id {
            Some(color_track_id) => color_track_id,
            None => return Ok(self.image_timing),
        };
        let color_track = self
            .tracks
            .iter()
            .find(|x| x.id == color_track_id)
            .ok_or(AvifError::NoContent)?;
        color_track.image_timing(n)
    }

    /// Number of decoded rows of the frame currently being decoded,
    /// monotonically non-decreasing across `next_image` retries and equal to
    /// the image height exactly when the frame is complete.
    pub fn decoded_row_count(&self) -> u32 {
        let mut min_row_count = self.image.height;
        for category in Category::ALL {
            if self.tiles[category.usize()].is_empty() {
                continue;
            }
            let first_tile_height = self.tiles[category.usize()][0].height;
            min_row_count = min(
                min_row_count,
                self.tile_info[category.usize()].decoded_row_count(
                    self.image.height,
                    first_tile_height,
                ),
            );
        }
        min_row_count
    }

    /// An index is a keyframe only if every tile's sample at that index is
    /// marked sync.
    pub fn is_keyframe(&self, index: u32) -> bool {
        if !self.parsing_complete() {
            return false;
        }
        let index = index as usize;
        for category in Category::ALL {
            for tile in &self.tiles[category.usize()] {
                if index >= tile.input.samples.len() || !tile.input.samples[index].sync {
                    return false;
                }
            }
        }
        true
    }

    pub fn nearest_keyframe(&self, index: u32) -> u32 {
        if !self.parsing_complete() {
            return 0;
        }
        for i in (0..=index).rev() {
            if self.is_keyframe(i) {
                return i;
            }
        }
        0
    }

    /// The minimal byte range of the IO needed to decode frame `index`,
    /// starting from its nearest keyframe.
    pub fn nth_image_max_extent(&self, index: u32) -> AvifResult<Extent> {
        if !self.parsing_complete() {
            return Err(AvifError::NoContent);
        }
        let mut extent = Extent::default();
        let start_index = self.nearest_keyframe(index) as usize;
        let end_index = index as usize;
        for current_index in start_index..=end_index {
            for category in Category::ALL {
                for tile in &self.tiles[category.usize()] {
                    if current_index >= tile.input.samples.len() {
                        return Err(AvifError::NoImagesRemaining);
                    }
                    let sample = &tile.input.samples[current_index];
                    let sample_extent = if sample.item_id != 0 {
                        let item = self.items.get(&sample.item_id).unwrap();
                        item.max_extent(sample)?
                    } else {
                        Extent {
                            offset: sample.offset,
                            size: sample.size,
                        }
                    };
                    extent.merge(&sample_extent)?;
                }
            }
        }
        Ok(extent)
    }

    pub fn peek_compatible_file_type(data: &[u8]) -> bool {
        mp4box::peek_compatible_file_type(data).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(10, 20, 50, 100, 10, 140 ; "non overlapping")]
    #[test_case(100, 20, 50, 100, 50, 100 ; "overlapping")]
    fn merge_extents(
        offset1: u64,
        size1: usize,
        offset2: u64,
        size2: usize,
        expected_offset: u64,
        expected_size: usize,
    ) {
        let mut e1 = Extent {
            offset: offset1,
            size: size1,
        };
        let e2 = Extent {
            offset: offset2,
            size: size2,
        };
        assert!(e1.merge(&e2).is_ok());
        assert_eq!(e1.offset, expected_offset);
        assert_eq!(e1.size, expected_size);
    }

    #[test]
    fn merge_with_empty_extent() {
        let mut extent = Extent::default();
        let other = Extent {
            offset: 100,
            size: 10,
        };
        assert!(extent.merge(&other).is_ok());
        assert_eq!(extent, other);
        assert!(extent.merge(&Extent::default()).is_ok());
        assert_eq!(extent, other);
    }

    #[test]
    fn strictness_flags() {
        let strictness = Strictness::All;
        assert!(strictness.pixi_required());
        assert!(strictness.clap_valid());
        assert!(strictness.alpha_ispe_required());
        let strictness = Strictness::None;
        assert!(!strictness.pixi_required());
        assert!(!strictness.clap_valid());
        let strictness = Strictness::SpecificExclude(vec![StrictnessFlag::PixiRequired]);
        assert!(!strictness.pixi_required());
        assert!(strictness.clap_valid());
        let strictness = Strictness::SpecificInclude(vec![StrictnessFlag::ClapValid]);
        assert!(!strictness.pixi_required());
        assert!(strictness.clap_valid());
    }
}
