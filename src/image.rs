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

use crate::decoder::ProgressiveState;
use crate::internal_utils::pixels::*;
use crate::internal_utils::*;
use crate::parser::mp4box::*;
use crate::utils::clap::CleanAperture;
use crate::*;

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Plane {
    Y = 0,
    U = 1,
    V = 2,
    A = 3,
}

impl From<usize> for Plane {
    fn from(plane: usize) -> Self {
        match plane {
            1 => Plane::U,
            2 => Plane::V,
            3 => Plane::A,
            _ => Plane::Y,
        }
    }
}

impl Plane {
    pub fn to_usize(self) -> usize {
        self as usize
    }
}

pub const MAX_PLANE_COUNT: usize = 4;
pub const Y_PLANE: [Plane; 1] = [Plane::Y];
pub const YUV_PLANES: [Plane; 3] = [Plane::Y, Plane::U, Plane::V];
pub const A_PLANE: [Plane; 1] = [Plane::A];
pub const ALL_PLANES: [Plane; MAX_PLANE_COUNT] = [Plane::Y, Plane::U, Plane::V, Plane::A];

/// A decoded image. Planes are owned by exactly one image at a time: a tile
/// owns its decode output until the decoder steals or copies the planes into
/// the output image it exposes.
#[derive(Default)]
pub struct Image {
    pub width: u32,
    pub height: u32,
    pub depth: u8,

    pub yuv_format: PixelFormat,
    pub yuv_range: YuvRange,
    pub chroma_sample_position: ChromaSamplePosition,

    pub alpha_present: bool,
    pub alpha_premultiplied: bool,

    pub row_bytes: [u32; MAX_PLANE_COUNT],
    pub(crate) planes: [Option<Pixels>; MAX_PLANE_COUNT],

    pub color_primaries: ColorPrimaries,
    pub transfer_characteristics: TransferCharacteristics,
    pub matrix_coefficients: MatrixCoefficients,

    pub pasp: Option<PixelAspectRatio>,
    pub clap: Option<CleanAperture>,
    pub irot_angle: Option<u8>,
    pub imir_axis: Option<u8>,

    pub exif: Vec<u8>,
    pub icc: Vec<u8>,
    pub xmp: Vec<u8>,

    pub image_sequence_track_present: bool,
    pub progressive_state: ProgressiveState,
}

/// Geometry of one plane of an image.
#[derive(Clone, Copy, Debug)]
pub struct PlaneData {
    pub width: u32,
    pub height: u32,
    pub row_bytes: u32,
    pub pixel_size: u32,
}

impl Image {
    pub fn depth_valid(&self) -> bool {
        matches!(self.depth, 8 | 10 | 12)
    }

    pub fn max_channel(&self) -> u16 {
        ((1i32 << self.depth) - 1) as u16
    }

    pub fn has_plane(&self, plane: Plane) -> bool {
        let plane_index = plane.to_usize();
        if self.planes[plane_index].is_none() || self.row_bytes[plane_index] == 0 {
            return false;
        }
        self.planes[plane_index].as_ref().unwrap().has_data()
    }

    pub fn has_alpha(&self) -> bool {
        self.has_plane(Plane::A)
    }

    pub fn width(&self, plane: Plane) -> usize {
        match plane {
            Plane::Y | Plane::A => self.width as usize,
            Plane::U | Plane::V => self.yuv_format.apply_chroma_shift_x(
                self.width + self.yuv_format.chroma_shift_x(),
            ) as usize,
        }
    }

    pub fn height(&self, plane: Plane) -> usize {
        match plane {
            Plane::Y | Plane::A => self.height as usize,
            Plane::U | Plane::V => self.yuv_format.apply_chroma_shift_y(
                self.height + self.yuv_format.chroma_shift_y(),
            ) as usize,
        }
    }

    pub fn plane_data(&self, plane: Plane) -> Option<PlaneData> {
        if !self.has_plane(plane) {
            return None;
        }
        Some(PlaneData {
            width: self.width(plane) as u32,
            height: self.height(plane) as u32,
            row_bytes: self.row_bytes[plane.to_usize()],
            pixel_size: if self.depth == 8 { 1 } else { 2 },
        })
    }

    /// Returns a full row of the plane, including any padding past the
    /// plane's width.
    pub fn row(&self, plane: Plane, row: u32) -> AvifResult<&[u8]> {
        let plane_data = self.plane_data(plane).ok_or(AvifError::NoContent)?;
        if row >= plane_data.height {
            return Err(AvifError::NoContent);
        }
        let row_bytes = plane_data.row_bytes as usize;
        let start = checked_mul!(row as usize, row_bytes)?;
        self.planes[plane.to_usize()]
            .as_ref()
            .unwrap()
            .slice(start, row_bytes)
    }

    pub fn row_mut(&mut self, plane: Plane, row: u32) -> AvifResult<&mut [u8]> {
        let plane_data = self.plane_data(plane).ok_or(AvifError::NoContent)?;
        if row >= plane_data.height {
            return Err(AvifError::NoContent);
        }
        let row_bytes = plane_data.row_bytes as usize;
        let start = checked_mul!(row as usize, row_bytes)?;
        self.planes[plane.to_usize()]
            .as_mut()
            .unwrap()
            .slice_mut(start, row_bytes)
    }

    pub fn row16(&self, plane: Plane, row: u32) -> AvifResult<&[u16]> {
        let plane_data = self.plane_data(plane).ok_or(AvifError::NoContent)?;
        if row >= plane_data.height {
            return Err(AvifError::NoContent);
        }
        let row_width = plane_data.row_bytes as usize / 2;
        let start = checked_mul!(row as usize, row_width)?;
        self.planes[plane.to_usize()]
            .as_ref()
            .unwrap()
            .slice16(start, row_width)
    }

    pub fn row16_mut(&mut self, plane: Plane, row: u32) -> AvifResult<&mut [u16]> {
        let plane_data = self.plane_data(plane).ok_or(AvifError::NoContent)?;
        if row >= plane_data.height {
            return Err(AvifError::NoContent);
        }
        let row_width = plane_data.row_bytes as usize / 2;
        let start = checked_mul!(row as usize, row_width)?;
        self.planes[plane.to_usize()]
            .as_mut()
            .unwrap()
            .slice16_mut(start, row_width)
    }

    /// Returns a row trimmed to the plane's width.
    pub fn row_exact(&self, plane: Plane, row: u32) -> AvifResult<&[u8]> {
        let width = self.width(plane);
        Ok(&self.row(plane, row)?[..width])
    }

    pub fn row_exact_mut(&mut self, plane: Plane, row: u32) -> AvifResult<&mut [u8]> {
        let width = self.width(plane);
        Ok(&mut self.row_mut(plane, row)?[..width])
    }

    pub fn row16_exact(&self, plane: Plane, row: u32) -> AvifResult<&[u16]> {
        let width = self.width(plane);
        Ok(&self.row16(plane, row)?[..width])
    }

    pub fn row16_exact_mut(&mut self, plane: Plane, row: u32) -> AvifResult<&mut [u16]> {
        let width = self.width(plane);
        Ok(&mut self.row16_mut(plane, row)?[..width])
    }

    fn planes_for_category(&self, category: Category) -> &'static [Plane] {
        match category {
            Category::Alpha => &A_PLANE,
            Category::Color => {
                if self.yuv_format == PixelFormat::Yuv400 {
                    &Y_PLANE
                } else {
                    &YUV_PLANES
                }
            }
        }
    }

    pub fn allocate_planes(&mut self, category: Category) -> AvifResult<()> {
        if !self.depth_valid() {
            return Err(AvifError::UnsupportedDepth);
        }
        let pixel_size: usize = if self.depth == 8 { 1 } else { 2 };
        for plane in self.planes_for_category(category) {
            let plane = *plane;
            let plane_index = plane.to_usize();
            let width = self.width(plane);
            let plane_size = checked_mul!(width, self.height(plane))?;
            // Fresh alpha planes start fully opaque.
            let default_value = if plane == Plane::A { self.max_channel() } else { 0 };
            if let Some(pixels) = &self.planes[plane_index] {
                if pixels.size() == plane_size {
                    continue;
                }
            }
            let mut pixels = if self.depth == 8 {
                Pixels::Buffer(Vec::new())
            } else {
                Pixels::Buffer16(Vec::new())
            };
            pixels.resize(plane_size, default_value)?;
            self.planes[plane_index] = Some(pixels);
            self.row_bytes[plane_index] = u32_from_usize(checked_mul!(width, pixel_size)?)?;
        }
        Ok(())
    }

    /// Moves the planes of `src` into `self`. This is an ownership transfer,
    /// not a copy; `src` is left without the moved planes.
    pub(crate) fn steal_planes(&mut self, src: &mut Image, category: Category) {
        for plane in category.planes() {
            let plane_index = plane.to_usize();
            self.planes[plane_index] = src.planes[plane_index].take();
            self.row_bytes[plane_index] = src.row_bytes[plane_index];
            src.row_bytes[plane_index] = 0;
        }
    }

    /// Copies a decoded tile into this image at the tile's grid position,
    /// clipping the right-most column and bottom row to the grid's output
    /// dimensions. Edge tiles are clipped, never padded.
    pub(crate) fn copy_from_tile(
        &mut self,
        tile: &Image,
        grid: &Grid,
        tile_index: u32,
        category: Category,
    ) -> AvifResult<()> {
        let row_index = tile_index / grid.columns;
        let column_index = tile_index % grid.columns;
        for plane in category.planes() {
            let plane = *plane;
            let src_plane = match tile.plane_data(plane) {
                Some(plane_data) => plane_data,
                None => continue,
            };
            // If this is the last tile column, clamp to the left-over width.
            let src_width_to_copy = if column_index == grid.columns - 1 {
                let width_so_far = checked_mul!(src_plane.width, column_index)?;
                checked_sub!(self.width(plane), usize_from_u32(width_so_far)?)?
            } else {
                usize_from_u32(src_plane.width)?
            };

            // If this is the last tile row, clamp to the left-over height.
            let src_height_to_copy = if row_index == grid.rows - 1 {
                let height_so_far = checked_mul!(src_plane.height, row_index)?;
                checked_sub!(u32_from_usize(self.height(plane))?, height_so_far)?
            } else {
                src_plane.height
            };

            let dst_y_start = checked_mul!(row_index, src_plane.height)?;
            let dst_x_offset = usize_from_u32(checked_mul!(column_index, src_plane.width)?)?;
            let dst_x_offset_end = checked_add!(dst_x_offset, src_width_to_copy)?;
            if self.depth == 8 {
                for y in 0..src_height_to_copy {
                    let src_row = tile.row(plane, y)?;
                    let src_slice = &src_row[0..src_width_to_copy];
                    let dst_row = self.row_mut(plane, checked_add!(dst_y_start, y)?)?;
                    let dst_slice = &mut dst_row[dst_x_offset..dst_x_offset_end];
                    dst_slice.copy_from_slice(src_slice);
                }
            } else {
                for y in 0..src_height_to_copy {
                    let src_row = tile.row16(plane, y)?;
                    let src_slice = &src_row[0..src_width_to_copy];
                    let dst_row = self.row16_mut(plane, checked_add!(dst_y_start, y)?)?;
                    let dst_slice = &mut dst_row[dst_x_offset..dst_x_offset_end];
                    dst_slice.copy_from_slice(src_slice);
                }
            }
        }
        Ok(())
    }

    pub fn has_same_properties_and_cicp(&self, other: &Image) -> bool {
        self.width == other.width
            && self.height == other.height
            && self.depth == other.depth
            && self.yuv_format == other.yuv_format
            && self.yuv_range == other.yuv_range
            && self.color_primaries == other.color_primaries
            && self.transfer_characteristics == other.transfer_characteristics
            && self.matrix_coefficients == other.matrix_coefficients
    }
}
