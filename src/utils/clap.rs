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

/// The clap box payload. The offsets are signed fractions stored with an
/// unsigned wire representation; `CropRect::create_from` reinterprets the
/// numerators.
#[derive(Clone, Copy, Debug, Default)]
pub struct CleanAperture {
    pub width: UFraction,
    pub height: UFraction,
    pub horiz_off: UFraction,
    pub vert_off: UFraction,
}

/// An integer crop rectangle equivalent to a clean aperture, expressed
/// against the item's full pixel grid.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CropRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

// Returns n0/d0 + (edge - n1/d1) / 2 if it is a non-negative integer.
// Intermediate math is 64-bit so that 32-bit numerators cannot overflow.
fn crop_origin(offset: UFraction, edge: u32, extent: i64) -> Option<i64> {
    let off_n = offset.0 as i32 as i64;
    let off_d = offset.1 as i64;
    if off_d == 0 {
        return None;
    }
    // (off_n / off_d) + (edge - extent) / 2 == (2 * off_n + off_d * (edge - extent)) / (2 * off_d)
    let num = off_n.checked_mul(2)?.checked_add(off_d.checked_mul(edge as i64 - extent)?)?;
    let den = off_d.checked_mul(2)?;
    if num % den != 0 {
        return None;
    }
    let origin = num / den;
    if origin < 0 {
        return None;
    }
    Some(origin)
}

fn positive_integer_from_fraction(fraction: UFraction) -> Option<i64> {
    let n = fraction.0 as i64;
    let d = fraction.1 as i64;
    if d == 0 || n % d != 0 {
        return None;
    }
    let value = n / d;
    if value <= 0 {
        None
    } else {
        Some(value)
    }
}

impl CropRect {
    /// Converts a clean aperture into an integer crop rectangle against an
    /// image of the given dimensions, failing if the rationals do not resolve
    /// to an integer rectangle fully contained in the image.
    pub fn create_from(
        clap: &CleanAperture,
        image_width: u32,
        image_height: u32,
        yuv_format: PixelFormat,
    ) -> AvifResult<Self> {
        let err: AvifResult<Self> = AvifError::bmff_parse_failed("invalid clap");
        let width = match positive_integer_from_fraction(clap.width) {
            Some(width) => width,
            None => return err,
        };
        let height = match positive_integer_from_fraction(clap.height) {
            Some(height) => height,
            None => return err,
        };
        let x = match crop_origin(clap.horiz_off, image_width, width) {
            Some(x) => x,
            None => return err,
        };
        let y = match crop_origin(clap.vert_off, image_height, height) {
            Some(y) => y,
            None => return err,
        };
        if x + width > image_width as i64 || y + height > image_height as i64 {
            return err;
        }
        let rect = CropRect {
            x: u32_from_u64(x as u64)?,
            y: u32_from_u64(y as u64)?,
            width: u32_from_u64(width as u64)?,
            height: u32_from_u64(height as u64)?,
        };
        if !rect.is_valid(yuv_format) {
            return err;
        }
        Ok(rect)
    }

    /// A crop rectangle must land on whole chroma samples for subsampled
    /// formats.
    pub fn is_valid(&self, yuv_format: PixelFormat) -> bool {
        if self.width == 0 || self.height == 0 {
            return false;
        }
        if yuv_format.chroma_shift_x() == 1 && self.x % 2 != 0 {
            return false;
        }
        if yuv_format.chroma_shift_y() == 1 && self.y % 2 != 0 {
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(
        CleanAperture {
            width: UFraction(96, 1),
            height: UFraction(132, 1),
            horiz_off: UFraction(0, 1),
            vert_off: UFraction(0, 1),
        },
        120, 160, PixelFormat::Yuv420,
        Some(CropRect { x: 12, y: 14, width: 96, height: 132 }) ; "centered")]
    #[test_case(
        CleanAperture {
            width: UFraction(100, 1),
            height: UFraction(100, 1),
            horiz_off: UFraction(-50i32 as u32, 1),
            vert_off: UFraction(-50i32 as u32, 1),
        },
        200, 200, PixelFormat::Yuv420,
        Some(CropRect { x: 0, y: 0, width: 100, height: 100 }) ; "negative offsets")]
    #[test_case(
        CleanAperture {
            width: UFraction(99, 2),
            height: UFraction(100, 1),
            horiz_off: UFraction(0, 1),
            vert_off: UFraction(0, 1),
        },
        200, 200, PixelFormat::Yuv444,
        None ; "non integral width")]
    #[test_case(
        CleanAperture {
            width: UFraction(100, 1),
            height: UFraction(100, 1),
            horiz_off: UFraction(0, 0),
            vert_off: UFraction(0, 1),
        },
        200, 200, PixelFormat::Yuv444,
        None ; "zero denominator")]
    #[test_case(
        CleanAperture {
            width: UFraction(100, 1),
            height: UFraction(100, 1),
            horiz_off: UFraction(10, 1),
            vert_off: UFraction(0, 1),
        },
        200, 200, PixelFormat::Yuv444,
        Some(CropRect { x: 60, y: 50, width: 100, height: 100 }) ; "shifted right")]
    #[test_case(
        CleanAperture {
            width: UFraction(100, 1),
            height: UFraction(100, 1),
            horiz_off: UFraction(1, 1),
            vert_off: UFraction(0, 1),
        },
        200, 200, PixelFormat::Yuv420,
        None ; "odd x for 420")]
    #[test_case(
        CleanAperture {
            width: UFraction(300, 1),
            height: UFraction(100, 1),
            horiz_off: UFraction(0, 1),
            vert_off: UFraction(0, 1),
        },
        200, 200, PixelFormat::Yuv444,
        None ; "wider than image")]
    fn crop_rect(
        clap: CleanAperture,
        width: u32,
        height: u32,
        yuv_format: PixelFormat,
        expected: Option<CropRect>,
    ) {
        let rect = CropRect::create_from(&clap, width, height, yuv_format);
        match expected {
            Some(expected) => assert_eq!(rect, Ok(expected)),
            None => assert!(rect.is_err()),
        }
    }
}
