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

//! AVIF container decoder. Parses the ISOBMFF/HEIF box structure, resolves
//! items, tracks and grids, and drives per-tile AV1 decoding through a codec
//! registered by the caller. The AV1 bitstream decode itself and all pixel
//! format conversions live outside of this crate.

pub mod codecs;
pub mod decoder;
pub mod image;
pub mod utils;

mod internal_utils;
mod parser;

use crate::image::Plane;

/// The result of a failed decoder call. There is no warning channel: a call
/// either succeeds, fails with one of these, or (for `WaitingOnIo`) can be
/// retried once more bytes are available.
#[derive(Clone, Debug, PartialEq)]
pub enum AvifError {
    UnknownError(String),
    InvalidFtyp,
    NoContent,
    UnsupportedDepth,
    BmffParseFailed(String),
    MissingImageItem,
    DecodeColorFailed,
    DecodeAlphaFailed,
    ColorAlphaSizeMismatch,
    IspeSizeMismatch,
    NoCodecAvailable,
    NoImagesRemaining,
    InvalidExifPayload,
    InvalidImageGrid(String),
    TruncatedData,
    IoNotSet,
    IoError,
    WaitingOnIo,
    InvalidArgument,
    NotImplemented,
    OutOfMemory,
}

impl AvifError {
    pub(crate) fn bmff_parse_failed<T>(message: impl Into<String>) -> AvifResult<T> {
        Err(AvifError::BmffParseFailed(message.into()))
    }

    pub(crate) fn invalid_image_grid<T>(message: impl Into<String>) -> AvifResult<T> {
        Err(AvifError::InvalidImageGrid(message.into()))
    }
}

pub type AvifResult<T> = Result<T, AvifError>;

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub enum PixelFormat {
    #[default]
    None,
    Yuv444,
    Yuv422,
    Yuv420,
    Yuv400,
}

impl PixelFormat {
    pub fn plane_count(&self) -> usize {
        match self {
            PixelFormat::None => 0,
            PixelFormat::Yuv400 => 1,
            PixelFormat::Yuv444 | PixelFormat::Yuv422 | PixelFormat::Yuv420 => 3,
        }
    }

    pub fn chroma_shift_x(&self) -> u32 {
        match self {
            PixelFormat::Yuv422 | PixelFormat::Yuv420 => 1,
            _ => 0,
        }
    }

    pub fn chroma_shift_y(&self) -> u32 {
        match self {
            PixelFormat::Yuv420 => 1,
            _ => 0,
        }
    }

    pub fn apply_chroma_shift_x(&self, value: u32) -> u32 {
        value >> self.chroma_shift_x()
    }

    pub fn apply_chroma_shift_y(&self, value: u32) -> u32 {
        value >> self.chroma_shift_y()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub enum YuvRange {
    Limited,
    #[default]
    Full,
}

/// CICP color primaries (ITU-T H.273 Section 8.1).
#[derive(Clone, Copy, Debug, Default, PartialEq)]
#[repr(u16)]
pub enum ColorPrimaries {
    Unknown = 0,
    Bt709 = 1,
    #[default]
    Unspecified = 2,
    Bt470M = 4,
    Bt470Bg = 5,
    Bt601 = 6,
    Smpte240 = 7,
    GenericFilm = 8,
    Bt2020 = 9,
    Xyz = 10,
    Smpte431 = 11,
    Smpte432 = 12,
    Ebu3213 = 22,
}

impl From<u16> for ColorPrimaries {
    fn from(value: u16) -> Self {
        match value {
            0 => Self::Unknown,
            1 => Self::Bt709,
            4 => Self::Bt470M,
            5 => Self::Bt470Bg,
            6 => Self::Bt601,
            7 => Self::Smpte240,
            8 => Self::GenericFilm,
            9 => Self::Bt2020,
            10 => Self::Xyz,
            11 => Self::Smpte431,
            12 => Self::Smpte432,
            22 => Self::Ebu3213,
            // 2 and all reserved values.
            _ => Self::Unspecified,
        }
    }
}

/// CICP transfer characteristics (ITU-T H.273 Section 8.2).
#[derive(Clone, Copy, Debug, Default, PartialEq)]
#[repr(u16)]
pub enum TransferCharacteristics {
    Unknown = 0,
    Bt709 = 1,
    #[default]
    Unspecified = 2,
    Bt470M = 4,
    Bt470Bg = 5,
    Bt601 = 6,
    Smpte240 = 7,
    Linear = 8,
    Log100 = 9,
    Log100Sqrt10 = 10,
    Iec61966 = 11,
    Bt1361 = 12,
    Srgb = 13,
    Bt2020Bit10 = 14,
    Bt2020Bit12 = 15,
    Pq = 16,
    Smpte428 = 17,
    Hlg = 18,
}

impl From<u16> for TransferCharacteristics {
    fn from(value: u16) -> Self {
        match value {
            0 => Self::Unknown,
            1 => Self::Bt709,
            4 => Self::Bt470M,
            5 => Self::Bt470Bg,
            6 => Self::Bt601,
            7 => Self::Smpte240,
            8 => Self::Linear,
            9 => Self::Log100,
            10 => Self::Log100Sqrt10,
            11 => Self::Iec61966,
            12 => Self::Bt1361,
            13 => Self::Srgb,
            14 => Self::Bt2020Bit10,
            15 => Self::Bt2020Bit12,
            16 => Self::Pq,
            17 => Self::Smpte428,
            18 => Self::Hlg,
            _ => Self::Unspecified,
        }
    }
}

/// CICP matrix coefficients (ITU-T H.273 Section 8.3).
#[derive(Clone, Copy, Debug, Default, PartialEq)]
#[repr(u16)]
pub enum MatrixCoefficients {
    Identity = 0,
    Bt709 = 1,
    #[default]
    Unspecified = 2,
    Fcc = 4,
    Bt470Bg = 5,
    Bt601 = 6,
    Smpte240 = 7,
    Ycgco = 8,
    Bt2020Ncl = 9,
    Bt2020Cl = 10,
    Smpte2085 = 11,
    ChromaDerivedNcl = 12,
    ChromaDerivedCl = 13,
    Ictcp = 14,
}

impl From<u16> for MatrixCoefficients {
    fn from(value: u16) -> Self {
        match value {
            0 => Self::Identity,
            1 => Self::Bt709,
            4 => Self::Fcc,
            5 => Self::Bt470Bg,
            6 => Self::Bt601,
            7 => Self::Smpte240,
            8 => Self::Ycgco,
            9 => Self::Bt2020Ncl,
            10 => Self::Bt2020Cl,
            11 => Self::Smpte2085,
            12 => Self::ChromaDerivedNcl,
            13 => Self::ChromaDerivedCl,
            14 => Self::Ictcp,
            _ => Self::Unspecified,
        }
    }
}

/// AV1 chroma sample position (AV1 specification Section 6.4.2).
#[derive(Clone, Copy, Debug, Default, PartialEq)]
#[repr(u8)]
pub enum ChromaSamplePosition {
    #[default]
    Unknown = 0,
    Vertical = 1,
    Colocated = 2,
    Reserved = 3,
}

impl From<u32> for ChromaSamplePosition {
    fn from(value: u32) -> Self {
        match value {
            1 => Self::Vertical,
            2 => Self::Colocated,
            3 => Self::Reserved,
            _ => Self::Unknown,
        }
    }
}

/// The plane set a tile belongs to. Color and alpha tile sets decode
/// independently so that one can lag behind the other while bytes trickle in
/// during incremental decodes.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub enum Category {
    #[default]
    Color,
    Alpha,
}

impl Category {
    pub const COUNT: usize = 2;
    pub const ALL: [Category; Category::COUNT] = [Category::Color, Category::Alpha];

    pub(crate) fn usize(self) -> usize {
        match self {
            Category::Color => 0,
            Category::Alpha => 1,
        }
    }

    pub fn planes(&self) -> &'static [Plane] {
        match self {
            Category::Color => &image::YUV_PLANES,
            Category::Alpha => &image::A_PLANE,
        }
    }
}
