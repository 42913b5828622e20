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

pub mod io;
pub mod pixels;
pub mod stream;

use crate::parser::mp4box::*;
use crate::*;

use std::collections::hash_map::DefaultHasher;
use std::hash::BuildHasher;

/// A signed rational as stored in a full box: numerator then denominator.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Fraction(pub i32, pub u32);

/// An unsigned rational as stored in a full box: numerator then denominator.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct UFraction(pub u32, pub u32);

/// Hasher state for item maps. Items are keyed by ids read from untrusted
/// input, so iteration order must not depend on process-level random state.
#[derive(Clone, Copy, Default)]
pub struct NonRandomHasherState;

impl BuildHasher for NonRandomHasherState {
    type Hasher = DefaultHasher;
    fn build_hasher(&self) -> DefaultHasher {
        DefaultHasher::new()
    }
}

macro_rules! conversion_function {
    ($func:ident, $to: ident, $from:ty) => {
        pub fn $func(value: $from) -> AvifResult<$to> {
            $to::try_from(value).or(Err(AvifError::BmffParseFailed("invalid conversion".into())))
        }
    };
}

conversion_function!(usize_from_u64, usize, u64);
conversion_function!(usize_from_u32, usize, u32);
conversion_function!(usize_from_u16, usize, u16);
conversion_function!(u64_from_usize, u64, usize);
conversion_function!(u32_from_usize, u32, usize);
conversion_function!(u32_from_u64, u32, u64);
conversion_function!(i32_from_u32, i32, u32);

macro_rules! checked_add {
    ($a:expr, $b:expr) => {
        $a.checked_add($b)
            .ok_or(AvifError::BmffParseFailed("arithmetic overflow".into()))
    };
}

macro_rules! checked_sub {
    ($a:expr, $b:expr) => {
        $a.checked_sub($b)
            .ok_or(AvifError::BmffParseFailed("arithmetic overflow".into()))
    };
}

macro_rules! checked_mul {
    ($a:expr, $b:expr) => {
        $a.checked_mul($b)
            .ok_or(AvifError::BmffParseFailed("arithmetic overflow".into()))
    };
}

macro_rules! checked_incr {
    ($a:expr, $b:expr) => {
        $a = checked_add!($a, $b)?
    };
}

pub(crate) use checked_add;
pub(crate) use checked_incr;
pub(crate) use checked_mul;
pub(crate) use checked_sub;

/// Finds the unique nclx colr property. `Err(true)` means more than one was
/// present, which the caller must treat as a parse failure.
pub fn find_nclx(properties: &[ItemProperty]) -> Result<&Nclx, bool> {
    let mut nclx_properties = properties.iter().filter_map(|p| match p {
        ItemProperty::ColorInformation(ColorInformation::Nclx(nclx)) => Some(nclx),
        _ => None,
    });
    match (nclx_properties.next(), nclx_properties.next()) {
        (None, _) => Err(false),
        (Some(nclx), None) => Ok(nclx),
        (Some(_), Some(_)) => Err(true),
    }
}

/// Finds the unique ICC colr property. `Err(true)` means more than one was
/// present.
pub fn find_icc(properties: &[ItemProperty]) -> Result<&[u8], bool> {
    let mut icc_properties = properties.iter().filter_map(|p| match p {
        ItemProperty::ColorInformation(ColorInformation::Icc(icc)) => Some(icc),
        _ => None,
    });
    match (icc_properties.next(), icc_properties.next()) {
        (None, _) => Err(false),
        (Some(icc), None) => Ok(icc.as_slice()),
        (Some(_), Some(_)) => Err(true),
    }
}

macro_rules! find_property {
    ($properties:expr, $property_name:ident) => {
        $properties.iter().find_map(|p| match p {
            ItemProperty::$property_name(value) => Some(value),
            _ => None,
        })
    };
}

pub(crate) use find_property;

#[allow(non_snake_case)]
pub fn find_av1C(properties: &[ItemProperty]) -> Option<&CodecConfiguration> {
    find_property!(properties, CodecConfiguration)
}

pub fn find_pasp(properties: &[ItemProperty]) -> Option<PixelAspectRatio> {
    find_property!(properties, PixelAspectRatio).copied()
}

pub fn find_clap(properties: &[ItemProperty]) -> Option<crate::utils::clap::CleanAperture> {
    find_property!(properties, CleanAperture).copied()
}

pub fn find_irot_angle(properties: &[ItemProperty]) -> Option<u8> {
    find_property!(properties, ImageRotation).copied()
}

pub fn find_imir_axis(properties: &[ItemProperty]) -> Option<u8> {
    find_property!(properties, ImageMirror).copied()
}

/// Returns true if width x height fits within the configured limits. A
/// dimension limit of 0 means unlimited.
pub fn check_limits(width: u32, height: u32, size_limit: u32, dimension_limit: u32) -> bool {
    if width == 0 || height == 0 {
        return false;
    }
    if width > size_limit / height {
        return false;
    }
    if dimension_limit != 0 && (width > dimension_limit || height > dimension_limit) {
        return false;
    }
    true
}
