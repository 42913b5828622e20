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
use crate::parser::mp4box::ItemProperty;
use crate::parser::mp4box::MetaBox;
use crate::*;

#[derive(Debug, Default)]
pub struct Track {
    pub id: u32,
    pub aux_for_id: u32,
    pub prem_by_id: u32,
    pub media_timescale: u32,
    pub media_duration: u64,
    pub track_duration: u64,
    pub segment_duration: u64,
    pub is_repeating: bool,
    pub width: u32,
    pub height: u32,
    pub sample_table: Option<SampleTable>,
    pub elst_seen: bool,
    // Track-local meta carries Exif/XMP items only.
    pub meta: Option<MetaBox>,
}

/// How often an image sequence repeats once it has played through.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub enum RepetitionCount {
    #[default]
    Unknown,
    Infinite,
    Finite(i32),
}

/// The presentation time of a single frame, in both timescale units and
/// seconds.
#[derive(Clone, Copy, Debug, Default)]
pub struct ImageTiming {
    pub timescale: u64,
    pub pts: f64,
    pub pts_in_timescales: u64,
    pub duration: f64,
    pub duration_in_timescales: u64,
}

impl Track {
    pub fn is_aux(&self, primary_track_id: u32) -> bool {
        if self.sample_table.is_none() || self.id == 0 {
            return false;
        }
        let sample_table = self.sample_table.as_ref().unwrap();
        if sample_table.chunk_offsets.is_empty() || !sample_table.has_av1_sample() {
            return false;
        }
        self.aux_for_id == primary_track_id
    }

    pub fn is_color(&self) -> bool {
        // A track with no auxl reference is the color track.
        self.is_aux(0)
    }

    pub fn get_properties(&self) -> Option<&Vec<ItemProperty>> {
        self.sample_table.as_ref()?.get_properties()
    }

    pub fn check_limits(&self, size_limit: u32, dimension_limit: u32) -> bool {
        check_limits(self.width, self.height, size_limit, dimension_limit)
    }

    pub fn repetition_count(&self) -> AvifResult<RepetitionCount> {
        if !self.elst_seen {
            return Ok(RepetitionCount::Unknown);
        }
        if !self.is_repeating {
            return Ok(RepetitionCount::Finite(0));
        }
        if self.track_duration == u64::MAX {
            // If the track duration is unknown or indefinite, the repetition
            // count is infinite (Section 9.6.1 of ISO/IEC 23008-12).
            return Ok(RepetitionCount::Infinite);
        }
        // Section 9.6.1 of ISO/IEC 23008-12: the edit list is repeated a
        // sufficient number of times to equal the track duration. The count
        // returned here is 0-based.
        assert!(self.segment_duration != 0);
        if self.track_duration == 0 {
            return AvifError::bmff_parse_failed("invalid track duration 0");
        }
        let remainder = if self.track_duration % self.segment_duration != 0 { 1u64 } else { 0u64 };
        let repetition_count = (self.track_duration / self.segment_duration) + remainder - 1u64;
        match i32::try_from(repetition_count) {
            Ok(count) => Ok(RepetitionCount::Finite(count)),
            Err(_) => Ok(RepetitionCount::Infinite),
        }
    }

    /// Computes the presentation timestamp and duration of frame n from the
    /// time-to-sample table.
    pub fn image_timing(&self, n: u32) -> AvifResult<ImageTiming> {
        let timescale = self.media_timescale as u64;
        let mut timing = ImageTiming {
            timescale,
            ..ImageTiming::default()
        };
        let sample_table = self.sample_table.as_ref().ok_or(AvifError::NoContent)?;
        let mut remaining = n;
        for entry in &sample_table.time_to_sample {
            let count = std::cmp::min(entry.sample_count, remaining);
            checked_incr!(
                timing.pts_in_timescales,
                checked_mul!(count as u64, entry.sample_delta as u64)?
            );
            remaining -= count;
            if remaining == 0 {
                timing.duration_in_timescales = entry.sample_delta as u64;
                break;
            }
        }
        // A track without a time-to-sample table (or a request past its end)
        // reports zero durations rather than failing; the frame itself may
        // still be decodable.
        if timing.timescale > 0 {
            timing.pts = timing.pts_in_timescales as f64 / timing.timescale as f64;
            timing.duration = timing.duration_in_timescales as f64 / timing.timescale as f64;
        }
        Ok(timing)
    }
}

#[derive(Debug)]
pub struct TimeToSample {
    pub sample_count: u32,
    pub sample_delta: u32,
}

#[derive(Debug)]
pub struct SampleToChunk {
    pub first_chunk: u32,
    pub samples_per_chunk: u32,
    #[allow(unused)]
    pub sample_description_index: u32,
}

#[derive(Debug, Default)]
pub struct SampleDescription {
    pub format: String,
    pub properties: Vec<ItemProperty>,
}

#[derive(Debug)]
pub enum SampleSize {
    FixedSize(u32),
    Sizes(Vec<u32>),
}

impl Default for SampleSize {
    fn default() -> Self {
        Self::FixedSize(0)
    }
}

#[derive(Debug, Default)]
pub struct SampleTable {
    pub chunk_offsets: Vec<u64>,
    pub sample_to_chunk: Vec<SampleToChunk>,
    pub sample_size: SampleSize,
    pub sync_samples: Vec<u32>,
    pub time_to_sample: Vec<TimeToSample>,
    pub sample_descriptions: Vec<SampleDescription>,
}

impl SampleTable {
    pub fn has_av1_sample(&self) -> bool {
        self.sample_descriptions.iter().any(|x| x.format == "av01")
    }

    // Returns the number of samples in the given 0-based chunk.
    pub fn get_sample_count_of_chunk(&self, chunk_index: u32) -> u32 {
        for entry in self.sample_to_chunk.iter().rev() {
            if entry.first_chunk <= chunk_index + 1 {
                return entry.samples_per_chunk;
            }
        }
        0
    }

    pub fn get_properties(&self) -> Option<&Vec<ItemProperty>> {
        Some(
            &self
                .sample_descriptions
                .iter()
                .find(|x| x.format == "av01")?
                .properties,
        )
    }

    pub fn sample_size(&self, index: usize) -> AvifResult<usize> {
        usize_from_u32(match &self.sample_size {
            SampleSize::FixedSize(size) => *size,
            SampleSize::Sizes(sizes) => match sizes.get(index) {
                Some(size) => *size,
                None => {
                    return AvifError::bmff_parse_failed("not enough sample sizes in stsz");
                }
            },
        })
    }
}
