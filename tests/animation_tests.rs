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

mod utils;

use utils::*;

use pincer_avif::decoder::track::RepetitionCount;
use pincer_avif::image::Plane;
use pincer_avif::*;

fn color_track() -> TrackSpec {
    TrackSpec {
        id: 1,
        width: 64,
        height: 64,
        timescale: 10,
        duration: 10,
        sample_payloads: (1..=5u8).map(|value| vec![value; 4]).collect(),
        sample_delta: 2,
        sync_samples: vec![1, 4],
        aux_for: None,
    }
}

fn alpha_track() -> TrackSpec {
    TrackSpec {
        id: 2,
        width: 64,
        height: 64,
        timescale: 10,
        duration: 10,
        sample_payloads: (1..=5u8).map(|value| vec![100 + value; 4]).collect(),
        sample_delta: 2,
        sync_samples: vec![1, 4],
        aux_for: Some(1),
    }
}

#[test]
fn animated_image() {
    let mut decoder = decoder_with_data(build_avis(&[color_track()]));
    assert!(decoder.parse().is_ok());
    let image = decoder.image();
    assert!(!image.alpha_present);
    assert!(image.image_sequence_track_present);
    assert_eq!(image.width, 64);
    assert_eq!(image.height, 64);
    assert_eq!(decoder.image_count, 5);
    assert_eq!(decoder.timescale, 10);
    assert_eq!(decoder.duration, 1.0);
    assert_eq!(decoder.repetition_count, RepetitionCount::Unknown);
    for expected_value in 1..=5u8 {
        assert!(decoder.next_image().is_ok());
        assert_eq!(
            decoder.image().row_exact(Plane::Y, 0).unwrap()[0],
            expected_value
        );
    }
    assert!(matches!(
        decoder.next_image(),
        Err(AvifError::NoImagesRemaining)
    ));
}

#[test]
fn animated_image_with_alpha() {
    let mut decoder = decoder_with_data(build_avis(&[color_track(), alpha_track()]));
    assert!(decoder.parse().is_ok());
    assert!(decoder.image().alpha_present);
    assert!(decoder.next_image().is_ok());
    let image = decoder.image();
    assert_eq!(image.row_exact(Plane::Y, 0).unwrap()[0], 1);
    assert_eq!(image.row_exact(Plane::A, 0).unwrap()[0], 101);
}

#[test]
fn image_timing() {
    let mut decoder = decoder_with_data(build_avis(&[color_track()]));
    assert!(decoder.parse().is_ok());
    let timing = decoder.nth_image_timing(0).unwrap();
    assert_eq!(timing.pts_in_timescales, 0);
    assert_eq!(timing.duration_in_timescales, 2);
    assert_eq!(timing.duration, 0.2);
    let timing = decoder.nth_image_timing(2).unwrap();
    assert_eq!(timing.pts_in_timescales, 4);
    assert_eq!(timing.pts, 0.4);
    // next_image keeps the decoder-level timing in sync.
    assert!(decoder.next_image().is_ok());
    assert_eq!(decoder.image_timing.pts_in_timescales, 0);
    assert!(decoder.next_image().is_ok());
    assert_eq!(decoder.image_timing.pts_in_timescales, 2);
}

#[test]
fn keyframes() {
    let mut decoder = decoder_with_data(build_avis(&[color_track()]));
    // Nothing is a keyframe before parsing.
    assert!(!decoder.is_keyframe(0));
    assert!(decoder.parse().is_ok());
    // stss marks samples 1 and 4 (1-based) as sync.
    assert!(decoder.is_keyframe(0));
    assert!(!decoder.is_keyframe(1));
    assert!(decoder.is_keyframe(3));
    assert!(!decoder.is_keyframe(4));
    assert_eq!(decoder.nearest_keyframe(2), 0);
    assert_eq!(decoder.nearest_keyframe(3), 3);
    assert_eq!(decoder.nearest_keyframe(4), 3);
}

#[test]
fn keyframes_require_all_tracks_in_sync() {
    // The alpha track's stss only marks sample 1, so index 3 is not a
    // keyframe of the image as a whole.
    let mut alpha = alpha_track();
    alpha.sync_samples = vec![1];
    let mut decoder = decoder_with_data(build_avis(&[color_track(), alpha]));
    assert!(decoder.parse().is_ok());
    assert!(decoder.is_keyframe(0));
    assert!(!decoder.is_keyframe(3));
    assert_eq!(decoder.nearest_keyframe(4), 0);
}

#[test]
fn nth_image_seeks_through_keyframes() {
    let mut decoder = decoder_with_data(build_avis(&[color_track()]));
    assert!(decoder.parse().is_ok());
    // Jumping forward decodes from the nearest keyframe (index 3).
    assert!(decoder.nth_image(4).is_ok());
    assert_eq!(decoder.image_index, 4);
    assert_eq!(decoder.image().row_exact(Plane::Y, 0).unwrap()[0], 5);
    // Rewinding replays from the keyframe at index 0.
    assert!(decoder.nth_image(1).is_ok());
    assert_eq!(decoder.image_index, 1);
    assert_eq!(decoder.image().row_exact(Plane::Y, 0).unwrap()[0], 2);
    // Requesting the current frame again is a no-op.
    assert!(decoder.nth_image(1).is_ok());
    assert_eq!(decoder.image_index, 1);
    // An index past the end fails.
    assert!(matches!(
        decoder.nth_image(5),
        Err(AvifError::NoImagesRemaining)
    ));
}

#[test]
fn nth_image_matches_next_image() {
    // Decoding via next_image and via nth_image yields the same frames.
    let mut sequential = decoder_with_data(build_avis(&[color_track()]));
    assert!(sequential.parse().is_ok());
    let mut sequential_values = Vec::new();
    for _ in 0..5 {
        assert!(sequential.next_image().is_ok());
        sequential_values.push(sequential.image().row_exact(Plane::Y, 0).unwrap()[0]);
    }
    let mut seeking = decoder_with_data(build_avis(&[color_track()]));
    assert!(seeking.parse().is_ok());
    for (index, expected_value) in sequential_values.iter().enumerate() {
        assert!(seeking.nth_image(index as u32).is_ok());
        assert_eq!(
            seeking.image().row_exact(Plane::Y, 0).unwrap()[0],
            *expected_value
        );
    }
}

#[test]
fn track_source_selected_by_brand() {
    let mut decoder = decoder_with_data(build_avis(&[color_track()]));
    assert!(decoder.parse().is_ok());
    // Track-based sources report their timing through the color track.
    assert_eq!(decoder.image_count, 5);
    assert_eq!(decoder.duration_in_timescales, 10);
}
