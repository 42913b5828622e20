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

use pincer_avif::decoder::*;
use pincer_avif::image::Plane;
use pincer_avif::*;

macro_rules! assert_avif_error {
    ($res:expr, $err:ident) => {
        assert!(matches!($res, Err(AvifError::$err)));
    };
    ($res:expr, $err:ident(_)) => {
        assert!(matches!($res, Err(AvifError::$err(_))));
    };
}

#[test]
fn single_item() {
    let data = build_avif(
        "avif",
        &[ItemSpec::av01(1, 100, 100, vec![42; 16])],
        1,
    );
    assert!(decoder::Decoder::peek_compatible_file_type(&data));
    let mut decoder = decoder_with_data(data);
    assert!(decoder.parse().is_ok());
    let image = decoder.image();
    assert_eq!(image.width, 100);
    assert_eq!(image.height, 100);
    assert_eq!(image.depth, 8);
    assert_eq!(image.yuv_format, PixelFormat::Yuv420);
    assert!(!image.alpha_present);
    assert!(!image.image_sequence_track_present);
    assert_eq!(decoder.image_count, 1);

    assert!(decoder.next_image().is_ok());
    assert_eq!(decoder.image_index, 0);
    let image = decoder.image();
    assert!(image.has_plane(Plane::Y));
    assert_eq!(image.row_exact(Plane::Y, 0).unwrap()[0], 42);
    assert_eq!(image.row_exact(Plane::Y, 99).unwrap()[99], 42);
    assert!(!image.has_plane(Plane::A));

    // There is only one image in the preferred source.
    assert_avif_error!(decoder.next_image(), NoImagesRemaining);
}

#[test]
fn peek_rejects_non_avif() {
    let data = ftyp("mp41", &["isom"]);
    assert!(!decoder::Decoder::peek_compatible_file_type(&data));
    let mut decoder = decoder_with_data(data);
    assert_avif_error!(decoder.parse(), InvalidFtyp);
}

#[test]
fn missing_av1c_fails() {
    let items = [ItemSpec {
        id: 1,
        item_type: "av01",
        payload: vec![42; 16],
        properties: vec![(ispe(100, 100), false), (pixi(&[8, 8, 8]), false)],
        ..ItemSpec::default()
    }];
    let mut decoder = decoder_with_data(build_avif("avif", &items, 1));
    assert_avif_error!(decoder.parse(), BmffParseFailed(_));
}

#[test]
fn missing_ispe_fails() {
    let items = [ItemSpec {
        id: 1,
        item_type: "av01",
        payload: vec![42; 16],
        properties: vec![(av1C(), false)],
        ..ItemSpec::default()
    }];
    let mut decoder = decoder_with_data(build_avif("avif", &items, 1));
    assert_avif_error!(decoder.parse(), BmffParseFailed(_));
}

#[test]
fn essential_flag_contract() {
    // a1lx must not be essential.
    let mut items = vec![ItemSpec::av01(1, 100, 100, vec![1; 40])];
    items[0].properties.push((a1lx([10, 20, 0]), true));
    let mut decoder = decoder_with_data(build_avif("avif", &items, 1));
    assert_avif_error!(decoder.parse(), BmffParseFailed(_));

    // lsel must be essential.
    let mut items = vec![ItemSpec::av01(1, 100, 100, vec![1; 40])];
    items[0].properties.push((lsel(0), false));
    let mut decoder = decoder_with_data(build_avif("avif", &items, 1));
    assert_avif_error!(decoder.parse(), BmffParseFailed(_));

    // lsel marked essential parses.
    let mut items = vec![ItemSpec::av01(1, 100, 100, vec![1; 40])];
    items[0].properties.push((lsel(0), true));
    let mut decoder = decoder_with_data(build_avif("avif", &items, 1));
    assert!(decoder.parse().is_ok());
}

#[test]
fn unknown_essential_property_makes_item_unusable() {
    let mut items = vec![ItemSpec::av01(1, 100, 100, vec![1; 16])];
    items[0].properties.push((unknown_property(), true));
    let mut decoder = decoder_with_data(build_avif("avif", &items, 1));
    // The primary item is unusable; there is nothing to decode.
    assert_avif_error!(decoder.parse(), NoContent);

    // The same property without the essential flag is simply ignored.
    let mut items = vec![ItemSpec::av01(1, 100, 100, vec![1; 16])];
    items[0].properties.push((unknown_property(), false));
    let mut decoder = decoder_with_data(build_avif("avif", &items, 1));
    assert!(decoder.parse().is_ok());
}

fn item_without_pixi() -> ItemSpec {
    ItemSpec {
        id: 1,
        item_type: "av01",
        payload: vec![1; 16],
        properties: vec![(ispe(100, 100), false), (av1C(), false)],
        ..ItemSpec::default()
    }
}

#[test]
fn pixi_strictness() {
    // Strictness::All requires pixi.
    let mut decoder = decoder_with_data(build_avif("avif", &[item_without_pixi()], 1));
    assert!(matches!(decoder.settings.strictness, Strictness::All));
    assert_avif_error!(decoder.parse(), BmffParseFailed(_));

    // Excluding the flag admits the file.
    let mut decoder = decoder_with_data(build_avif("avif", &[item_without_pixi()], 1));
    decoder.settings.strictness =
        Strictness::SpecificExclude(vec![StrictnessFlag::PixiRequired]);
    assert!(decoder.parse().is_ok());

    // A pixi that contradicts av1C is rejected.
    let mut item = item_without_pixi();
    item.properties.push((pixi(&[10, 10, 10]), false));
    let mut decoder = decoder_with_data(build_avif("avif", &[item], 1));
    assert_avif_error!(decoder.parse(), BmffParseFailed(_));

    // A matching pixi passes full strictness.
    let mut item = item_without_pixi();
    item.properties.push((pixi(&[8, 8, 8]), false));
    let mut decoder = decoder_with_data(build_avif("avif", &[item], 1));
    assert!(decoder.parse().is_ok());
}

#[test]
fn nclx_color_information() {
    let mut items = vec![ItemSpec::av01(1, 100, 100, vec![1; 16])];
    items[0].properties.push((colr_nclx(1, 13, 6, true), false));
    let mut decoder = decoder_with_data(build_avif("avif", &items, 1));
    assert!(decoder.parse().is_ok());
    let image = decoder.image();
    assert_eq!(image.color_primaries, ColorPrimaries::Bt709);
    assert_eq!(image.transfer_characteristics, TransferCharacteristics::Srgb);
    assert_eq!(image.matrix_coefficients, MatrixCoefficients::Bt601);
    assert_eq!(image.yuv_range, YuvRange::Full);

    // Two nclx boxes for one item are invalid.
    let mut items = vec![ItemSpec::av01(1, 100, 100, vec![1; 16])];
    items[0].properties.push((colr_nclx(1, 13, 6, true), false));
    items[0].properties.push((colr_nclx(9, 16, 9, false), false));
    let mut decoder = decoder_with_data(build_avif("avif", &items, 1));
    assert_avif_error!(decoder.parse(), BmffParseFailed(_));
}

#[test]
fn clap_strictness() {
    // An invalid clean aperture (zero denominators) is rejected under full
    // strictness.
    let invalid_clap = wrap_box("clap", &[0u8; 32]);
    let mut items = vec![ItemSpec::av01(1, 100, 100, vec![1; 16])];
    items[0].properties.push((invalid_clap.clone(), false));
    let mut decoder = decoder_with_data(build_avif("avif", &items, 1));
    assert_avif_error!(decoder.parse(), BmffParseFailed(_));

    // Excluding ClapValid admits the same file.
    let mut items = vec![ItemSpec::av01(1, 100, 100, vec![1; 16])];
    items[0].properties.push((invalid_clap, false));
    let mut decoder = decoder_with_data(build_avif("avif", &items, 1));
    decoder.settings.strictness = Strictness::SpecificExclude(vec![StrictnessFlag::ClapValid]);
    assert!(decoder.parse().is_ok());
    assert!(decoder.image().clap.is_some());

    // A valid clean aperture passes full strictness: 96x96 centered in
    // 100x100 with offsets 0 resolves to the even origin (2, 2).
    let mut clap_payload = Vec::new();
    for value in [96u32, 1, 96, 1, 0, 1, 0, 1] {
        clap_payload.extend_from_slice(&value.to_be_bytes());
    }
    let mut items = vec![ItemSpec::av01(1, 100, 100, vec![1; 16])];
    items[0]
        .properties
        .push((wrap_box("clap", &clap_payload), false));
    let mut decoder = decoder_with_data(build_avif("avif", &items, 1));
    assert!(decoder.parse().is_ok());
}

#[test]
fn alpha_item() {
    let mut alpha = ItemSpec::av01(2, 100, 100, vec![200; 16]);
    alpha.properties.push((auxC_alpha(), false));
    alpha.refs.push(("auxl", vec![1]));
    let items = [ItemSpec::av01(1, 100, 100, vec![42; 16]), alpha];
    let mut decoder = decoder_with_data(build_avif("avif", &items, 1));
    decoder.settings.strictness = Strictness::None;
    assert!(decoder.parse().is_ok());
    assert!(decoder.image().alpha_present);
    assert!(decoder.next_image().is_ok());
    let image = decoder.image();
    assert!(image.has_alpha());
    assert_eq!(image.row_exact(Plane::Y, 10).unwrap()[10], 42);
    assert_eq!(image.row_exact(Plane::A, 10).unwrap()[10], 200);
}

#[test]
fn alpha_no_ispe() {
    let build = || {
        let mut alpha = ItemSpec {
            id: 2,
            item_type: "av01",
            payload: vec![200; 16],
            properties: vec![
                (av1C(), false),
                (auxC_alpha(), false),
                (pixi(&[8, 8, 8]), false),
            ],
            ..ItemSpec::default()
        };
        alpha.refs.push(("auxl", vec![1]));
        build_avif(
            "avif",
            &[ItemSpec::av01(1, 100, 100, vec![42; 16]), alpha],
            1,
        )
    };
    // By default, non-strict files are refused.
    let mut decoder = decoder_with_data(build());
    decoder.settings.strictness = Strictness::SpecificInclude(vec![
        StrictnessFlag::AlphaIspeRequired,
    ]);
    assert_avif_error!(decoder.parse(), BmffParseFailed(_));
    // Allow this kind of file specifically; the alpha item adopts the color
    // item's dimensions.
    let mut decoder = decoder_with_data(build());
    decoder.settings.strictness =
        Strictness::SpecificExclude(vec![StrictnessFlag::AlphaIspeRequired]);
    assert!(decoder.parse().is_ok());
    assert!(decoder.image().alpha_present);
    assert!(decoder.next_image().is_ok());
    assert!(decoder.image().has_alpha());
}

#[test]
fn exif_and_xmp() {
    let mut exif_payload = vec![0, 0, 0, 0];
    exif_payload.extend_from_slice(b"II*\0exifdata");
    let mut exif_item = ItemSpec {
        id: 2,
        item_type: "Exif",
        payload: exif_payload,
        ..ItemSpec::default()
    };
    exif_item.refs.push(("cdsc", vec![1]));
    let mut xmp_item = ItemSpec {
        id: 3,
        item_type: "mime",
        content_type: Some("application/rdf+xml"),
        payload: b"<?xpacket?>".to_vec(),
        ..ItemSpec::default()
    };
    xmp_item.refs.push(("cdsc", vec![1]));
    let items = [
        ItemSpec::av01(1, 100, 100, vec![42; 16]),
        exif_item,
        xmp_item,
    ];
    let data = build_avif("avif", &items, 1);

    let mut decoder = decoder_with_data(data.clone());
    decoder.settings.strictness = Strictness::None;
    assert!(decoder.parse().is_ok());
    let image = decoder.image();
    assert_eq!(image.exif, b"II*\0exifdata");
    assert_eq!(image.xmp, b"<?xpacket?>");

    let mut decoder = decoder_with_data(data);
    decoder.settings.strictness = Strictness::None;
    decoder.settings.ignore_exif = true;
    decoder.settings.ignore_xmp = true;
    assert!(decoder.parse().is_ok());
    let image = decoder.image();
    assert!(image.exif.is_empty());
    assert!(image.xmp.is_empty());
}

#[test]
fn malformed_exif_is_skipped() {
    // An exif_tiff_header_offset pointing past the payload.
    let mut exif_item = ItemSpec {
        id: 2,
        item_type: "Exif",
        payload: vec![0, 0, 1, 0, b'I', b'I'],
        ..ItemSpec::default()
    };
    exif_item.refs.push(("cdsc", vec![1]));
    let items = [ItemSpec::av01(1, 100, 100, vec![42; 16]), exif_item];
    let mut decoder = decoder_with_data(build_avif("avif", &items, 1));
    decoder.settings.strictness = Strictness::None;
    // The malformed payload loses the metadata, not the image.
    assert!(decoder.parse().is_ok());
    assert!(decoder.image().exif.is_empty());
    assert!(decoder.next_image().is_ok());
}

#[test]
fn item_stored_in_idat() {
    let mut item = ItemSpec::av01(1, 100, 100, vec![42; 16]);
    item.in_idat = true;
    let mut decoder = decoder_with_data(build_avif("avif", &[item], 1));
    decoder.settings.strictness = Strictness::None;
    assert!(decoder.parse().is_ok());
    assert!(decoder.next_image().is_ok());
    assert_eq!(decoder.image().row_exact(Plane::Y, 0).unwrap()[0], 42);
}

#[test]
fn truncated_item_payload() {
    // The iloc length extends past the end of the file.
    let mut items = vec![ItemSpec::av01(1, 100, 100, vec![42; 16])];
    let mut data = build_avif("avif", &items, 1);
    data.truncate(data.len() - 8);
    let mut decoder = decoder_with_data(data);
    decoder.settings.strictness = Strictness::None;
    assert!(decoder.parse().is_ok());
    assert_avif_error!(decoder.next_image(), TruncatedData);
    // The same without any of the payload available.
    let mut data = build_avif("avif", &items, 1);
    data.truncate(data.len() - 16);
    let mut decoder = decoder_with_data(data);
    decoder.settings.strictness = Strictness::None;
    assert!(decoder.parse().is_ok());
    assert_avif_error!(decoder.next_image(), TruncatedData);
}

#[test]
fn no_codec_available() {
    let data = build_avif("avif", &[ItemSpec::av01(1, 100, 100, vec![42; 16])], 1);
    let mut decoder = decoder::Decoder::default();
    decoder.set_io_vec(data);
    decoder.settings.strictness = Strictness::None;
    assert!(decoder.parse().is_ok());
    assert_avif_error!(decoder.next_image(), NoCodecAvailable);
}

#[test]
fn codec_choice_by_name() {
    let data = build_avif("avif", &[ItemSpec::av01(1, 100, 100, vec![42; 16])], 1);
    let mut decoder = decoder_with_data(data.clone());
    decoder.settings.strictness = Strictness::None;
    decoder.settings.codec_choice = CodecChoice::ByName("mock".into());
    assert!(decoder.parse().is_ok());
    assert!(decoder.next_image().is_ok());

    let mut decoder = decoder_with_data(data);
    decoder.settings.strictness = Strictness::None;
    decoder.settings.codec_choice = CodecChoice::ByName("dav1d".into());
    assert!(decoder.parse().is_ok());
    assert_avif_error!(decoder.next_image(), NoCodecAvailable);
}

#[test]
fn raised_limits_are_not_implemented() {
    let data = build_avif("avif", &[ItemSpec::av01(1, 100, 100, vec![42; 16])], 1);
    let mut decoder = decoder_with_data(data);
    decoder.settings.image_size_limit = DEFAULT_IMAGE_SIZE_LIMIT + 1;
    assert_avif_error!(decoder.parse(), NotImplemented);
}

#[test]
fn dimension_limits() {
    let data = build_avif("avif", &[ItemSpec::av01(1, 4000, 100, vec![42; 16])], 1);
    let mut decoder = decoder_with_data(data);
    decoder.settings.strictness = Strictness::None;
    decoder.settings.image_dimension_limit = 2000;
    assert_avif_error!(decoder.parse(), BmffParseFailed(_));
}

#[test]
fn progressive_layers() {
    let mut payload = vec![0u8; 40];
    payload[0] = 1; // layer 0 starts at offset 0
    payload[10] = 2; // layer 1 starts at offset 10
    payload[30] = 3; // layer 2 starts at offset 30
    let mut items = vec![ItemSpec::av01(1, 100, 100, payload)];
    items[0].properties.push((a1lx([10, 20, 0]), false));
    let data = build_avif("avif", &items, 1);

    // Without allow_progressive the image advertises the capability only.
    let mut decoder = decoder_with_data(data.clone());
    decoder.settings.strictness = Strictness::None;
    assert!(decoder.parse().is_ok());
    assert_eq!(
        decoder.image().progressive_state,
        ProgressiveState::Available
    );
    assert_eq!(decoder.image_count, 1);

    // With allow_progressive each layer is exposed as one image.
    let mut decoder = decoder_with_data(data);
    decoder.settings.strictness = Strictness::None;
    decoder.settings.allow_progressive = true;
    assert!(decoder.parse().is_ok());
    assert_eq!(decoder.image().progressive_state, ProgressiveState::Active);
    assert_eq!(decoder.image_count, 3);
    for expected_value in 1..=3u8 {
        assert!(decoder.next_image().is_ok());
        assert_eq!(
            decoder.image().row_exact(Plane::Y, 0).unwrap()[0],
            expected_value
        );
    }
    assert_avif_error!(decoder.next_image(), NoImagesRemaining);
}

#[test]
fn decode_from_file() {
    let data = build_avif("avif", &[ItemSpec::av01(1, 100, 100, vec![42; 16])], 1);
    let mut file = tempfile::NamedTempFile::new().unwrap();
    std::io::Write::write_all(&mut file, &data).unwrap();
    let mut decoder = decoder::Decoder::default();
    decoder
        .set_io_file(file.path().to_str().unwrap())
        .expect("failed to set IO");
    decoder.set_codec_registry(mock_codec_registry());
    assert!(decoder.parse().is_ok());
    assert_eq!(decoder.image().width, 100);
    assert!(decoder.next_image().is_ok());
    assert_eq!(decoder.image().row_exact(Plane::Y, 0).unwrap()[0], 42);
}

#[test]
fn parse_can_be_called_again() {
    let data = build_avif("avif", &[ItemSpec::av01(1, 100, 100, vec![42; 16])], 1);
    let mut decoder = decoder_with_data(data);
    decoder.settings.strictness = Strictness::None;
    assert!(decoder.parse().is_ok());
    assert!(decoder.next_image().is_ok());
    // Re-parsing resets the decode position.
    assert!(decoder.parse().is_ok());
    assert_eq!(decoder.image_index, -1);
    assert!(decoder.next_image().is_ok());
}
