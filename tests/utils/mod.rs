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

// Not all helpers are used from all test targets.
#![allow(dead_code)]

use pincer_avif::codecs::CodecRegistry;
use pincer_avif::codecs::Decoder as CodecDecoder;
use pincer_avif::codecs::DecoderConfig;
use pincer_avif::decoder::Decoder;
use pincer_avif::image::Image;
use pincer_avif::*;

// ---------------------------------------------------------------------------
// Box writing

pub fn wrap_box(box_type: &str, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&u32::try_from(payload.len() + 8).unwrap().to_be_bytes());
    out.extend_from_slice(box_type.as_bytes());
    out.extend_from_slice(payload);
    out
}

pub fn wrap_full_box(box_type: &str, version: u8, flags: u32, payload: &[u8]) -> Vec<u8> {
    let mut full = vec![version];
    full.extend_from_slice(&flags.to_be_bytes()[1..]);
    full.extend_from_slice(payload);
    wrap_box(box_type, &full)
}

pub fn ftyp(major_brand: &str, compatible_brands: &[&str]) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(major_brand.as_bytes());
    payload.extend_from_slice(&0u32.to_be_bytes());
    for brand in compatible_brands {
        payload.extend_from_slice(brand.as_bytes());
    }
    wrap_box("ftyp", &payload)
}

// ---------------------------------------------------------------------------
// Property boxes

pub fn ispe(width: u32, height: u32) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&width.to_be_bytes());
    payload.extend_from_slice(&height.to_be_bytes());
    wrap_full_box("ispe", 0, 0, &payload)
}

#[allow(non_snake_case)]
pub fn av1C() -> Vec<u8> {
    // 8-bit, 420, profile 0.
    wrap_box("av1C", &[0x81, 0x04, 0x0C, 0x00])
}

#[allow(non_snake_case)]
pub fn av1C_10bit() -> Vec<u8> {
    // 10-bit, 420, profile 0.
    wrap_box("av1C", &[0x81, 0x04, 0x4C, 0x00])
}

pub fn pixi(depths: &[u8]) -> Vec<u8> {
    let mut payload = vec![depths.len() as u8];
    payload.extend_from_slice(depths);
    wrap_full_box("pixi", 0, 0, &payload)
}

#[allow(non_snake_case)]
pub fn auxC_alpha() -> Vec<u8> {
    let mut payload = b"urn:mpeg:mpegB:cicp:systems:auxiliary:alpha".to_vec();
    payload.push(0);
    wrap_full_box("auxC", 0, 0, &payload)
}

pub fn colr_nclx(primaries: u16, transfer: u16, matrix: u16, full_range: bool) -> Vec<u8> {
    let mut payload = b"nclx".to_vec();
    payload.extend_from_slice(&primaries.to_be_bytes());
    payload.extend_from_slice(&transfer.to_be_bytes());
    payload.extend_from_slice(&matrix.to_be_bytes());
    payload.push(if full_range { 0x80 } else { 0x00 });
    wrap_box("colr", &payload)
}

pub fn a1lx(layer_sizes: [u16; 3]) -> Vec<u8> {
    let mut payload = vec![0u8]; // small sizes
    for size in layer_sizes {
        payload.extend_from_slice(&size.to_be_bytes());
    }
    wrap_box("a1lx", &payload)
}

pub fn lsel(layer_id: u16) -> Vec<u8> {
    wrap_box("lsel", &layer_id.to_be_bytes())
}

pub fn unknown_property() -> Vec<u8> {
    wrap_box("zzzz", &[0xDE, 0xAD])
}

pub fn grid_payload(rows: u8, columns: u8, width: u16, height: u16) -> Vec<u8> {
    let mut payload = vec![0u8, 0u8, rows - 1, columns - 1];
    payload.extend_from_slice(&width.to_be_bytes());
    payload.extend_from_slice(&height.to_be_bytes());
    payload
}

// ---------------------------------------------------------------------------
// Whole-file building

/// One item of a synthesized AVIF file. Items must be listed in increasing id
/// order.
#[derive(Default)]
pub struct ItemSpec {
    pub id: u16,
    pub item_type: &'static str,
    pub payload: Vec<u8>,
    // (property box bytes, essential flag)
    pub properties: Vec<(Vec<u8>, bool)>,
    // Store the payload in idat instead of mdat.
    pub in_idat: bool,
    // (reference type, to item ids)
    pub refs: Vec<(&'static str, Vec<u16>)>,
    // For "mime" items.
    pub content_type: Option<&'static str>,
}

impl ItemSpec {
    pub fn av01(id: u16, width: u32, height: u32, payload: Vec<u8>) -> ItemSpec {
        ItemSpec {
            id,
            item_type: "av01",
            payload,
            properties: vec![
                (ispe(width, height), false),
                (av1C(), false),
                (pixi(&[8, 8, 8]), false),
            ],
            ..ItemSpec::default()
        }
    }
}

/// Assembles ftyp + meta + mdat. Property boxes are deduplicated by their
/// serialized bytes so items can share ipco entries. mdat is the last box so
/// that streaming tests can withhold sample bytes while keeping the metadata
/// readable.
pub fn build_avif(major_brand: &str, items: &[ItemSpec], primary_item_id: u16) -> Vec<u8> {
    let ftyp = ftyp(major_brand, &["mif1", "miaf"]);
    let mut mdat_payload = Vec::new();
    let mut idat_payload = Vec::new();
    let mut offsets = Vec::new(); // offset within the mdat payload or idat
    for item in items {
        if item.in_idat {
            offsets.push(idat_payload.len() as u32);
            idat_payload.extend_from_slice(&item.payload);
        } else {
            offsets.push(mdat_payload.len() as u32);
            mdat_payload.extend_from_slice(&item.payload);
        }
    }
    // The meta box size does not depend on the offset values (they are fixed
    // width), so build it once with placeholders to learn the mdat position
    // and then again with the real offsets.
    let placeholder = build_meta(items, primary_item_id, 0, &offsets, &idat_payload);
    let mdat_payload_start = (ftyp.len() + placeholder.len() + 8) as u32;
    let meta = build_meta(
        items,
        primary_item_id,
        mdat_payload_start,
        &offsets,
        &idat_payload,
    );
    let mut avif = ftyp;
    avif.extend_from_slice(&meta);
    avif.extend_from_slice(&wrap_box("mdat", &mdat_payload));
    avif
}

fn build_meta(
    items: &[ItemSpec],
    primary_item_id: u16,
    mdat_payload_start: u32,
    offsets: &[u32],
    idat_payload: &[u8],
) -> Vec<u8> {
    // hdlr
    let mut hdlr_payload = Vec::new();
    hdlr_payload.extend_from_slice(&0u32.to_be_bytes());
    hdlr_payload.extend_from_slice(b"pict");
    hdlr_payload.extend_from_slice(&[0u8; 12]);
    hdlr_payload.push(0); // empty name
    let hdlr = wrap_full_box("hdlr", 0, 0, &hdlr_payload);

    // pitm
    let pitm = wrap_full_box("pitm", 0, 0, &primary_item_id.to_be_bytes());

    // iloc version 1: offset_size 4, length_size 4, base_offset_size 0,
    // index_size 0.
    let mut iloc_payload = vec![0x44, 0x00];
    iloc_payload.extend_from_slice(&(items.len() as u16).to_be_bytes());
    for (index, item) in items.iter().enumerate() {
        iloc_payload.extend_from_slice(&item.id.to_be_bytes());
        // reserved(12) + construction_method(4)
        let construction_method: u16 = if item.in_idat { 1 } else { 0 };
        iloc_payload.extend_from_slice(&construction_method.to_be_bytes());
        // data_reference_index
        iloc_payload.extend_from_slice(&0u16.to_be_bytes());
        // extent_count
        iloc_payload.extend_from_slice(&1u16.to_be_bytes());
        let offset = if item.in_idat {
            offsets[index]
        } else {
            mdat_payload_start + offsets[index]
        };
        iloc_payload.extend_from_slice(&offset.to_be_bytes());
        iloc_payload.extend_from_slice(&(item.payload.len() as u32).to_be_bytes());
    }
    let iloc = wrap_full_box("iloc", 1, 0, &iloc_payload);

    // iinf
    let mut iinf_payload = Vec::new();
    iinf_payload.extend_from_slice(&(items.len() as u16).to_be_bytes());
    for item in items {
        let mut infe_payload = Vec::new();
        infe_payload.extend_from_slice(&item.id.to_be_bytes());
        infe_payload.extend_from_slice(&0u16.to_be_bytes());
        infe_payload.extend_from_slice(item.item_type.as_bytes());
        if item.item_type == "mime" {
            infe_payload.push(0); // empty item_name
            infe_payload.extend_from_slice(item.content_type.unwrap_or("").as_bytes());
            infe_payload.push(0);
        }
        iinf_payload.extend_from_slice(&wrap_full_box("infe", 2, 0, &infe_payload));
    }
    let iinf = wrap_full_box("iinf", 0, 0, &iinf_payload);

    // ipco + ipma, with property deduplication.
    let mut ipco_entries: Vec<Vec<u8>> = Vec::new();
    let mut ipma_payload = Vec::new();
    let items_with_properties: Vec<&ItemSpec> =
        items.iter().filter(|x| !x.properties.is_empty()).collect();
    ipma_payload.extend_from_slice(&(items_with_properties.len() as u32).to_be_bytes());
    for item in &items_with_properties {
        ipma_payload.extend_from_slice(&item.id.to_be_bytes());
        ipma_payload.push(item.properties.len() as u8);
        for (property, essential) in &item.properties {
            let index = match ipco_entries.iter().position(|x| x == property) {
                Some(index) => index,
                None => {
                    ipco_entries.push(property.clone());
                    ipco_entries.len() - 1
                }
            };
            // 1-based 7-bit property index with the essential bit on top.
            let mut index_byte = (index + 1) as u8;
            if *essential {
                index_byte |= 0x80;
            }
            ipma_payload.push(index_byte);
        }
    }
    let ipco = wrap_box("ipco", &ipco_entries.concat());
    let ipma = wrap_full_box("ipma", 0, 0, &ipma_payload);
    let mut iprp_payload = ipco;
    iprp_payload.extend_from_slice(&ipma);
    let iprp = wrap_box("iprp", &iprp_payload);

    // iref
    let mut iref_payload = Vec::new();
    for item in items {
        for (reference_type, to_ids) in &item.refs {
            let mut ref_payload = Vec::new();
            ref_payload.extend_from_slice(&item.id.to_be_bytes());
            ref_payload.extend_from_slice(&(to_ids.len() as u16).to_be_bytes());
            for to_id in to_ids {
                ref_payload.extend_from_slice(&to_id.to_be_bytes());
            }
            iref_payload.extend_from_slice(&wrap_box(reference_type, &ref_payload));
        }
    }

    // meta
    let mut meta_payload = hdlr;
    meta_payload.extend_from_slice(&pitm);
    meta_payload.extend_from_slice(&iloc);
    meta_payload.extend_from_slice(&iinf);
    meta_payload.extend_from_slice(&iprp);
    if !iref_payload.is_empty() {
        meta_payload.extend_from_slice(&wrap_full_box("iref", 0, 0, &iref_payload));
    }
    if !idat_payload.is_empty() {
        meta_payload.extend_from_slice(&wrap_box("idat", idat_payload));
    }
    wrap_full_box("meta", 0, 0, &meta_payload)
}

/// Parameters of one track of a synthesized avis file.
pub struct TrackSpec {
    pub id: u32,
    pub width: u32,
    pub height: u32,
    pub timescale: u32,
    pub duration: u32,
    pub sample_payloads: Vec<Vec<u8>>,
    pub sample_delta: u32,
    // 1-based sync sample numbers. Empty means "only the stss box is
    // omitted" (every sample implicitly non-sync except the first).
    pub sync_samples: Vec<u32>,
    // Some(track_id): this track is an alpha auxiliary of track_id.
    pub aux_for: Option<u32>,
}

/// Assembles ftyp + mdat + moov for an animated AVIF.
pub fn build_avis(tracks: &[TrackSpec]) -> Vec<u8> {
    let ftyp = ftyp("avis", &["avif", "mif1", "miaf"]);
    let mut mdat_payload = Vec::new();
    let mut chunk_offsets = Vec::new();
    for track in tracks {
        chunk_offsets.push((ftyp.len() + 8 + mdat_payload.len()) as u32);
        for payload in &track.sample_payloads {
            mdat_payload.extend_from_slice(payload);
        }
    }
    let mdat = wrap_box("mdat", &mdat_payload);

    let mut moov_payload = Vec::new();
    for (track_index, track) in tracks.iter().enumerate() {
        // tkhd
        let mut tkhd_payload = Vec::new();
        tkhd_payload.extend_from_slice(&0u32.to_be_bytes()); // creation_time
        tkhd_payload.extend_from_slice(&0u32.to_be_bytes()); // modification_time
        tkhd_payload.extend_from_slice(&track.id.to_be_bytes());
        tkhd_payload.extend_from_slice(&0u32.to_be_bytes()); // reserved
        tkhd_payload.extend_from_slice(&track.duration.to_be_bytes());
        tkhd_payload.extend_from_slice(&[0u8; 52]);
        tkhd_payload.extend_from_slice(&(track.width << 16).to_be_bytes());
        tkhd_payload.extend_from_slice(&(track.height << 16).to_be_bytes());
        let tkhd = wrap_full_box("tkhd", 0, 0, &tkhd_payload);

        // mdhd
        let mut mdhd_payload = Vec::new();
        mdhd_payload.extend_from_slice(&0u32.to_be_bytes()); // creation_time
        mdhd_payload.extend_from_slice(&0u32.to_be_bytes()); // modification_time
        mdhd_payload.extend_from_slice(&track.timescale.to_be_bytes());
        mdhd_payload.extend_from_slice(&track.duration.to_be_bytes());
        mdhd_payload.extend_from_slice(&[0u8; 4]);
        let mdhd = wrap_full_box("mdhd", 0, 0, &mdhd_payload);

        // stsd with an av01 sample entry carrying av1C.
        let mut av01_payload = vec![0u8; 78];
        av01_payload.extend_from_slice(&av1C());
        let mut stsd_payload = 1u32.to_be_bytes().to_vec();
        stsd_payload.extend_from_slice(&wrap_box("av01", &av01_payload));
        let stsd = wrap_full_box("stsd", 0, 0, &stsd_payload);

        // stts
        let mut stts_payload = 1u32.to_be_bytes().to_vec();
        stts_payload.extend_from_slice(&(track.sample_payloads.len() as u32).to_be_bytes());
        stts_payload.extend_from_slice(&track.sample_delta.to_be_bytes());
        let stts = wrap_full_box("stts", 0, 0, &stts_payload);

        // stsc: one chunk holding all samples.
        let mut stsc_payload = 1u32.to_be_bytes().to_vec();
        stsc_payload.extend_from_slice(&1u32.to_be_bytes());
        stsc_payload.extend_from_slice(&(track.sample_payloads.len() as u32).to_be_bytes());
        stsc_payload.extend_from_slice(&1u32.to_be_bytes());
        let stsc = wrap_full_box("stsc", 0, 0, &stsc_payload);

        // stsz
        let mut stsz_payload = 0u32.to_be_bytes().to_vec();
        stsz_payload.extend_from_slice(&(track.sample_payloads.len() as u32).to_be_bytes());
        for payload in &track.sample_payloads {
            stsz_payload.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        }
        let stsz = wrap_full_box("stsz", 0, 0, &stsz_payload);

        // stco
        let mut stco_payload = 1u32.to_be_bytes().to_vec();
        stco_payload.extend_from_slice(&chunk_offsets[track_index].to_be_bytes());
        let stco = wrap_full_box("stco", 0, 0, &stco_payload);

        let mut stbl_payload = stsd;
        stbl_payload.extend_from_slice(&stts);
        stbl_payload.extend_from_slice(&stsc);
        stbl_payload.extend_from_slice(&stsz);
        stbl_payload.extend_from_slice(&stco);
        if !track.sync_samples.is_empty() {
            let mut stss_payload = (track.sync_samples.len() as u32).to_be_bytes().to_vec();
            for sync_sample in &track.sync_samples {
                stss_payload.extend_from_slice(&sync_sample.to_be_bytes());
            }
            stbl_payload.extend_from_slice(&wrap_full_box("stss", 0, 0, &stss_payload));
        }
        let stbl = wrap_box("stbl", &stbl_payload);
        let minf = wrap_box("minf", &stbl);
        let mut mdia_payload = mdhd;
        mdia_payload.extend_from_slice(&minf);
        let mdia = wrap_box("mdia", &mdia_payload);

        let mut trak_payload = tkhd;
        if let Some(aux_for) = track.aux_for {
            let auxl = wrap_box("auxl", &aux_for.to_be_bytes());
            trak_payload.extend_from_slice(&wrap_box("tref", &auxl));
        }
        trak_payload.extend_from_slice(&mdia);
        moov_payload.extend_from_slice(&wrap_box("trak", &trak_payload));
    }
    let moov = wrap_box("moov", &moov_payload);

    let mut avis = ftyp;
    avis.extend_from_slice(&mdat);
    avis.extend_from_slice(&moov);
    avis
}

// ---------------------------------------------------------------------------
// Mock codec

/// A codec standing in for a real AV1 decoder: it emits an image of the
/// configured size whose planes are filled with the first payload byte, so
/// tests can verify which sample ended up where.
#[derive(Default)]
pub struct MockCodec {
    config: Option<DecoderConfig>,
}

impl CodecDecoder for MockCodec {
    fn initialize(&mut self, config: &DecoderConfig) -> AvifResult<()> {
        self.config = Some(config.clone());
        Ok(())
    }

    fn get_next_image(
        &mut self,
        av1_payload: &[u8],
        _spatial_id: u8,
        image: &mut Image,
        category: Category,
    ) -> AvifResult<()> {
        let config = self.config.as_ref().unwrap();
        if av1_payload.is_empty() {
            return Err(AvifError::UnknownError("empty payload".into()));
        }
        image.width = config.width;
        image.height = config.height;
        image.depth = config.depth;
        image.yuv_format = config.codec_config.pixel_format();
        image.yuv_range = YuvRange::Limited;
        image.allocate_planes(category)?;
        let value = av1_payload[0];
        for plane in category.planes() {
            let plane = *plane;
            if !image.has_plane(plane) {
                continue;
            }
            let plane_data = image.plane_data(plane).unwrap();
            for y in 0..plane_data.height {
                if config.depth == 8 {
                    image.row_exact_mut(plane, y)?.fill(value);
                } else {
                    image.row16_exact_mut(plane, y)?.fill(value as u16);
                }
            }
        }
        Ok(())
    }
}

pub fn mock_codec_registry() -> CodecRegistry {
    let mut registry = CodecRegistry::default();
    registry.register("mock", || Box::<MockCodec>::default());
    registry
}

pub fn decoder_with_data(data: Vec<u8>) -> Decoder {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut decoder = Decoder::default();
    decoder.set_io_vec(data);
    decoder.set_codec_registry(mock_codec_registry());
    decoder
}
