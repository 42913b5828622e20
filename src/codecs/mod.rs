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

use crate::image::Image;
use crate::parser::mp4box::CodecConfiguration;
use crate::AvifError;
use crate::AvifResult;
use crate::Category;

/// Configuration handed to a codec instance before its first decode call.
/// `operating_point` and `all_layers` cannot change for the lifetime of the
/// instance.
#[derive(Clone, Default)]
pub struct DecoderConfig {
    pub operating_point: u8,
    pub all_layers: bool,
    pub width: u32,
    pub height: u32,
    pub depth: u8,
    pub max_threads: u32,
    pub image_size_limit: u32,
    pub max_input_size: usize,
    pub codec_config: CodecConfiguration,
    pub category: Category,
}

/// The pull-based interface to an external AV1 decoder. One instance decodes
/// one tile's sample stream (or several, when the decoder state machine can
/// share an instance).
pub trait Decoder {
    fn initialize(&mut self, config: &DecoderConfig) -> AvifResult<()>;
    /// Decodes a single frame from `av1_payload` and writes the output into
    /// `image`. `spatial_id` selects a layer, 0xFF meaning "do not filter by
    /// spatial id".
    fn get_next_image(
        &mut self,
        av1_payload: &[u8],
        spatial_id: u8,
        image: &mut Image,
        category: Category,
    ) -> AvifResult<()>;
    // Destruction must be implemented using Drop.
}

pub type Codec = Box<dyn Decoder>;
type CodecFactory = Box<dyn Fn() -> Codec>;

/// The set of codecs available to a decoder, injected at configuration time.
/// The container core itself ships no AV1 implementation; callers register
/// one (or more) and may select between them by name.
#[derive(Default)]
pub struct CodecRegistry {
    entries: Vec<(String, CodecFactory)>,
}

impl CodecRegistry {
    pub fn register(&mut self, name: &str, factory: impl Fn() -> Codec + 'static) {
        self.entries.push((name.into(), Box::new(factory)));
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|(name, _)| name.as_str()).collect()
    }

    /// Creates a codec instance. `name` of `None` selects the first
    /// registered codec.
    pub fn create(&self, name: Option<&str>) -> AvifResult<Codec> {
        let entry = match name {
            None => self.entries.first(),
            Some(name) => self.entries.iter().find(|(n, _)| n == name),
        };
        match entry {
            Some((_, factory)) => Ok(factory()),
            None => Err(AvifError::NoCodecAvailable),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct FakeCodec;

    impl Decoder for FakeCodec {
        fn initialize(&mut self, _config: &DecoderConfig) -> AvifResult<()> {
            Ok(())
        }
        fn get_next_image(
            &mut self,
            _av1_payload: &[u8],
            _spatial_id: u8,
            _image: &mut Image,
            _category: Category,
        ) -> AvifResult<()> {
            Ok(())
        }
    }

    #[test]
    fn registry_selects_by_name() {
        let mut registry = CodecRegistry::default();
        assert!(matches!(
            registry.create(None),
            Err(AvifError::NoCodecAvailable)
        ));
        registry.register("fake", || Box::<FakeCodec>::default());
        assert!(registry.create(None).is_ok());
        assert!(registry.create(Some("fake")).is_ok());
        assert!(matches!(
            registry.create(Some("other")),
            Err(AvifError::NoCodecAvailable)
        ));
        assert_eq!(registry.names(), vec!["fake"]);
    }
}
