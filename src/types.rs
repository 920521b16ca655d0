//! Shared types passed between the sizing policy, the encoder and the pipeline.
//!
//! [`SourceMetadata`] is computed once per request and shared read-only;
//! [`VariantResult`] and [`AssetVariantSet`] are built per request and never
//! mutated after construction. The result types serialize to JSON so the CLI
//! can write them straight into its manifest.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::store::StorageHandle;

/// Image formats the pipeline knows how to reason about.
///
/// GIF is the animated-image format: it is exempt from the per-variant byte
/// budget and only bounded by the global animated ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ImageMime {
    #[serde(rename = "image/jpeg")]
    Jpeg,
    #[serde(rename = "image/png")]
    Png,
    #[serde(rename = "image/gif")]
    Gif,
    #[serde(rename = "image/webp")]
    WebP,
    #[serde(rename = "image/bmp")]
    Bmp,
    #[serde(rename = "image/tiff")]
    Tiff,
}

impl ImageMime {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
            Self::Gif => "image/gif",
            Self::WebP => "image/webp",
            Self::Bmp => "image/bmp",
            Self::Tiff => "image/tiff",
        }
    }

    pub fn is_animated_format(self) -> bool {
        self == Self::Gif
    }

    /// File extension used by the directory-backed store.
    pub fn extension(self) -> &'static str {
        match self {
            Self::Jpeg => "jpg",
            Self::Png => "png",
            Self::Gif => "gif",
            Self::WebP => "webp",
            Self::Bmp => "bmp",
            Self::Tiff => "tif",
        }
    }
}

impl fmt::Display for ImageMime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// EXIF orientation tag values (1–8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Orientation {
    #[default]
    Normal,
    FlipHorizontal,
    Rotate180,
    FlipVertical,
    Transpose,
    Rotate90,
    Transverse,
    Rotate270,
}

impl Orientation {
    /// Map a raw EXIF orientation value. Out-of-range values mean "no transform".
    pub fn from_exif(value: u16) -> Self {
        match value {
            2 => Self::FlipHorizontal,
            3 => Self::Rotate180,
            4 => Self::FlipVertical,
            5 => Self::Transpose,
            6 => Self::Rotate90,
            7 => Self::Transverse,
            8 => Self::Rotate270,
            _ => Self::Normal,
        }
    }

    pub fn to_exif(self) -> u16 {
        match self {
            Self::Normal => 1,
            Self::FlipHorizontal => 2,
            Self::Rotate180 => 3,
            Self::FlipVertical => 4,
            Self::Transpose => 5,
            Self::Rotate90 => 6,
            Self::Transverse => 7,
            Self::Rotate270 => 8,
        }
    }

    /// True when applying the orientation swaps width and height.
    pub fn swaps_axes(self) -> bool {
        matches!(
            self,
            Self::Transpose | Self::Rotate90 | Self::Transverse | Self::Rotate270
        )
    }
}

/// Header-level facts about a source image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceMetadata {
    /// Stored (pre-orientation) width.
    pub width: u32,
    /// Stored (pre-orientation) height.
    pub height: u32,
    pub mime: ImageMime,
    #[serde(default)]
    pub orientation: Orientation,
}

impl SourceMetadata {
    pub fn new(width: u32, height: u32, mime: ImageMime) -> Self {
        Self {
            width,
            height,
            mime,
            orientation: Orientation::Normal,
        }
    }

    pub fn with_orientation(self, orientation: Orientation) -> Self {
        Self {
            orientation,
            ..self
        }
    }

    /// True when the orientation tag rotates the image by 90 or 270 degrees.
    pub fn is_rotated(&self) -> bool {
        self.orientation.swaps_axes()
    }

    /// True when consumers would need to read the orientation tag to display
    /// the image correctly.
    pub fn has_orientation_transform(&self) -> bool {
        self.orientation != Orientation::Normal
    }

    /// Dimensions as displayed, i.e. after the orientation is applied.
    pub fn display_dimensions(&self) -> (u32, u32) {
        if self.is_rotated() {
            (self.height, self.width)
        } else {
            (self.width, self.height)
        }
    }
}

/// Identifier of the asset a profile is generated for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AssetId(pub String);

impl AssetId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One derived rendition of a source image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantResult {
    pub tag: String,
    pub mime: ImageMime,
    pub width: u32,
    pub height: u32,
    /// Largest width seen so far across the profile, this variant included.
    pub original_width: u32,
    /// Largest height seen so far across the profile, this variant included.
    pub original_height: u32,
    pub byte_length: u64,
    /// Where the encoded bytes live. `None` when the payload is inlined.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageHandle>,
    /// Base64 of the encoded bytes, for payloads under the inline threshold.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<String>,
}

impl VariantResult {
    pub fn is_inline(&self) -> bool {
        self.inline_data.is_some()
    }
}

/// All variants generated for one source image, sorted by tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetVariantSet {
    pub asset_id: AssetId,
    pub namespace_id: String,
    pub variants: Vec<VariantResult>,
}

impl AssetVariantSet {
    pub fn variant(&self, tag: &str) -> Option<&VariantResult> {
        self.variants.iter().find(|v| v.tag == tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orientation_exif_mapping() {
        for value in 1..=8 {
            assert_eq!(Orientation::from_exif(value).to_exif(), value);
        }
        assert_eq!(Orientation::from_exif(0), Orientation::Normal);
        assert_eq!(Orientation::from_exif(42), Orientation::Normal);
    }

    #[test]
    fn rotated_metadata_swaps_display_dimensions() {
        let meta = SourceMetadata::new(4000, 3000, ImageMime::Jpeg)
            .with_orientation(Orientation::Rotate90);
        assert!(meta.is_rotated());
        assert!(meta.has_orientation_transform());
        assert_eq!(meta.display_dimensions(), (3000, 4000));
    }

    #[test]
    fn flipped_metadata_keeps_dimensions_but_has_transform() {
        let meta = SourceMetadata::new(4000, 3000, ImageMime::Jpeg)
            .with_orientation(Orientation::FlipHorizontal);
        assert!(!meta.is_rotated());
        assert!(meta.has_orientation_transform());
        assert_eq!(meta.display_dimensions(), (4000, 3000));
    }

    #[test]
    fn mime_serializes_as_media_type() {
        let json = serde_json::to_string(&ImageMime::Png).unwrap();
        assert_eq!(json, "\"image/png\"");
        let back: ImageMime = serde_json::from_str("\"image/gif\"").unwrap();
        assert_eq!(back, ImageMime::Gif);
        assert!(back.is_animated_format());
    }

    #[test]
    fn variant_set_lookup_by_tag() {
        let set = AssetVariantSet {
            asset_id: AssetId::new("a1"),
            namespace_id: "conv".into(),
            variants: vec![VariantResult {
                tag: "medium".into(),
                mime: ImageMime::Jpeg,
                width: 10,
                height: 10,
                original_width: 10,
                original_height: 10,
                byte_length: 5,
                storage: None,
                inline_data: Some("AAAA".into()),
            }],
        };
        assert!(set.variant("medium").unwrap().is_inline());
        assert!(set.variant("preview").is_none());
    }
}
