//! Compression options and the predefined variant profiles.
//!
//! A [`CompressionOptions`] describes *what* one variant must look like: byte
//! budget, target edge, quality, and whether it is forced lossy or cropped to
//! a square. A profile is an ordered list of options; the two stock profiles
//! are [`ProfileKind::Normal`] (regular images) and [`ProfileKind::SelfProfile`]
//! (profile pictures).
//!
//! | Tag | Bytes | Edge | Quality | Lossy | Square |
//! |---|---|---|---|---|---|
//! | `preview` | 1 KiB | 64 | 30 | yes | no |
//! | `medium` | 310 KiB | 1448 | 75 | no | no |
//! | `smallProfile` | 15 KiB | 280 | 75 | yes | yes |

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::types::ImageMime;

pub const TAG_PREVIEW: &str = "preview";
pub const TAG_MEDIUM: &str = "medium";
pub const TAG_SMALL_PROFILE: &str = "smallProfile";

/// Ratio between the pixel budget of a variant and its nominal `dimension²`.
pub const PIXEL_COUNT_SLACK: f64 = 1.3;

/// Quality setting for lossy image encoding (0-100).
///
/// Values above 100 are clamped. Codecs whose lowest setting is 1 treat 0
/// as 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "u32", into = "u32")]
pub struct Quality(u32);

impl Quality {
    pub fn new(value: u32) -> Self {
        Self(value.min(100))
    }

    pub fn value(self) -> u32 {
        self.0
    }
}

impl Default for Quality {
    fn default() -> Self {
        Self(75)
    }
}

impl From<u32> for Quality {
    fn from(value: u32) -> Self {
        Self::new(value)
    }
}

impl From<Quality> for u32 {
    fn from(quality: Quality) -> Self {
        quality.0
    }
}

/// Constraints for one derived variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CompressionOptions {
    /// Maximum encoded size before the variant is recoded.
    pub byte_count: u64,
    /// Target edge: max edge for plain variants, side length for square ones.
    pub dimension: u32,
    pub quality: Quality,
    #[serde(default)]
    pub force_lossy: bool,
    #[serde(default)]
    pub crop_to_square: bool,
    pub tag: String,
    /// Source formats that are always recoded, whatever their size.
    #[serde(default = "default_recode_mimes")]
    pub recode_mimes: BTreeSet<ImageMime>,
}

fn default_recode_mimes() -> BTreeSet<ImageMime> {
    [ImageMime::Bmp, ImageMime::Tiff, ImageMime::WebP]
        .into_iter()
        .collect()
}

impl CompressionOptions {
    /// Pixel budget derived from `dimension`; never stored separately.
    pub fn max_pixel_count(&self) -> f64 {
        let d = self.dimension as f64;
        PIXEL_COUNT_SLACK * d * d
    }

    pub fn preview() -> Self {
        Self {
            byte_count: 1024,
            dimension: 64,
            quality: Quality::new(30),
            force_lossy: true,
            crop_to_square: false,
            tag: TAG_PREVIEW.to_string(),
            recode_mimes: default_recode_mimes(),
        }
    }

    pub fn medium() -> Self {
        Self {
            byte_count: 310 * 1024,
            dimension: 1448,
            quality: Quality::new(75),
            force_lossy: false,
            crop_to_square: false,
            tag: TAG_MEDIUM.to_string(),
            recode_mimes: default_recode_mimes(),
        }
    }

    pub fn small_profile() -> Self {
        Self {
            byte_count: 15 * 1024,
            dimension: 280,
            quality: Quality::new(75),
            force_lossy: true,
            crop_to_square: true,
            tag: TAG_SMALL_PROFILE.to_string(),
            recode_mimes: default_recode_mimes(),
        }
    }
}

/// Which predefined list of variants to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileKind {
    /// Regular images: preview + medium.
    Normal,
    /// The user's own profile picture: square small profile + medium.
    SelfProfile,
}

impl ProfileKind {
    pub fn from_self_flag(is_self_profile: bool) -> Self {
        if is_self_profile {
            Self::SelfProfile
        } else {
            Self::Normal
        }
    }

    /// Stock options list, in declaration order.
    pub fn default_options(self) -> Vec<CompressionOptions> {
        match self {
            Self::Normal => vec![CompressionOptions::preview(), CompressionOptions::medium()],
            Self::SelfProfile => vec![
                CompressionOptions::small_profile(),
                CompressionOptions::medium(),
            ],
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::SelfProfile => "self_profile",
        }
    }
}

/// The options lists actually used for each profile kind.
///
/// Defaults to the stock lists; `[profiles]` in `config.toml` can replace
/// either one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProfileSet {
    pub normal: Vec<CompressionOptions>,
    pub self_profile: Vec<CompressionOptions>,
}

impl Default for ProfileSet {
    fn default() -> Self {
        Self {
            normal: ProfileKind::Normal.default_options(),
            self_profile: ProfileKind::SelfProfile.default_options(),
        }
    }
}

impl ProfileSet {
    pub fn options_for(&self, kind: ProfileKind) -> &[CompressionOptions] {
        match kind {
            ProfileKind::Normal => &self.normal,
            ProfileKind::SelfProfile => &self.self_profile,
        }
    }

    /// Every list must be non-empty, with unique non-empty tags and a
    /// non-zero dimension.
    pub fn validate(&self) -> Result<(), String> {
        for kind in [ProfileKind::Normal, ProfileKind::SelfProfile] {
            let options = self.options_for(kind);
            if options.is_empty() {
                return Err(format!("profiles.{} must not be empty", kind.as_str()));
            }
            let mut seen = BTreeSet::new();
            for opts in options {
                if opts.tag.is_empty() {
                    return Err(format!("profiles.{}: empty tag", kind.as_str()));
                }
                if !seen.insert(opts.tag.as_str()) {
                    return Err(format!(
                        "profiles.{}: duplicate tag '{}'",
                        kind.as_str(),
                        opts.tag
                    ));
                }
                if opts.dimension == 0 {
                    return Err(format!(
                        "profiles.{}.{}: dimension must be > 0",
                        kind.as_str(),
                        opts.tag
                    ));
                }
            }
        }
        Ok(())
    }
}
