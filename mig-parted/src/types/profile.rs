use std::fmt;
use std::str::FromStr;

use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use snafu::{ensure, OptionExt};

use crate::nvml;

/// The `me` attribute marks a profile with media extensions (an extra
/// decoder/encoder allotment on boards that offer it).
pub const ATTRIBUTE_MEDIA_EXTENSIONS: &str = "me";

/// A canonical MIG profile name of the form `Gg.GBgb`, `Cc.Gg.GBgb`, or
/// either followed by `+attr[,attr...]`. Examples: `1g.5gb`, `1c.2g.10gb`,
/// `1g.6gb+me`.
///
/// Two profiles are equal iff their normalized forms are identical, so the
/// derived equality below relies on the constructors keeping `attrs` sorted.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MigProfile {
    c: u32,
    g: u32,
    gb: u32,
    attrs: Vec<String>,
}

impl MigProfile {
    /// Build a profile from slice counts and a raw memory size in MB.
    /// Memory is normalized to GiB by rounding up.
    pub fn new<A, S>(c: u32, g: u32, mem_mb: u64, attrs: A) -> Result<Self>
    where
        A: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut attrs: Vec<String> = attrs.into_iter().map(Into::into).collect();
        for attr in &attrs {
            ensure!(valid_attribute(attr), error::InvalidAttributeSnafu { attr });
        }
        attrs.sort();
        attrs.dedup();

        Ok(Self {
            c,
            g,
            gb: mem_mb.div_ceil(1024) as u32,
            attrs,
        })
    }

    /// Reconstruct a profile from the ids NVML reports for an existing
    /// GPU-Instance/Compute-Instance pair.
    pub fn from_ids(gi_profile_id: u32, ci_profile_id: u32, mem_mb: u64) -> Result<Self> {
        let (g, me) = match gi_profile_id {
            nvml::GPU_INSTANCE_PROFILE_1_SLICE => (1, false),
            nvml::GPU_INSTANCE_PROFILE_2_SLICE => (2, false),
            nvml::GPU_INSTANCE_PROFILE_3_SLICE => (3, false),
            nvml::GPU_INSTANCE_PROFILE_4_SLICE => (4, false),
            nvml::GPU_INSTANCE_PROFILE_6_SLICE => (6, false),
            nvml::GPU_INSTANCE_PROFILE_7_SLICE => (7, false),
            nvml::GPU_INSTANCE_PROFILE_8_SLICE => (8, false),
            nvml::GPU_INSTANCE_PROFILE_1_SLICE_REV1 => (1, true),
            nvml::GPU_INSTANCE_PROFILE_2_SLICE_REV1 => (2, true),
            id => return error::UnknownGiProfileSnafu { id }.fail(),
        };
        let c = match ci_profile_id {
            nvml::COMPUTE_INSTANCE_PROFILE_1_SLICE => 1,
            nvml::COMPUTE_INSTANCE_PROFILE_2_SLICE => 2,
            nvml::COMPUTE_INSTANCE_PROFILE_3_SLICE => 3,
            nvml::COMPUTE_INSTANCE_PROFILE_4_SLICE => 4,
            nvml::COMPUTE_INSTANCE_PROFILE_6_SLICE => 6,
            nvml::COMPUTE_INSTANCE_PROFILE_7_SLICE => 7,
            nvml::COMPUTE_INSTANCE_PROFILE_8_SLICE => 8,
            nvml::COMPUTE_INSTANCE_PROFILE_1_SLICE_REV1 => 1,
            id => return error::UnknownCiProfileSnafu { id }.fail(),
        };

        let attrs = if me {
            vec![ATTRIBUTE_MEDIA_EXTENSIONS.to_string()]
        } else {
            Vec::new()
        };
        Self::new(c, g, mem_mb, attrs)
    }

    pub fn g(&self) -> u32 {
        self.g
    }

    pub fn c(&self) -> u32 {
        self.c
    }

    pub fn gb(&self) -> u32 {
        self.gb
    }

    pub fn attributes(&self) -> &[String] {
        &self.attrs
    }

    pub fn has_attribute(&self, attr: &str) -> bool {
        self.attrs.iter().any(|a| a == attr)
    }

    /// Map the profile onto NVML's `(gi, ci, ci-engine)` profile id triple.
    pub fn profile_ids(&self) -> Result<(u32, u32, u32)> {
        let mut gi = match self.g {
            1 => nvml::GPU_INSTANCE_PROFILE_1_SLICE,
            2 => nvml::GPU_INSTANCE_PROFILE_2_SLICE,
            3 => nvml::GPU_INSTANCE_PROFILE_3_SLICE,
            4 => nvml::GPU_INSTANCE_PROFILE_4_SLICE,
            7 => nvml::GPU_INSTANCE_PROFILE_7_SLICE,
            8 => nvml::GPU_INSTANCE_PROFILE_8_SLICE,
            _ => {
                return error::InvalidProfileSnafu {
                    profile: self.to_string(),
                    reason: format!("unsupported GPU slice count {}", self.g),
                }
                .fail()
            }
        };
        let ci = match self.c {
            1 => nvml::COMPUTE_INSTANCE_PROFILE_1_SLICE,
            2 => nvml::COMPUTE_INSTANCE_PROFILE_2_SLICE,
            3 => nvml::COMPUTE_INSTANCE_PROFILE_3_SLICE,
            4 => nvml::COMPUTE_INSTANCE_PROFILE_4_SLICE,
            7 => nvml::COMPUTE_INSTANCE_PROFILE_7_SLICE,
            8 => nvml::COMPUTE_INSTANCE_PROFILE_8_SLICE,
            _ => {
                return error::InvalidProfileSnafu {
                    profile: self.to_string(),
                    reason: format!("unsupported compute slice count {}", self.c),
                }
                .fail()
            }
        };

        for attr in &self.attrs {
            match attr.as_str() {
                ATTRIBUTE_MEDIA_EXTENSIONS => {
                    gi = match gi {
                        nvml::GPU_INSTANCE_PROFILE_1_SLICE => {
                            nvml::GPU_INSTANCE_PROFILE_1_SLICE_REV1
                        }
                        nvml::GPU_INSTANCE_PROFILE_2_SLICE => {
                            nvml::GPU_INSTANCE_PROFILE_2_SLICE_REV1
                        }
                        _ => {
                            return error::InvalidProfileSnafu {
                                profile: self.to_string(),
                                reason: format!(
                                    "attribute '{}' not supported on {}-slice profiles",
                                    attr, self.g
                                ),
                            }
                            .fail()
                        }
                    };
                }
                _ => {
                    return error::InvalidProfileSnafu {
                        profile: self.to_string(),
                        reason: format!("unknown attribute '{}'", attr),
                    }
                    .fail()
                }
            }
        }

        Ok((gi, ci, nvml::COMPUTE_INSTANCE_ENGINE_PROFILE_SHARED))
    }
}

// The canonical flatten order: descending G, then descending C, then
// ascending memory, then attribute order.
impl Ord for MigProfile {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .g
            .cmp(&self.g)
            .then(other.c.cmp(&self.c))
            .then(self.gb.cmp(&other.gb))
            .then(self.attrs.cmp(&other.attrs))
    }
}

impl PartialOrd for MigProfile {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for MigProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.c == self.g {
            write!(f, "{}g.{}gb", self.g, self.gb)?;
        } else {
            write!(f, "{}c.{}g.{}gb", self.c, self.g, self.gb)?;
        }
        if !self.attrs.is_empty() {
            write!(f, "+{}", self.attrs.join(","))?;
        }
        Ok(())
    }
}

impl FromStr for MigProfile {
    type Err = error::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (base, attrs) = match s.split_once('+') {
            Some((base, attrs)) => (base, attrs.split(',').collect()),
            None => (s, Vec::new()),
        };

        for attr in &attrs {
            ensure!(valid_attribute(attr), error::InvalidAttributeSnafu { attr: *attr });
        }

        let fields: Vec<&str> = base.split('.').collect();
        let (c_field, g_field, gb_field) = match fields.as_slice() {
            [g, gb] => (None, *g, *gb),
            [c, g, gb] => (Some(*c), *g, *gb),
            _ => {
                return error::InvalidProfileSnafu {
                    profile: s,
                    reason: "expected 'Gg.GBgb' or 'Cc.Gg.GBgb'",
                }
                .fail()
            }
        };

        let g = parse_field(s, g_field, "g")?;
        let gb = parse_field(s, gb_field, "gb")?;
        let c = match c_field {
            Some(c) => parse_field(s, c, "c")?,
            None => g,
        };

        let mut attrs: Vec<String> = attrs.into_iter().map(str::to_string).collect();
        attrs.sort();
        attrs.dedup();

        Ok(Self { c, g, gb, attrs })
    }
}

fn parse_field(profile: &str, field: &str, suffix: &str) -> Result<u32> {
    let digits = field
        .strip_suffix(suffix)
        .with_context(|| error::InvalidProfileSnafu {
            profile,
            reason: format!("field '{}' missing '{}' suffix", field, suffix),
        })?;
    digits
        .parse()
        .ok()
        .with_context(|| error::InvalidProfileSnafu {
            profile,
            reason: format!("field '{}' is not a number", field),
        })
}

fn valid_attribute(attr: &str) -> bool {
    let mut chars = attr.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() => chars.all(|c| c.is_ascii_alphanumeric()),
        _ => false,
    }
}

impl Serialize for MigProfile {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for MigProfile {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

type Result<T, E = error::Error> = std::result::Result<T, E>;

mod error {
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(super)))]
    pub enum Error {
        #[snafu(display("Invalid profile '{}': {}", profile, reason))]
        InvalidProfile { profile: String, reason: String },

        #[snafu(display("Invalid profile attribute '{}'", attr))]
        InvalidAttribute { attr: String },

        #[snafu(display("Unknown GPU instance profile id {:#x}", id))]
        UnknownGiProfile { id: u32 },

        #[snafu(display("Unknown compute instance profile id {:#x}", id))]
        UnknownCiProfile { id: u32 },
    }
}

pub use error::Error;

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=
