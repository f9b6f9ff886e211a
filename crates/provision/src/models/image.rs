//! Boot images.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// What an image is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageKind {
    /// Discovery microkernel.
    Microkernel,
    /// Installable or in-memory operating system.
    Os,
    /// VMware ESXi installer.
    Esxi,
}

impl fmt::Display for ImageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            Self::Microkernel => "microkernel",
            Self::Os => "os",
            Self::Esxi => "esxi",
        })
    }
}

impl FromStr for ImageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mk" | "microkernel" => Ok(Self::Microkernel),
            "os" => Ok(Self::Os),
            "esxi" => Ok(Self::Esxi),
            _ => Err(format!("Unknown image kind: {s}. Supported: microkernel, os, esxi")),
        }
    }
}

/// An unpacked, bootable image. Unpacking happens elsewhere; the engine
/// only needs the boot paths and whether the image verified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    /// Identifier.
    pub uuid: String,
    /// Image kind.
    pub kind: ImageKind,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Version string, e.g. `v0.9.3.0+48-g104a9bc`.
    #[serde(default)]
    pub os_version: String,
    /// Kernel path relative to the image root.
    pub kernel: String,
    /// Initrd path relative to the image root.
    pub initrd: String,
    /// Whether the unpacked image passed verification.
    #[serde(default)]
    pub verified: bool,
    /// Store version.
    #[serde(default)]
    pub version: u64,
}

/// Orderable weight of a version string. Larger means later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct VersionWeight {
    parts: [u16; 4],
    commits: u16,
}

const PART_CAP: u16 = 999;

impl Image {
    /// A new image.
    #[must_use]
    pub fn new(
        kind: ImageKind,
        os_version: impl Into<String>,
        kernel: impl Into<String>,
        initrd: impl Into<String>,
    ) -> Self {
        Self {
            uuid: uuid::Uuid::new_v4().simple().to_string().to_uppercase(),
            kind,
            name: String::new(),
            os_version: os_version.into(),
            kernel: kernel.into(),
            initrd: initrd.into(),
            verified: true,
            version: 0,
        }
    }

    /// Weight of this image's version.
    #[must_use]
    pub fn version_weight(&self) -> VersionWeight {
        version_weight(&self.os_version)
    }

    /// Whether this image can serve as the default microkernel.
    #[must_use]
    pub fn is_usable_microkernel(&self) -> bool {
        self.kind == ImageKind::Microkernel && self.verified
    }
}

/// Weight a version string.
///
/// Accepts `0.10.0`, `v0.9.3.0`, `0.10.0+4-g104a9bc` and the older
/// `v0.9.3.0_48` form. Up to four dotted parts count, each capped at 999;
/// a missing fourth part is zero. The commit count after `+` or `_`
/// breaks ties. Unparsable parts weigh zero.
#[must_use]
pub fn version_weight(version: &str) -> VersionWeight {
    let trimmed = version.trim();
    let trimmed = trimmed.strip_prefix('v').unwrap_or(trimmed);
    let without_hash = trimmed.split('-').next().unwrap_or_default();
    let mut split = without_hash.splitn(2, ['+', '_']);
    let numbers = split.next().unwrap_or_default();
    let commits = split.next().map_or(0, parse_part);

    let mut parts = [0u16; 4];
    for (slot, part) in parts.iter_mut().zip(numbers.split('.')) {
        *slot = parse_part(part);
    }
    VersionWeight { parts, commits }
}

fn parse_part(part: &str) -> u16 {
    part.trim()
        .parse::<u32>()
        .map_or(0, |n| u16::try_from(n.min(u32::from(PART_CAP))).unwrap_or(PART_CAP))
}
