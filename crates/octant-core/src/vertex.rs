//! Vertex classification.
//!
//! A vertex is one corner of the isolation cube. Its id encodes three binary
//! coordinates in a fixed order:
//!
//! ```text
//!   V  v  w  p
//!      |  |  +-- polarity:   0 = production (matter), 1 = development (antimatter)
//!      |  +----- weight:     0 = lightweight, 1 = heavyweight
//!      +-------- visibility: 0 = kernel, 1 = user
//! ```
//!
//! Every vertex has exactly one chiral partner (differs only in polarity) and
//! two structural neighbors (differ in visibility or in weight). The two
//! kernel-space production vertices have no isolation tier: nothing can be
//! enforced around kernel code, so membranes cannot be created there.
//!
//! The table below is compiled in and never changes at runtime.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::OctantError;
use crate::process::IsolationProfile;

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

/// The production/development axis.
///
/// Used both as a vertex's polarity coordinate and as the system-wide mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Chirality {
    /// Matter: services that run in production.
    #[default]
    Production,
    /// Antimatter: development and observability tooling.
    Development,
}

impl Chirality {
    /// The opposite mode.
    #[must_use]
    pub const fn flipped(self) -> Self {
        match self {
            Self::Production => Self::Development,
            Self::Development => Self::Production,
        }
    }

    /// The polarity bit (0 or 1).
    #[must_use]
    pub const fn bit(self) -> u8 {
        match self {
            Self::Production => 0,
            Self::Development => 1,
        }
    }

    /// Lowercase name as persisted and printed.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Production => "production",
            Self::Development => "development",
        }
    }
}

impl fmt::Display for Chirality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Chirality {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "production" | "prod" | "0" => Ok(Self::Production),
            "development" | "dev" | "1" => Ok(Self::Development),
            other => Err(format!("unknown chirality '{other}'")),
        }
    }
}

/// One of the eight isolation-profile classes.
///
/// The discriminant is the 3-bit id `visibility << 2 | weight << 1 | polarity`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
#[repr(u8)]
pub enum Vertex {
    /// Kernel, lightweight, production.
    V000 = 0b000,
    /// Kernel, lightweight, development.
    V001 = 0b001,
    /// Kernel, heavyweight, production.
    V010 = 0b010,
    /// Kernel, heavyweight, development.
    V011 = 0b011,
    /// User, lightweight, production.
    V100 = 0b100,
    /// User, lightweight, development.
    V101 = 0b101,
    /// User, heavyweight, production.
    V110 = 0b110,
    /// User, heavyweight, development.
    V111 = 0b111,
}

/// The two structural neighbors of a vertex.
///
/// The polarity neighbor is the chiral partner, see [`Vertex::partner`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Neighbors {
    /// Differs only in the visibility bit.
    pub visibility: Vertex,
    /// Differs only in the weight bit.
    pub weight: Vertex,
}

/// Default resource envelope applied to a vertex's tier and to new membranes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceEnvelope {
    /// Soft memory limit in bytes (`memory.low`).
    pub memory_soft: u64,
    /// Hard memory limit in bytes (`memory.max`).
    pub memory_hard: u64,
    /// CPU weight (`cpu.weight`, 1-10000).
    pub cpu_weight: u32,
    /// Maximum number of tasks (`pids.max`).
    pub pids_max: u32,
}

/// Compiled-in profile for one vertex.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexProfile {
    /// The vertex this profile describes.
    pub vertex: Vertex,
    /// Human name.
    pub name: &'static str,
    /// Isolation tier (cgroup slice) name; `None` for kernel-space production.
    pub tier: Option<&'static str>,
    /// Capabilities granted to membranes by default.
    pub capabilities: &'static [&'static str],
    /// Default limits; `None` where no tier exists.
    pub envelope: Option<ResourceEnvelope>,
    /// Which namespaces a launched process gets.
    pub isolation: IsolationProfile,
}

static V000_PROFILE: VertexProfile = VertexProfile {
    vertex: Vertex::V000,
    name: "Proton",
    tier: None,
    capabilities: &[],
    envelope: None,
    isolation: IsolationProfile::NONE,
};

static V001_PROFILE: VertexProfile = VertexProfile {
    vertex: Vertex::V001,
    name: "Antiproton",
    tier: Some("antiproton"),
    capabilities: &["CAP_SYS_ADMIN", "CAP_PERFMON", "CAP_BPF"],
    envelope: Some(ResourceEnvelope {
        memory_soft: 32 * MIB,
        memory_hard: 128 * MIB,
        cpu_weight: 10,
        pids_max: 128,
    }),
    isolation: IsolationProfile::FULL,
};

static V010_PROFILE: VertexProfile = VertexProfile {
    vertex: Vertex::V010,
    name: "Neutron",
    tier: None,
    capabilities: &[],
    envelope: None,
    isolation: IsolationProfile::NONE,
};

static V011_PROFILE: VertexProfile = VertexProfile {
    vertex: Vertex::V011,
    name: "Antineutron",
    tier: Some("antineutron"),
    capabilities: &["CAP_SYS_ADMIN", "CAP_SYSLOG"],
    envelope: Some(ResourceEnvelope {
        memory_soft: 256 * MIB,
        memory_hard: GIB,
        cpu_weight: 20,
        pids_max: 1024,
    }),
    isolation: IsolationProfile::PARTIAL,
};

static V100_PROFILE: VertexProfile = VertexProfile {
    vertex: Vertex::V100,
    name: "Photon",
    tier: Some("photon"),
    capabilities: &["CAP_NET_BIND_SERVICE"],
    envelope: Some(ResourceEnvelope {
        memory_soft: 64 * MIB,
        memory_hard: 128 * MIB,
        cpu_weight: 25,
        pids_max: 256,
    }),
    isolation: IsolationProfile::FULL,
};

static V101_PROFILE: VertexProfile = VertexProfile {
    vertex: Vertex::V101,
    name: "Dark photon",
    tier: Some("darkphoton"),
    capabilities: &["CAP_NET_BIND_SERVICE"],
    envelope: Some(ResourceEnvelope {
        memory_soft: 64 * MIB,
        memory_hard: 256 * MIB,
        cpu_weight: 10,
        pids_max: 256,
    }),
    isolation: IsolationProfile::FULL,
};

static V110_PROFILE: VertexProfile = VertexProfile {
    vertex: Vertex::V110,
    name: "Baryon",
    tier: Some("baryon"),
    capabilities: &[
        "CAP_NET_BIND_SERVICE",
        "CAP_CHOWN",
        "CAP_DAC_OVERRIDE",
        "CAP_SETUID",
        "CAP_SETGID",
    ],
    envelope: Some(ResourceEnvelope {
        memory_soft: 512 * MIB,
        memory_hard: 2 * GIB,
        cpu_weight: 100,
        pids_max: 4096,
    }),
    isolation: IsolationProfile::PARTIAL,
};

static V111_PROFILE: VertexProfile = VertexProfile {
    vertex: Vertex::V111,
    name: "Antibaryon",
    tier: Some("antibaryon"),
    capabilities: &["CAP_SYS_PTRACE", "CAP_NET_ADMIN", "CAP_NET_RAW"],
    envelope: Some(ResourceEnvelope {
        memory_soft: GIB,
        memory_hard: 4 * GIB,
        cpu_weight: 50,
        pids_max: 8192,
    }),
    isolation: IsolationProfile::OBSERVATIONAL,
};

impl Vertex {
    /// All eight vertices in id order.
    pub const ALL: [Self; 8] = [
        Self::V000,
        Self::V001,
        Self::V010,
        Self::V011,
        Self::V100,
        Self::V101,
        Self::V110,
        Self::V111,
    ];

    /// Builds a vertex from its 3-bit id.
    #[must_use]
    pub const fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0b000 => Some(Self::V000),
            0b001 => Some(Self::V001),
            0b010 => Some(Self::V010),
            0b011 => Some(Self::V011),
            0b100 => Some(Self::V100),
            0b101 => Some(Self::V101),
            0b110 => Some(Self::V110),
            0b111 => Some(Self::V111),
            _ => None,
        }
    }

    /// Looks up a vertex by its symbol (`V101`, `v101` or `101`).
    pub fn lookup(id: &str) -> Result<Self, OctantError> {
        id.parse()
    }

    /// The 3-bit id.
    #[must_use]
    pub const fn bits(self) -> u8 {
        self as u8
    }

    /// The compiled-in profile.
    #[must_use]
    pub fn profile(self) -> &'static VertexProfile {
        match self {
            Self::V000 => &V000_PROFILE,
            Self::V001 => &V001_PROFILE,
            Self::V010 => &V010_PROFILE,
            Self::V011 => &V011_PROFILE,
            Self::V100 => &V100_PROFILE,
            Self::V101 => &V101_PROFILE,
            Self::V110 => &V110_PROFILE,
            Self::V111 => &V111_PROFILE,
        }
    }

    /// `true` for user-space vertices.
    #[must_use]
    pub const fn is_user(self) -> bool {
        self.bits() & 0b100 != 0
    }

    /// `true` for heavyweight vertices.
    #[must_use]
    pub const fn is_heavy(self) -> bool {
        self.bits() & 0b010 != 0
    }

    /// The polarity coordinate.
    #[must_use]
    pub const fn polarity(self) -> Chirality {
        if self.bits() & 0b001 == 0 {
            Chirality::Production
        } else {
            Chirality::Development
        }
    }

    /// `true` for the four development-polarity vertices.
    #[must_use]
    pub const fn is_development(self) -> bool {
        matches!(self.polarity(), Chirality::Development)
    }

    /// The chiral partner: same vertex with the polarity bit flipped.
    #[must_use]
    pub const fn partner(self) -> Self {
        Self::flip_bit(self, 0b001)
    }

    /// The visibility and weight neighbors.
    #[must_use]
    pub const fn neighbors(self) -> Neighbors {
        Neighbors {
            visibility: Self::flip_bit(self, 0b100),
            weight: Self::flip_bit(self, 0b010),
        }
    }

    /// Human name from the profile table.
    #[must_use]
    pub fn name(self) -> &'static str {
        self.profile().name
    }

    /// Isolation tier, if the vertex has an enforceable boundary.
    #[must_use]
    pub fn tier(self) -> Option<&'static str> {
        self.profile().tier
    }

    /// `true` if membranes can be created on this vertex.
    #[must_use]
    pub fn is_enforceable(self) -> bool {
        self.profile().tier.is_some()
    }

    /// Vertices of the given polarity, in id order.
    pub fn of_polarity(polarity: Chirality) -> impl Iterator<Item = Self> {
        Self::ALL.into_iter().filter(move |v| v.polarity() == polarity)
    }

    /// Symbol such as `V101`.
    #[must_use]
    pub fn symbol(self) -> String {
        format!("V{:03b}", self.bits())
    }

    const fn flip_bit(self, mask: u8) -> Self {
        match Self::from_bits(self.bits() ^ mask) {
            Some(v) => v,
            // Unreachable: the xor of two 3-bit values stays in 0..8.
            None => self,
        }
    }
}

impl fmt::Display for Vertex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "V{:03b}", self.bits())
    }
}

impl FromStr for Vertex {
    type Err = OctantError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let digits = trimmed
            .strip_prefix('V')
            .or_else(|| trimmed.strip_prefix('v'))
            .unwrap_or(trimmed);

        if digits.len() != 3 || !digits.bytes().all(|b| b == b'0' || b == b'1') {
            return Err(OctantError::InvalidVertex(s.to_string()));
        }

        u8::from_str_radix(digits, 2)
            .ok()
            .and_then(Self::from_bits)
            .ok_or_else(|| OctantError::InvalidVertex(s.to_string()))
    }
}

impl TryFrom<String> for Vertex {
    type Error = OctantError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Vertex> for String {
    fn from(v: Vertex) -> Self {
        v.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partner_is_an_involution() {
        for v in Vertex::ALL {
            assert_ne!(v.partner(), v, "{v} must not be its own partner");
            assert_eq!(v.partner().partner(), v);
        }
    }

    #[test]
    fn partner_only_flips_polarity() {
        for v in Vertex::ALL {
            let p = v.partner();
            assert_eq!(v.is_user(), p.is_user());
            assert_eq!(v.is_heavy(), p.is_heavy());
            assert_ne!(v.polarity(), p.polarity());
        }
    }

    #[test]
    fn neighbors_differ_in_one_bit() {
        for v in Vertex::ALL {
            let n = v.neighbors();
            assert_eq!((v.bits() ^ n.visibility.bits()).count_ones(), 1);
            assert_eq!((v.bits() ^ n.weight.bits()).count_ones(), 1);
            assert_ne!(n.visibility.is_user(), v.is_user());
            assert_ne!(n.weight.is_heavy(), v.is_heavy());
        }
    }

    #[test]
    fn symbol_encodes_bits_in_order() {
        assert_eq!(Vertex::V100.symbol(), "V100");
        assert!(Vertex::V100.is_user());
        assert!(!Vertex::V100.is_heavy());
        assert_eq!(Vertex::V100.polarity(), Chirality::Production);
        assert_eq!(Vertex::V011.symbol(), "V011");
        assert_eq!(Vertex::V011.to_string(), "V011");
    }

    #[test]
    fn lookup_accepts_symbol_forms() {
        assert_eq!(Vertex::lookup("V101").unwrap(), Vertex::V101);
        assert_eq!(Vertex::lookup("v101").unwrap(), Vertex::V101);
        assert_eq!(Vertex::lookup("101").unwrap(), Vertex::V101);
    }

    #[test]
    fn lookup_rejects_unknown_ids() {
        for bad in ["V2", "V1000", "V102", "X100", "", "photon"] {
            assert!(
                matches!(Vertex::lookup(bad), Err(OctantError::InvalidVertex(_))),
                "expected InvalidVertex for {bad:?}"
            );
        }
    }

    proptest::proptest! {
        #[test]
        fn parse_accepts_exactly_three_bits(s in "[vVxX]?[0-9]{0,4}") {
            let digits = s.trim_start_matches(['v', 'V']);
            let valid = digits.len() == 3
                && digits.bytes().all(|b| b == b'0' || b == b'1')
                && !s.starts_with(['x', 'X']);
            match s.parse::<Vertex>() {
                Ok(v) => {
                    proptest::prop_assert!(valid);
                    proptest::prop_assert_eq!(v.symbol(), format!("V{digits}"));
                },
                Err(e) => {
                    proptest::prop_assert!(!valid);
                    proptest::prop_assert!(matches!(e, OctantError::InvalidVertex(_)));
                },
            }
        }
    }

    #[test]
    fn exactly_two_vertices_lack_a_tier() {
        let unenforceable: Vec<_> = Vertex::ALL
            .into_iter()
            .filter(|v| !v.is_enforceable())
            .collect();
        assert_eq!(unenforceable, vec![Vertex::V000, Vertex::V010]);
        for v in unenforceable {
            assert!(v.profile().envelope.is_none());
        }
    }

    #[test]
    fn photon_envelope_matches_defaults() {
        let envelope = Vertex::V100.profile().envelope.unwrap();
        assert_eq!(Vertex::V100.tier(), Some("photon"));
        assert_eq!(envelope.memory_hard, 128 * MIB);
        assert_eq!(envelope.memory_soft, 64 * MIB);
        assert_eq!(envelope.cpu_weight, 25);
        assert_eq!(envelope.pids_max, 256);
    }

    #[test]
    fn four_vertices_per_polarity() {
        assert_eq!(Vertex::of_polarity(Chirality::Development).count(), 4);
        assert!(Vertex::of_polarity(Chirality::Development).all(Vertex::is_development));
    }

    #[test]
    fn isolation_depends_on_weight() {
        assert_eq!(Vertex::V100.profile().isolation, IsolationProfile::FULL);
        assert_eq!(Vertex::V110.profile().isolation, IsolationProfile::PARTIAL);
        assert_eq!(
            Vertex::V111.profile().isolation,
            IsolationProfile::OBSERVATIONAL
        );
    }

    #[test]
    fn serde_uses_symbol() {
        let json = serde_json::to_string(&Vertex::V110).unwrap();
        assert_eq!(json, "\"V110\"");
        let back: Vertex = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Vertex::V110);
        assert!(serde_json::from_str::<Vertex>("\"V9\"").is_err());
    }

    #[test]
    fn chirality_parses_and_flips() {
        assert_eq!("dev".parse::<Chirality>().unwrap(), Chirality::Development);
        assert_eq!(Chirality::Production.flipped(), Chirality::Development);
        assert_eq!(Chirality::Development.bit(), 1);
    }
}
