//! Protocol capabilities.
//!
//! Capabilities are exchanged as space-separated tokens: the server lists
//! what it supports after the first advertised reference, and the client
//! names what it wants to use on its first request line. Only the
//! intersection of the two takes effect.

use crate::pktline::Sideband;
use std::fmt;

/// Agent string sent with every advertisement.
pub const AGENT: &str = concat!("ghb/", env!("CARGO_PKG_VERSION"));

/// A single protocol capability.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Capability {
    /// `multi_ack`
    MultiAck,
    /// `multi_ack_detailed`
    MultiAckDetailed,
    /// `no-done`
    NoDone,
    /// `thin-pack`
    ThinPack,
    /// `side-band`
    SideBand,
    /// `side-band-64k`
    SideBand64k,
    /// `ofs-delta`
    OfsDelta,
    /// `shallow`
    Shallow,
    /// `deepen-since`
    DeepenSince,
    /// `deepen-not`
    DeepenNot,
    /// `deepen-relative`
    DeepenRelative,
    /// `no-progress`
    NoProgress,
    /// `include-tag`
    IncludeTag,
    /// `allow-tip-sha1-in-want`
    AllowTipSha1InWant,
    /// `allow-reachable-sha1-in-want`
    AllowReachableSha1InWant,
    /// `filter`
    Filter,
    /// `report-status`
    ReportStatus,
    /// `report-status-v2`
    ReportStatusV2,
    /// `delete-refs`
    DeleteRefs,
    /// `quiet`
    Quiet,
    /// `atomic`
    Atomic,
    /// `push-options`
    PushOptions,
    /// `agent=<name>`
    Agent(String),
    /// `symref=<from>:<to>`
    SymRef {
        /// The symbolic reference, usually `HEAD`.
        from: String,
        /// Its target.
        to: String,
    },
    /// `object-format=<algo>`
    ObjectFormat(String),
}

impl Capability {
    /// Parses one capability token. Unknown tokens yield `None`.
    pub fn parse(token: &str) -> Option<Self> {
        if let Some((key, value)) = token.split_once('=') {
            return match key {
                "agent" => Some(Self::Agent(value.to_string())),
                "object-format" => Some(Self::ObjectFormat(value.to_string())),
                "symref" => {
                    let (from, to) = value.split_once(':')?;
                    Some(Self::SymRef {
                        from: from.to_string(),
                        to: to.to_string(),
                    })
                }
                _ => None,
            };
        }

        let cap = match token {
            "multi_ack" => Self::MultiAck,
            "multi_ack_detailed" => Self::MultiAckDetailed,
            "no-done" => Self::NoDone,
            "thin-pack" => Self::ThinPack,
            "side-band" => Self::SideBand,
            "side-band-64k" => Self::SideBand64k,
            "ofs-delta" => Self::OfsDelta,
            "shallow" => Self::Shallow,
            "deepen-since" => Self::DeepenSince,
            "deepen-not" => Self::DeepenNot,
            "deepen-relative" => Self::DeepenRelative,
            "no-progress" => Self::NoProgress,
            "include-tag" => Self::IncludeTag,
            "allow-tip-sha1-in-want" => Self::AllowTipSha1InWant,
            "allow-reachable-sha1-in-want" => Self::AllowReachableSha1InWant,
            "filter" => Self::Filter,
            "report-status" => Self::ReportStatus,
            "report-status-v2" => Self::ReportStatusV2,
            "delete-refs" => Self::DeleteRefs,
            "quiet" => Self::Quiet,
            "atomic" => Self::Atomic,
            "push-options" => Self::PushOptions,
            _ => return None,
        };
        Some(cap)
    }

    /// Whether `self` and `other` are the same capability, ignoring values.
    fn same_kind(&self, other: &Self) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }

    /// Whether this capability carries a value that is informational only.
    fn is_informational(&self) -> bool {
        matches!(
            self,
            Self::Agent(_) | Self::SymRef { .. } | Self::ObjectFormat(_)
        )
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MultiAck => f.write_str("multi_ack"),
            Self::MultiAckDetailed => f.write_str("multi_ack_detailed"),
            Self::NoDone => f.write_str("no-done"),
            Self::ThinPack => f.write_str("thin-pack"),
            Self::SideBand => f.write_str("side-band"),
            Self::SideBand64k => f.write_str("side-band-64k"),
            Self::OfsDelta => f.write_str("ofs-delta"),
            Self::Shallow => f.write_str("shallow"),
            Self::DeepenSince => f.write_str("deepen-since"),
            Self::DeepenNot => f.write_str("deepen-not"),
            Self::DeepenRelative => f.write_str("deepen-relative"),
            Self::NoProgress => f.write_str("no-progress"),
            Self::IncludeTag => f.write_str("include-tag"),
            Self::AllowTipSha1InWant => f.write_str("allow-tip-sha1-in-want"),
            Self::AllowReachableSha1InWant => f.write_str("allow-reachable-sha1-in-want"),
            Self::Filter => f.write_str("filter"),
            Self::ReportStatus => f.write_str("report-status"),
            Self::ReportStatusV2 => f.write_str("report-status-v2"),
            Self::DeleteRefs => f.write_str("delete-refs"),
            Self::Quiet => f.write_str("quiet"),
            Self::Atomic => f.write_str("atomic"),
            Self::PushOptions => f.write_str("push-options"),
            Self::Agent(agent) => write!(f, "agent={}", agent),
            Self::SymRef { from, to } => write!(f, "symref={}:{}", from, to),
            Self::ObjectFormat(format) => write!(f, "object-format={}", format),
        }
    }
}

/// An ordered set of capabilities.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapabilityList(Vec<Capability>);

impl CapabilityList {
    /// Creates an empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Capabilities the upload-pack engine honours.
    pub fn upload_pack() -> Self {
        [
            Capability::SideBand,
            Capability::SideBand64k,
            Capability::OfsDelta,
            Capability::Shallow,
            Capability::NoProgress,
            Capability::IncludeTag,
            Capability::ThinPack,
            Capability::Agent(AGENT.to_string()),
        ]
        .into_iter()
        .collect()
    }

    /// Capabilities the receive-pack engine honours.
    pub fn receive_pack() -> Self {
        [
            Capability::ReportStatus,
            Capability::DeleteRefs,
            Capability::SideBand64k,
            Capability::Quiet,
            Capability::OfsDelta,
            Capability::Agent(AGENT.to_string()),
        ]
        .into_iter()
        .collect()
    }

    /// Parses a space-separated capability string, skipping unknown tokens.
    pub fn parse(s: &str) -> Self {
        s.split_ascii_whitespace().filter_map(Capability::parse).collect()
    }

    /// Adds a capability, replacing one of the same kind.
    pub fn insert(&mut self, cap: Capability) {
        match self.0.iter_mut().find(|c| c.same_kind(&cap)) {
            Some(existing) => *existing = cap,
            None => self.0.push(cap),
        }
    }

    /// Whether the list contains exactly this capability.
    pub fn contains(&self, cap: &Capability) -> bool {
        self.0.contains(cap)
    }

    /// The effective capabilities: those requested by the client that
    /// `supported` also lists. Informational values are not negotiated and
    /// are dropped.
    pub fn intersect(&self, supported: &CapabilityList) -> CapabilityList {
        self.0
            .iter()
            .filter(|cap| !cap.is_informational() && supported.contains(cap))
            .cloned()
            .collect()
    }

    /// The agent string, if any.
    pub fn agent(&self) -> Option<&str> {
        self.0.iter().find_map(|cap| match cap {
            Capability::Agent(agent) => Some(agent.as_str()),
            _ => None,
        })
    }

    /// The target of a `symref=` entry for `from`.
    pub fn symref(&self, from: &str) -> Option<&str> {
        self.0.iter().find_map(|cap| match cap {
            Capability::SymRef { from: f, to } if f == from => Some(to.as_str()),
            _ => None,
        })
    }

    /// The side-band flavour these capabilities select, preferring 64k.
    pub fn sideband(&self) -> Option<Sideband> {
        if self.contains(&Capability::SideBand64k) {
            Some(Sideband::Large)
        } else if self.contains(&Capability::SideBand) {
            Some(Sideband::Basic)
        } else {
            None
        }
    }

    /// Iterates over the capabilities in order.
    pub fn iter(&self) -> impl Iterator<Item = &Capability> {
        self.0.iter()
    }

    /// Returns the number of capabilities.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if the list is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<Capability> for CapabilityList {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        let mut list = Self::new();
        for cap in iter {
            list.insert(cap);
        }
        list
    }
}

impl fmt::Display for CapabilityList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, cap) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{}", cap)?;
        }
        Ok(())
    }
}
