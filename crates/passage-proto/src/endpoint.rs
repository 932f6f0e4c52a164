//! Reachability model: transport tiers, dialable endpoints, NAT classes,
//! and the announcement record a node publishes to the DHT.

use std::fmt;
use std::net::{SocketAddr, SocketAddrV4, SocketAddrV6};

use serde::{Deserialize, Serialize};

use crate::error::{ProtoError, Result};
use crate::identity::PeerId;
use crate::limits::{ANNOUNCEMENT_FRESH_SECS, MAX_DHT_VALUE_SIZE};

// ============================================================================
// Tiers
// ============================================================================

/// Connection establishment tiers, declared in escalation order.
///
/// The derived `Ord` follows declaration order, so sorting tiers sorts
/// them by priority.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Direct TCP over IPv6.
    DirectIpv6,
    /// Direct TCP over IPv4.
    DirectIpv4,
    /// Offer/answer negotiated path over signaling.
    Negotiated,
    /// Coordinated UDP hole punch.
    HolePunch,
    /// Forwarding through a volunteer relay.
    Relay,
    /// Store-and-forward delivery, no live channel.
    Gossip,
}

impl Tier {
    /// All tiers in escalation order.
    pub const ALL: [Tier; 6] = [
        Tier::DirectIpv6,
        Tier::DirectIpv4,
        Tier::Negotiated,
        Tier::HolePunch,
        Tier::Relay,
        Tier::Gossip,
    ];

    /// Numeric priority, 1 is tried first.
    pub const fn priority(&self) -> u8 {
        match self {
            Tier::DirectIpv6 => 1,
            Tier::DirectIpv4 => 2,
            Tier::Negotiated => 3,
            Tier::HolePunch => 4,
            Tier::Relay => 5,
            Tier::Gossip => 6,
        }
    }

    /// Tiers that consume third-party resources and therefore never run
    /// concurrently with cheaper attempts.
    pub const fn is_cost_escalating(&self) -> bool {
        matches!(self, Tier::Relay | Tier::Gossip)
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Tier::DirectIpv6 => "direct_ipv6",
            Tier::DirectIpv4 => "direct_ipv4",
            Tier::Negotiated => "negotiated",
            Tier::HolePunch => "hole_punch",
            Tier::Relay => "relay",
            Tier::Gossip => "gossip",
        };
        f.write_str(name)
    }
}

// ============================================================================
// Endpoints
// ============================================================================

/// Endpoint flavor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    /// Plain IPv6 socket address.
    Ipv6,
    /// Plain IPv4 socket address.
    Ipv4,
    /// Signaling-mediated negotiated path; no standing address.
    Webrtc,
    /// Reachable through the relay peer named in `via`.
    Relay,
}

/// Where an address was observed from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddrScope {
    /// Address local to the peer's own network.
    Local,
    /// Externally observed (reflexive or port-mapped) address.
    External,
    /// Provenance unknown.
    #[default]
    Unknown,
}

/// One way to reach a peer.
///
/// `addr` is absent for `Webrtc` (the path is built by negotiation);
/// `via` is present only for `Relay`. Fields stay unconditional so the
/// record serializes identically under bincode and JSON.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Endpoint {
    /// Endpoint flavor.
    pub transport: Transport,
    /// Socket address, when the transport has one.
    pub addr: Option<SocketAddr>,
    /// Relay peer for `Transport::Relay`.
    pub via: Option<PeerId>,
    /// Address provenance.
    pub scope: AddrScope,
}

impl Endpoint {
    /// Direct IPv6 endpoint.
    pub fn ipv6(addr: SocketAddrV6) -> Self {
        Endpoint {
            transport: Transport::Ipv6,
            addr: Some(SocketAddr::V6(addr)),
            via: None,
            scope: AddrScope::Unknown,
        }
    }

    /// Direct IPv4 endpoint with provenance.
    pub fn ipv4(addr: SocketAddrV4, scope: AddrScope) -> Self {
        Endpoint {
            transport: Transport::Ipv4,
            addr: Some(SocketAddr::V4(addr)),
            via: None,
            scope,
        }
    }

    /// Negotiated (signaling-mediated) endpoint.
    pub fn webrtc() -> Self {
        Endpoint {
            transport: Transport::Webrtc,
            addr: None,
            via: None,
            scope: AddrScope::Unknown,
        }
    }

    /// Relay endpoint through `via`.
    pub fn relay(via: PeerId) -> Self {
        Endpoint {
            transport: Transport::Relay,
            addr: None,
            via: Some(via),
            scope: AddrScope::Unknown,
        }
    }

    /// The tier that dials this endpoint.
    pub fn tier(&self) -> Tier {
        match self.transport {
            Transport::Ipv6 => Tier::DirectIpv6,
            Transport::Ipv4 => Tier::DirectIpv4,
            Transport::Webrtc => Tier::Negotiated,
            Transport::Relay => Tier::Relay,
        }
    }
}

// ============================================================================
// NAT classification
// ============================================================================

/// NAT behavior as classified from reflexive-address observation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NatKind {
    /// No translation observed; reflexive address equals the local one.
    None,
    /// Endpoint-independent mapping; hole punching works.
    Cone,
    /// Endpoint-dependent mapping; hole punching is defeated.
    Symmetric,
    /// Not yet classified.
    #[default]
    Unknown,
}

impl NatKind {
    /// Whether a coordinated hole punch has a chance through this NAT.
    pub const fn is_punchable(&self) -> bool {
        !matches!(self, NatKind::Symmetric)
    }
}

impl fmt::Display for NatKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NatKind::None => "none",
            NatKind::Cone => "cone",
            NatKind::Symmetric => "symmetric",
            NatKind::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

// ============================================================================
// Announcement
// ============================================================================

/// Relay service advertisement inside an announcement: this node
/// volunteers to forward for others.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RelayAdvert {
    /// TCP port the relay listener is bound to.
    pub port: u16,
    /// Sessions the relay is willing to hold.
    pub max_sessions: u32,
    /// Sessions in use when the announcement was issued.
    pub active_sessions: u32,
    /// Fraction of the last day the relay was up, 0.0 through 1.0.
    pub uptime_score: f32,
}

impl RelayAdvert {
    /// Sessions still available when the announcement was issued.
    pub fn headroom(&self) -> u32 {
        self.max_sessions.saturating_sub(self.active_sessions)
    }
}

/// Hole-punch capability advertisement.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PunchAdvert {
    /// UDP port the punch listener is bound to.
    pub port: u16,
    /// NAT class observed from this node's side.
    pub nat: NatKind,
    /// Historical punch success rate, 0.0 through 1.0.
    pub success_rate: f32,
}

/// Reachability record a node publishes to the DHT under its own id.
///
/// Optional sections are omitted from the serialized form when absent,
/// so a minimal host publishes nothing but an address and a timestamp.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PeerAnnouncement {
    /// The announcing node.
    pub peer_id: PeerId,
    /// Address on the local network, for peers on the same segment.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub ipv4_local: Option<SocketAddrV4>,
    /// Externally observed IPv4 address, when known.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub ipv4_external: Option<SocketAddrV4>,
    /// NAT class in front of the IPv4 addresses.
    #[serde(default)]
    pub nat: NatKind,
    /// Global IPv6 address, when available.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub ipv6: Option<SocketAddrV6>,
    /// Present when this node volunteers as a relay.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub relay: Option<RelayAdvert>,
    /// Present when this node runs a punch listener.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub punch: Option<PunchAdvert>,
    /// Relays this node keeps standing registrations with.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub reachable_via: Vec<PeerId>,
    /// Issue time, unix seconds.
    pub issued_at: u64,
}

impl PeerAnnouncement {
    /// Structural validation applied to every announcement that crosses
    /// the wire, inbound or outbound.
    pub fn validate(&self) -> Result<()> {
        if self.ipv4_local.is_none() && self.ipv4_external.is_none() && self.ipv6.is_none() {
            return Err(ProtoError::InvalidAnnouncement(
                "no addresses advertised".into(),
            ));
        }
        if let Some(punch) = &self.punch {
            if punch.port == 0 {
                return Err(ProtoError::InvalidAnnouncement("punch port is zero".into()));
            }
        }
        if let Some(relay) = &self.relay {
            if relay.port == 0 {
                return Err(ProtoError::InvalidAnnouncement("relay port is zero".into()));
            }
            if relay.max_sessions == 0 {
                return Err(ProtoError::InvalidAnnouncement(
                    "relay advertises zero sessions".into(),
                ));
            }
        }
        Ok(())
    }

    /// Whether the record is recent enough to dial from.
    pub fn is_fresh(&self, now: u64) -> bool {
        now < self.issued_at.saturating_add(ANNOUNCEMENT_FRESH_SECS)
    }

    /// Expands the record into dialable endpoints, best candidates
    /// first: IPv6, then external IPv4, then local IPv4, then relays.
    pub fn endpoints(&self) -> Vec<Endpoint> {
        let mut out = Vec::new();
        if let Some(addr) = self.ipv6 {
            out.push(Endpoint::ipv6(addr));
        }
        if let Some(addr) = self.ipv4_external {
            out.push(Endpoint::ipv4(addr, AddrScope::External));
        }
        if let Some(addr) = self.ipv4_local {
            out.push(Endpoint::ipv4(addr, AddrScope::Local));
        }
        for via in &self.reachable_via {
            out.push(Endpoint::relay(*via));
        }
        out
    }

    /// Serializes for storage as a DHT value, enforcing the value cap.
    pub fn to_value_bytes(&self) -> Result<Vec<u8>> {
        let bytes = serde_json::to_vec(self)?;
        if bytes.len() > MAX_DHT_VALUE_SIZE {
            return Err(ProtoError::PayloadTooLarge {
                max: MAX_DHT_VALUE_SIZE,
                actual: bytes.len(),
            });
        }
        Ok(bytes)
    }

    /// Parses and validates a DHT value.
    pub fn from_value_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() > MAX_DHT_VALUE_SIZE {
            return Err(ProtoError::InputTooLarge {
                max: MAX_DHT_VALUE_SIZE,
                actual: bytes.len(),
            });
        }
        let announcement: PeerAnnouncement = serde_json::from_slice(bytes)?;
        announcement.validate()?;
        Ok(announcement)
    }
}
