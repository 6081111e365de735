use std::fmt::{Debug, Formatter};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut};
use crate::util::random::{Random, RngRandom};

/// A 160 bit identifier of a peer, independent of its network address
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
pub struct PeerId(pub [u8; PeerId::LEN]);

impl PeerId {
    pub const LEN: usize = 20;
    pub const ZERO: PeerId = PeerId([0; PeerId::LEN]);

    pub fn random() -> PeerId {
        let mut raw = [0u8; PeerId::LEN];
        RngRandom::fill_bytes(&mut raw);
        PeerId(raw)
    }

    /// convenience for tests and diagnostics: the number is stored in the least significant bytes
    pub fn from_number(n: u64) -> PeerId {
        let mut raw = [0u8; PeerId::LEN];
        raw[PeerId::LEN - 8..].copy_from_slice(&n.to_be_bytes());
        PeerId(raw)
    }

    pub fn is_zero(&self) -> bool {
        self == &PeerId::ZERO
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_slice(&self.0);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<PeerId> {
        if buf.remaining() < PeerId::LEN {
            bail!("buffer underflow reading peer id");
        }
        let mut raw = [0u8; PeerId::LEN];
        buf.copy_to_slice(&mut raw);
        Ok(PeerId(raw))
    }
}

impl Debug for PeerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

const FAMILY_V4: u8 = 4;
const FAMILY_V6: u8 = 6;

/// The network identity of a peer: its id plus the IP address and the ports it listens on for
///  TCP and UDP.
///
/// This core uses peer addresses only opaquely - routing and discovery live elsewhere.
#[derive(Clone, Copy, Eq, PartialEq, Hash)]
pub struct PeerAddress {
    pub peer_id: PeerId,
    pub ip: IpAddr,
    pub tcp_port: u16,
    pub udp_port: u16,
}

impl Debug for PeerAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{:?}@{}:{}/{}]", self.peer_id, self.ip, self.tcp_port, self.udp_port)
    }
}

impl PeerAddress {
    /// offset of the address family byte in the serialized form
    pub const FAMILY_OFFSET: usize = PeerId::LEN;

    pub fn new(peer_id: PeerId, ip: IpAddr, tcp_port: u16, udp_port: u16) -> PeerAddress {
        PeerAddress {
            peer_id,
            ip,
            tcp_port,
            udp_port,
        }
    }

    pub fn unspecified() -> PeerAddress {
        PeerAddress::new(PeerId::ZERO, IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0, 0)
    }

    pub fn tcp_socket(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.tcp_port)
    }

    pub fn udp_socket(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.udp_port)
    }

    pub fn serialized_len(&self) -> usize {
        match self.ip {
            IpAddr::V4(_) => Self::serialized_len_for_family(FAMILY_V4),
            IpAddr::V6(_) => Self::serialized_len_for_family(FAMILY_V6),
        }
            .expect("family constants are valid")
    }

    /// the length of a serialized peer address, based on its address family byte
    pub fn serialized_len_for_family(family: u8) -> anyhow::Result<usize> {
        match family {
            FAMILY_V4 => Ok(PeerId::LEN + 1 + 4 + 2 + 2),
            FAMILY_V6 => Ok(PeerId::LEN + 1 + 16 + 2 + 2),
            n => Err(anyhow!("invalid address family discriminator: {}", n)),
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        self.peer_id.ser(buf);
        ser_ip(&self.ip, buf);
        buf.put_u16(self.tcp_port);
        buf.put_u16(self.udp_port);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<PeerAddress> {
        let peer_id = PeerId::try_deser(buf)?;
        let ip = try_deser_ip(buf)?;
        let tcp_port = buf.try_get_u16()?;
        let udp_port = buf.try_get_u16()?;
        Ok(PeerAddress {
            peer_id,
            ip,
            tcp_port,
            udp_port,
        })
    }
}

fn ser_ip(ip: &IpAddr, buf: &mut impl BufMut) {
    match ip {
        IpAddr::V4(ip) => {
            buf.put_u8(FAMILY_V4);
            buf.put_u32(ip.to_bits());
        }
        IpAddr::V6(ip) => {
            buf.put_u8(FAMILY_V6);
            buf.put_u128(ip.to_bits());
        }
    }
}

fn try_deser_ip(buf: &mut impl Buf) -> anyhow::Result<IpAddr> {
    match buf.try_get_u8()? {
        FAMILY_V4 => Ok(IpAddr::V4(Ipv4Addr::from_bits(buf.try_get_u32()?))),
        FAMILY_V6 => Ok(IpAddr::V6(Ipv6Addr::from_bits(buf.try_get_u128()?))),
        n => Err(anyhow!("invalid address family discriminator: {}", n)),
    }
}

/// the length of a serialized socket address, based on its address family byte
pub fn socket_addr_len_for_family(family: u8) -> anyhow::Result<usize> {
    match family {
        FAMILY_V4 => Ok(1 + 4 + 2),
        FAMILY_V6 => Ok(1 + 16 + 2),
        n => Err(anyhow!("invalid address family discriminator: {}", n)),
    }
}

pub fn socket_addr_len(addr: &SocketAddr) -> usize {
    match addr {
        SocketAddr::V4(_) => socket_addr_len_for_family(FAMILY_V4),
        SocketAddr::V6(_) => socket_addr_len_for_family(FAMILY_V6),
    }
        .expect("family constants are valid")
}

pub fn ser_socket_addr(addr: &SocketAddr, buf: &mut impl BufMut) {
    ser_ip(&addr.ip(), buf);
    buf.put_u16(addr.port());
}

pub fn try_deser_socket_addr(buf: &mut impl Buf) -> anyhow::Result<SocketAddr> {
    let ip = try_deser_ip(buf)?;
    let port = buf.try_get_u16()?;
    Ok(SocketAddr::new(ip, port))
}
