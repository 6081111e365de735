use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use anyhow::bail;

/// This is the largest UDP payload (in bytes) that a message may occupy before it has to go
///  through TCP or be sent as a streaming message. It leaves headroom below the typical Ethernet
///  MTU for IP / UDP headers and for optional headers introduced by network hardware.
pub const DEFAULT_UDP_SIZE_CEILING: usize = 1400;

/// Configuration for the outbound side: [crate::channel::reservation::Reservation] and the
///  [crate::channel::channel_creator::ChannelCreator]s it issues.
#[derive(Clone, Debug)]
pub struct ChannelClientConfig {
    /// The maximum number of short-lived UDP channels that may exist at the same time across all
    ///  channel creators of a reservation
    pub max_permits_udp: usize,
    /// The maximum number of short-lived TCP channels that may exist at the same time across all
    ///  channel creators of a reservation
    pub max_permits_tcp: usize,
    /// Permanent connections are accounted separately so that long-lived peers can not starve
    ///  short request / response exchanges
    pub max_permits_permanent_tcp: usize,

    pub connect_timeout: Duration,
    pub idle_tcp: Duration,
    pub idle_udp: Duration,

    pub udp_size_ceiling: usize,

    /// Upper bound for any length declared on the wire. A peer declaring more than this is
    ///  considered broken or malicious, and the connection is closed.
    pub max_message_size: u32,

    /// The local address outbound sockets are bound to (with an ephemeral port)
    pub bind_ip: IpAddr,

    pub receive_buffer_size: usize,
}

impl ChannelClientConfig {
    pub fn default_ipv4() -> ChannelClientConfig {
        ChannelClientConfig {
            max_permits_udp: 250,
            max_permits_tcp: 250,
            max_permits_permanent_tcp: 250,
            connect_timeout: Duration::from_secs(3),
            idle_tcp: Duration::from_secs(5),
            idle_udp: Duration::from_secs(5),
            udp_size_ceiling: DEFAULT_UDP_SIZE_CEILING,
            max_message_size: 16*1024*1024,
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            receive_buffer_size: 64*1024,
        }
    }

    /// convenience for tests and local setups: everything bound to the loopback interface
    pub fn localhost(max_permits_udp: usize, max_permits_tcp: usize, max_permits_permanent_tcp: usize) -> ChannelClientConfig {
        ChannelClientConfig {
            max_permits_udp,
            max_permits_tcp,
            max_permits_permanent_tcp,
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ..Self::default_ipv4()
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.udp_size_ceiling < 100 {
            bail!("UDP size ceiling is too small");
        }
        if self.udp_size_ceiling > 65507 {
            bail!("UDP size ceiling exceeds the maximum UDP payload");
        }
        if self.receive_buffer_size == 0 {
            bail!("receive buffer size must not be 0");
        }
        // semaphores hand out at most u32::MAX permits in one call
        let max_permits = tokio::sync::Semaphore::MAX_PERMITS.min(u32::MAX as usize);
        for (kind, permits) in [("UDP", self.max_permits_udp), ("TCP", self.max_permits_tcp), ("permanent TCP", self.max_permits_permanent_tcp)] {
            if permits > max_permits {
                bail!("{} {} permits exceed the maximum of {}", permits, kind, max_permits);
            }
        }
        if self.connect_timeout.is_zero() {
            bail!("connect timeout must not be 0");
        }
        Ok(())
    }
}

/// Configuration for the listening side
#[derive(Clone, Debug)]
pub struct ChannelServerConfig {
    pub bind_ip: IpAddr,
    /// 0 for an ephemeral port
    pub tcp_port: u16,
    /// 0 for an ephemeral port
    pub udp_port: u16,

    /// Incoming TCP connections beyond this number are closed right after they are accepted
    pub max_incoming_tcp: usize,

    pub idle_tcp: Duration,
    pub udp_size_ceiling: usize,
    pub max_message_size: u32,
    pub receive_buffer_size: usize,
}

impl ChannelServerConfig {
    pub fn default_ipv4() -> ChannelServerConfig {
        ChannelServerConfig {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            tcp_port: 7700,
            udp_port: 7700,
            max_incoming_tcp: 1000,
            idle_tcp: Duration::from_secs(5),
            udp_size_ceiling: DEFAULT_UDP_SIZE_CEILING,
            max_message_size: 16*1024*1024,
            receive_buffer_size: 64*1024,
        }
    }

    /// loopback with ephemeral ports
    pub fn localhost() -> ChannelServerConfig {
        ChannelServerConfig {
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            tcp_port: 0,
            udp_port: 0,
            ..Self::default_ipv4()
        }
    }

    pub fn tcp_bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_ip, self.tcp_port)
    }

    pub fn udp_bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_ip, self.udp_port)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.udp_size_ceiling < 100 {
            bail!("UDP size ceiling is too small");
        }
        if self.udp_size_ceiling > 65507 {
            bail!("UDP size ceiling exceeds the maximum UDP payload");
        }
        if self.max_incoming_tcp == 0 {
            bail!("the server must accept at least one TCP connection");
        }
        if self.receive_buffer_size == 0 {
            bail!("receive buffer size must not be 0");
        }
        Ok(())
    }
}
