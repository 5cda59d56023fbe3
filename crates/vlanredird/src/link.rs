//! Interface control: link flags and counters over rtnetlink, VLAN offloads
//! through `ethtool`.
//!
//! [`LinkControl`] is the seam the loader and the statistics engine talk to;
//! [`NetlinkLinkControl`] is the kernel-backed implementation. Calls are
//! request/ACK round trips on one `NETLINK_ROUTE` socket, nothing is retried.

use async_trait::async_trait;
use netlink_packet_core::{
    NetlinkHeader, NetlinkMessage, NetlinkPayload, NLM_F_ACK, NLM_F_REQUEST,
};
use netlink_packet_route::link::{LinkAttribute, LinkFlags, LinkMessage};
use netlink_packet_route::RouteNetlinkMessage;
use netlink_sys::{protocols::NETLINK_ROUTE, Socket, SocketAddr};
use parking_lot::Mutex;
use serde::Serialize;
use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, info, instrument, trace};

use crate::error::{Result, VlanRedirError};
use crate::shell::{self, VlanOffload};
use crate::stats::Sample;

/// Receive buffer for one netlink reply.
const RECV_BUFFER_SIZE: usize = 64 * 1024;

/// Cached flag state of a link.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LinkStatus {
    pub up: bool,
    pub running: bool,
    pub promiscuous: bool,
}

impl LinkStatus {
    /// Administratively up with carrier.
    pub fn is_operational(&self) -> bool {
        self.up && self.running
    }
}

/// Kernel operations on network interfaces.
#[async_trait]
pub trait LinkControl: Send + Sync {
    /// Resolves an interface name to its ifindex.
    fn resolve(&self, name: &str) -> Result<u32>;

    /// Sets IFF_UP.
    async fn set_up(&self, name: &str) -> Result<()>;

    /// Sets IFF_PROMISC.
    async fn set_promiscuous(&self, name: &str) -> Result<()>;

    /// Disables receive VLAN tag stripping.
    async fn disable_rx_vlan_offload(&self, name: &str) -> Result<()>;

    /// Disables transmit VLAN tag insertion.
    async fn disable_tx_vlan_offload(&self, name: &str) -> Result<()>;

    /// Reads `{up, running, promiscuous}`.
    async fn get_flags(&self, ifindex: u32) -> Result<LinkStatus>;

    /// Reads the six cumulative link counters.
    async fn get_counters(&self, ifindex: u32) -> Result<Sample>;
}

/// [`LinkControl`] backed by rtnetlink and `ethtool`.
pub struct NetlinkLinkControl {
    socket: Mutex<Socket>,
    sequence: AtomicU32,
}

impl std::fmt::Debug for NetlinkLinkControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetlinkLinkControl")
            .field("sequence", &self.sequence.load(Ordering::Relaxed))
            .finish()
    }
}

impl NetlinkLinkControl {
    /// Opens and connects a `NETLINK_ROUTE` socket.
    #[instrument]
    pub fn connect() -> Result<Self> {
        let mut socket = Socket::new(NETLINK_ROUTE)
            .map_err(|e| VlanRedirError::netlink("socket", e.to_string()))?;
        socket
            .bind_auto()
            .map_err(|e| VlanRedirError::netlink("bind", e.to_string()))?;
        socket
            .connect(&SocketAddr::new(0, 0))
            .map_err(|e| VlanRedirError::netlink("connect", e.to_string()))?;

        debug!("Netlink route socket connected");

        Ok(Self {
            socket: Mutex::new(socket),
            sequence: AtomicU32::new(1),
        })
    }

    fn set_flag(&self, name: &str, flag: LinkFlags, operation: &str) -> Result<()> {
        let ifindex = self.resolve(name)?;
        let packet = build_request(
            RouteNetlinkMessage::SetLink(flag_change(ifindex, flag)),
            NLM_F_REQUEST | NLM_F_ACK,
            self.sequence.fetch_add(1, Ordering::Relaxed),
        );
        self.transact(packet, operation, ifindex)?;
        Ok(())
    }

    fn get_link(&self, ifindex: u32) -> Result<LinkMessage> {
        let mut link = LinkMessage::default();
        link.header.index = ifindex;
        let packet = build_request(
            RouteNetlinkMessage::GetLink(link),
            NLM_F_REQUEST,
            self.sequence.fetch_add(1, Ordering::Relaxed),
        );
        self.transact(packet, "get link", ifindex)?
            .ok_or_else(|| VlanRedirError::netlink("get link", "no link in reply"))
    }

    /// Sends one request and waits for the reply with the same sequence
    /// number. Returns the link of a `NewLink` reply, `None` for an ACK.
    fn transact(
        &self,
        packet: NetlinkMessage<RouteNetlinkMessage>,
        operation: &str,
        ifindex: u32,
    ) -> Result<Option<LinkMessage>> {
        let sequence = packet.header.sequence_number;
        let mut buf = vec![0u8; packet.buffer_len()];
        packet.serialize(&mut buf);

        let socket = self.socket.lock();
        socket
            .send(&buf, 0)
            .map_err(|e| VlanRedirError::netlink(operation, e.to_string()))?;

        let mut rx = Vec::with_capacity(RECV_BUFFER_SIZE);
        loop {
            rx.clear();
            let len = socket
                .recv(&mut rx, 0)
                .map_err(|e| VlanRedirError::netlink(operation, e.to_string()))?;

            let mut offset = 0;
            while offset < len {
                let msg = NetlinkMessage::<RouteNetlinkMessage>::deserialize(&rx[offset..len])
                    .map_err(|e| {
                        VlanRedirError::netlink(operation, format!("Failed to parse reply: {}", e))
                    })?;
                let msg_len = msg.header.length as usize;
                if msg_len == 0 {
                    return Err(VlanRedirError::netlink(operation, "zero length message"));
                }
                // Align to 4 bytes (netlink alignment requirement)
                offset += (msg_len + 3) & !3;

                if msg.header.sequence_number != sequence {
                    trace!(sequence = msg.header.sequence_number, "Skipping stale reply");
                    continue;
                }

                match msg.payload {
                    NetlinkPayload::Error(err) => {
                        return match err.code {
                            None => Ok(None),
                            Some(code) => Err(errno_error(-code.get(), operation, ifindex)),
                        };
                    }
                    NetlinkPayload::InnerMessage(RouteNetlinkMessage::NewLink(link)) => {
                        return Ok(Some(link));
                    }
                    NetlinkPayload::Done(_) => return Ok(None),
                    _ => {}
                }
            }
        }
    }

    async fn disable_offload(&self, name: &str, offload: VlanOffload) -> Result<()> {
        let cmd = shell::disable_offload_cmd(name, offload);
        match shell::exec_or_throw(&cmd).await {
            Ok(_) => {
                info!(interface = %name, feature = offload.feature(), "Disabled VLAN offload");
                Ok(())
            }
            Err(VlanRedirError::ShellCommandFailed { output, .. }) => Err(
                VlanRedirError::operation_denied(format!("{} off on {}", offload.feature(), name), output),
            ),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl LinkControl for NetlinkLinkControl {
    fn resolve(&self, name: &str) -> Result<u32> {
        nix::net::if_::if_nametoindex(name).map_err(|_| VlanRedirError::interface_not_found(name))
    }

    #[instrument(skip(self))]
    async fn set_up(&self, name: &str) -> Result<()> {
        self.set_flag(name, LinkFlags::Up, "set up")?;
        info!(interface = %name, "Interface set up");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn set_promiscuous(&self, name: &str) -> Result<()> {
        self.set_flag(name, LinkFlags::Promisc, "set promiscuous")?;
        info!(interface = %name, "Interface set promiscuous");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn disable_rx_vlan_offload(&self, name: &str) -> Result<()> {
        self.disable_offload(name, VlanOffload::Rx).await
    }

    #[instrument(skip(self))]
    async fn disable_tx_vlan_offload(&self, name: &str) -> Result<()> {
        self.disable_offload(name, VlanOffload::Tx).await
    }

    async fn get_flags(&self, ifindex: u32) -> Result<LinkStatus> {
        self.get_link(ifindex).map(|link| link_status(&link))
    }

    async fn get_counters(&self, ifindex: u32) -> Result<Sample> {
        let link = self.get_link(ifindex)?;
        link_counters(&link)
            .ok_or_else(|| VlanRedirError::netlink("get link", "reply carries no statistics"))
    }
}

/// Wraps `message` into a finalized netlink request.
fn build_request(
    message: RouteNetlinkMessage,
    flags: u16,
    sequence: u32,
) -> NetlinkMessage<RouteNetlinkMessage> {
    let mut header = NetlinkHeader::default();
    header.flags = flags;
    header.sequence_number = sequence;
    let mut packet = NetlinkMessage::new(header, NetlinkPayload::InnerMessage(message));
    packet.finalize();
    packet
}

/// Link message setting `flag` and leaving every other flag untouched.
fn flag_change(ifindex: u32, flag: LinkFlags) -> LinkMessage {
    let mut link = LinkMessage::default();
    link.header.index = ifindex;
    link.header.flags = flag;
    link.header.change_mask = flag;
    link
}

fn link_status(link: &LinkMessage) -> LinkStatus {
    let flags = link.header.flags;
    LinkStatus {
        up: flags.contains(LinkFlags::Up),
        running: flags.contains(LinkFlags::Running),
        promiscuous: flags.contains(LinkFlags::Promisc),
    }
}

/// Prefers the 64-bit statistics, falls back to the legacy 32-bit block.
fn link_counters(link: &LinkMessage) -> Option<Sample> {
    let stats64 = link.attributes.iter().find_map(|attr| match attr {
        LinkAttribute::Stats64(s) => Some(Sample {
            rx_bytes: s.rx_bytes,
            rx_packets: s.rx_packets,
            rx_dropped: s.rx_dropped,
            tx_bytes: s.tx_bytes,
            tx_packets: s.tx_packets,
            tx_dropped: s.tx_dropped,
        }),
        _ => None,
    });
    stats64.or_else(|| {
        link.attributes.iter().find_map(|attr| match attr {
            LinkAttribute::Stats(s) => Some(Sample {
                rx_bytes: u64::from(s.rx_bytes),
                rx_packets: u64::from(s.rx_packets),
                rx_dropped: u64::from(s.rx_dropped),
                tx_bytes: u64::from(s.tx_bytes),
                tx_packets: u64::from(s.tx_packets),
                tx_dropped: u64::from(s.tx_dropped),
            }),
            _ => None,
        })
    })
}

fn errno_error(errno: i32, operation: &str, ifindex: u32) -> VlanRedirError {
    let message = io::Error::from_raw_os_error(errno).to_string();
    match errno {
        libc::ENODEV => VlanRedirError::link_not_found(ifindex),
        libc::EPERM | libc::EACCES => VlanRedirError::operation_denied(operation, message),
        _ => VlanRedirError::netlink(operation, message),
    }
}
