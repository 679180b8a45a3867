// MIT License
//
// Copyright (c) 2025 Takatoshi Kondo
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.
use anyhow::Result;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{error, info, trace, warn};

use crate::session_store::DeviceAddress;

/// MQTT-SN datagram transport
pub trait Transport {
    /// Send one complete frame. `false` means the link is unusable.
    fn send(&mut self, address: &DeviceAddress, bytes: &[u8]) -> bool;

    fn max_message_length(&self) -> usize;

    /// Address announced in GWINFO
    fn local_address(&self) -> DeviceAddress;

    /// Destination for ADVERTISE
    fn broadcast_address(&self) -> DeviceAddress;
}

/// Socket options applied before binding
#[derive(Debug, Clone, Default)]
pub struct UdpOptions {
    pub send_buf_size: Option<usize>,
    pub recv_buf_size: Option<usize>,
}

/// UDP/IPv4 transport. Clones share the socket, so the gateway loop can
/// receive on one handle while the engine sends on another.
#[derive(Debug, Clone)]
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    local: DeviceAddress,
    broadcast: DeviceAddress,
    max_message_length: usize,
}

impl UdpTransport {
    pub fn bind(
        bind_address: Ipv4Addr,
        port: u16,
        max_message_length: usize,
        options: &UdpOptions,
    ) -> Result<Self> {
        let addr = SocketAddr::V4(SocketAddrV4::new(bind_address, port));
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        configure_socket(&socket, &addr, options)?;
        socket.bind(&addr.into())?;
        socket.set_nonblocking(true)?;
        let socket = UdpSocket::from_std(socket.into())?;

        let local_addr = socket.local_addr()?;
        let local = DeviceAddress::from_socket_addr(&local_addr)
            .ok_or_else(|| anyhow::anyhow!("local address {local_addr} is not IPv4"))?;
        let broadcast = DeviceAddress::from_socket_addr(&SocketAddr::V4(SocketAddrV4::new(
            Ipv4Addr::BROADCAST,
            local_addr.port(),
        )))
        .unwrap_or_default();
        info!("MQTT-SN UDP transport bound to {local_addr}");

        Ok(Self {
            socket: Arc::new(socket),
            local,
            broadcast,
            max_message_length,
        })
    }

    /// Receive one datagram. Non-IPv4 senders are skipped.
    pub async fn recv(&self, buf: &mut [u8]) -> Result<(usize, DeviceAddress)> {
        loop {
            let (len, from) = self.socket.recv_from(buf).await?;
            match DeviceAddress::from_socket_addr(&from) {
                Some(address) => return Ok((len, address)),
                None => warn!("Ignoring datagram from non-IPv4 sender {from}"),
            }
        }
    }
}

fn configure_socket(socket: &Socket, addr: &SocketAddr, options: &UdpOptions) -> Result<()> {
    socket
        .set_reuse_address(true)
        .map_err(|e| anyhow::anyhow!("Failed to set SO_REUSEADDR: {e}"))?;
    socket
        .set_broadcast(true)
        .map_err(|e| anyhow::anyhow!("Failed to set SO_BROADCAST: {e}"))?;

    if let Some(size) = options.send_buf_size.filter(|s| *s > 0) {
        if let Err(e) = socket.set_send_buffer_size(size) {
            error!("Failed to set send buffer size for {addr}: {e}");
        }
    }
    if let Some(size) = options.recv_buf_size.filter(|s| *s > 0) {
        if let Err(e) = socket.set_recv_buffer_size(size) {
            error!("Failed to set recv buffer size for {addr}: {e}");
        }
    }
    Ok(())
}

impl Transport for UdpTransport {
    fn send(&mut self, address: &DeviceAddress, bytes: &[u8]) -> bool {
        let to = address.to_socket_addr();
        match self.socket.try_send_to(bytes, to) {
            Ok(sent) if sent == bytes.len() => {
                trace!("Sent {sent} byte(s) to {to}");
                true
            }
            Ok(sent) => {
                error!("Short send to {to}: {sent} of {} byte(s)", bytes.len());
                false
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                // kernel buffer full, the frame is lost but the link is fine
                warn!("Send buffer full, dropping frame to {to}");
                true
            }
            Err(e) => {
                error!("Failed to send to {to}: {e}");
                false
            }
        }
    }

    fn max_message_length(&self) -> usize {
        self.max_message_length
    }

    fn local_address(&self) -> DeviceAddress {
        self.local
    }

    fn broadcast_address(&self) -> DeviceAddress {
        self.broadcast
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_udp_round_trip() {
        let options = UdpOptions::default();
        let receiver = UdpTransport::bind(Ipv4Addr::LOCALHOST, 0, 255, &options).unwrap();
        let mut sender = UdpTransport::bind(Ipv4Addr::LOCALHOST, 0, 255, &options).unwrap();

        assert!(sender.send(&receiver.local_address(), &[0x02, 0x16]));

        let mut buf = [0u8; 64];
        let (len, from) = tokio::time::timeout(Duration::from_secs(5), receiver.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..len], &[0x02, 0x16]);
        assert_eq!(from, sender.local_address());
        assert_eq!(
            receiver.broadcast_address().to_socket_addr().port(),
            receiver.local_address().to_socket_addr().port()
        );
    }
}
