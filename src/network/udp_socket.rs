use std::{
    io::ErrorKind,
    net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket},
};

use crate::network::codec;
use crate::report_violation;
use crate::telemetry::{ViolationKind, ViolationSeverity};
use crate::{network::messages::Message, NonBlockingSocket};

pub(crate) const RECV_BUFFER_SIZE: usize = 4096;
const SEND_BUFFER_SIZE: usize = 1024;
/// Packets above this size risk fragmentation on the public internet.
const IDEAL_MAX_UDP_PACKET_SIZE: usize = 508;

/// A simple non-blocking UDP socket to use with a [`RollbackSession`].
///
/// [`RollbackSession`]: crate::RollbackSession
#[derive(Debug)]
pub struct UdpNonBlockingSocket {
    socket: UdpSocket,
    recv_buffer: [u8; RECV_BUFFER_SIZE],
    send_buffer: [u8; SEND_BUFFER_SIZE],
}

impl UdpNonBlockingSocket {
    /// Binds a non-blocking socket to `port` on all IPv4 interfaces. Port 0 picks a free port.
    pub fn bind_to_port(port: u16) -> Result<Self, std::io::Error> {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;
        tracing::debug!(port = socket.local_addr()?.port(), "bound netplay socket");
        Ok(Self {
            socket,
            recv_buffer: [0; RECV_BUFFER_SIZE],
            send_buffer: [0; SEND_BUFFER_SIZE],
        })
    }

    /// Sends one message. Shared with [`ThreadedUdpSocket`](crate::ThreadedUdpSocket).
    pub(crate) fn send_message(
        socket: &UdpSocket,
        send_buffer: &mut [u8],
        msg: &Message,
        addr: &SocketAddr,
    ) {
        match codec::encode_into(msg, send_buffer) {
            Ok(len) => Self::send_encoded_packet(socket, &send_buffer[..len], addr),
            Err(codec::CodecError::BufferTooSmall { provided }) => {
                report_violation!(
                    ViolationSeverity::Warning,
                    ViolationKind::NetworkProtocol,
                    "Message too large for send buffer ({} bytes), falling back to allocation",
                    provided
                );
                match codec::encode(msg) {
                    Ok(buf) => Self::send_encoded_packet(socket, &buf, addr),
                    Err(e) => report_violation!(
                        ViolationSeverity::Error,
                        ViolationKind::NetworkProtocol,
                        "Failed to serialize message: {}",
                        e
                    ),
                }
            }
            Err(e) => report_violation!(
                ViolationSeverity::Error,
                ViolationKind::NetworkProtocol,
                "Failed to serialize message: {}",
                e
            ),
        }
    }

    /// Decodes one datagram, logging and dropping it when malformed.
    pub(crate) fn decode_datagram(bytes: &[u8], from: SocketAddr) -> Option<Message> {
        match codec::decode_value(bytes) {
            Ok(msg) => Some(msg),
            Err(e) => {
                tracing::debug!(%from, len = bytes.len(), error = %e, "dropping malformed datagram");
                None
            }
        }
    }

    fn send_encoded_packet(socket: &UdpSocket, buf: &[u8], addr: &SocketAddr) {
        if buf.len() > IDEAL_MAX_UDP_PACKET_SIZE {
            report_violation!(
                ViolationSeverity::Warning,
                ViolationKind::NetworkProtocol,
                "Sending UDP packet of size {} bytes, which is larger than ideal ({})",
                buf.len(),
                IDEAL_MAX_UDP_PACKET_SIZE
            );
        }
        if let Err(e) = socket.send_to(buf, addr) {
            tracing::debug!(%addr, error = %e, "send_to failed");
        }
    }
}

impl NonBlockingSocket<SocketAddr> for UdpNonBlockingSocket {
    fn send_to(&mut self, msg: &Message, addr: &SocketAddr) {
        Self::send_message(&self.socket, &mut self.send_buffer, msg, addr);
    }

    fn receive_all_messages(&mut self) -> Vec<(SocketAddr, Message)> {
        let mut received_messages = Vec::with_capacity(4);
        loop {
            match self.socket.recv_from(&mut self.recv_buffer) {
                Ok((number_of_bytes, src_addr)) => {
                    let Some(bytes) = self.recv_buffer.get(..number_of_bytes) else {
                        continue;
                    };
                    if let Some(msg) = Self::decode_datagram(bytes, src_addr) {
                        received_messages.push((src_addr, msg));
                    }
                }
                Err(ref err) if err.kind() == ErrorKind::WouldBlock => return received_messages,
                // ICMP port unreachable from a peer that is not up yet
                Err(ref err) if err.kind() == ErrorKind::ConnectionReset => continue,
                Err(err) => {
                    report_violation!(
                        ViolationSeverity::Error,
                        ViolationKind::NetworkProtocol,
                        "Unexpected socket error: {:?}: {}",
                        err.kind(),
                        err
                    );
                    return received_messages;
                }
            }
        }
    }

    fn local_port(&self) -> Option<u16> {
        self.socket.local_addr().ok().map(|addr| addr.port())
    }
}
