//! UDP socket with a dedicated receive thread.
//!
//! The I/O thread only decodes datagrams and appends them to a locked inbound
//! queue. The session drains that queue from its own thread at the start of
//! every tick, so session state is never touched from the I/O thread.

use std::collections::VecDeque;
use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;

use crate::network::messages::Message;
use crate::network::udp_socket::{UdpNonBlockingSocket, RECV_BUFFER_SIZE};
use crate::report_violation;
use crate::telemetry::{ViolationKind, ViolationSeverity};
use crate::NonBlockingSocket;

/// How long one blocking receive waits before the stop flag is checked again.
const RECV_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Inbound messages kept while the session is not draining.
const MAX_INBOUND_MESSAGES: usize = 4096;

type Inbound = Arc<Mutex<VecDeque<(SocketAddr, Message)>>>;

/// A [`NonBlockingSocket`] whose receiving side runs on its own thread.
///
/// Sending happens on the caller's thread. Dropping the socket stops and joins
/// the I/O thread.
#[derive(Debug)]
pub struct ThreadedUdpSocket {
    socket: UdpSocket,
    send_buffer: Vec<u8>,
    inbound: Inbound,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    local_port: u16,
}

impl ThreadedUdpSocket {
    /// Binds to `port` on all IPv4 interfaces and starts the I/O thread.
    pub fn bind_to_port(port: u16) -> Result<Self, std::io::Error> {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
        let socket = UdpSocket::bind(addr)?;
        socket.set_read_timeout(Some(RECV_POLL_INTERVAL))?;
        let local_port = socket.local_addr()?.port();

        let recv_socket = socket.try_clone()?;
        let inbound: Inbound = Arc::new(Mutex::new(VecDeque::new()));
        let stop = Arc::new(AtomicBool::new(false));

        let worker = std::thread::Builder::new()
            .name(format!("netplay-io-{local_port}"))
            .spawn({
                let inbound = Arc::clone(&inbound);
                let stop = Arc::clone(&stop);
                move || receive_loop(&recv_socket, &inbound, &stop)
            })?;
        tracing::debug!(port = local_port, "started netplay I/O thread");

        Ok(Self {
            socket,
            send_buffer: vec![0; 1024],
            inbound,
            stop,
            worker: Some(worker),
            local_port,
        })
    }

    /// Messages waiting to be drained.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.inbound.lock().len()
    }
}

fn receive_loop(socket: &UdpSocket, inbound: &Inbound, stop: &AtomicBool) {
    let mut recv_buffer = [0_u8; RECV_BUFFER_SIZE];
    while !stop.load(Ordering::Acquire) {
        match socket.recv_from(&mut recv_buffer) {
            Ok((len, from)) => {
                let Some(bytes) = recv_buffer.get(..len) else {
                    continue;
                };
                if let Some(msg) = UdpNonBlockingSocket::decode_datagram(bytes, from) {
                    let mut queue = inbound.lock();
                    if queue.len() >= MAX_INBOUND_MESSAGES {
                        queue.pop_front();
                        report_violation!(
                            ViolationSeverity::Warning,
                            ViolationKind::NetworkProtocol,
                            "Inbound queue full ({} messages), dropping oldest",
                            MAX_INBOUND_MESSAGES
                        );
                    }
                    queue.push_back((from, msg));
                }
            }
            Err(ref err)
                if matches!(
                    err.kind(),
                    ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::ConnectionReset
                ) => {}
            Err(err) => {
                report_violation!(
                    ViolationSeverity::Error,
                    ViolationKind::NetworkProtocol,
                    "Unexpected socket error on I/O thread: {:?}: {}",
                    err.kind(),
                    err
                );
                std::thread::sleep(RECV_POLL_INTERVAL);
            }
        }
    }
    tracing::debug!("netplay I/O thread stopped");
}

impl NonBlockingSocket<SocketAddr> for ThreadedUdpSocket {
    fn send_to(&mut self, msg: &Message, addr: &SocketAddr) {
        UdpNonBlockingSocket::send_message(&self.socket, &mut self.send_buffer, msg, addr);
    }

    fn receive_all_messages(&mut self) -> Vec<(SocketAddr, Message)> {
        self.inbound.lock().drain(..).collect()
    }

    fn local_port(&self) -> Option<u16> {
        Some(self.local_port)
    }
}

impl Drop for ThreadedUdpSocket {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::warn!("netplay I/O thread panicked");
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::network::messages::{MessageBody, MessageHeader};
    use serial_test::serial;

    #[test]
    #[serial]
    fn io_thread_queues_messages() {
        let mut receiver = ThreadedUdpSocket::bind_to_port(0).unwrap();
        let mut sender = UdpNonBlockingSocket::bind_to_port(0).unwrap();
        let to = SocketAddr::from(([127, 0, 0, 1], receiver.local_port().unwrap()));
        let msg = Message {
            header: MessageHeader { magic: 3 },
            body: MessageBody::KeepAlive,
        };
        sender.send_to(&msg, &to);
        sender.send_to(&msg, &to);

        for _ in 0..100 {
            if receiver.pending() == 2 {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        let received = receiver.receive_all_messages();
        assert_eq!(received.len(), 2);
        assert!(received.iter().all(|(_, m)| *m == msg));
        assert!(receiver.receive_all_messages().is_empty());
    }

    #[test]
    #[serial]
    fn drop_stops_the_thread_and_frees_the_port() {
        let socket = ThreadedUdpSocket::bind_to_port(0).unwrap();
        let port = socket.local_port().unwrap();
        drop(socket);
        assert!(UdpSocket::bind(("0.0.0.0", port)).is_ok());
    }
}
