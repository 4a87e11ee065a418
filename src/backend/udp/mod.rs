//! Reliable UDP backend for the match relay.
//!
//! The guest-facing half lives here and runs on the emulation thread. The
//! protocol runs in a [`worker`] thread around a [`session::UdpSession`].

pub mod session;
pub mod worker;

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::mpsc::error::{TryRecvError, TrySendError};

use self::session::{REASON_CLOSE, REASON_HARD_RESET};
use self::worker::{WorkerHandle, WorkerOptions};
use super::NetShared;
use crate::core::{Backend, OpenTarget};

/// Match relay backend over UDP with seq/ack reliability.
#[derive(Debug)]
pub struct UdpBackend {
    shared: Arc<NetShared>,
    options: WorkerOptions,
    worker: Option<WorkerHandle>,
    /// Bytes received from the worker, not yet read by the guest.
    staged: VecDeque<u8>,
}

impl UdpBackend {
    /// Create an idle backend.
    pub fn new(shared: Arc<NetShared>, options: WorkerOptions) -> Self {
        Self {
            shared,
            options,
            worker: None,
            staged: VecDeque::new(),
        }
    }

    fn stop_worker(&mut self, reason: &str) {
        if let Some(worker) = self.worker.take() {
            worker.stop(reason);
        }
        self.staged.clear();
    }

    fn pull_inbound(&mut self) {
        let Some(worker) = self.worker.as_mut() else {
            return;
        };
        loop {
            match worker.inbound.try_recv() {
                Ok(chunk) => self.staged.extend(chunk),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
    }
}

impl Backend for UdpBackend {
    fn open(&mut self, target: &OpenTarget) -> bool {
        self.stop_worker(REASON_HARD_RESET);
        match WorkerHandle::spawn(target.authority(), self.options.clone(), self.shared.clone()) {
            Ok(worker) => {
                tracing::info!(%target, "mcs udp opened");
                self.worker = Some(worker);
                true
            }
            Err(e) => {
                tracing::warn!(%target, error = %e, "mcs udp open failed");
                false
            }
        }
    }

    fn close(&mut self) {
        self.stop_worker(REASON_CLOSE);
    }

    fn on_write(&mut self, data: &[u8]) -> usize {
        let Some(worker) = self.worker.as_ref() else {
            return 0;
        };
        if data.is_empty() {
            return 0;
        }
        match worker.outbound.try_send(data.to_vec()) {
            Ok(()) => data.len(),
            Err(TrySendError::Full(_)) => {
                tracing::debug!("mcs udp outbound channel full");
                0
            }
            Err(TrySendError::Closed(_)) => 0,
        }
    }

    fn on_read(&mut self, buf: &mut [u8]) -> usize {
        self.pull_inbound();
        let n = buf.len().min(self.staged.len());
        for (dst, src) in buf.iter_mut().zip(self.staged.drain(..n)) {
            *dst = src;
        }
        n
    }

    fn on_poll(&mut self) -> usize {
        self.pull_inbound();
        self.staged.len()
    }

    fn reset(&mut self) {
        self.stop_worker(REASON_HARD_RESET);
    }

    fn is_open(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| !w.is_finished())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{MCS_GREETING, SOCKET_TIMEOUT, UDP_TICK};
    use crate::wire::{HelloServerData, MessageType, Packet, PongData};
    use std::net::UdpSocket;
    use std::time::{Duration, Instant};

    fn options() -> WorkerOptions {
        WorkerOptions {
            tick: UDP_TICK,
            socket_timeout: SOCKET_TIMEOUT,
            outgoing_capacity: 50,
            channel_capacity: 64,
        }
    }

    fn wait_for(backend: &mut UdpBackend, n: usize) -> Vec<u8> {
        let deadline = Instant::now() + Duration::from_secs(5);
        while backend.on_poll() < n && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(2));
        }
        let mut buf = vec![0u8; backend.on_poll()];
        let read = backend.on_read(&mut buf);
        buf.truncate(read);
        buf
    }

    fn recv(server: &UdpSocket) -> (Packet, std::net::SocketAddr) {
        let mut buf = vec![0u8; 65535];
        let (len, from) = server.recv_from(&mut buf).unwrap();
        (Packet::decode(&buf[..len]).unwrap(), from)
    }

    fn recv_kind(server: &UdpSocket, kind: MessageType) -> (Packet, std::net::SocketAddr) {
        loop {
            let (pkt, from) = recv(server);
            if pkt.kind == kind {
                return (pkt, from);
            }
        }
    }

    #[test]
    fn test_open_failure_reports_false() {
        let mut backend = UdpBackend::new(Arc::new(NetShared::default()), options());
        assert!(!backend.open(&OpenTarget::match_server("no such host", 1)));
        assert!(!backend.is_open());
        assert_eq!(backend.on_write(b"data"), 0);
    }

    #[test]
    fn test_reset_before_guest_speaks_still_sends_fin() {
        let server = UdpSocket::bind("127.0.0.1:0").unwrap();
        server.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let port = server.local_addr().unwrap().port();

        let mut backend = UdpBackend::new(Arc::new(NetShared::default()), options());
        assert!(backend.open(&OpenTarget::match_server("127.0.0.1", port)));
        backend.reset();
        let (fin, _) = recv_kind(&server, MessageType::Fin);
        assert!(fin.session_id.is_empty());
        assert_eq!(fin.fin_data.unwrap().detail, REASON_HARD_RESET);
    }

    #[test]
    fn test_full_session_against_fake_relay() {
        let server = UdpSocket::bind("127.0.0.1:0").unwrap();
        server.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let port = server.local_addr().unwrap().port();

        let shared = Arc::new(NetShared::default());
        let mut backend = UdpBackend::new(shared.clone(), options());
        assert!(backend.open(&OpenTarget::match_server("127.0.0.1", port)));
        assert!(backend.is_open());

        assert_eq!(wait_for(&mut backend, MCS_GREETING.len()), MCS_GREETING.to_vec());

        let mut first = vec![0x82, 0x02];
        first.extend_from_slice(&[0u8; 10]);
        first.extend_from_slice(b"ABCDEFGH");
        assert_eq!(backend.on_write(&first), 20);

        let (hello, client) = recv_kind(&server, MessageType::HelloServer);
        assert_eq!(hello.session_id, "ABCDEFGH");
        let reply = Packet {
            kind: MessageType::HelloServer,
            hello_server_data: Some(HelloServerData {
                session_id: "ABCDEFGH".into(),
                ok: true,
                user_id: "me".into(),
            }),
            ..Default::default()
        };
        server.send_to(&reply.encode().unwrap(), client).unwrap();

        for _ in 0..10 {
            let (ping, _) = recv_kind(&server, MessageType::Ping);
            let pong = Packet {
                kind: MessageType::Pong,
                pong_data: Some(PongData {
                    timestamp: ping.ping_data.unwrap().timestamp,
                    ..Default::default()
                }),
                ..Default::default()
            };
            server.send_to(&pong.encode().unwrap(), client).unwrap();
        }

        assert_eq!(backend.on_write(&[0x04, 0x40, 0x00, 0x00]), 4);
        let battle = loop {
            let (pkt, _) = recv_kind(&server, MessageType::Battle);
            if !pkt.battle_data.is_empty() {
                break pkt;
            }
        };
        assert_eq!(battle.battle_data[0].body, vec![0x04, 0x40, 0x00, 0x00]);
        assert_eq!(battle.battle_data[0].user_id, "me");
        assert!(shared.max_lag() >= 5);

        let mut relay = Packet::battle("ABCDEFGH");
        relay.seq = 1;
        relay.ack = 1;
        relay.battle_data.push(crate::wire::BattleMessage {
            user_id: "peer".into(),
            seq: 1,
            body: vec![0x04, 0x41, 0x00, 0x00],
        });
        server.send_to(&relay.encode().unwrap(), client).unwrap();
        assert_eq!(wait_for(&mut backend, 4), vec![0x04, 0x41, 0x00, 0x00]);

        backend.reset();
        assert!(!backend.is_open());
        let (fin, _) = recv_kind(&server, MessageType::Fin);
        assert_eq!(fin.fin_data.unwrap().detail, REASON_HARD_RESET);
    }
}
