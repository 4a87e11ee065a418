//! Background worker driving one [`UdpSession`].
//!
//! The worker owns its socket and session exclusively and runs on a
//! dedicated thread with a current-thread runtime. It talks to the guest
//! side only through two bounded channels and the shared lag atomic.
//! Each tick it drains the socket, advances the state machine, and flushes
//! the datagrams the session asked for.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;

use super::session::{REASON_ERROR, SessionEvents, UdpSession, UdpState};
use crate::backend::NetShared;
use crate::core::{BackendError, BackendResult};
use crate::sync::OutgoingBuffer;
use crate::transport::{McsSocket, McsSocketBuilder, SessionClock};

/// Tunables for a worker.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Loop cadence.
    pub tick: Duration,
    /// Timeout for every socket call and channel hand-off.
    pub socket_timeout: Duration,
    /// Outgoing accumulator capacity.
    pub outgoing_capacity: usize,
    /// Capacity of each byte channel, in chunks.
    pub channel_capacity: usize,
}

/// Guest-side ends of a running worker.
#[derive(Debug)]
pub struct WorkerHandle {
    thread: Option<JoinHandle<()>>,
    stop_tx: watch::Sender<Option<String>>,
    /// Guest bytes towards the relay.
    pub outbound: mpsc::Sender<Vec<u8>>,
    /// Relay bytes towards the guest.
    pub inbound: mpsc::Receiver<Vec<u8>>,
}

impl WorkerHandle {
    /// Start a worker for the relay at `authority`.
    ///
    /// Blocks until the socket is resolved and bound, so a failure is
    /// reported to the caller instead of ending the worker silently.
    pub fn spawn(
        authority: String,
        options: WorkerOptions,
        shared: Arc<NetShared>,
    ) -> BackendResult<Self> {
        let (outbound_tx, outbound_rx) = mpsc::channel(options.channel_capacity.max(1));
        let (inbound_tx, inbound_rx) = mpsc::channel(options.channel_capacity.max(1));
        let (stop_tx, stop_rx) = watch::channel(None);
        let (ready_tx, ready_rx) = oneshot::channel::<BackendResult<()>>();

        let thread = std::thread::Builder::new()
            .name("mcs-udp".into())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e.into()));
                        return;
                    }
                };
                runtime.block_on(async move {
                    let socket = McsSocketBuilder::new()
                        .timeout(options.socket_timeout)
                        .connect(&authority)
                        .await;
                    let socket = match socket {
                        Ok(s) => s,
                        Err(e) => {
                            let _ = ready_tx.send(Err(e));
                            return;
                        }
                    };
                    tracing::info!(remote = %socket.remote_addr(), "mcs udp worker started");
                    let _ = ready_tx.send(Ok(()));
                    let worker = Worker {
                        socket,
                        session: UdpSession::new(OutgoingBuffer::with_capacity(
                            options.outgoing_capacity,
                        )),
                        outbound_rx,
                        inbound: InboundQueue::new(inbound_tx),
                        stop_rx,
                        shared,
                        options,
                    };
                    worker.run().await;
                });
            })
            .map_err(|e| BackendError::Worker(e.to_string()))?;

        let mut handle = Self {
            thread: Some(thread),
            stop_tx,
            outbound: outbound_tx,
            inbound: inbound_rx,
        };
        match ready_rx.blocking_recv() {
            Ok(Ok(())) => Ok(handle),
            Ok(Err(e)) => {
                handle.join();
                Err(e)
            }
            Err(_) => {
                handle.join();
                Err(BackendError::Worker("worker exited during startup".into()))
            }
        }
    }

    /// Whether the worker loop has exited on its own.
    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().is_none_or(|t| t.is_finished())
    }

    /// Ask the worker to send a Fin with `reason`, then wait for it to exit.
    pub fn stop(mut self, reason: &str) {
        let _ = self.stop_tx.send(Some(reason.to_string()));
        self.join();
    }

    fn join(&mut self) {
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            tracing::error!("mcs udp worker panicked");
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        if self.thread.is_some() {
            let _ = self.stop_tx.send(Some(super::session::REASON_HARD_RESET.to_string()));
            self.join();
        }
    }
}

/// Relay bytes on their way to the guest.
///
/// The receive filter has already advanced past anything queued here, so a
/// chunk the guest channel cannot take yet is held and offered again rather
/// than dropped.
#[derive(Debug)]
struct InboundQueue {
    tx: mpsc::Sender<Vec<u8>>,
    backlog: VecDeque<Vec<u8>>,
}

impl InboundQueue {
    fn new(tx: mpsc::Sender<Vec<u8>>) -> Self {
        Self {
            tx,
            backlog: VecDeque::new(),
        }
    }

    /// Queue `bytes` behind any backlog and hand over what fits.
    fn deliver(&mut self, bytes: Vec<u8>) {
        if !bytes.is_empty() {
            self.backlog.push_back(bytes);
        }
        self.flush();
    }

    /// Hand held chunks to the guest channel in order until it is full.
    fn flush(&mut self) {
        while let Some(chunk) = self.backlog.pop_front() {
            match self.tx.try_send(chunk) {
                Ok(()) => {}
                Err(TrySendError::Full(chunk)) => {
                    self.backlog.push_front(chunk);
                    tracing::debug!(held = self.backlog.len(), "guest is not draining inbound bytes");
                    return;
                }
                Err(TrySendError::Closed(_)) => {
                    tracing::debug!("guest side closed");
                    self.backlog.clear();
                    return;
                }
            }
        }
    }

    fn held(&self) -> usize {
        self.backlog.len()
    }
}

struct Worker {
    socket: McsSocket,
    session: UdpSession,
    outbound_rx: mpsc::Receiver<Vec<u8>>,
    inbound: InboundQueue,
    stop_rx: watch::Receiver<Option<String>>,
    shared: Arc<NetShared>,
    options: WorkerOptions,
}

impl Worker {
    async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.options.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let clock = SessionClock::new();
        let mut pending: VecDeque<u8> = VecDeque::new();

        let reason = loop {
            ticker.tick().await;
            if let Some(reason) = self.stop_rx.borrow().clone() {
                break reason;
            }

            while let Ok(chunk) = self.outbound_rx.try_recv() {
                pending.extend(chunk);
            }
            self.inbound.flush();

            if let Err(e) = self.drain_socket(&clock).await {
                tracing::warn!(error = %e, "mcs udp receive failed");
                break REASON_ERROR.to_string();
            }

            let ev = self.session.step(clock.now_ms(), &mut pending);
            self.apply(ev).await;

            if self.session.state() == UdpState::End {
                tracing::info!("mcs udp session ended");
                return;
            }
        };

        if let Some(fin) = self.session.close(&reason) {
            if let Err(e) = self.socket.send_packet(&fin).await {
                tracing::debug!(error = %e, "fin not sent");
            }
        }
        tracing::info!(%reason, "mcs udp worker stopped");
    }

    async fn drain_socket(&mut self, clock: &SessionClock) -> BackendResult<()> {
        loop {
            match self.socket.try_recv_packet() {
                Ok(Some(packet)) => {
                    let ev = self.session.on_packet(packet, clock.now_ms());
                    self.apply(ev).await;
                }
                Ok(None) => return Ok(()),
                Err(e) if e.is_silent_drop() => {
                    tracing::debug!(error = %e, "dropping datagram");
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn apply(&mut self, ev: SessionEvents) {
        if let Some(lag) = ev.max_lag {
            self.shared.set_max_lag(lag);
        }
        self.inbound.deliver(ev.deliver);
        for packet in &ev.send {
            if let Err(e) = self.socket.send_packet(packet).await {
                tracing::warn!(error = %e, kind = ?packet.kind, "mcs udp send failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(rx: &mut mpsc::Receiver<Vec<u8>>) -> Vec<u8> {
        let mut out = Vec::new();
        while let Ok(chunk) = rx.try_recv() {
            out.extend(chunk);
        }
        out
    }

    #[test]
    fn test_full_channel_holds_bytes_in_order() {
        let (tx, mut rx) = mpsc::channel(1);
        let mut inbound = InboundQueue::new(tx);
        inbound.deliver(vec![1]);
        inbound.deliver(vec![2, 3]);
        inbound.deliver(Vec::new());
        inbound.deliver(vec![4]);
        assert_eq!(inbound.held(), 2);

        let mut got = drain(&mut rx);
        while inbound.held() > 0 {
            inbound.flush();
            got.extend(drain(&mut rx));
        }
        assert_eq!(got, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_closed_channel_discards_backlog() {
        let (tx, rx) = mpsc::channel(1);
        let mut inbound = InboundQueue::new(tx);
        inbound.deliver(vec![1]);
        inbound.deliver(vec![2]);
        assert_eq!(inbound.held(), 1);
        drop(rx);
        inbound.flush();
        assert_eq!(inbound.held(), 0);
    }
}
