use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use crate::protocol::Envelope;

/// Frames queued for a connection. The socket itself is owned by the
/// connection task; everything else talks to a peer through its outbox.
#[derive(Debug, Clone)]
pub enum OutboundFrame {
    Envelope(Envelope),
    Binary(Vec<u8>),
    Ping,
    Close { code: u16, reason: &'static str },
}

pub type Outbox = mpsc::UnboundedSender<OutboundFrame>;

/// One connected client as the registry sees it: identity, outbox, the
/// lobby it joined (empty until then) and its join-deadline timer.
pub struct Peer {
    pub identity: u32,
    pub outbox: Outbox,
    pub lobby: String,
    pub join_deadline: Option<AbortHandle>,
}

impl Peer {
    pub fn new(identity: u32, outbox: Outbox) -> Self {
        Self {
            identity,
            outbox,
            lobby: String::new(),
            join_deadline: None,
        }
    }

    /// Queues a frame. A closed outbox means the connection task is already
    /// tearing down, so the frame is silently dropped.
    pub fn send(&self, frame: OutboundFrame) {
        let _ = self.outbox.send(frame);
    }

    pub fn close(&self, code: u16, reason: &'static str) {
        self.send(OutboundFrame::Close { code, reason });
    }

    /// Idempotent: called on the first successful join and again on close.
    pub fn cancel_join_deadline(&mut self) {
        if let Some(handle) = self.join_deadline.take() {
            handle.abort();
        }
    }
}

/// Draws a random identity in the 31-bit positive range. `0` and `1` are
/// never issued: `1` is the reserved in-lobby address of the host.
pub fn random_identity() -> u32 {
    rand::thread_rng().gen_range(2..(1u32 << 31))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_identities_stay_in_the_31_bit_range_and_skip_reserved_values() {
        for _ in 0..10_000 {
            let identity = random_identity();
            assert!(identity >= 2);
            assert!(identity < (1 << 31));
        }
    }

    #[tokio::test]
    async fn frames_sent_to_a_peer_arrive_on_its_outbox() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let peer = Peer::new(42, tx);

        peer.send(OutboundFrame::Ping);
        peer.close(4000, "Have not joined lobby yet");

        assert!(matches!(rx.recv().await, Some(OutboundFrame::Ping)));
        assert!(matches!(
            rx.recv().await,
            Some(OutboundFrame::Close { code: 4000, .. })
        ));
    }

    #[tokio::test]
    async fn sending_after_the_receiver_is_gone_does_not_panic() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let peer = Peer::new(7, tx);
        peer.send(OutboundFrame::Ping);
    }
}
