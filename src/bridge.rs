use embedded_can::{Id, StandardId};

use crate::frame::{BusHandle, Frame, FrameFlags};
use crate::gateway::Gateway;

/// Identifier reserved for gateway housekeeping traffic. Frames carrying it
/// stay on their own bus; the bridge never forwards them.
pub const HOUSEKEEPING_ID: StandardId = match StandardId::new(0x2E4) {
    Some(id) => id,
    None => panic!("housekeeping id out of range"),
};

/// Identifier of the greeting message transmitted at module start.
pub const GREETING_ID: StandardId = match StandardId::new(0x123) {
    Some(id) => id,
    None => panic!("greeting id out of range"),
};

/// Per-channel activity indicator driven by the bridge, typically a bi-color
/// LED. `active` alternates with every frame forwarded off the channel, so a
/// busy channel blinks.
pub trait StatusIndicator {
    fn set_activity(&mut self, bus: BusHandle, active: bool);
}

/// No indicator attached.
impl StatusIndicator for () {
    fn set_activity(&mut self, _bus: BusHandle, _active: bool) {}
}

/// The store-and-forward application: moves frames between the RX queue of
/// each channel and the TX queue of its peer.
///
/// One [`poll`](Bridge::poll) call services every channel once, so fairness
/// across channels is round-robin by construction. The bridge never blocks
/// and never buffers frames of its own: when a destination TX queue is full
/// the frame is silently dropped.
pub struct Bridge<'g, 'q, I, const N: usize> {
    gateway: &'g Gateway<'q, N>,
    peers: [BusHandle; N],
    activity: [bool; N],
    indicator: I,
}

impl<'g, 'q, I: StatusIndicator, const N: usize> Bridge<'g, 'q, I, N> {
    /// Creates a bridge with an explicit peer per channel: a frame received
    /// on channel `i` is forwarded to `peers[i]`.
    pub fn new(gateway: &'g Gateway<'q, N>, peers: [BusHandle; N], indicator: I) -> Self {
        Self {
            gateway,
            peers,
            activity: [false; N],
            indicator,
        }
    }

    /// Services every channel once: read one frame if present, apply the
    /// forwarding rule, hand the copy to the peer channel.
    pub fn poll(&mut self) {
        for index in 0..N {
            self.forward_one(BusHandle::new(index as u8));
        }
    }

    fn forward_one(&mut self, bus: BusHandle) {
        let Some(frame) = self.gateway.read(bus) else {
            return;
        };
        if !Self::should_forward(&frame) {
            return;
        }

        let toggle = &mut self.activity[bus.index()];
        *toggle = !*toggle;
        self.indicator.set_activity(bus, *toggle);

        // Full peer queue: the frame is dropped, the loop is never held up.
        let _ = self.gateway.write(self.peers[bus.index()], &frame);
    }

    /// The forwarding rule: plain standard data frames only, and never the
    /// housekeeping id. This is a content rule on top of whatever the
    /// acceptance filter table already let through.
    fn should_forward(frame: &Frame) -> bool {
        match frame.id() {
            Id::Standard(id) => id != HOUSEKEEPING_ID && frame.flags() == FrameFlags::NONE,
            Id::Extended(_) => false,
        }
    }

    /// Transmits the greeting message on `bus`: id 0x123, eight bytes
    /// counting up through the words 0x67452301 / 0xEFCDAB89. Returns
    /// `false` when the TX queue had no room.
    pub fn send_greeting(&self, bus: BusHandle) -> bool {
        let Some(mut frame) = Frame::new(GREETING_ID, &[0; 8]) else {
            return false;
        };
        frame.set_word(0, 0x6745_2301);
        frame.set_word(1, 0xEFCD_AB89);

        self.gateway.write(bus, &frame)
    }
}

impl<'g, 'q, I: StatusIndicator> Bridge<'g, 'q, I, 2> {
    /// The classic two-channel gateway: bus 1 forwards to bus 2 and back.
    pub fn two_way(gateway: &'g Gateway<'q, 2>, indicator: I) -> Self {
        Self::new(gateway, [BusHandle::BUS2, BusHandle::BUS1], indicator)
    }
}
