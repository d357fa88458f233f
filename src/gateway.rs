use crate::channel::{
    BusMode, Channel, ChannelState, RxCallback, TimestampHandler, TransceiverMode, TxErrorCallback,
};
use crate::filter::{FilterId, FilterMode, FilterTable};
use crate::frame::{BusHandle, Frame};

/// Failure causes of the one-time configuration path. The per-frame data
/// path never reports errors; a full or empty queue is an ordinary `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConfigError {
    #[error("bus handle does not address a channel of this gateway")]
    InvalidBus,
    #[error("queue storage must hold at least one frame")]
    EmptyQueue,
    #[error("both queues must be referenced before channel init")]
    QueueNotReferenced,
    #[error("structural changes require the bus to be off")]
    BusActive,
    #[error("channel is not initialized")]
    NotInitialized,
    #[error("acceptance filter table is full")]
    TableFull,
}

/// The gateway core: a fixed set of CAN channels indexed by [`BusHandle`]
/// plus the acceptance filter table they share.
///
/// One `Gateway` is created at startup (typically in a `static`) and handed
/// by reference to the main loop and to the platform's interrupt handlers.
/// Methods are split by calling context: the configuration surface and the
/// `tx_slot`/`rx_slot` data path belong to main level, while
/// [`receive_from_wire`], [`next_transmit`], [`transmit_done`] and
/// [`record_tx_error`] are the interrupt-level half that the platform's
/// handlers drive.
///
/// [`receive_from_wire`]: Gateway::receive_from_wire
/// [`next_transmit`]: Gateway::next_transmit
/// [`transmit_done`]: Gateway::transmit_done
/// [`record_tx_error`]: Gateway::record_tx_error
pub struct Gateway<'q, const N: usize> {
    channels: [Channel<'q>; N],
    filters: FilterTable,
}

impl<'q, const N: usize> Gateway<'q, N> {
    pub const fn new() -> Self {
        Self {
            channels: [const { Channel::new() }; N],
            filters: FilterTable::new(),
        }
    }

    /// Direct access to one channel, for callers that prefer to hold the
    /// channel reference instead of repeating the bus handle.
    pub fn channel(&self, bus: BusHandle) -> Result<&Channel<'q>, ConfigError> {
        self.channels.get(bus.index()).ok_or(ConfigError::InvalidBus)
    }

    /* Queue attachment and lifecycle */

    /// References a frame array as TX queue of `bus`. The queue size is up
    /// to the application.
    pub fn reference_tx_queue(
        &self,
        bus: BusHandle,
        storage: &'q mut [Frame],
    ) -> Result<(), ConfigError> {
        self.channel(bus)?.reference_tx_queue(storage)
    }

    /// References a frame array as RX queue of `bus`.
    pub fn reference_rx_queue(
        &self,
        bus: BusHandle,
        storage: &'q mut [Frame],
    ) -> Result<(), ConfigError> {
        self.channel(bus)?.reference_rx_queue(storage)
    }

    /// Initializes `bus` with a bit timing value (see [`timing`](crate::timing)).
    /// Queues must be referenced before; this is done before
    /// [`set_bus_mode`](Gateway::set_bus_mode).
    pub fn init_channel(&self, bus: BusHandle, timing: u32) -> Result<(), ConfigError> {
        self.channel(bus)?.init_channel(timing)
    }

    /// Reinitializes `bus`, dropping its queue references.
    pub fn reinit_channel(&self, bus: BusHandle) -> Result<(), ConfigError> {
        self.channel(bus)?.reinit_channel()
    }

    /// Gets `bus` involved into (or out of) bus activity. With
    /// [`BusMode::ListenOnly`] the application cannot send.
    pub fn set_bus_mode(&self, bus: BusHandle, mode: BusMode) -> Result<(), ConfigError> {
        self.channel(bus)?.set_bus_mode(mode)
    }

    pub fn bus_mode(&self, bus: BusHandle) -> Result<BusMode, ConfigError> {
        Ok(self.channel(bus)?.bus_mode())
    }

    pub fn set_transceiver_mode(
        &self,
        bus: BusHandle,
        mode: TransceiverMode,
    ) -> Result<(), ConfigError> {
        self.channel(bus)?.set_transceiver_mode(mode);
        Ok(())
    }

    /// Sets the transmit error limit used for bus-off handling on `bus`.
    pub fn set_error_limit(&self, bus: BusHandle, limit: u8) -> Result<(), ConfigError> {
        self.channel(bus)?.set_error_limit(limit);
        Ok(())
    }

    pub fn set_rx_callback(
        &self,
        bus: BusHandle,
        callback: Option<RxCallback>,
    ) -> Result<(), ConfigError> {
        self.channel(bus)?.set_rx_callback(callback)
    }

    pub fn set_tx_error_callback(
        &self,
        bus: BusHandle,
        callback: Option<TxErrorCallback>,
    ) -> Result<(), ConfigError> {
        self.channel(bus)?.set_tx_error_callback(callback)
    }

    pub fn set_timestamp_handler(
        &self,
        bus: BusHandle,
        handler: Option<TimestampHandler>,
    ) -> Result<(), ConfigError> {
        self.channel(bus)?.set_timestamp_handler(handler)
    }

    pub fn set_channel_info(
        &self,
        bus: BusHandle,
        info: Option<&'static str>,
    ) -> Result<(), ConfigError> {
        self.channel(bus)?.set_channel_info(info)
    }

    pub fn channel_info(&self, bus: BusHandle) -> Result<Option<&'static str>, ConfigError> {
        Ok(self.channel(bus)?.channel_info())
    }

    /* Acceptance filtering */

    /// Clears the acceptance filter table. Returns with filtering off; use
    /// [`add_filter`](Gateway::add_filter) and then
    /// [`set_filter_mode`](Gateway::set_filter_mode) to enable it.
    pub fn init_filters(&self) {
        self.filters.init();
    }

    /// Adds an id or id range for `bus` to the acceptance table. Returns
    /// with filtering off.
    pub fn add_filter(&self, bus: BusHandle, id: FilterId) -> Result<(), ConfigError> {
        if bus.index() >= N {
            return Err(ConfigError::InvalidBus);
        }
        self.filters.add(bus, id)
    }

    pub fn set_filter_mode(&self, mode: FilterMode) {
        self.filters.set_mode(mode);
    }

    pub fn filter_mode(&self) -> FilterMode {
        self.filters.mode()
    }

    /* Main-level data path */

    /// Returns a free slot of the TX queue of `bus`, or `None` when the
    /// queue is full, the channel is listen-only, or the handle is invalid.
    pub fn tx_slot(&self, bus: BusHandle) -> Option<&mut Frame> {
        self.channels.get(bus.index())?.tx_slot()
    }

    /// Queues the slot returned by the last [`tx_slot`](Gateway::tx_slot)
    /// call for transmission on `bus`.
    pub fn commit_tx(&self, bus: BusHandle) {
        if let Some(channel) = self.channels.get(bus.index()) {
            channel.commit_tx();
        }
    }

    /// Returns the oldest received frame of `bus`, or `None` when the RX
    /// queue is empty.
    pub fn rx_slot(&self, bus: BusHandle) -> Option<&Frame> {
        self.channels.get(bus.index())?.rx_slot()
    }

    /// Frees the slot returned by the last [`rx_slot`](Gateway::rx_slot)
    /// call on `bus`.
    pub fn release_rx(&self, bus: BusHandle) {
        if let Some(channel) = self.channels.get(bus.index()) {
            channel.release_rx();
        }
    }

    /// Sends a message on `bus`: acquires a TX slot, copies `frame` into it
    /// and queues it for transmission. Returns `false` when the TX queue is
    /// full (the frame is not sent).
    pub fn write(&self, bus: BusHandle, frame: &Frame) -> bool {
        let Some(slot) = self.tx_slot(bus) else {
            return false;
        };
        slot.copy_from(frame);
        self.commit_tx(bus);
        true
    }

    /// Reads one message from `bus`, freeing its queue slot. Returns `None`
    /// when nothing was received.
    pub fn read(&self, bus: BusHandle) -> Option<Frame> {
        let frame = *self.rx_slot(bus)?;
        self.release_rx(bus);
        Some(frame)
    }

    /* Interrupt-level data path */

    /// Interrupt level: delivers a frame picked up on the wire of `bus` into
    /// its RX queue, subject to the acceptance filter, the RX callback and
    /// the timestamp handler. Returns `true` when the frame became visible
    /// in the queue.
    pub fn receive_from_wire(&self, bus: BusHandle, frame: &Frame) -> bool {
        let Ok(channel) = self.channel(bus) else {
            return false;
        };
        if channel.state() != ChannelState::Initialized || channel.bus_mode() == BusMode::Off {
            return false;
        }
        if !self.filters.matches(bus, frame.id()) {
            return false;
        }
        channel.deliver(bus, frame)
    }

    /// Interrupt level: the oldest frame queued for transmission on `bus`.
    pub fn next_transmit(&self, bus: BusHandle) -> Option<&Frame> {
        self.channels.get(bus.index())?.next_transmit()
    }

    /// Interrupt level: frees the frame returned by
    /// [`next_transmit`](Gateway::next_transmit) once it is on the wire.
    pub fn transmit_done(&self, bus: BusHandle) {
        if let Some(channel) = self.channels.get(bus.index()) {
            channel.transmit_done();
        }
    }

    /// Interrupt level: records one transmit error on `bus`, running bus-off
    /// handling when the channel's error limit is reached.
    pub fn record_tx_error(&self, bus: BusHandle) {
        if let Some(channel) = self.channels.get(bus.index()) {
            channel.record_tx_error(bus);
        }
    }
}

impl<const N: usize> Default for Gateway<'_, N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use embedded_can::StandardId;

    use crate::{
        BusHandle, BusMode, ConfigError, FilterId, FilterMode, Frame, Gateway,
    };

    fn sid(raw: u16) -> StandardId {
        StandardId::new(raw).unwrap()
    }

    #[test]
    fn invalid_handles_are_rejected() {
        let gateway: Gateway<'_, 2> = Gateway::new();

        assert_eq!(
            gateway.set_bus_mode(BusHandle::BUS3, BusMode::On),
            Err(ConfigError::InvalidBus)
        );
        assert_eq!(
            gateway.add_filter(BusHandle::BUS4, FilterId::Standard(sid(1))),
            Err(ConfigError::InvalidBus)
        );
        assert!(gateway.tx_slot(BusHandle::BUS3).is_none());
        assert!(gateway.read(BusHandle::BUS3).is_none());
        assert!(!gateway.write(BusHandle::BUS3, &Frame::EMPTY));
    }

    #[test]
    fn write_and_drain_through_the_tx_queue() {
        let mut tx = [Frame::EMPTY; 2];
        let mut rx = [Frame::EMPTY; 2];
        let gateway: Gateway<'_, 1> = Gateway::new();

        gateway.reference_tx_queue(BusHandle::BUS1, &mut tx).unwrap();
        gateway.reference_rx_queue(BusHandle::BUS1, &mut rx).unwrap();
        gateway.init_channel(BusHandle::BUS1, 0).unwrap();
        gateway.set_bus_mode(BusHandle::BUS1, BusMode::On).unwrap();

        let frame = Frame::new(sid(0x100), &[1, 2]).unwrap();
        assert!(gateway.write(BusHandle::BUS1, &frame));
        assert!(gateway.write(BusHandle::BUS1, &frame));
        // queue of two is now full
        assert!(!gateway.write(BusHandle::BUS1, &frame));
        assert!(gateway.channel(BusHandle::BUS1).unwrap().tx_queue().is_full());

        // the transmit interrupt drains in order
        let queued = gateway.next_transmit(BusHandle::BUS1).unwrap();
        assert_eq!(queued.id(), sid(0x100).into());
        assert_eq!(queued.data(), &[1, 2]);
        gateway.transmit_done(BusHandle::BUS1);
        gateway.transmit_done(BusHandle::BUS1);

        assert!(gateway.next_transmit(BusHandle::BUS1).is_none());
        assert!(gateway.write(BusHandle::BUS1, &frame));
    }

    #[test]
    fn reception_respects_the_filter_table() {
        let mut tx = [Frame::EMPTY; 2];
        let mut rx = [Frame::EMPTY; 4];
        let gateway: Gateway<'_, 1> = Gateway::new();

        gateway.reference_tx_queue(BusHandle::BUS1, &mut tx).unwrap();
        gateway.reference_rx_queue(BusHandle::BUS1, &mut rx).unwrap();
        gateway.init_channel(BusHandle::BUS1, 0).unwrap();
        gateway.set_bus_mode(BusHandle::BUS1, BusMode::On).unwrap();

        gateway.init_filters();
        gateway
            .add_filter(BusHandle::BUS1, FilterId::Standard(sid(0x100)))
            .unwrap();

        // table mutation left filtering off: nothing is delivered
        let wanted = Frame::new(sid(0x100), &[]).unwrap();
        assert!(!gateway.receive_from_wire(BusHandle::BUS1, &wanted));

        gateway.set_filter_mode(FilterMode::Filtered);
        let unwanted = Frame::new(sid(0x200), &[]).unwrap();
        assert!(gateway.receive_from_wire(BusHandle::BUS1, &wanted));
        assert!(!gateway.receive_from_wire(BusHandle::BUS1, &unwanted));

        assert_eq!(gateway.read(BusHandle::BUS1).unwrap().id(), sid(0x100).into());
        assert!(gateway.read(BusHandle::BUS1).is_none());
    }

    #[test]
    fn reception_requires_the_bus_to_be_up() {
        let mut tx = [Frame::EMPTY; 2];
        let mut rx = [Frame::EMPTY; 2];
        let gateway: Gateway<'_, 1> = Gateway::new();

        let frame = Frame::new(sid(0x100), &[]).unwrap();

        // uninitialized channel receives nothing
        assert!(!gateway.receive_from_wire(BusHandle::BUS1, &frame));

        gateway.reference_tx_queue(BusHandle::BUS1, &mut tx).unwrap();
        gateway.reference_rx_queue(BusHandle::BUS1, &mut rx).unwrap();
        gateway.init_channel(BusHandle::BUS1, 0).unwrap();
        gateway.set_filter_mode(FilterMode::Bypass);

        // initialized but still off the bus
        assert!(!gateway.receive_from_wire(BusHandle::BUS1, &frame));

        gateway.set_bus_mode(BusHandle::BUS1, BusMode::On).unwrap();
        assert!(gateway.receive_from_wire(BusHandle::BUS1, &frame));
    }

    #[test]
    fn received_frames_carry_their_bus() {
        let mut tx1 = [Frame::EMPTY; 2];
        let mut rx1 = [Frame::EMPTY; 2];
        let mut tx2 = [Frame::EMPTY; 2];
        let mut rx2 = [Frame::EMPTY; 2];
        let gateway: Gateway<'_, 2> = Gateway::new();

        for (bus, tx, rx) in [
            (BusHandle::BUS1, &mut tx1, &mut rx1),
            (BusHandle::BUS2, &mut tx2, &mut rx2),
        ] {
            gateway.reference_tx_queue(bus, tx).unwrap();
            gateway.reference_rx_queue(bus, rx).unwrap();
            gateway.init_channel(bus, 0).unwrap();
            gateway.set_bus_mode(bus, BusMode::On).unwrap();
        }
        gateway.set_filter_mode(FilterMode::Bypass);

        let frame = Frame::new(sid(0x100), &[]).unwrap();
        assert!(gateway.receive_from_wire(BusHandle::BUS2, &frame));

        assert_eq!(gateway.read(BusHandle::BUS2).unwrap().bus(), BusHandle::BUS2);
    }
}
