use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU8, Ordering};

use num_enum::{FromPrimitive, IntoPrimitive};

use crate::frame::{BusHandle, Frame};
use crate::gateway::ConfigError;
use crate::ring::FrameRing;
use crate::DEFAULT_TX_ERROR_LIMIT;

/// Bus activity mode, set with
/// [`Gateway::set_bus_mode`](crate::Gateway::set_bus_mode).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, IntoPrimitive, FromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum BusMode {
    /// Involved in bus activity: transmitting and receiving.
    On = 0,
    /// Reset mode, off the bus.
    #[default]
    Off = 1,
    /// Receiving only; transmit slots are refused.
    ListenOnly = 2,
}

/// Electrical mode of the channel's transceiver. Recorded by the core and
/// handed through to the platform; it has no effect on the queue protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, IntoPrimitive, FromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum TransceiverMode {
    #[default]
    Normal = 0,
    /// High-voltage wakeup (single-wire transceivers only).
    Wakeup = 1,
    /// Power down for system shutdown.
    Powerdown = 2,
    /// No slope control (single-wire transceivers only).
    Highspeed = 4,
    /// Standby, low power.
    Standby = 5,
}

/// Lifecycle state of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, IntoPrimitive, FromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum ChannelState {
    #[default]
    Uninitialized = 0,
    /// Both queues are referenced; the channel can be initialized.
    QueuesReferenced = 1,
    /// Bit timing is programmed; bus modes may be set.
    Initialized = 2,
}

/// Decision of an RX callback about a freshly received frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RxVerdict {
    /// Pass the frame on to the RX queue.
    Keep,
    /// Drop the frame before it becomes visible.
    Skip,
}

/// Called on interrupt level for every received frame, after acceptance
/// filtering and before the frame becomes visible in the RX queue. The frame
/// is filled in and may be modified.
pub type RxCallback = fn(&mut Frame) -> RxVerdict;

/// Called on interrupt level when a channel's transmit errors reach its
/// error limit. The handler is then responsible for recovering the bus.
pub type TxErrorCallback = fn(BusHandle);

/// Supplies the timestamp recorded on received frames.
pub type TimestampHandler = fn() -> u32;

#[derive(Clone, Copy)]
struct ChannelConfig {
    timing: u32,
    info: Option<&'static str>,
    rx_callback: Option<RxCallback>,
    tx_error_callback: Option<TxErrorCallback>,
    timestamp_handler: Option<TimestampHandler>,
}

/// One CAN channel: a TX/RX queue pair plus channel-level state.
///
/// All operations take `&self`; the mode and state fields are atomics so a
/// main-level transition is visible to interrupt-level queue traffic that is
/// already in flight. Everything else (callbacks, timing, info text) may only
/// change while the bus is not [`BusMode::On`], which is what keeps the plain
/// cells race-free on the single-core model.
pub struct Channel<'q> {
    tx: FrameRing<'q>,
    rx: FrameRing<'q>,
    state: AtomicU8,
    bus_mode: AtomicU8,
    transceiver_mode: AtomicU8,
    error_limit: AtomicU8,
    tx_errors: AtomicU8,
    config: UnsafeCell<ChannelConfig>,
}

// SAFETY: the rings synchronize themselves (see `FrameRing`); the remaining
// shared fields are atomics except `config`, whose mutation is gated on the
// bus not being `On` while interrupt-level readers only run with the bus on.
unsafe impl Sync for Channel<'_> {}

impl<'q> Channel<'q> {
    pub(crate) const fn new() -> Self {
        Self {
            tx: FrameRing::new(),
            rx: FrameRing::new(),
            state: AtomicU8::new(ChannelState::Uninitialized as u8),
            bus_mode: AtomicU8::new(BusMode::Off as u8),
            transceiver_mode: AtomicU8::new(TransceiverMode::Normal as u8),
            error_limit: AtomicU8::new(DEFAULT_TX_ERROR_LIMIT),
            tx_errors: AtomicU8::new(0),
            config: UnsafeCell::new(ChannelConfig {
                timing: 0,
                info: None,
                rx_callback: None,
                tx_error_callback: None,
                timestamp_handler: None,
            }),
        }
    }

    /// Read access to the TX queue, e.g. for occupancy diagnostics.
    pub fn tx_queue(&self) -> &FrameRing<'q> {
        &self.tx
    }

    /// Read access to the RX queue.
    pub fn rx_queue(&self) -> &FrameRing<'q> {
        &self.rx
    }

    pub fn state(&self) -> ChannelState {
        ChannelState::from(self.state.load(Ordering::Acquire))
    }

    pub fn bus_mode(&self) -> BusMode {
        BusMode::from(self.bus_mode.load(Ordering::Acquire))
    }

    pub fn transceiver_mode(&self) -> TransceiverMode {
        TransceiverMode::from(self.transceiver_mode.load(Ordering::Acquire))
    }

    /// The bit timing value programmed by the last
    /// [`init_channel`](Channel::init_channel).
    pub fn bit_timing(&self) -> u32 {
        // SAFETY: main-level read; written only on main level.
        unsafe { (*self.config.get()).timing }
    }

    fn require_bus_not_on(&self) -> Result<(), ConfigError> {
        if self.bus_mode() == BusMode::On {
            return Err(ConfigError::BusActive);
        }
        Ok(())
    }

    fn update_reference_state(&self) {
        if self.state() == ChannelState::Uninitialized
            && self.tx.is_attached()
            && self.rx.is_attached()
        {
            self.state
                .store(ChannelState::QueuesReferenced.into(), Ordering::Release);
        }
    }

    /// References `storage` as this channel's TX queue. The queue size is
    /// the storage length and is up to the application.
    pub fn reference_tx_queue(&self, storage: &'q mut [Frame]) -> Result<(), ConfigError> {
        self.require_bus_not_on()?;
        self.tx.attach(storage)?;
        self.update_reference_state();
        Ok(())
    }

    /// References `storage` as this channel's RX queue.
    pub fn reference_rx_queue(&self, storage: &'q mut [Frame]) -> Result<(), ConfigError> {
        self.require_bus_not_on()?;
        self.rx.attach(storage)?;
        self.update_reference_state();
        Ok(())
    }

    /// Sets up the channel with the given bit timing. Both queues must be
    /// referenced before. This is done before
    /// [`set_bus_mode`](Channel::set_bus_mode).
    pub fn init_channel(&self, timing: u32) -> Result<(), ConfigError> {
        self.require_bus_not_on()?;
        if !(self.tx.is_attached() && self.rx.is_attached()) {
            return Err(ConfigError::QueueNotReferenced);
        }

        // SAFETY: bus is not on, so no interrupt-level reader is active.
        unsafe { (*self.config.get()).timing = timing };
        self.tx_errors.store(0, Ordering::Relaxed);
        self.state
            .store(ChannelState::Initialized.into(), Ordering::Release);
        Ok(())
    }

    /// Tears down the queue references and returns the channel to
    /// [`ChannelState::Uninitialized`]. Reference fresh queue storage before
    /// using the channel again.
    pub fn reinit_channel(&self) -> Result<(), ConfigError> {
        self.require_bus_not_on()?;
        self.tx.detach();
        self.rx.detach();
        self.tx_errors.store(0, Ordering::Relaxed);
        self.bus_mode.store(BusMode::Off.into(), Ordering::Release);
        self.state
            .store(ChannelState::Uninitialized.into(), Ordering::Release);
        Ok(())
    }

    /// Gets the channel involved into (or out of) bus activity.
    pub fn set_bus_mode(&self, mode: BusMode) -> Result<(), ConfigError> {
        if self.state() != ChannelState::Initialized {
            return Err(ConfigError::NotInitialized);
        }
        self.bus_mode.store(mode.into(), Ordering::Release);
        Ok(())
    }

    pub fn set_transceiver_mode(&self, mode: TransceiverMode) {
        self.transceiver_mode.store(mode.into(), Ordering::Release);
    }

    /// Sets the transmit error limit used for bus-off handling.
    pub fn set_error_limit(&self, limit: u8) {
        self.error_limit.store(limit, Ordering::Release);
    }

    /// Installs or clears the per-frame RX callback. `None` restores the
    /// default (every accepted frame is queued).
    pub fn set_rx_callback(&self, callback: Option<RxCallback>) -> Result<(), ConfigError> {
        self.require_bus_not_on()?;
        // SAFETY: bus is not on, so no interrupt-level reader is active.
        unsafe { (*self.config.get()).rx_callback = callback };
        Ok(())
    }

    /// Installs or clears the TX error handler. `None` restores the default:
    /// an automatic bus-off/bus-on cycle when the error limit is reached.
    pub fn set_tx_error_callback(&self, callback: Option<TxErrorCallback>) -> Result<(), ConfigError> {
        self.require_bus_not_on()?;
        // SAFETY: as for `set_rx_callback`.
        unsafe { (*self.config.get()).tx_error_callback = callback };
        Ok(())
    }

    /// Installs or clears the timestamp handler. With a handler installed,
    /// every delivered frame carries a timestamp; `None` delivers plain
    /// frames.
    pub fn set_timestamp_handler(&self, handler: Option<TimestampHandler>) -> Result<(), ConfigError> {
        self.require_bus_not_on()?;
        // SAFETY: as for `set_rx_callback`.
        unsafe { (*self.config.get()).timestamp_handler = handler };
        Ok(())
    }

    /// Sets a text info label on the channel. No behavioral effect.
    pub fn set_channel_info(&self, info: Option<&'static str>) -> Result<(), ConfigError> {
        self.require_bus_not_on()?;
        // SAFETY: as for `set_rx_callback`.
        unsafe { (*self.config.get()).info = info };
        Ok(())
    }

    pub fn channel_info(&self) -> Option<&'static str> {
        // SAFETY: main-level read; written only on main level.
        unsafe { (*self.config.get()).info }
    }

    /* Main-level data path */

    /// Returns the next free slot of the TX queue, or `None` when the queue
    /// is full or the channel is listen-only. Fill the slot, then make it
    /// eligible for transmission with [`commit_tx`](Channel::commit_tx).
    pub fn tx_slot(&self) -> Option<&mut Frame> {
        if self.bus_mode() == BusMode::ListenOnly {
            return None;
        }
        self.tx.grant()
    }

    /// Queues the slot returned by the last [`tx_slot`](Channel::tx_slot)
    /// for transmission.
    pub fn commit_tx(&self) {
        if self.bus_mode() == BusMode::ListenOnly {
            return;
        }
        self.tx.commit();
    }

    /// Returns the oldest received frame, or `None` when the RX queue is
    /// empty. The slot stays valid until [`release_rx`](Channel::release_rx).
    pub fn rx_slot(&self) -> Option<&Frame> {
        self.rx.peek()
    }

    /// Frees the slot returned by the last [`rx_slot`](Channel::rx_slot).
    pub fn release_rx(&self) {
        self.rx.release();
    }

    /* Interrupt-level data path */

    /// Interrupt level: the oldest frame queued for transmission, or `None`
    /// when there is nothing to send or the channel is not on the bus.
    pub fn next_transmit(&self) -> Option<&Frame> {
        if self.bus_mode() != BusMode::On {
            return None;
        }
        self.tx.peek()
    }

    /// Interrupt level: frees the frame returned by
    /// [`next_transmit`](Channel::next_transmit) once it is on the wire.
    pub fn transmit_done(&self) {
        self.tx.release();
    }

    /// Interrupt level: moves an accepted frame into the RX queue, stamping
    /// it and consulting the RX callback on the way. Returns `false` when the
    /// frame was lost (queue full) or skipped by the callback.
    pub(crate) fn deliver(&self, bus: BusHandle, frame: &Frame) -> bool {
        let Some(slot) = self.rx.grant() else {
            // RX overrun: the frame is lost, the queue content stays intact.
            return false;
        };

        slot.copy_from(frame);
        slot.set_bus(bus);

        // SAFETY: handlers change only while the bus is off; delivery only
        // runs with the bus on.
        let config = unsafe { &*self.config.get() };
        slot.set_timestamp(config.timestamp_handler.map(|stamp| stamp()));

        if let Some(callback) = config.rx_callback {
            if callback(slot) == RxVerdict::Skip {
                // The granted slot is simply never committed.
                return false;
            }
        }

        self.rx.commit();
        true
    }

    /// Interrupt level: records one transmit error. When the error limit is
    /// reached the TX error handler is called if one is installed; otherwise
    /// the channel performs an automatic bus-off/bus-on cycle and stays
    /// usable.
    pub(crate) fn record_tx_error(&self, bus: BusHandle) {
        if self.state() != ChannelState::Initialized {
            return;
        }

        let count = self.tx_errors.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
        if count < self.error_limit.load(Ordering::Acquire) {
            return;
        }
        self.tx_errors.store(0, Ordering::Relaxed);

        // SAFETY: the handler changes only while the bus is off; transmit
        // errors only occur with the bus on.
        let callback = unsafe { (*self.config.get()).tx_error_callback };
        match callback {
            Some(handler) => handler(bus),
            None => {
                // Automatic bus-off recovery.
                self.bus_mode.store(BusMode::Off.into(), Ordering::Release);
                self.bus_mode.store(BusMode::On.into(), Ordering::Release);
            }
        }
    }
}
