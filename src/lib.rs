#![no_std]

//! Store-and-forward core of a multi-channel CAN gateway.
//!
//! Each channel owns a bounded TX and RX frame queue shared lock-free
//! between the platform's CAN interrupts and a cooperative main loop; the
//! [`Bridge`] forwards accepted frames from one channel's RX queue to its
//! peer's TX queue. Reception is restricted by a sorted acceptance filter
//! table, and channels recover from bus-off on their own unless an error
//! handler takes over.

mod bridge;
mod channel;
mod filter;
mod frame;
mod gateway;
mod ring;
pub mod timing;

/// Default transmit error limit of a channel before bus-off handling runs.
pub const DEFAULT_TX_ERROR_LIMIT: u8 = 96;

pub use bridge::*;
pub use channel::*;
pub use filter::*;
pub use frame::*;
pub use gateway::*;
pub use ring::*;

pub use embedded_can::{ExtendedId, Id, StandardId};
