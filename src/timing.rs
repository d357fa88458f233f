//! Bit timing values for [`Gateway::init_channel`](crate::Gateway::init_channel).
//!
//! The values encode SJW, the two time segments and the prescaler for a
//! 60 MHz peripheral clock with 15 time quanta per bit and an 80 % sample
//! point. The core passes them through to the platform unchanged.

const SJW: u32 = 0;
const TSEG1: u32 = 10;
const TSEG2: u32 = 2;

const fn baud(brp: u32) -> u32 {
    SJW << 14 | TSEG1 << 16 | TSEG2 << 20 | brp
}

pub const BAUD_1M: u32 = baud(3);
pub const BAUD_800K: u32 = baud(4);
pub const BAUD_500K: u32 = baud(7);
pub const BAUD_250K: u32 = baud(15);
pub const BAUD_200K: u32 = baud(19);
pub const BAUD_125K: u32 = baud(31);
pub const BAUD_100K: u32 = baud(39);
pub const BAUD_95K2: u32 = baud(41);
pub const BAUD_83K3: u32 = baud(47);
pub const BAUD_50K: u32 = baud(79);
pub const BAUD_47K6: u32 = baud(83);
pub const BAUD_33K3: u32 = baud(119);
pub const BAUD_20K: u32 = baud(199);
pub const BAUD_10K: u32 = baud(399);
