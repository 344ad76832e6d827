#![cfg_attr(not(test), no_std)]
#![allow(async_fn_in_trait)]
#![doc = include_str!("../README.md")]
#![warn(missing_docs)]

//! ## Feature flags
#![doc = document_features::document_features!(feature_label = r#"<span class="stab portability"><code>{feature}</code></span>"#)]

// This mod MUST go first, so that the others see its macros.
pub(crate) mod fmt;

pub mod block;
pub mod cip;
pub mod crc;
pub mod protocol;
pub mod transport;

pub use block::{Block, Pcb, RType, SType, MAX_IFS};
pub use cip::{Cip, Dllp, I2cParams, Plid, SpiParams};
pub use protocol::T1Prime;
pub use transport::{Config, I2cTransport, Transport};

/// shorthand for -> `Result<T>`
pub type Result<T> = core::result::Result<T, Error>;

/// Error information type
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// A decode ran out of data, or the NAD poll window elapsed without a
    /// valid start byte.
    TooLittleData,
    /// Declared information length and buffer length disagree.
    LengthMismatch,
    /// Epilogue CRC does not match the block contents.
    InvalidCrc,
    /// Block class, sequence counter or supervisory subtype is inconsistent
    /// with the current protocol state.
    InvalidBlock,
    /// Unknown physical layer identifier in the card's self description.
    InvalidPlid,
    /// Malformed or out-of-range field in the card's self description.
    InvalidCipField,
    /// The card aborted the transmission with `S(ABORT request)`.
    TransceiveAborted,
    /// The transport lacks a primitive required by the protocol.
    InvalidProtocolStack,
    /// Invalid argument passed by the caller.
    IllegalArgument,
    /// Bus level transfer failure.
    Bus(embedded_hal::i2c::ErrorKind),
}
