//! Block framing and protocol control byte (PCB) classification.
//!
//! Every T=1' block travels as `NAD | PCB | LEN (2 bytes, MSB first) |
//! INFO (LEN bytes) | CRC (2 bytes, MSB first)`. The PCB selects one of
//! three block classes: Information blocks carry user data, Receive-ready
//! blocks acknowledge or request retransmissions, Supervisory blocks manage
//! the link itself.

use crate::crc::{crc16, Crc16};
use crate::{Error, Result};

/// Fixed length of the block prologue (NAD, PCB, LEN).
pub(crate) const PROLOGUE_LEN: usize = 4;

/// Fixed length of the block epilogue (CRC).
pub(crate) const EPILOGUE_LEN: usize = 2;

/// Maximum information field size allowed by the protocol.
pub const MAX_IFS: u16 = 0xff9;

/// Wire size of the largest legal block.
pub(crate) const MAX_BLOCK_LEN: usize = PROLOGUE_LEN + MAX_IFS as usize + EPILOGUE_LEN;

/// Node address byte for transmissions from host device to secure element.
pub(crate) const NAD_HD_TO_SE: u8 = 0x21;

/// Receive-ready block subtype.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RType {
    /// Error-free acknowledgement.
    Ack,
    /// Last block was received with a CRC error.
    CrcError,
    /// Last block was invalid for any other reason.
    OtherError,
}

/// Supervisory block subtype.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SType {
    /// Resynchronize sequence counters.
    Resynch,
    /// Negotiate a new information field size.
    Ifs,
    /// Abort the current chain.
    Abort,
    /// Extend the block waiting time.
    Wtx,
    /// Query communication interface parameters.
    Cip,
    /// Release the communication channel.
    Release,
    /// Software reset.
    Swr,
}

impl SType {
    fn from_nibble(nibble: u8) -> Option<Self> {
        match nibble {
            0x0 => Some(SType::Resynch),
            0x1 => Some(SType::Ifs),
            0x2 => Some(SType::Abort),
            0x3 => Some(SType::Wtx),
            0x4 => Some(SType::Cip),
            0x6 => Some(SType::Release),
            0xf => Some(SType::Swr),
            _ => None,
        }
    }

    fn nibble(self) -> u8 {
        match self {
            SType::Resynch => 0x0,
            SType::Ifs => 0x1,
            SType::Abort => 0x2,
            SType::Wtx => 0x3,
            SType::Cip => 0x4,
            SType::Release => 0x6,
            SType::Swr => 0xf,
        }
    }
}

/// Classified protocol control byte.
///
/// `Unknown` keeps the raw byte so that decoding stays lossless; the engine
/// treats it as an invalid block.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Pcb {
    /// Information block with send sequence counter and chaining bit.
    I {
        /// Send sequence counter N(S).
        ns: u8,
        /// More-data bit, set when further blocks follow in the chain.
        more: bool,
    },
    /// Receive-ready block.
    R {
        /// Expected send sequence counter N(R).
        nr: u8,
        /// Acknowledgement subtype.
        rtype: RType,
    },
    /// Supervisory block.
    S {
        /// Supervisory subtype.
        stype: SType,
        /// `true` for responses, `false` for requests.
        response: bool,
    },
    /// Reserved or undefined bit pattern.
    Unknown(u8),
}

impl Pcb {
    /// Classifies a raw protocol control byte.
    #[must_use]
    pub fn classify(byte: u8) -> Self {
        match byte >> 6 {
            0b00 | 0b01 => {
                if byte & 0x1f != 0 {
                    return Pcb::Unknown(byte);
                }
                Pcb::I {
                    ns: (byte >> 6) & 0x01,
                    more: byte & 0x20 != 0,
                }
            }
            0b10 => {
                if byte & 0x20 != 0 {
                    return Pcb::Unknown(byte);
                }
                let rtype = match byte & 0x0f {
                    0x0 => RType::Ack,
                    0x1 => RType::CrcError,
                    0x2 => RType::OtherError,
                    _ => return Pcb::Unknown(byte),
                };
                Pcb::R {
                    nr: (byte >> 4) & 0x01,
                    rtype,
                }
            }
            _ => {
                if byte & 0x10 != 0 {
                    return Pcb::Unknown(byte);
                }
                match SType::from_nibble(byte & 0x0f) {
                    Some(stype) => Pcb::S {
                        stype,
                        response: byte & 0x20 != 0,
                    },
                    None => Pcb::Unknown(byte),
                }
            }
        }
    }

    /// Returns the wire encoding of this PCB.
    #[must_use]
    pub fn to_byte(self) -> u8 {
        match self {
            Pcb::I { ns, more } => ((ns & 0x01) << 6) | if more { 0x20 } else { 0x00 },
            Pcb::R { nr, rtype } => {
                let low = match rtype {
                    RType::Ack => 0x0,
                    RType::CrcError => 0x1,
                    RType::OtherError => 0x2,
                };
                0x80 | ((nr & 0x01) << 4) | low
            }
            Pcb::S { stype, response } => {
                0xc0 | if response { 0x20 } else { 0x00 } | stype.nibble()
            }
            Pcb::Unknown(raw) => raw,
        }
    }

    /// Returns `true` for request supervisory blocks.
    #[must_use]
    pub fn is_s_request(self) -> bool {
        matches!(self, Pcb::S { response: false, .. })
    }
}

/// One framed block.
///
/// The information field borrows from the encoder's input or the receive
/// buffer; an empty slice is a valid, zero-length information field.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Block<'a> {
    /// Node address byte.
    pub nad: u8,
    /// Classified protocol control byte.
    pub pcb: Pcb,
    /// Information field.
    pub info: &'a [u8],
}

impl<'a> Block<'a> {
    /// Encodes the block into `buf` and returns the number of bytes written.
    ///
    /// The epilogue CRC is always freshly computed over prologue and
    /// information field.
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        if self.info.len() > u16::MAX as usize {
            return Err(Error::IllegalArgument);
        }
        let total = PROLOGUE_LEN + self.info.len() + EPILOGUE_LEN;
        if buf.len() < total {
            return Err(Error::TooLittleData);
        }

        buf[0] = self.nad;
        buf[1] = self.pcb.to_byte();
        buf[2..4].copy_from_slice(&(self.info.len() as u16).to_be_bytes());
        buf[4..4 + self.info.len()].copy_from_slice(self.info);

        let crc = crc16(&buf[..total - EPILOGUE_LEN]);
        buf[total - EPILOGUE_LEN..total].copy_from_slice(&crc.to_be_bytes());
        Ok(total)
    }

    /// Decodes one complete block from `data`.
    ///
    /// `data` must contain exactly one block: prologue, the information
    /// field announced by LEN, and the epilogue.
    pub fn decode(data: &'a [u8]) -> Result<Self> {
        if data.len() < PROLOGUE_LEN + EPILOGUE_LEN {
            return Err(Error::TooLittleData);
        }
        let len = u16::from_be_bytes([data[2], data[3]]) as usize;
        if data.len() != PROLOGUE_LEN + len + EPILOGUE_LEN {
            return Err(Error::LengthMismatch);
        }

        let expected = u16::from_be_bytes([data[data.len() - 2], data[data.len() - 1]]);
        let mut crc = Crc16::new();
        crc.feed_bytes(&data[..data.len() - EPILOGUE_LEN]);
        if crc.finish() != expected {
            return Err(Error::InvalidCrc);
        }

        Ok(Block {
            nad: data[0],
            pcb: Pcb::classify(data[1]),
            info: &data[PROLOGUE_LEN..PROLOGUE_LEN + len],
        })
    }
}
