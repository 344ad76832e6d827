//! Communication Interface Parameters (CIP) and sub-records.
//!
//! During activation the secure element describes itself in a single CIP
//! record delivered in the `S(CIP response)` information field:
//!
//! `version | iin_len | iin | plid | plp_len | plp | dllp_len | dllp |
//! hb_len | hb`
//!
//! The data-link layer parameters (DLLP) carry the negotiated block waiting
//! time and information field size; the physical layer parameters (PLP) are
//! interpreted according to the physical layer identifier (PLID).

use crate::{Error, Result};

/// Physical layer identifier inside a CIP record.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Plid {
    /// SPI physical layer (0x01).
    Spi,
    /// I2C physical layer (0x02).
    I2c,
}

/// Parsed Communication Interface Parameters record.
///
/// Sub-records borrow from the undecoded input; use [`Dllp::parse`],
/// [`I2cParams::parse`] or [`SpiParams::parse`] to interpret them.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Cip<'a> {
    /// CIP version.
    pub version: u8,
    /// Issuer identification number (3 or 4 bytes, ISO 7812-1).
    pub iin: &'a [u8],
    /// Physical layer identifier.
    pub plid: Plid,
    /// Physical layer parameters, undecoded.
    pub plp: &'a [u8],
    /// Data-link layer parameters, undecoded.
    pub dllp: &'a [u8],
    /// Historical bytes.
    pub hb: &'a [u8],
}

impl<'a> Cip<'a> {
    /// Parses and validates a CIP record.
    pub fn parse(data: &'a [u8]) -> Result<Self> {
        // version, four length prefixes and plid at minimum
        if data.len() < 6 {
            return Err(Error::TooLittleData);
        }

        let version = data[0];
        let mut offset = 1;

        let iin_len = data[offset] as usize;
        offset += 1;
        // iin plus plid, plp_len, dllp_len, hb_len still to come
        if offset + iin_len + 4 > data.len() {
            return Err(Error::TooLittleData);
        }
        let iin = &data[offset..offset + iin_len];
        offset += iin_len;

        let plid_raw = data[offset];
        offset += 1;

        let plp_len = data[offset] as usize;
        offset += 1;
        if offset + plp_len + 2 > data.len() {
            return Err(Error::TooLittleData);
        }
        let plp = &data[offset..offset + plp_len];
        offset += plp_len;

        let dllp_len = data[offset] as usize;
        offset += 1;
        if offset + dllp_len + 1 > data.len() {
            return Err(Error::TooLittleData);
        }
        let dllp = &data[offset..offset + dllp_len];
        offset += dllp_len;

        let hb_len = data[offset] as usize;
        offset += 1;
        if offset + hb_len != data.len() {
            return Err(Error::InvalidCipField);
        }
        let hb = &data[offset..];

        if !(3..=4).contains(&iin.len()) {
            return Err(Error::InvalidCipField);
        }
        let plid = match plid_raw {
            0x01 => Plid::Spi,
            0x02 => Plid::I2c,
            _ => return Err(Error::InvalidPlid),
        };
        let plp_min = match plid {
            Plid::I2c => 8,
            Plid::Spi => 12,
        };
        if plp.len() < plp_min {
            return Err(Error::TooLittleData);
        }
        if dllp.len() < 4 {
            return Err(Error::TooLittleData);
        }

        Ok(Cip {
            version,
            iin,
            plid,
            plp,
            dllp,
            hb,
        })
    }
}

/// Data-link layer parameters.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Dllp {
    /// Block waiting time in milliseconds.
    pub bwt: u16,
    /// Maximum information field size of the secure element.
    pub ifsc: u16,
}

impl Dllp {
    /// Parses the fixed part of a DLLP record, ignoring trailing RFU bytes.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            return Err(Error::TooLittleData);
        }
        Ok(Dllp {
            bwt: u16::from_be_bytes([data[0], data[1]]),
            ifsc: u16::from_be_bytes([data[2], data[3]]),
        })
    }
}

/// I2C physical layer parameters.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct I2cParams {
    /// Configuration bits (supported addressing and clock modes).
    pub configuration: u8,
    /// Power wake-up time in milliseconds.
    pub pwt: u8,
    /// Maximum clock frequency in kHz.
    pub mcf: u16,
    /// Power saving timeout in milliseconds.
    pub pst: u8,
    /// Minimum polling time in multiples of 100 microseconds.
    pub mpot: u8,
    /// Read/write guard time in microseconds.
    pub rwgt: u16,
}

impl I2cParams {
    /// Parses the fixed part of an I2C PLP record, ignoring trailing RFU bytes.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 8 {
            return Err(Error::TooLittleData);
        }
        Ok(I2cParams {
            configuration: data[0],
            pwt: data[1],
            mcf: u16::from_be_bytes([data[2], data[3]]),
            pst: data[4],
            mpot: data[5],
            rwgt: u16::from_be_bytes([data[6], data[7]]),
        })
    }
}

/// SPI physical layer parameters.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SpiParams {
    /// Configuration bits (supported modes).
    pub configuration: u8,
    /// Power wake-up time in milliseconds.
    pub pwt: u8,
    /// Maximum clock frequency in kHz.
    pub mcf: u16,
    /// Power saving timeout in milliseconds.
    pub pst: u8,
    /// Minimum polling time in multiples of 100 microseconds.
    pub mpot: u8,
    /// Secure element guard time in microseconds.
    pub segt: u16,
    /// Secure element access length in bytes.
    pub seal: u16,
    /// Wake-up time in milliseconds.
    pub wut: u16,
}

impl SpiParams {
    /// Parses the fixed part of a SPI PLP record, ignoring trailing RFU bytes.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 12 {
            return Err(Error::TooLittleData);
        }
        Ok(SpiParams {
            configuration: data[0],
            pwt: data[1],
            mcf: u16::from_be_bytes([data[2], data[3]]),
            pst: data[4],
            mpot: data[5],
            segt: u16::from_be_bytes([data[6], data[7]]),
            seal: u16::from_be_bytes([data[8], data[9]]),
            wut: u16::from_be_bytes([data[10], data[11]]),
        })
    }
}
