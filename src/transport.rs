//! Byte transport abstraction and the bundled I2C bridge.
//!
//! The protocol engine is transport agnostic: it talks to anything that can
//! push and pull raw bytes half-duplex. [`I2cTransport`] adapts any
//! [`embedded_hal_async::i2c::I2c`] master to that contract, matching the
//! way T=1' secure elements are usually attached.

use embassy_time::{Duration, Timer};
use embedded_hal::i2c::{Error as _, ErrorKind};

use crate::{Error, Result};

/// Half-duplex byte transport consumed by the protocol engine.
///
/// `transmit` must push all bytes in one atomic access and `receive` must
/// not coalesce data across calls; the engine relies on frame-granular
/// reads for its NAD polling.
pub trait Transport {
    /// Performs the physical wake/reset of the target.
    ///
    /// Any answer-to-power-on bytes are stored in `atpo` and their count
    /// returned; the protocol engine discards them.
    async fn activate(&mut self, atpo: &mut [u8]) -> Result<usize>;

    /// Transmits all of `data`.
    async fn transmit(&mut self, data: &[u8]) -> Result<()>;

    /// Reads bytes into `buf` and returns how many were actually placed.
    ///
    /// A shortfall is not an error at this layer; the engine maps it to a
    /// decode failure.
    async fn receive(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Applies a new bus clock frequency in Hz.
    ///
    /// Advisory; transports without runtime clock control may ignore it.
    fn set_clock_frequency(&mut self, frequency: u32) -> Result<()> {
        let _ = frequency;
        Ok(())
    }

    /// Applies a new low-level bus timeout.
    ///
    /// Advisory; transports without a bus timeout may ignore it.
    fn set_bus_timeout(&mut self, timeout: Duration) -> Result<()> {
        let _ = timeout;
        Ok(())
    }

    /// Selects the target device address.
    fn set_slave_address(&mut self, address: u16) -> Result<()> {
        let _ = address;
        Ok(())
    }
}

/// Default secure element I2C address.
const DEFAULT_ADDRESS: u8 = 0x10;

/// Default gap kept between two bus accesses.
const DEFAULT_GUARD_TIME: Duration = Duration::from_micros(100);

/// Default settling time after waking the target.
const DEFAULT_POWER_WAKEUP_TIME: Duration = Duration::from_millis(100);

/// I2C transport configuration.
#[derive(Debug, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub struct Config {
    /// 7-bit device address of the secure element.
    pub address: u8,
    /// Gap kept between two bus accesses (read/write guard time).
    pub guard_time: Duration,
    /// Settling time after waking the target during activation.
    pub power_wakeup_time: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS,
            guard_time: DEFAULT_GUARD_TIME,
            power_wakeup_time: DEFAULT_POWER_WAKEUP_TIME,
        }
    }
}

/// [`Transport`] over an `embedded-hal-async` I2C master.
///
/// Keeps the read/write guard time between accesses and tracks the bus
/// parameters negotiated during protocol activation. The underlying HAL
/// fixes the actual SCL frequency; the negotiated maximum is recorded so
/// that callers can verify their bus configuration against it.
pub struct I2cTransport<I2C> {
    bus: I2C,
    config: Config,
    clock_frequency: u32,
    bus_timeout: Option<Duration>,
}

impl<I2C: embedded_hal_async::i2c::I2c> I2cTransport<I2C> {
    /// Creates a transport with the default configuration.
    pub fn new(bus: I2C) -> Self {
        Self::new_with_config(bus, Config::default())
    }

    /// Creates a transport with an explicit configuration.
    pub fn new_with_config(bus: I2C, config: Config) -> Self {
        Self {
            bus,
            config,
            clock_frequency: 0,
            bus_timeout: None,
        }
    }

    /// Returns the configured device address.
    pub fn address(&self) -> u8 {
        self.config.address
    }

    /// Returns the most recently negotiated clock frequency in Hz.
    pub fn clock_frequency(&self) -> u32 {
        self.clock_frequency
    }

    /// Returns the bus timeout applied during protocol activation, if any.
    pub fn bus_timeout(&self) -> Option<Duration> {
        self.bus_timeout
    }

    /// Consumes the transport, returning the wrapped bus.
    pub fn release(self) -> I2C {
        self.bus
    }

    async fn guard(&self) {
        if self.config.guard_time > Duration::from_ticks(0) {
            Timer::after(self.config.guard_time).await;
        }
    }
}

impl<I2C: embedded_hal_async::i2c::I2c> Transport for I2cTransport<I2C> {
    async fn activate(&mut self, _atpo: &mut [u8]) -> Result<usize> {
        // A bare I2C slave has no reset line to pulse and produces no
        // answer-to-power-on; give the chip time to settle instead.
        Timer::after(self.config.power_wakeup_time).await;
        Ok(0)
    }

    async fn transmit(&mut self, data: &[u8]) -> Result<()> {
        self.guard().await;
        let result = self.bus.write(self.config.address, data).await;
        self.guard().await;
        result.map_err(|e| Error::Bus(e.kind()))
    }

    async fn receive(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.guard().await;
        let result = self.bus.read(self.config.address, buf).await;
        self.guard().await;
        result.map_err(|e| Error::Bus(e.kind()))?;
        Ok(buf.len())
    }

    fn set_clock_frequency(&mut self, frequency: u32) -> Result<()> {
        debug!("bus clock limit {} Hz", frequency);
        self.clock_frequency = frequency;
        Ok(())
    }

    fn set_bus_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.bus_timeout = Some(timeout);
        Ok(())
    }

    fn set_slave_address(&mut self, address: u16) -> Result<()> {
        // 10-bit addressing is not wired through this bridge.
        if address > 0x7f {
            return Err(Error::InvalidProtocolStack);
        }
        // 0x00..0x07 and 0x78..0x7f are reserved by the I2C specification.
        if !(0x08..=0x77).contains(&address) {
            return Err(Error::IllegalArgument);
        }
        self.config.address = address as u8;
        Ok(())
    }
}
