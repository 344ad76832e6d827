//! The T=1' transceive engine.
//!
//! [`T1Prime`] owns a byte transport and drives the half-duplex block
//! exchange with the secure element: chaining requests into I-blocks,
//! reassembling chained responses, answering supervisory requests and
//! recovering from transmission errors within a bounded retry budget.
//!
//! The engine is single threaded and synchronous in the protocol sense:
//! one logical request at a time, every block sent followed by at most one
//! block received before the next send decision. Waiting happens in the
//! NAD polling loop, which compares against a monotonic deadline instead
//! of sleeping for the whole window.

use embassy_time::{Duration, Instant, Timer};

use crate::block::{Block, Pcb, RType, SType, MAX_BLOCK_LEN, MAX_IFS, NAD_HD_TO_SE};
use crate::cip::{Cip, Dllp, I2cParams, Plid};
use crate::crc::Crc16;
use crate::transport::Transport;
use crate::{Error, Result};

/// Information field size assumed before parameter negotiation.
const DEFAULT_IFSC: u16 = 0x08;

/// Block waiting time assumed before parameter negotiation.
const DEFAULT_BWT: Duration = Duration::from_millis(300);

/// Minimum polling time assumed before parameter negotiation, in
/// multiples of 100 microseconds.
const DEFAULT_MPOT: u8 = 10;

/// I2C clock frequency applied until the card advertises its maximum.
const DEFAULT_CLOCK_FREQUENCY: u32 = 400_000;

/// Extra attempts for a single block exchange (so three sends in total).
const EXCHANGE_RETRIES: usize = 2;

/// Scratch capacity for answer-to-power-on bytes, which are discarded.
const ATPO_MAX: usize = 32;

/// Data-link session parameters and sequence counters.
///
/// Owned by the engine for the lifetime of the link and only ever mutated
/// through the operations below.
struct Session {
    send_counter: u8,
    receive_counter: u8,
    ifsc: u16,
    bwt: Duration,
    mpot: Duration,
    wtx: Duration,
}

impl Session {
    fn new() -> Self {
        Self {
            send_counter: 0,
            receive_counter: 0,
            ifsc: DEFAULT_IFSC,
            bwt: DEFAULT_BWT,
            mpot: Duration::from_micros(u64::from(DEFAULT_MPOT) * 100),
            wtx: Duration::from_ticks(0),
        }
    }

    fn reset_counters(&mut self) {
        self.send_counter = 0;
        self.receive_counter = 0;
    }

    fn toggle_send(&mut self) {
        self.send_counter ^= 0x01;
    }

    fn toggle_receive(&mut self) {
        self.receive_counter ^= 0x01;
    }

    fn set_ifsc(&mut self, ifsc: u16) -> Result<()> {
        if ifsc == 0 || ifsc > MAX_IFS {
            return Err(Error::IllegalArgument);
        }
        self.ifsc = ifsc;
        Ok(())
    }

    fn set_bwt(&mut self, bwt: Duration) {
        self.bwt = bwt;
    }

    fn set_polling(&mut self, mpot: u8) {
        self.mpot = Duration::from_micros(u64::from(mpot) * 100);
    }

    /// Records a waiting time extension granted to the card.
    fn begin_wtx(&mut self, multiplier: u8) {
        self.wtx = self.bwt * u32::from(multiplier);
    }

    /// Clears the pending waiting time extension once the card answered.
    fn consume_wtx(&mut self) {
        self.wtx = Duration::from_ticks(0);
    }
}

/// Metadata of one received block.
///
/// The information field lives in the engine's frame buffer and must be
/// copied out before the next exchange reuses it.
#[derive(Clone, Copy)]
struct Received {
    pcb: Pcb,
    info_len: usize,
}

/// GlobalPlatform T=1' protocol engine.
///
/// Generic over the byte [`Transport`] it owns exclusively. Construct it,
/// run [`activate`](Self::activate) once per physical session, then move
/// user traffic with [`transceive`](Self::transceive).
pub struct T1Prime<T: Transport> {
    transport: T,
    session: Session,
    frame: [u8; MAX_BLOCK_LEN],
}

impl<T: Transport> T1Prime<T> {
    /// Creates an engine with protocol defaults (IFSC 8, BWT 300 ms).
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            session: Session::new(),
            frame: [0; MAX_BLOCK_LEN],
        }
    }

    /// Returns a shared reference to the owned transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Returns a mutable reference to the owned transport.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Returns the current maximum information field size of the card.
    pub fn ifsc(&self) -> u16 {
        self.session.ifsc
    }

    /// Returns the current block waiting time.
    pub fn bwt(&self) -> Duration {
        self.session.bwt
    }

    /// Overrides the block waiting time locally.
    ///
    /// Does not send a block; the value is normally negotiated during
    /// [`activate`](Self::activate).
    pub fn set_bwt(&mut self, bwt: Duration) {
        self.session.set_bwt(bwt);
    }

    /// Activates the link and negotiates communication parameters.
    ///
    /// Restores protocol defaults (the card may have been reset
    /// independently), wakes the transport, queries the card's
    /// communication interface parameters and resynchronizes the sequence
    /// counters. Returns no user data. On failure the link stays
    /// unconfigured; activation may simply be retried.
    pub async fn activate(&mut self) -> Result<()> {
        self.session = Session::new();
        self.transport.set_clock_frequency(DEFAULT_CLOCK_FREQUENCY)?;

        // The transport should not need a separate activation, but wake it
        // just in case and drop whatever it answers.
        let mut atpo = [0u8; ATPO_MAX];
        if let Ok(n) = self.transport.activate(&mut atpo).await {
            trace!("discarding {} byte answer to power on", n);
        }

        let received = self
            .exchange(
                Pcb::S {
                    stype: SType::Cip,
                    response: false,
                },
                &[],
            )
            .await?;

        let (dllp, i2c_params) = {
            let cip = Cip::parse(&self.frame[..received.info_len])?;
            let dllp = Dllp::parse(cip.dllp)?;
            let i2c_params = match cip.plid {
                Plid::I2c => Some(I2cParams::parse(cip.plp)?),
                Plid::Spi => None,
            };
            (dllp, i2c_params)
        };

        if dllp.bwt == 0 {
            return Err(Error::InvalidCipField);
        }
        self.session.set_bwt(Duration::from_millis(u64::from(dllp.bwt)));
        self.session
            .set_ifsc(dllp.ifsc)
            .map_err(|_| Error::InvalidCipField)?;

        if let Some(plp) = i2c_params {
            self.transport
                .set_clock_frequency(u32::from(plp.mcf) * 1000)?;
            self.session.set_polling(plp.mpot);
            self.transport.set_bus_timeout(self.session.bwt)?;
        }
        debug!("link parameters: bwt {} ms, ifsc {}", dllp.bwt, dllp.ifsc);

        self.resynch().await
    }

    /// Sends `request` and returns the card's reassembled response.
    ///
    /// The request is chained into I-blocks of at most IFSC bytes; the
    /// chained response is written into `response`, and the returned slice
    /// borrows the filled part of it.
    pub async fn transceive<'a>(
        &mut self,
        request: &[u8],
        response: &'a mut [u8],
    ) -> Result<&'a [u8]> {
        if request.is_empty() {
            return Err(Error::IllegalArgument);
        }

        // Send direction: chain the request out, handling acknowledgements
        // and supervisory interjections until the card starts answering.
        let mut offset = 0usize;
        let mut chunk = request.len().min(self.session.ifsc as usize);
        let mut received = {
            let pcb = Pcb::I {
                ns: self.session.send_counter,
                more: chunk < request.len(),
            };
            self.exchange(pcb, &request[..chunk]).await?
        };
        loop {
            match received.pcb {
                Pcb::I { .. } => {
                    if offset + chunk < request.len() {
                        return Err(Error::InvalidBlock);
                    }
                    self.session.toggle_send();
                    break;
                }
                Pcb::R { nr, .. } => {
                    if nr == (self.session.send_counter ^ 0x01) {
                        if offset + chunk == request.len() {
                            // Final chunk acknowledged without a response
                            // block; ask the card to send it.
                            received = self
                                .exchange(
                                    Pcb::R {
                                        nr: self.session.receive_counter,
                                        rtype: RType::CrcError,
                                    },
                                    &[],
                                )
                                .await?;
                        } else {
                            self.session.toggle_send();
                            offset += chunk;
                            chunk = (request.len() - offset).min(self.session.ifsc as usize);
                            let pcb = Pcb::I {
                                ns: self.session.send_counter,
                                more: offset + chunk < request.len(),
                            };
                            received =
                                self.exchange(pcb, &request[offset..offset + chunk]).await?;
                        }
                    } else {
                        // The card did not take the current chunk; send it
                        // again without advancing the counter.
                        let pcb = Pcb::I {
                            ns: self.session.send_counter,
                            more: offset + chunk < request.len(),
                        };
                        received = self.exchange(pcb, &request[offset..offset + chunk]).await?;
                    }
                }
                Pcb::S {
                    stype: SType::Wtx,
                    response: false,
                } => {
                    if received.info_len != 1 {
                        return Err(Error::InvalidBlock);
                    }
                    let multiplier = self.frame[0];
                    self.session.begin_wtx(multiplier);
                    debug!("waiting time extension, multiplier {}", multiplier);
                    received = self
                        .exchange(
                            Pcb::S {
                                stype: SType::Wtx,
                                response: true,
                            },
                            &[multiplier],
                        )
                        .await?;
                }
                Pcb::S {
                    stype: SType::Ifs,
                    response: false,
                } => {
                    let mut echo = [0u8; 3];
                    let n = received.info_len;
                    if n == 0 || n > echo.len() {
                        return Err(Error::InvalidBlock);
                    }
                    echo[..n].copy_from_slice(&self.frame[..n]);
                    let ifs = decode_ifs(&echo[..n]).map_err(|_| Error::InvalidBlock)?;
                    self.session.set_ifsc(ifs).map_err(|_| Error::InvalidBlock)?;
                    chunk = chunk.min(ifs as usize);
                    debug!("card changed ifsc to {}", ifs);
                    received = self
                        .exchange(
                            Pcb::S {
                                stype: SType::Ifs,
                                response: true,
                            },
                            &echo[..n],
                        )
                        .await?;
                }
                Pcb::S {
                    stype: SType::Abort,
                    response: false,
                } => {
                    self.abort_response().await?;
                    return Err(Error::TransceiveAborted);
                }
                _ => return Err(Error::InvalidBlock),
            }
        }

        // Receive direction: collect the chained response into the
        // caller's buffer.
        let mut total = 0usize;
        loop {
            match received.pcb {
                Pcb::I { ns, more } => {
                    if ns != self.session.receive_counter {
                        return Err(Error::InvalidBlock);
                    }
                    let len = received.info_len;
                    if total + len > response.len() {
                        return Err(Error::IllegalArgument);
                    }
                    // A zero length I-block is a forced acknowledgement and
                    // contributes nothing.
                    response[total..total + len].copy_from_slice(&self.frame[..len]);
                    total += len;
                    self.session.toggle_receive();
                    if !more {
                        return Ok(&response[..total]);
                    }
                    received = self
                        .exchange(
                            Pcb::R {
                                nr: self.session.receive_counter,
                                rtype: RType::Ack,
                            },
                            &[],
                        )
                        .await?;
                }
                Pcb::R { nr, .. } => {
                    if nr != self.session.send_counter {
                        return Err(Error::InvalidBlock);
                    }
                    // The card missed our last acknowledgement; repeat it.
                    received = self
                        .exchange(
                            Pcb::R {
                                nr: self.session.receive_counter,
                                rtype: RType::Ack,
                            },
                            &[],
                        )
                        .await?;
                }
                Pcb::S {
                    stype: SType::Abort,
                    response: false,
                } => {
                    self.abort_response().await?;
                    return Err(Error::TransceiveAborted);
                }
                _ => return Err(Error::InvalidBlock),
            }
        }
    }

    /// Negotiates the information field size of the host device (IFSD).
    ///
    /// Sends `S(IFS request)` and expects an `S(IFS response)` echoing the
    /// encoded value exactly.
    pub async fn set_ifsd(&mut self, ifsd: u16) -> Result<()> {
        let mut buf = [0u8; 3];
        let n = encode_ifs(ifsd, &mut buf)?;
        let received = self
            .exchange(
                Pcb::S {
                    stype: SType::Ifs,
                    response: false,
                },
                &buf[..n],
            )
            .await?;
        if received.info_len != n || self.frame[..n] != buf[..n] {
            return Err(Error::InvalidBlock);
        }
        Ok(())
    }

    /// Resynchronizes both sequence counters with the card.
    pub async fn resynch(&mut self) -> Result<()> {
        self.exchange(
            Pcb::S {
                stype: SType::Resynch,
                response: false,
            },
            &[],
        )
        .await?;
        self.session.reset_counters();
        Ok(())
    }

    /// Performs a software reset of the card and resets both counters.
    pub async fn soft_reset(&mut self) -> Result<()> {
        self.exchange(
            Pcb::S {
                stype: SType::Swr,
                response: false,
            },
            &[],
        )
        .await?;
        self.session.reset_counters();
        Ok(())
    }

    /// Answers a card initiated abort. The card does not acknowledge the
    /// response, so nothing is read back.
    async fn abort_response(&mut self) -> Result<()> {
        warn!("card aborted the transmission");
        self.send_block(
            Pcb::S {
                stype: SType::Abort,
                response: true,
            },
            &[],
        )
        .await
    }

    /// One block exchange with retransmission handling.
    ///
    /// Sends the block and reads the card's answer. CRC errors, malformed
    /// blocks and poll window expiry are retried up to
    /// [`EXCHANGE_RETRIES`] times: request S-blocks are repeated verbatim,
    /// anything else is answered with `R(CRC error)` asking the card to
    /// resend. Request S-blocks additionally pin the expected response
    /// type; an I-block or an R-block with a stale sequence number in
    /// their place is a protocol violation and fails without retry.
    async fn exchange(&mut self, pcb: Pcb, info: &[u8]) -> Result<Received> {
        let s_request = pcb.is_s_request();
        let expected_response = match pcb {
            Pcb::S {
                stype,
                response: false,
            } => Some(Pcb::S {
                stype,
                response: true,
            }),
            _ => None,
        };

        let mut pcb_to_send = pcb;
        let mut info_to_send = info;
        let mut attempt = 0usize;
        loop {
            self.send_block(pcb_to_send, info_to_send).await?;

            let failure = match self.receive_block().await {
                Ok(received) => {
                    if !s_request {
                        return Ok(received);
                    }
                    if Some(received.pcb) == expected_response {
                        return Ok(received);
                    }
                    match received.pcb {
                        Pcb::I { .. } => return Err(Error::InvalidBlock),
                        Pcb::R { nr, .. } if nr != self.session.send_counter => {
                            return Err(Error::InvalidBlock)
                        }
                        _ => Error::InvalidBlock,
                    }
                }
                Err(e @ (Error::TooLittleData | Error::InvalidCrc | Error::LengthMismatch)) => e,
                Err(e) => return Err(e),
            };

            if attempt >= EXCHANGE_RETRIES {
                return Err(match failure {
                    Error::TooLittleData => Error::TooLittleData,
                    _ => Error::InvalidBlock,
                });
            }
            attempt += 1;
            warn!("block exchange failed, retry {} of {}", attempt, EXCHANGE_RETRIES);

            if !s_request {
                pcb_to_send = Pcb::R {
                    nr: self.session.receive_counter,
                    rtype: RType::CrcError,
                };
                info_to_send = &[];
            }
        }
    }

    /// Encodes and transmits one block.
    async fn send_block(&mut self, pcb: Pcb, info: &[u8]) -> Result<()> {
        let block = Block {
            nad: NAD_HD_TO_SE,
            pcb,
            info,
        };
        let n = block.encode(&mut self.frame)?;
        trace!("tx block, pcb {} len {}", pcb.to_byte(), info.len());
        self.transport.transmit(&self.frame[..n]).await
    }

    /// Reads one block, frame granular.
    ///
    /// Polls for a valid NAD within the block waiting time (extended by a
    /// pending waiting time extension, which is consumed by the first
    /// successful poll), then issues three fixed reads for the rest of the
    /// prologue, the information field and the epilogue. The information
    /// field ends up at the start of the frame buffer.
    async fn receive_block(&mut self) -> Result<Received> {
        let deadline = Instant::now() + self.session.bwt + self.session.wtx;
        let nad = loop {
            let mut nad = [0u8; 1];
            match self.transport.receive(&mut nad).await {
                Ok(1) if nad[0] != 0x00 && nad[0] != 0xff => break nad[0],
                _ => {}
            }
            if Instant::now() >= deadline {
                return Err(Error::TooLittleData);
            }
            Timer::after(self.session.mpot).await;
        };
        self.session.consume_wtx();

        let mut prologue = [0u8; 3];
        if self.transport.receive(&mut prologue).await? != prologue.len() {
            return Err(Error::TooLittleData);
        }
        let len = usize::from(u16::from_be_bytes([prologue[1], prologue[2]]));
        if len > MAX_IFS as usize {
            return Err(Error::LengthMismatch);
        }
        if len > 0 && self.transport.receive(&mut self.frame[..len]).await? != len {
            return Err(Error::TooLittleData);
        }
        let mut epilogue = [0u8; 2];
        if self.transport.receive(&mut epilogue).await? != epilogue.len() {
            return Err(Error::TooLittleData);
        }

        let mut crc = Crc16::new();
        crc.feed_byte(nad);
        crc.feed_bytes(&prologue);
        crc.feed_bytes(&self.frame[..len]);
        if crc.finish() != u16::from_be_bytes(epilogue) {
            return Err(Error::InvalidCrc);
        }

        trace!("rx block, nad {} pcb {} len {}", nad, prologue[0], len);
        Ok(Received {
            pcb: Pcb::classify(prologue[0]),
            info_len: len,
        })
    }
}

/// Encodes an information field size: one byte for values up to 0xFE,
/// otherwise three bytes `00 MSB LSB`.
fn encode_ifs(ifs: u16, buf: &mut [u8; 3]) -> Result<usize> {
    if ifs == 0 || ifs > MAX_IFS {
        return Err(Error::IllegalArgument);
    }
    if ifs <= 0xfe {
        buf[0] = ifs as u8;
        Ok(1)
    } else {
        buf[0] = 0x00;
        buf[1..].copy_from_slice(&ifs.to_be_bytes());
        Ok(3)
    }
}

/// Decodes an information field size in its short, two byte or prefixed
/// three byte form.
fn decode_ifs(data: &[u8]) -> Result<u16> {
    let value = match *data {
        [value] => u16::from(value),
        [hi, lo] => u16::from_be_bytes([hi, lo]),
        [0x00, hi, lo] => u16::from_be_bytes([hi, lo]),
        _ => return Err(Error::IllegalArgument),
    };
    if value == 0 || value > MAX_IFS {
        return Err(Error::IllegalArgument);
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crc::crc16;
    use embassy_futures::block_on;
    use std::collections::VecDeque;
    use std::vec::Vec;

    const NAD_SE_TO_HD: u8 = 0x12;

    /// Scripted stand-in for the secure element.
    ///
    /// Host frames are checked byte for byte against the expectation
    /// queue; card frames are delivered in the chunks the engine reads
    /// them in (NAD, prologue remainder, information, epilogue). An empty
    /// queue behaves like an idle bus that answers every poll with 0x00.
    struct MockSe {
        expected: VecDeque<Vec<u8>>,
        incoming: VecDeque<Vec<u8>>,
        clock: Option<u32>,
        bus_timeout: Option<Duration>,
    }

    impl MockSe {
        fn new() -> Self {
            Self {
                expected: VecDeque::new(),
                incoming: VecDeque::new(),
                clock: None,
                bus_timeout: None,
            }
        }

        /// Queues a host block the engine is expected to transmit next.
        fn expect_block(&mut self, pcb: u8, info: &[u8]) {
            let mut frame = vec![
                NAD_HD_TO_SE,
                pcb,
                (info.len() >> 8) as u8,
                info.len() as u8,
            ];
            frame.extend_from_slice(info);
            let crc = crc16(&frame);
            frame.extend_from_slice(&crc.to_be_bytes());
            self.expected.push_back(frame);
        }

        /// Queues a card block to be handed out by the next reads.
        fn queue_block(&mut self, pcb: u8, info: &[u8]) {
            self.queue_block_crc_xor(pcb, info, 0x0000);
        }

        /// Queues a card block with a corrupted epilogue.
        fn queue_corrupt_block(&mut self, pcb: u8, info: &[u8]) {
            self.queue_block_crc_xor(pcb, info, 0x5a5a);
        }

        fn queue_block_crc_xor(&mut self, pcb: u8, info: &[u8], xor: u16) {
            let header = [
                NAD_SE_TO_HD,
                pcb,
                (info.len() >> 8) as u8,
                info.len() as u8,
            ];
            let mut crc = Crc16::new();
            crc.feed_bytes(&header);
            crc.feed_bytes(info);
            let crc = crc.finish() ^ xor;

            self.incoming.push_back(vec![header[0]]);
            self.incoming.push_back(header[1..].to_vec());
            if !info.is_empty() {
                self.incoming.push_back(info.to_vec());
            }
            self.incoming.push_back(crc.to_be_bytes().to_vec());
        }

        /// Queues `polls` unsuccessful NAD polls before the next block.
        fn queue_idle(&mut self, polls: usize) {
            for _ in 0..polls {
                self.incoming.push_back(vec![0x00]);
            }
        }

        fn done(&self) -> bool {
            self.expected.is_empty() && self.incoming.is_empty()
        }
    }

    impl Transport for MockSe {
        async fn activate(&mut self, _atpo: &mut [u8]) -> Result<usize> {
            Ok(0)
        }

        async fn transmit(&mut self, data: &[u8]) -> Result<()> {
            let expected = self.expected.pop_front().expect("unexpected transmission");
            assert_eq!(data, &expected[..], "host sent an unexpected frame");
            Ok(())
        }

        async fn receive(&mut self, buf: &mut [u8]) -> Result<usize> {
            match self.incoming.pop_front() {
                Some(chunk) => {
                    assert_eq!(buf.len(), chunk.len(), "unexpected read granularity");
                    buf.copy_from_slice(&chunk);
                    Ok(buf.len())
                }
                None => {
                    // Idle card, the bus reads as 0x00.
                    buf.fill(0x00);
                    Ok(buf.len())
                }
            }
        }

        fn set_clock_frequency(&mut self, frequency: u32) -> Result<()> {
            self.clock = Some(frequency);
            Ok(())
        }

        fn set_bus_timeout(&mut self, timeout: Duration) -> Result<()> {
            self.bus_timeout = Some(timeout);
            Ok(())
        }
    }

    fn engine() -> T1Prime<MockSe> {
        T1Prime::new(MockSe::new())
    }

    #[test]
    fn single_block_exchange() {
        let mut se = engine();
        se.transport_mut().expect_block(0x00, &[0x01, 0x02]);
        se.transport_mut().queue_block(0x00, &[0xf1, 0xf2]);
        se.transport_mut().expect_block(0x40, &[0x03, 0x04]);
        se.transport_mut().queue_block(0x40, &[0xf3, 0xf4]);

        let mut buf = [0u8; 8];
        let response = block_on(se.transceive(&[0x01, 0x02], &mut buf)).unwrap();
        assert_eq!(response, &[0xf1, 0xf2]);
        assert_eq!(se.session.send_counter, 1);
        assert_eq!(se.session.receive_counter, 1);

        // The next exchange reuses the toggled counters.
        let mut buf = [0u8; 8];
        let response = block_on(se.transceive(&[0x03, 0x04], &mut buf)).unwrap();
        assert_eq!(response, &[0xf3, 0xf4]);
        assert!(se.transport().done());
    }

    #[test]
    fn waiting_time_extension() {
        let mut se = engine();
        se.transport_mut().expect_block(0x00, &[0x01, 0x02]);
        se.transport_mut().queue_block(0xc3, &[0x10]);
        se.transport_mut().expect_block(0xe3, &[0x10]);
        se.transport_mut().queue_block(0x00, &[0xf1, 0xf2]);

        let mut buf = [0u8; 8];
        let response = block_on(se.transceive(&[0x01, 0x02], &mut buf)).unwrap();
        assert_eq!(response, &[0xf1, 0xf2]);
        // Consumed by the poll that found the response block.
        assert_eq!(se.session.wtx, Duration::from_ticks(0));
        assert!(se.transport().done());
    }

    #[test]
    fn wtx_extends_the_poll_window() {
        let mut se = engine();
        se.set_bwt(Duration::from_millis(20));
        se.transport_mut().expect_block(0x00, &[0x01]);
        se.transport_mut().queue_block(0xc3, &[0x10]);
        se.transport_mut().expect_block(0xe3, &[0x10]);
        // 40 unsuccessful polls take well past the plain 20 ms window but
        // stay within the 16 x 20 ms extension.
        se.transport_mut().queue_idle(40);
        se.transport_mut().queue_block(0x00, &[0xf1]);

        let mut buf = [0u8; 8];
        let response = block_on(se.transceive(&[0x01], &mut buf)).unwrap();
        assert_eq!(response, &[0xf1]);
        assert!(se.transport().done());
    }

    #[test]
    fn ifs_shrink_mid_chain() {
        let mut se = engine();
        se.session.ifsc = 6;
        se.transport_mut()
            .expect_block(0x00, &[0x01, 0x02, 0x03, 0x04, 0x05, 0x06]);
        se.transport_mut().queue_block(0xc1, &[0x02]);
        se.transport_mut().expect_block(0xe1, &[0x02]);
        se.transport_mut().queue_block(0x80, &[]);
        se.transport_mut().expect_block(0x20, &[0x01, 0x02]);
        se.transport_mut().queue_block(0x90, &[]);
        se.transport_mut().expect_block(0x60, &[0x03, 0x04]);
        se.transport_mut().queue_block(0x80, &[]);
        se.transport_mut().expect_block(0x00, &[0x05, 0x06]);
        se.transport_mut().queue_block(0x00, &[0xf5, 0xf6]);

        let mut buf = [0u8; 8];
        let response = block_on(
            se.transceive(&[0x01, 0x02, 0x03, 0x04, 0x05, 0x06], &mut buf),
        )
        .unwrap();
        assert_eq!(response, &[0xf5, 0xf6]);
        assert_eq!(se.ifsc(), 2);
        assert!(se.transport().done());
    }

    #[test]
    fn crc_error_recovery() {
        let mut se = engine();
        se.transport_mut().expect_block(0x00, &[0x01, 0x02]);
        se.transport_mut().queue_corrupt_block(0x00, &[0xf1, 0xf2]);
        se.transport_mut().expect_block(0x81, &[]);
        se.transport_mut().queue_block(0x00, &[0xf1, 0xf2]);

        let mut buf = [0u8; 8];
        let response = block_on(se.transceive(&[0x01, 0x02], &mut buf)).unwrap();
        assert_eq!(response, &[0xf1, 0xf2]);
        assert!(se.transport().done());
    }

    #[test]
    fn abort_during_send_chain() {
        let mut se = engine();
        se.session.ifsc = 2;
        se.transport_mut().expect_block(0x20, &[0x01, 0x02]);
        se.transport_mut().queue_block(0xc2, &[]);
        se.transport_mut().expect_block(0xe2, &[]);

        let mut buf = [0u8; 8];
        let result = block_on(se.transceive(&[0x01, 0x02, 0x03, 0x04], &mut buf));
        assert_eq!(result, Err(Error::TransceiveAborted));
        // Counters keep their pre-call values.
        assert_eq!(se.session.send_counter, 0);
        assert_eq!(se.session.receive_counter, 0);
        assert!(se.transport().done());
    }

    #[test]
    fn abort_during_receive_chain() {
        let mut se = engine();
        se.transport_mut().expect_block(0x00, &[0x01]);
        se.transport_mut().queue_block(0x20, &[0xf1]);
        se.transport_mut().expect_block(0x90, &[]);
        se.transport_mut().queue_block(0xc2, &[]);
        se.transport_mut().expect_block(0xe2, &[]);

        let mut buf = [0u8; 8];
        let result = block_on(se.transceive(&[0x01], &mut buf));
        assert_eq!(result, Err(Error::TransceiveAborted));
        assert!(se.transport().done());
    }

    /// CIP with SPI PLID: DLLP parameters are applied, the physical layer
    /// step is skipped.
    #[test]
    fn activation_negotiates_parameters() {
        let cip = [
            0x01, 0x03, 0x00, 0x00, 0x00, 0x01, 0x0c, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x00, 0x00, 0x00, 0x00, 0x00, 0x04, 0x00, 0x80, 0x00, 0x80, 0x00,
        ];
        let mut se = engine();
        se.session.send_counter = 1;
        se.session.receive_counter = 1;
        se.transport_mut().expect_block(0xc4, &[]);
        se.transport_mut().queue_block(0xe4, &cip);
        se.transport_mut().expect_block(0xc0, &[]);
        se.transport_mut().queue_block(0xe0, &[]);

        block_on(se.activate()).unwrap();
        assert_eq!(se.bwt(), Duration::from_millis(0x80));
        assert_eq!(se.ifsc(), 0x80);
        assert_eq!(se.session.send_counter, 0);
        assert_eq!(se.session.receive_counter, 0);
        assert_eq!(se.transport().clock, Some(DEFAULT_CLOCK_FREQUENCY));
        assert!(se.transport().done());
    }

    #[test]
    fn activation_applies_i2c_parameters() {
        let cip = [
            0x01, // version
            0x03, 0x11, 0x22, 0x33, // iin
            0x02, // plid = I2C
            0x08, 0x00, 0x0a, 0x03, 0xe8, 0x05, 0x05, 0x00, 0x64, // plp, mcf 1000 kHz, mpot 5
            0x04, 0x01, 0x2c, 0x00, 0x20, // dllp, bwt 300 ms, ifsc 0x20
            0x00, // hb_len
        ];
        let mut se = engine();
        se.transport_mut().expect_block(0xc4, &[]);
        se.transport_mut().queue_block(0xe4, &cip);
        se.transport_mut().expect_block(0xc0, &[]);
        se.transport_mut().queue_block(0xe0, &[]);

        block_on(se.activate()).unwrap();
        assert_eq!(se.bwt(), Duration::from_millis(300));
        assert_eq!(se.ifsc(), 0x20);
        assert_eq!(se.session.mpot, Duration::from_micros(500));
        assert_eq!(se.transport().clock, Some(1_000_000));
        assert_eq!(se.transport().bus_timeout, Some(Duration::from_millis(300)));
        assert!(se.transport().done());
    }

    #[test]
    fn activation_rejects_bad_cip() {
        // dllp advertises an IFSC beyond the protocol maximum
        let cip = [
            0x01, 0x03, 0x11, 0x22, 0x33, 0x02, 0x08, 0x00, 0x0a, 0x03, 0xe8, 0x05, 0x05, 0x00,
            0x64, 0x04, 0x01, 0x2c, 0x0f, 0xfa, 0x00,
        ];
        let mut se = engine();
        se.transport_mut().expect_block(0xc4, &[]);
        se.transport_mut().queue_block(0xe4, &cip);

        assert_eq!(block_on(se.activate()), Err(Error::InvalidCipField));
        assert!(se.transport().done());
    }

    #[test]
    fn chained_receive_with_forced_ack() {
        let mut se = engine();
        se.transport_mut().expect_block(0x00, &[0x01, 0x02]);
        se.transport_mut().queue_block(0x20, &[0xf1]);
        se.transport_mut().expect_block(0x90, &[]);
        // zero length I-block in the middle of the chain
        se.transport_mut().queue_block(0x60, &[]);
        se.transport_mut().expect_block(0x80, &[]);
        se.transport_mut().queue_block(0x00, &[0xf2, 0xf3]);

        let mut buf = [0u8; 8];
        let response = block_on(se.transceive(&[0x01, 0x02], &mut buf)).unwrap();
        assert_eq!(response, &[0xf1, 0xf2, 0xf3]);
        assert_eq!(se.session.receive_counter, 1);
        assert!(se.transport().done());
    }

    #[test]
    fn final_chunk_acknowledged_by_r_block() {
        let mut se = engine();
        se.transport_mut().expect_block(0x00, &[0x01, 0x02]);
        se.transport_mut().queue_block(0x90, &[]);
        // The engine prompts for the response with R(CRC error).
        se.transport_mut().expect_block(0x81, &[]);
        se.transport_mut().queue_block(0x00, &[0xf1, 0xf2]);

        let mut buf = [0u8; 8];
        let response = block_on(se.transceive(&[0x01, 0x02], &mut buf)).unwrap();
        assert_eq!(response, &[0xf1, 0xf2]);
        assert_eq!(se.session.send_counter, 1);
        assert!(se.transport().done());
    }

    #[test]
    fn retry_budget_exhausted_by_crc_errors() {
        let mut se = engine();
        se.transport_mut().expect_block(0x00, &[0x01, 0x02]);
        se.transport_mut().queue_corrupt_block(0x00, &[0xf1, 0xf2]);
        se.transport_mut().expect_block(0x81, &[]);
        se.transport_mut().queue_corrupt_block(0x00, &[0xf1, 0xf2]);
        se.transport_mut().expect_block(0x81, &[]);
        se.transport_mut().queue_corrupt_block(0x00, &[0xf1, 0xf2]);

        let mut buf = [0u8; 8];
        let result = block_on(se.transceive(&[0x01, 0x02], &mut buf));
        assert_eq!(result, Err(Error::InvalidBlock));
        assert!(se.transport().done());
    }

    #[test]
    fn poll_window_expiry_surfaces_too_little_data() {
        let mut se = engine();
        se.set_bwt(Duration::from_millis(20));
        se.transport_mut().expect_block(0x00, &[0x01, 0x02]);
        se.transport_mut().expect_block(0x81, &[]);
        se.transport_mut().expect_block(0x81, &[]);

        let mut buf = [0u8; 8];
        let result = block_on(se.transceive(&[0x01, 0x02], &mut buf));
        assert_eq!(result, Err(Error::TooLittleData));
        assert!(se.transport().done());
    }

    #[test]
    fn crc_errors_within_budget_on_every_block() {
        let mut se = engine();
        se.transport_mut().expect_block(0x00, &[0x01]);
        se.transport_mut().queue_corrupt_block(0x20, &[0xaa]);
        se.transport_mut().expect_block(0x81, &[]);
        se.transport_mut().queue_block(0x20, &[0xaa]);
        se.transport_mut().expect_block(0x90, &[]);
        se.transport_mut().queue_corrupt_block(0x40, &[0xbb]);
        se.transport_mut().expect_block(0x91, &[]);
        se.transport_mut().queue_block(0x40, &[0xbb]);

        let mut buf = [0u8; 8];
        let response = block_on(se.transceive(&[0x01], &mut buf)).unwrap();
        assert_eq!(response, &[0xaa, 0xbb]);
        assert!(se.transport().done());
    }

    #[test]
    fn i_block_while_chunks_remain_is_invalid() {
        let mut se = engine();
        se.session.ifsc = 2;
        se.transport_mut().expect_block(0x20, &[0x01, 0x02]);
        se.transport_mut().queue_block(0x00, &[0xf1, 0xf2]);

        let mut buf = [0u8; 8];
        let result = block_on(se.transceive(&[0x01, 0x02, 0x03, 0x04], &mut buf));
        assert_eq!(result, Err(Error::InvalidBlock));
        assert!(se.transport().done());
    }

    #[test]
    fn unknown_block_is_invalid() {
        let mut se = engine();
        se.transport_mut().expect_block(0x00, &[0x01]);
        // S-block with an undefined subtype
        se.transport_mut().queue_block(0xc5, &[]);

        let mut buf = [0u8; 8];
        let result = block_on(se.transceive(&[0x01], &mut buf));
        assert_eq!(result, Err(Error::InvalidBlock));
        assert!(se.transport().done());
    }

    #[test]
    fn empty_request_is_rejected() {
        let mut se = engine();
        let mut buf = [0u8; 8];
        assert_eq!(
            block_on(se.transceive(&[], &mut buf)),
            Err(Error::IllegalArgument)
        );
    }

    #[test]
    fn response_buffer_too_small() {
        let mut se = engine();
        se.transport_mut().expect_block(0x00, &[0x01]);
        se.transport_mut().queue_block(0x00, &[0xf1, 0xf2, 0xf3]);

        let mut buf = [0u8; 2];
        let result = block_on(se.transceive(&[0x01], &mut buf));
        assert_eq!(result, Err(Error::IllegalArgument));
    }

    #[test]
    fn set_ifsd_short_form() {
        let mut se = engine();
        se.transport_mut().expect_block(0xc1, &[0x7a]);
        se.transport_mut().queue_block(0xe1, &[0x7a]);
        block_on(se.set_ifsd(0x7a)).unwrap();
        assert!(se.transport().done());
    }

    #[test]
    fn set_ifsd_long_form() {
        let mut se = engine();
        se.transport_mut().expect_block(0xc1, &[0x00, 0x01, 0x23]);
        se.transport_mut().queue_block(0xe1, &[0x00, 0x01, 0x23]);
        block_on(se.set_ifsd(0x123)).unwrap();
        assert!(se.transport().done());
    }

    #[test]
    fn set_ifsd_rejects_out_of_range_values() {
        let mut se = engine();
        assert_eq!(block_on(se.set_ifsd(0)), Err(Error::IllegalArgument));
        assert_eq!(block_on(se.set_ifsd(0xffa)), Err(Error::IllegalArgument));
        assert!(se.transport().done());
    }

    #[test]
    fn set_ifsd_echo_mismatch() {
        let mut se = engine();
        se.transport_mut().expect_block(0xc1, &[0x7a]);
        se.transport_mut().queue_block(0xe1, &[0x7b]);
        assert_eq!(block_on(se.set_ifsd(0x7a)), Err(Error::InvalidBlock));
        assert!(se.transport().done());
    }

    #[test]
    fn s_request_repeated_on_mismatched_response_type() {
        let mut se = engine();
        se.transport_mut().expect_block(0xc0, &[]);
        // S(SWR response) instead of S(RESYNCH response)
        se.transport_mut().queue_block(0xef, &[]);
        se.transport_mut().expect_block(0xc0, &[]);
        se.transport_mut().queue_block(0xe0, &[]);

        block_on(se.resynch()).unwrap();
        assert!(se.transport().done());
    }

    #[test]
    fn s_request_answered_with_stale_r_block_fails_fast() {
        let mut se = engine();
        se.transport_mut().expect_block(0xc0, &[]);
        // R(1) while our send counter is 0
        se.transport_mut().queue_block(0x90, &[]);

        assert_eq!(block_on(se.resynch()), Err(Error::InvalidBlock));
        assert!(se.transport().done());
    }

    #[test]
    fn resynch_resets_counters() {
        let mut se = engine();
        se.session.send_counter = 1;
        se.session.receive_counter = 1;
        se.transport_mut().expect_block(0xc0, &[]);
        se.transport_mut().queue_block(0xe0, &[]);

        block_on(se.resynch()).unwrap();
        assert_eq!(se.session.send_counter, 0);
        assert_eq!(se.session.receive_counter, 0);
        assert!(se.transport().done());
    }

    #[test]
    fn soft_reset_resets_counters() {
        let mut se = engine();
        se.session.send_counter = 1;
        se.transport_mut().expect_block(0xcf, &[]);
        se.transport_mut().queue_block(0xef, &[]);

        block_on(se.soft_reset()).unwrap();
        assert_eq!(se.session.send_counter, 0);
        assert!(se.transport().done());
    }

    /// Long request chained out in IFSC sized chunks, response fragmented
    /// by the card into uneven pieces.
    #[test]
    fn long_chain_round_trip() {
        let request: Vec<u8> = (0u16..100).map(|i| i as u8).collect();
        let response: Vec<u8> = (0u16..57).map(|i| (0xff - i) as u8).collect();

        let mut se = engine();
        let ifsc = se.ifsc() as usize;
        let chunks = request.len().div_ceil(ifsc);
        assert_eq!(chunks, 13);

        // Send chain: every chunk acknowledged, the last one answered with
        // the first response fragment.
        for i in 0..chunks {
            let chunk = &request[i * ifsc..request.len().min((i + 1) * ifsc)];
            let ns = (i % 2) as u8;
            let more = i + 1 < chunks;
            se.transport_mut()
                .expect_block((ns << 6) | if more { 0x20 } else { 0x00 }, chunk);
            if more {
                let nr = ((i + 1) % 2) as u8;
                se.transport_mut().queue_block(0x80 | (nr << 4), &[]);
            }
        }

        // Receive chain: uneven fragment sizes, host acks in between.
        let sizes = [3usize, 1, 7, 5, 9, 2, 4, 6, 8];
        let mut fragments = Vec::new();
        let mut taken = 0;
        for size in sizes.iter().cycle() {
            if taken == response.len() {
                break;
            }
            let end = response.len().min(taken + size);
            fragments.push(&response[taken..end]);
            taken = end;
        }
        for (j, fragment) in fragments.iter().enumerate() {
            let ns = (j % 2) as u8;
            let more = j + 1 < fragments.len();
            se.transport_mut()
                .queue_block((ns << 6) | if more { 0x20 } else { 0x00 }, fragment);
            if more {
                let nr = ((j + 1) % 2) as u8;
                se.transport_mut().expect_block(0x80 | (nr << 4), &[]);
            }
        }

        let mut buf = [0u8; 256];
        let answer = block_on(se.transceive(&request, &mut buf)).unwrap();
        assert_eq!(answer, &response[..]);
        assert!(se.transport().done());
    }

    #[test]
    fn ifs_encoding_forms() {
        let mut buf = [0u8; 3];
        assert_eq!(encode_ifs(0x01, &mut buf), Ok(1));
        assert_eq!(buf[0], 0x01);
        assert_eq!(encode_ifs(0xfe, &mut buf), Ok(1));
        assert_eq!(buf[0], 0xfe);
        assert_eq!(encode_ifs(0xff, &mut buf), Ok(3));
        assert_eq!(buf, [0x00, 0x00, 0xff]);
        assert_eq!(encode_ifs(0xff9, &mut buf), Ok(3));
        assert_eq!(buf, [0x00, 0x0f, 0xf9]);
        assert_eq!(encode_ifs(0, &mut buf), Err(Error::IllegalArgument));
        assert_eq!(encode_ifs(0xffa, &mut buf), Err(Error::IllegalArgument));
    }

    #[test]
    fn ifs_decoding_forms() {
        assert_eq!(decode_ifs(&[0x08]), Ok(0x08));
        assert_eq!(decode_ifs(&[0x01, 0x23]), Ok(0x123));
        assert_eq!(decode_ifs(&[0x00, 0x0f, 0xf9]), Ok(0xff9));
        assert_eq!(decode_ifs(&[]), Err(Error::IllegalArgument));
        assert_eq!(decode_ifs(&[0x00]), Err(Error::IllegalArgument));
        assert_eq!(decode_ifs(&[0x0f, 0xfa]), Err(Error::IllegalArgument));
        assert_eq!(
            decode_ifs(&[0x01, 0x00, 0x08]),
            Err(Error::IllegalArgument)
        );
    }
}
