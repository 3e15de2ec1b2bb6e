//! Reassembly of VBus frames from a raw byte stream.
//!
//! [`Reassembler`] is the sans-I/O core: bytes go in one at a time, at
//! most one [`Frame`] comes out per byte. [`FrameReader`] drives a
//! `Reassembler` from any [`Read`](std::io::Read) instance (a serial
//! port, a file, a byte slice) and yields frames through the
//! [`Frames`] iterator.

use std::collections::VecDeque;
use std::io::Read;
use std::mem;

use chrono::{DateTime, Local};
use log::{debug, trace, warn};

use crate::frame::{
    calc_checksum, buff_dst_addr, buff_src_addr, DatagramMsg, Frame, GarbageMsg, PacketMsg,
    TelegramMsg, BASE_HEADER_LEN, SOF,
};

/// Byte-stream state machine that recognizes the four VBus protocol
/// variants.
///
/// Payload bytes on the bus are 7-bit; the sync byte `0xAA` is the only
/// legal byte with the high bit set. Anything else with a high bit is
/// framing noise and flushes the partial message as garbage. A new sync
/// byte likewise flushes whatever was accumulated before it.
#[derive(Debug, Default)]
pub struct Reassembler {
    receiving: bool,
    msg_start: Option<DateTime<Local>>,
    buf: Vec<u8>,
    protocol: Option<u8>,
    expected_len: usize,
}

impl Reassembler {
    pub fn new() -> Reassembler {
        Reassembler::default()
    }

    /// Feeds one byte into the state machine, stamped with the time it
    /// was received. Never fails and never blocks; undecodable input is
    /// reported as [`Frame::Garbage`].
    pub fn push(&mut self, byte: u8, now: DateTime<Local>) -> Option<Frame> {
        if byte == SOF {
            let flushed = if self.buf.is_empty() {
                None
            } else {
                Some(self.flush_garbage(now))
            };
            trace!("sync byte");
            self.buf.push(SOF);
            self.msg_start = Some(now);
            self.receiving = true;
            self.protocol = None;
            self.expected_len = 0;
            return flushed;
        }

        if byte & 0x80 != 0 {
            if self.buf.is_empty() {
                self.msg_start = Some(now);
            }
            self.buf.push(byte);
            self.receiving = false;
            return Some(self.flush_garbage(now));
        }

        if !self.receiving {
            // 7-bit byte outside a message, e.g. after a dropped header.
            return None;
        }

        self.buf.push(byte);

        if self.buf.len() == BASE_HEADER_LEN {
            let protocol = self.buf[5];
            debug!(
                "base header: 0x{:04X} -> 0x{:04X}, protocol 0x{:02X}",
                buff_src_addr(&self.buf),
                buff_dst_addr(&self.buf),
                protocol
            );
            self.protocol = Some(protocol);
        }

        match self.protocol {
            Some(PacketMsg::PROTOCOL) => {
                if self.buf.len() == PacketMsg::HEADER_LEN {
                    let frames = PacketMsg::buff_frame_count(&self.buf) as usize;
                    let got = self.buf[PacketMsg::HEADER_LEN - 1];
                    let want = calc_checksum(&self.buf[1..PacketMsg::HEADER_LEN - 1]);
                    if got != want {
                        warn!("packet header checksum error: got 0x{:02X}, want 0x{:02X}", got, want);
                        self.receiving = false;
                        return None;
                    }
                    self.expected_len = PacketMsg::HEADER_LEN + frames * PacketMsg::FRAME_LEN;
                }
                if self.buf.len() == self.expected_len {
                    let start = self.take_start(now);
                    let msg = PacketMsg::from_buf(start, now, &self.buf);
                    if !msg.checksum_ok {
                        // A packet is only a packet if every frame
                        // checksum holds.
                        warn!("payload frame checksum error, flushing message as garbage");
                        let bytes = mem::take(&mut self.buf);
                        self.reset();
                        return Some(Frame::Garbage(GarbageMsg {
                            start,
                            end: now,
                            bytes,
                        }));
                    }
                    self.reset();
                    return Some(Frame::Packet(msg));
                }
            }
            Some(DatagramMsg::PROTOCOL) => {
                if self.buf.len() == DatagramMsg::DATAGRAM_LEN {
                    let msg = DatagramMsg::from_buf(self.take_start(now), now, &self.buf);
                    self.reset();
                    return Some(Frame::Datagram(msg));
                }
            }
            Some(TelegramMsg::PROTOCOL_3V0) => {
                if self.buf.len() == TelegramMsg::TELEGRAM_3V0_LEN {
                    let msg = TelegramMsg::from_buf(self.take_start(now), now, &self.buf);
                    self.reset();
                    return Some(Frame::Telegram(msg));
                }
            }
            Some(TelegramMsg::PROTOCOL_3V1) => {
                // v3.1 lengths are unknown; the base header is all that
                // can be framed. Trailing bytes surface as garbage at
                // the next sync byte.
                let msg = TelegramMsg::from_buf(self.take_start(now), now, &self.buf);
                self.reset();
                return Some(Frame::Telegram(msg));
            }
            // Unknown protocol: keep accumulating until the stream
            // resynchronizes, then everything flushes as garbage.
            _ => {}
        }

        None
    }

    fn take_start(&mut self, now: DateTime<Local>) -> DateTime<Local> {
        self.msg_start.take().unwrap_or(now)
    }

    fn flush_garbage(&mut self, now: DateTime<Local>) -> Frame {
        let start = self.take_start(now);
        let bytes = mem::take(&mut self.buf);
        debug!("flushing {} byte(s) of garbage", bytes.len());
        self.protocol = None;
        self.expected_len = 0;
        Frame::Garbage(GarbageMsg {
            start,
            end: now,
            bytes,
        })
    }

    fn reset(&mut self) {
        self.buf.clear();
        self.receiving = false;
        self.protocol = None;
        self.expected_len = 0;
        self.msg_start = None;
    }
}

/// [`FrameReader`] configuration.
#[derive(Debug, Clone, Default)]
pub struct ReaderOptions {
    /// Whether to keep reading after a timed-out read. Serial ports
    /// surface idle line time as `TimedOut` errors; set this when the
    /// source is a port rather than a file.
    pub ignore_timeout: bool,
}

/// Reads bytes from a [`Read`](Read) instance and reassembles them into
/// VBus frames.
pub struct FrameReader<R>
where
    R: Read,
{
    reader: R,
    options: ReaderOptions,
    reassembler: Reassembler,
    pending: VecDeque<Frame>,
}

impl<R> FrameReader<R>
where
    R: Read,
{
    pub fn new(reader: R, options: ReaderOptions) -> FrameReader<R> {
        FrameReader {
            reader,
            options,
            reassembler: Reassembler::new(),
            pending: VecDeque::new(),
        }
    }

    /// Returns a reference to the underlying [`Read`](Read).
    pub fn get_ref(&self) -> &R {
        &self.reader
    }

    /// Returns a mutable reference to the underlying [`Read`](Read).
    pub fn get_mut(&mut self) -> &mut R {
        &mut self.reader
    }

    /// Returns an iterator over reassembled [`Frame`](Frame)s. Iteration
    /// ends on EOF; I/O errors other than the tolerated timeouts are
    /// yielded as `Err`.
    pub fn frames(&mut self) -> Frames<R> {
        Frames { reader: self }
    }

    fn next_frame(&mut self) -> Result<Option<Frame>, std::io::Error> {
        loop {
            if let Some(frame) = self.pending.pop_front() {
                return Ok(Some(frame));
            }

            let mut chunk = [0u8; 64];
            match self.reader.read(&mut chunk) {
                Ok(0) => return Ok(None),
                Ok(n) => {
                    let now = Local::now();
                    for &byte in &chunk[..n] {
                        if let Some(frame) = self.reassembler.push(byte, now) {
                            self.pending.push_back(frame);
                        }
                    }
                }
                Err(e) => match e.kind() {
                    std::io::ErrorKind::Interrupted => continue,
                    std::io::ErrorKind::TimedOut if self.options.ignore_timeout => continue,
                    _ => return Err(e),
                },
            }
        }
    }
}

/// Iterator that yields [`Frame`](Frame)s.
pub struct Frames<'a, R>
where
    R: Read,
{
    reader: &'a mut FrameReader<R>,
}

impl<'a, R> Iterator for Frames<'a, R>
where
    R: Read,
{
    type Item = Result<Frame, std::io::Error>;

    fn next(&mut self) -> Option<Self::Item> {
        self.reader.next_frame().transpose()
    }
}
