//! # `vbus`
//!
//! A decoder for the [RESOL VBus][vbus-spec] serial home-automation
//! protocol, and the machinery to bridge decoded field values onto an
//! MQTT message bus.
//!
//! The decoding side is sans-I/O: [`Reassembler`](Reassembler) takes
//! raw bytes and emits [`Frame`](Frame)s: v1.0 packets with their
//! checksums verified and the septet encoding undone, v2.0 datagrams,
//! v3.x telegrams, and garbage for anything that would not frame.
//! [`FrameReader`](FrameReader) drives a reassembler from any
//! [`Read`](std::io::Read) instance:
//!
//! ```
//! use vbus::{FrameReader, ReaderOptions};
//!
//! // or a serial port, or anything else that implements std::io::Read
//! let stream: &[u8] = &[
//!     // ...
//! ];
//! let mut reader = FrameReader::new(stream, ReaderOptions::default());
//! for frame in reader.frames() {
//!     // ...
//! }
//! ```
//!
//! Payloads of v1.0 packets are decoded against a VBus Specification
//! File loaded with [`VbusSpec`](VbusSpec), yielding named numeric
//! values. The [`dispatch`](dispatch) module stores those values and
//! publishes them according to configured transfers; [`config`](config)
//! holds the JSON5 configuration model the `vbus2mqtt` daemon consumes.
//!
//! [vbus-spec]: https://danielwippermann.github.io/resol-vbus/#/md/docs/vbus-specification

pub mod config;
pub mod dispatch;
pub mod frame;
pub mod mqtt;
pub mod reassembler;
pub mod serial;
pub mod stats;
pub mod value;
pub mod vsf;

pub use chrono;

pub use frame::{calc_checksum, septet_deflate, septet_inflate, Frame};
pub use reassembler::{FrameReader, Frames, ReaderOptions, Reassembler};
pub use value::Value;
pub use vsf::{Language, VbusSpec, VsfError};
