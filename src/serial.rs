//! The reader context: a dedicated thread that drains the serial port,
//! reassembles frames, decodes matched packets against the VBus
//! specification and hands the resulting field batches to the
//! dispatcher's owning thread over a channel.

use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Local};
use log::{debug, error, info, warn};

use crate::config::VbusConfig;
use crate::frame::Frame;
use crate::reassembler::Reassembler;
use crate::stats::CommStats;
use crate::value::Value;
use crate::vsf::{FieldType, VbusSpec};

/// Serial read timeout. Expiry is idle time, not an error.
const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Backoff before re-opening a failed port.
const REOPEN_DELAY: Duration = Duration::from_secs(1);

/// A batch of decoded field values, stamped with the reception time of
/// the frame they came from.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldBatch {
    pub values: Vec<(String, Value)>,
    pub timestamp: DateTime<Local>,
}

/// Handle to the reader thread.
pub struct SerialReader {
    handle: JoinHandle<()>,
    stop: Arc<AtomicBool>,
}

impl SerialReader {
    /// Opens the port and spawns the reader thread. An unopenable port
    /// is a startup failure; later failures are retried inside the
    /// thread.
    pub fn spawn(
        cfg: &VbusConfig,
        spec: Arc<VbusSpec>,
        stats: Arc<CommStats>,
        tx: Sender<FieldBatch>,
        stop: Arc<AtomicBool>,
    ) -> Result<SerialReader, serialport::Error> {
        let port = open_port(&cfg.serialport, cfg.baudrate)?;
        let path = cfg.serialport.clone();
        let baudrate = cfg.baudrate;
        let thread_stop = Arc::clone(&stop);
        let handle = thread::spawn(move || {
            run(port, &path, baudrate, &spec, &stats, &tx, &thread_stop);
        });
        Ok(SerialReader { handle, stop })
    }

    /// Signals the thread to stop and waits for it to exit.
    pub fn stop(self) {
        self.stop.store(true, Ordering::Relaxed);
        if self.handle.join().is_err() {
            error!("reader thread panicked");
        }
    }
}

fn open_port(path: &str, baudrate: u32) -> Result<Box<dyn serialport::SerialPort>, serialport::Error> {
    serialport::new(path, baudrate)
        .timeout(READ_TIMEOUT)
        .open()
}

fn run(
    mut port: Box<dyn serialport::SerialPort>,
    path: &str,
    baudrate: u32,
    spec: &VbusSpec,
    stats: &CommStats,
    tx: &Sender<FieldBatch>,
    stop: &AtomicBool,
) {
    info!("reader started on {}", path);
    let mut reassembler = Reassembler::new();
    let mut chunk = [0u8; 256];

    while !stop.load(Ordering::Relaxed) {
        match port.read(&mut chunk) {
            Ok(n) => {
                let now = Local::now();
                for &byte in &chunk[..n] {
                    if let Some(frame) = reassembler.push(byte, now) {
                        handle_frame(frame, spec, stats, tx);
                    }
                }
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::TimedOut
                    || e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => {
                warn!("serial read failed: {}; re-opening {}", e, path);
                thread::sleep(REOPEN_DELAY);
                match open_port(path, baudrate) {
                    Ok(reopened) => {
                        port = reopened;
                        reassembler = Reassembler::new();
                    }
                    Err(e) => {
                        error!("could not re-open serial port {}: {}", path, e);
                        return;
                    }
                }
            }
        }
    }
    info!("reader stopped");
}

/// Frame bookkeeping and decoding. Garbage and checksum failures count
/// as receive errors; every valid frame counts as a received message;
/// valid v1.0 packets additionally decode into a field batch.
fn handle_frame(frame: Frame, spec: &VbusSpec, stats: &CommStats, tx: &Sender<FieldBatch>) {
    let now = frame.end();
    if !frame.checksum_ok() {
        stats.record_error(now);
        debug!("dropping frame with bad checksum or framing");
        return;
    }
    stats.record_message(now);

    let packet = match frame {
        Frame::Packet(packet) => packet,
        _ => return,
    };

    let template = match spec.packet(packet.src, packet.dst, Some(packet.command)) {
        Some(template) => template,
        None => {
            debug!("no packet template for {}", packet.full_id());
            return;
        }
    };

    let decoded = match template.decode(&packet.payload) {
        Ok(decoded) => decoded,
        Err(e) => {
            stats.record_error(now);
            warn!("could not decode {}: {}", packet.full_id(), e);
            return;
        }
    };

    let values = decoded
        .into_iter()
        .map(|(field, value)| {
            let value = match value {
                // Keep reported numbers at their field precision.
                Value::Float(v) if field.field_type == FieldType::Number => {
                    let scale = 10f64.powi(field.precision);
                    Value::Float((v * scale).round() / scale)
                }
                other => other,
            };
            (field.full_id(template), value)
        })
        .collect();

    if tx
        .send(FieldBatch {
            values,
            timestamp: now,
        })
        .is_err()
    {
        debug!("dispatcher is gone; dropping batch");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{calc_checksum, septet_inflate, PacketMsg, SOF};
    use crate::vsf::{FieldPart, PacketField, PacketTemplate};
    use std::sync::mpsc;

    fn test_spec() -> VbusSpec {
        VbusSpec::with_packet_templates(vec![PacketTemplate {
            dst_addr: 0x0010,
            dst_mask: 0xFFFF,
            src_addr: 0x4211,
            src_mask: 0xFFFF,
            command: 0x0100,
            fields: vec![PacketField {
                id_text: "000_2_0".to_owned(),
                name_index: 0,
                unit_id: 0,
                precision: 1,
                field_type: FieldType::Number,
                parts: vec![
                    FieldPart {
                        offset: 0,
                        bit_pos: 0,
                        mask: 0xFF,
                        is_signed: false,
                        factor: 1,
                    },
                    FieldPart {
                        offset: 1,
                        bit_pos: 0,
                        mask: 0xFF,
                        is_signed: true,
                        factor: 256,
                    },
                ],
            }],
        }])
    }

    fn packet(payload: &[u8]) -> Frame {
        let mut buf = vec![SOF];
        buf.extend(&0x0010u16.to_le_bytes());
        buf.extend(&0x4211u16.to_le_bytes());
        buf.push(PacketMsg::PROTOCOL);
        buf.extend(&0x0100u16.to_le_bytes());
        buf.push((payload.len() / 4) as u8);
        buf.push(calc_checksum(&buf[1..9]));
        for four in payload.chunks(4) {
            let mut frame = septet_inflate(four);
            frame.push(calc_checksum(&frame));
            buf.extend(frame);
        }

        let now = Local::now();
        let mut r = Reassembler::new();
        buf.iter()
            .filter_map(|b| r.push(*b, now))
            .next()
            .expect("stream must reassemble into one frame")
    }

    #[test]
    fn valid_packet_decodes_into_a_batch() {
        let spec = test_spec();
        let stats = CommStats::new();
        let (tx, rx) = mpsc::channel();

        // 0x00D7 = 215 -> 21.5 after precision scaling.
        handle_frame(packet(&[0xD7, 0x00, 0x00, 0x00]), &spec, &stats, &tx);

        let batch = rx.try_recv().unwrap();
        assert_eq!(batch.values.len(), 1);
        assert_eq!(batch.values[0].0, "00_0010_4211_10_0100_000_2_0");
        assert_eq!(batch.values[0].1, Value::Float(21.5));
        assert_eq!(stats.rxmsg_cnt(), 1);
        assert_eq!(stats.rxerr_cnt(), 0);
    }

    #[test]
    fn garbage_counts_as_error() {
        let spec = test_spec();
        let stats = CommStats::new();
        let (tx, rx) = mpsc::channel();

        let now = Local::now();
        let mut r = Reassembler::new();
        r.push(SOF, now);
        let garbage = r.push(SOF, now).unwrap();
        handle_frame(garbage, &spec, &stats, &tx);

        assert!(rx.try_recv().is_err());
        assert_eq!(stats.rxmsg_cnt(), 0);
        assert_eq!(stats.rxerr_cnt(), 1);
    }

    #[test]
    fn unmatched_packet_counts_as_message_only() {
        let spec = VbusSpec::with_packet_templates(vec![]);
        let stats = CommStats::new();
        let (tx, rx) = mpsc::channel();

        handle_frame(packet(&[0x00, 0x00, 0x00, 0x00]), &spec, &stats, &tx);

        assert!(rx.try_recv().is_err());
        assert_eq!(stats.rxmsg_cnt(), 1);
    }
}
