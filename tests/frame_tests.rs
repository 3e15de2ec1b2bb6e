//! Byte-stream reassembly tests driven through the public API.

use vbus::chrono::Local;
use vbus::frame::{DatagramCommand, SOF};
use vbus::{calc_checksum, septet_deflate, septet_inflate, Frame, FrameReader, ReaderOptions, Reassembler};

fn feed(bytes: &[u8]) -> Vec<Frame> {
    let now = Local::now();
    let mut r = Reassembler::new();
    bytes.iter().filter_map(|b| r.push(*b, now)).collect()
}

fn v1_message(dst: u16, src: u16, command: u16, payload: &[u8]) -> Vec<u8> {
    assert!(payload.len() % 4 == 0);
    let mut buf = vec![SOF];
    buf.extend(&dst.to_le_bytes());
    buf.extend(&src.to_le_bytes());
    buf.push(0x10);
    buf.extend(&command.to_le_bytes());
    buf.push((payload.len() / 4) as u8);
    buf.push(calc_checksum(&buf[1..9]));
    for chunk in payload.chunks(4) {
        let mut frame = septet_inflate(chunk);
        frame.push(calc_checksum(&frame));
        buf.extend(frame);
    }
    buf
}

#[test]
fn checksum_oracle() {
    assert_eq!(
        calc_checksum(&[0x10, 0x00, 0x20, 0x00, 0x7E, 0x10, 0x00, 0x01]),
        0x40
    );
}

#[test]
fn septet_decode_oracle() {
    assert_eq!(
        septet_deflate(&[0x01, 0x02, 0x03, 0x04, 0x05, 0x05]),
        vec![0x81, 0x02, 0x83, 0x04, 0x05]
    );
}

#[test]
fn septet_round_trips() {
    let cases: &[&[u8]] = &[
        &[],
        &[0x00],
        &[0x7F],
        &[0x80],
        &[0xFF, 0x00, 0xFF],
        &[0x01, 0x82, 0x03, 0x84, 0x05, 0x86, 0x07],
    ];
    for case in cases {
        assert_eq!(&septet_deflate(&septet_inflate(case)), case);
    }
}

#[test]
fn sync_resync_produces_two_garbage_frames() {
    let frames = feed(&[SOF, SOF, SOF]);
    assert_eq!(frames.len(), 2);
    for frame in &frames {
        match frame {
            Frame::Garbage(g) => assert_eq!(g.bytes.len(), 1),
            other => panic!("expected garbage, got {:?}", other),
        }
    }
}

#[test]
fn high_bit_noise_flushes_the_partial_message() {
    let frames = feed(&[SOF, 0x01, 0xFF]);
    assert_eq!(frames.len(), 1);
    match &frames[0] {
        Frame::Garbage(g) => assert_eq!(g.bytes, vec![0xAA, 0x01, 0xFF]),
        other => panic!("expected garbage, got {:?}", other),
    }
}

#[test]
fn v1_packet_end_to_end() {
    let payload = [0x07, 0x01, 0x00, 0x00, 0x80, 0x00, 0x00, 0x00];
    let frames = feed(&v1_message(0x0010, 0x7E11, 0x0100, &payload));
    assert_eq!(frames.len(), 1);
    match &frames[0] {
        Frame::Packet(p) => {
            assert_eq!((p.dst, p.src, p.command), (0x0010, 0x7E11, 0x0100));
            assert_eq!(p.payload, payload);
            assert!(p.checksum_ok);
            assert!(p.end >= p.start);
        }
        other => panic!("expected packet, got {:?}", other),
    }
}

#[test]
fn no_v1_packet_with_bad_header_checksum() {
    let mut stream = v1_message(0x0010, 0x7E11, 0x0100, &[0x01, 0x02, 0x03, 0x04]);
    stream[9] = stream[9].wrapping_add(1);
    assert!(feed(&stream).is_empty());
}

#[test]
fn no_v1_packet_with_bad_frame_checksum() {
    let mut stream = v1_message(0x0010, 0x7E11, 0x0100, &[0x01, 0x02, 0x03, 0x04]);
    let last = stream.len() - 1;
    stream[last] ^= 0x7F;
    let frames = feed(&stream);
    assert_eq!(frames.len(), 1);
    match &frames[0] {
        Frame::Garbage(g) => assert_eq!(g.bytes.len(), stream.len()),
        other => panic!("expected garbage, got {:?}", other),
    }
}

#[test]
fn mixed_stream_through_the_frame_reader() {
    let mut stream = Vec::new();
    stream.extend(&[0x13, 0x37]); // leading noise, dropped silently
    stream.extend(v1_message(0x0010, 0x7E11, 0x0100, &[0x01, 0x02, 0x03, 0x04]));
    stream.push(0xF0); // framing noise between messages
    stream.extend(v1_message(0x0015, 0x4211, 0x0200, &[]));

    // datagram
    let mut dgram = vec![SOF];
    dgram.extend(&0x0000u16.to_le_bytes());
    dgram.extend(&0x7E11u16.to_le_bytes());
    dgram.push(0x20);
    dgram.extend(&0x0100u16.to_le_bytes());
    dgram.extend(&7i16.to_le_bytes());
    dgram.extend(septet_inflate(&[0xEF, 0xBE, 0xAD, 0xDE]));
    dgram.push(calc_checksum(&dgram[1..15]));
    stream.extend(dgram);

    let mut reader = FrameReader::new(&stream[..], ReaderOptions::default());
    let frames: Vec<Frame> = reader.frames().map(|f| f.unwrap()).collect();

    assert_eq!(frames.len(), 4);
    assert!(matches!(frames[0], Frame::Packet(_)));
    match &frames[1] {
        Frame::Garbage(g) => assert_eq!(g.bytes, vec![0xF0]),
        other => panic!("expected garbage, got {:?}", other),
    }
    assert!(matches!(frames[2], Frame::Packet(_)));
    match &frames[3] {
        Frame::Datagram(d) => {
            assert_eq!(d.command, DatagramCommand::ModuleAnswer);
            assert_eq!(d.id, 7);
            assert_eq!(d.value, 0xDEADBEEF);
            assert!(d.checksum_ok);
        }
        other => panic!("expected datagram, got {:?}", other),
    }
}

#[test]
fn frame_boundaries_are_monotonic() {
    let mut stream = Vec::new();
    for i in 0..4u16 {
        stream.extend(v1_message(0x0010, 0x7E11, i, &[0x01, 0x02, 0x03, 0x04]));
    }
    stream.push(SOF); // leave one message open

    let mut reader = FrameReader::new(&stream[..], ReaderOptions::default());
    let frames: Vec<Frame> = reader.frames().map(|f| f.unwrap()).collect();
    assert_eq!(frames.len(), 4);
    for pair in frames.windows(2) {
        assert!(pair[0].end() <= pair[1].end());
        assert!(pair[0].start() <= pair[1].start());
    }
}

#[test]
fn full_id_format() {
    let frames = feed(&v1_message(0x0010, 0x7E11, 0x0100, &[]));
    match &frames[0] {
        Frame::Packet(p) => assert_eq!(p.full_id(), "00_0010_7E11_10_0100"),
        other => panic!("expected packet, got {:?}", other),
    }
}
