//! Exhaustive positive space fuzzer for command and response frames
//!
//! Every input picks one combination of:
//! - Command code (all 26 known codes)
//! - Response code (all 28 known codes) and `in_reply_to` code
//! - Payload size edge
//!
//! and checks that the frame survives encoding, stream framing and decoding
//! unchanged. Unknown codes are covered by the property tests.

#![no_main]

use gep_proto::{
    CommandFrame, ResponseFrame, ResponseHeader, ServerCommand, ServerResponse,
    framing::{FrameReader, encode_framed},
};
use libfuzzer_sys::fuzz_target;

const PAYLOAD_SIZES: &[usize] = &[
    0,      // Empty
    1,      // Single byte
    4,      // One u32
    5,      // Just over one u32
    255,    // One byte length
    256,    // Two byte length
    65_535, // u16 boundary
    65_536,
];

fn command_codes() -> Vec<ServerCommand> {
    (0u8..=0xFF).filter_map(ServerCommand::from_u8).collect()
}

fn response_codes() -> Vec<ServerResponse> {
    (0u8..=0xFF).filter_map(ServerResponse::from_u8).collect()
}

fn reframe(frame: &[u8]) -> Vec<u8> {
    let mut framed = Vec::new();
    encode_framed(frame, &mut framed).expect("framing should never fail below the size limit");

    // Feed the stream one byte at a time to exercise partial prefixes.
    let mut reader = FrameReader::new();
    let mut out = None;
    for byte in &framed {
        reader.extend(std::slice::from_ref(byte));
        if let Some(frame) = reader.next_frame().expect("valid stream must not error") {
            assert!(out.is_none(), "one frame in, one frame out");
            out = Some(frame);
        }
    }
    assert_eq!(reader.buffered(), 0);
    out.expect("frame should be complete").to_vec()
}

fuzz_target!(|data: &[u8]| {
    if data.len() < 3 {
        return;
    }

    let commands = command_codes();
    let responses = response_codes();
    let command = commands[data[0] as usize % commands.len()];
    let response = responses[data[1] as usize % responses.len()];
    let in_reply_to = commands[data[2] as usize % commands.len()];

    for &payload_size in PAYLOAD_SIZES {
        let payload = if payload_size <= data.len() - 3 { data[3..3 + payload_size].to_vec() } else { vec![0u8; payload_size] };

        // INVARIANT 1: Command frames round-trip through the stream
        let frame = CommandFrame::new(command, payload.clone());
        let mut buf = Vec::new();
        frame.encode(&mut buf).expect("encode should never fail for valid frame");
        assert_eq!(buf.len(), 1 + payload.len());
        let decoded = CommandFrame::decode(&reframe(&buf)).expect("decode should succeed for valid encoding");
        assert_eq!(decoded.command(), Some(command));
        assert_eq!(decoded.payload.len(), payload.len());

        // INVARIANT 2: Response frames round-trip, header included
        let frame = ResponseFrame::new(ResponseHeader::new(response, in_reply_to), payload.clone());
        let mut buf = Vec::new();
        frame.encode(&mut buf).expect("encode should never fail for valid frame");
        assert_eq!(buf.len(), ResponseHeader::SIZE + payload.len());
        let decoded = ResponseFrame::decode(&reframe(&buf)).expect("decode should succeed for valid encoding");
        assert_eq!(decoded.response(), Some(response), "response mismatch for {response:?}");
        assert_eq!(decoded.header.in_reply_to(), Some(in_reply_to));
        assert_eq!(decoded.header.payload_size() as usize, payload.len());
        assert_eq!(decoded.payload[..], payload[..]);
    }
});
