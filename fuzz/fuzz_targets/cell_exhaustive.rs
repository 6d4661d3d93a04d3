//! Exhaustive positive-space fuzzer for Cell marshal/unmarshal
//!
//! Rather than throwing random bytes at the decoder, this target builds
//! valid cells from edge-case field values and asserts the round trip is
//! the identity. The fuzzer input only picks which combination to test,
//! so libFuzzer can guide exploration while coverage stays exhaustive.

#![no_main]

use libfuzzer_sys::fuzz_target;
use marionette_proto::{Cell, MAX_CELL_LEN};

// Edge-case values for the 32-bit identity fields
const U32_EDGES: &[u32] = &[0, 1, 0x1000, u32::MAX / 2, u32::MAX - 1, u32::MAX];

// Payload sizes to test
const PAYLOAD_SIZES: &[usize] = &[
    0,    // empty (end-of-stream marker shape)
    1,    // single byte
    23,   // just under the header size
    24,   // exactly the header size
    255,  // one length byte
    256,  // two length bytes
    1024, // 1KB
];

// Extra padding beyond the minimum marshaled size
const PADDINGS: &[usize] = &[0, 1, 7, 64, 4096];

fuzz_target!(|data: &[u8]| {
    if data.len() < 4 {
        return;
    }

    let uuid = U32_EDGES[data[0] as usize % U32_EDGES.len()];
    let instance_id = U32_EDGES[data[1] as usize % U32_EDGES.len()];
    let stream_id = U32_EDGES[data[2] as usize % U32_EDGES.len()];
    let sequence_id = U32_EDGES[data[3] as usize % U32_EDGES.len()];

    for &payload_size in PAYLOAD_SIZES {
        let payload = if payload_size <= data.len() - 4 {
            data[4..4 + payload_size].to_vec()
        } else {
            vec![0u8; payload_size]
        };

        for &padding in PADDINGS {
            let len = Cell::HEADER_LEN + payload.len() + padding;
            if len > MAX_CELL_LEN {
                continue;
            }
            let cell = Cell {
                uuid,
                instance_id,
                stream_id,
                sequence_id,
                payload: payload.clone(),
                len,
            };

            let wire = cell.marshal().expect("marshal should never fail for a valid cell");
            assert_eq!(wire.len(), len, "marshaled size must match the target length");

            let parsed = Cell::unmarshal(&wire).expect("unmarshal should succeed on own output");
            assert_eq!(parsed, cell, "round trip must be the identity");
        }
    }
});
