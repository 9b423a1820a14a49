#![no_main]

use bytes::BytesMut;
use capstan_core::codec::{Decoder, Encoder, Endianness};
use capstan_core::msg::Msg;
use libfuzzer_sys::fuzz_target;

// Keep adversarial length fields from asking for the address space.
const SIZE_CEILING: usize = 1 << 20;

fn drain(decoder: &mut Decoder, buf: &mut BytesMut, out: &mut Vec<Msg>) -> bool {
    loop {
        match decoder.decode(buf) {
            Ok(Some(msg)) => out.push(msg),
            Ok(None) => return false,
            Err(_) => return true,
        }
    }
}

fuzz_target!(|data: &[u8]| {
    for endianness in [Endianness::Big, Endianness::Little] {
        // One pass over the whole input.
        let mut whole = Decoder::new(endianness, Some(SIZE_CEILING));
        let mut buf = BytesMut::from(data);
        let mut frames = Vec::new();
        let whole_err = drain(&mut whole, &mut buf, &mut frames);

        // The same bytes dribbled in two-byte reads. Fragmentation must
        // not change what comes out, nor whether the stream is rejected.
        let mut dribble = Decoder::new(endianness, Some(SIZE_CEILING));
        let mut pending = BytesMut::new();
        let mut replay = Vec::new();
        let mut dribble_err = false;
        for chunk in data.chunks(2) {
            pending.extend_from_slice(chunk);
            if drain(&mut dribble, &mut pending, &mut replay) {
                dribble_err = true;
                break;
            }
        }
        assert_eq!(whole_err, dribble_err);
        if !whole_err {
            assert_eq!(frames.len(), replay.len());
            for (a, b) in frames.iter().zip(&replay) {
                assert_eq!(a.data(), b.data());
                assert_eq!(a.has_more(), b.has_more());
            }
        }

        // Everything that decoded re-encodes to a stream that decodes
        // back to the same frames.
        let encoder = Encoder::new(endianness);
        let mut wire = BytesMut::new();
        for msg in &frames {
            encoder.encode_into(msg, &mut wire);
        }
        let mut again = Decoder::new(endianness, Some(SIZE_CEILING));
        let mut back = Vec::new();
        let round_trip_err = drain(&mut again, &mut wire, &mut back);
        assert!(!round_trip_err);
        assert!(wire.is_empty());
        assert_eq!(back.len(), frames.len());
        for (a, b) in frames.iter().zip(&back) {
            assert_eq!(a.data(), b.data());
            assert_eq!(a.has_more(), b.has_more());
        }
    }
});
