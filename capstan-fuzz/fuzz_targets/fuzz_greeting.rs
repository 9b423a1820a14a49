#![no_main]

use capstan_core::greeting::{Greeting, GREETING_SIZE};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Arbitrary bytes must parse or be rejected, never panic.
    match Greeting::parse(data) {
        Ok(greeting) => {
            // Anything accepted re-encodes to something that parses to
            // the same socket type, whatever the original padding held.
            let wire = Greeting::encode(&greeting);
            assert_eq!(wire.len(), GREETING_SIZE);
            match Greeting::parse(&wire) {
                Ok(again) => assert_eq!(again.socket_type, greeting.socket_type),
                Err(_) => panic!("canonical greeting failed to parse"),
            }
        }
        Err(_) => {
            assert!(
                data.len() < GREETING_SIZE
                    || data[0] != 0xFF
                    || data[9] != 0x7F
                    || data[10] != 1
                    || data[11] > 8,
                "well-formed greeting was rejected"
            );
        }
    }
});
