#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Any inbound frame must decode or fail cleanly, never panic.
    if let Ok(text) = std::str::from_utf8(data) {
        if let Ok(message) = peer_lobby::protocol::decode(text) {
            // A decoded message re-encodes and decodes to the same value.
            let encoded = peer_lobby::protocol::encode(&message).expect("re-encode");
            let again = peer_lobby::protocol::decode(&encoded).expect("re-decode");
            assert_eq!(again, message);
        }
    }

    // Raw-byte JSON path, including serde_json's own UTF-8 validation.
    let _ = serde_json::from_slice::<peer_lobby::protocol::Snapshot>(data);
});
