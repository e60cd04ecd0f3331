//! Arbitrary bytes through the message body decoder.
//!
//! Decoding untrusted plaintext must never panic, and whatever decodes must
//! survive a re-encode.

#![no_main]

use libfuzzer_sys::fuzz_target;
use tessera_proto::MessageBody;

fuzz_target!(|data: &[u8]| {
    let Ok(body) = MessageBody::decode(data) else { return };

    let encoded = body.encode().expect("decoded body must re-encode");
    let again = MessageBody::decode(&encoded).expect("re-encoded body must decode");
    assert_eq!(body, again);
});
