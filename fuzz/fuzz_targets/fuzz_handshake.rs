#![no_main]

use libfuzzer_sys::fuzz_target;
use netmsg_protocol::protocol::handshake::{ClientHello, ServerReply};

fuzz_target!(|data: &[u8]| {
    if let Ok(Some((hello, used))) = ClientHello::parse(data) {
        assert!(used <= data.len());
        let encoded = hello.encode();
        assert_eq!(ClientHello::parse(&encoded).unwrap().unwrap().0, hello);
    }

    if let Ok(Some((reply, used))) = ServerReply::parse(data) {
        assert!(used <= data.len());
        let _ = reply.encode();
    }
});
