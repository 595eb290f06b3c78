#![no_main]

use libfuzzer_sys::fuzz_target;
use netmsg_protocol::protocol::accumulator::ReceiveAccumulator;
use netmsg_protocol::{ChannelRegistry, Direction, FieldDescriptor, MessageSchema};

fn schemas(direction: Direction) -> Vec<MessageSchema> {
    vec![
        MessageSchema::new(1, "Ping", direction, vec![FieldDescriptor::u32("timeMs")]).unwrap(),
        MessageSchema::new(
            2,
            "Transfer",
            direction,
            vec![
                FieldDescriptor::u32("transId"),
                FieldDescriptor::var_count("count", 1, 0, 256),
                FieldDescriptor::var_bytes("data"),
                FieldDescriptor::var_count("idCount", 2, 1, 8),
                FieldDescriptor::var_ptr("ids"),
            ],
        )
        .unwrap(),
        MessageSchema::new(
            3,
            "Profile",
            direction,
            vec![
                FieldDescriptor::f64("ratio"),
                FieldDescriptor::fixed_string("tag", 8),
                FieldDescriptor::wide_string("name", 16),
            ],
        )
        .unwrap(),
    ]
}

fuzz_target!(|data: &[u8]| {
    if data.is_empty() {
        return;
    }

    let mut builder = ChannelRegistry::builder();
    builder.register(1, true, schemas(Direction::Send), schemas(Direction::Recv), None);
    let channel = builder.build().lookup(1, true).unwrap();

    // First byte picks the chunk size so the same stream is exercised with many splits
    let chunk = usize::from(data[0]).max(1);
    let mut acc = ReceiveAccumulator::new(channel, 4096);
    for piece in data[1..].chunks(chunk) {
        if acc.push(piece, |_| Ok(())).is_err() {
            return;
        }
        assert!(acc.pending_len() <= 4096 + chunk);
    }
});
