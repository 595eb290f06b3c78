//! Build-once channel table.
//!
//! Upper layers describe each protocol once at startup with a [`ChannelRegistryBuilder`]
//! and freeze it into an [`Arc<ChannelRegistry>`]. After that the registry is read-only:
//! lookups take no locks and every [`Connection`](crate::protocol::connection::Connection)
//! holds a shared reference to its [`Channel`].
//!
//! Registering the same `(protocol_id, server_side)` key twice, or two schemas with the
//! same id in one direction, is a programming error and panics.

use crate::core::schema::{Direction, MessageSchema};
use crate::protocol::crypto::DhParams;
use once_cell::sync::OnceCell;
use std::collections::HashMap;
use std::sync::Arc;

static GLOBAL_REGISTRY: OnceCell<Arc<ChannelRegistry>> = OnceCell::new();

/// Registry key: protocol id plus which side of the connection the channel serves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelKey {
    pub protocol_id: u8,
    pub server_side: bool,
}

/// Message tables and key-agreement parameters for one protocol on one side
#[derive(Debug)]
pub struct Channel {
    protocol_id: u8,
    server_side: bool,
    send: HashMap<u16, MessageSchema>,
    recv: HashMap<u16, MessageSchema>,
    largest_recv_size: u64,
    dh: Option<DhParams>,
}

impl Channel {
    fn new(
        key: ChannelKey,
        send: Vec<MessageSchema>,
        recv: Vec<MessageSchema>,
        dh: Option<DhParams>,
    ) -> Self {
        let send = index_schemas(key, "send", send);
        let recv = index_schemas(key, "recv", recv);
        let largest_recv_size = recv
            .values()
            .map(MessageSchema::max_encoded_len)
            .max()
            .unwrap_or(0);

        Self {
            protocol_id: key.protocol_id,
            server_side: key.server_side,
            send,
            recv,
            largest_recv_size,
            dh,
        }
    }

    pub fn protocol_id(&self) -> u8 {
        self.protocol_id
    }

    pub fn is_server_side(&self) -> bool {
        self.server_side
    }

    pub fn key(&self) -> ChannelKey {
        ChannelKey {
            protocol_id: self.protocol_id,
            server_side: self.server_side,
        }
    }

    #[inline]
    pub fn send_schema(&self, id: u16) -> Option<&MessageSchema> {
        self.send.get(&id)
    }

    #[inline]
    pub fn recv_schema(&self, id: u16) -> Option<&MessageSchema> {
        self.recv.get(&id)
    }

    /// Largest legal encoded receive message, id included
    pub fn largest_recv_size(&self) -> u64 {
        self.largest_recv_size
    }

    /// Key-agreement parameters; `None` for plaintext channels
    pub fn dh(&self) -> Option<&DhParams> {
        self.dh.as_ref()
    }

    pub fn send_ids(&self) -> impl Iterator<Item = u16> + '_ {
        self.send.keys().copied()
    }

    pub fn recv_ids(&self) -> impl Iterator<Item = u16> + '_ {
        self.recv.keys().copied()
    }
}

fn index_schemas(
    key: ChannelKey,
    table: &str,
    schemas: Vec<MessageSchema>,
) -> HashMap<u16, MessageSchema> {
    let mut map = HashMap::with_capacity(schemas.len());
    for schema in schemas {
        let id = schema.id();
        let previous = map.insert(id, schema);
        assert!(
            previous.is_none(),
            "protocol {} ({}): duplicate {table} message id {id}",
            key.protocol_id,
            side_name(key.server_side),
        );
    }
    map
}

fn side_name(server_side: bool) -> &'static str {
    if server_side {
        "server"
    } else {
        "client"
    }
}

/// Collects channel registrations before the registry is frozen
#[derive(Debug, Default)]
pub struct ChannelRegistryBuilder {
    channels: HashMap<ChannelKey, Arc<Channel>>,
}

impl ChannelRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a channel.
    ///
    /// # Panics
    /// If the key is already registered, a schema id repeats within one table, or a
    /// schema's declared direction disagrees with the table it was passed in.
    pub fn register(
        &mut self,
        protocol_id: u8,
        server_side: bool,
        send: Vec<MessageSchema>,
        recv: Vec<MessageSchema>,
        dh: Option<DhParams>,
    ) -> &mut Self {
        let key = ChannelKey {
            protocol_id,
            server_side,
        };
        assert!(
            !self.channels.contains_key(&key),
            "protocol {protocol_id} ({}) registered twice",
            side_name(server_side),
        );
        for schema in &send {
            assert_eq!(
                schema.direction(),
                Direction::Send,
                "{} passed as a send schema",
                schema.name()
            );
        }
        for schema in &recv {
            assert_eq!(
                schema.direction(),
                Direction::Recv,
                "{} passed as a recv schema",
                schema.name()
            );
        }

        self.channels
            .insert(key, Arc::new(Channel::new(key, send, recv, dh)));
        self
    }

    /// Freeze the registrations
    pub fn build(self) -> Arc<ChannelRegistry> {
        Arc::new(ChannelRegistry {
            channels: self.channels,
        })
    }
}

/// Immutable `(protocol_id, server_side) -> Channel` table
#[derive(Debug)]
pub struct ChannelRegistry {
    channels: HashMap<ChannelKey, Arc<Channel>>,
}

impl ChannelRegistry {
    pub fn builder() -> ChannelRegistryBuilder {
        ChannelRegistryBuilder::new()
    }

    #[inline]
    pub fn lookup(&self, protocol_id: u8, server_side: bool) -> Option<Arc<Channel>> {
        self.channels
            .get(&ChannelKey {
                protocol_id,
                server_side,
            })
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Publish this registry as the process-wide instance.
    ///
    /// # Panics
    /// If a global registry was already installed.
    pub fn install_global(self: &Arc<Self>) {
        assert!(
            GLOBAL_REGISTRY.set(Arc::clone(self)).is_ok(),
            "global channel registry installed twice"
        );
    }

    /// The process-wide registry, if one was installed
    pub fn global() -> Option<Arc<ChannelRegistry>> {
        GLOBAL_REGISTRY.get().cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::schema::FieldDescriptor;

    fn ping(direction: Direction) -> MessageSchema {
        MessageSchema::new(1, "Ping", direction, vec![FieldDescriptor::u32("timeMs")]).unwrap()
    }

    fn blob(direction: Direction) -> MessageSchema {
        MessageSchema::new(
            2,
            "Blob",
            direction,
            vec![
                FieldDescriptor::var_count("count", 1, 0, 512),
                FieldDescriptor::var_bytes("data"),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_lookup_by_side() {
        let mut builder = ChannelRegistry::builder();
        builder
            .register(7, true, vec![], vec![ping(Direction::Recv)], None)
            .register(7, false, vec![ping(Direction::Send)], vec![], None);
        let registry = builder.build();

        let server = registry.lookup(7, true).unwrap();
        assert!(server.recv_schema(1).is_some());
        assert!(server.send_schema(1).is_none());
        assert!(registry.lookup(7, false).unwrap().send_schema(1).is_some());
        assert!(registry.lookup(8, true).is_none());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_largest_recv_size() {
        let mut builder = ChannelRegistry::builder();
        builder.register(
            1,
            true,
            vec![],
            vec![ping(Direction::Recv), blob(Direction::Recv)],
            None,
        );
        let channel = builder.build().lookup(1, true).unwrap();
        assert_eq!(channel.largest_recv_size(), 2 + 4 + 512);
    }

    #[test]
    #[should_panic(expected = "registered twice")]
    fn test_duplicate_key_panics() {
        let mut builder = ChannelRegistry::builder();
        builder.register(1, true, vec![], vec![], None);
        builder.register(1, true, vec![], vec![], None);
    }

    #[test]
    #[should_panic(expected = "duplicate recv message id 1")]
    fn test_duplicate_id_panics() {
        let mut builder = ChannelRegistry::builder();
        builder.register(
            1,
            true,
            vec![],
            vec![ping(Direction::Recv), ping(Direction::Recv)],
            None,
        );
    }

    #[test]
    fn test_lookups_share_channel() {
        let mut builder = ChannelRegistry::builder();
        builder.register(3, false, vec![], vec![], Some(DhParams::modp_2048()));
        let registry = builder.build();
        let a = registry.lookup(3, false).unwrap();
        let b = registry.lookup(3, false).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(a.dh().is_some());
    }
}
