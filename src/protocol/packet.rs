use bytes::{BufMut, Bytes, BytesMut};

/// One framed unit of the MySQL client/server protocol
#[derive(Debug, Clone)]
pub struct Packet {
    pub sequence_id: u8,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(sequence_id: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            sequence_id,
            payload: payload.into(),
        }
    }

    /// A command packet always opens a new sequence
    pub fn command(cmd: Command, arg: &[u8]) -> Self {
        let mut payload = BytesMut::with_capacity(1 + arg.len());
        payload.put_u8(cmd as u8);
        payload.put_slice(arg);
        Self::new(0, payload.freeze())
    }
}

/// Capability flags the client may negotiate
pub mod capabilities {
    pub const CLIENT_LONG_PASSWORD: u32 = 1;
    pub const CLIENT_FOUND_ROWS: u32 = 1 << 1;
    pub const CLIENT_LONG_FLAG: u32 = 1 << 2;
    pub const CLIENT_CONNECT_WITH_DB: u32 = 1 << 3;
    pub const CLIENT_PROTOCOL_41: u32 = 1 << 9;
    pub const CLIENT_TRANSACTIONS: u32 = 1 << 13;
    pub const CLIENT_SECURE_CONNECTION: u32 = 1 << 15;
    pub const CLIENT_MULTI_RESULTS: u32 = 1 << 17;
    pub const CLIENT_PLUGIN_AUTH: u32 = 1 << 19;
    pub const CLIENT_DEPRECATE_EOF: u32 = 1 << 24;

    /// Requested from every backend. Without CLIENT_DEPRECATE_EOF result
    /// sets always end in an EOF packet.
    pub const DEFAULT_CAPABILITIES: u32 = CLIENT_LONG_PASSWORD
        | CLIENT_FOUND_ROWS
        | CLIENT_LONG_FLAG
        | CLIENT_CONNECT_WITH_DB
        | CLIENT_PROTOCOL_41
        | CLIENT_TRANSACTIONS
        | CLIENT_SECURE_CONNECTION
        | CLIENT_MULTI_RESULTS
        | CLIENT_PLUGIN_AUTH;
}

/// Commands sent to the backing mysqld. Only text queries are needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Query = 0x03,
}
