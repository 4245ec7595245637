pub mod codec;
pub mod handshake;
pub mod packet;
pub mod resultset;

pub use codec::PacketCodec;
pub use handshake::{scramble_password, LoginRequest, OkPacket, Reply, ServerError, ServerGreeting};
pub use packet::{capabilities, Command, Packet};
pub use resultset::{parse_column_name, parse_text_row, DecodeError, Row};
