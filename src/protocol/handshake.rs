//! Client side of the connection phase plus the generic OK/ERR/EOF replies

use bytes::{BufMut, BytesMut};
use sha1::{Digest, Sha1};

use super::packet::{capabilities::*, Packet};
use super::resultset::read_lenenc_int;

const NATIVE_PASSWORD: &str = "mysql_native_password";

/// What kind of reply a server packet is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Ok,
    Err,
    Eof,
    /// Anything else: a column count, column definition or row
    Data,
}

impl Reply {
    /// Classify a payload given the negotiated capabilities.
    ///
    /// A 0xFE header is only an EOF when it is short and EOF packets have not
    /// been deprecated; otherwise it is row data starting with a 8-byte
    /// length-encoded integer.
    pub fn of(payload: &[u8], capabilities: u32) -> Self {
        match payload.first() {
            Some(0x00) => Reply::Ok,
            Some(0xFF) => Reply::Err,
            Some(0xFE) if payload.len() < 9 && capabilities & CLIENT_DEPRECATE_EOF == 0 => {
                Reply::Eof
            }
            _ => Reply::Data,
        }
    }
}

/// Minimal forward-only reader over a payload
struct Cursor<'a> {
    buf: &'a [u8],
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.buf.len() < n {
            return None;
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Some(head)
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    fn u16(&mut self) -> Option<u16> {
        self.take(2).map(|b| u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Option<u32> {
        self.take(4).map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Bytes up to the next NUL (or the end), consuming the NUL
    fn nul_str(&mut self) -> String {
        let end = self.buf.iter().position(|&b| b == 0).unwrap_or(self.buf.len());
        let s = String::from_utf8_lossy(&self.buf[..end]).into_owned();
        self.buf = &self.buf[(end + 1).min(self.buf.len())..];
        s
    }

    fn rest(&self) -> &'a [u8] {
        self.buf
    }
}

/// Protocol v10 greeting sent by the server on connect
#[derive(Debug, Clone)]
pub struct ServerGreeting {
    pub server_version: String,
    pub connection_id: u32,
    pub capabilities: u32,
    /// Both scramble parts, trailing NUL removed
    pub scramble: Vec<u8>,
    pub auth_plugin: String,
}

impl ServerGreeting {
    pub fn parse(payload: &[u8]) -> Option<Self> {
        let mut cur = Cursor::new(payload);
        if cur.u8()? != 10 {
            return None;
        }
        let server_version = cur.nul_str();
        let connection_id = cur.u32()?;
        let mut scramble = cur.take(8)?.to_vec();
        cur.take(1)?;
        let caps_low = cur.u16()? as u32;
        let _charset = cur.u8()?;
        let _status = cur.u16()?;
        let caps_high = cur.u16()? as u32;
        let capabilities = caps_low | (caps_high << 16);
        let scramble_len = cur.u8()? as usize;
        cur.take(10)?;

        if capabilities & CLIENT_SECURE_CONNECTION != 0 {
            let len = scramble_len.saturating_sub(8).max(13).min(cur.rest().len());
            let part = cur.take(len)?;
            let end = part.iter().position(|&b| b == 0).unwrap_or(part.len());
            scramble.extend_from_slice(&part[..end]);
        }

        let auth_plugin = if capabilities & CLIENT_PLUGIN_AUTH != 0 && !cur.rest().is_empty() {
            cur.nul_str()
        } else {
            NATIVE_PASSWORD.to_string()
        };

        Some(Self {
            server_version,
            connection_id,
            capabilities,
            scramble,
            auth_plugin,
        })
    }
}

/// HandshakeResponse41 sent by the client
#[derive(Debug, Clone)]
pub struct LoginRequest {
    pub capabilities: u32,
    pub max_packet_size: u32,
    pub collation: u8,
    pub user: String,
    pub auth_response: Vec<u8>,
    pub database: Option<String>,
    pub auth_plugin: String,
}

impl LoginRequest {
    pub fn to_packet(&self, sequence_id: u8) -> Packet {
        let mut buf = BytesMut::with_capacity(64 + self.user.len());
        buf.put_u32_le(self.capabilities);
        buf.put_u32_le(self.max_packet_size);
        buf.put_u8(self.collation);
        buf.put_bytes(0, 23);
        put_nul_str(&mut buf, &self.user);

        if self.capabilities & CLIENT_SECURE_CONNECTION != 0 {
            buf.put_u8(self.auth_response.len() as u8);
            buf.put_slice(&self.auth_response);
        } else {
            buf.put_slice(&self.auth_response);
            buf.put_u8(0);
        }
        if self.capabilities & CLIENT_CONNECT_WITH_DB != 0 {
            put_nul_str(&mut buf, self.database.as_deref().unwrap_or_default());
        }
        if self.capabilities & CLIENT_PLUGIN_AUTH != 0 {
            put_nul_str(&mut buf, &self.auth_plugin);
        }
        Packet::new(sequence_id, buf.freeze())
    }
}

fn put_nul_str(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

/// mysql_native_password: SHA1(pw) XOR SHA1(scramble + SHA1(SHA1(pw)))
pub fn scramble_password(password: &str, scramble: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }
    let stage1 = Sha1::digest(password.as_bytes());
    let stage2 = Sha1::digest(stage1);
    let mut hasher = Sha1::new();
    hasher.update(scramble);
    hasher.update(stage2);
    let mask = hasher.finalize();
    stage1.iter().zip(mask.iter()).map(|(a, b)| a ^ b).collect()
}

/// Decoded OK packet
#[derive(Debug, Clone, Default)]
pub struct OkPacket {
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub status_flags: u16,
    pub warnings: u16,
}

impl OkPacket {
    pub fn parse(payload: &[u8], capabilities: u32) -> Option<Self> {
        if Reply::of(payload, capabilities) != Reply::Ok {
            return None;
        }
        let (affected_rows, a) = read_lenenc_int(&payload[1..])?;
        let (last_insert_id, b) = read_lenenc_int(&payload[1 + a..])?;
        let mut cur = Cursor::new(&payload[1 + a + b..]);
        let mut ok = Self {
            affected_rows,
            last_insert_id,
            ..Default::default()
        };
        if capabilities & CLIENT_PROTOCOL_41 != 0 {
            if let (Some(status), Some(warnings)) = (cur.u16(), cur.u16()) {
                ok.status_flags = status;
                ok.warnings = warnings;
            }
        }
        Some(ok)
    }
}

/// Decoded ERR packet
#[derive(Debug, Clone)]
pub struct ServerError {
    pub code: u16,
    pub state: String,
    pub message: String,
}

impl ServerError {
    pub fn new(code: u16, state: &str, message: &str) -> Self {
        Self {
            code,
            state: state.to_string(),
            message: message.to_string(),
        }
    }

    pub fn parse(payload: &[u8], capabilities: u32) -> Option<Self> {
        let mut cur = Cursor::new(payload);
        if cur.u8()? != 0xFF {
            return None;
        }
        let code = cur.u16()?;
        let mut state = "HY000".to_string();
        if capabilities & CLIENT_PROTOCOL_41 != 0 && cur.rest().first() == Some(&b'#') {
            if let Some(marked) = cur.rest().get(1..6) {
                state = String::from_utf8_lossy(marked).into_owned();
                cur.take(6)?;
            } else {
                cur.take(1)?;
            }
        }
        let message = String::from_utf8_lossy(cur.rest()).into_owned();
        Some(Self {
            code,
            state,
            message,
        })
    }

    /// Parse, falling back to `default` on a malformed packet
    pub fn parse_or(payload: &[u8], capabilities: u32, default: Self) -> Self {
        Self::parse(payload, capabilities).unwrap_or(default)
    }
}
