use bytes::{Buf, BufMut, BytesMut};

use super::packet::{capabilities::*, Packet};

/// Auth switch request indicator (0xFE), sent by the server when it wants a
/// different authentication plugin than the one the client answered with
pub const AUTH_SWITCH_REQUEST: u8 = 0xFE;

/// More auth data indicator (0x01), used by the SHA-2 plugins for the
/// fast-auth result and the RSA public key response
pub const AUTH_MORE_DATA: u8 = 0x01;

/// MySQL initial handshake packet (server -> client)
#[derive(Debug, Clone)]
pub struct InitialHandshake {
    pub protocol_version: u8,
    pub server_version: String,
    pub connection_id: u32,
    pub auth_plugin_data_part1: [u8; 8],
    pub capability_flags: u32,
    pub character_set: u8,
    pub status_flags: u16,
    pub auth_plugin_data_part2: Vec<u8>,
    pub auth_plugin_name: String,
}

impl InitialHandshake {
    /// Get full auth plugin data (20 bytes for the scramble plugins)
    pub fn auth_plugin_data(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(20);
        data.extend_from_slice(&self.auth_plugin_data_part1);
        data.extend_from_slice(&self.auth_plugin_data_part2);
        data
    }

    /// Parse from packet payload
    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.len() < 32 {
            return None;
        }

        let mut buf = payload;

        let protocol_version = buf.get_u8();

        // Server version (null-terminated string)
        let null_pos = buf.iter().position(|&b| b == 0)?;
        let server_version = String::from_utf8_lossy(&buf[..null_pos]).to_string();
        buf.advance(null_pos + 1);

        let connection_id = buf.get_u32_le();

        let mut auth_plugin_data_part1 = [0u8; 8];
        auth_plugin_data_part1.copy_from_slice(&buf[..8]);
        buf.advance(8);

        // Filler
        buf.advance(1);

        let capability_flags_lower = buf.get_u16_le() as u32;
        let character_set = buf.get_u8();
        let status_flags = buf.get_u16_le();
        let capability_flags_upper = buf.get_u16_le() as u32;
        let capability_flags = capability_flags_lower | (capability_flags_upper << 16);

        let auth_plugin_data_len = buf.get_u8();

        // Reserved
        buf.advance(10);

        // Auth plugin data part 2
        let mut auth_plugin_data_part2 = Vec::new();
        if capability_flags & CLIENT_SECURE_CONNECTION != 0 {
            let len = std::cmp::max(13, auth_plugin_data_len as usize - 8);
            let data_len = buf.iter().take(len).position(|&b| b == 0).unwrap_or(len);
            auth_plugin_data_part2.extend_from_slice(&buf[..data_len]);
            buf.advance(len.min(buf.len()));
        }

        // Auth plugin name
        let auth_plugin_name = if capability_flags & CLIENT_PLUGIN_AUTH != 0 && !buf.is_empty() {
            let null_pos = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
            String::from_utf8_lossy(&buf[..null_pos]).to_string()
        } else {
            "mysql_native_password".to_string()
        };

        Some(Self {
            protocol_version,
            server_version,
            connection_id,
            auth_plugin_data_part1,
            capability_flags,
            character_set,
            status_flags,
            auth_plugin_data_part2,
            auth_plugin_name,
        })
    }

    /// True for MariaDB servers (version string carries the fork marker or a
    /// 5.5.5- replication-compatibility prefix)
    pub fn is_mariadb(&self) -> bool {
        let v = self.server_version.to_ascii_lowercase();
        v.contains("mariadb") || v.starts_with("5.5.5-")
    }
}

/// MySQL handshake response packet (client -> server)
#[derive(Debug, Clone)]
pub struct HandshakeResponse {
    pub capability_flags: u32,
    pub max_packet_size: u32,
    pub character_set: u8,
    pub username: String,
    pub auth_response: Vec<u8>,
    pub database: Option<String>,
    pub auth_plugin_name: String,
}

impl HandshakeResponse {
    /// Encode to packet
    pub fn encode(&self, sequence_id: u8) -> Packet {
        let mut buf = BytesMut::new();

        buf.put_u32_le(self.capability_flags);
        buf.put_u32_le(self.max_packet_size);
        buf.put_u8(self.character_set);

        // Reserved (23 bytes)
        buf.extend_from_slice(&[0u8; 23]);

        // Username
        buf.extend_from_slice(self.username.as_bytes());
        buf.put_u8(0);

        // Auth response (length-prefixed)
        if self.capability_flags & CLIENT_SECURE_CONNECTION != 0 {
            buf.put_u8(self.auth_response.len() as u8);
            buf.extend_from_slice(&self.auth_response);
        } else {
            buf.extend_from_slice(&self.auth_response);
            buf.put_u8(0);
        }

        // Database
        if self.capability_flags & CLIENT_CONNECT_WITH_DB != 0 {
            if let Some(ref db) = self.database {
                buf.extend_from_slice(db.as_bytes());
            }
            buf.put_u8(0);
        }

        // Auth plugin name
        if self.capability_flags & CLIENT_PLUGIN_AUTH != 0 {
            buf.extend_from_slice(self.auth_plugin_name.as_bytes());
            buf.put_u8(0);
        }

        Packet::new(sequence_id, buf.freeze())
    }
}

/// Truncated handshake response sent before the TLS upgrade: capability
/// flags (with CLIENT_SSL), max packet size, charset, 23 reserved bytes.
#[derive(Debug, Clone)]
pub struct SslRequest {
    pub capability_flags: u32,
    pub max_packet_size: u32,
    pub character_set: u8,
}

impl SslRequest {
    pub fn encode(&self, sequence_id: u8) -> Packet {
        let mut buf = BytesMut::with_capacity(32);
        buf.put_u32_le(self.capability_flags | CLIENT_SSL);
        buf.put_u32_le(self.max_packet_size);
        buf.put_u8(self.character_set);
        buf.extend_from_slice(&[0u8; 23]);
        Packet::new(sequence_id, buf.freeze())
    }
}

/// Server request to continue authentication with a different plugin
#[derive(Debug, Clone)]
pub struct AuthSwitchRequest {
    pub plugin_name: String,
    pub plugin_data: Vec<u8>,
}

impl AuthSwitchRequest {
    /// Parse from a 0xFE payload. During authentication 0xFE is always an
    /// auth switch, never an EOF.
    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.first() != Some(&AUTH_SWITCH_REQUEST) || payload.len() < 2 {
            return None;
        }
        let rest = &payload[1..];
        let plugin_end = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
        let plugin_name = String::from_utf8_lossy(&rest[..plugin_end]).to_string();
        let mut plugin_data = if plugin_end + 1 < rest.len() {
            rest[plugin_end + 1..].to_vec()
        } else {
            Vec::new()
        };
        // Scramble data is null-terminated on the wire
        if plugin_data.last() == Some(&0) {
            plugin_data.pop();
        }
        Some(Self {
            plugin_name,
            plugin_data,
        })
    }
}

/// Extra auth data frame (0x01 header), carrying the SHA-2 fast-auth result
/// byte or an RSA public key
#[derive(Debug, Clone)]
pub struct AuthMoreData {
    pub data: Vec<u8>,
}

impl AuthMoreData {
    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.first() != Some(&AUTH_MORE_DATA) {
            return None;
        }
        Some(Self {
            data: payload[1..].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a server greeting payload the way a 8.0 server lays it out
    fn greeting_payload(version: &str, plugin: &str) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_u8(10);
        buf.extend_from_slice(version.as_bytes());
        buf.put_u8(0);
        buf.put_u32_le(99); // connection id
        buf.extend_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]); // scramble part 1
        buf.put_u8(0); // filler
        let caps = CLIENT_PROTOCOL_41 | CLIENT_SECURE_CONNECTION | CLIENT_PLUGIN_AUTH;
        buf.put_u16_le((caps & 0xFFFF) as u16);
        buf.put_u8(0x21); // charset
        buf.put_u16_le(0x0002); // status
        buf.put_u16_le(((caps >> 16) & 0xFFFF) as u16);
        buf.put_u8(21); // auth data len
        buf.extend_from_slice(&[0u8; 10]); // reserved
        buf.extend_from_slice(&[9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20]); // part 2
        buf.put_u8(0);
        buf.extend_from_slice(plugin.as_bytes());
        buf.put_u8(0);
        buf
    }

    #[test]
    fn parse_greeting() {
        let buf = greeting_payload("8.0.36", "caching_sha2_password");
        let hs = InitialHandshake::parse(&buf).unwrap();
        assert_eq!(hs.server_version, "8.0.36");
        assert_eq!(hs.connection_id, 99);
        assert_eq!(hs.auth_plugin_name, "caching_sha2_password");
        assert_eq!(hs.auth_plugin_data().len(), 20);
        assert!(!hs.is_mariadb());
    }

    #[test]
    fn mariadb_detection() {
        let buf = greeting_payload("5.5.5-10.11.6-MariaDB", "mysql_native_password");
        let hs = InitialHandshake::parse(&buf).unwrap();
        assert!(hs.is_mariadb());
    }

    #[test]
    fn response_layout() {
        let response = HandshakeResponse {
            capability_flags: CLIENT_PROTOCOL_41
                | CLIENT_SECURE_CONNECTION
                | CLIENT_PLUGIN_AUTH
                | CLIENT_CONNECT_WITH_DB,
            max_packet_size: 16 * 1024 * 1024,
            character_set: 0x21,
            username: "app".to_string(),
            auth_response: vec![0xAB; 20],
            database: Some("orders".to_string()),
            auth_plugin_name: "mysql_native_password".to_string(),
        };
        let packet = response.encode(1);
        assert_eq!(packet.sequence_id, 1);
        // 4 caps + 4 max packet + 1 charset + 23 reserved = offset 32
        let payload = &packet.payload;
        assert_eq!(&payload[32..36], b"app\0");
        assert_eq!(payload[36], 20); // auth response length prefix
    }

    #[test]
    fn ssl_request_sets_ssl_flag() {
        let req = SslRequest {
            capability_flags: CLIENT_PROTOCOL_41,
            max_packet_size: 1 << 24,
            character_set: 0x21,
        };
        let packet = req.encode(1);
        let caps = u32::from_le_bytes([
            packet.payload[0],
            packet.payload[1],
            packet.payload[2],
            packet.payload[3],
        ]);
        assert!(caps & CLIENT_SSL != 0);
        assert_eq!(packet.payload.len(), 32);
    }

    #[test]
    fn auth_switch_parse() {
        let mut buf = BytesMut::new();
        buf.put_u8(0xFE);
        buf.extend_from_slice(b"caching_sha2_password\0");
        buf.extend_from_slice(&[7u8; 20]);
        buf.put_u8(0);

        let switch = AuthSwitchRequest::parse(&buf).unwrap();
        assert_eq!(switch.plugin_name, "caching_sha2_password");
        assert_eq!(switch.plugin_data, vec![7u8; 20]);
    }

    #[test]
    fn auth_more_data_parse() {
        let more = AuthMoreData::parse(&[0x01, 0x04]).unwrap();
        assert_eq!(more.data, vec![0x04]);
        assert!(AuthMoreData::parse(&[0x00]).is_none());
    }
}
