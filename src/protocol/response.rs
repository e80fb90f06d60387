use bytes::{Buf, Bytes};

use super::packet::{
    capabilities::*, get_lenenc_bytes, get_lenenc_int, status, Packet,
};

/// OK packet sent after a successful command
#[derive(Debug, Clone, Default)]
pub struct OkPacket {
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub status_flags: u16,
    pub warnings: u16,
    pub info: String,
    /// Session-state-track entries, present when the server flags
    /// SERVER_SESSION_STATE_CHANGED
    pub state_changes: Vec<SessionStateChange>,
}

impl OkPacket {
    /// Parse from packet payload. Accepts both the 0x00 header and the
    /// 0xFE EOF-as-OK form used with CLIENT_DEPRECATE_EOF.
    pub fn parse(payload: &[u8], capabilities: u32) -> Option<Self> {
        if payload.is_empty() || (payload[0] != 0x00 && payload[0] != 0xFE) {
            return None;
        }

        let mut buf = &payload[1..];
        let affected_rows = get_lenenc_int(&mut buf)?;
        let last_insert_id = get_lenenc_int(&mut buf)?;

        let (status_flags, warnings) = if capabilities & CLIENT_PROTOCOL_41 != 0 {
            if buf.len() < 4 {
                return None;
            }
            (buf.get_u16_le(), buf.get_u16_le())
        } else {
            (0, 0)
        };

        let mut info = String::new();
        let mut state_changes = Vec::new();

        if capabilities & CLIENT_SESSION_TRACK != 0 {
            if let Some(bytes) = get_lenenc_bytes(&mut buf) {
                info = String::from_utf8_lossy(&bytes).to_string();
            }
            if status_flags & status::SERVER_SESSION_STATE_CHANGED != 0 {
                if let Some(tracked) = get_lenenc_bytes(&mut buf) {
                    state_changes = parse_state_changes(&tracked);
                }
            }
        } else if !buf.is_empty() {
            info = String::from_utf8_lossy(buf).to_string();
        }

        Some(Self {
            affected_rows,
            last_insert_id,
            status_flags,
            warnings,
            info,
            state_changes,
        })
    }

    pub fn more_results(&self) -> bool {
        self.status_flags & status::SERVER_MORE_RESULTS_EXISTS != 0
    }

    pub fn in_transaction(&self) -> bool {
        self.status_flags & status::SERVER_STATUS_IN_TRANS != 0
    }

    pub fn autocommit(&self) -> bool {
        self.status_flags & status::SERVER_STATUS_AUTOCOMMIT != 0
    }
}

/// One server-notified session state change (type byte + payload)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStateChange {
    /// Tracked system variable assignment
    SystemVariable { name: String, value: String },
    /// Default schema changed (USE ...)
    Schema(String),
    /// Generic "session state changed" marker
    StateChange,
    /// Types the engine does not interpret (GTIDs, transaction characteristics)
    Other { kind: u8, data: Bytes },
}

fn parse_state_changes(mut buf: &[u8]) -> Vec<SessionStateChange> {
    let mut changes = Vec::new();
    while !buf.is_empty() {
        let kind = buf[0];
        buf.advance(1);
        let Some(data) = get_lenenc_bytes(&mut buf) else {
            break;
        };
        let mut inner = &data[..];
        let change = match kind {
            0x00 => {
                let name = get_lenenc_bytes(&mut inner);
                let value = get_lenenc_bytes(&mut inner);
                match (name, value) {
                    (Some(n), Some(v)) => SessionStateChange::SystemVariable {
                        name: String::from_utf8_lossy(&n).to_string(),
                        value: String::from_utf8_lossy(&v).to_string(),
                    },
                    _ => SessionStateChange::Other { kind, data },
                }
            }
            0x01 => match get_lenenc_bytes(&mut inner) {
                Some(schema) => {
                    SessionStateChange::Schema(String::from_utf8_lossy(&schema).to_string())
                }
                None => SessionStateChange::Other { kind, data },
            },
            0x02 => SessionStateChange::StateChange,
            _ => SessionStateChange::Other { kind, data },
        };
        changes.push(change);
    }
    changes
}

/// ERR packet
#[derive(Debug, Clone)]
pub struct ErrPacket {
    pub error_code: u16,
    pub sql_state: String,
    pub error_message: String,
}

impl ErrPacket {
    pub fn new(error_code: u16, sql_state: &str, error_message: &str) -> Self {
        Self {
            error_code,
            sql_state: sql_state.to_string(),
            error_message: error_message.to_string(),
        }
    }

    /// Parse from packet payload
    pub fn parse(payload: &[u8], capabilities: u32) -> Option<Self> {
        if payload.is_empty() || payload[0] != 0xFF {
            return None;
        }

        let mut buf = &payload[1..];
        if buf.len() < 2 {
            return None;
        }

        let error_code = buf.get_u16_le();

        let (sql_state, error_message) =
            if capabilities & CLIENT_PROTOCOL_41 != 0 && !buf.is_empty() && buf[0] == b'#' {
                buf.advance(1);
                if buf.len() >= 5 {
                    let sql_state = String::from_utf8_lossy(&buf[..5]).to_string();
                    buf.advance(5);
                    (sql_state, String::from_utf8_lossy(buf).to_string())
                } else {
                    ("HY000".to_string(), String::from_utf8_lossy(buf).to_string())
                }
            } else {
                ("HY000".to_string(), String::from_utf8_lossy(buf).to_string())
            };

        Some(Self {
            error_code,
            sql_state,
            error_message,
        })
    }
}

/// EOF packet (pre-DEPRECATE_EOF result boundaries)
#[derive(Debug, Clone, Default)]
pub struct EofPacket {
    pub warnings: u16,
    pub status_flags: u16,
}

impl EofPacket {
    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.is_empty() || payload[0] != 0xFE || payload.len() >= 9 {
            return None;
        }
        let mut buf = &payload[1..];
        let (warnings, status_flags) = if buf.len() >= 4 {
            (buf.get_u16_le(), buf.get_u16_le())
        } else {
            (0, 0)
        };
        Some(Self {
            warnings,
            status_flags,
        })
    }

    pub fn more_results(&self) -> bool {
        self.status_flags & status::SERVER_MORE_RESULTS_EXISTS != 0
    }

    pub fn cursor_exhausted(&self) -> bool {
        self.status_flags & status::SERVER_STATUS_LAST_ROW_SENT != 0
    }
}

/// Check if packet is OK packet
pub fn is_ok_packet(payload: &Bytes) -> bool {
    !payload.is_empty() && payload[0] == 0x00
}

/// Check if packet is ERR packet
pub fn is_err_packet(payload: &Bytes) -> bool {
    !payload.is_empty() && payload[0] == 0xFF
}

/// Check if packet is EOF packet
pub fn is_eof_packet(payload: &Bytes, capabilities: u32) -> bool {
    if capabilities & CLIENT_DEPRECATE_EOF != 0 {
        false
    } else {
        !payload.is_empty() && payload[0] == 0xFE && payload.len() < 9
    }
}

/// Check if packet is the LOCAL INFILE request (0xFB + filename)
pub fn is_local_infile_packet(payload: &Bytes) -> bool {
    !payload.is_empty() && payload[0] == 0xFB
}

/// Column types of the wire protocol (subset covering both text and binary
/// result decoding; unknown codes decode as opaque bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ColumnType {
    Decimal = 0x00,
    Tiny = 0x01,
    Short = 0x02,
    Long = 0x03,
    Float = 0x04,
    Double = 0x05,
    Null = 0x06,
    Timestamp = 0x07,
    LongLong = 0x08,
    Int24 = 0x09,
    Date = 0x0a,
    Time = 0x0b,
    DateTime = 0x0c,
    Year = 0x0d,
    Varchar = 0x0f,
    Bit = 0x10,
    Json = 0xf5,
    NewDecimal = 0xf6,
    Enum = 0xf7,
    Set = 0xf8,
    TinyBlob = 0xf9,
    MediumBlob = 0xfa,
    LongBlob = 0xfb,
    Blob = 0xfc,
    VarString = 0xfd,
    String = 0xfe,
    Geometry = 0xff,
}

impl From<u8> for ColumnType {
    fn from(value: u8) -> Self {
        match value {
            0x00 => ColumnType::Decimal,
            0x01 => ColumnType::Tiny,
            0x02 => ColumnType::Short,
            0x03 => ColumnType::Long,
            0x04 => ColumnType::Float,
            0x05 => ColumnType::Double,
            0x06 => ColumnType::Null,
            0x07 => ColumnType::Timestamp,
            0x08 => ColumnType::LongLong,
            0x09 => ColumnType::Int24,
            0x0a => ColumnType::Date,
            0x0b => ColumnType::Time,
            0x0c => ColumnType::DateTime,
            0x0d => ColumnType::Year,
            0x0f => ColumnType::Varchar,
            0x10 => ColumnType::Bit,
            0xf5 => ColumnType::Json,
            0xf6 => ColumnType::NewDecimal,
            0xf7 => ColumnType::Enum,
            0xf8 => ColumnType::Set,
            0xf9 => ColumnType::TinyBlob,
            0xfa => ColumnType::MediumBlob,
            0xfb => ColumnType::LongBlob,
            0xfc => ColumnType::Blob,
            0xfd => ColumnType::VarString,
            0xfe => ColumnType::String,
            _ => ColumnType::Geometry,
        }
    }
}

/// Column flags (subset)
pub mod column_flags {
    pub const NOT_NULL: u16 = 1;
    pub const PRIMARY_KEY: u16 = 1 << 1;
    pub const UNSIGNED: u16 = 1 << 5;
    pub const BINARY: u16 = 1 << 7;
}

/// Column definition (protocol 4.1 layout)
#[derive(Debug, Clone)]
pub struct ColumnDefinition {
    pub schema: String,
    pub table: String,
    pub org_table: String,
    pub name: String,
    pub org_name: String,
    pub charset: u16,
    pub column_length: u32,
    pub column_type: ColumnType,
    pub flags: u16,
    pub decimals: u8,
}

impl ColumnDefinition {
    pub fn parse(payload: &[u8]) -> Option<Self> {
        let mut buf = payload;

        let _catalog = get_lenenc_bytes(&mut buf)?;
        let schema = get_lenenc_bytes(&mut buf)?;
        let table = get_lenenc_bytes(&mut buf)?;
        let org_table = get_lenenc_bytes(&mut buf)?;
        let name = get_lenenc_bytes(&mut buf)?;
        let org_name = get_lenenc_bytes(&mut buf)?;
        // Fixed-length fields block, always 0x0c
        let _fixed_len = get_lenenc_int(&mut buf)?;
        if buf.len() < 10 {
            return None;
        }
        let charset = buf.get_u16_le();
        let column_length = buf.get_u32_le();
        let column_type = ColumnType::from(buf.get_u8());
        let flags = buf.get_u16_le();
        let decimals = buf.get_u8();

        Some(Self {
            schema: String::from_utf8_lossy(&schema).to_string(),
            table: String::from_utf8_lossy(&table).to_string(),
            org_table: String::from_utf8_lossy(&org_table).to_string(),
            name: String::from_utf8_lossy(&name).to_string(),
            org_name: String::from_utf8_lossy(&org_name).to_string(),
            charset,
            column_length,
            column_type,
            flags,
            decimals,
        })
    }

    pub fn is_unsigned(&self) -> bool {
        self.flags & column_flags::UNSIGNED != 0
    }
}

/// Parse the leading column-count packet of a result set.
pub fn parse_column_count(packet: &Packet) -> Option<u64> {
    let mut buf = &packet.payload[..];
    let count = get_lenenc_int(&mut buf)?;
    if count == 0 {
        return None;
    }
    Some(count)
}
