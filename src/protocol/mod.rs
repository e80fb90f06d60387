pub mod auth;
pub mod binary;
pub mod codec;
pub mod handshake;
pub mod packet;
pub mod response;

pub use auth::{AuthPlugin, CredentialProvider, PasswordCredentials};
pub use binary::Value;
pub use codec::{CompressedCodec, PacketCodec};
pub use handshake::{AuthMoreData, AuthSwitchRequest, HandshakeResponse, InitialHandshake, SslRequest};
pub use packet::{capabilities, status, Command, Packet, MAX_PACKET_SIZE};
pub use response::{
    is_eof_packet, is_err_packet, is_local_infile_packet, is_ok_packet, ColumnDefinition,
    ColumnType, EofPacket, ErrPacket, OkPacket, SessionStateChange,
};
