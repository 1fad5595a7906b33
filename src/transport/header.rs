//! The 8-byte AMQP protocol header handshake.

/// `"AMQP" 0x00 1 0 0` — protocol id 0 (AMQP), major 1, minor 0, revision 0.
pub const AMQP_HEADER: [u8; 8] = [0x41, 0x4D, 0x51, 0x50, 0x00, 0x01, 0x00, 0x00];

pub fn matches(bytes: &[u8]) -> bool {
    bytes == AMQP_HEADER
}
