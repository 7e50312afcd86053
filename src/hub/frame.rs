//! Minimal server-side websocket framing: the accept-key handshake and
//! unmasked text frames. Subscribers never send meaningful data, so this is
//! the entire protocol surface the hub needs.

use base64::engine::general_purpose;
use base64::Engine;
use sha1::{Digest, Sha1};

const WEBSOCKET_MAGIC_STRING: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Compute the Sec-WebSocket-Accept value for a client key.
pub fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WEBSOCKET_MAGIC_STRING.as_bytes());
    general_purpose::STANDARD.encode(hasher.finalize())
}

/// Encode one unmasked server-to-client text frame: FIN set, opcode text,
/// 7/16/64-bit payload length.
pub fn text_frame(payload: &[u8]) -> Vec<u8> {
    let len = payload.len();
    let mut frame = Vec::with_capacity(len + 10);

    frame.push(0x81);

    if len < 126 {
        frame.push(len as u8);
    } else if len < 65536 {
        frame.push(126);
        frame.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        frame.push(127);
        frame.extend_from_slice(&(len as u64).to_be_bytes());
    }

    frame.extend_from_slice(payload);
    frame
}
