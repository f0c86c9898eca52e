//! Hashes and checksums derived from packet contents.

use crc32fast::Hasher;
use meshcore_types::PublicKey;
use sha2::{Digest, Sha256};

/// CRC32 trailer over a packet body.
pub fn checksum(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Identifies a packet independently of the route it took.
///
/// First eight bytes of SHA-256 over the payload type and payload, as
/// upper-case hex. Copies of one message relayed along different paths share
/// this hash.
pub fn packet_hash(payload_type: u8, payload: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update([payload_type]);
    hasher.update(payload);
    let digest = hasher.finalize();
    hex::encode_upper(&digest[..8])
}

/// One-byte channel hash carried by group packets.
pub fn channel_hash(secret: &[u8]) -> u8 {
    Sha256::digest(secret)[0]
}

/// Channel hash for a hex-encoded secret, `None` if the secret is not hex.
pub fn channel_hash_hex(secret_hex: &str) -> Option<u8> {
    hex::decode(secret_hex.trim()).ok().map(|s| channel_hash(&s))
}

/// Acknowledgement code the recipient of a direct text echoes back.
pub fn ack_code(timestamp: u32, flags: u8, text: &str, sender: &PublicKey) -> u32 {
    let mut hasher = Sha256::new();
    hasher.update(timestamp.to_le_bytes());
    hasher.update([flags]);
    hasher.update(text.as_bytes());
    hasher.update(sender.as_bytes());
    let digest = hasher.finalize();
    u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]])
}
