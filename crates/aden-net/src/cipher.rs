//! Rolling XOR cipher used by game sessions once the handshake completes.
//!
//! Every body byte is XORed with a key byte and with the previous ciphertext
//! byte. After each packet the little-endian `u32` stored at `key[8..12]` is
//! advanced by the packet length, so both peers must process exactly the same
//! sequence of bodies to stay in sync. Each direction keeps its own key copy.

use bytes::BytesMut;

use crate::transform::{PacketTransform, TransformError};

/// Key length in bytes.
pub const KEY_LEN: usize = 16;

/// Fixed tail shared by every generated key; only the head is random.
const KEY_TAIL: [u8; 8] = [0xC8, 0x27, 0x93, 0x01, 0xA1, 0x6C, 0x31, 0x97];

/// Rolling XOR cipher state for one direction of a connection.
#[derive(Debug, Clone)]
pub struct XorCipher {
    key: [u8; KEY_LEN],
}

impl XorCipher {
    /// Create a cipher from a full 16-byte key.
    pub fn new(key: [u8; KEY_LEN]) -> Self {
        Self { key }
    }

    /// Generate a key with a random 8-byte head and the fixed tail.
    pub fn random_key() -> [u8; KEY_LEN] {
        let head: [u8; 8] = rand::random();
        let mut key = [0u8; KEY_LEN];
        key[..8].copy_from_slice(&head);
        key[8..].copy_from_slice(&KEY_TAIL);
        key
    }

    /// The current key, including the rolled counter.
    pub fn key(&self) -> &[u8; KEY_LEN] {
        &self.key
    }

    /// Encrypt `data` in place and roll the key.
    pub fn encrypt(&mut self, data: &mut [u8]) {
        let mut prev = 0u8;
        for (i, byte) in data.iter_mut().enumerate() {
            prev ^= *byte ^ self.key[i & 15];
            *byte = prev;
        }
        self.roll(data.len());
    }

    /// Decrypt `data` in place and roll the key.
    pub fn decrypt(&mut self, data: &mut [u8]) {
        let mut prev = 0u8;
        for (i, byte) in data.iter_mut().enumerate() {
            let cipher = *byte;
            *byte = cipher ^ self.key[i & 15] ^ prev;
            prev = cipher;
        }
        self.roll(data.len());
    }

    fn roll(&mut self, len: usize) {
        let mut counter = [0u8; 4];
        counter.copy_from_slice(&self.key[8..12]);
        let counter = u32::from_le_bytes(counter).wrapping_add(len as u32);
        self.key[8..12].copy_from_slice(&counter.to_le_bytes());
    }
}

impl PacketTransform for XorCipher {
    fn encode(&mut self, body: &mut BytesMut) {
        self.encrypt(&mut body[..]);
    }

    fn decode(&mut self, body: &mut BytesMut) -> Result<(), TransformError> {
        self.decrypt(&mut body[..]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed_key() -> [u8; KEY_LEN] {
        [
            0x10, 0x20, 0x30, 0x40, 0x50, 0x60, 0x70, 0x80, 0xC8, 0x27, 0x93, 0x01, 0xA1, 0x6C,
            0x31, 0x97,
        ]
    }

    #[test]
    fn test_decrypt_reverses_encrypt_across_packets() {
        let mut outbound = XorCipher::new(fixed_key());
        let mut inbound = XorCipher::new(fixed_key());

        for message in [&b"first packet"[..], &b"2"[..], &b"a somewhat longer third packet body"[..]] {
            let mut data = message.to_vec();
            outbound.encrypt(&mut data);
            assert_ne!(data, message);
            inbound.decrypt(&mut data);
            assert_eq!(data, message);
        }
        assert_eq!(outbound.key(), inbound.key());
    }

    #[test]
    fn test_key_counter_advances_by_length() {
        let mut cipher = XorCipher::new(fixed_key());
        let before = u32::from_le_bytes([0xC8, 0x27, 0x93, 0x01]);
        cipher.encrypt(&mut [0u8; 37]);
        let after = u32::from_le_bytes(cipher.key()[8..12].try_into().unwrap());
        assert_eq!(after, before + 37);
        // Bytes outside the counter are untouched.
        assert_eq!(cipher.key()[..8], fixed_key()[..8]);
        assert_eq!(cipher.key()[12..], fixed_key()[12..]);
    }

    #[test]
    fn test_out_of_sync_key_garbles_data() {
        let mut outbound = XorCipher::new(fixed_key());
        let mut inbound = XorCipher::new(fixed_key());

        let mut skipped = b"skipped".to_vec();
        outbound.encrypt(&mut skipped);

        // Long enough to reach the rolled counter bytes.
        let message = b"payload longer than twelve bytes";
        let mut data = message.to_vec();
        outbound.encrypt(&mut data);
        inbound.decrypt(&mut data);
        assert_ne!(&data[..], &message[..]);
    }

    #[test]
    fn test_random_key_keeps_fixed_tail() {
        let key = XorCipher::random_key();
        assert_eq!(key[8..], KEY_TAIL);
    }
}
