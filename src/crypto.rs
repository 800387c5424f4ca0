/// Challenge/response handshake and stream-cipher key derivation.
///
/// A fresh tunnel is keyed by a 16-byte token: an 8-byte random challenge
/// and an 8-byte timestamp, both little-endian u64s. The token is carried
/// as a 32-byte block: AES-128-ECB(token) followed by an HMAC-MD5 over the
/// ciphertext. Both halves of that 32-byte block's key come from splitting
/// SHA-256(secret) in two.
use aes::Aes128;
use cipher::{consts::U128, generic_array::GenericArray, BlockDecrypt, BlockEncrypt, KeyInit};
use hmac::{Hmac, Mac};
use md5::Md5;
use rand::RngCore;
use rc4::{Rc4, StreamCipher};
use sha2::{Digest, Sha256};

type HmacMd5 = Hmac<Md5>;

const TOKEN_LEN: usize = 16;
const BLOCK_LEN: usize = 32;
const MAC_LEN: usize = 16;
const RC4_KEY_LEN: usize = 128;

#[derive(Clone, Copy)]
pub struct Token {
    pub challenge: u64,
    pub timestamp: u64,
}

impl Token {
    pub fn random() -> Token {
        Token {
            challenge: rand::thread_rng().next_u64(),
            timestamp: now_nanos(),
        }
    }

    /// The complement used to prove possession of the secret without
    /// echoing the same bytes back: binds both sides to the same token
    /// while never sending the original bytes twice.
    pub fn complement(&self) -> Token {
        Token {
            challenge: !self.challenge,
            timestamp: !self.timestamp,
        }
    }

    fn to_bytes(self) -> [u8; TOKEN_LEN] {
        let mut buf = [0u8; TOKEN_LEN];
        buf[0..8].copy_from_slice(&self.challenge.to_le_bytes());
        buf[8..16].copy_from_slice(&self.timestamp.to_le_bytes());
        buf
    }

    fn from_bytes(buf: &[u8]) -> Token {
        let mut challenge = [0u8; 8];
        let mut timestamp = [0u8; 8];
        challenge.copy_from_slice(&buf[0..8]);
        timestamp.copy_from_slice(&buf[8..16]);
        Token {
            challenge: u64::from_le_bytes(challenge),
            timestamp: u64::from_le_bytes(timestamp),
        }
    }

    /// The 128-byte RC4 key: this token's bytes repeated eight times.
    pub fn rc4_key(&self) -> [u8; RC4_KEY_LEN] {
        let bytes = self.to_bytes();
        let mut key = [0u8; RC4_KEY_LEN];
        for chunk in key.chunks_mut(TOKEN_LEN) {
            chunk.copy_from_slice(&bytes);
        }
        key
    }
}

fn now_nanos() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// Derived from the shared secret: an AES-128 key (bytes 0..16 of
/// SHA-256(secret)) and an HMAC-MD5 key (bytes 16..32).
pub struct EncryptAlgorithm {
    aes_key: [u8; 16],
    mac_key: [u8; 16],
}

impl EncryptAlgorithm {
    pub fn new(secret: &str) -> EncryptAlgorithm {
        let digest = Sha256::digest(secret.as_bytes());
        let mut aes_key = [0u8; 16];
        let mut mac_key = [0u8; 16];
        aes_key.copy_from_slice(&digest[0..16]);
        mac_key.copy_from_slice(&digest[16..32]);
        EncryptAlgorithm { aes_key, mac_key }
    }

    /// Encrypt a token into a 32-byte block: one AES-128 block (the token
    /// is exactly one block, so ECB mode reduces to a single block-cipher
    /// call) ‖ HMAC-MD5 over that ciphertext.
    pub fn seal(&self, token: Token) -> [u8; BLOCK_LEN] {
        let aes = Aes128::new(GenericArray::from_slice(&self.aes_key));
        let mut cipher_block = GenericArray::clone_from_slice(&token.to_bytes());
        aes.encrypt_block(&mut cipher_block);

        let mut mac = HmacMd5::new_from_slice(&self.mac_key).expect("hmac accepts any key length");
        mac.update(&cipher_block);
        let tag = mac.finalize().into_bytes();

        let mut block = [0u8; BLOCK_LEN];
        block[0..16].copy_from_slice(&cipher_block);
        block[16..32].copy_from_slice(&tag);
        block
    }

    /// Verify the MAC and decrypt a 32-byte block, returning the token.
    pub fn open(&self, block: &[u8]) -> Option<Token> {
        if block.len() != BLOCK_LEN {
            return None;
        }
        let (cipher_bytes, tag) = block.split_at(16);

        let mut mac = HmacMd5::new_from_slice(&self.mac_key).expect("hmac accepts any key length");
        mac.update(cipher_bytes);
        if mac.verify_slice(tag).is_err() {
            return None;
        }

        let aes = Aes128::new(GenericArray::from_slice(&self.aes_key));
        let mut plain_block = GenericArray::clone_from_slice(cipher_bytes);
        aes.decrypt_block(&mut plain_block);
        Some(Token::from_bytes(&plain_block))
    }
}

/// Both directions of RC4 state for a single tunnel, keyed once after the
/// handshake completes. Encrypt and decrypt states are independent.
pub struct TunnelCipher {
    encrypt: Rc4<U128>,
    decrypt: Rc4<U128>,
}

impl TunnelCipher {
    pub fn new(key: &[u8; RC4_KEY_LEN]) -> TunnelCipher {
        TunnelCipher {
            encrypt: Rc4::new(GenericArray::from_slice(key)),
            decrypt: Rc4::new(GenericArray::from_slice(key)),
        }
    }

    pub fn encrypt(&mut self, buf: &mut [u8]) {
        self.encrypt.apply_keystream(buf);
    }

    pub fn decrypt(&mut self, buf: &mut [u8]) {
        self.decrypt.apply_keystream(buf);
    }
}

/// Parses the auth packet body `"{user}:{password}@{backend}"`. Splits on
/// the *last* `@` so that `@` may appear in the username/password portion,
/// then splits the left side on the first `:`.
pub fn parse_auth_packet(body: &[u8]) -> Option<(String, String, String)> {
    let text = std::str::from_utf8(body).ok()?;
    let at = text.rfind('@')?;
    let (user_pass, backend) = (&text[..at], &text[at + 1..]);
    let colon = user_pass.find(':')?;
    let (user, pass) = (&user_pass[..colon], &user_pass[colon + 1..]);
    Some((user.to_string(), pass.to_string(), backend.to_string()))
}

pub fn build_auth_packet(user: &str, password: &str, backend: &str) -> Vec<u8> {
    format!("{}:{}@{}", user, password, backend).into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_round_trips_with_matching_secret() {
        let server = EncryptAlgorithm::new("shared-secret");
        let client = EncryptAlgorithm::new("shared-secret");

        let token = Token::random();
        let challenge = server.seal(token);

        let recovered = client.open(&challenge).expect("client should verify server block");
        assert_eq!(recovered.challenge, token.challenge);
        assert_eq!(recovered.timestamp, token.timestamp);

        let response = client.seal(recovered.complement());
        let verified = server.open(&response).expect("server should verify client response");
        assert_eq!(verified.challenge, token.complement().challenge);
        assert_eq!(verified.timestamp, token.complement().timestamp);
    }

    #[test]
    fn mismatched_secret_fails_verification() {
        let server = EncryptAlgorithm::new("shared-secret");
        let attacker = EncryptAlgorithm::new("wrong-secret");

        let token = Token::random();
        let challenge = server.seal(token);
        assert!(attacker.open(&challenge).is_none());
    }

    #[test]
    fn bit_flip_in_mac_is_detected() {
        let algo = EncryptAlgorithm::new("shared-secret");
        let mut block = algo.seal(Token::random());
        block[31] ^= 0x01;
        assert!(algo.open(&block).is_none());
    }

    #[test]
    fn bit_flip_in_ciphertext_is_detected() {
        let algo = EncryptAlgorithm::new("shared-secret");
        let mut block = algo.seal(Token::random());
        block[0] ^= 0x01;
        assert!(algo.open(&block).is_none());
    }

    #[test]
    fn rc4_round_trips() {
        let token = Token::random();
        let key = token.rc4_key();
        let mut a = TunnelCipher::new(&key);
        let mut b = TunnelCipher::new(&key);

        let mut msg = b"hello, tunnel".to_vec();
        a.encrypt(&mut msg);
        b.decrypt(&mut msg);
        assert_eq!(&msg, b"hello, tunnel");
    }

    #[test]
    fn parses_auth_packet_with_at_sign_in_username() {
        let body = build_auth_packet("user@example.com", "p:ss", "mysql");
        let (user, pass, backend) = parse_auth_packet(&body).unwrap();
        assert_eq!(user, "user@example.com");
        assert_eq!(pass, "p:ss");
        assert_eq!(backend, "mysql");
    }
}
