// Characteristic payload cipher: count padding + AES-CBC + hex text
//
// Outbound:
// 1. Pad plaintext to a multiple of 16 bytes. Pad length p = 16 - (len % 16),
//    so an aligned plaintext still gets a full block. Every pad byte holds p.
// 2. AES-CBC encrypt under the fixed key/IV with no library padding.
//    Key length selects AES-128/192/256.
// 3. Hex-encode the ciphertext. The hex text is what goes on the wire.
//
// Inbound:
// 1. AES-CBC decrypt under the same fixed key/IV.
// 2. Render the padded plaintext as hex text.
// 3. The last two hex characters give p; keep the first (len/2 - p) hex pairs.
//
// Key and IV never change between messages, so identical plaintexts give
// identical ciphertexts. Wire compatibility with the wearable depends on it.

use aes::{Aes128, Aes192, Aes256};
use cbc::cipher::{block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use std::fmt;
use thiserror::Error;
use tracing::debug;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// AES block size in bytes.
pub const BLOCK_SIZE: usize = 16;

/// Key sizes accepted by the codec (AES-128, AES-192, AES-256).
pub const SUPPORTED_KEY_SIZES: [usize; 3] = [16, 24, 32];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("Invalid key length: {0} bytes (expected 16, 24 or 32)")]
    InvalidKeyLength(usize),
    #[error("Invalid IV length: {0} bytes (expected 16)")]
    InvalidIvLength(usize),
    #[error("Malformed {field} hex: {reason}")]
    MalformedKey { field: &'static str, reason: String },
    #[error("Malformed ciphertext: {0}")]
    MalformedCiphertext(String),
    #[error("Malformed padding: pad byte {pad:#04x} over {len} bytes")]
    MalformedPadding { pad: u8, len: usize },
}

/// Fixed key and IV shared with the wearable.
///
/// Key material is wiped on drop and never printed by `Debug`.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct CipherKey {
    key: Vec<u8>,
    iv: [u8; BLOCK_SIZE],
}

impl CipherKey {
    pub fn new(key: &[u8], iv: &[u8]) -> Result<Self, CodecError> {
        if !SUPPORTED_KEY_SIZES.contains(&key.len()) {
            return Err(CodecError::InvalidKeyLength(key.len()));
        }
        let iv: [u8; BLOCK_SIZE] = iv
            .try_into()
            .map_err(|_| CodecError::InvalidIvLength(iv.len()))?;

        Ok(Self {
            key: key.to_vec(),
            iv,
        })
    }

    /// Parse key and IV from hex text.
    pub fn from_hex(key_hex: &str, iv_hex: &str) -> Result<Self, CodecError> {
        let key = hex::decode(key_hex).map_err(|e| CodecError::MalformedKey {
            field: "key",
            reason: e.to_string(),
        })?;
        let iv = hex::decode(iv_hex).map_err(|e| CodecError::MalformedKey {
            field: "iv",
            reason: e.to_string(),
        })?;
        Self::new(&key, &iv)
    }

    pub fn key_len(&self) -> usize {
        self.key.len()
    }
}

impl fmt::Debug for CipherKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CipherKey")
            .field("key_len", &self.key.len())
            .finish_non_exhaustive()
    }
}

/// Every representation of one outbound payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CipherFrame {
    pub plaintext: Vec<u8>,
    pub padded_plaintext: Vec<u8>,
    pub ciphertext: Vec<u8>,
    pub hex_ciphertext: String,
}

impl CipherFrame {
    /// Bytes written to the characteristic: the UTF-8 hex text.
    pub fn wire_bytes(&self) -> Vec<u8> {
        self.hex_ciphertext.as_bytes().to_vec()
    }
}

/// Apply count padding. Always adds between 1 and 16 bytes.
pub fn pad(plaintext: &[u8]) -> Vec<u8> {
    let pad_len = BLOCK_SIZE - (plaintext.len() % BLOCK_SIZE);
    let mut buffer = Vec::with_capacity(plaintext.len() + pad_len);
    buffer.extend_from_slice(plaintext);
    buffer.resize(plaintext.len() + pad_len, pad_len as u8);
    buffer
}

/// Strip count padding from the hex text of a decrypted buffer.
///
/// Works on hex pairs rather than raw bytes: the trailing pair is the pad
/// length, the leading pairs are returned unchanged.
pub fn depad_hex(decrypted_hex: &str) -> Result<String, CodecError> {
    if !decrypted_hex.is_ascii() || decrypted_hex.len() < 2 || decrypted_hex.len() % 2 != 0 {
        return Err(CodecError::MalformedCiphertext(format!(
            "decrypted text of {} characters is not hex pairs",
            decrypted_hex.len()
        )));
    }

    let split = decrypted_hex.len() - 2;
    let pad = u8::from_str_radix(&decrypted_hex[split..], 16)
        .map_err(|e| CodecError::MalformedCiphertext(e.to_string()))?;
    let byte_count = decrypted_hex.len() / 2;

    if pad == 0 || pad as usize > BLOCK_SIZE || pad as usize > byte_count {
        return Err(CodecError::MalformedPadding {
            pad,
            len: byte_count,
        });
    }

    let usable = byte_count - pad as usize;
    Ok(decrypted_hex[..usable * 2].to_string())
}

/// Pad, encrypt and hex-encode `plaintext` under a caller-supplied key/IV.
pub fn encode(plaintext: &[u8], key: &[u8], iv: &[u8]) -> Result<String, CodecError> {
    let cipher_key = CipherKey::new(key, iv)?;
    Ok(Codec::new(cipher_key).encrypt_frame(plaintext)?.hex_ciphertext)
}

/// Raw AES-CBC over whole blocks. `data` must already be block aligned.
pub(crate) fn encrypt_blocks(key: &CipherKey, data: &[u8]) -> Result<Vec<u8>, CodecError> {
    if data.len() % BLOCK_SIZE != 0 {
        return Err(CodecError::MalformedCiphertext(format!(
            "{} bytes is not block aligned",
            data.len()
        )));
    }

    let invalid_key = |_| CodecError::InvalidKeyLength(key.key.len());
    let ciphertext = match key.key.len() {
        16 => cbc::Encryptor::<Aes128>::new_from_slices(&key.key, &key.iv)
            .map_err(invalid_key)?
            .encrypt_padded_vec_mut::<NoPadding>(data),
        24 => cbc::Encryptor::<Aes192>::new_from_slices(&key.key, &key.iv)
            .map_err(invalid_key)?
            .encrypt_padded_vec_mut::<NoPadding>(data),
        32 => cbc::Encryptor::<Aes256>::new_from_slices(&key.key, &key.iv)
            .map_err(invalid_key)?
            .encrypt_padded_vec_mut::<NoPadding>(data),
        other => return Err(CodecError::InvalidKeyLength(other)),
    };
    Ok(ciphertext)
}

fn decrypt_blocks(key: &CipherKey, data: &[u8]) -> Result<Vec<u8>, CodecError> {
    if data.is_empty() || data.len() % BLOCK_SIZE != 0 {
        return Err(CodecError::MalformedCiphertext(format!(
            "{} bytes is not a whole number of blocks",
            data.len()
        )));
    }

    let invalid_key = |_| CodecError::InvalidKeyLength(key.key.len());
    let unpad = |e: cbc::cipher::block_padding::UnpadError| {
        CodecError::MalformedCiphertext(e.to_string())
    };
    let plaintext = match key.key.len() {
        16 => cbc::Decryptor::<Aes128>::new_from_slices(&key.key, &key.iv)
            .map_err(invalid_key)?
            .decrypt_padded_vec_mut::<NoPadding>(data)
            .map_err(unpad)?,
        24 => cbc::Decryptor::<Aes192>::new_from_slices(&key.key, &key.iv)
            .map_err(invalid_key)?
            .decrypt_padded_vec_mut::<NoPadding>(data)
            .map_err(unpad)?,
        32 => cbc::Decryptor::<Aes256>::new_from_slices(&key.key, &key.iv)
            .map_err(invalid_key)?
            .decrypt_padded_vec_mut::<NoPadding>(data)
            .map_err(unpad)?,
        other => return Err(CodecError::InvalidKeyLength(other)),
    };
    Ok(plaintext)
}

/// Payload codec bound to the configured key/IV.
#[derive(Debug, Clone)]
pub struct Codec {
    key: CipherKey,
}

impl Codec {
    pub fn new(key: CipherKey) -> Self {
        Self { key }
    }

    /// Build the full frame for an outbound payload.
    pub fn encrypt_frame(&self, plaintext: &[u8]) -> Result<CipherFrame, CodecError> {
        let padded_plaintext = pad(plaintext);
        let ciphertext = encrypt_blocks(&self.key, &padded_plaintext)?;
        let hex_ciphertext = hex::encode(&ciphertext);

        debug!(
            plaintext_len = plaintext.len(),
            padded_len = padded_plaintext.len(),
            "encrypted payload frame"
        );

        Ok(CipherFrame {
            plaintext: plaintext.to_vec(),
            padded_plaintext,
            ciphertext,
            hex_ciphertext,
        })
    }

    /// Encode to the hex text written on the wire.
    pub fn encode(&self, plaintext: &[u8]) -> Result<String, CodecError> {
        Ok(self.encrypt_frame(plaintext)?.hex_ciphertext)
    }

    /// Decrypt raw ciphertext bytes and return the depadded plaintext as hex text.
    pub fn decode(&self, ciphertext: &[u8]) -> Result<String, CodecError> {
        let decrypted = decrypt_blocks(&self.key, ciphertext)?;
        depad_hex(&hex::encode(decrypted))
    }

    /// Decrypt ciphertext given as hex text.
    pub fn decode_hex(&self, hex_ciphertext: &str) -> Result<String, CodecError> {
        let ciphertext = hex::decode(hex_ciphertext.trim())
            .map_err(|e| CodecError::MalformedCiphertext(e.to_string()))?;
        self.decode(&ciphertext)
    }

    /// Decode a characteristic value.
    ///
    /// Values made only of ASCII hex digits are hex text; anything else is
    /// taken as raw ciphertext.
    pub fn decode_payload(&self, value: &[u8]) -> Result<String, CodecError> {
        if !value.is_empty() && value.iter().all(u8::is_ascii_hexdigit) {
            let text = std::str::from_utf8(value)
                .map_err(|e| CodecError::MalformedCiphertext(e.to_string()))?;
            self.decode_hex(text)
        } else {
            self.decode(value)
        }
    }

    /// Decode a characteristic value into plaintext bytes.
    pub fn decode_to_bytes(&self, value: &[u8]) -> Result<Vec<u8>, CodecError> {
        let plaintext_hex = self.decode_payload(value)?;
        hex::decode(plaintext_hex).map_err(|e| CodecError::MalformedCiphertext(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // NIST SP 800-38A, F.2.1 (CBC-AES128) and F.2.5 (CBC-AES256)
    const NIST_IV: &str = "000102030405060708090a0b0c0d0e0f";
    const NIST_KEY_128: &str = "2b7e151628aed2a6abf7158809cf4f3c";
    const NIST_KEY_256: &str = "603deb1015ca71be2b73aef0857d77811f352c073b6108d72d9810a30914dff4";
    const NIST_PLAINTEXT: &str = "6bc1bee22e409f96e93d7e117393172aae2d8a571e03ac9c9eb76fac45af8e51";

    fn test_codec() -> Codec {
        Codec::new(CipherKey::from_hex(NIST_KEY_128, NIST_IV).unwrap())
    }

    #[test]
    fn test_pad_lengths() {
        assert_eq!(pad(&[]), vec![0x10; 16]);
        assert_eq!(pad(&[0xAA; 15]).len(), 16);
        assert_eq!(pad(&[0xAA; 15])[15], 0x01);
        assert_eq!(pad(&[0xAA; 16]).len(), 32);
        assert_eq!(&pad(&[0xAA; 16])[16..], &[0x10; 16]);
        assert_eq!(pad(&[0xAA; 17]).len(), 32);
        assert_eq!(pad(&[0xAA; 17])[31], 15);
    }

    #[test]
    fn test_aes128_matches_nist_prefix() {
        let key = hex::decode(NIST_KEY_128).unwrap();
        let iv = hex::decode(NIST_IV).unwrap();
        let plaintext = hex::decode(NIST_PLAINTEXT).unwrap();

        let encoded = encode(&plaintext, &key, &iv).unwrap();

        // 32 aligned bytes gain a full padding block
        assert_eq!(encoded.len(), 96);
        assert!(encoded.starts_with(
            "7649abac8119b246cee98e9b12e9197d5086cb9b507219ee95db113a917678b2"
        ));
    }

    #[test]
    fn test_aes256_matches_nist_prefix() {
        let key = hex::decode(NIST_KEY_256).unwrap();
        let iv = hex::decode(NIST_IV).unwrap();
        let plaintext = hex::decode(&NIST_PLAINTEXT[..32]).unwrap();

        let encoded = encode(&plaintext, &key, &iv).unwrap();
        assert_eq!(encoded.len(), 64);
        assert!(encoded.starts_with("f58c4c04d6e5f1ba779eabfb5f7bfbd6"));
    }

    #[test]
    fn test_empty_plaintext_is_one_block() {
        let frame = test_codec().encrypt_frame(&[]).unwrap();
        assert_eq!(frame.padded_plaintext, vec![0x10; 16]);
        assert_eq!(frame.ciphertext.len(), 16);
        assert_eq!(frame.hex_ciphertext.len(), 32);
    }

    #[test]
    fn test_invalid_key_length() {
        let iv = [0u8; 16];
        assert_eq!(
            encode(b"hi", &[0u8; 15], &iv),
            Err(CodecError::InvalidKeyLength(15))
        );
        assert_eq!(
            encode(b"hi", &[0u8; 33], &iv),
            Err(CodecError::InvalidKeyLength(33))
        );
        assert!(encode(b"hi", &[0u8; 24], &iv).is_ok());
    }

    #[test]
    fn test_invalid_iv_length() {
        assert_eq!(
            CipherKey::new(&[0u8; 16], &[0u8; 8]).unwrap_err(),
            CodecError::InvalidIvLength(8)
        );
    }

    #[test]
    fn test_malformed_key_hex() {
        let err = CipherKey::from_hex("zz112233445566778899aabbccddeeff", NIST_IV).unwrap_err();
        assert!(matches!(err, CodecError::MalformedKey { field: "key", .. }));
        assert!(err.to_string().starts_with("Malformed key hex"));

        let err = CipherKey::from_hex(NIST_KEY_128, "0001020").unwrap_err();
        assert!(matches!(err, CodecError::MalformedKey { field: "iv", .. }));
    }

    #[test]
    fn test_decode_roundtrip_hex_text() {
        let codec = test_codec();
        let wire = codec.encrypt_frame(b"\x00\x05\x00DUMMY").unwrap().wire_bytes();

        let decoded = codec.decode_payload(&wire).unwrap();
        assert_eq!(decoded, hex::encode(b"\x00\x05\x00DUMMY"));
        assert_eq!(codec.decode_to_bytes(&wire).unwrap(), b"\x00\x05\x00DUMMY");
    }

    #[test]
    fn test_decode_raw_ciphertext() {
        let codec = test_codec();
        let frame = codec.encrypt_frame(b"step info").unwrap();
        assert_eq!(codec.decode(&frame.ciphertext).unwrap(), hex::encode(b"step info"));
    }

    #[test]
    fn test_decode_rejects_zero_pad_byte() {
        let key = CipherKey::from_hex(NIST_KEY_128, NIST_IV).unwrap();
        let mut block = [0x41u8; 16];
        block[15] = 0x00;
        let ciphertext = encrypt_blocks(&key, &block).unwrap();

        let result = Codec::new(key).decode(&ciphertext);
        assert_eq!(
            result,
            Err(CodecError::MalformedPadding { pad: 0, len: 16 })
        );
    }

    #[test]
    fn test_decode_rejects_oversized_pad_byte() {
        let key = CipherKey::from_hex(NIST_KEY_128, NIST_IV).unwrap();
        let mut block = [0x41u8; 16];
        block[15] = 0x11;
        let ciphertext = encrypt_blocks(&key, &block).unwrap();

        let result = Codec::new(key).decode(&ciphertext);
        assert!(matches!(
            result,
            Err(CodecError::MalformedPadding { pad: 0x11, .. })
        ));
    }

    #[test]
    fn test_decode_rejects_partial_block() {
        let codec = test_codec();
        assert!(matches!(
            codec.decode(&[0u8; 15]),
            Err(CodecError::MalformedCiphertext(_))
        ));
        assert!(matches!(
            codec.decode(&[]),
            Err(CodecError::MalformedCiphertext(_))
        ));
    }

    #[test]
    fn test_depad_hex_keeps_leading_pairs() {
        let text = format!("{}{}", "ab".repeat(13), "030303");
        assert_eq!(depad_hex(&text).unwrap(), "ab".repeat(13));
        assert_eq!(depad_hex(&"10".repeat(16)).unwrap(), "");
    }

    #[test]
    fn test_cipher_key_debug_is_redacted() {
        let key = CipherKey::from_hex(NIST_KEY_128, NIST_IV).unwrap();
        let rendered = format!("{:?}", key);
        assert!(!rendered.contains("2b7e"));
        assert!(rendered.contains("key_len"));
    }
}
