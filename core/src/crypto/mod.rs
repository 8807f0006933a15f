// Cryptography module: characteristic payload framing

pub mod frame;

pub use frame::{
    depad_hex, encode, pad, CipherFrame, CipherKey, Codec, CodecError, BLOCK_SIZE,
    SUPPORTED_KEY_SIZES,
};
