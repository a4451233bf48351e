use std::convert::TryInto;

use aes::{Aes128, Aes256};
use base64::{
    Engine,
    engine::general_purpose::STANDARD,
};
use block_padding::{NoPadding, Pkcs7};
use cbc::{Decryptor, Encryptor};
use cipher::{
    BlockDecrypt, BlockDecryptMut, BlockEncryptMut, KeyInit, KeyIvInit,
    generic_array::GenericArray,
};
use thiserror::Error;

use crate::constants::{FIXED_KEY, FLEXIBLE_KEY_SUFFIX};

/// AES block size in bytes. Firmware block sizes must be a multiple of this.
pub const AES_BLOCK_SIZE: usize = 16;

/// Number of nonce characters that contribute to the session key
const NONCE_KEY_CHARS: usize = 16;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Fixed key has incorrect length")]
    IncorrectFixedKeyLength,
    #[error("Flexible key suffix has incorrect length")]
    IncorrectFlexibleKeySuffixLength,
    #[error("Failed to decode base64 data: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("Ciphertext length {0} is not a non-zero multiple of the block size")]
    InvalidCiphertextLength(usize),
    #[error("Ciphertext has invalid PKCS#7 padding")]
    InvalidPadding,
    #[error("Decrypted nonce is not valid UTF-8")]
    NonUtf8Nonce,
    #[error("Nonce has {0} characters, but at least 16 are required")]
    NonceTooShort(usize),
}

/// Container for holding FUS encryption keys.
#[derive(Clone, Debug)]
pub struct FusKeys {
    pub fixed_key: [u8; 32],
    pub flexible_key_suffix: [u8; 16],
}

impl FusKeys {
    /// Load keys from the specified byte slices. The fixed key should be 32
    /// bytes and the flexible key suffix should be 16 bytes.
    pub fn new(
        fixed_key: &[u8],
        flexible_key_suffix: &[u8],
    ) -> Result<Self, CryptoError> {
        Ok(Self {
            fixed_key: fixed_key.try_into()
                .map_err(|_| CryptoError::IncorrectFixedKeyLength)?,
            flexible_key_suffix: flexible_key_suffix.try_into()
                .map_err(|_| CryptoError::IncorrectFlexibleKeySuffixLength)?,
        })
    }
}

impl Default for FusKeys {
    /// The vendor keys used by the official clients.
    fn default() -> Self {
        let mut fixed_key = [0u8; 32];
        fixed_key.copy_from_slice(FIXED_KEY);
        let mut flexible_key_suffix = [0u8; 16];
        flexible_key_suffix.copy_from_slice(FLEXIBLE_KEY_SUFFIX);

        Self {
            fixed_key,
            flexible_key_suffix,
        }
    }
}

/// Narrow a string to ASCII the way the vendor's client does: every non-ASCII
/// character becomes a single `?`.
fn to_ascii_bytes(s: &str) -> Vec<u8> {
    s.chars()
        .map(|c| if c.is_ascii() { c as u8 } else { b'?' })
        .collect()
}

fn aes256_cbc_encrypt(key: &[u8; 32], data: &[u8]) -> Vec<u8> {
    Encryptor::<Aes256>::new(
        GenericArray::from_slice(key),
        GenericArray::from_slice(&key[..AES_BLOCK_SIZE]),
    ).encrypt_padded_vec_mut::<Pkcs7>(data)
}

fn aes256_cbc_decrypt(key: &[u8; 32], data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if data.is_empty() || data.len() % AES_BLOCK_SIZE != 0 {
        return Err(CryptoError::InvalidCiphertextLength(data.len()));
    }

    Decryptor::<Aes256>::new(
        GenericArray::from_slice(key),
        GenericArray::from_slice(&key[..AES_BLOCK_SIZE]),
    ).decrypt_padded_vec_mut::<Pkcs7>(data)
        .map_err(|_| CryptoError::InvalidPadding)
}

/// Recover the plaintext nonce from the base64 token sent by the server in the
/// `NONCE` response header.
pub fn decrypt_nonce(keys: &FusKeys, token: &str) -> Result<String, CryptoError> {
    let decoded = STANDARD.decode(token.trim())?;
    let plaintext = aes256_cbc_decrypt(&keys.fixed_key, &decoded)?;

    String::from_utf8(plaintext).map_err(|_| CryptoError::NonUtf8Nonce)
}

/// Derive the per-session AES-256 key ("flexible key") from a nonce. Each of
/// the first 16 nonce characters selects a character of the fixed key (mod
/// 16) and the flexible key suffix is appended.
pub fn derive_session_key(keys: &FusKeys, nonce: &str) -> Result<[u8; 32], CryptoError> {
    let nonce = nonce.as_bytes();
    if nonce.len() < NONCE_KEY_CHARS {
        return Err(CryptoError::NonceTooShort(nonce.len()));
    }

    let mut key = [0u8; 32];
    for (k, c) in key.iter_mut().zip(&nonce[..NONCE_KEY_CHARS]) {
        *k = keys.fixed_key[(*c % 16) as usize];
    }
    key[NONCE_KEY_CHARS..].copy_from_slice(&keys.flexible_key_suffix);

    Ok(key)
}

/// Compute the nonce signature for the `Authorization` header. This proves
/// possession of the session key without revealing it.
pub fn sign_nonce(keys: &FusKeys, nonce: &str) -> Result<String, CryptoError> {
    let key = derive_session_key(keys, nonce)?;
    let ciphertext = aes256_cbc_encrypt(&key, nonce.as_bytes());

    Ok(STANDARD.encode(ciphertext))
}

fn logic_check_bytes(input: &[u8], selector: &[u8]) -> String {
    if input.is_empty() {
        return String::new();
    }

    selector.iter()
        .map(|c| input[(*c as usize & 0xf) % input.len()] as char)
        .collect()
}

/// Compute the scrambled `LOGIC_CHECK` value. Every character of `selector`
/// picks a character of `input` by its low nibble. Inputs shorter than 16
/// characters wrap around.
pub fn logic_check(input: &str, selector: &str) -> String {
    logic_check_bytes(input.as_bytes(), selector.as_bytes())
}

/// Compute the `LOGIC_CHECK` value for a firmware file name. Only the last 16
/// characters of the name without its extension(s) are used.
pub fn logic_check_file_name(file_name: &str, selector: &str) -> String {
    let mut data = file_name.as_bytes();

    if let Some(n) = data.iter().position(|x| *x == b'.') {
        data = &data[..n];
    }
    if data.len() > 16 {
        data = &data[data.len() - 16..];
    }

    logic_check_bytes(data, selector.as_bytes())
}

/// Firmware key for `.enc2` files.
pub fn derive_key_v2(version: &str, model: &str, region: &str) -> [u8; 16] {
    let input = to_ascii_bytes(&format!("{region}:{model}:{version}"));
    md5::compute(input).0
}

/// Firmware key for `.enc4` files. The logic value matching the binary nature
/// (factory or home) scrambles the latest version string before hashing.
pub fn derive_key_v4(
    factory: bool,
    latest_version: &str,
    home_logic_value: &str,
    factory_logic_value: &str,
) -> [u8; 16] {
    let selector = if factory { factory_logic_value } else { home_logic_value };
    let scrambled = logic_check(latest_version, selector);

    md5::compute(to_ascii_bytes(&scrambled)).0
}

/// Type for decrypting files downloaded from FUS. This is AES128-ECB, where
/// only the last block of the file carries PKCS#7 padding.
#[derive(Clone)]
pub struct FirmwareCipher(Aes128);

impl FirmwareCipher {
    /// Create a new cipher instance for decrypting FUS files.
    pub fn new(key: &[u8; 16]) -> Self {
        Self(Aes128::new(GenericArray::from_slice(key)))
    }

    /// Decrypt interior ciphertext blocks in-place. No padding is removed.
    pub fn decrypt_blocks(&self, buf: &mut [u8]) -> Result<(), CryptoError> {
        let len = buf.len();
        if len % AES_BLOCK_SIZE != 0 {
            return Err(CryptoError::InvalidCiphertextLength(len));
        }

        self.0.decrypt_padded::<NoPadding>(buf)
            .map_err(|_| CryptoError::InvalidCiphertextLength(len))?;

        Ok(())
    }

    /// Decrypt the final ciphertext block(s) in-place and strip the PKCS#7
    /// padding. Returns the number of plaintext bytes at the start of `buf`.
    pub fn decrypt_final(&self, buf: &mut [u8]) -> Result<usize, CryptoError> {
        let len = buf.len();
        if len == 0 || len % AES_BLOCK_SIZE != 0 {
            return Err(CryptoError::InvalidCiphertextLength(len));
        }

        let plaintext = self.0.decrypt_padded::<Pkcs7>(buf)
            .map_err(|_| CryptoError::InvalidPadding)?;

        Ok(plaintext.len())
    }
}
