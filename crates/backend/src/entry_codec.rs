//! Binary entry encoding for the `id2entry` tree.
//!
//! Layout: `[version][flags][payload]`. The payload is a postcard
//! [`StoredEntry`] in which attribute names are replaced by numeric tokens
//! from the token table. Depending on configuration the payload is
//! zstd-compressed and then sealed with XChaCha20-Poly1305; a sealed payload
//! starts with its 24-byte nonce and authenticates the two header bytes.

use chacha20poly1305::{
    XChaCha20Poly1305, XNonce,
    aead::{Aead, AeadCore, KeyInit, Payload},
};
use dirstore_types::{
    codec::{decode, encode},
    config::EntryEncodingConfig,
};
use serde::{Deserialize, Serialize};
use snafu::ResultExt;

use crate::error::{CodecSnafu, ConfigSnafu, EncryptionSnafu, IoSnafu, Result, corruption};

/// Current record format version.
pub const FORMAT_VERSION: u8 = 1;

const FLAG_COMPRESSED: u8 = 0b01;
const FLAG_ENCRYPTED: u8 = 0b10;
const HEADER_LEN: usize = 2;
const NONCE_LEN: usize = 24;

/// The tokenized form of an entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEntry {
    /// The entry's DN in string form.
    pub dn: String,
    /// Attribute token and values, in token order.
    pub attributes: Vec<(u32, Vec<Vec<u8>>)>,
}

/// Encodes and decodes `id2entry` records.
#[derive(Clone)]
pub struct EntryCodec {
    compression_level: Option<i32>,
    cipher: Option<XChaCha20Poly1305>,
}

impl std::fmt::Debug for EntryCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryCodec")
            .field("compression_level", &self.compression_level)
            .field("encrypted", &self.cipher.is_some())
            .finish()
    }
}

impl EntryCodec {
    /// Creates a codec for the configured encoding.
    ///
    /// # Errors
    ///
    /// Returns [`crate::BackendError::Config`] if the encryption key is malformed.
    pub fn new(config: &EntryEncodingConfig) -> Result<Self> {
        let key = config.encryption_key_bytes().context(ConfigSnafu)?;
        Ok(Self {
            compression_level: config.compress.then_some(config.compression_level),
            cipher: key.map(|k| XChaCha20Poly1305::new(&k.into())),
        })
    }

    /// A codec that neither compresses nor encrypts.
    #[cfg(test)]
    pub fn plain() -> Self {
        Self { compression_level: None, cipher: None }
    }

    /// Encodes a record.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization, compression or encryption fails.
    pub fn seal(&self, record: &StoredEntry) -> Result<Vec<u8>> {
        let mut payload = encode(record).context(CodecSnafu)?;
        let mut flags = 0u8;
        if let Some(level) = self.compression_level {
            payload = zstd::encode_all(payload.as_slice(), level).context(IoSnafu)?;
            flags |= FLAG_COMPRESSED;
        }
        let Some(cipher) = &self.cipher else {
            let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
            out.extend_from_slice(&[FORMAT_VERSION, flags]);
            out.extend_from_slice(&payload);
            return Ok(out);
        };

        flags |= FLAG_ENCRYPTED;
        let header = [FORMAT_VERSION, flags];
        let nonce = XChaCha20Poly1305::generate_nonce(&mut rand::thread_rng());
        let sealed = cipher
            .encrypt(&nonce, Payload { msg: &payload, aad: &header })
            .map_err(|e| EncryptionSnafu { reason: e.to_string() }.build())?;
        let mut out = Vec::with_capacity(HEADER_LEN + NONCE_LEN + sealed.len());
        out.extend_from_slice(&header);
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    /// Decodes a record.
    ///
    /// # Errors
    ///
    /// Returns [`crate::BackendError::Corruption`] for unknown versions or
    /// truncated records, and [`crate::BackendError::Encryption`] when a sealed
    /// record cannot be opened.
    pub fn open(&self, bytes: &[u8]) -> Result<StoredEntry> {
        if bytes.len() < HEADER_LEN {
            return Err(corruption(format!("entry record of {} bytes", bytes.len())));
        }
        let header = [bytes[0], bytes[1]];
        let [version, flags] = header;
        if version != FORMAT_VERSION {
            return Err(corruption(format!("unknown entry format version {version}")));
        }
        let body = &bytes[HEADER_LEN..];

        let opened;
        let payload = if flags & FLAG_ENCRYPTED != 0 {
            let Some(cipher) = &self.cipher else {
                return EncryptionSnafu { reason: "entry is encrypted but no key is configured" }
                    .fail();
            };
            if body.len() < NONCE_LEN {
                return Err(corruption("sealed entry record is missing its nonce"));
            }
            let (nonce, sealed) = body.split_at(NONCE_LEN);
            opened = cipher
                .decrypt(XNonce::from_slice(nonce), Payload { msg: sealed, aad: &header })
                .map_err(|e| EncryptionSnafu { reason: e.to_string() }.build())?;
            opened.as_slice()
        } else {
            body
        };

        if flags & FLAG_COMPRESSED != 0 {
            let inflated = zstd::decode_all(payload)
                .map_err(|e| corruption(format!("entry record does not decompress: {e}")))?;
            decode(&inflated).context(CodecSnafu)
        } else {
            decode(payload).context(CodecSnafu)
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use dirstore_types::ErrorCode;

    use super::*;

    const KEY: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

    fn record() -> StoredEntry {
        StoredEntry {
            dn: "uid=alice,ou=people,dc=example,dc=com".into(),
            attributes: vec![(1, vec![b"alice".to_vec()]), (2, vec![vec![b'x'; 300]])],
        }
    }

    fn codec(compress: bool, key: Option<&str>) -> EntryCodec {
        let config = EntryEncodingConfig::builder()
            .compress(compress)
            .maybe_encryption_key(key.map(String::from))
            .build()
            .unwrap();
        EntryCodec::new(&config).unwrap()
    }

    #[test]
    fn test_every_mode_opens_what_it_sealed() {
        for (compress, key) in [(false, None), (true, None), (false, Some(KEY)), (true, Some(KEY))] {
            let codec = codec(compress, key);
            let sealed = codec.seal(&record()).unwrap();
            assert_eq!(codec.open(&sealed).unwrap(), record(), "compress={compress} key={key:?}");
        }
    }

    #[test]
    fn test_compression_shrinks_repetitive_values() {
        let plain = EntryCodec::plain().seal(&record()).unwrap();
        let packed = codec(true, None).seal(&record()).unwrap();
        assert!(packed.len() < plain.len());
    }

    #[test]
    fn test_encrypted_record_hides_plaintext() {
        let sealed = codec(false, Some(KEY)).seal(&record()).unwrap();
        let needle = b"alice";
        assert!(!sealed.windows(needle.len()).any(|w| w == needle));
    }

    #[test]
    fn test_tampered_header_fails_authentication() {
        let codec = codec(false, Some(KEY));
        let mut sealed = codec.seal(&record()).unwrap();
        sealed[1] |= FLAG_COMPRESSED;
        let err = codec.open(&sealed).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Encryption);
    }

    #[test]
    fn test_sealed_record_needs_key() {
        let sealed = codec(false, Some(KEY)).seal(&record()).unwrap();
        let err = EntryCodec::plain().open(&sealed).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Encryption);
    }

    #[test]
    fn test_plain_records_open_under_encrypting_codec() {
        let sealed = EntryCodec::plain().seal(&record()).unwrap();
        assert_eq!(codec(false, Some(KEY)).open(&sealed).unwrap(), record());
    }

    #[test]
    fn test_unknown_version_is_corruption() {
        let mut sealed = EntryCodec::plain().seal(&record()).unwrap();
        sealed[0] = 9;
        assert_eq!(EntryCodec::plain().open(&sealed).unwrap_err().code(), ErrorCode::Corruption);
        assert_eq!(EntryCodec::plain().open(&[1]).unwrap_err().code(), ErrorCode::Corruption);
    }
}
