//! Tuya payload encryption and per-version payload envelopes.
//! All four supported versions use AES-128-ECB; what differs is how the
//! ciphertext is wrapped (v3.1 base64 + MD5 signature, v3.2/3.3 outer
//! version header, v3.4 inner version header under the session key).

use crate::error::{Result, TuyaError};
use crate::protocol::{CommandType, ProtocolVersion};
use aes::Aes128;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use cipher::{BlockDecryptMut, BlockEncryptMut, KeyInit};
use ecb::{Decryptor, Encryptor};
use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use sha2::Sha256;

/// Version header: 3 ASCII marker bytes + 12 bytes of padding.
const VERSION_HEADER_LEN: usize = 15;

/// v3.1 envelope: 3 marker bytes + 16 hex chars of MD5 signature.
const V31_ENVELOPE_LEN: usize = 19;

/// AES-128-ECB with manual PKCS7, the cipher shared by every protocol
/// version on the 55AA framing.
pub struct TuyaCipher {
    key: [u8; 16],
}

impl TuyaCipher {
    /// Create a new cipher from a 16-byte key.
    pub fn new(key: &[u8]) -> Result<Self> {
        if key.len() != 16 {
            return Err(TuyaError::EncryptionFailed);
        }
        let mut k = [0u8; 16];
        k.copy_from_slice(key);
        Ok(Self { key: k })
    }

    /// Encrypt data. With `padding`, applies PKCS7 first; otherwise the
    /// input length must already be a multiple of the block size.
    pub fn encrypt(&self, data: &[u8], padding: bool) -> Result<Vec<u8>> {
        let mut encryptor = Encryptor::<Aes128>::new(&self.key.into());

        let mut buf = if padding {
            let pad_len = 16 - data.len() % 16;
            let mut p = data.to_vec();
            p.extend(std::iter::repeat_n(pad_len as u8, pad_len));
            p
        } else {
            if !data.len().is_multiple_of(16) {
                return Err(TuyaError::EncryptionFailed);
            }
            data.to_vec()
        };

        for chunk in buf.chunks_mut(16) {
            let block = cipher::generic_array::GenericArray::from_mut_slice(chunk);
            encryptor.encrypt_block_mut(block);
        }
        Ok(buf)
    }

    /// Decrypt data and strip PKCS7 padding.
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.is_empty() || !data.len().is_multiple_of(16) {
            return Err(TuyaError::DecryptionFailed);
        }

        let mut decryptor = Decryptor::<Aes128>::new(&self.key.into());
        let mut buf = data.to_vec();
        for chunk in buf.chunks_mut(16) {
            let block = cipher::generic_array::GenericArray::from_mut_slice(chunk);
            decryptor.decrypt_block_mut(block);
        }

        let pad_len = buf[buf.len() - 1] as usize;
        if pad_len == 0 || pad_len > 16 || pad_len > buf.len() {
            return Err(TuyaError::DecryptionFailed);
        }
        for i in 0..pad_len {
            if buf[buf.len() - 1 - i] != pad_len as u8 {
                return Err(TuyaError::DecryptionFailed);
            }
        }
        buf.truncate(buf.len() - pad_len);
        Ok(buf)
    }

    /// Raw block encryption without padding; used for session-key derivation.
    pub fn encrypt_block(&self, data: &[u8]) -> Result<Vec<u8>> {
        self.encrypt(data, false)
    }
}

/// HMAC-SHA256 helper shared by the v3.4 handshake and frame footers.
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let mut mac =
        <Hmac<Sha256> as Mac>::new_from_slice(key).map_err(|_| TuyaError::EncryptionFailed)?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Derive the connection-scoped v3.4 session key from both nonces.
/// The device computes the same value, so the XOR is taken with the remote
/// nonce cycled over the local one, then sealed with the local key.
pub fn derive_session_key(
    local_key: &[u8],
    local_nonce: &[u8],
    remote_nonce: &[u8],
) -> Result<Vec<u8>> {
    if remote_nonce.is_empty() {
        return Err(TuyaError::HandshakeFailed);
    }
    let xored: Vec<u8> = local_nonce
        .iter()
        .enumerate()
        .map(|(i, b)| b ^ remote_nonce[i % remote_nonce.len()])
        .collect();
    TuyaCipher::new(local_key)?.encrypt_block(&xored)
}

/// Seals and opens payloads for one connection. Constructed once per
/// connection with the active key: the static local key for v3.1-3.3, the
/// negotiated session key for v3.4 (so no payload can be opened before the
/// handshake has produced that key).
pub struct VersionCodec {
    version: ProtocolVersion,
    cipher: TuyaCipher,
    key: [u8; 16],
}

impl VersionCodec {
    pub fn new(version: ProtocolVersion, key: &[u8]) -> Result<Self> {
        let cipher = TuyaCipher::new(key)?;
        let mut k = [0u8; 16];
        k.copy_from_slice(key);
        Ok(Self {
            version,
            cipher,
            key: k,
        })
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    /// Key for frame HMAC footers; only v3.4 frames carry one.
    pub fn hmac_key(&self) -> Option<&[u8]> {
        self.version.uses_hmac().then_some(self.key.as_slice())
    }

    /// Wrap an outgoing JSON payload into the version's wire envelope.
    pub fn seal(&self, cmd: CommandType, payload: &[u8]) -> Result<Vec<u8>> {
        match self.version {
            ProtocolVersion::V3_1 => {
                if cmd != CommandType::Control {
                    // v3.1 sends queries and heartbeats in the clear.
                    return Ok(payload.to_vec());
                }
                let b64 = BASE64.encode(self.cipher.encrypt(payload, true)?).into_bytes();

                let mut md5 = Md5::new();
                md5.update(b"data=");
                md5.update(&b64);
                md5.update(b"||lpv=3.1||");
                md5.update(self.key);
                let digest = hex::encode(md5.finalize());

                let mut out = b"3.1".to_vec();
                out.extend_from_slice(&digest.as_bytes()[8..24]);
                out.extend_from_slice(&b64);
                Ok(out)
            }
            ProtocolVersion::V3_2 | ProtocolVersion::V3_3 => {
                let encrypted = self.cipher.encrypt(payload, true)?;
                if cmd.carries_version_header() {
                    Ok(self.prepend_version_header(&encrypted))
                } else {
                    Ok(encrypted)
                }
            }
            ProtocolVersion::V3_4 => {
                let plain = if cmd.carries_version_header() {
                    self.prepend_version_header(payload)
                } else {
                    payload.to_vec()
                };
                self.cipher.encrypt(&plain, true)
            }
        }
    }

    /// Unwrap an inbound payload (retcode already stripped by the framer)
    /// back to plaintext JSON bytes.
    pub fn open(&self, payload: &[u8]) -> Result<Vec<u8>> {
        if payload.is_empty() {
            return Ok(Vec::new());
        }
        match self.version {
            ProtocolVersion::V3_1 => {
                if payload.len() > V31_ENVELOPE_LEN && payload.starts_with(b"3.1") {
                    let b64 = &payload[V31_ENVELOPE_LEN..];
                    let encrypted =
                        BASE64.decode(b64).map_err(|_| TuyaError::DecryptionFailed)?;
                    self.cipher.decrypt(&encrypted)
                } else {
                    Ok(payload.to_vec())
                }
            }
            ProtocolVersion::V3_2 | ProtocolVersion::V3_3 => {
                let body = self.strip_version_header(payload);
                if body.is_empty() {
                    return Ok(Vec::new());
                }
                match self.cipher.decrypt(body) {
                    Ok(plain) => Ok(self.strip_version_header(&plain).to_vec()),
                    // Some firmware answers queries in the clear.
                    Err(_) if body.first() == Some(&b'{') => Ok(body.to_vec()),
                    Err(e) => Err(e),
                }
            }
            ProtocolVersion::V3_4 => {
                let plain = self.cipher.decrypt(payload)?;
                Ok(self.strip_version_header(&plain).to_vec())
            }
        }
    }

    fn prepend_version_header(&self, body: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(VERSION_HEADER_LEN + body.len());
        out.extend_from_slice(self.version.marker());
        out.extend_from_slice(&[0u8; 12]);
        out.extend_from_slice(body);
        out
    }

    fn strip_version_header<'a>(&self, body: &'a [u8]) -> &'a [u8] {
        if body.len() >= VERSION_HEADER_LEN && body.starts_with(self.version.marker()) {
            &body[VERSION_HEADER_LEN..]
        } else {
            body
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &[u8; 16] = b"bellkey_16bytes!";

    #[test]
    fn ecb_roundtrip_with_padding() {
        let cipher = TuyaCipher::new(KEY).unwrap();
        for len in [0, 1, 15, 16, 17, 100] {
            let data: Vec<u8> = (0..len as u8).collect();
            let encrypted = cipher.encrypt(&data, true).unwrap();
            assert!(encrypted.len().is_multiple_of(16));
            assert_eq!(cipher.decrypt(&encrypted).unwrap(), data);
        }
    }

    #[test]
    fn short_key_is_rejected() {
        assert!(TuyaCipher::new(b"short").is_err());
    }

    #[test]
    fn unpadded_encrypt_requires_block_multiple() {
        let cipher = TuyaCipher::new(KEY).unwrap();
        assert!(cipher.encrypt(b"12345", false).is_err());
        assert_eq!(cipher.encrypt_block(&[7u8; 16]).unwrap().len(), 16);
    }

    #[test]
    fn non_block_sized_ciphertext_fails_cleanly() {
        let cipher = TuyaCipher::new(KEY).unwrap();
        assert_eq!(cipher.decrypt(&[0xab; 13]), Err(TuyaError::DecryptionFailed));
        assert_eq!(cipher.decrypt(&[]), Err(TuyaError::DecryptionFailed));
    }

    #[test]
    fn wrong_key_cannot_open_v33_payload() {
        let payload = b"{\"gwId\":\"d\",\"devId\":\"d\"}";
        let sealer = VersionCodec::new(ProtocolVersion::V3_3, KEY).unwrap();
        let sealed = sealer.seal(CommandType::DpQuery, payload).unwrap();
        let opener = VersionCodec::new(ProtocolVersion::V3_3, b"another_key_16b!").unwrap();
        // Either invalid padding or unrelated bytes; never the plaintext.
        assert_ne!(opener.open(&sealed).ok().as_deref(), Some(payload.as_slice()));
    }

    #[test]
    fn v31_control_envelope_roundtrip() {
        let codec = VersionCodec::new(ProtocolVersion::V3_1, KEY).unwrap();
        let payload = b"{\"devId\":\"d\",\"dps\":{\"1\":true}}";
        let sealed = codec.seal(CommandType::Control, payload).unwrap();
        assert!(sealed.starts_with(b"3.1"));
        // 3-byte marker + 16 hex signature chars, then base64.
        assert!(sealed.len() > 19);
        assert_eq!(codec.open(&sealed).unwrap(), payload);
    }

    #[test]
    fn v31_queries_stay_plaintext() {
        let codec = VersionCodec::new(ProtocolVersion::V3_1, KEY).unwrap();
        let payload = b"{\"gwId\":\"d\",\"devId\":\"d\"}";
        assert_eq!(codec.seal(CommandType::DpQuery, payload).unwrap(), payload);
        assert_eq!(codec.open(payload).unwrap(), payload);
    }

    #[test]
    fn v33_control_carries_outer_header_query_does_not() {
        let codec = VersionCodec::new(ProtocolVersion::V3_3, KEY).unwrap();
        let payload = b"{\"dps\":{\"101\":5}}";

        let control = codec.seal(CommandType::Control, payload).unwrap();
        assert!(control.starts_with(b"3.3"));
        assert_eq!(codec.open(&control).unwrap(), payload);

        let query = codec.seal(CommandType::DpQuery, payload).unwrap();
        assert!(!query.starts_with(b"3.3"));
        assert_eq!(codec.open(&query).unwrap(), payload);
    }

    #[test]
    fn v33_plaintext_response_passes_through() {
        let codec = VersionCodec::new(ProtocolVersion::V3_3, KEY).unwrap();
        let payload = b"{\"dps\":{\"185\":true}}";
        assert_eq!(codec.open(payload).unwrap(), payload);
    }

    #[test]
    fn v34_header_sits_inside_the_ciphertext() {
        let codec = VersionCodec::new(ProtocolVersion::V3_4, KEY).unwrap();
        let payload = b"{\"protocol\":5,\"t\":1,\"data\":{}}";

        let sealed = codec.seal(CommandType::ControlNew, payload).unwrap();
        assert!(!sealed.starts_with(b"3.4"));
        assert!(sealed.len().is_multiple_of(16));
        assert_eq!(codec.open(&sealed).unwrap(), payload);
    }

    #[test]
    fn v34_payload_unreadable_without_session_key() {
        // Device side seals with the session key; a codec still holding the
        // local key (pre-handshake state) must fail, not return wrong data.
        let session = derive_session_key(KEY, &[0x11; 16], &[0x22; 16]).unwrap();
        let device = VersionCodec::new(ProtocolVersion::V3_4, &session).unwrap();
        let payload = b"{\"dps\":{\"185\":true}}";
        let sealed = device.seal(CommandType::Status, payload).unwrap();

        let pre_handshake = VersionCodec::new(ProtocolVersion::V3_4, KEY).unwrap();
        assert_ne!(
            pre_handshake.open(&sealed).ok().as_deref(),
            Some(payload.as_slice())
        );
    }

    #[test]
    fn session_key_derivation_is_deterministic_and_key_bound() {
        let local_nonce = [0xaa; 16];
        let remote_nonce = [0x55; 16];
        let a = derive_session_key(KEY, &local_nonce, &remote_nonce).unwrap();
        let b = derive_session_key(KEY, &local_nonce, &remote_nonce).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);

        let c = derive_session_key(b"another_key_16b!", &local_nonce, &remote_nonce).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn hmac_footer_key_only_for_v34() {
        assert!(VersionCodec::new(ProtocolVersion::V3_3, KEY).unwrap().hmac_key().is_none());
        assert_eq!(
            VersionCodec::new(ProtocolVersion::V3_4, KEY).unwrap().hmac_key(),
            Some(KEY.as_slice())
        );
    }
}
