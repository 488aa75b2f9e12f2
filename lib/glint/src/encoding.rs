use std::fmt;

#[derive(Debug, Eq, PartialEq)]
pub enum DecodeError {
    /// The input is not valid for the expected alphabet.
    Alphabet,
    /// The embedded checksum does not match the payload.
    Checksum,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DecodeError::Alphabet => write!(f, "invalid character in encoded input"),
            DecodeError::Checksum => write!(f, "checksum mismatch"),
        }
    }
}

/// Hex-encodes the supplied bytes (lowercase).
#[inline]
pub fn to_hex(data: &[u8]) -> String {
    hex::encode(data)
}

/// Decodes a hex string into bytes.
#[inline]
pub fn from_hex(text: &str) -> Result<Vec<u8>, DecodeError> {
    hex::decode(text).map_err(|_| DecodeError::Alphabet)
}

/// Renders bytes as a base58 string with an embedded checksum. Used for
/// identities, which are copied around by humans.
#[inline]
pub fn to_base58check(data: &[u8]) -> String {
    bs58::encode(data).with_check().into_string()
}

/// Decodes a base58-check string, verifying the checksum.
pub fn from_base58check(text: &str) -> Result<Vec<u8>, DecodeError> {
    bs58::decode(text)
        .with_check(None)
        .into_vec()
        .map_err(|err| match err {
            bs58::decode::Error::InvalidChecksum { .. } => DecodeError::Checksum,
            _ => DecodeError::Alphabet,
        })
}
