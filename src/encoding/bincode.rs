//! Bincode is used to encode values, both in key/value stores, snapshots, and
//! the Agency network protocol. It is a Rust-specific encoding that depends on
//! the internal data structures being stable. See:
//! https://github.com/bincode-org/bincode
//!
//! This module wraps the bincode crate to always use DefaultOptions, i.e.
//! variable-length integers, which keeps log entries and Raft messages small.
//! Upstream bincode::(de)serialize confusingly uses fixed-length options.

use crate::error::{Error, Result};

use bincode::Options;

/// Returns the default Bincode options, initialized on first use.
fn bincode() -> &'static bincode::DefaultOptions {
    static BINCODE: std::sync::OnceLock<bincode::DefaultOptions> = std::sync::OnceLock::new();
    BINCODE.get_or_init(bincode::DefaultOptions::new)
}

/// Deserializes a value using Bincode.
pub fn deserialize<'de, T: serde::Deserialize<'de>>(bytes: &'de [u8]) -> Result<T> {
    Ok(bincode().deserialize(bytes)?)
}

/// Deserializes a value from a reader using Bincode.
pub fn deserialize_from<R: std::io::Read, T: serde::de::DeserializeOwned>(reader: R) -> Result<T> {
    Ok(bincode().deserialize_from(reader)?)
}

/// Deserializes a value from a reader using Bincode, or returns None if the
/// reader is closed.
pub fn maybe_deserialize_from<R: std::io::Read, T: serde::de::DeserializeOwned>(
    reader: R,
) -> Result<Option<T>> {
    match bincode().deserialize_from(reader) {
        Ok(v) => Ok(Some(v)),
        Err(e) => match *e {
            bincode::ErrorKind::Io(e) => match e.kind() {
                std::io::ErrorKind::UnexpectedEof => Ok(None),
                std::io::ErrorKind::ConnectionReset => Ok(None),
                _ => Err(Error::from(e)),
            },
            e => Err(Error::from(Box::new(e))),
        },
    }
}

/// Serializes a value using Bincode.
pub fn serialize<T: serde::Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode().serialize(value)?)
}

/// Serializes a value to a writer using Bincode.
pub fn serialize_into<W: std::io::Write, T: serde::Serialize + ?Sized>(
    writer: W,
    value: &T,
) -> Result<()> {
    Ok(bincode().serialize_into(writer, value)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varint() -> Result<()> {
        // Small integers take a single byte with DefaultOptions.
        assert_eq!(serialize(&7u64)?, vec![7]);
        assert_eq!(deserialize::<u64>(&[7])?, 7);
        Ok(())
    }

    #[test]
    fn maybe_deserialize_from_eof() -> Result<()> {
        let empty: &[u8] = &[];
        assert_eq!(maybe_deserialize_from::<_, u64>(empty)?, None);

        let bytes = serialize(&(1u8, "foo".to_string()))?;
        assert_eq!(
            maybe_deserialize_from::<_, (u8, String)>(bytes.as_slice())?,
            Some((1, "foo".to_string()))
        );
        Ok(())
    }
}
