//! C2: the replay container decoder.
//!
//! A `.wowsreplay` file is a signature, a JSON arena-info header, a handful of opaque
//! "extras" blobs, and a Blowfish-ECB-encrypted, XOR-chained, zlib-compressed packet
//! stream. This module turns the raw file bytes into the decompressed packet stream plus
//! the parsed arena-info header.

use crypto::blowfish::Blowfish;
use crypto::symmetriccipher::BlockDecryptor;
use flate2::read::ZlibDecoder;
use serde_json::Value as JsonValue;
use std::io::Read;
use tracing::debug;

use crate::error::ReplayError;

const FILE_SIGNATURE: [u8; 4] = [0x12, 0x32, 0x34, 0x11];
const BLOWFISH_KEY: [u8; 16] = [
    0x29, 0xB7, 0xC9, 0x09, 0x38, 0x3F, 0x84, 0x88, 0xFA, 0x98, 0xEC, 0x4E, 0x13, 0x19, 0x79, 0xFB,
];
const BLOCK_SIZE: usize = 8;

/// The decoded container: the arena-info JSON header, the opaque extras blobs, and the
/// fully decompressed packet stream ready for [`crate::packet`] to tokenize.
#[derive(Debug)]
pub struct Container {
    pub arena_info: JsonValue,
    pub extras: Vec<Vec<u8>>,
    pub packet_stream: Vec<u8>,
}

fn read_exact(cursor: &mut &[u8], n: usize) -> Result<Vec<u8>, ReplayError> {
    if cursor.len() < n {
        return Err(ReplayError::Parse(format!(
            "container: needed {} bytes, {} remaining",
            n,
            cursor.len()
        )));
    }
    let (head, tail) = cursor.split_at(n);
    *cursor = tail;
    Ok(head.to_vec())
}

fn read_i32(cursor: &mut &[u8]) -> Result<i32, ReplayError> {
    let bytes = read_exact(cursor, 4)?;
    Ok(i32::from_le_bytes(bytes.try_into().unwrap()))
}

/// Decrypts `encrypted` (Blowfish-ECB per 8-byte block, each decrypted block XORed
/// against the previous block's *decrypted* value, i.e. decrypt-then-chain rather than
/// standard CBC's chain-then-decrypt).
fn decrypt_blowfish_chained(key: &[u8; 16], encrypted: &[u8]) -> Result<Vec<u8>, ReplayError> {
    if encrypted.len() % BLOCK_SIZE != 0 {
        return Err(ReplayError::TruncatedCipher(encrypted.len()));
    }

    let cipher = Blowfish::new(key);
    let mut out = Vec::with_capacity(encrypted.len());
    let mut previous: Option<u64> = None;

    for chunk in encrypted.chunks(BLOCK_SIZE) {
        let mut decrypted = [0u8; BLOCK_SIZE];
        cipher.decrypt_block(chunk, &mut decrypted);
        let mut value = u64::from_le_bytes(decrypted);
        if let Some(prev) = previous {
            value ^= prev;
        }
        previous = Some(value);
        out.extend_from_slice(&value.to_le_bytes());
    }

    Ok(out)
}

/// Parses the full container: signature check, arena-info + extras, Blowfish decrypt,
/// zlib inflate. `data` is the entire file contents.
pub fn decode(data: &[u8]) -> Result<Container, ReplayError> {
    let mut cursor = data;

    let signature = read_exact(&mut cursor, 4)?;
    if signature != FILE_SIGNATURE {
        return Err(ReplayError::InvalidSignature);
    }

    let count = read_i32(&mut cursor)?;
    if count < 1 {
        return Err(ReplayError::Parse(format!(
            "container declared {} blocks, expected at least 1",
            count
        )));
    }
    let block_size = read_i32(&mut cursor)? as usize;

    let arena_info_bytes = read_exact(&mut cursor, block_size)?;
    let arena_info: JsonValue = serde_json::from_slice(&arena_info_bytes)?;

    let mut extras = Vec::with_capacity((count - 1) as usize);
    for _ in 0..(count - 1) {
        let len = read_i32(&mut cursor)? as usize;
        extras.push(read_exact(&mut cursor, len)?);
    }

    let raw_size = read_i32(&mut cursor)? as usize;
    let compressed_size = read_i32(&mut cursor)? as usize;

    debug!(
        block_count = count,
        raw_size, compressed_size, "decoded container header"
    );

    let compressed = decrypt_blowfish_chained(&BLOWFISH_KEY, cursor)?;
    if compressed.len() < compressed_size {
        return Err(ReplayError::SizeMismatch {
            expected: compressed_size,
            actual: compressed.len(),
        });
    }
    let compressed = &compressed[..compressed_size];

    let mut decoder = ZlibDecoder::new(compressed);
    let mut packet_stream = Vec::with_capacity(raw_size);
    decoder.read_to_end(&mut packet_stream)?;

    if packet_stream.len() != raw_size {
        return Err(ReplayError::SizeMismatch {
            expected: raw_size,
            actual: packet_stream.len(),
        });
    }

    Ok(Container {
        arena_info,
        extras,
        packet_stream,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crypto::symmetriccipher::BlockEncryptor;

    fn build_container(payload: &[u8], arena_info: &str, extras: &[&[u8]]) -> Vec<u8> {
        use flate2::write::ZlibEncoder;
        use flate2::Compression;
        use std::io::Write;

        let mut compressed = Vec::new();
        {
            let mut encoder = ZlibEncoder::new(&mut compressed, Compression::default());
            encoder.write_all(payload).unwrap();
        }

        let cipher = Blowfish::new(&BLOWFISH_KEY);
        let mut padded = compressed.clone();
        while padded.len() % BLOCK_SIZE != 0 {
            padded.push(0);
        }

        let mut encrypted = Vec::with_capacity(padded.len());
        let mut previous: Option<u64> = None;
        for chunk in padded.chunks(BLOCK_SIZE) {
            let mut plain = u64::from_le_bytes(chunk.try_into().unwrap());
            if let Some(prev) = previous {
                plain ^= prev;
            }
            previous = Some(plain);
            let mut block = [0u8; BLOCK_SIZE];
            cipher.encrypt_block(&plain.to_le_bytes(), &mut block);
            encrypted.extend_from_slice(&block);
        }

        let mut out = Vec::new();
        out.extend_from_slice(&FILE_SIGNATURE);
        out.extend_from_slice(&(1 + extras.len() as i32).to_le_bytes());
        out.extend_from_slice(&(arena_info.len() as i32).to_le_bytes());
        out.extend_from_slice(arena_info.as_bytes());
        for extra in extras {
            out.extend_from_slice(&(extra.len() as i32).to_le_bytes());
            out.extend_from_slice(extra);
        }
        out.extend_from_slice(&(payload.len() as i32).to_le_bytes());
        out.extend_from_slice(&(compressed.len() as i32).to_le_bytes());
        out.extend_from_slice(&encrypted);
        out
    }

    #[test]
    fn rejects_bad_signature() {
        let data = vec![0u8, 1, 2, 3, 4, 5, 6, 7];
        let err = decode(&data).unwrap_err();
        assert!(matches!(err, ReplayError::InvalidSignature));
    }

    #[test]
    fn round_trips_minimal_container() {
        let payload = b"hello packet stream";
        let data = build_container(payload, r#"{"clientVersionFromXml":"12,6,0"}"#, &[]);
        let container = decode(&data).unwrap();
        assert_eq!(container.packet_stream, payload);
        assert_eq!(
            container.arena_info["clientVersionFromXml"],
            "12,6,0"
        );
        assert!(container.extras.is_empty());
    }

    #[test]
    fn round_trips_with_extras() {
        let payload = b"packet bytes here";
        let data = build_container(
            payload,
            r#"{"clientVersionFromXml":"12,6,0"}"#,
            &[b"extra-one", b"extra-two-longer"],
        );
        let container = decode(&data).unwrap();
        assert_eq!(container.extras.len(), 2);
        assert_eq!(container.extras[0], b"extra-one");
        assert_eq!(container.packet_stream, payload);
    }
}
