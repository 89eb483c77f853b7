//! Stable SHA-256 digests for files and strings.
//!
//! All digests are rendered as lowercase hex. These feed the Merkle job
//! hash, so the exact encoding is part of the on-disk format.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Files are hashed in 64 KiB chunks to bound memory on large inputs.
const CHUNK_SIZE: usize = 64 * 1024;

/// Hash a file's contents.
pub fn hash_file(path: &Path) -> Result<String> {
    let mut file = File::open(path).map_err(|e| Error::io_path("opening", path, e))?;
    let mut hasher = Sha256::new();
    let mut chunk = vec![0u8; CHUNK_SIZE];

    loop {
        let read = file
            .read(&mut chunk)
            .map_err(|e| Error::io_path("reading", path, e))?;
        if read == 0 {
            break;
        }
        hasher.update(&chunk[..read]);
    }

    Ok(to_hex(&hasher.finalize()))
}

/// Hash a string's UTF-8 encoding.
pub fn hash_str(value: &str) -> String {
    to_hex(&Sha256::digest(value.as_bytes()))
}

fn to_hex(digest: &[u8]) -> String {
    use std::fmt::Write;

    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest {
        write!(hex, "{byte:02x}").expect("writing to a String cannot fail");
    }
    hex
}
