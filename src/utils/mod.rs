//! Shared helpers: hashing, URI validation, MIME sniffing.

pub mod mime;

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use sha2::{Digest, Sha256};

/// SHA-256 of a file's contents, streamed, as lowercase hex.
pub fn compute_checksum_from_file(path: &Path) -> std::io::Result<String> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Mirror-table name for a resource URL: md5 hex digest, 32 chars.
pub fn parsing_table_name(url: &str) -> String {
    format!("{:x}", md5::compute(url.as_bytes()))
}

/// Accept only absolute http(s) URIs with a host.
pub fn is_valid_uri(raw: &str) -> bool {
    match url::Url::parse(raw) {
        Ok(parsed) => {
            matches!(parsed.scheme(), "http" | "https") && parsed.host_str().is_some()
        }
        Err(_) => false,
    }
}
