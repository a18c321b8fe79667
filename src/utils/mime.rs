//! MIME sniffing: header-based tabular hints and magic-number detection.

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Content-type prefixes that look like plain tabular text.
const TABULAR_PREFIXES: &[&str] = &["application/csv", "text/plain", "text/csv"];

/// Content-type prefixes that may hide a gzipped tabular payload.
const BINARY_TABULAR_PREFIXES: &[&str] = &["application/octet-stream", "application/x-gzip"];

/// Tabular hints inferred from response headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TabularHint {
    /// Content-type looks like delimited text.
    pub tabular: bool,
    /// Content-type looks like a (possibly gzipped) binary carrier.
    pub binary: bool,
}

impl TabularHint {
    /// The payload is worth feeding to the CSV pipeline when either
    /// component is set.
    pub fn is_tabular(&self) -> bool {
        self.tabular || self.binary
    }
}

/// Inspect the `content-type` header (keys already lowercased) for
/// tabular-looking prefixes.
pub fn detect_tabular_from_headers(headers: &HashMap<String, String>) -> TabularHint {
    let content_type = headers
        .get("content-type")
        .map(|v| v.to_lowercase())
        .unwrap_or_default();
    TabularHint {
        tabular: TABULAR_PREFIXES
            .iter()
            .any(|prefix| content_type.starts_with(prefix)),
        binary: BINARY_TABULAR_PREFIXES
            .iter()
            .any(|prefix| content_type.starts_with(prefix)),
    }
}

/// Format key used to pick a download size cap.
pub fn format_for_cap(hint: TabularHint) -> &'static str {
    if hint.is_tabular() {
        "csv"
    } else {
        crate::config::DEFAULT_FORMAT
    }
}

/// MIME type of a downloaded file from magic numbers, falling back to a
/// text/binary split for formats `infer` does not know (plain CSV has no
/// magic bytes).
pub fn sniff_mime_from_file(path: &Path) -> std::io::Result<String> {
    if let Some(kind) = infer::get_from_path(path)? {
        return Ok(kind.mime_type().to_string());
    }
    let mut head = [0u8; 8192];
    let n = File::open(path)?.read(&mut head)?;
    if std::str::from_utf8(&head[..n]).is_ok() {
        Ok("text/plain".to_string())
    } else {
        Ok("application/octet-stream".to_string())
    }
}
