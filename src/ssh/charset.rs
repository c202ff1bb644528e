//! Remote charset conversion
//!
//! Servers configured with `ssh_charset` send file names in that encoding.
//! Conversion goes through `encoding_rs`; without a charset (or with an
//! unknown label) bytes are taken as UTF-8.

use std::borrow::Cow;

use encoding_rs::{Encoding, UTF_8};
use tracing::warn;

/// Encoding of the remote side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteCharset {
    encoding: &'static Encoding,
}

impl Default for RemoteCharset {
    fn default() -> Self {
        Self { encoding: UTF_8 }
    }
}

impl RemoteCharset {
    /// Look up `label` (e.g. `ISO-8859-1`, `cp1252`, `Shift_JIS`).
    pub fn from_label(label: Option<&str>) -> Self {
        let Some(label) = label.map(str::trim).filter(|l| !l.is_empty()) else {
            return Self::default();
        };
        match Encoding::for_label(label.as_bytes()) {
            Some(encoding) => Self { encoding },
            None => {
                warn!("Unknown SSH charset {:?}, using UTF-8", label);
                Self::default()
            }
        }
    }

    pub fn name(&self) -> &'static str {
        self.encoding.name()
    }

    pub fn is_utf8(&self) -> bool {
        self.encoding == UTF_8
    }

    /// Remote bytes to UTF-8.
    pub fn decode<'a>(&self, remote: &'a [u8]) -> Cow<'a, str> {
        let (text, _, had_errors) = self.encoding.decode(remote);
        if had_errors {
            warn!("Invalid {} sequence in remote text", self.name());
        }
        text
    }

    /// UTF-8 to remote bytes.
    pub fn encode<'a>(&self, local: &'a str) -> Cow<'a, [u8]> {
        if self.is_utf8() {
            return Cow::Borrowed(local.as_bytes());
        }
        let (bytes, _, _) = self.encoding.encode(local);
        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latin1_names() {
        let charset = RemoteCharset::from_label(Some("ISO-8859-1"));
        assert!(!charset.is_utf8());
        // "café" in latin-1 (windows-1252 superset)
        assert_eq!(charset.decode(&[0x63, 0x61, 0x66, 0xE9]), "café");
        assert_eq!(charset.encode("café").as_ref(), &[0x63, 0x61, 0x66, 0xE9]);
    }

    #[test]
    fn test_default_is_utf8() {
        assert!(RemoteCharset::from_label(None).is_utf8());
        assert!(RemoteCharset::from_label(Some("  ")).is_utf8());
        assert!(RemoteCharset::from_label(Some("no-such-charset")).is_utf8());
        assert_eq!(RemoteCharset::default().decode("ü".as_bytes()), "ü");
    }
}
