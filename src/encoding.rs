#![forbid(unsafe_code)]

use encoding_rs::{Encoding, UTF_8};

/// Character encoding used for remote paths and file names.
///
/// SFTP version 3 predates the protocol's UTF-8 mandate, so servers
/// ship names in whatever encoding the remote filesystem uses. The
/// default is UTF-8; anything else can be selected by WHATWG label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathEncoding(&'static Encoding);

impl PathEncoding {
    pub const UTF8: PathEncoding = PathEncoding(UTF_8);

    /// Looks up an encoding by WHATWG label, e.g. `"shift_jis"`.
    pub fn for_label(label: &str) -> Option<Self> {
        Encoding::for_label(label.as_bytes()).map(PathEncoding)
    }

    /// Encodes a path for the wire. Characters the encoding cannot
    /// represent become numeric character references, matching
    /// `encoding_rs` behavior.
    pub fn encode(&self, path: &str) -> Vec<u8> {
        let (bytes, _, _) = self.0.encode(path);
        bytes.into_owned()
    }

    /// Decodes a remote name, substituting replacement characters
    /// for malformed sequences rather than failing.
    pub fn decode(&self, raw: &[u8]) -> String {
        let (text, _, _) = self.0.decode(raw);
        text.into_owned()
    }
}

impl Default for PathEncoding {
    fn default() -> Self {
        Self::UTF8
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn utf8_round_trip() {
        let enc = PathEncoding::default();
        let path = "dir/ファイル.txt";
        assert_eq!(enc.decode(&enc.encode(path)), path);
    }

    #[test]
    fn malformed_input_decodes_with_replacement() {
        let enc = PathEncoding::UTF8;
        assert_eq!(enc.decode(&[b'a', 0xff, b'b']), "a\u{fffd}b");
    }

    #[test]
    fn label_lookup() {
        let sjis = PathEncoding::for_label("shift_jis").unwrap();
        assert_eq!(sjis.decode(&[0x83, 0x65, 0x83, 0x58, 0x83, 0x67]), "テスト");
        assert!(PathEncoding::for_label("no-such-encoding").is_none());
    }
}
