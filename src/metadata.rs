#![forbid(unsafe_code)]

use crate::encoding::PathEncoding;
use crate::wire::{
    DataReader, SSH_FILEXFER_ATTR_ACMODTIME, SSH_FILEXFER_ATTR_EXTENDED,
    SSH_FILEXFER_ATTR_PERMISSIONS, SSH_FILEXFER_ATTR_SIZE, SSH_FILEXFER_ATTR_UIDGID,
};
use crate::Error;

/// File attributes as carried by `SSH_FXP_ATTRS` and embedded in
/// `SSH_FXP_NAME` entries.
///
/// Fields a server chose not to send keep their defaults; in
/// particular `permissions` defaults to `0o666`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileAttrs {
    pub size: u64,
    pub uid: u32,
    pub gid: u32,
    pub permissions: u32,
    pub atime: u32,
    pub mtime: u32,
}

impl Default for FileAttrs {
    fn default() -> Self {
        Self {
            size: 0,
            uid: 0,
            gid: 0,
            permissions: 0o666,
            atime: 0,
            mtime: 0,
        }
    }
}

impl FileAttrs {
    /// Parses the flag-prefixed attribute block, skipping extended
    /// attribute pairs.
    pub(crate) fn parse(reader: &mut DataReader) -> Result<Self, Error> {
        let flags = reader.uint32()?;
        let mut attrs = FileAttrs::default();
        if flags & SSH_FILEXFER_ATTR_SIZE != 0 {
            attrs.size = reader.uint64()?;
        }
        if flags & SSH_FILEXFER_ATTR_UIDGID != 0 {
            attrs.uid = reader.uint32()?;
            attrs.gid = reader.uint32()?;
        }
        if flags & SSH_FILEXFER_ATTR_PERMISSIONS != 0 {
            attrs.permissions = reader.uint32()?;
        }
        if flags & SSH_FILEXFER_ATTR_ACMODTIME != 0 {
            attrs.atime = reader.uint32()?;
            attrs.mtime = reader.uint32()?;
        }
        if flags & SSH_FILEXFER_ATTR_EXTENDED != 0 {
            let count = reader.uint32()?;
            for _ in 0..count {
                reader.string()?;
                reader.string()?;
            }
        }
        Ok(attrs)
    }

    /// Whether the permission bits mark a directory.
    pub fn is_dir(&self) -> bool {
        self.permissions & 0o170000 == 0o040000
    }
}

/// One entry of an `SSH_FXP_NAME` response.
#[derive(Debug, Clone)]
pub struct DirEntry {
    /// Bare file name, decoded with the client's path encoding.
    pub file_name: String,
    /// `ls -l` style line the server formatted for display.
    pub long_name: String,
    pub attrs: FileAttrs,
}

impl DirEntry {
    pub(crate) fn parse(reader: &mut DataReader, encoding: PathEncoding) -> Result<Self, Error> {
        let file_name = encoding.decode(&reader.string()?);
        let long_name = encoding.decode(&reader.string()?);
        let attrs = FileAttrs::parse(reader)?;
        Ok(Self {
            file_name,
            long_name,
            attrs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{BufMut, BytesMut};
    use pretty_assertions::assert_eq;

    fn reader(build: impl FnOnce(&mut BytesMut)) -> DataReader {
        let mut buf = BytesMut::new();
        build(&mut buf);
        DataReader::new(buf.freeze())
    }

    #[test]
    fn empty_flags_yield_defaults() {
        let mut r = reader(|b| b.put_u32(0));
        let attrs = FileAttrs::parse(&mut r).unwrap();
        assert_eq!(attrs, FileAttrs::default());
        assert_eq!(attrs.permissions, 0o666);
    }

    #[test]
    fn all_scalar_fields_parse_in_order() {
        let mut r = reader(|b| {
            b.put_u32(
                SSH_FILEXFER_ATTR_SIZE
                    | SSH_FILEXFER_ATTR_UIDGID
                    | SSH_FILEXFER_ATTR_PERMISSIONS
                    | SSH_FILEXFER_ATTR_ACMODTIME,
            );
            b.put_u64(4096);
            b.put_u32(1000);
            b.put_u32(1001);
            b.put_u32(0o100644);
            b.put_u32(1_700_000_000);
            b.put_u32(1_700_000_001);
        });
        let attrs = FileAttrs::parse(&mut r).unwrap();
        assert_eq!(attrs.size, 4096);
        assert_eq!(attrs.uid, 1000);
        assert_eq!(attrs.gid, 1001);
        assert_eq!(attrs.permissions, 0o100644);
        assert_eq!(attrs.atime, 1_700_000_000);
        assert_eq!(attrs.mtime, 1_700_000_001);
        assert!(!attrs.is_dir());
    }

    #[test]
    fn extended_pairs_are_skipped() {
        let mut r = reader(|b| {
            b.put_u32(SSH_FILEXFER_ATTR_SIZE | SSH_FILEXFER_ATTR_EXTENDED);
            b.put_u64(10);
            b.put_u32(2);
            for pair in [("a", "1"), ("bb", "22")] {
                b.put_u32(pair.0.len() as u32);
                b.put_slice(pair.0.as_bytes());
                b.put_u32(pair.1.len() as u32);
                b.put_slice(pair.1.as_bytes());
            }
            // Trailing data after the attrs block must be untouched.
            b.put_u32(0xdead_beef);
        });
        let attrs = FileAttrs::parse(&mut r).unwrap();
        assert_eq!(attrs.size, 10);
        assert_eq!(r.uint32().unwrap(), 0xdead_beef);
    }

    #[test]
    fn dir_entry_parses_names_and_attrs() {
        let mut r = reader(|b| {
            b.put_u32(4);
            b.put_slice(b"work");
            b.put_u32(9);
            b.put_slice(b"drwx work");
            b.put_u32(SSH_FILEXFER_ATTR_PERMISSIONS);
            b.put_u32(0o040755);
        });
        let entry = DirEntry::parse(&mut r, PathEncoding::UTF8).unwrap();
        assert_eq!(entry.file_name, "work");
        assert_eq!(entry.long_name, "drwx work");
        assert!(entry.attrs.is_dir());
    }
}
