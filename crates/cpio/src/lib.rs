//! CPIO "newc" archive parsing (read-only).
//!
//! The initial ramdisk is a `newc` archive (magic `070701`): a 110-byte
//! ASCII-hex header per entry, the NUL-terminated path name, and the file
//! body, each padded to a 4-byte boundary. Iteration is lazy; names and file
//! bodies are borrowed from the archive, so walking an initrd allocates
//! nothing.
//!
//! Iteration ends at the `TRAILER!!!` marker. As in the original tooling,
//! the marker is only recognized when the name length matches exactly, so a
//! hypothetical file named `TRAILER!!!` deeper in the archive would still end
//! the walk - callers relying on such names are out of luck.

#![no_std]

use core::{fmt, str};

const MAGIC: &[u8; 6] = b"070701";
const HDR_LEN: usize = 110;
const TRAILER: &str = "TRAILER!!!";

/// Errors produced while walking an archive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CpioError {
    /// The archive ended in the middle of a header or file body.
    UnexpectedEof,
    /// An entry did not start with the `newc` magic.
    BadMagic,
    /// A header field was not valid ASCII hex.
    BadHex,
    /// An entry name was not valid UTF-8 or not NUL-terminated.
    BadName,
}

impl fmt::Display for CpioError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CpioError::UnexpectedEof => "unexpected end of archive",
            CpioError::BadMagic => "bad cpio magic (expected 070701)",
            CpioError::BadHex => "invalid hex field in header",
            CpioError::BadName => "malformed entry name",
        };
        f.write_str(s)
    }
}

/// A parsed `newc` header.
///
/// Every field of the on-disk format is retained so that consumers can
/// faithfully reconstruct the header; the filesystem layer mostly cares
/// about `mode`, `filesize` and `namesize`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Header {
    /// Inode number.
    pub ino: u32,
    /// POSIX mode, including the file type bits.
    pub mode: u32,
    /// Owner user id.
    pub uid: u32,
    /// Owner group id.
    pub gid: u32,
    /// Number of hard links.
    pub nlink: u32,
    /// Modification time, seconds since the epoch.
    pub mtime: u32,
    /// File body length in bytes.
    pub filesize: u32,
    /// Device major number.
    pub devmajor: u32,
    /// Device minor number.
    pub devminor: u32,
    /// Device major number for special files.
    pub rdevmajor: u32,
    /// Device minor number for special files.
    pub rdevminor: u32,
    /// Length of the path name, including the trailing NUL.
    pub namesize: u32,
    /// Header checksum; always zero for `newc`.
    pub check: u32,
}

impl Header {
    fn parse(hdr: &[u8]) -> Result<Self, CpioError> {
        let field = |i: usize| parse_hex_u32(&hdr[6 + i * 8..6 + (i + 1) * 8]);

        Ok(Header {
            ino: field(0)?,
            mode: field(1)?,
            uid: field(2)?,
            gid: field(3)?,
            nlink: field(4)?,
            mtime: field(5)?,
            filesize: field(6)?,
            devmajor: field(7)?,
            devminor: field(8)?,
            rdevmajor: field(9)?,
            rdevminor: field(10)?,
            namesize: field(11)?,
            check: field(12)?,
        })
    }
}

/// One archive member: header, path name, and borrowed file body.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Entry<'a> {
    /// The parsed header.
    pub header: Header,
    /// Path name as stored in the archive.
    pub name: &'a str,
    /// File body (empty for directories and special entries).
    pub body: &'a [u8],
}

impl Entry<'_> {
    /// Returns whether this entry describes a directory.
    pub fn is_dir(&self) -> bool {
        self.header.mode & S_IFMT == S_IFDIR
    }

    /// Returns whether this entry describes a regular file.
    pub fn is_reg(&self) -> bool {
        self.header.mode & S_IFMT == S_IFREG
    }
}

/// File type mask within `mode`.
pub const S_IFMT: u32 = 0o170000;
/// Regular file.
pub const S_IFREG: u32 = 0o100000;
/// Directory.
pub const S_IFDIR: u32 = 0o040000;
/// Symbolic link.
pub const S_IFLNK: u32 = 0o120000;

fn parse_hex_u32(field: &[u8]) -> Result<u32, CpioError> {
    let s = str::from_utf8(field).map_err(|_| CpioError::BadHex)?;
    u32::from_str_radix(s, 16).map_err(|_| CpioError::BadHex)
}

fn take<'a>(buf: &'a [u8], off: &mut usize, n: usize) -> Result<&'a [u8], CpioError> {
    let start = *off;
    let end = start.checked_add(n).ok_or(CpioError::UnexpectedEof)?;
    if end > buf.len() {
        return Err(CpioError::UnexpectedEof);
    }
    *off = end;
    Ok(&buf[start..end])
}

fn align4(buf: &[u8], off: &mut usize) -> Result<(), CpioError> {
    let aligned = off.checked_add(3).ok_or(CpioError::UnexpectedEof)? & !3;
    if aligned > buf.len() {
        return Err(CpioError::UnexpectedEof);
    }
    *off = aligned;
    Ok(())
}

/// Lazy iterator over the members of a `newc` archive.
#[derive(Clone, Debug)]
pub struct Archive<'a> {
    buf: &'a [u8],
    off: usize,
    done: bool,
}

impl<'a> Archive<'a> {
    /// Creates an iterator over `buf`.
    pub fn new(buf: &'a [u8]) -> Self {
        Archive {
            buf,
            off: 0,
            done: false,
        }
    }

    /// Finds a member by exact path.
    pub fn find(&self, path: &str) -> Result<Option<Entry<'a>>, CpioError> {
        for ent in self.clone() {
            let ent = ent?;
            if ent.name == path {
                return Ok(Some(ent));
            }
        }
        Ok(None)
    }

    fn parse_next(&mut self) -> Result<Option<Entry<'a>>, CpioError> {
        let hdr = take(self.buf, &mut self.off, HDR_LEN)?;
        if &hdr[0..6] != MAGIC {
            return Err(CpioError::BadMagic);
        }

        let header = Header::parse(hdr)?;

        let name_bytes = take(self.buf, &mut self.off, header.namesize as usize)?;
        let name = match name_bytes.split_last() {
            Some((0, name)) => str::from_utf8(name).map_err(|_| CpioError::BadName)?,
            _ => return Err(CpioError::BadName),
        };
        align4(self.buf, &mut self.off)?;

        let body = take(self.buf, &mut self.off, header.filesize as usize)?;
        align4(self.buf, &mut self.off)?;

        // Mirrors the original scan: the end marker is matched together with
        // its exact name length.
        if header.namesize as usize == TRAILER.len() + 1 && name == TRAILER {
            self.done = true;
            return Ok(None);
        }

        Ok(Some(Entry { header, name, body }))
    }
}

impl<'a> Iterator for Archive<'a> {
    type Item = Result<Entry<'a>, CpioError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.off >= self.buf.len() {
            return None;
        }

        match self.parse_next() {
            Ok(Some(ent)) => Some(Ok(ent)),
            Ok(None) => None,
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use std::{format, string::String, vec::Vec};

    fn push_entry(out: &mut Vec<u8>, header: &Header, name: &str, body: &[u8]) {
        let h = header;
        out.extend_from_slice(
            format!(
                "070701{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}",
                h.ino, h.mode, h.uid, h.gid, h.nlink, h.mtime, h.filesize,
                h.devmajor, h.devminor, h.rdevmajor, h.rdevminor, h.namesize, h.check
            )
            .as_bytes(),
        );
        out.extend_from_slice(name.as_bytes());
        out.push(0);
        while out.len() % 4 != 0 {
            out.push(0);
        }
        out.extend_from_slice(body);
        while out.len() % 4 != 0 {
            out.push(0);
        }
    }

    fn file_header(name: &str, mode: u32, body: &[u8]) -> Header {
        Header {
            ino: 42,
            mode,
            nlink: 1,
            filesize: body.len() as u32,
            namesize: name.len() as u32 + 1,
            ..Header::default()
        }
    }

    fn build(files: &[(&str, u32, &[u8])]) -> Vec<u8> {
        let mut out = Vec::new();
        for (name, mode, body) in files {
            push_entry(&mut out, &file_header(name, *mode, body), name, body);
        }
        push_entry(&mut out, &file_header(TRAILER, 0, &[]), TRAILER, &[]);
        out
    }

    #[test]
    fn empty_input_yields_nothing() {
        assert!(Archive::new(&[]).next().is_none());
    }

    #[test]
    fn truncated_header_is_an_error() {
        assert_eq!(
            Archive::new(b"070701").next(),
            Some(Err(CpioError::UnexpectedEof))
        );
    }

    #[test]
    fn parses_files_and_stops_at_trailer() {
        let archive = build(&[
            ("bin", S_IFDIR | 0o755, b""),
            ("bin/init", S_IFREG | 0o755, b"\x13\x05\x00\x00\x73\x00\x00\x00"),
            ("etc/motd", S_IFREG | 0o644, b"hello grinch\n"),
        ]);

        let entries: Vec<_> = Archive::new(&archive).collect::<Result<_, _>>().unwrap();
        assert_eq!(entries.len(), 3);

        assert!(entries[0].is_dir());
        assert_eq!(entries[1].name, "bin/init");
        assert!(entries[1].is_reg());
        assert_eq!(entries[2].body, b"hello grinch\n");
    }

    #[test]
    fn header_roundtrip() {
        let hdr = Header {
            ino: 7,
            mode: S_IFREG | 0o600,
            uid: 1000,
            gid: 100,
            nlink: 2,
            mtime: 0x5f00_0000,
            filesize: 5,
            devmajor: 8,
            devminor: 1,
            rdevmajor: 0,
            rdevminor: 0,
            namesize: 4,
            check: 0,
        };

        let mut raw = Vec::new();
        push_entry(&mut raw, &hdr, "abc", b"12345");

        let ent = Archive::new(&raw).next().unwrap().unwrap();
        assert_eq!(ent.header, hdr);
        assert_eq!(ent.name, "abc");
        assert_eq!(ent.body, b"12345");
    }

    #[test]
    fn find_by_exact_path() {
        let archive = build(&[
            ("bin/true", S_IFREG | 0o755, b"t"),
            ("bin/false", S_IFREG | 0o755, b"f"),
        ]);
        let ar = Archive::new(&archive);

        assert_eq!(ar.find("bin/false").unwrap().unwrap().body, b"f");
        assert!(ar.find("bin/maybe").unwrap().is_none());
    }

    #[test]
    fn trailer_needs_exact_name_length() {
        // A name that merely starts with the marker must not end iteration.
        let long = String::from(TRAILER) + ".txt";
        let archive = build(&[(&long, S_IFREG | 0o644, b"x"), ("after", S_IFREG | 0o644, b"y")]);

        let entries: Vec<_> = Archive::new(&archive).collect::<Result<_, _>>().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].name, "after");
    }
}
