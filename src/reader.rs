//! Random access byte sources and the magic check performed before parsing

use crate::{
    elf_parser::consts::ELFMAG,
    error::{Error, FormatError},
};
use std::{
    fs::File,
    io::{self, Read, Seek, SeekFrom},
    path::Path,
};

/// A byte source that can be read at arbitrary offsets
pub trait ByteSource {
    /// Total number of bytes available
    fn size(&mut self) -> io::Result<u64>;

    /// Fills `buf` with the bytes starting at `offset`.
    ///
    /// Fails with [io::ErrorKind::UnexpectedEof] on a short read.
    fn read_exact_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()>;
}

impl<T: Read + Seek> ByteSource for T {
    fn size(&mut self) -> io::Result<u64> {
        let position = self.stream_position()?;
        let end = self.seek(SeekFrom::End(0))?;
        self.seek(SeekFrom::Start(position))?;
        Ok(end)
    }

    fn read_exact_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        self.seek(SeekFrom::Start(offset))?;
        self.read_exact(buf)
    }
}

/// Opens `path` for parsing.
///
/// The returned handle is closed when dropped, which happens on every exit
/// path of the caller.
pub fn open(path: &Path) -> Result<File, Error> {
    File::open(path).map_err(Error::io(format!("failed to open {}", path.display())))
}

/// Checks that the source starts with the ELF magic and rewinds it.
///
/// Sources shorter than the magic are rejected the same way as a wrong magic.
pub fn check_magic<S: Read + Seek>(source: &mut S) -> Result<(), Error> {
    source
        .seek(SeekFrom::Start(0))
        .map_err(Error::io("failed to seek ELF source"))?;
    let mut prefix = [0u8; ELFMAG.len()];
    let mut filled = 0;
    while filled < prefix.len() {
        let read = source
            .read(&mut prefix[filled..])
            .map_err(Error::io("failed to read ELF magic"))?;
        if read == 0 {
            return Err(FormatError::BadMagic.into());
        }
        filled = filled.saturating_add(read);
    }
    if prefix != ELFMAG {
        return Err(FormatError::BadMagic.into());
    }
    source
        .seek(SeekFrom::Start(0))
        .map_err(Error::io("failed to rewind ELF source"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_magic() {
        let mut source = Cursor::new(b"\x7fELF\x02\x01".to_vec());
        source.seek(SeekFrom::Start(3)).unwrap();
        check_magic(&mut source).unwrap();
        assert_eq!(source.stream_position().unwrap(), 0);

        for bytes in [&b""[..], &b"\x7fEL"[..], &b"\x7fELG"[..], &b"MZ\x90\x00"[..]] {
            let err = check_magic(&mut Cursor::new(bytes)).unwrap_err();
            assert!(matches!(err, Error::Format(FormatError::BadMagic)));
        }
    }

    #[test]
    fn test_read_exact_at() {
        let mut source = Cursor::new((0u8..32).collect::<Vec<_>>());
        assert_eq!(source.size().unwrap(), 32);
        let mut buf = [0u8; 4];
        source.read_exact_at(8, &mut buf).unwrap();
        assert_eq!(buf, [8, 9, 10, 11]);
        let err = source.read_exact_at(30, &mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
