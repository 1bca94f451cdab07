use std::io::{self, BufReader, Chain, Cursor, Read};
use std::path::Path;

use bzip2::bufread::BzDecoder;
use flate2::bufread::GzDecoder;
use lz4_flex::frame::FrameDecoder as Lz4Decoder;
use thiserror::Error;
use xz2::bufread::XzDecoder;
use zstd::stream::read::Decoder as ZstdDecoder;

use crate::value::{Value, ValueError};

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("I/O error")]
    Io(#[from] io::Error),

    #[error("malformed member contents")]
    Decode(#[from] ValueError),

    #[error("member '{0}' not found in archive")]
    NotFound(String),
}

/// The wrapper codec an artifact may be compressed with, autodetected from
/// its first bytes before a `tar::Archive` is built over it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Codec {
    Gzip,
    Bzip2,
    Xz,
    Lz4,
    Zstd,
    None,
}

const GZIP_MAGIC: &[u8] = &[0x1F, 0x8B];
const BZIP2_MAGIC: &[u8] = b"BZh";
const XZ_MAGIC: &[u8] = &[0xFD, 0x37, 0x7A, 0x58, 0x5A, 0x00];
const ZSTD_MAGIC: &[u8] = &[0x28, 0xB5, 0x2F, 0xFD];
const LZ4_MAGIC: &[u8] = &[0x04, 0x22, 0x4D, 0x18];

fn detect_codec(head: &[u8]) -> Codec {
    if head.starts_with(GZIP_MAGIC) {
        Codec::Gzip
    } else if head.starts_with(BZIP2_MAGIC) {
        Codec::Bzip2
    } else if head.starts_with(XZ_MAGIC) {
        Codec::Xz
    } else if head.starts_with(ZSTD_MAGIC) {
        Codec::Zstd
    } else if head.starts_with(LZ4_MAGIC) {
        Codec::Lz4
    } else {
        Codec::None
    }
}

type Peeked<R> = Chain<Cursor<Vec<u8>>, R>;

/// Reads enough bytes to identify the codec without losing them, returning a
/// reader that replays them before the rest of the stream.
fn peek_head<R: Read>(mut reader: R) -> io::Result<(Codec, Peeked<R>)> {
    let mut head = [0u8; 6];
    let n = read_fill(&mut reader, &mut head)?;
    let head = &head[..n];
    let codec = detect_codec(head);
    let chained = Cursor::new(head.to_vec()).chain(reader);
    Ok((codec, chained))
}

fn read_fill<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

/// Builds a decoding reader for the autodetected codec wrapping a tar
/// stream, matching the teacher's pattern of wrapping a single compression
/// reader around `tar::Archive` (there it was always gzip; here the wrapper
/// is chosen per the first bytes).
fn decoder_for<R: Read + 'static>(reader: R) -> io::Result<Box<dyn Read>> {
    let buffered = BufReader::new(reader);
    let (codec, chained) = peek_head(buffered)?;
    let chained = BufReader::new(chained);
    Ok(match codec {
        Codec::Gzip => Box::new(GzDecoder::new(chained)),
        Codec::Bzip2 => Box::new(BzDecoder::new(chained)),
        Codec::Xz => Box::new(XzDecoder::new(chained)),
        Codec::Zstd => Box::new(ZstdDecoder::with_buffer(chained)?),
        Codec::Lz4 => Box::new(Lz4Decoder::new(chained)),
        Codec::None => Box::new(chained),
    })
}

/// Sequential entry reader plus random-member plist fetcher for a package
/// artifact. Compression is autodetected; payload bytes are handed to the
/// caller as a bounded `Read`.
pub struct Archive;

impl Archive {
    /// Opens the stream at `path`, scans entries until `member` is found,
    /// and internalizes its contents as a [`Value`]. The member is expected
    /// to be `/props.plist` or `/files.plist` per the binary package file
    /// layout; the stream is abandoned (closed early) once found.
    pub fn fetch_plist(path: &Path, member: &str) -> Result<Value, ArchiveError> {
        let file = std::fs::File::open(path)?;
        let decoder = decoder_for(file)?;
        let mut tar = tar::Archive::new(decoder);

        for entry in tar.entries()? {
            let mut entry = entry?;
            let entry_path = entry.path()?.to_string_lossy().into_owned();
            let normalized = entry_path.trim_start_matches("./");
            let wanted = member.trim_start_matches('/');
            if normalized == wanted {
                let mut buf = String::new();
                entry.read_to_string(&mut buf)?;
                return Ok(Value::internalize(&buf)?);
            }
        }
        Err(ArchiveError::NotFound(member.to_string()))
    }

    /// Returns a sequential iterator over every entry in the artifact at
    /// `path`, each paired with a bounded reader over its payload.
    pub fn iter(path: &Path) -> Result<ArchiveIter, ArchiveError> {
        let file = std::fs::File::open(path)?;
        let decoder = decoder_for(file)?;
        Ok(ArchiveIter {
            inner: tar::Archive::new(decoder),
        })
    }
}

pub struct ArchiveIter {
    inner: tar::Archive<Box<dyn Read>>,
}

/// Metadata for one archive entry, mirroring the fields the Executor needs
/// from each payload member: hardlink/symlink target, mode, mtime, owner.
#[derive(Debug, Clone)]
pub struct EntryMeta {
    pub path: String,
    pub mode: u32,
    pub mtime: u64,
    pub uid: u64,
    pub gid: u64,
    pub link_name: Option<String>,
    pub is_symlink: bool,
    pub is_dir: bool,
}

impl ArchiveIter {
    /// Visits every entry, calling `f` with its metadata and a reader bound
    /// to its payload length. Stops and propagates the first error `f`
    /// returns.
    pub fn for_each<F>(&mut self, mut f: F) -> Result<(), ArchiveError>
    where
        F: FnMut(EntryMeta, &mut dyn Read) -> Result<(), ArchiveError>,
    {
        for entry in self.inner.entries()? {
            let mut entry = entry?;
            let header = entry.header();
            let meta = EntryMeta {
                path: entry.path()?.to_string_lossy().into_owned(),
                mode: header.mode().unwrap_or(0o644),
                mtime: header.mtime().unwrap_or(0),
                uid: header.uid().unwrap_or(0),
                gid: header.gid().unwrap_or(0),
                link_name: entry
                    .link_name()?
                    .map(|p| p.to_string_lossy().into_owned()),
                is_symlink: header.entry_type().is_symlink(),
                is_dir: header.entry_type().is_dir(),
            };
            f(meta, &mut entry)?;
        }
        Ok(())
    }
}

/// Appends an in-memory buffer as a new tar entry. Used only by the
/// repo-index builder when assembling an `<arch>-repodata` artifact.
pub fn append_buf<W: io::Write>(
    builder: &mut tar::Builder<W>,
    bytes: &[u8],
    name: &str,
    mode: u32,
    uid: u64,
    gid: u64,
) -> io::Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(bytes.len() as u64);
    header.set_mode(mode);
    header.set_uid(uid);
    header.set_gid(gid);
    header.set_cksum();
    builder.append_data(&mut header, name, bytes)
}

#[cfg(test)]
#[path = "archive.test.rs"]
mod test;
