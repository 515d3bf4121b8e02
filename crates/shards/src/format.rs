//! On-disk shard layout.
//!
//! ```text
//! ┌──────────┬────────────┬──────────────┬─────────────────────┬──────────┐
//! │ IXSHARD1 │ header_len │ header (JSON)│ payload (sections)  │ sha256   │
//! │ 8 bytes  │ u32 LE     │              │ concatenated blobs  │ 32 bytes │
//! └──────────┴────────────┴──────────────┴─────────────────────┴──────────┘
//! ```
//!
//! The header names every repository in the file together with its branch
//! set and the byte range of its section, so a directory scan alone can
//! rebuild membership and size. The trailing digest covers every byte before
//! it and is what separates a finished shard from a torn write.

use crate::{Result, ShardError};
use indexserver_protocol::{Branch, RepoId};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

pub const SHARD_MAGIC: &[u8; 8] = b"IXSHARD1";
pub const SHARD_FORMAT_VERSION: u32 = 1;

const PREAMBLE_LEN: u64 = 12;
const DIGEST_LEN: u64 = 32;
const MAX_HEADER_LEN: u64 = 64 * 1024 * 1024;

/// Membership record for one repository inside a shard. `offset` is
/// relative to the start of the payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoSection {
    pub id: RepoId,
    pub name: String,
    #[serde(default)]
    pub branches: Vec<Branch>,
    pub offset: u64,
    pub len: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardHeader {
    pub format_version: u32,
    pub generation: u64,
    pub repos: Vec<RepoSection>,
    /// File names this shard supersedes. Only compound shards carry it.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub replaces: Vec<String>,
}

impl ShardHeader {
    /// Builds a header, laying sections out back to back in the given order.
    pub fn new(generation: u64, mut repos: Vec<RepoSection>, replaces: Vec<String>) -> Self {
        let mut offset = 0u64;
        for section in &mut repos {
            section.offset = offset;
            offset += section.len;
        }
        Self {
            format_version: SHARD_FORMAT_VERSION,
            generation,
            repos,
            replaces,
        }
    }

    pub fn payload_len(&self) -> u64 {
        self.repos.iter().map(|s| s.len).sum()
    }

    fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Exact size of the file this header describes.
    pub fn encoded_file_len(&self) -> Result<u64> {
        let header_len = self.encode()?.len() as u64;
        Ok(PREAMBLE_LEN + header_len + self.payload_len() + DIGEST_LEN)
    }
}

/// A parsed shard header plus where its payload starts.
#[derive(Debug, Clone)]
pub struct ShardFile {
    pub path: PathBuf,
    pub header: ShardHeader,
    pub payload_start: u64,
    pub len: u64,
}

impl ShardFile {
    pub fn section_start(&self, section: &RepoSection) -> u64 {
        self.payload_start + section.offset
    }
}

/// Where the bytes of a section come from while writing.
pub(crate) enum SectionSource<'a> {
    Bytes(&'a [u8]),
    File { path: PathBuf, offset: u64 },
}

impl SectionSource<'_> {
    fn open(&self) -> Result<Box<dyn Read + '_>> {
        match self {
            SectionSource::Bytes(bytes) => Ok(Box::new(*bytes)),
            SectionSource::File { path, offset } => {
                let mut file = File::open(path)?;
                file.seek(SeekFrom::Start(*offset))?;
                Ok(Box::new(BufReader::new(file)))
            }
        }
    }
}

struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Streams a shard into `out`. `sources` must line up with `header.repos`.
/// Returns the number of bytes written.
pub(crate) fn write_shard<W: Write>(
    out: W,
    header: &ShardHeader,
    sources: &[SectionSource<'_>],
) -> Result<u64> {
    if sources.len() != header.repos.len() {
        return Err(ShardError::Other(format!(
            "shard header lists {} sections but {} sources were given",
            header.repos.len(),
            sources.len()
        )));
    }
    let encoded = header.encode()?;
    let header_len = u32::try_from(encoded.len())
        .map_err(|_| ShardError::Other("shard header too large".to_string()))?;

    let mut writer = HashingWriter {
        inner: out,
        hasher: Sha256::new(),
        written: 0,
    };
    writer.write_all(SHARD_MAGIC)?;
    writer.write_all(&header_len.to_le_bytes())?;
    writer.write_all(&encoded)?;

    for (section, source) in header.repos.iter().zip(sources) {
        let mut reader = source.open()?.take(section.len);
        let copied = io::copy(&mut reader, &mut writer)?;
        if copied != section.len {
            return Err(ShardError::Other(format!(
                "section for repository {} ended after {copied} of {} bytes",
                section.id, section.len
            )));
        }
    }

    let HashingWriter {
        mut inner,
        hasher,
        written,
    } = writer;
    let digest = hasher.finalize();
    inner.write_all(&digest)?;
    inner.flush()?;
    Ok(written + DIGEST_LEN)
}

/// Reads and sanity-checks the header of the shard at `path`. The payload
/// digest is not checked; see [`verify_shard`].
pub fn read_header(path: &Path) -> Result<ShardFile> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    if len < PREAMBLE_LEN + DIGEST_LEN {
        return Err(ShardError::corrupt(path, format!("file too short ({len} bytes)")));
    }

    let mut magic = [0u8; 8];
    file.read_exact(&mut magic)?;
    if &magic != SHARD_MAGIC {
        return Err(ShardError::corrupt(path, "bad magic"));
    }
    let mut raw_len = [0u8; 4];
    file.read_exact(&mut raw_len)?;
    let header_len = u64::from(u32::from_le_bytes(raw_len));
    if header_len > MAX_HEADER_LEN || PREAMBLE_LEN + header_len + DIGEST_LEN > len {
        return Err(ShardError::corrupt(
            path,
            format!("header length {header_len} does not fit in {len} bytes"),
        ));
    }

    let mut encoded = vec![0u8; header_len as usize];
    file.read_exact(&mut encoded)?;
    let header: ShardHeader = serde_json::from_slice(&encoded)
        .map_err(|err| ShardError::corrupt(path, format!("unreadable header: {err}")))?;

    if header.format_version != SHARD_FORMAT_VERSION {
        return Err(ShardError::corrupt(
            path,
            format!("unsupported format version {}", header.format_version),
        ));
    }
    if header.repos.is_empty() {
        return Err(ShardError::corrupt(path, "no repositories"));
    }
    let payload_start = PREAMBLE_LEN + header_len;
    let payload_len = len - payload_start - DIGEST_LEN;
    if header.payload_len() != payload_len {
        return Err(ShardError::corrupt(
            path,
            format!(
                "sections cover {} bytes but payload is {payload_len}",
                header.payload_len()
            ),
        ));
    }
    for section in &header.repos {
        if section.offset.saturating_add(section.len) > payload_len {
            return Err(ShardError::corrupt(
                path,
                format!("section for repository {} is out of bounds", section.id),
            ));
        }
    }

    Ok(ShardFile {
        path: path.to_path_buf(),
        header,
        payload_start,
        len,
    })
}

/// Reads the header and checks the trailing digest against the file body.
pub fn verify_shard(path: &Path) -> Result<ShardFile> {
    let shard = read_header(path)?;
    let mut file = File::open(path)?;
    let computed = {
        let mut body = BufReader::new(&mut file).take(shard.len - DIGEST_LEN);
        let mut hasher = Sha256::new();
        io::copy(&mut body, &mut hasher)?;
        hasher.finalize()
    };

    let mut trailer = [0u8; DIGEST_LEN as usize];
    file.seek(SeekFrom::Start(shard.len - DIGEST_LEN))?;
    file.read_exact(&mut trailer)?;
    if computed.as_slice() != trailer.as_slice() {
        return Err(ShardError::corrupt(path, "checksum mismatch"));
    }
    Ok(shard)
}

/// Reads the content of one repository section.
pub fn read_section(shard: &ShardFile, section: &RepoSection) -> Result<Vec<u8>> {
    let mut file = File::open(&shard.path)?;
    file.seek(SeekFrom::Start(shard.section_start(section)))?;
    let mut out = Vec::with_capacity(section.len as usize);
    file.take(section.len).read_to_end(&mut out)?;
    if out.len() as u64 != section.len {
        return Err(ShardError::corrupt(&shard.path, "truncated section"));
    }
    Ok(out)
}
