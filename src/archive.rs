//! Reading a recording archive.
//!
//! The capture step produces a tar archive, usually compressed, with the
//! metadata member first and the `perf script` output second. The
//! compression is recognised from the leading bytes, not the file name.

use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use anyhow::{bail, Context, Result};
use bzip2::read::BzDecoder;
use flate2::read::GzDecoder;
use tracing::{debug, info};
use xz2::read::XzDecoder;

pub const METADATA_MEMBER: &str = "perf-mdata.txt";
pub const EVENTS_MEMBER: &str = "perf.data.txt";

const READ_BUFFER: usize = 256 * 1024;
const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];
const XZ_MAGIC: &[u8] = &[0xfd, b'7', b'z', b'X', b'Z', 0x00];
const BZIP2_MAGIC: &[u8] = b"BZh";
/// `ustar` marker of a POSIX tar header, at this offset.
const USTAR_OFFSET: usize = 257;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
    Xz,
    Bzip2,
}

impl Compression {
    /// Recognise the container from its first bytes.
    pub fn sniff(head: &[u8]) -> Option<Self> {
        if head.starts_with(GZIP_MAGIC) {
            Some(Compression::Gzip)
        } else if head.starts_with(XZ_MAGIC) {
            Some(Compression::Xz)
        } else if head.starts_with(BZIP2_MAGIC) {
            Some(Compression::Bzip2)
        } else if head.get(USTAR_OFFSET..USTAR_OFFSET + 5) == Some(b"ustar") {
            Some(Compression::None)
        } else {
            None
        }
    }
}

/// The two text members of a recording.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveMembers {
    pub metadata: String,
    pub events: String,
}

/// Open `path`, unwrapping whatever compression it uses.
pub fn open_archive_reader(path: &Path) -> Result<Box<dyn Read>> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut reader = BufReader::with_capacity(READ_BUFFER, file);
    let head = reader
        .fill_buf()
        .with_context(|| format!("Failed to read {}", path.display()))?;
    if head.is_empty() {
        bail!("{} is empty", path.display());
    }
    let Some(compression) = Compression::sniff(head) else {
        bail!(
            "{} is not a tar archive (plain, gzip, xz or bzip2)",
            path.display()
        );
    };
    debug!("{}: {compression:?} compression", path.display());

    Ok(match compression {
        Compression::None => Box::new(reader),
        Compression::Gzip => Box::new(GzDecoder::new(reader)),
        Compression::Xz => Box::new(XzDecoder::new(reader)),
        Compression::Bzip2 => Box::new(BzDecoder::new(reader)),
    })
}

/// Read the members of a tar stream, in archive order.
pub fn read_members<R: Read>(reader: R) -> Result<ArchiveMembers> {
    let mut archive = tar::Archive::new(reader);
    let mut members: Vec<(String, String)> = Vec::new();

    for entry in archive.entries().context("Failed to read tar archive")? {
        let mut entry = entry.context("Corrupt tar archive")?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let name = entry
            .path()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|_| "<unnamed>".to_string());
        let mut bytes = Vec::new();
        entry
            .read_to_end(&mut bytes)
            .with_context(|| format!("Failed to read archive member {name}"))?;
        if bytes.is_empty() {
            bail!("Archive member {name} is empty");
        }
        // Task names aren't guaranteed to be UTF-8.
        members.push((name, String::from_utf8_lossy(&bytes).into_owned()));
    }

    if members.len() != 2 {
        let names: Vec<&str> = members.iter().map(|(n, _)| n.as_str()).collect();
        bail!(
            "Expected 2 archive members ({METADATA_MEMBER}, {EVENTS_MEMBER}), found {}: {names:?}",
            members.len()
        );
    }

    let mut members = members.into_iter();
    let (Some((metadata_name, metadata)), Some((events_name, events))) =
        (members.next(), members.next())
    else {
        bail!("Archive members disappeared while reading");
    };
    for (name, expected) in [(&metadata_name, METADATA_MEMBER), (&events_name, EVENTS_MEMBER)] {
        let base = Path::new(name)
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("");
        if base != expected {
            debug!("Using archive member {name} in place of {expected}");
        }
    }
    info!(
        "Read {metadata_name} ({} bytes) and {events_name} ({} bytes)",
        metadata.len(),
        events.len()
    );

    Ok(ArchiveMembers { metadata, events })
}

/// Open and read a recording archive.
pub fn read_archive(path: &Path) -> Result<ArchiveMembers> {
    let reader = open_archive_reader(path)?;
    read_members(reader).with_context(|| format!("Failed to read {}", path.display()))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use flate2::write::GzEncoder;
    use flate2::Compression as GzLevel;

    use super::*;

    fn tar_bytes(members: &[(&str, &str)]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (name, content) in members {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, name, content.as_bytes())
                .unwrap();
        }
        builder.into_inner().unwrap()
    }

    #[test]
    fn test_sniff() {
        assert_eq!(Compression::sniff(&[0x1f, 0x8b, 8]), Some(Compression::Gzip));
        assert_eq!(
            Compression::sniff(&[0xfd, b'7', b'z', b'X', b'Z', 0, 0]),
            Some(Compression::Xz)
        );
        assert_eq!(Compression::sniff(b"BZh91AY"), Some(Compression::Bzip2));
        assert_eq!(Compression::sniff(b"hello"), None);
        let plain = tar_bytes(&[("a", "b")]);
        assert_eq!(Compression::sniff(&plain), Some(Compression::None));
    }

    #[test]
    fn test_read_members_in_order() {
        let data = tar_bytes(&[(METADATA_MEMBER, "# date: x\n"), (EVENTS_MEMBER, "events\n")]);
        let members = read_members(data.as_slice()).unwrap();
        assert_eq!(members.metadata, "# date: x\n");
        assert_eq!(members.events, "events\n");
    }

    #[test]
    fn test_wrong_member_count() {
        let data = tar_bytes(&[(METADATA_MEMBER, "x")]);
        let err = read_members(data.as_slice()).unwrap_err();
        assert!(err.to_string().contains("found 1"));
    }

    #[test]
    fn test_empty_member_is_fatal() {
        let data = tar_bytes(&[(METADATA_MEMBER, "x"), (EVENTS_MEMBER, "")]);
        let err = read_members(data.as_slice()).unwrap_err();
        assert!(err.to_string().contains("perf.data.txt is empty"));
    }

    #[test]
    fn test_gzip_archive_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.bin");
        let mut encoder = GzEncoder::new(Vec::new(), GzLevel::default());
        encoder
            .write_all(&tar_bytes(&[(METADATA_MEMBER, "m"), (EVENTS_MEMBER, "e")]))
            .unwrap();
        std::fs::write(&path, encoder.finish().unwrap()).unwrap();

        let members = read_archive(&path).unwrap();
        assert_eq!(members.metadata, "m");
        assert_eq!(members.events, "e");
    }

    #[test]
    fn test_unknown_format_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, "just some text").unwrap();
        assert!(read_archive(&path).is_err());
        assert!(read_archive(&dir.path().join("missing.tar")).is_err());
    }
}
