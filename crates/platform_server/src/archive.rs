use anyhow::{Context, Result};
use platform::{ArchiveDecoder, ArchiveEntry};
use std::io::{Cursor, Read};

/// Upper bound on the buffer reserved from an entry's declared size. The
/// header is untrusted; anything larger grows as it inflates.
const MAX_PREALLOC: u64 = 1 << 20;

/// Decodes zip archives.
#[derive(Debug, Default, Clone, Copy)]
pub struct ZipDecoder;

impl ArchiveDecoder for ZipDecoder {
    fn decode(&self, bytes: &[u8]) -> Result<Vec<ArchiveEntry>> {
        let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).context("invalid zip archive")?;
        let mut entries = Vec::with_capacity(archive.len());
        for index in 0..archive.len() {
            let mut file = archive
                .by_index(index)
                .with_context(|| format!("unreadable zip entry #{index}"))?;
            let name = file.name().to_string();
            if file.is_dir() {
                entries.push(ArchiveEntry::dir(name));
                continue;
            }
            let mut content = Vec::with_capacity(file.size().min(MAX_PREALLOC) as usize);
            file.read_to_end(&mut content)
                .with_context(|| format!("failed to inflate {name}"))?;
            entries.push(ArchiveEntry::file(name, content));
        }
        Ok(entries)
    }
}
