//! Packs the raw envelope+core byte stream into the single-entry zip
//! artifact that actually leaves the machine.

use crate::errors::Error;
use std::{
    fs::File,
    io,
    path::{Path, PathBuf},
};

/// Name of the sole member of a dump archive.
pub const DUMP_ENTRY_NAME: &str = "minidump.dmp";

/// Compresses the file at `raw` into a fresh archive and returns the
/// archive's path. The caller owns the returned file and is expected to
/// delete it once it has been delivered.
pub fn pack_dump(raw: &Path) -> Result<PathBuf, Error> {
    let staged = tempfile::Builder::new()
        .prefix("dump")
        .suffix(".zip")
        .tempfile()?;

    {
        let mut zip = zip::ZipWriter::new(staged.as_file());
        zip.start_file(DUMP_ENTRY_NAME, zip::write::FileOptions::default())?;
        io::copy(&mut File::open(raw)?, &mut zip)?;
        zip.finish()?;
    }

    let (_file, path) = staged.keep().map_err(|err| Error::Io(err.error))?;
    Ok(path)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::{Read, Write};

    #[test]
    fn archive_has_exactly_one_entry_with_the_original_bytes() {
        let mut raw = tempfile::NamedTempFile::new().unwrap();
        raw.write_all(b"<root>payload</root>\xfe\xed\xfa\xcf").unwrap();

        let packed = pack_dump(raw.path()).unwrap();

        let mut archive = zip::ZipArchive::new(File::open(&packed).unwrap()).unwrap();
        assert_eq!(archive.len(), 1);

        let mut entry = archive.by_name(DUMP_ENTRY_NAME).unwrap();
        let mut contents = Vec::new();
        entry.read_to_end(&mut contents).unwrap();
        assert_eq!(contents, b"<root>payload</root>\xfe\xed\xfa\xcf");

        drop(entry);
        drop(archive);
        std::fs::remove_file(packed).unwrap();
    }
}
