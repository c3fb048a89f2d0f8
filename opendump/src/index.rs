//! The two filesystem indexes keyed by module uuid: one mapping a uuid to
//! the binary it identifies, one mapping a uuid to its debug symbols.

use crate::errors::Error;
use std::{io, path::PathBuf};

/// Rejects anything that is not a canonical 36-character uuid rendering.
pub fn validate_uuid(uuid: &str) -> Result<(), Error> {
    if uuid.len() == 36 {
        Ok(())
    } else {
        Err(Error::MalformedUuid(uuid.to_owned()))
    }
}

/// The index subpath for a uuid: the same folder format lldb uses for its
/// uuid -> debug symbol map. `C4CBD2CF-39D5-3185-851E-85C7DD2F8C7F` becomes
/// `C4CB/D2CF/39D5/3185/851E/85C7DD2F8C7F`, a four-character prefix and the
/// dash-separated groups turned into path components.
pub fn uuid_path(uuid: &str) -> Result<PathBuf, Error> {
    validate_uuid(uuid)?;
    let (head, tail) = uuid.split_at(4);
    Ok(PathBuf::from(format!("{head}/{}", tail.replace('-', "/"))))
}

/// Maps a uuid to the path of the binary carrying it, relative to the
/// user's mount of the binary server.
pub struct UuidIndex {
    root: PathBuf,
}

impl UuidIndex {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `Ok(None)` when the uuid simply is not indexed; an `Err` only for
    /// real I/O trouble underneath the index.
    pub fn lookup(&self, uuid: &str) -> Result<Option<String>, Error> {
        let entry = self.root.join(uuid_path(uuid)?);
        match std::fs::read_to_string(&entry) {
            Ok(contents) => Ok(Some(contents.trim_end_matches('\n').to_owned())),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

/// A symbol index entry: where the DWARF file lives inside its `.dSYM`
/// bundle, and which server-side source tree the build came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolEntry {
    /// `~`-relative path to the DWARF file, ie
    /// `~/builds/21.3/Thing.app.dSYM/Contents/Resources/DWARF/Thing`
    pub dwarf_path: String,
    /// Path on the source server that can be mounted to see this build's
    /// source code
    pub source_mount: String,
}

/// Maps a uuid to its [`SymbolEntry`] via one two-line file per uuid.
pub struct SymbolIndex {
    root: PathBuf,
}

impl SymbolIndex {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn lookup(&self, uuid: &str) -> Result<Option<SymbolEntry>, Error> {
        validate_uuid(uuid)?;
        let entry = self.root.join(uuid);

        let contents = match std::fs::read_to_string(&entry) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        let mut lines = contents.lines();
        let dwarf_path = lines
            .next()
            .ok_or(Error::LoadFailed("symbol index entry is empty"))?
            .to_owned();
        let source_mount = lines
            .next()
            .ok_or(Error::LoadFailed("symbol index entry has no source line"))?
            .to_owned();

        if !dwarf_path.starts_with('~') {
            return Err(Error::LoadFailed(
                "symbol index entry is not home-relative",
            ));
        }

        Ok(Some(SymbolEntry {
            dwarf_path,
            source_mount,
        }))
    }
}
