//! The deployment-specific filesystem roots the reader works against.

use crate::errors::Error;
use std::path::PathBuf;

/// Where the source server's trees can be mounted from; a symbol entry's
/// second line is appended to this to form the mount target.
pub const DEFAULT_SOURCE_SERVER: &str = "http://sourceserver/";

/// All the places the resolver looks things up in. Construct one explicitly
/// in tests; production use goes through [`Roots::from_env`].
pub struct Roots {
    /// The user's home, used to resolve `~`-relative symbol entries
    pub home: PathBuf,
    /// Root of the uuid -> binary index
    pub uuid_root: PathBuf,
    /// Root of the uuid -> symbol-entry index
    pub symbol_root: PathBuf,
    /// Root of the local binary/symbol cache
    pub cache_root: PathBuf,
    /// Where the binary server is mounted; index entries are relative to
    /// this
    pub mount_root: PathBuf,
    /// URL prefix for mounting source trees
    pub source_server: String,
}

impl Roots {
    /// The standard layout underneath `$HOME`. Fails when `HOME` is unset
    /// or empty, which also catches being run from a context with no real
    /// user.
    pub fn from_env() -> Result<Self, Error> {
        let home = std::env::var_os("HOME")
            .filter(|home| !home.is_empty())
            .map(PathBuf::from)
            .ok_or(Error::LoadFailed("HOME environment variable must be set"))?;

        Ok(Self {
            uuid_root: home.join("uuids"),
            symbol_root: home.join("symbols"),
            cache_root: home.join("symbol_cache"),
            mount_root: home.join("mnt"),
            source_server: DEFAULT_SOURCE_SERVER.to_owned(),
            home,
        })
    }
}
