/// Error that can occur while resolving a dump into a debugger target
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A fatal failure: bad envelope, a missing executable binary, the
    /// engine rejected the core, or a crashed-thread index out of range
    #[error("failed to load the dump: {0}")]
    LoadFailed(&'static str),
    /// The same class of failure as [`Error::LoadFailed`], but the session
    /// had already seen a malformed module uuid in the envelope, marking
    /// the dump as coming from a known-bad producer
    #[error("failed to load the dump (produced by a known-bad writer): {0}")]
    LoadFailedIgnorable(&'static str),
    /// A module uuid in the envelope was not 36 characters
    #[error("malformed uuid {0:?}")]
    MalformedUuid(String),
    /// An I/O failure in the indexes, the cache, or scratch files
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// The envelope was not parseable
    #[error(transparent)]
    Xml(#[from] quick_xml::Error),
    /// The artifact was not a readable single-entry archive
    #[error(transparent)]
    Zip(#[from] zip::result::ZipError),
    /// The embedded debugger engine reported a failure
    #[error("debugger engine error: {0}")]
    Engine(String),
}

impl Error {
    /// Whether this failure belongs to the ignorable class.
    pub fn is_ignorable(&self) -> bool {
        matches!(self, Self::LoadFailedIgnorable(_))
    }
}
