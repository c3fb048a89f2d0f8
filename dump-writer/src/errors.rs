/// Error that can occur while capturing a task or emitting the dump artifact
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A mach syscall returned a `kern_return_t` other than `KERN_SUCCESS`
    /// that is not explicitly tolerated at its call site
    #[error("{syscall} failed: kern_return {kr:#x}")]
    Kernel { syscall: &'static str, kr: i32 },
    /// Thread enumeration or register sampling produced something other
    /// than the exact states we asked for
    #[error("thread sampling failed: {0}")]
    Sampling(&'static str),
    /// The VM region walk aborted with a kernel error other than running
    /// off the end of the address space
    #[error("memory region walk failed: kern_return {kr:#x}")]
    Walk { kr: i32 },
    /// The dyld image list could not be enumerated
    #[error("image enumeration failed: {0}")]
    Images(&'static str),
    /// The handshake that transfers the target's task right failed
    #[cfg(target_os = "macos")]
    #[error("task rendezvous failed")]
    Rendezvous(#[from] dump_context::ipc::Error),
    /// An I/O error while writing the dump or the archive
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// The dump could not be packed into the single-entry archive
    #[error(transparent)]
    Zip(#[from] zip::result::ZipError),
}
