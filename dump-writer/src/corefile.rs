//! Emission of the dump payload: the XML envelope immediately followed by a
//! Mach-O `MH_CORE` image.
//!
//! All layout decisions happen here; the platform-specific part is reduced
//! to the [`RegionSource`] that produces the raw bytes of a mapped region.

use crate::{
    envelope::{self, ModuleRecord},
    errors::Error,
    macho::{self, bytes_of, SegmentCommand64, ThreadCommand},
    regions::ClassifiedSegments,
};
use std::io::{Seek, SeekFrom, Write};

/// Produces the body bytes of a mapped region of the target.
pub trait RegionSource {
    /// Streams exactly `size` bytes starting at target address `addr` into
    /// `out`.
    fn copy_region(&mut self, addr: u64, size: u64, out: &mut dyn Write) -> Result<(), Error>;
}

/// Everything the emitter needs that was gathered while the target was
/// suspended.
pub struct DumpContents<'dump> {
    /// Build identifier recorded in the envelope
    pub build: &'dump str,
    /// Path of the target's main executable
    pub executable_path: &'dump [u8],
    /// The target's bundle version, possibly empty
    pub bundle_version: &'dump str,
    /// Index into `threads` of the thread the dump blames
    pub crashed_thread: usize,
    /// Loaded images in dyld enumeration order
    pub modules: &'dump [ModuleRecord],
    /// Captured register state per thread
    pub threads: &'dump [ThreadCommand],
    /// The classified region partition
    pub segments: ClassifiedSegments,
}

/// Writes `<envelope><mach-o core>` to `out`.
///
/// The mach header begins at the byte immediately following the envelope's
/// `</root>`; mapped segment bodies land at their assigned offsets relative
/// to the header, so the first one starts page-aligned within the core (not
/// within the surrounding file).
pub fn write_dump(
    out: &mut (impl Write + Seek),
    mut contents: DumpContents<'_>,
    source: &mut impl RegionSource,
) -> Result<(), Error> {
    envelope::write_envelope(
        out,
        contents.build,
        contents.executable_path,
        contents.bundle_version,
        contents.crashed_thread,
        contents.modules,
    )?;
    let core_start = out.stream_position()?;

    let segment_size = std::mem::size_of::<SegmentCommand64>();
    let thread_size = std::mem::size_of::<ThreadCommand>();
    let ncmds = contents.segments.command_count() + contents.threads.len();
    let sizeofcmds = (contents.segments.command_count() * segment_size
        + contents.threads.len() * thread_size) as u32;

    macho::assign_file_offsets(&mut contents.segments.mapped, sizeofcmds);

    let header = macho::core_header(ncmds as u32, sizeofcmds);
    out.write_all(bytes_of(&header))?;

    for segment in &contents.segments.mapped {
        out.write_all(bytes_of(segment))?;
    }
    for segment in &contents.segments.unmapped {
        out.write_all(bytes_of(segment))?;
    }
    for thread in contents.threads {
        out.write_all(bytes_of(thread))?;
    }

    for segment in &contents.segments.mapped {
        out.seek(SeekFrom::Start(core_start + segment.fileoff))?;
        source.copy_region(segment.vmaddr, segment.vmsize, &mut *out)?;
    }

    Ok(())
}
