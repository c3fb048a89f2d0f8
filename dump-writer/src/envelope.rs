//! The XML metadata envelope that precedes the Mach-O core in the dump
//! artifact.
//!
//! The format is fixed and entirely producer-controlled: a `<root>` element
//! holding the build id, the executable identity, the crashed thread index
//! and one `<elem>` per loaded module, closed by the literal `</root>` that
//! readers use to find the start of the mach header. Nothing may be written
//! after that closing tag, not even a newline.

use crate::errors::Error;
use std::io::Write;

/// One loaded image of the target, in dyld enumeration order. Index 0 is
/// always the main executable.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModuleRecord {
    /// Image path as read out of the target, possibly empty if the path
    /// string could not be materialized
    pub path: Vec<u8>,
    /// Address the image was loaded at
    pub start_address: u64,
    /// `current_version` of the image's `LC_ID_DYLIB`, 0 when the image has
    /// none (the main executable)
    pub version: u32,
    /// The image's `LC_UUID`, nil when the image has none
    pub uuid: [u8; 16],
}

/// Serializes the envelope. `crashed_thread` indexes the thread command
/// list the core will carry; `modules` must already be in enumeration
/// order.
pub fn write_envelope(
    out: &mut impl Write,
    build: &str,
    executable_path: &[u8],
    bundle_version: &str,
    crashed_thread: usize,
    modules: &[ModuleRecord],
) -> Result<(), Error> {
    write!(
        out,
        "<?xml version=\"1.0\" encoding=\"UTF-8\" standalone=\"yes\"?>\
         <root>\
         <version val=\"{}\"/>\
         <PersistentType>\
         <m_strExecutable>{}</m_strExecutable>\
         <m_strBundleVersion>{}</m_strBundleVersion>\
         <m_nThread val=\"{}\"/>\
         <m_vecmodule length=\"{}\">",
        escape_text(build),
        escape_bytes(executable_path),
        escape_text(bundle_version),
        crashed_thread,
        modules.len(),
    )?;

    for module in modules {
        write!(
            out,
            "<elem>\
             <m_pvStartAddress val=\"{}\"/>\
             <m_strPath>{}</m_strPath>\
             <m_modver val=\"{}\"/>\
             <m_uuid val=\"{}\"/>\
             </elem>",
            module.start_address,
            escape_bytes(&module.path),
            module.version,
            uuid::Uuid::from_bytes(module.uuid).hyphenated(),
        )?;
    }

    write!(out, "</m_vecmodule></PersistentType></root>")?;
    Ok(())
}

fn escape_text(raw: &str) -> String {
    quick_xml::escape::escape(raw).into_owned()
}

/// Image paths are byte strings; anything that is not UTF-8 is carried over
/// with replacement characters rather than failing the whole dump.
fn escape_bytes(raw: &[u8]) -> String {
    escape_text(&String::from_utf8_lossy(raw))
}
