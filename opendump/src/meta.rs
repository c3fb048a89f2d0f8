//! Unpacking of a dump artifact: the single-entry archive, the XML
//! envelope, and the Mach-O core that follows it.

use crate::errors::Error;
use quick_xml::events::Event;
use std::{fs::File, io::Read, path::Path};

/// Name of the sole member of a dump archive.
pub const DUMP_ENTRY_NAME: &str = "minidump.dmp";

/// The byte sequence that terminates the envelope; the mach header starts
/// at the very next byte.
const ENVELOPE_END: &[u8] = b"</root>";

/// One module entry of the envelope, in the writer's enumeration order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleMeta {
    pub path: String,
    pub start_address: u64,
    pub version: u32,
    /// The uuid as written, canonically 36 characters but not trusted to be
    pub uuid: String,
}

/// The deserialized envelope.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DumpMeta {
    pub executable_path: String,
    pub bundle_version: String,
    pub crashed_thread: usize,
    pub modules: Vec<ModuleMeta>,
}

/// An opened dump artifact: parsed metadata plus the raw core image.
pub struct DumpArtifact {
    pub meta: DumpMeta,
    /// The `MH_CORE` bytes, starting with the mach magic
    pub core: Vec<u8>,
}

impl DumpArtifact {
    /// Unzips and parses the artifact at `path`.
    pub fn read(path: &Path) -> Result<Self, Error> {
        let mut archive = zip::ZipArchive::new(File::open(path)?)?;
        let mut entry = archive.by_name(DUMP_ENTRY_NAME)?;
        let mut contents = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut contents)?;
        Self::parse(&contents)
    }

    /// Splits the raw `<envelope><core>` stream and deserializes the
    /// envelope. The core is everything after the envelope's closing tag,
    /// with no separator in between.
    pub fn parse(contents: &[u8]) -> Result<Self, Error> {
        let end = contents
            .windows(ENVELOPE_END.len())
            .position(|window| window == ENVELOPE_END)
            .ok_or(Error::LoadFailed("the envelope never closes"))?
            + ENVELOPE_END.len();

        let (envelope, core) = contents.split_at(end);
        Ok(Self {
            meta: parse_envelope(envelope)?,
            core: core.to_vec(),
        })
    }
}

/// Deserializes the envelope XML into a [`DumpMeta`].
fn parse_envelope(envelope: &[u8]) -> Result<DumpMeta, Error> {
    let mut reader = quick_xml::Reader::from_reader(envelope);

    let mut meta = DumpMeta::default();
    let mut module: Option<ModuleMeta> = None;
    // the element whose character data we are currently collecting
    let mut text_target: Option<Vec<u8>> = None;

    loop {
        match reader.read_event()? {
            Event::Start(start) => match start.name().as_ref() {
                b"elem" => module = Some(ModuleMeta::default()),
                name @ (b"m_strExecutable" | b"m_strBundleVersion" | b"m_strPath") => {
                    text_target = Some(name.to_vec());
                }
                _ => {}
            },
            Event::Empty(empty) => {
                let attribute = empty
                    .try_get_attribute("val")
                    .map_err(|_err| Error::LoadFailed("an envelope attribute is malformed"))?;
                let value = match attribute {
                    Some(attribute) => attribute.unescape_value()?.into_owned(),
                    None => continue,
                };
                match empty.name().as_ref() {
                    b"m_nThread" => meta.crashed_thread = parse_number(&value)? as usize,
                    b"m_pvStartAddress" => {
                        if let Some(module) = module.as_mut() {
                            module.start_address = parse_number(&value)?;
                        }
                    }
                    b"m_modver" => {
                        if let Some(module) = module.as_mut() {
                            module.version = parse_number(&value)? as u32;
                        }
                    }
                    b"m_uuid" => {
                        if let Some(module) = module.as_mut() {
                            module.uuid = value;
                        }
                    }
                    _ => {}
                }
            }
            Event::Text(text) => {
                if let Some(target) = &text_target {
                    let value = text.unescape()?.into_owned();
                    match target.as_slice() {
                        b"m_strExecutable" => meta.executable_path = value,
                        b"m_strBundleVersion" => meta.bundle_version = value,
                        b"m_strPath" => {
                            if let Some(module) = module.as_mut() {
                                module.path = value;
                            }
                        }
                        _ => {}
                    }
                }
            }
            Event::End(end) => {
                text_target = None;
                if end.name().as_ref() == b"elem" {
                    if let Some(module) = module.take() {
                        meta.modules.push(module);
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if meta.modules.is_empty() {
        return Err(Error::LoadFailed("the envelope lists no modules"));
    }

    Ok(meta)
}

fn parse_number(value: &str) -> Result<u64, Error> {
    value
        .parse()
        .map_err(|_err| Error::LoadFailed("a numeric envelope attribute is not a number"))
}
