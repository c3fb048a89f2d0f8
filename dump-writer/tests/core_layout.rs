//! Drives the portable dump emission end to end with a synthetic target and
//! checks the emitted artifact against the core-file layout rules a
//! debugger relies on.

use dump_writer::{
    corefile::{DumpContents, RegionSource},
    macho::{self, ThreadCommand},
    regions::{self, Region, VM_MEMORY_STACK},
    Error, ModuleRecord,
};
use scroll::Pread;
use std::{
    collections::BTreeMap,
    io::Cursor,
};

/// A pretend address space: region base address -> bytes.
struct FakeMemory {
    regions: BTreeMap<u64, Vec<u8>>,
}

impl RegionSource for FakeMemory {
    fn copy_region(
        &mut self,
        addr: u64,
        size: u64,
        out: &mut dyn std::io::Write,
    ) -> Result<(), Error> {
        let bytes = &self.regions[&addr];
        assert_eq!(bytes.len() as u64, size);
        out.write_all(bytes)?;
        Ok(())
    }
}

struct Target {
    memory: FakeMemory,
    regions: Vec<Region>,
    threads: Vec<ThreadCommand>,
    modules: Vec<ModuleRecord>,
}

/// Two threads, three modules, four readable regions. The main thread's
/// stack pointer lives in the third region.
fn synthetic_target() -> Target {
    let mut memory = BTreeMap::new();
    let mut walked = Vec::new();

    for (base, size, user_tag, fill) in [
        (0x0000_1000u64, 0x2000u64, 2u32, 0x11u8),
        (0x0001_0000, 0x1000, 2, 0x22),
        (0x7000_0000, 0x3000, 1, 0x33), // hand-rolled stack, malloc tag
        (0x9000_0000, 0x1000, 2, 0x44),
    ] {
        memory.insert(base, vec![fill; size as usize]);
        walked.push(Region {
            base,
            size,
            prot: 1,
            max_prot: 7,
            user_tag,
        });
    }

    let mut crashed = ThreadCommand::new();
    crashed.gpr.state.rbp = 0x7000_0a00;
    crashed.gpr.state.rsp = 0x7000_0900;
    crashed.gpr.state.rip = 0x0000_1234;

    let mut idle = ThreadCommand::new();
    idle.gpr.state.rbp = 0x7000_2f00;
    idle.gpr.state.rsp = 0x7000_2e00;

    let modules = vec![
        ModuleRecord {
            path: b"/Applications/Thing.app/Contents/MacOS/Thing".to_vec(),
            start_address: 0x0000_1000,
            version: 0,
            uuid: [0x11; 16],
        },
        ModuleRecord {
            path: b"/usr/lib/libSystem.B.dylib".to_vec(),
            start_address: 0x0001_0000,
            version: 0x0505_0000,
            uuid: [0x22; 16],
        },
        ModuleRecord {
            path: b"/usr/lib/libobjc.A.dylib".to_vec(),
            start_address: 0x9000_0000,
            version: 0x0001_0000,
            uuid: [0x33; 16],
        },
    ];

    Target {
        memory: FakeMemory { regions: memory },
        regions: walked,
        threads: vec![crashed, idle],
        modules,
    }
}

fn emit(big: bool) -> Vec<u8> {
    let mut target = synthetic_target();
    let segments = regions::classify(target.regions.clone(), big, &target.threads);

    let mut out = Cursor::new(Vec::new());
    dump_writer::write_dump(
        &mut out,
        DumpContents {
            build: "2103",
            executable_path: b"Thing",
            bundle_version: "21.3",
            crashed_thread: 0,
            modules: &target.modules,
            threads: &target.threads,
            segments,
        },
        &mut target.memory,
    )
    .unwrap();

    out.into_inner()
}

/// Splits the artifact at the end of the envelope's closing tag.
fn split_envelope(dump: &[u8]) -> (&[u8], &[u8]) {
    let marker = b"</root>";
    let at = dump
        .windows(marker.len())
        .position(|window| window == marker)
        .expect("no envelope terminator");
    dump.split_at(at + marker.len())
}

#[derive(Debug)]
struct Segment {
    vmaddr: u64,
    vmsize: u64,
    fileoff: u64,
    filesize: u64,
}

struct Core {
    ncmds: u32,
    sizeofcmds: u32,
    mapped: Vec<Segment>,
    unmapped: Vec<Segment>,
    threads: usize,
}

fn parse_core(core: &[u8]) -> Core {
    let magic: u32 = core.pread_with(0, scroll::LE).unwrap();
    assert_eq!(magic, macho::MH_MAGIC_64);
    let filetype: u32 = core.pread_with(12, scroll::LE).unwrap();
    assert_eq!(filetype, macho::MH_CORE);
    let ncmds: u32 = core.pread_with(16, scroll::LE).unwrap();
    let sizeofcmds: u32 = core.pread_with(20, scroll::LE).unwrap();

    let mut mapped = Vec::new();
    let mut unmapped = Vec::new();
    let mut threads = 0;
    let mut seen_thread = false;

    let mut offset = std::mem::size_of::<macho::MachHeader64>();
    for _ in 0..ncmds {
        let cmd: u32 = core.pread_with(offset, scroll::LE).unwrap();
        let cmdsize: u32 = core.pread_with(offset + 4, scroll::LE).unwrap();

        match cmd {
            macho::LC_SEGMENT_64 => {
                assert!(!seen_thread, "segment command after a thread command");
                let segment = Segment {
                    vmaddr: core.pread_with(offset + 24, scroll::LE).unwrap(),
                    vmsize: core.pread_with(offset + 32, scroll::LE).unwrap(),
                    fileoff: core.pread_with(offset + 40, scroll::LE).unwrap(),
                    filesize: core.pread_with(offset + 48, scroll::LE).unwrap(),
                };
                if segment.filesize > 0 {
                    mapped.push(segment);
                } else {
                    unmapped.push(segment);
                }
            }
            macho::LC_THREAD => {
                seen_thread = true;
                threads += 1;

                // walk the flavor records exactly like a loader would
                let mut state_offset = offset + 8;
                let mut flavors = Vec::new();
                while state_offset < offset + cmdsize as usize {
                    let flavor: u32 = core.pread_with(state_offset, scroll::LE).unwrap();
                    let count: u32 = core.pread_with(state_offset + 4, scroll::LE).unwrap();
                    flavors.push(flavor);
                    state_offset += 8 + count as usize * 4;
                }
                assert_eq!(state_offset, offset + cmdsize as usize);
                assert_eq!(
                    flavors,
                    vec![
                        macho::X86_THREAD_STATE64,
                        macho::X86_FLOAT_STATE64,
                        macho::X86_EXCEPTION_STATE64
                    ]
                );
            }
            other => panic!("unexpected load command {other:#x}"),
        }

        offset += cmdsize as usize;
    }

    assert_eq!(offset, std::mem::size_of::<macho::MachHeader64>() + sizeofcmds as usize);

    Core {
        ncmds,
        sizeofcmds,
        mapped,
        unmapped,
        threads,
    }
}

#[test]
fn small_dump_maps_only_stacks() {
    let dump = emit(false);
    let (envelope, core) = split_envelope(&dump);

    // the terminator appears exactly once across the whole artifact
    let occurrences = dump
        .windows(b"</root>".len())
        .filter(|window| *window == b"</root>")
        .count();
    assert_eq!(occurrences, 1);

    let envelope = std::str::from_utf8(envelope).unwrap();
    assert!(envelope.contains("<m_nThread val=\"0\"/>"));
    assert!(envelope.contains("<m_vecmodule length=\"3\">"));

    let parsed = parse_core(core);
    assert_eq!(parsed.threads, 2);
    assert_eq!(parsed.ncmds as usize, parsed.mapped.len() + parsed.unmapped.len() + 2);

    // only the region holding the crashed thread's stack roots is mapped
    assert_eq!(parsed.mapped.len(), 1);
    assert_eq!(parsed.mapped[0].vmaddr, 0x7000_0000);
    assert_eq!(parsed.unmapped.len(), 3);

    for segment in &parsed.unmapped {
        assert_eq!(segment.filesize, 0);
        assert!(segment.vmsize > 0);
    }

    // the single body lands page-aligned after the commands and carries the
    // region bytes verbatim
    let body = &parsed.mapped[0];
    assert_eq!(
        body.fileoff,
        macho::round_page(
            std::mem::size_of::<macho::MachHeader64>() as u64 + u64::from(parsed.sizeofcmds)
        )
    );
    let bytes = &core[body.fileoff as usize..(body.fileoff + body.filesize) as usize];
    assert!(bytes.iter().all(|b| *b == 0x33));
}

#[test]
fn big_dump_maps_every_region() {
    let dump = emit(true);
    let (_envelope, core) = split_envelope(&dump);
    let parsed = parse_core(core);

    assert!(parsed.unmapped.is_empty());
    assert_eq!(parsed.mapped.len(), 4);

    let vm_total: u64 = parsed.mapped.iter().map(|s| s.vmsize).sum();
    let file_total: u64 = parsed.mapped.iter().map(|s| s.filesize).sum();
    assert_eq!(vm_total, file_total);

    // offsets are contiguous in command order
    for pair in parsed.mapped.windows(2) {
        assert_eq!(pair[1].fileoff, pair[0].fileoff + pair[0].filesize);
    }

    // each body is the fill byte of its region
    for (segment, fill) in parsed.mapped.iter().zip([0x11u8, 0x22, 0x33, 0x44]) {
        let bytes = &core[segment.fileoff as usize..(segment.fileoff + segment.filesize) as usize];
        assert!(bytes.iter().all(|b| *b == fill));
    }
}

#[test]
fn stack_tagged_regions_map_without_thread_roots() {
    let threads = [ThreadCommand::new()];
    let walked = vec![
        Region {
            base: 0x1000,
            size: 0x1000,
            prot: 1,
            max_prot: 7,
            user_tag: VM_MEMORY_STACK,
        },
        Region {
            base: 0x2000,
            size: 0x1000,
            prot: 1,
            max_prot: 7,
            user_tag: 2,
        },
    ];

    let segments = regions::classify(walked, false, &threads);
    assert_eq!(segments.mapped.len(), 1);
    assert_eq!(segments.mapped[0].vmaddr, 0x1000);
}
