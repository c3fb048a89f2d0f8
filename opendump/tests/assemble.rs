//! End-to-end reader tests: artifacts produced by the writer's emission
//! path are resolved through real on-disk indexes and the cache, into a
//! recording fake of the debugger engine.

use dump_writer::{
    corefile::{DumpContents, RegionSource},
    macho::ThreadCommand,
    regions::{self, Region, VM_MEMORY_STACK},
    ModuleRecord,
};
use opendump::{
    engine::{DebuggerEngine, DebuggerTarget},
    uuid_path, Error, Roots, TargetAssembler,
};
use std::{
    fs,
    io::{Cursor, Write},
    path::{Path, PathBuf},
};

// A recording stand-in for the embedded debugger engine.

#[derive(Default, Debug)]
struct FakeEngine {
    variables: Vec<(String, String)>,
    created_for: Option<PathBuf>,
    commands: Vec<String>,
}

#[derive(Default, Debug)]
struct FakeTarget {
    /// (path, symbol file) per module; index 0 is the auto-loaded
    /// executable
    modules: Vec<(PathBuf, Option<PathBuf>)>,
    load_addresses: Vec<(usize, u64)>,
    threads: usize,
    selected_thread: Option<usize>,
    /// file address the object file header pretends to be at
    header_file_address: u64,
}

impl DebuggerEngine for FakeEngine {
    type Target = FakeTarget;

    fn set_variable(&mut self, name: &str, value: &str) -> Result<(), Error> {
        self.variables.push((name.to_owned(), value.to_owned()));
        Ok(())
    }

    fn create_target(
        &mut self,
        executable: &Path,
        triple: &str,
        add_dependent_modules: bool,
    ) -> Result<Self::Target, Error> {
        assert_eq!(triple, "x86_64-apple-macosx");
        assert!(!add_dependent_modules);
        self.created_for = Some(executable.to_owned());
        Ok(FakeTarget {
            modules: vec![(executable.to_owned(), None)],
            header_file_address: 0x0000_1000,
            ..FakeTarget::default()
        })
    }

    fn execute_command(&mut self, command: &str) {
        self.commands.push(command.to_owned());
    }

    fn run_command_interpreter(&mut self) {}
}

impl DebuggerTarget for FakeTarget {
    type Module = usize;

    fn load_core(&mut self, core: &Path) -> Result<(), Error> {
        let bytes = fs::read(core)?;
        // a real engine rejects anything that is not a mach core
        if bytes.len() < 32 || bytes[0..4] != 0xfeed_facfu32.to_le_bytes() {
            return Err(Error::Engine("not a mach core".to_owned()));
        }

        // count LC_THREAD commands to learn the thread count, the same way
        // the engine materializes core threads
        let ncmds = u32::from_le_bytes(bytes[16..20].try_into().unwrap());
        let mut offset = 32;
        for _ in 0..ncmds {
            let cmd = u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap());
            let cmdsize =
                u32::from_le_bytes(bytes[offset + 4..offset + 8].try_into().unwrap()) as usize;
            if cmd == 0x4 {
                self.threads += 1;
            }
            offset += cmdsize;
        }
        Ok(())
    }

    fn num_modules(&self) -> usize {
        self.modules.len()
    }

    fn module_at(&self, index: usize) -> Result<usize, Error> {
        if index < self.modules.len() {
            Ok(index)
        } else {
            Err(Error::Engine(format!("no module {index}")))
        }
    }

    fn header_file_address(&self, _module: &usize) -> Result<u64, Error> {
        Ok(self.header_file_address)
    }

    fn set_module_load_address(&mut self, module: &usize, slide: u64) -> Result<(), Error> {
        self.load_addresses.push((*module, slide));
        Ok(())
    }

    fn add_module(
        &mut self,
        path: &Path,
        triple: &str,
        symbol_file: Option<&Path>,
    ) -> Result<Option<usize>, Error> {
        assert_eq!(triple, "x86_64-apple-macosx");
        self.modules
            .push((path.to_owned(), symbol_file.map(Path::to_owned)));
        Ok(Some(self.modules.len() - 1))
    }

    fn num_threads(&self) -> usize {
        self.threads
    }

    fn select_thread(&mut self, index: usize) -> Result<(), Error> {
        self.selected_thread = Some(index);
        Ok(())
    }
}

const EXE_UUID: &str = "C4CBD2CF-39D5-3185-851E-85C7DD2F8C7F";
const LIB_UUID: &str = "00112233-4455-6677-8899-AABBCCDDEEFF";
const LOST_UUID: &str = "99999999-9999-9999-9999-999999999999";

fn uuid_bytes(canonical: &str) -> [u8; 16] {
    let hex: String = canonical.chars().filter(|c| *c != '-').collect();
    let mut bytes = [0u8; 16];
    for (i, byte) in bytes.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).unwrap();
    }
    bytes
}

struct Fixture {
    _tree: tempfile::TempDir,
    roots: Roots,
    archive: PathBuf,
}

impl Drop for Fixture {
    fn drop(&mut self) {
        let _res = fs::remove_file(&self.archive);
    }
}

struct FixtureMemory;

impl RegionSource for FixtureMemory {
    fn copy_region(
        &mut self,
        _addr: u64,
        size: u64,
        out: &mut dyn std::io::Write,
    ) -> Result<(), dump_writer::Error> {
        out.write_all(&vec![0x5a; size as usize])?;
        Ok(())
    }
}

/// A dump with two threads and three modules: the executable (binary and
/// dSYM indexed), a library with a binary but no symbols, and a library
/// whose uuid nobody has indexed.
fn build_fixture() -> Fixture {
    let tree = tempfile::tempdir().unwrap();
    let home = tree.path().to_owned();

    let roots = Roots {
        uuid_root: home.join("uuids"),
        symbol_root: home.join("symbols"),
        cache_root: home.join("symbol_cache"),
        mount_root: home.join("mnt"),
        source_server: "http://sourceserver/".to_owned(),
        home: home.clone(),
    };

    // binaries on the "server share"
    let exe_rel = "21.3/Thing.app/Contents/MacOS/Thing";
    let lib_rel = "21.3/libfoo.dylib";
    for (rel, fill) in [(exe_rel, 0xaau8), (lib_rel, 0xbb)] {
        let path = roots.mount_root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, vec![fill; 4096]).unwrap();
    }

    // uuid index entries
    for (uuid, rel) in [(EXE_UUID, exe_rel), (LIB_UUID, lib_rel)] {
        let entry = roots.uuid_root.join(uuid_path(uuid).unwrap());
        fs::create_dir_all(entry.parent().unwrap()).unwrap();
        fs::write(entry, rel).unwrap();
    }

    // symbol index + dSYM bundle for the executable only
    let dwarf = home.join("builds/21.3/Thing.app.dSYM/Contents/Resources/DWARF");
    fs::create_dir_all(&dwarf).unwrap();
    fs::write(dwarf.join("Thing"), vec![0xcc; 2048]).unwrap();
    fs::create_dir_all(&roots.symbol_root).unwrap();
    fs::write(
        roots.symbol_root.join(EXE_UUID),
        "~/builds/21.3/Thing.app.dSYM/Contents/Resources/DWARF/Thing\nproj/2021-release\n",
    )
    .unwrap();

    let archive = write_artifact();
    Fixture {
        _tree: tree,
        roots,
        archive,
    }
}

fn write_artifact() -> PathBuf {
    let mut crashed = ThreadCommand::new();
    crashed.gpr.state.rbp = 0x7000_0a00;
    crashed.gpr.state.rsp = 0x7000_0900;
    let idle = ThreadCommand::new();
    let threads = [crashed, idle];

    let walked = vec![Region {
        base: 0x7000_0000,
        size: 0x2000,
        prot: 1,
        max_prot: 7,
        user_tag: VM_MEMORY_STACK,
    }];
    let segments = regions::classify(walked, false, &threads);

    let modules = [
        ModuleRecord {
            path: b"/Applications/Thing.app/Contents/MacOS/Thing".to_vec(),
            start_address: 0x0010_0000,
            version: 0,
            uuid: uuid_bytes(EXE_UUID),
        },
        ModuleRecord {
            path: b"/usr/lib/libfoo.dylib".to_vec(),
            start_address: 0x0020_0000,
            version: 0x0001_0000,
            uuid: uuid_bytes(LIB_UUID),
        },
        ModuleRecord {
            path: b"/usr/lib/liblost.dylib".to_vec(),
            start_address: 0x0030_0000,
            version: 0,
            uuid: uuid_bytes(LOST_UUID),
        },
    ];

    let mut raw = Cursor::new(Vec::new());
    dump_writer::write_dump(
        &mut raw,
        DumpContents {
            build: "2103",
            executable_path: b"Thing",
            bundle_version: "21.3",
            crashed_thread: 0,
            modules: &modules,
            threads: &threads,
            segments,
        },
        &mut FixtureMemory,
    )
    .unwrap();

    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(raw.get_ref()).unwrap();
    dump_writer::pack_dump(file.path()).unwrap()
}

#[test]
fn happy_path_reconstructs_the_target() {
    let fixture = build_fixture();

    let assembled = TargetAssembler::new(FakeEngine::default(), &fixture.roots, false)
        .assemble(&fixture.archive)
        .unwrap();

    assert!(!assembled.ignorable);

    // the engine was configured before target creation
    assert_eq!(
        assembled.engine.variables,
        vec![
            ("target.preload-symbols".to_owned(), "false".to_owned()),
            ("symbols.enable-external-lookup".to_owned(), "false".to_owned()),
        ]
    );

    // the target was created for the *cached* executable
    let cached_exe = fixture
        .roots
        .cache_root
        .join(uuid_path(EXE_UUID).unwrap())
        .join("Thing");
    assert_eq!(assembled.engine.created_for.as_deref(), Some(cached_exe.as_path()));
    assert!(cached_exe.exists());

    let target = &assembled.target;

    // executable slid by recordedStart - headerFileAddress, the library
    // placed at its recorded start
    assert_eq!(target.load_addresses[0], (0, 0x0010_0000 - 0x0000_1000));
    assert_eq!(target.load_addresses[1], (1, 0x0020_0000));
    assert_eq!(target.load_addresses.len(), 2);

    // the un-indexed module was skipped, the indexed one added with no
    // symbol file, since only the executable had a dSYM
    assert_eq!(target.modules.len(), 2);
    let cached_lib = fixture
        .roots
        .cache_root
        .join(uuid_path(LIB_UUID).unwrap())
        .join("libfoo.dylib");
    assert_eq!(target.modules[1].0, cached_lib);
    assert_eq!(target.modules[1].1, None);

    // two LC_THREADs in the core, the announced one selected
    assert_eq!(target.threads, 2);
    assert_eq!(target.selected_thread, Some(0));

    // the executable's dSYM bundle was cached whole
    let cached_dsym = fixture
        .roots
        .cache_root
        .join(uuid_path(EXE_UUID).unwrap())
        .join("Thing.dSYM");
    assert!(cached_dsym.join("Contents/Resources/DWARF/Thing").exists());
}

#[test]
fn mount_source_mode_does_not_disturb_assembly() {
    // osascript is unavailable off-mac; mounting must stay best-effort
    let fixture = build_fixture();

    let assembled = TargetAssembler::new(FakeEngine::default(), &fixture.roots, true)
        .assemble(&fixture.archive)
        .unwrap();

    assert_eq!(assembled.target.selected_thread, Some(0));
}

#[test]
fn executable_not_first_is_rejected_before_resolution() {
    let fixture = build_fixture();

    let envelope = "<?xml version=\"1.0\" encoding=\"UTF-8\" standalone=\"yes\"?><root>\
        <PersistentType><m_strExecutable>Bar</m_strExecutable>\
        <m_strBundleVersion></m_strBundleVersion><m_nThread val=\"0\"/>\
        <m_vecmodule length=\"1\"><elem><m_pvStartAddress val=\"4096\"/>\
        <m_strPath>libFoo.dylib</m_strPath><m_modver val=\"0\"/>\
        <m_uuid val=\"c4cbd2cf-39d5-3185-851e-85c7dd2f8c7f\"/></elem>\
        </m_vecmodule></PersistentType></root>";
    let archive = pack_raw(envelope.as_bytes());

    let result = TargetAssembler::new(FakeEngine::default(), &fixture.roots, false)
        .assemble(&archive);
    assert!(matches!(result, Err(Error::LoadFailed(_))));
    fs::remove_file(archive).unwrap();
}

#[test]
fn malformed_uuid_makes_later_failures_ignorable() {
    let fixture = build_fixture();

    // module 0 is valid but unindexed, module 1 carries a 35-char uuid
    let envelope = format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\" standalone=\"yes\"?><root>\
         <PersistentType><m_strExecutable>Thing</m_strExecutable>\
         <m_strBundleVersion></m_strBundleVersion><m_nThread val=\"0\"/>\
         <m_vecmodule length=\"2\">\
         <elem><m_pvStartAddress val=\"4096\"/><m_strPath>/App/Thing</m_strPath>\
         <m_modver val=\"0\"/><m_uuid val=\"{}\"/></elem>\
         <elem><m_pvStartAddress val=\"8192\"/><m_strPath>/usr/lib/libodd.dylib</m_strPath>\
         <m_modver val=\"0\"/><m_uuid val=\"{}\"/></elem>\
         </m_vecmodule></PersistentType></root>",
        LOST_UUID.to_lowercase(),
        &LIB_UUID.to_lowercase()[1..], // 35 characters
    );
    let archive = pack_raw(envelope.as_bytes());

    let err = TargetAssembler::new(FakeEngine::default(), &fixture.roots, false)
        .assemble(&archive)
        .unwrap_err();
    assert!(err.is_ignorable());
    assert!(matches!(err, Error::LoadFailedIgnorable(_)));
    fs::remove_file(archive).unwrap();
}

#[test]
fn crashed_thread_out_of_bounds_is_fatal() {
    let fixture = build_fixture();

    // take a good artifact apart, blame a thread the core does not have,
    // and pack it back up
    let raw = fs::read(&fixture.archive).unwrap();
    let mut entry = Vec::new();
    zip::ZipArchive::new(Cursor::new(raw))
        .unwrap()
        .by_name(opendump::DUMP_ENTRY_NAME)
        .map(|mut entry_file| std::io::Read::read_to_end(&mut entry_file, &mut entry).unwrap())
        .unwrap();

    let needle = b"<m_nThread val=\"0\"/>".as_slice();
    let at = entry
        .windows(needle.len())
        .position(|window| window == needle)
        .unwrap();
    entry.splice(at..at + needle.len(), b"<m_nThread val=\"9\"/>".iter().copied());

    let repacked = pack_raw(&entry);
    let result =
        TargetAssembler::new(FakeEngine::default(), &fixture.roots, false).assemble(&repacked);
    assert!(matches!(result, Err(Error::LoadFailed(_))));
    fs::remove_file(repacked).unwrap();
}

/// Zips arbitrary bytes as a dump artifact.
fn pack_raw(contents: &[u8]) -> PathBuf {
    let mut raw = tempfile::NamedTempFile::new().unwrap();
    raw.write_all(contents).unwrap();
    dump_writer::pack_dump(raw.path()).unwrap()
}
