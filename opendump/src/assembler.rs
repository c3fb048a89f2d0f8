//! Reconstruction of a debugger target from a dump artifact: resolve every
//! module's binary and symbols through the indexes and the cache, feed the
//! core to the engine, and put every module back at its recorded address.

use crate::{
    cache::cache_file,
    engine::{DebuggerEngine, DebuggerTarget, TARGET_TRIPLE},
    errors::Error,
    index::{uuid_path, SymbolIndex, UuidIndex},
    meta::DumpArtifact,
    roots::Roots,
};
use std::{
    io::Write,
    path::{Path, PathBuf},
    process::Command,
};

/// How many trailing path components separate a `.dSYM` bundle from the
/// DWARF file inside it: `Contents/Resources/DWARF/<leaf>`.
const DSYM_INNER_COMPONENTS: usize = 4;

/// What module resolution found; either side can be empty.
#[derive(Default)]
struct ResolvedModule {
    binary: Option<PathBuf>,
    symbols: Option<PathBuf>,
}

/// The assembled session, ready to hand to the interactive debugger.
pub struct Assembled<E: DebuggerEngine> {
    pub engine: E,
    pub target: E::Target,
    /// Whether failures were of the ignorable class (a malformed uuid was
    /// seen in the envelope)
    pub ignorable: bool,
}

impl<E: DebuggerEngine> std::fmt::Debug for Assembled<E>
where
    E: std::fmt::Debug,
    E::Target: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Assembled")
            .field("engine", &self.engine)
            .field("target", &self.target)
            .field("ignorable", &self.ignorable)
            .finish()
    }
}

/// Drives one dump through resolution and into a configured engine target.
pub struct TargetAssembler<'roots, E: DebuggerEngine> {
    engine: E,
    roots: &'roots Roots,
    uuid_index: UuidIndex,
    symbol_index: SymbolIndex,
    mount_source: bool,
    /// Set once a malformed uuid shows up; from then on fatal failures are
    /// reported as the ignorable kind, since early writer versions are
    /// known to have produced such envelopes
    ignorable: bool,
}

impl<'roots, E: DebuggerEngine> TargetAssembler<'roots, E> {
    pub fn new(engine: E, roots: &'roots Roots, mount_source: bool) -> Self {
        Self {
            engine,
            uuid_index: UuidIndex::new(&roots.uuid_root),
            symbol_index: SymbolIndex::new(&roots.symbol_root),
            roots,
            mount_source,
            ignorable: false,
        }
    }

    /// Loads the artifact at `dump` and builds the debugger target.
    pub fn assemble(mut self, dump: &Path) -> Result<Assembled<E>, Error> {
        let artifact = DumpArtifact::read(dump)?;
        let meta = &artifact.meta;

        // Early writer versions are known to have emitted envelopes with
        // broken uuids. One bad uuid anywhere marks every fatal failure of
        // this session as the ignorable kind.
        for module in &meta.modules {
            if crate::index::validate_uuid(&module.uuid).is_err() {
                log::warn!("read invalid uuid {:?} from the envelope", module.uuid);
                self.ignorable = true;
            }
        }

        // The executable name in the envelope is redundant; the executable
        // is always the first enumerated module. Anything else means the
        // writer was broken.
        let executable = &meta.modules[0];
        if !executable.path.ends_with(&meta.executable_path) {
            return Err(self.load_failed("the executable is not the first module"));
        }

        let resolved = self.resolve_module(&executable.uuid);
        let Some(binary) = resolved.binary else {
            log::error!(
                "No binary found for {} while looking for executable {}",
                executable.uuid,
                executable.path
            );
            return Err(self.load_failed("no binary for the executable"));
        };

        log::info!("debugging dump with executable {}", binary.display());

        // Keep the engine from scanning symbol tables eagerly or asking
        // external symbol servers about uuids we deliberately withhold.
        self.engine.set_variable("target.preload-symbols", "false")?;
        self.engine
            .set_variable("symbols.enable-external-lookup", "false")?;

        let mut target = self
            .engine
            .create_target(&binary, TARGET_TRIPLE, /*add_dependent_modules*/ false)?;

        // The engine wants the core as a standalone file: everything after
        // the envelope, starting with the mach header. The scratch file is
        // removed again no matter how loading goes.
        {
            let mut scratch = tempfile::NamedTempFile::new()?;
            scratch.write_all(&artifact.core)?;
            scratch.as_file_mut().sync_all()?;
            target.load_core(scratch.path())?;
        }

        // Only the executable may have been auto-loaded.
        if target.num_modules() != 1 {
            return Err(self.load_failed("the core pulled in unexpected modules"));
        }

        {
            let module = target.module_at(0)?;
            let header = target.header_file_address(&module)?;
            let slide = executable.start_address.wrapping_sub(header);
            target.set_module_load_address(&module, slide)?;
        }

        if meta.crashed_thread >= target.num_threads() {
            return Err(self.load_failed("crashed thread index out of bounds"));
        }
        target.select_thread(meta.crashed_thread)?;

        // Everything after index 0 is resolved on a best-effort basis; a
        // module nobody can find anymore just stays unsymbolized.
        for module_meta in &meta.modules[1..] {
            let resolved = self.resolve_module(&module_meta.uuid);
            let Some(binary) = resolved.binary else {
                log::warn!(
                    "No binary found for {} while looking for {} {}",
                    module_meta.uuid,
                    module_meta.path,
                    module_meta.version
                );
                continue;
            };

            match target.add_module(&binary, TARGET_TRIPLE, resolved.symbols.as_deref())? {
                Some(module) => {
                    target.set_module_load_address(&module, module_meta.start_address)?;
                }
                None => {
                    log::warn!("the engine could not load module {}", binary.display());
                }
            }
        }

        Ok(Assembled {
            engine: self.engine,
            target,
            ignorable: self.ignorable,
        })
    }

    /// The fatal-error kind for this session, see the `ignorable` field.
    fn load_failed(&self, why: &'static str) -> Error {
        if self.ignorable {
            Error::LoadFailedIgnorable(why)
        } else {
            Error::LoadFailed(why)
        }
    }

    /// Maps a module uuid to its locally cached binary and symbol file.
    ///
    /// Resolution never fails the session: a malformed uuid flips the
    /// session's ignorable flag, and everything else that goes wrong just
    /// leaves the module (or its symbols) unresolved.
    fn resolve_module(&mut self, uuid: &str) -> ResolvedModule {
        // The envelope renders uuids lowercase; the indexes are keyed by
        // the canonical uppercase rendering.
        let uuid = uuid.to_ascii_uppercase();

        let relative = match self.uuid_index.lookup(&uuid) {
            Ok(Some(relative)) => relative,
            Ok(None) => return ResolvedModule::default(),
            Err(Error::MalformedUuid(bad)) => {
                log::warn!("read invalid uuid {bad:?} from the envelope");
                self.ignorable = true;
                return ResolvedModule::default();
            }
            Err(err) => {
                log::warn!("uuid index lookup for {uuid} failed: {err}");
                return ResolvedModule::default();
            }
        };

        let binary_source = self.roots.mount_root.join(&relative);
        let Some(binary_leaf) = binary_source.file_name().map(std::ffi::OsStr::to_owned) else {
            log::warn!("uuid index entry for {uuid} has no file name: {relative:?}");
            return ResolvedModule::default();
        };

        // uuid_path cannot fail past the validation in lookup
        let cache_dir = match uuid_path(&uuid) {
            Ok(subpath) => self.roots.cache_root.join(subpath),
            Err(_err) => return ResolvedModule::default(),
        };

        let symbols = self.resolve_symbols(&uuid, &cache_dir, &binary_leaf);

        let binary = match cache_file(&binary_source, &cache_dir.join(&binary_leaf)) {
            Ok(binary) => binary,
            Err(err) => {
                log::warn!("failed to cache {}: {err}", binary_source.display());
                None
            }
        };

        ResolvedModule { binary, symbols }
    }

    /// Looks up the symbol entry for `uuid`, optionally mounts its source
    /// tree, caches the whole `.dSYM` bundle, and returns the path of the
    /// DWARF file inside the cached bundle.
    fn resolve_symbols(
        &mut self,
        uuid: &str,
        cache_dir: &Path,
        binary_leaf: &std::ffi::OsStr,
    ) -> Option<PathBuf> {
        let entry = match self.symbol_index.lookup(uuid) {
            Ok(Some(entry)) => entry,
            Ok(None) => return None,
            Err(err) => {
                log::warn!("symbol index lookup for {uuid} failed: {err}");
                return None;
            }
        };

        if self.mount_source {
            self.mount_source_tree(&entry.source_mount);
        }

        // ~/…/Thing.app.dSYM/Contents/Resources/DWARF/Thing
        //    └ bundle ──────┘└────── inner suffix ───────┘
        let inner = Path::new(&entry.dwarf_path);
        let components: Vec<_> = inner.components().collect();
        if components.len() <= DSYM_INNER_COMPONENTS {
            log::warn!("symbol entry for {uuid} is too shallow: {:?}", entry.dwarf_path);
            return None;
        }
        let bundle: PathBuf = components[..components.len() - DSYM_INNER_COMPONENTS]
            .iter()
            .copied()
            .collect();
        let suffix: PathBuf = components[components.len() - DSYM_INNER_COMPONENTS..]
            .iter()
            .copied()
            .collect();

        // '~' -> the caller's home
        let bundle_source = self
            .roots
            .home
            .join(bundle.strip_prefix("~").unwrap_or(&bundle));

        let mut cached_name = binary_leaf.to_owned();
        cached_name.push(".dSYM");

        match cache_file(&bundle_source, &cache_dir.join(&cached_name)) {
            Ok(Some(cached_bundle)) => Some(cached_bundle.join(suffix)),
            Ok(None) => None,
            Err(err) => {
                log::warn!("failed to cache {}: {err}", bundle_source.display());
                None
            }
        }
    }

    /// Asks Finder to mount the source tree this build came from, so the
    /// debugger can show source. Best effort; a failed mount only costs
    /// source listings.
    fn mount_source_tree(&self, source_mount: &str) {
        let volume = mount_volume_command(&self.roots.source_server, source_mount);

        match Command::new("/usr/bin/osascript")
            .args(["-s", "o", "-e", &volume])
            .status()
        {
            Ok(status) if status.success() => {}
            Ok(status) => log::warn!("osascript mount exited with {status}"),
            Err(err) => log::warn!("failed to run osascript: {err}"),
        }
    }
}

/// The AppleScript one-liner that mounts a source tree.
fn mount_volume_command(source_server: &str, source_mount: &str) -> String {
    format!(
        "mount volume \"{source_server}{}\"",
        source_mount.trim_start_matches('~')
    )
}
