//! The seam between the reader and the embedded debugger engine.
//!
//! The assembler only ever talks to these two traits, so everything up to
//! the final hand-off can run against a recording fake; the real engine
//! binding lives behind the `lldb` feature.

use crate::errors::Error;
use std::path::Path;

/// The target triple every dump this reader handles was captured under.
pub const TARGET_TRIPLE: &str = "x86_64-apple-macosx";

/// A debugger instance.
pub trait DebuggerEngine {
    type Target: DebuggerTarget;

    /// Sets a debugger-wide variable such as `target.preload-symbols`.
    fn set_variable(&mut self, name: &str, value: &str) -> Result<(), Error>;

    /// Creates an empty target for `executable` without loading dependent
    /// modules.
    fn create_target(
        &mut self,
        executable: &Path,
        triple: &str,
        add_dependent_modules: bool,
    ) -> Result<Self::Target, Error>;

    /// Runs one debugger command, eg an initial backtrace.
    fn execute_command(&mut self, command: &str);

    /// Hands the console to the interactive command interpreter until the
    /// user quits.
    fn run_command_interpreter(&mut self);
}

/// A debugger target under construction.
pub trait DebuggerTarget {
    /// Opaque module handle.
    type Module;

    /// Loads a core file into the target, creating its process.
    fn load_core(&mut self, core: &Path) -> Result<(), Error>;

    /// Modules currently known to the target.
    fn num_modules(&self) -> usize;

    /// The module at `index` in the target's module list.
    fn module_at(&self, index: usize) -> Result<Self::Module, Error>;

    /// The file address of the module's object file header, needed to turn
    /// a recorded runtime address into a load slide.
    fn header_file_address(&self, module: &Self::Module) -> Result<u64, Error>;

    /// Slides every section of `module` by `slide`.
    fn set_module_load_address(&mut self, module: &Self::Module, slide: u64) -> Result<(), Error>;

    /// Adds a module from `path`, with an optional explicit symbol file and
    /// deliberately no uuid, so the engine does not go looking in its own
    /// global caches. Returns `None` when the engine rejects the file,
    /// which degrades that one module rather than the session.
    fn add_module(
        &mut self,
        path: &Path,
        triple: &str,
        symbol_file: Option<&Path>,
    ) -> Result<Option<Self::Module>, Error>;

    /// Threads of the loaded core's process.
    fn num_threads(&self) -> usize;

    /// Selects the thread the debugger should present first.
    fn select_thread(&mut self, index: usize) -> Result<(), Error>;
}

/// Reference-counted init/teardown for engines with process-global state.
/// The first session initializes the runtime, the last one to go away
/// tears it down.
pub struct RuntimeRefCount {
    count: parking_lot::Mutex<usize>,
}

impl RuntimeRefCount {
    pub const fn new() -> Self {
        Self {
            count: parking_lot::Mutex::new(0),
        }
    }

    pub fn acquire(&self, init: impl FnOnce()) {
        let mut count = self.count.lock();
        if *count == 0 {
            init();
        }
        *count += 1;
    }

    pub fn release(&self, teardown: impl FnOnce()) {
        let mut count = self.count.lock();
        debug_assert!(*count > 0);
        *count -= 1;
        if *count == 0 {
            teardown();
        }
    }
}

impl Default for RuntimeRefCount {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::RuntimeRefCount;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn runtime_initializes_once_and_tears_down_last() {
        let refcount = RuntimeRefCount::new();
        let inits = AtomicUsize::new(0);
        let teardowns = AtomicUsize::new(0);

        refcount.acquire(|| {
            inits.fetch_add(1, Ordering::Relaxed);
        });
        refcount.acquire(|| {
            inits.fetch_add(1, Ordering::Relaxed);
        });
        assert_eq!(inits.load(Ordering::Relaxed), 1);

        refcount.release(|| {
            teardowns.fetch_add(1, Ordering::Relaxed);
        });
        assert_eq!(teardowns.load(Ordering::Relaxed), 0);

        refcount.release(|| {
            teardowns.fetch_add(1, Ordering::Relaxed);
        });
        assert_eq!(teardowns.load(Ordering::Relaxed), 1);

        // a later session starts the runtime again
        refcount.acquire(|| {
            inits.fetch_add(1, Ordering::Relaxed);
        });
        assert_eq!(inits.load(Ordering::Relaxed), 2);
        refcount.release(|| {
            teardowns.fetch_add(1, Ordering::Relaxed);
        });
    }
}
