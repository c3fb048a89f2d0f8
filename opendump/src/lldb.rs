//! The real debugger engine: a shim over LLDB's SB API, kept as thin as
//! possible since everything interesting happens behind the
//! [`DebuggerEngine`] seam. Compiled only with the `lldb` feature, which
//! requires a liblldb to link against.

#![allow(unsafe_code)]

use crate::{
    engine::{DebuggerEngine, DebuggerTarget, RuntimeRefCount},
    errors::Error,
};
use lldb_sys as sys;
use std::{
    ffi::{CStr, CString},
    os::raw::c_char,
    path::Path,
};

/// LLDB has process-wide init/teardown; see `SBDebugger::Initialize`.
static RUNTIME: RuntimeRefCount = RuntimeRefCount::new();

pub struct LldbEngine {
    debugger: sys::SBDebuggerRef,
}

impl LldbEngine {
    pub fn new() -> Self {
        RUNTIME.acquire(|| unsafe {
            sys::SBDebuggerInitialize();
        });
        Self {
            // no .lldbinit surprises inside a dump session
            debugger: unsafe { sys::SBDebuggerCreate2(false) },
        }
    }
}

impl Default for LldbEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for LldbEngine {
    fn drop(&mut self) {
        unsafe {
            sys::SBDebuggerDestroy(self.debugger);
        }
        RUNTIME.release(|| unsafe {
            sys::SBDebuggerTerminate();
        });
    }
}

impl DebuggerEngine for LldbEngine {
    type Target = LldbTarget;

    fn set_variable(&mut self, name: &str, value: &str) -> Result<(), Error> {
        let command = cstring(&format!("settings set {name} {value}"))?;
        unsafe {
            sys::SBDebuggerHandleCommand(self.debugger, command.as_ptr());
        }
        Ok(())
    }

    fn create_target(
        &mut self,
        executable: &Path,
        triple: &str,
        add_dependent_modules: bool,
    ) -> Result<Self::Target, Error> {
        let executable = path_cstring(executable)?;
        let triple = cstring(triple)?;

        let target = unsafe {
            let error = sys::CreateSBError();
            let target = sys::SBDebuggerCreateTarget(
                self.debugger,
                executable.as_ptr(),
                triple.as_ptr(),
                std::ptr::null(),
                add_dependent_modules,
                error,
            );
            let outcome = check(error, "CreateTarget");
            sys::DisposeSBError(error);
            outcome?;
            target
        };

        if unsafe { !sys::SBTargetIsValid(target) } {
            return Err(Error::Engine("the engine produced an invalid target".into()));
        }

        Ok(LldbTarget {
            target,
            process: std::ptr::null_mut(),
        })
    }

    fn execute_command(&mut self, command: &str) {
        if let Ok(command) = cstring(command) {
            unsafe {
                sys::SBDebuggerHandleCommand(self.debugger, command.as_ptr());
            }
        }
    }

    fn run_command_interpreter(&mut self) {
        unsafe {
            sys::SBDebuggerRunCommandInterpreter(self.debugger, true, false);
        }
    }
}

pub struct LldbTarget {
    target: sys::SBTargetRef,
    process: sys::SBProcessRef,
}

impl DebuggerTarget for LldbTarget {
    type Module = sys::SBModuleRef;

    fn load_core(&mut self, core: &Path) -> Result<(), Error> {
        let core = path_cstring(core)?;
        let process = unsafe { sys::SBTargetLoadCore(self.target, core.as_ptr()) };
        if process.is_null() || unsafe { !sys::SBProcessIsValid(process) } {
            return Err(Error::Engine("the engine rejected the core file".into()));
        }
        self.process = process;
        Ok(())
    }

    fn num_modules(&self) -> usize {
        unsafe { sys::SBTargetGetNumModules(self.target) as usize }
    }

    fn module_at(&self, index: usize) -> Result<Self::Module, Error> {
        let module = unsafe { sys::SBTargetGetModuleAtIndex(self.target, index as u32) };
        if module.is_null() {
            return Err(Error::Engine(format!("no module at index {index}")));
        }
        Ok(module)
    }

    fn header_file_address(&self, module: &Self::Module) -> Result<u64, Error> {
        unsafe {
            let address = sys::SBModuleGetObjectFileHeaderAddress(*module);
            let file_address = sys::SBAddressGetFileAddress(address);
            sys::DisposeSBAddress(address);
            Ok(file_address)
        }
    }

    fn set_module_load_address(&mut self, module: &Self::Module, slide: u64) -> Result<(), Error> {
        unsafe {
            let error = sys::SBTargetSetModuleLoadAddress(self.target, *module, slide as i64);
            let outcome = check(error, "SetModuleLoadAddress");
            sys::DisposeSBError(error);
            outcome
        }
    }

    fn add_module(
        &mut self,
        path: &Path,
        triple: &str,
        symbol_file: Option<&Path>,
    ) -> Result<Option<Self::Module>, Error> {
        let path = path_cstring(path)?;
        let triple = cstring(triple)?;
        let symbol_file = symbol_file.map(path_cstring).transpose()?;

        let module = unsafe {
            sys::SBTargetAddModule2(
                self.target,
                path.as_ptr(),
                triple.as_ptr(),
                // no uuid on purpose: with one set the engine would go
                // looking through its own global module caches
                std::ptr::null(),
                symbol_file
                    .as_ref()
                    .map_or(std::ptr::null(), |symbols| symbols.as_ptr()),
            )
        };

        if module.is_null() || unsafe { !sys::SBModuleIsValid(module) } {
            return Ok(None);
        }
        Ok(Some(module))
    }

    fn num_threads(&self) -> usize {
        if self.process.is_null() {
            return 0;
        }
        unsafe { sys::SBProcessGetNumThreads(self.process) as usize }
    }

    fn select_thread(&mut self, index: usize) -> Result<(), Error> {
        unsafe {
            let thread = sys::SBProcessGetThreadAtIndex(self.process, index);
            if thread.is_null() {
                return Err(Error::Engine(format!("no thread at index {index}")));
            }
            sys::SBProcessSetSelectedThread(self.process, thread);
            sys::DisposeSBThread(thread);
        }
        Ok(())
    }
}

/// Turns an `SBError` into a `Result`, capturing the engine's message.
unsafe fn check(error: sys::SBErrorRef, what: &str) -> Result<(), Error> {
    if sys::SBErrorSuccess(error) {
        return Ok(());
    }
    let message = sys::SBErrorGetCString(error);
    let message = if message.is_null() {
        "unknown engine failure".to_owned()
    } else {
        cstr_lossy(message)
    };
    Err(Error::Engine(format!("{what}: {message}")))
}

fn cstr_lossy(raw: *const c_char) -> String {
    // SAFETY: the engine hands out nul-terminated strings
    unsafe { CStr::from_ptr(raw) }.to_string_lossy().into_owned()
}

fn cstring(text: &str) -> Result<CString, Error> {
    CString::new(text).map_err(|_err| Error::Engine("string contains a nul byte".into()))
}

fn path_cstring(path: &Path) -> Result<CString, Error> {
    use std::os::unix::ffi::OsStrExt;
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_err| Error::Engine("path contains a nul byte".into()))
}
