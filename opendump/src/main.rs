//! `opendump <path-to-dump-file>` — resolve an archived minidump and drop
//! into the interactive debugger on it.

use opendump::{engine::DebuggerEngine, lldb::LldbEngine, Roots, TargetAssembler};
use std::path::Path;

fn main() -> std::process::ExitCode {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let Some(dump) = args.next() else {
        eprintln!("Syntax: opendump <path to Mac dump file>");
        return std::process::ExitCode::FAILURE;
    };

    let dump = Path::new(&dump);
    if !dump.is_file() {
        eprintln!("[FAILURE] {} does not exist.", dump.display());
        return std::process::ExitCode::FAILURE;
    }

    let roots = match Roots::from_env() {
        Ok(roots) => roots,
        Err(err) => {
            eprintln!("[FAILURE] {err}");
            return std::process::ExitCode::FAILURE;
        }
    };

    // The interpreter inherits our standard streams; put them back to
    // ordinary line buffering first.
    line_buffer_stdio();

    let assembler = TargetAssembler::new(LldbEngine::new(), &roots, /*mount_source*/ true);
    let mut session = match assembler.assemble(dump) {
        Ok(session) => session,
        Err(err) => {
            eprintln!("[FAILURE] {err}");
            return std::process::ExitCode::FAILURE;
        }
    };

    session.engine.execute_command("bt");
    session.engine.run_command_interpreter();

    std::process::ExitCode::SUCCESS
}

extern "C" {
    #[cfg_attr(target_os = "macos", link_name = "__stdinp")]
    static mut stdin: *mut libc::FILE;
    #[cfg_attr(target_os = "macos", link_name = "__stdoutp")]
    static mut stdout: *mut libc::FILE;
    #[cfg_attr(target_os = "macos", link_name = "__stderrp")]
    static mut stderr: *mut libc::FILE;
}

/// Reverts stdin/stdout/stderr to line buffering before the debugger takes
/// them over.
#[allow(unsafe_code)]
fn line_buffer_stdio() {
    // SAFETY: libc stream calls on the process's own standard streams
    unsafe {
        for stream in [stdin, stdout, stderr] {
            if libc::setvbuf(
                stream,
                std::ptr::null_mut(),
                libc::_IOLBF,
                libc::BUFSIZ as usize,
            ) != 0
            {
                eprintln!("[FAILURE] could not reset stream buffering");
            }
        }
    }
}
