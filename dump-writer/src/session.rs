//! The top of the writer: owns the received [`DumpContext`] and turns the
//! target into an archived dump artifact.

use crate::{
    archive,
    corefile::{self, DumpContents},
    errors::Error,
    mach::mach_call,
    regions,
    task_dumper::TaskDumper,
};
use dump_context::{ipc::DumpContext, TaskHandle};
use mach2::{kern_return::KERN_SUCCESS, mach_types::task_t};
use std::{ffi::CStr, io::Read, io::Write, path::PathBuf, time::Duration};

/// A dump session for one captured target.
pub struct DumpSession {
    context: DumpContext,
}

impl DumpSession {
    pub fn new(context: DumpContext) -> Self {
        Self { context }
    }

    /// Completes the rendezvous on `channel` (under the given bootstrap
    /// service name) and wraps the resulting context in a session.
    pub fn receive(
        channel: &mut (impl Read + Write),
        service_name: &CStr,
        recv_timeout: Option<Duration>,
    ) -> Result<Self, Error> {
        Ok(Self::new(DumpContext::receive(
            channel,
            service_name,
            recv_timeout,
        )?))
    }

    /// The send right on the target task.
    pub fn task(&self) -> &TaskHandle {
        &self.context.task
    }

    /// Serializes the target into `<envelope><MH_CORE>` and packs that into
    /// a single-entry archive, whose path is returned. The caller owns the
    /// archive file and should delete it after delivery.
    ///
    /// The target is frozen for the whole capture and resumed again on
    /// every exit path, including failures. With `big` set every walked
    /// region's bytes are carried; otherwise only stacks are (see
    /// [`regions::is_mapped`]).
    pub fn write_dump(&self, big: bool) -> Result<PathBuf, Error> {
        let task = self.context.task.raw();

        mach_call!(mach2::task::task_suspend(task))?;
        let _resume = ResumeGuard { task };

        let mut dumper = TaskDumper::new(task);

        let (threads, crashed_thread) = dumper.sample_threads(self.context.thread_id)?;
        let modules = dumper.enumerate_images()?;

        let mut walked = Vec::new();
        dumper.for_each_region(|region| walked.push(region))?;
        let segments = regions::classify(walked, big, &threads);

        log::debug!(
            "capturing {} threads, {} modules, {} mapped / {} unmapped segments",
            threads.len(),
            modules.len(),
            segments.mapped.len(),
            segments.unmapped.len(),
        );

        let mut scratch = tempfile::NamedTempFile::new()?;
        corefile::write_dump(
            scratch.as_file_mut(),
            DumpContents {
                build: env!("CARGO_PKG_VERSION"),
                executable_path: &self.context.executable_path,
                bundle_version: &self.context.bundle_version,
                crashed_thread,
                modules: &modules,
                threads: &threads,
                segments,
            },
            &mut dumper,
        )?;
        scratch.as_file_mut().sync_all()?;

        // the raw dump is deleted when `scratch` drops; only the archive
        // leaves this function
        archive::pack_dump(scratch.path())
    }
}

/// Resumes the target when the capture scope ends, success or not.
struct ResumeGuard {
    task: task_t,
}

impl Drop for ResumeGuard {
    fn drop(&mut self) {
        // SAFETY: syscall
        let kr = unsafe { mach2::task::task_resume(self.task) };
        if kr != KERN_SUCCESS {
            log::error!("failed to resume the target task: {kr:#x}");
        }
    }
}
