//! Moving a task send right between processes has to go through mach ports:
//! `mach_task_self` is a special handle that is only translated into the
//! "actual" task when the kernel carries it to another process inside a port
//! descriptor. The byte channel the embedder gives us is used purely for the
//! [`Announcement`] and for agreeing on the bootstrap service name; the task
//! right itself rides a single complex mach message.
//!
//! The service name is a caller-supplied parameter. Pick one unique to your
//! application (and prefix it with your application group identifier when
//! running sandboxed), since bootstrap names are a global namespace.

#![allow(unsafe_code)]

use crate::Announcement;
use mach2::{
    bootstrap, kern_return::KERN_SUCCESS, mach_port, message as msg, port, task,
    traps::mach_task_self,
};
pub use mach2::{kern_return::kern_return_t, message::mach_msg_return_t};
use std::{
    ffi::{CStr, CString},
    io::{Read, Write},
    time::Duration,
};

extern "C" {
    /// From <usr/include/mach/mach_traps.h>, there is no binding for this in mach2
    pub fn pid_for_task(task: port::mach_port_name_t, pid: *mut i32) -> kern_return_t;
}

/// An error that can occur while transferring the task right
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A kernel error will generally indicate an error occurred while creating
    /// or modifying a mach port
    #[error("kernel error {0:#x}")]
    Kernel(kern_return_t),
    /// A message error indicates an error occurred while sending or receiving
    /// a message on a mach port
    #[error("mach message error {0:#x}")]
    Message(mach_msg_return_t),
    /// The byte channel failed, or the peer hung up mid-frame
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// The service name exchanged over the channel contained a nul byte
    #[error("the bootstrap service name is invalid")]
    InvalidServiceName,
}

macro_rules! kern {
    ($call:expr) => {{
        let res = $call;

        if res != KERN_SUCCESS {
            return Err(Error::Kernel(res));
        }
    }};
}

macro_rules! mmsg {
    ($call:expr) => {{
        let res = $call;

        if res != msg::MACH_MSG_SUCCESS {
            return Err(Error::Message(res));
        }
    }};
}

/// The message that carries the task right. A single contiguous struct since
/// that is what `mach_msg` wants; the port descriptor is rewritten by the
/// kernel into a name that is valid in the receiving task.
#[repr(C)]
struct TaskTransferMessage {
    head: msg::mach_msg_header_t,
    /// When providing port descriptors, this must be present to say how many
    /// of them follow the header
    body: msg::mach_msg_body_t,
    /// The task whose dump is being requested, ie `mach_task_self` on the
    /// sending side
    task: msg::mach_msg_port_descriptor_t,
}

/// Every received message gets a trailer appended by the kernel, so the
/// receive buffer needs room for it
#[repr(C)]
struct ReceivedTaskTransferMessage {
    msg: TaskTransferMessage,
    trailer: msg::mach_msg_trailer_t,
}

/// Owns a send right on a target task. The right is given back to the kernel
/// when the handle is dropped.
pub struct TaskHandle {
    port: port::mach_port_t,
}

impl TaskHandle {
    /// The raw port name, for handing to mach syscalls.
    #[inline]
    pub fn raw(&self) -> port::mach_port_t {
        self.port
    }

    /// The pid of the task this handle refers to, via `pid_for_task`.
    pub fn pid(&self) -> Result<i32, Error> {
        let mut pid = 0;
        // SAFETY: syscall
        unsafe {
            kern!(pid_for_task(self.port, &mut pid));
        }
        Ok(pid)
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        // SAFETY: syscall
        unsafe {
            mach_port::mach_port_deallocate(mach_task_self(), self.port);
        }
    }
}

/// Everything the collector knows about a target after a completed
/// rendezvous: who it is, which thread it considers crashed, and a send
/// right on its task.
pub struct DumpContext {
    /// Send right on the target task
    pub task: TaskHandle,
    /// The thread the dump should mark as crashed
    pub thread_id: u64,
    /// Path of the target's main executable
    pub executable_path: Vec<u8>,
    /// The target's bundle version, empty if it is not a bundle
    pub bundle_version: String,
}

/// The id of the calling thread as reported by
/// `thread_info(THREAD_IDENTIFIER_INFO)`, ie the value a target puts in its
/// [`Announcement`] when the dump should blame the current thread.
pub fn current_thread_id() -> Result<u64, Error> {
    // SAFETY: syscalls. Surprisingly, the port returned by mach_thread_self
    // must be deallocated, as opposed to the one from mach_task_self
    unsafe {
        let thread = mach2::mach_init::mach_thread_self();

        let mut info: libc::thread_identifier_info = std::mem::zeroed();
        let mut count = libc::THREAD_IDENTIFIER_INFO_COUNT;
        let kr = libc::thread_info(
            thread,
            libc::THREAD_IDENTIFIER_INFO as u32,
            (&mut info as *mut libc::thread_identifier_info).cast(),
            &mut count,
        );

        mach_port::mach_port_deallocate(mach_task_self(), thread);

        if kr != KERN_SUCCESS {
            return Err(Error::Kernel(kr));
        }

        Ok(info.thread_id)
    }
}

/// Target side of the rendezvous.
///
/// Writes the announcement to the channel, waits for the collector to reply
/// with the bootstrap service name it checked in under, looks that service
/// up, and sends a `COPY_SEND` of our own task port to it. The copy means
/// this process keeps full use of `mach_task_self`.
///
/// A `None` timeout blocks in `mach_msg` until the collector picks the
/// message up.
pub fn deliver_task(
    channel: &mut (impl Read + Write),
    announcement: &Announcement,
    send_timeout: Option<Duration>,
) -> Result<(), Error> {
    announcement.write_to(channel)?;

    // Wait for the collector to signal that it has set up the bootstrap
    // port. bootstrap_look_up never seems to fail once that has happened.
    let name_bytes = crate::read_prefixed(channel)?;
    let service_name = CString::new(name_bytes).map_err(|_err| Error::InvalidServiceName)?;

    // SAFETY: syscalls. The user has no invariants to uphold, hence the
    // unsafe not being on the function as a whole
    unsafe {
        let mut task_bootstrap_port = 0;
        kern!(task::task_get_special_port(
            mach_task_self(),
            task::TASK_BOOTSTRAP_PORT,
            &mut task_bootstrap_port
        ));

        let mut service_port = 0;
        kern!(bootstrap::bootstrap_look_up(
            task_bootstrap_port,
            service_name.as_ptr(),
            &mut service_port
        ));
        let service_port = ScopedRight::deallocate(service_port);

        let (timeout_flag, timeout) = send_timeout.map_or((0, msg::MACH_MSG_TIMEOUT_NONE), |t| {
            (msg::MACH_SEND_TIMEOUT, t.as_millis() as u32)
        });

        let mut message = TaskTransferMessage {
            head: msg::mach_msg_header_t {
                msgh_bits: msg::MACH_MSG_TYPE_COPY_SEND | msg::MACH_MSGH_BITS_COMPLEX,
                msgh_size: std::mem::size_of::<TaskTransferMessage>() as u32,
                msgh_remote_port: service_port.name,
                msgh_local_port: port::MACH_PORT_NULL,
                msgh_voucher_port: port::MACH_PORT_NULL,
                msgh_id: 0,
            },
            body: msg::mach_msg_body_t {
                msgh_descriptor_count: 1,
            },
            task: msg::mach_msg_port_descriptor_t::new(
                mach_task_self(),
                msg::MACH_MSG_TYPE_COPY_SEND,
            ),
        };

        mmsg!(msg::mach_msg(
            &mut message.head,
            msg::MACH_SEND_MSG | timeout_flag,
            message.head.msgh_size,
            0,
            port::MACH_PORT_NULL,
            timeout,
            port::MACH_PORT_NULL
        ));
    }

    Ok(())
}

impl DumpContext {
    /// Collector side of the rendezvous.
    ///
    /// Reads the target's [`Announcement`] from the channel, checks in with
    /// the bootstrap server under `service_name`, echoes that name back so
    /// the target knows the port exists, then blocks until the target's
    /// task right arrives.
    ///
    /// Note that with a `None` timeout this waits forever if the target
    /// never sends; pass a timeout if deadlock resistance matters more than
    /// a guaranteed capture.
    pub fn receive(
        channel: &mut (impl Read + Write),
        service_name: &CStr,
        recv_timeout: Option<Duration>,
    ) -> Result<Self, Error> {
        let announcement = Announcement::read_from(channel)?;

        // We set up the port the same way CFMessagePortCreateLocal does
        // SAFETY: syscalls
        let task = unsafe {
            let mut task_bootstrap_port = 0;
            kern!(task::task_get_special_port(
                mach_task_self(),
                task::TASK_BOOTSTRAP_PORT,
                &mut task_bootstrap_port
            ));

            let mut service_port = 0;
            kern!(bootstrap::bootstrap_check_in(
                task_bootstrap_port,
                service_name.as_ptr(),
                &mut service_port,
            ));
            let service_port = ScopedRight::destroy(service_port);

            kern!(mach_port::mach_port_insert_right(
                mach_task_self(),
                service_port.name,
                service_port.name,
                msg::MACH_MSG_TYPE_MAKE_SEND
            ));

            // Signal that the bootstrap port is ready to be looked up
            crate::write_prefixed(channel, service_name.to_bytes())?;
            channel.flush()?;

            let (timeout_flag, timeout) =
                recv_timeout.map_or((0, msg::MACH_MSG_TIMEOUT_NONE), |t| {
                    (msg::MACH_RCV_TIMEOUT, t.as_millis() as u32)
                });

            let mut received: ReceivedTaskTransferMessage = std::mem::zeroed();
            received.msg.head.msgh_local_port = service_port.name;
            received.msg.head.msgh_size = std::mem::size_of::<TaskTransferMessage>() as u32;

            mmsg!(msg::mach_msg(
                &mut received.msg.head,
                msg::MACH_RCV_MSG | timeout_flag,
                0,
                std::mem::size_of::<ReceivedTaskTransferMessage>() as u32,
                service_port.name,
                timeout,
                port::MACH_PORT_NULL
            ));

            TaskHandle {
                port: received.msg.task.name,
            }
        };

        Ok(Self {
            task,
            thread_id: announcement.thread_id,
            executable_path: announcement.executable_path,
            bundle_version: announcement.bundle_version,
        })
    }
}

/// A port right released on scope exit no matter how the rendezvous ends.
struct ScopedRight {
    name: port::mach_port_t,
    destroy: bool,
}

impl ScopedRight {
    /// For rights we only hold a reference to (eg a looked-up send right)
    fn deallocate(name: port::mach_port_t) -> Self {
        Self {
            name,
            destroy: false,
        }
    }

    /// For receive rights this process owns outright
    fn destroy(name: port::mach_port_t) -> Self {
        Self {
            name,
            destroy: true,
        }
    }
}

impl Drop for ScopedRight {
    fn drop(&mut self) {
        // SAFETY: syscall
        unsafe {
            if self.destroy {
                mach_port::mach_port_destroy(mach_task_self(), self.name);
            } else {
                mach_port::mach_port_deallocate(mach_task_self(), self.name);
            }
        }
    }
}
