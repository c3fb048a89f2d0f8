//! Access to a (suspended) target task: memory reads, scoped remaps, the
//! VM submap walk, thread register sampling and dyld image enumeration.

use crate::{
    corefile::RegionSource,
    envelope::ModuleRecord,
    errors::Error,
    mach::{self, mach_call},
    macho::{self, MachHeader64, ThreadCommand},
    regions::{Region, VM_MEMORY_IOKIT},
};
use libc::mach_msg_type_number_t;
use mach2::{
    kern_return::{KERN_FAILURE, KERN_INVALID_ADDRESS, KERN_NO_SPACE, KERN_SUCCESS},
    mach_types::task_t,
    port::mach_port_t,
    thread_act,
    traps::mach_task_self,
    vm,
    vm_prot::{vm_prot_t, VM_PROT_NONE, VM_PROT_READ},
    vm_types::{mach_vm_address_t, mach_vm_size_t, natural_t},
};
use std::io::Write;

/// Reads a target task through its send right. The target is expected to be
/// suspended for the duration; nothing here writes to it.
pub struct TaskDumper {
    task: task_t,
}

impl TaskDumper {
    pub fn new(task: task_t) -> Self {
        Self { task }
    }

    /// Reads `count` values of `T` from the target at `address`.
    fn read_task_memory<T: Copy>(&self, address: u64, count: usize) -> Result<Vec<T>, Error> {
        let expected = (count * std::mem::size_of::<T>()) as u64;
        let mut buffer = Vec::<T>::with_capacity(count);
        let mut read = 0u64;

        mach_call!(vm::mach_vm_read_overwrite(
            self.task,
            address,
            expected,
            buffer.as_mut_ptr() as mach_vm_address_t,
            &mut read
        ))?;

        if read != expected {
            return Err(Error::Kernel {
                syscall: "mach_vm_read_overwrite",
                kr: KERN_FAILURE,
            });
        }

        // SAFETY: the kernel filled exactly `expected` bytes
        unsafe {
            buffer.set_len(count);
        }
        Ok(buffer)
    }

    /// Maps `[address, address + size)` of the target into this process,
    /// hands the closure the bytes, and unconditionally releases the
    /// mapping again.
    fn with_remapped<R>(
        &self,
        address: u64,
        size: u64,
        body: impl FnOnce(&[u8]) -> Result<R, Error>,
    ) -> Result<R, Error> {
        let mut local: mach_vm_address_t = 0;
        let mut cur_prot: vm_prot_t = VM_PROT_NONE;
        let mut max_prot: vm_prot_t = VM_PROT_NONE;

        mach_call!(mach::mach_vm_remap(
            mach_task_self(),
            &mut local,
            size,
            0,
            mach::VM_FLAGS_ANYWHERE,
            self.task,
            address,
            0,
            &mut cur_prot,
            &mut max_prot,
            mach::VM_INHERIT_NONE
        ))?;

        let _mapping = ScopedMapping {
            address: local,
            size,
        };

        // SAFETY: the remap succeeded, so the range is mapped in this task
        // until the guard releases it
        let bytes = unsafe { std::slice::from_raw_parts(local as *const u8, size as usize) };
        body(bytes)
    }

    /// Walks the target's VM map, descending into submaps, and yields every
    /// readable non-device leaf region in address order.
    pub fn for_each_region(&self, mut each: impl FnMut(Region)) -> Result<(), Error> {
        let mut address: mach_vm_address_t = 0;
        let mut depth: natural_t = 0;

        loop {
            let mut size: mach_vm_size_t = 0;
            let mut info =
                std::mem::MaybeUninit::<mach2::vm_region::vm_region_submap_info_64>::uninit();
            let mut info_count = mach::VM_REGION_SUBMAP_INFO_COUNT_64;

            // SAFETY: syscall
            let kr = unsafe {
                vm::mach_vm_region_recurse(
                    self.task,
                    &mut address,
                    &mut size,
                    &mut depth,
                    info.as_mut_ptr().cast(),
                    &mut info_count,
                )
            };

            if kr == KERN_INVALID_ADDRESS {
                // ran off the end of the address space
                return Ok(());
            } else if kr != KERN_SUCCESS {
                return Err(Error::Walk { kr });
            }

            // SAFETY: valid since the syscall succeeded
            let info = unsafe { info.assume_init() };

            // copy out of the (potentially packed) kernel struct
            let (is_submap, prot, max_prot, user_tag, share_mode) = (
                info.is_submap,
                info.protection,
                info.max_protection,
                info.user_tag,
                info.share_mode,
            );

            if is_submap != 0 {
                // descend without advancing
                depth += 1;
            } else {
                if user_tag != VM_MEMORY_IOKIT && (prot & VM_PROT_READ) != 0 {
                    log::trace!(
                        "vmregion: {address:#018x} prot {prot}, tag {user_tag}, share {share_mode}"
                    );
                    each(Region {
                        base: address,
                        size,
                        prot,
                        max_prot,
                        user_tag,
                    });
                }
                address += size;
            }
        }
    }

    /// Captures the three register flavors of every thread in the task and
    /// returns the index of the thread whose id matches `crashed_thread_id`.
    ///
    /// The thread ports and the thread array are given back to the kernel
    /// on every exit path.
    pub fn sample_threads(
        &self,
        crashed_thread_id: u64,
    ) -> Result<(Vec<ThreadCommand>, usize), Error> {
        let mut list: *mut mach2::mach_types::thread_act_t = std::ptr::null_mut();
        let mut count: mach_msg_type_number_t = 0;
        mach_call!(mach2::task::task_threads(self.task, &mut list, &mut count))?;

        let list = ThreadList { list, count };

        let mut commands = Vec::with_capacity(count as usize);
        let mut crashed = None;

        for (index, &thread) in list.as_slice().iter().enumerate() {
            // SAFETY: zero is a valid identifier-info value
            let mut id_info: libc::thread_identifier_info = unsafe { std::mem::zeroed() };
            let mut id_count = libc::THREAD_IDENTIFIER_INFO_COUNT;
            mach_call!(libc::thread_info(
                thread,
                libc::THREAD_IDENTIFIER_INFO as u32,
                (&mut id_info as *mut libc::thread_identifier_info).cast(),
                &mut id_count
            ))?;

            if id_info.thread_id == crashed_thread_id {
                crashed = Some(index);
            }

            let mut command = ThreadCommand::new();
            sample_flavor(
                thread,
                command.gpr.flavor,
                command.gpr.count,
                std::ptr::addr_of_mut!(command.gpr.state).cast(),
            )?;
            sample_flavor(
                thread,
                command.fpu.flavor,
                command.fpu.count,
                std::ptr::addr_of_mut!(command.fpu.state).cast(),
            )?;
            sample_flavor(
                thread,
                command.exc.flavor,
                command.exc.count,
                std::ptr::addr_of_mut!(command.exc.state).cast(),
            )?;

            commands.push(command);
        }

        let crashed =
            crashed.ok_or(Error::Sampling("no thread matched the announced thread id"))?;

        Ok((commands, crashed))
    }

    /// Reads the dyld all-image-infos record and materializes one
    /// [`ModuleRecord`] per loaded image, in enumeration order. The first
    /// entry is the main executable.
    pub fn enumerate_images(&self) -> Result<Vec<ModuleRecord>, Error> {
        let mut dyld_info = mach2::task_info::task_dyld_info::default();
        let mut count = mach::TASK_DYLD_INFO_COUNT;
        mach_call!(mach2::task::task_info(
            self.task,
            mach2::task_info::TASK_DYLD_INFO,
            (&mut dyld_info as *mut mach2::task_info::task_dyld_info).cast(),
            &mut count
        ))?;

        if dyld_info.all_image_info_format != mach::TASK_DYLD_ALL_IMAGE_INFO_64 {
            return Err(Error::Images("target does not publish 64-bit dyld info"));
        }
        if (dyld_info.all_image_info_size as usize)
            < std::mem::size_of::<mach::dyld_all_image_infos_subset>()
        {
            return Err(Error::Images("dyld all-image-infos record is too small"));
        }

        let infos = self
            .read_task_memory::<mach::dyld_all_image_infos_subset>(
                dyld_info.all_image_info_addr,
                1,
            )?[0];

        let entries = self.read_task_memory::<mach::dyld_image_info>(
            infos.info_array_addr,
            infos.info_array_count as usize,
        )?;

        let mut modules = Vec::with_capacity(entries.len());
        for entry in entries {
            let path = self.read_image_path(entry.file_path)?;
            let (version, uuid) = self.read_image_identity(entry.load_address)?;
            modules.push(ModuleRecord {
                path,
                start_address: entry.load_address,
                version,
                uuid,
            });
        }

        Ok(modules)
    }

    /// Copies the nul-terminated image path out of the target by remapping
    /// the VM region that contains it. A remap that fails for lack of local
    /// address space yields an empty path rather than failing the dump.
    fn read_image_path(&self, path_address: u64) -> Result<Vec<u8>, Error> {
        let mut region_base: mach_vm_address_t = path_address;
        let mut region_size: mach_vm_size_t = 0;
        let mut info = mach::vm_region_basic_info_64::default();
        let mut info_count = mach::VM_REGION_BASIC_INFO_COUNT_64;
        let mut object_name: mach_port_t = 0;

        mach_call!(mach::mach_vm_region(
            self.task,
            &mut region_base,
            &mut region_size,
            mach::VM_REGION_BASIC_INFO_64,
            (&mut info as *mut mach::vm_region_basic_info_64).cast(),
            &mut info_count,
            &mut object_name
        ))?;

        let copied = self.with_remapped(region_base, region_size, |bytes| {
            let start = (path_address - region_base) as usize;
            let tail = &bytes[start..];
            let len = tail.iter().position(|b| *b == 0).unwrap_or(tail.len());
            Ok(tail[..len].to_vec())
        });

        match copied {
            Err(Error::Kernel {
                kr: KERN_NO_SPACE, ..
            }) => {
                log::warn!("no room to remap the path of the image at {path_address:#x}");
                Ok(Vec::new())
            }
            other => other,
        }
    }

    /// Reads an image's mach header and load commands to pull out its
    /// `LC_ID_DYLIB` version and `LC_UUID`.
    fn read_image_identity(&self, load_address: u64) -> Result<(u32, [u8; 16]), Error> {
        let header = self.read_task_memory::<MachHeader64>(load_address, 1)?[0];
        if header.magic != macho::MH_MAGIC_64 {
            return Err(Error::Images("image does not start with a 64-bit mach header"));
        }

        let commands = self.read_task_memory::<u8>(
            load_address + std::mem::size_of::<MachHeader64>() as u64,
            header.sizeofcmds as usize,
        )?;

        Ok(macho::scan_identity(&commands))
    }
}

impl RegionSource for TaskDumper {
    fn copy_region(&mut self, addr: u64, size: u64, out: &mut dyn Write) -> Result<(), Error> {
        self.with_remapped(addr, size, |bytes| {
            out.write_all(bytes)?;
            Ok(())
        })
    }
}

fn sample_flavor(
    thread: mach2::mach_types::thread_act_t,
    flavor: u32,
    expected: u32,
    state: *mut natural_t,
) -> Result<(), Error> {
    let mut count = expected;
    mach_call!(thread_act::thread_get_state(
        thread,
        flavor as i32,
        state,
        &mut count
    ))?;

    if count != expected {
        return Err(Error::Sampling("register flavor came back with an unexpected count"));
    }
    Ok(())
}

/// The thread port array from `task_threads`; the per-thread rights and the
/// array's pages go back to the kernel when this drops.
struct ThreadList {
    list: *mut mach2::mach_types::thread_act_t,
    count: mach_msg_type_number_t,
}

impl ThreadList {
    fn as_slice(&self) -> &[mach2::mach_types::thread_act_t] {
        if self.list.is_null() || self.count == 0 {
            return &[];
        }
        // SAFETY: the kernel allocated `count` entries at `list`
        unsafe { std::slice::from_raw_parts(self.list, self.count as usize) }
    }
}

impl Drop for ThreadList {
    fn drop(&mut self) {
        for &thread in self.as_slice() {
            // SAFETY: syscall
            let kr = unsafe { mach2::mach_port::mach_port_deallocate(mach_task_self(), thread) };
            if kr != KERN_SUCCESS {
                log::warn!("failed to release thread port {thread}: {kr:#x}");
            }
        }

        if !self.list.is_null() {
            // SAFETY: syscall
            let kr = unsafe {
                vm::mach_vm_deallocate(
                    mach_task_self(),
                    self.list as mach_vm_address_t,
                    u64::from(self.count)
                        * std::mem::size_of::<mach2::mach_types::thread_act_t>() as u64,
                )
            };
            if kr != KERN_SUCCESS {
                log::warn!("failed to release the thread array: {kr:#x}");
            }
        }
    }
}

/// A target range remapped into this process, released on scope exit.
struct ScopedMapping {
    address: mach_vm_address_t,
    size: mach_vm_size_t,
}

impl Drop for ScopedMapping {
    fn drop(&mut self) {
        // SAFETY: syscall
        let kr = unsafe { vm::mach_vm_deallocate(mach_task_self(), self.address, self.size) };
        if kr != KERN_SUCCESS {
            log::warn!("failed to release a remapped region: {kr:#x}");
        }
    }
}
