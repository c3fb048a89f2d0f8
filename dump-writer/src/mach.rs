//! Bindings the writer needs that `mach2` does not carry, mostly structs
//! from `<mach-o/dyld_images.h>` and task-info flavors.

#![allow(non_camel_case_types)]

/// Wraps a mach call in a Result
macro_rules! mach_call {
    ($call:expr) => {{
        // SAFETY: syscall
        let kr = unsafe { $call };
        if kr == mach2::kern_return::KERN_SUCCESS {
            Ok(())
        } else {
            let mut syscall = stringify!($call);
            if let Some(i) = syscall.find('(') {
                syscall = &syscall[..i];
            }
            Err($crate::errors::Error::Kernel { syscall, kr })
        }
    }};
}

pub(crate) use mach_call;

/// `all_image_info_format` value for a 64-bit target
pub const TASK_DYLD_ALL_IMAGE_INFO_64: i32 = 1;

pub const TASK_DYLD_INFO_COUNT: u32 = (std::mem::size_of::<mach2::task_info::task_dyld_info>()
    / std::mem::size_of::<libc::c_int>()) as u32;

/// The leading subset of `dyld_all_image_infos` from
/// `<mach-o/dyld_images.h>`. The full struct grows with every macOS
/// release; only this prefix is stable and only this prefix is needed.
#[repr(C)]
#[derive(Copy, Clone, Default)]
pub struct dyld_all_image_infos_subset {
    pub version: u32,
    pub info_array_count: u32,
    /// Address of the `dyld_image_info` array in the target
    pub info_array_addr: u64,
}

/// `dyld_image_info` from `<mach-o/dyld_images.h>`
#[repr(C)]
#[derive(Copy, Clone, Default)]
pub struct dyld_image_info {
    /// The address in the target where the image is loaded
    pub load_address: u64,
    /// The address in the target where the image's nul-terminated file
    /// path can be read
    pub file_path: u64,
    /// Timestamp the image file was last modified, unused here
    pub file_mod_date: u64,
}

/// `VM_FLAGS_ANYWHERE` from `<mach/vm_statistics.h>`
pub const VM_FLAGS_ANYWHERE: libc::c_int = 0x0001;
/// `VM_INHERIT_NONE` from `<mach/vm_inherit.h>`
pub const VM_INHERIT_NONE: u32 = 2;

/// `VM_REGION_BASIC_INFO_64` flavor for `mach_vm_region`
pub const VM_REGION_BASIC_INFO_64: i32 = 9;

/// `vm_region_basic_info_64` from `<mach/vm_region.h>`, `#pragma pack(4)`
#[repr(C, packed(4))]
#[derive(Copy, Clone, Default)]
pub struct vm_region_basic_info_64 {
    pub protection: i32,
    pub max_protection: i32,
    pub inheritance: u32,
    pub shared: u32,
    pub reserved: u32,
    pub offset: u64,
    pub behavior: i32,
    pub user_wired_count: u16,
}

pub const VM_REGION_BASIC_INFO_COUNT_64: u32 =
    (std::mem::size_of::<vm_region_basic_info_64>() / std::mem::size_of::<u32>()) as u32;

pub const VM_REGION_SUBMAP_INFO_COUNT_64: u32 =
    (std::mem::size_of::<mach2::vm_region::vm_region_submap_info_64>()
        / std::mem::size_of::<mach2::vm_types::natural_t>()) as u32;

extern "C" {
    /// From `<mach/mach_vm.h>`, no binding in mach2
    pub fn mach_vm_region(
        target_task: mach2::mach_types::task_t,
        address: *mut mach2::vm_types::mach_vm_address_t,
        size: *mut mach2::vm_types::mach_vm_size_t,
        flavor: i32,
        info: *mut i32,
        info_count: *mut u32,
        object_name: *mut mach2::port::mach_port_t,
    ) -> mach2::kern_return::kern_return_t;

    /// From `<mach/mach_vm.h>`, no binding in mach2
    pub fn mach_vm_remap(
        target_task: mach2::mach_types::task_t,
        target_address: *mut mach2::vm_types::mach_vm_address_t,
        size: mach2::vm_types::mach_vm_size_t,
        mask: mach2::vm_types::mach_vm_offset_t,
        flags: libc::c_int,
        src_task: mach2::mach_types::task_t,
        src_address: mach2::vm_types::mach_vm_address_t,
        copy: mach2::boolean::boolean_t,
        cur_protection: *mut mach2::vm_prot::vm_prot_t,
        max_protection: *mut mach2::vm_prot::vm_prot_t,
        inheritance: u32,
    ) -> mach2::kern_return::kern_return_t;
}
