//! The slice of the Mach-O object format a core dump needs, plus the layout
//! arithmetic for placing segment bodies in the emitted file.
//!
//! These mirror `<mach-o/loader.h>` and `<mach/i386/_structs.h>`. The thread
//! state structs are declared `packed(4)` because the kernel headers wrap
//! them in `#pragma pack(4)`; without it Rust would pad the exception state
//! to 8 bytes and every `LC_THREAD` would be one flavor record short when a
//! debugger walks it.

/// x86_64 macOS has a fixed 4 KiB page; the writer only targets that
/// configuration so the page math can stay a constant.
pub const PAGE_SIZE: u64 = 4096;

pub const MH_MAGIC_64: u32 = 0xfeed_facf;
pub const MH_CORE: u32 = 0x4;

pub const CPU_TYPE_X86_64: i32 = 0x0100_0007;
pub const CPU_SUBTYPE_X86_64_ALL: i32 = 3;

pub const LC_THREAD: u32 = 0x4;
pub const LC_ID_DYLIB: u32 = 0xd;
pub const LC_SEGMENT_64: u32 = 0x19;
pub const LC_UUID: u32 = 0x1b;

/// `x86_THREAD_STATE64` from `<mach/i386/thread_status.h>`
pub const X86_THREAD_STATE64: u32 = 4;
/// `x86_FLOAT_STATE64`
pub const X86_FLOAT_STATE64: u32 = 5;
/// `x86_EXCEPTION_STATE64`
pub const X86_EXCEPTION_STATE64: u32 = 6;

#[inline]
pub fn round_page(size: u64) -> u64 {
    (size + (PAGE_SIZE - 1)) & !(PAGE_SIZE - 1)
}

#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub struct MachHeader64 {
    pub magic: u32,
    pub cputype: i32,
    pub cpusubtype: i32,
    pub filetype: u32,
    pub ncmds: u32,
    pub sizeofcmds: u32,
    pub flags: u32,
    pub reserved: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub struct LoadCommand {
    pub cmd: u32,
    pub cmdsize: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub struct SegmentCommand64 {
    pub cmd: u32,
    pub cmdsize: u32,
    pub segname: [u8; 16],
    pub vmaddr: u64,
    pub vmsize: u64,
    pub fileoff: u64,
    pub filesize: u64,
    pub maxprot: i32,
    pub initprot: i32,
    pub nsects: u32,
    pub flags: u32,
}

/// `_STRUCT_X86_THREAD_STATE64`
#[repr(C, packed(4))]
#[derive(Copy, Clone, Default)]
pub struct ThreadState64 {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rflags: u64,
    pub cs: u64,
    pub fs: u64,
    pub gs: u64,
}

/// `_STRUCT_X86_FLOAT_STATE64`. The mmx/xmm registers are kept as opaque
/// 16-byte blobs; the writer never interprets them.
#[repr(C, packed(4))]
#[derive(Copy, Clone)]
pub struct FloatState64 {
    pub fpu_reserved: [i32; 2],
    pub fpu_fcw: u16,
    pub fpu_fsw: u16,
    pub fpu_ftw: u8,
    pub fpu_rsrv1: u8,
    pub fpu_fop: u16,
    pub fpu_ip: u32,
    pub fpu_cs: u16,
    pub fpu_rsrv2: u16,
    pub fpu_dp: u32,
    pub fpu_ds: u16,
    pub fpu_rsrv3: u16,
    pub fpu_mxcsr: u32,
    pub fpu_mxcsrmask: u32,
    pub fpu_stmm: [[u8; 16]; 8],
    pub fpu_xmm: [[u8; 16]; 16],
    pub fpu_rsrv4: [u8; 96],
    pub fpu_reserved1: i32,
}

impl Default for FloatState64 {
    fn default() -> Self {
        Self {
            fpu_reserved: [0; 2],
            fpu_fcw: 0,
            fpu_fsw: 0,
            fpu_ftw: 0,
            fpu_rsrv1: 0,
            fpu_fop: 0,
            fpu_ip: 0,
            fpu_cs: 0,
            fpu_rsrv2: 0,
            fpu_dp: 0,
            fpu_ds: 0,
            fpu_rsrv3: 0,
            fpu_mxcsr: 0,
            fpu_mxcsrmask: 0,
            fpu_stmm: [[0; 16]; 8],
            fpu_xmm: [[0; 16]; 16],
            fpu_rsrv4: [0; 96],
            fpu_reserved1: 0,
        }
    }
}

/// `_STRUCT_X86_EXCEPTION_STATE64`
#[repr(C, packed(4))]
#[derive(Copy, Clone, Default)]
pub struct ExceptionState64 {
    pub trapno: u16,
    pub cpu: u16,
    pub err: u32,
    pub faultvaddr: u64,
}

/// One `(flavor, count, payload)` record inside an `LC_THREAD` command.
/// Debuggers re-walk the command with exactly this framing, so `count` must
/// always be the payload size in 32-bit units.
#[repr(C, packed(4))]
#[derive(Copy, Clone)]
pub struct FlavoredState<T: Copy> {
    pub flavor: u32,
    pub count: u32,
    pub state: T,
}

impl<T: Copy + Default> FlavoredState<T> {
    fn new(flavor: u32) -> Self {
        Self {
            flavor,
            count: (std::mem::size_of::<T>() / 4) as u32,
            state: T::default(),
        }
    }
}

/// The fixed `LC_THREAD` record the writer emits per target thread: the
/// general-purpose, floating-point and exception register flavors, in that
/// order.
#[repr(C, packed(4))]
#[derive(Copy, Clone)]
pub struct ThreadCommand {
    pub header: LoadCommand,
    pub gpr: FlavoredState<ThreadState64>,
    pub fpu: FlavoredState<FloatState64>,
    pub exc: FlavoredState<ExceptionState64>,
}

impl ThreadCommand {
    pub fn new() -> Self {
        Self {
            header: LoadCommand {
                cmd: LC_THREAD,
                cmdsize: std::mem::size_of::<Self>() as u32,
            },
            gpr: FlavoredState::new(X86_THREAD_STATE64),
            fpu: FlavoredState::new(X86_FLOAT_STATE64),
            exc: FlavoredState::new(X86_EXCEPTION_STATE64),
        }
    }

    /// The frame and stack pointers of the captured thread, the two
    /// addresses region classification treats as stack roots.
    #[inline]
    pub fn stack_roots(&self) -> (u64, u64) {
        (self.gpr.state.rbp, self.gpr.state.rsp)
    }
}

impl Default for ThreadCommand {
    fn default() -> Self {
        Self::new()
    }
}

/// Reinterprets a load command or state struct as its on-disk bytes.
///
/// Only sound for the `repr(C)` types in this module, which contain no
/// pointers and no uninitialized padding (the `packed(4)` layouts are
/// exactly as dense as the kernel's).
#[allow(unsafe_code)]
pub(crate) fn bytes_of<T: Copy>(value: &T) -> &[u8] {
    // SAFETY: T is a plain-old-data struct per the above
    unsafe {
        std::slice::from_raw_parts((value as *const T).cast(), std::mem::size_of::<T>())
    }
}

/// Scans a raw load command sequence for the image's identity: the
/// `current_version` of its `LC_ID_DYLIB` and its `LC_UUID`. Each scan
/// takes the first matching command; an image without one of them (the
/// main executable has no `LC_ID_DYLIB`) reports zero for that half.
pub fn scan_identity(commands: &[u8]) -> (u32, [u8; 16]) {
    let mut version = None;
    let mut uuid = None;

    let mut offset = 0;
    while offset + 8 <= commands.len() && (version.is_none() || uuid.is_none()) {
        let cmd = u32_at(commands, offset);
        let cmdsize = u32_at(commands, offset + 4) as usize;
        if cmdsize < 8 || offset + cmdsize > commands.len() {
            // refuse to walk a corrupt command list
            break;
        }

        match cmd {
            // dylib_command.dylib.current_version
            LC_ID_DYLIB if version.is_none() && cmdsize >= 24 => {
                version = Some(u32_at(commands, offset + 16));
            }
            LC_UUID if uuid.is_none() && cmdsize >= 24 => {
                let mut bytes = [0u8; 16];
                bytes.copy_from_slice(&commands[offset + 8..offset + 24]);
                uuid = Some(bytes);
            }
            _ => {}
        }

        offset += cmdsize;
    }

    (version.unwrap_or(0), uuid.unwrap_or([0; 16]))
}

fn u32_at(bytes: &[u8], offset: usize) -> u32 {
    let mut quad = [0u8; 4];
    quad.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(quad)
}

/// The header for a core with the given command counts.
pub fn core_header(ncmds: u32, sizeofcmds: u32) -> MachHeader64 {
    MachHeader64 {
        magic: MH_MAGIC_64,
        cputype: CPU_TYPE_X86_64,
        cpusubtype: CPU_SUBTYPE_X86_64_ALL,
        filetype: MH_CORE,
        ncmds,
        sizeofcmds,
        flags: 0,
        reserved: 0,
    }
}

/// Assigns file offsets to the mapped segments, in order. The first body
/// starts at the first page boundary past the header and load commands;
/// each subsequent body follows the previous one immediately. Offsets are
/// relative to the start of the mach header, not the start of the file, so
/// the core stays valid once the envelope in front of it is stripped.
///
/// Returns the total size of the core in bytes.
pub fn assign_file_offsets(mapped: &mut [SegmentCommand64], sizeofcmds: u32) -> u64 {
    let mut offset = round_page(std::mem::size_of::<MachHeader64>() as u64 + u64::from(sizeofcmds));
    for segment in mapped {
        segment.fileoff = offset;
        offset += segment.filesize;
    }
    offset
}
