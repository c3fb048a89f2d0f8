// BEGIN - Embark standard lints v6 for Rust 1.55+
// do not change or add/remove here, but one can add exceptions after this section
// for more info see: <https://github.com/EmbarkStudios/rust-ecosystem/issues/59>
#![deny(unsafe_code)]
#![warn(
    clippy::all,
    clippy::await_holding_lock,
    clippy::char_lit_as_u8,
    clippy::checked_conversions,
    clippy::dbg_macro,
    clippy::debug_assert_with_mut_call,
    clippy::doc_markdown,
    clippy::empty_enum,
    clippy::enum_glob_use,
    clippy::exit,
    clippy::expl_impl_clone_on_copy,
    clippy::explicit_deref_methods,
    clippy::explicit_into_iter_loop,
    clippy::fallible_impl_from,
    clippy::filter_map_next,
    clippy::flat_map_option,
    clippy::float_cmp_const,
    clippy::fn_params_excessive_bools,
    clippy::from_iter_instead_of_collect,
    clippy::if_let_mutex,
    clippy::implicit_clone,
    clippy::imprecise_flops,
    clippy::inefficient_to_string,
    clippy::invalid_upcast_comparisons,
    clippy::large_digit_groups,
    clippy::large_stack_arrays,
    clippy::large_types_passed_by_value,
    clippy::let_unit_value,
    clippy::linkedlist,
    clippy::lossy_float_literal,
    clippy::macro_use_imports,
    clippy::manual_ok_or,
    clippy::map_err_ignore,
    clippy::map_flatten,
    clippy::map_unwrap_or,
    clippy::match_on_vec_items,
    clippy::match_same_arms,
    clippy::match_wild_err_arm,
    clippy::match_wildcard_for_single_variants,
    clippy::mem_forget,
    clippy::mismatched_target_os,
    clippy::missing_enforced_import_renames,
    clippy::mut_mut,
    clippy::mutex_integer,
    clippy::needless_borrow,
    clippy::needless_continue,
    clippy::needless_for_each,
    clippy::option_option,
    clippy::path_buf_push_overwrite,
    clippy::ptr_as_ptr,
    clippy::rc_mutex,
    clippy::ref_option_ref,
    clippy::rest_pat_in_fully_bound_structs,
    clippy::same_functions_in_if_condition,
    clippy::semicolon_if_nothing_returned,
    clippy::single_match_else,
    clippy::string_add_assign,
    clippy::string_add,
    clippy::string_lit_as_bytes,
    clippy::string_to_string,
    clippy::todo,
    clippy::trait_duplication_in_bounds,
    clippy::unimplemented,
    clippy::unnested_or_patterns,
    clippy::unused_self,
    clippy::useless_transmute,
    clippy::verbose_file_reads,
    clippy::zero_sized_map_values,
    future_incompatible,
    nonstandard_style,
    rust_2018_idioms
)]
// END - Embark standard lints v6 for Rust 1.55+
// crate-specific exceptions:

//! Self-description of a process that wants a post-mortem dump taken of it,
//! plus the Mach bootstrap rendezvous that hands the collecting process a
//! send right on the target's task port.
//!
//! The announcement record travels over any framed bidirectional byte
//! channel the embedder provides (a pipe, a socketpair, ...); only the task
//! right itself has to go through a mach message, since port names are
//! meaningless outside the task that owns them.

use std::io::{self, Read, Write};

#[cfg(target_os = "macos")]
pub mod ipc;
#[cfg(target_os = "macos")]
pub use ipc::TaskHandle;

/// Identity a target process announces about itself before transferring its
/// task right.
///
/// The paths deliberately stay byte strings; HFS+/APFS paths are not
/// guaranteed to be valid UTF-8 and the dump envelope stores them verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announcement {
    /// The id of the thread the dump should treat as crashed, as reported
    /// by `thread_info(THREAD_IDENTIFIER_INFO)`.
    pub thread_id: u64,
    /// Path of the main executable of the announcing process.
    pub executable_path: Vec<u8>,
    /// The `CFBundleVersion` of the announcing process, empty if it has no
    /// bundle. Sent as UTF-16 code units since that is how the bundle API
    /// hands it out.
    pub bundle_version: String,
}

impl Announcement {
    /// Serializes the announcement to the channel and flushes it.
    ///
    /// Wire layout: `u64` thread id, then the executable path and the
    /// bundle version, each prefixed with a `u32` element count. All
    /// little-endian; the version counts UTF-16 units, not bytes.
    pub fn write_to(&self, channel: &mut impl Write) -> io::Result<()> {
        channel.write_all(&self.thread_id.to_le_bytes())?;
        write_prefixed(channel, &self.executable_path)?;

        let units: Vec<u16> = self.bundle_version.encode_utf16().collect();
        channel.write_all(&(units.len() as u32).to_le_bytes())?;
        for unit in units {
            channel.write_all(&unit.to_le_bytes())?;
        }

        channel.flush()
    }

    /// Reads an announcement previously written with [`Self::write_to`].
    pub fn read_from(channel: &mut impl Read) -> io::Result<Self> {
        let mut eight = [0u8; 8];
        channel.read_exact(&mut eight)?;
        let thread_id = u64::from_le_bytes(eight);

        let executable_path = read_prefixed(channel)?;

        let unit_count = read_len(channel)?;
        let mut units = Vec::with_capacity(unit_count);
        let mut two = [0u8; 2];
        for _ in 0..unit_count {
            channel.read_exact(&mut two)?;
            units.push(u16::from_le_bytes(two));
        }
        let bundle_version = String::from_utf16(&units)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;

        Ok(Self {
            thread_id,
            executable_path,
            bundle_version,
        })
    }
}

/// Writes a `u32`-length-prefixed byte string.
pub(crate) fn write_prefixed(channel: &mut impl Write, bytes: &[u8]) -> io::Result<()> {
    channel.write_all(&(bytes.len() as u32).to_le_bytes())?;
    channel.write_all(bytes)
}

/// Reads a `u32`-length-prefixed byte string.
pub(crate) fn read_prefixed(channel: &mut impl Read) -> io::Result<Vec<u8>> {
    let len = read_len(channel)?;
    let mut bytes = vec![0u8; len];
    channel.read_exact(&mut bytes)?;
    Ok(bytes)
}

fn read_len(channel: &mut impl Read) -> io::Result<usize> {
    let mut four = [0u8; 4];
    channel.read_exact(&mut four)?;
    Ok(u32::from_le_bytes(four) as usize)
}
