//! The process-image restorer's core engine: self-relocation, address-space
//! sweep, vDSO/vvar reconciliation, and region restoration, wired together
//! with the CLI surface and plugin hooks.
//!
//! Only [`run`] and the module-level building blocks are public; the
//! `src/bin/mtcp-restart.rs` binary is a thin wrapper that calls [`run`]
//! with the process's real `argv`/`environ` and exits with its result.

pub mod arch;
pub mod brk;
pub mod config;
pub mod plugin;
pub mod region;
pub mod relocate;
pub mod restore_info;
pub mod sweep;
pub mod vdso;

use config::RestartConfig;
use mtcp_image::{find_header, Decoder, MtcpHeader};
use plugin::{NoopPlugin, PluginHooks};
use restore_info::RestoreFlags;
use std::fs::File;
use std::os::unix::io::{AsRawFd, FromRawFd};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] config::ConfigError),
    #[error("could not open checkpoint image: {0}")]
    OpenImage(std::io::Error),
    #[error(transparent)]
    Image(#[from] mtcp_image::ImageError),
    #[error(transparent)]
    Brk(#[from] brk::BrkError),
    #[error(transparent)]
    Relocate(#[from] relocate::RelocateError),
    #[error("the restored image's signature did not match")]
    SignatureMismatch,
}

/// Exit code for a checkpoint image whose signature doesn't match. Every
/// other fatal condition aborts the process outright rather than returning
/// an exit code (there is no stable address space left to return through
/// once sweeping begins).
pub const EXIT_SIGNATURE_MISMATCH: i32 = 1;

/// Entry point, called from `main` with the real command line. Locates
/// the image, restores the program break, checks for reserved-range
/// overlap, self-relocates, and (unless `--simulate`) proceeds through
/// the sweep/vDSO/region-restore pipeline.
///
/// On the normal success path, this function does not return — it tail-
/// calls into the checkpointed program's recorded continuation. It
/// returns an `Err` only for conditions detected before self-relocation
/// begins (bad arguments, a missing or malformed image); everything past
/// that point either succeeds or calls [`mtcp_sys::abort::exit_group`]
/// directly, since there is no stable address space left to unwind an
/// error back through.
pub fn run(args: Vec<String>) -> Result<(), RunError> {
    run_with_plugin(args, &mut NoopPlugin)
}

pub fn run_with_plugin(args: Vec<String>, plugin: &mut dyn PluginHooks) -> Result<(), RunError> {
    let mut args = args.into_iter();
    let _argv0 = args.next();
    let config = RestartConfig::parse(args)?;

    if let Some(fd) = config.stderr_fd {
        let _ = unsafe { mtcp_sys::io::dup2(fd, libc::STDERR_FILENO) };
    }

    let mut image_file = open_image(&config)?;
    let header = find_header(&mut image_file).map_err(RunError::Image)?;
    if !header.has_valid_signature() {
        return Err(RunError::SignatureMismatch);
    }

    let flags = RestoreFlags {
        skip_mremap: config.debug_skip_relocate,
        restart_pause: config.restart_pause.unwrap_or(0),
        use_gdb: config.use_gdb,
        brk_deferred: false,
        verbose: config.verbose,
    };
    restore_info::init(header, flags, image_file.as_raw_fd());
    plugin.hook(unsafe { restore_info::get() });

    if config.simulate {
        return run_simulation(image_file, &header);
    }

    let plan_outcome = brk::plan_and_maybe_restore(header.saved_brk, header.restore_addr, header.restore_size)?;
    unsafe {
        restore_info::get_mut().flags.brk_deferred = matches!(plan_outcome, brk::BrkPlan::Deferred { .. });
    }

    if flags.skip_mremap {
        // DMTCP_DEBUG_MTCP_RESTART: run the restore routine in place, on
        // the original stack, for debugging under a live debugger.
        finish_restoration_in_place(plugin)?;
        unreachable!("finish_restoration_in_place does not return on success");
    }

    let binary_name = current_binary_name();
    let stack_probe = &config as *const _ as u64;
    let (regions, stack_area) = unsafe { relocate::discover(binary_name.as_bytes(), stack_probe)? };
    let rp = relocate::plan(header.restore_addr, header.restore_size, &regions, &stack_area)?;
    unsafe { relocate::build_relocated_copy(&regions, &stack_area, &rp)? };

    let rinfo = unsafe { restore_info::get_mut() };
    rinfo.old_stack_start = stack_area.addr;
    rinfo.old_stack_end = stack_area.end_addr;

    unsafe {
        relocate::switch_to_relocated_copy(rinfo, &rp, post_relocation_entry as usize);
    }
}

/// The function the relocated copy jumps into. Runs entirely on the new
/// stack, reading its only argument (the un-relocated `RestoreInfo`
/// address) from the register the stack-switch trampoline placed it in.
///
/// Copies `*rinfo_ptr` into a local immediately, before anything else
/// runs: the sweep unmaps the region backing the original (un-relocated)
/// static, so any reference into it would dangle the moment the sweep
/// passes that region. Operating on the local for the rest of the
/// pipeline keeps `rinfo` valid across the unmap.
///
/// # Safety
/// Must only be reached via [`arch::switch_stack_and_call`].
pub unsafe extern "C" fn post_relocation_entry(rinfo_ptr: usize) -> ! {
    let mut rinfo = std::ptr::read(rinfo_ptr as *const restore_info::RestoreInfo);
    if rinfo.flags.brk_deferred {
        let _ = brk::restore_deferred(rinfo.header.saved_brk);
    }
    let mut plugin = NoopPlugin;
    match finish_restoration(&mut rinfo, &mut plugin) {
        Ok(()) => unreachable!("successful restoration jumps to post_restart and never returns"),
        Err(_) => mtcp_sys::abort::exit_group(1),
    }
}

/// Runs the sweep / vDSO reconciliation / region restore pipeline from
/// wherever it's called (relocated stack, or in-place under the debug
/// skip-relocate path) and jumps to `post_restart`. Does not return on
/// success.
unsafe fn finish_restoration(
    rinfo: &mut restore_info::RestoreInfo,
    plugin: &mut dyn PluginHooks,
) -> Result<(), ()> {
    let binary_name = current_binary_name();
    sweep::sweep(rinfo, binary_name.as_bytes(), plugin).map_err(|_| ())?;

    let vplan = vdso::VdsoPlan {
        recorded_vdso: (rinfo.header.vdso_start, rinfo.header.vdso_end),
        recorded_vvar: (rinfo.header.vvar_start, rinfo.header.vvar_end),
        current_vdso: (rinfo.current_vdso_start, rinfo.current_vdso_end),
        current_vvar: (rinfo.current_vvar_start, rinfo.current_vvar_end),
    };
    let staging_candidates = [rinfo.header.restore_addr + rinfo.header.restore_size + 0x10_0000];
    vdso::relocate_vdso_vvar(&vplan, &staging_candidates).map_err(|_| ())?;

    restore_all_regions(rinfo.image_fd, rinfo.flags.verbose)?;

    let _ = mtcp_sys::io::close(rinfo.image_fd);
    mtcp_sys::barrier::memory_barrier();

    jump_to_continuation(rinfo.header.post_restart, rinfo.flags.restart_pause)
}

unsafe fn restore_all_regions(image_fd: i32, verbose: bool) -> Result<(), ()> {
    use fallible_iterator::FallibleIterator;
    use mtcp_image::Payload;
    use std::ffi::CString;

    let file = File::from_raw_fd(image_fd);
    let mut decoder = Decoder::new(file);
    while let Some((area, payload)) = decoder.next().map_err(|_| ())? {
        let payload_bytes: &[u8] = match &payload {
            Payload::Bytes(b) => b,
            Payload::None => &[],
        };
        let backing_path = if area.is_anonymous() || area.flags & libc::MAP_ANONYMOUS != 0 {
            None
        } else {
            CString::new(area.name_bytes()).ok()
        };
        let backing_file_len = match &backing_path {
            Some(path) => stat_len(path),
            None => None,
        };
        region::restore_region(&area, payload_bytes, backing_path.as_ref(), backing_file_len, verbose)
            .map_err(|_| ())?;
    }
    std::mem::forget(decoder);
    Ok(())
}

/// Length of the file at `path`, or `None` if it can no longer be opened —
/// the file-shrunk-or-gone case that falls back to an anonymous mapping.
/// No `stat(2)` wrapper exists in `mtcp-sys`, so the length comes from
/// seeking a transient fd to its end instead.
unsafe fn stat_len(path: &std::ffi::CStr) -> Option<u64> {
    let fd = mtcp_sys::io::open(path, libc::O_RDONLY, 0).ok()?;
    let len = mtcp_sys::io::lseek(fd, 0, libc::SEEK_END).ok();
    let _ = mtcp_sys::io::close(fd);
    len.map(|n| n as u64)
}

/// Jump to the checkpointed program's continuation. Never returns.
unsafe fn jump_to_continuation(post_restart: u64, restart_pause: u8) -> ! {
    let f: extern "C" fn(u64, u8) -> ! = std::mem::transmute(post_restart as *const ());
    f(0, restart_pause)
}

/// The in-place path used when `DMTCP_DEBUG_MTCP_RESTART` is set: runs
/// the same finish_restoration pipeline without ever switching stacks.
///
/// Takes a local copy of the global for the same reason
/// [`post_relocation_entry`] does: the sweep unmaps the region backing
/// the static before this pipeline is done reading it.
fn finish_restoration_in_place(plugin: &mut dyn PluginHooks) -> Result<(), RunError> {
    let mut rinfo = unsafe { *restore_info::get() };
    if rinfo.flags.brk_deferred {
        let _ = unsafe { brk::restore_deferred(rinfo.header.saved_brk) };
    }
    match unsafe { finish_restoration(&mut rinfo, plugin) } {
        Ok(()) => Ok(()),
        Err(()) => mtcp_sys::abort::exit_group(1),
    }
}

/// `--simulate`: parse and print the image layout only, touching no
/// mapping.
fn run_simulation(image_file: File, header: &MtcpHeader) -> Result<(), RunError> {
    use fallible_iterator::FallibleIterator;

    println!(
        "restore_addr={:#x} restore_size={:#x} saved_brk={:#x}",
        header.restore_addr, header.restore_size, header.saved_brk
    );
    let mut decoder = Decoder::new(image_file);
    while let Some((area, _payload)) = decoder.next()? {
        println!(
            "{:#x}-{:#x} prot={:#x} flags={:#x} {}",
            area.addr,
            area.end_addr,
            area.prot,
            area.flags,
            String::from_utf8_lossy(area.name_bytes())
        );
    }
    Ok(())
}

fn open_image(config: &RestartConfig) -> Result<File, RunError> {
    if let Some(fd) = config.fd {
        Ok(unsafe { File::from_raw_fd(fd) })
    } else if let Some(path) = &config.image_path {
        File::open(path).map_err(RunError::OpenImage)
    } else {
        // --mpi with no positional image: the plugin is expected to
        // supply one via mpi_images; the core has nothing to open itself.
        Err(RunError::OpenImage(std::io::Error::from(std::io::ErrorKind::NotFound)))
    }
}

fn current_binary_name() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_default()
}
