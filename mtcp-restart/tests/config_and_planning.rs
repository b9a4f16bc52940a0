//! Integration-level exercises that don't require mutating the test
//! process's own address space: CLI parsing end to end, and the
//! relocation/vDSO planning arithmetic fed with representative
//! checkpoint-like values.

use mtcp_restart::config::RestartConfig;
use mtcp_restart::relocate::{self, RestorerRegion, RestorerRegions, MAX_RESTORER_REGIONS};
use mtcp_restart::vdso::VdsoPlan;
use mtcp_image::Area;

fn args(s: &[&str]) -> Vec<String> {
    s.iter().map(|s| s.to_string()).collect()
}

#[test]
fn cli_mtcp_restart_pause_overrides_environment() {
    // The flag form must win even though an env var could also supply it;
    // config.rs resolves the flag before falling back to the environment.
    let cfg = RestartConfig::parse(args(&["/tmp/a.img", "--mtcp-restart-pause", "5"])).unwrap();
    assert_eq!(cfg.restart_pause, Some(5));
}

#[test]
fn simulate_and_use_gdb_compose_with_a_plain_image_path() {
    let cfg = RestartConfig::parse(args(&["--simulate", "--use-gdb", "/tmp/a.img"])).unwrap();
    assert!(cfg.simulate);
    assert!(cfg.use_gdb);
    assert_eq!(cfg.image_path.unwrap().to_str().unwrap(), "/tmp/a.img");
}

fn regions(rs: &[RestorerRegion]) -> RestorerRegions {
    let mut out = RestorerRegions {
        regions: [RestorerRegion { addr: 0, end_addr: 0, prot: 0, offset: 0 }; MAX_RESTORER_REGIONS],
        len: rs.len(),
    };
    out.regions[..rs.len()].copy_from_slice(rs);
    out
}

fn stack_area(addr: u64, end: u64) -> Area {
    let mut a = Area::terminator();
    a.addr = addr;
    a.end_addr = end;
    a
}

#[test]
fn relocation_plan_fits_a_realistic_three_segment_binary() {
    // text, rodata, data+bss — a typical small static-PIE layout.
    let rs = regions(&[
        RestorerRegion { addr: 0x555555554000, end_addr: 0x555555558000, prot: libc::PROT_READ | libc::PROT_EXEC, offset: 0 },
        RestorerRegion { addr: 0x555555558000, end_addr: 0x555555559000, prot: libc::PROT_READ, offset: 0x4000 },
        RestorerRegion { addr: 0x555555559000, end_addr: 0x55555555a000, prot: libc::PROT_READ | libc::PROT_WRITE, offset: 0x5000 },
    ]);
    let stack = stack_area(0x7ffd_9000_0000, 0x7ffd_9002_1000);

    let rp = relocate::plan(0x700000, 0x30000, &rs, &stack).unwrap();
    assert_eq!(rp.restore_offset, 0x700000i64 - 0x555555554000i64);
    assert!(rp.new_stack_end > rp.new_stack_start);
    assert_eq!(rp.new_stack_end - rp.new_stack_start, stack.size());
}

#[test]
fn vdso_plan_validates_before_any_staging_is_attempted() {
    let plan = VdsoPlan {
        recorded_vdso: (0x7fff_0000_0000, 0x7fff_0000_2000),
        recorded_vvar: (0x7fff_0000_2000, 0x7fff_0000_4000),
        current_vdso: (0x7fff_1000_0000, 0x7fff_1000_2000),
        current_vvar: (0x7fff_1000_2000, 0x7fff_1000_4000),
    };
    assert!(plan.validate().is_ok());
    let (start, end) = plan.pick_staging(&[0x8000_0000_0000]).unwrap();
    assert_eq!(end - start, 0x4000);
}
