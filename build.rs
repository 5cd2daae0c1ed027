//! Build-time checks for this kernel-core. Generalized from the teacher's
//! own multi-arch `build.rs`, which dispatched on `CARGO_CFG_TARGET_ARCH`
//! to set per-arch `rustc-cfg` flags (`arch_has_stacktrace`-style); this
//! core targets x86_64 only, so that dispatch collapses to a single check.
//! `smp`/`trace_*`/`log_debug` stay ordinary Cargo features (see
//! `Cargo.toml`) rather than build-script-set cfgs, since none of them
//! vary by target triple.

fn main() -> Result<(), Box<dyn std::error::Error>> {
    match std::env::var("CARGO_CFG_TARGET_ARCH").as_deref() {
        Ok("x86_64") => {}
        Ok(other) => panic!("kcore only targets x86_64, got {other}"),
        Err(_) => panic!("CARGO_CFG_TARGET_ARCH not set"),
    }

    Ok(())
}
