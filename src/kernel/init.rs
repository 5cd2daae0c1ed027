//! Dependency-ordered staged initialization (spec.md §4.10 / "Init" in §2).
//! Grounded on `original_source/init/init.c`'s linker-section target array
//! and `original_source/include/sys/init.h`'s descriptor layout, reworked
//! per the REDESIGN FLAGS note on section-based init tables: a plain static
//! registration table built with [`register`] calls at module scope,
//! walked in dependency order by [`run_bsp`]/[`run_ap`] instead of a
//! linker-section array populated before `main`.

use alloc::vec::Vec;
use ksync::SpinIrq;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Boot,
    Early,
    BeforeMain,
    Main,
    BeforeDev,
    Dev,
    Late,
}

pub const STAGES: [Stage; 7] = [
    Stage::Boot,
    Stage::Early,
    Stage::BeforeMain,
    Stage::Main,
    Stage::BeforeDev,
    Stage::Dev,
    Stage::Late,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Runs once, only on the bootstrap processor.
    Bsp,
    /// Runs once per CPU, BSP included.
    AllCpus,
}

pub struct Target {
    pub name: &'static str,
    pub stage: Stage,
    pub scope: Scope,
    pub depends_on: &'static [&'static str],
    pub handler: fn(),
}

static TARGETS: SpinIrq<Vec<Target>> = SpinIrq::new(Vec::new());

/// Adds `target` to the registry. Call at most once per `name`, before
/// [`run_bsp`] runs; registration after init has started is a logic error
/// in the caller, not something this function detects.
pub fn register(target: Target) {
    TARGETS.lock().push(target);
}

/// Orders the targets within one stage so every dependency runs before its
/// dependents. Unknown dependency names warn (via `klog`) and are treated
/// as already satisfied, rather than blocking the target forever. A
/// dependency cycle is a fatal boot error: this core has no partial-init
/// fallback to degrade to.
fn order_stage<'a>(targets: &[&'a Target]) -> Vec<&'a Target> {
    let mut ordered: Vec<&Target> = Vec::with_capacity(targets.len());
    let mut done: alloc::collections::BTreeSet<&'static str> = alloc::collections::BTreeSet::new();
    let mut remaining: Vec<&Target> = targets.to_vec();

    while !remaining.is_empty() {
        let before = remaining.len();
        remaining.retain(|target| {
            let ready = target.depends_on.iter().all(|&dep| {
                if done.contains(dep) {
                    true
                } else if targets.iter().any(|t| t.name == dep) {
                    false
                } else {
                    klog::println_warn!(
                        "kernel::init: target {:?} depends on unknown target {:?}, skipping the dependency",
                        target.name,
                        dep
                    );
                    true
                }
            });
            if ready {
                ordered.push(*target);
                done.insert(target.name);
            }
            !ready
        });

        if remaining.len() == before {
            panic!(
                "kernel::init: dependency cycle detected among targets: {:?}",
                remaining.iter().map(|t| t.name).collect::<Vec<_>>()
            );
        }
    }

    ordered
}

fn run_stage(stage: Stage, scope_filter: impl Fn(Scope) -> bool) {
    // Order and copy out the (name, handler) pairs while the registry is
    // locked, then drop the guard before running any handler: a target's
    // handler must be free to take whatever locks it needs without the
    // whole registry held hostage underneath it.
    let ordered: Vec<(&'static str, Stage, Scope, fn())> = {
        let targets = TARGETS.lock();
        let in_stage: Vec<&Target> = targets
            .iter()
            .filter(|t| t.stage == stage && scope_filter(t.scope))
            .collect();
        order_stage(&in_stage)
            .into_iter()
            .map(|t| (t.name, t.stage, t.scope, t.handler))
            .collect()
    };

    for (name, stage, scope, handler) in ordered {
        klog::println_debug!("kernel::init: running {:?} ({:?}/{:?})", name, stage, scope);
        handler();
    }
}

/// Runs every stage on the bootstrap processor: `Bsp`- and `AllCpus`-scoped
/// targets both execute.
pub fn run_bsp() {
    for &stage in STAGES.iter() {
        run_stage(stage, |_| true);
    }
}

/// Runs every stage on an application processor: only `AllCpus`-scoped
/// targets execute, since `Bsp`-scoped ones already ran once.
pub fn run_ap() {
    for &stage in STAGES.iter() {
        run_stage(stage, |scope| scope == Scope::AllCpus);
    }
}
