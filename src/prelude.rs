//! Root-level convenience re-export of `kernel::prelude`, kept as its own
//! file because that's where the teacher's own modules expect a bare
//! `use crate::prelude::*` to reach `KResult`/`Error`.

pub use crate::kernel::prelude::{Error, KResult};
