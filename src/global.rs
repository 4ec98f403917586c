//! Process-wide tracer installation.
//!
//! Code deep inside a client stack is rarely handed a [`Tracer`]
//! explicitly. The global tracer is the ambient fallback: an
//! application installs one at startup with [`set_tracer`], and any
//! layer can obtain a handle through [`tracer`]. Until something is
//! installed, the global tracer is the disabled tracer, so tracing
//! calls are safe from the first instruction of the process.
//!
//! Spans capture the tracer they were started under, so swapping the
//! global tracer mid-flight never strands an open span: it keeps
//! reporting to the tracer that started it.

use std::mem;
use std::sync::{OnceLock, RwLock};

use crate::tracer::Tracer;
use crate::{dbtrace_error, dbtrace_warn};

/// The global `Tracer` singleton.
static GLOBAL_TRACER: OnceLock<RwLock<Tracer>> = OnceLock::new();

#[inline]
fn global_tracer() -> &'static RwLock<Tracer> {
    GLOBAL_TRACER.get_or_init(|| RwLock::new(Tracer::disabled()))
}

/// Returns a handle to the currently installed tracer, or the disabled
/// tracer if none was installed.
pub fn tracer() -> Tracer {
    let global_tracer = global_tracer().read();
    if let Ok(tracer) = global_tracer {
        tracer.clone()
    } else {
        dbtrace_error!(
            name: "global_tracer_get_failed",
            message = "the global tracer lock is poisoned, returning the disabled tracer"
        );
        Tracer::disabled()
    }
}

/// Installs `new_tracer` as the process-wide tracer and returns the
/// previously installed one.
///
/// The caller decides what happens to the previous tracer; shut it down
/// once the spans still holding it have finished, or keep it alive for
/// a staged swap.
pub fn set_tracer(new_tracer: Tracer) -> Tracer {
    let mut global_tracer = global_tracer().write();
    if let Ok(ref mut tracer) = global_tracer {
        mem::replace(&mut **tracer, new_tracer)
    } else {
        dbtrace_error!(
            name: "global_tracer_set_failed",
            message = "the global tracer lock is poisoned, the new tracer was not installed"
        );
        Tracer::disabled()
    }
}

/// Replaces the installed tracer with the disabled tracer and shuts the
/// previous one down, draining anything it buffered.
pub fn shutdown_tracer() {
    let previous = set_tracer(Tracer::disabled());
    if let Err(err) = previous.shutdown() {
        let reason = err.to_string();
        dbtrace_warn!(name: "global_tracer_shutdown_failed", reason = reason.as_str());
    }
}
