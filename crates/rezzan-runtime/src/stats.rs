//! End-of-process statistics (`REZZAN_STATS`).
//!
//! Four lines on stderr at exit: peak resident bytes and total page faults
//! from `getrusage`, plus the runtime's own counters. Rendering reuses the
//! allocation-free line assembler from the diagnostics module because the
//! exit handler may run after the host allocator has started tearing down.

use std::sync::atomic::Ordering;

use crate::heap::{Runtime, installed_runtime};
use crate::report::LineBuf;

/// Install the exit dump. Called once by the global initializer when
/// `REZZAN_STATS` is set.
pub(crate) fn register_exit_dump() {
    // SAFETY: registering a no-argument extern "C" handler.
    unsafe { libc::atexit(dump_at_exit) };
}

extern "C" fn dump_at_exit() {
    if let Some(runtime) = installed_runtime() {
        dump(runtime);
    }
}

fn rusage() -> (u64, u64) {
    // SAFETY: rusage is plain data; all-zero is a valid value.
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    // SAFETY: getrusage fills the struct for the calling process.
    let rc = unsafe { libc::getrusage(libc::RUSAGE_SELF, &mut usage) };
    if rc != 0 {
        return (0, 0);
    }
    // ru_maxrss is reported in kilobytes on Linux.
    let peak_rss = (usage.ru_maxrss as u64).saturating_mul(1024);
    let faults = (usage.ru_minflt as u64).saturating_add(usage.ru_majflt as u64);
    (peak_rss, faults)
}

/// Print the four statistics lines for `runtime`.
pub fn dump(runtime: &Runtime) {
    let (peak_rss, faults) = rusage();
    let counters = runtime.counters();
    emit(b"rezzan: peak resident bytes: ", peak_rss);
    emit(b"rezzan: page faults:         ", faults);
    emit(
        b"rezzan: bytes carved:        ",
        counters.carved_bytes.load(Ordering::Relaxed),
    );
    emit(b"rezzan: bytes quarantined:   ", runtime.quarantined_bytes());
}

fn emit(label: &[u8], value: u64) {
    let mut line = LineBuf::new();
    line.push(label);
    line.push_dec(value);
    line.push(b"\n");
    line.flush();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rusage_reports_a_live_process() {
        let (peak_rss, faults) = rusage();
        assert!(peak_rss > 0, "a running test has resident pages");
        assert!(faults > 0, "a running test has faulted pages in");
    }
}
