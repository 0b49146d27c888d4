//! User interrupt handling.
//!
//! A SIGINT handler records the interrupt in an atomic flag; a watcher
//! thread polls the flag and fans the abort out to every pipeline stage.
//! The handler itself does nothing else, keeping it async-signal-safe.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use tspipe_core::executor::AbortHandle;

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

#[cfg(unix)]
extern "C" fn on_sigint(_sig: libc::c_int) {
    INTERRUPTED.store(true, Ordering::Relaxed);
}

/// Install the SIGINT handler.
#[cfg(unix)]
pub fn install() {
    let handler = on_sigint as extern "C" fn(libc::c_int);
    unsafe {
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
    }
}

/// Install the SIGINT handler (no-op on this platform).
#[cfg(not(unix))]
pub fn install() {}

/// Spawn the watcher thread translating the interrupt flag into an
/// abort fan-out. The thread ends with the process.
pub fn spawn_watcher(abort: AbortHandle) {
    let _ = thread::Builder::new().name("ts-intr".into()).spawn(move || loop {
        if INTERRUPTED.swap(false, Ordering::Relaxed) {
            log::info!("user interrupt, terminating");
            abort.abort();
        }
        thread::sleep(Duration::from_millis(100));
    });
}
