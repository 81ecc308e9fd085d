//! Segmentation fault reporting for debug builds on Linux.
//!
//! When armed, a SIGSEGV raised while a kernel runs prints the kernel name
//! and the call it was serving, then restores the default action and
//! re-raises so the process still dies with the original signal.

use crate::emitter::KernelKind;

/// Marks the current thread as running a kernel until dropped.
pub struct FaultScope {
    _private: (),
}

#[cfg(all(target_os = "linux", debug_assertions))]
mod imp {
    use std::cell::Cell;
    use std::sync::Once;

    use crate::emitter::KernelKind;

    #[derive(Clone, Copy)]
    pub struct Context {
        pub name: *const u8,
        pub name_len: usize,
        pub kind: KernelKind,
        pub unit: usize,
    }

    thread_local! {
        pub static CURRENT: Cell<Option<Context>> = const { Cell::new(None) };
    }

    static INSTALL: Once = Once::new();

    fn write_stderr(bytes: &[u8]) {
        unsafe {
            libc::write(libc::STDERR_FILENO, bytes.as_ptr() as *const libc::c_void, bytes.len());
        }
    }

    fn write_number(mut n: usize) {
        let mut digits = [0u8; 20];
        let mut at = digits.len();
        loop {
            at -= 1;
            digits[at] = b'0' + (n % 10) as u8;
            n /= 10;
            if n == 0 {
                break;
            }
        }
        write_stderr(&digits[at..]);
    }

    extern "C" fn on_segv(sig: libc::c_int) {
        write_stderr(b"snipjit: segmentation fault");
        if let Ok(Some(ctx)) = CURRENT.try_with(|c| c.get()) {
            write_stderr(b" in kernel `");
            write_stderr(unsafe { std::slice::from_raw_parts(ctx.name, ctx.name_len) });
            write_stderr(match ctx.kind {
                KernelKind::Static => b"` (static entry, unit ",
                KernelKind::Dynamic => b"` (dynamic entry, unit ",
            });
            write_number(ctx.unit);
            write_stderr(b")");
        }
        write_stderr(b"\n");
        unsafe {
            libc::signal(sig, libc::SIG_DFL);
            libc::raise(sig);
        }
    }

    pub fn install() {
        INSTALL.call_once(|| unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = on_segv as extern "C" fn(libc::c_int) as libc::sighandler_t;
            libc::sigemptyset(&mut action.sa_mask);
            libc::sigaction(libc::SIGSEGV, &action, std::ptr::null_mut());
        });
    }
}

/// Install the handler. Idempotent; a no-op outside debug Linux builds.
pub fn install() {
    #[cfg(all(target_os = "linux", debug_assertions))]
    imp::install();
}

/// Record the kernel about to run on this thread. The name must outlive the
/// returned scope.
pub fn enter(name: &str, kind: KernelKind, unit: usize) -> FaultScope {
    #[cfg(all(target_os = "linux", debug_assertions))]
    imp::CURRENT.with(|c| {
        c.set(Some(imp::Context {
            name: name.as_ptr(),
            name_len: name.len(),
            kind,
            unit,
        }))
    });
    #[cfg(not(all(target_os = "linux", debug_assertions)))]
    let _ = (name, kind, unit);
    FaultScope { _private: () }
}

impl Drop for FaultScope {
    fn drop(&mut self) {
        #[cfg(all(target_os = "linux", debug_assertions))]
        imp::CURRENT.with(|c| c.set(None));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_sets_and_clears_context() {
        install();
        let name = String::from("k");
        {
            let _scope = enter(&name, KernelKind::Dynamic, 3);
            #[cfg(all(target_os = "linux", debug_assertions))]
            assert_eq!(imp::CURRENT.with(|c| c.get()).map(|ctx| ctx.unit), Some(3));
        }
        #[cfg(all(target_os = "linux", debug_assertions))]
        assert!(imp::CURRENT.with(|c| c.get()).is_none());
    }
}
