//! SIGINT handling for the reactor
//!
//! The handler only raises a flag. It is installed without `SA_RESTART` so a
//! blocking `poll` in the reactor returns `EINTR` and the loop can observe
//! the flag at once.

use std::io;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_interrupt(_signal: libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

/// Consume a pending interrupt, if any
pub fn take() -> bool {
    INTERRUPTED.swap(false, Ordering::SeqCst)
}

/// Mark an interrupt as pending, as if SIGINT had been delivered
pub fn raise() {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

/// Restores the previous SIGINT disposition on drop
pub struct InterruptGuard {
    previous: libc::sigaction,
}

/// Install the SIGINT handler for as long as the returned guard lives
pub fn install() -> io::Result<InterruptGuard> {
    unsafe {
        let mut action: libc::sigaction = mem::zeroed();
        action.sa_sigaction = on_interrupt as extern "C" fn(libc::c_int) as libc::sighandler_t;
        action.sa_flags = 0;
        libc::sigemptyset(&mut action.sa_mask);

        let mut previous: libc::sigaction = mem::zeroed();
        if libc::sigaction(libc::SIGINT, &action, &mut previous) != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(InterruptGuard { previous })
    }
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        unsafe {
            libc::sigaction(libc::SIGINT, &self.previous, std::ptr::null_mut());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_raise_and_take() {
        let _ = take();
        assert!(!take());
        raise();
        assert!(take());
        assert!(!take(), "take() consumes the pending interrupt");
    }

    #[test]
    #[serial]
    fn test_signal_sets_flag_while_installed() {
        let _ = take();
        let guard = install().unwrap();
        unsafe {
            libc::raise(libc::SIGINT);
        }
        assert!(take());
        drop(guard);
    }
}
