//! Single-threaded reactor
//!
//! The reactor multiplexes file descriptors, timers and per-iteration hooks.
//! One iteration runs, in order:
//!
//! 1. every tick hook,
//! 2. a snapshot of each timer's next-fire time, yielding the poll timeout,
//! 3. every preselect hook (flush queued output, nothing else),
//! 4. a blocking `poll` over the read interest of every fd watcher,
//! 5. read/write/exception dispatch for the ready descriptors,
//! 6. the alarm of every timer whose snapshotted fire time has passed.
//!
//! The loop stops once the [`ShutdownCode`] holds a value. Handlers are never
//! guarded: the first error propagates out of [`Reactor::run`]. Each phase has
//! an advisory [`Budget`]; overruns are logged and nothing more.

use crate::config::ReactorConfig;
use crate::interrupt;
use anyhow::Result;
use log::{debug, info, warn};
use std::cell::{Cell, RefCell};
use std::io;
use std::os::fd::RawFd;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

/// Exit status when the designated quit key was typed
pub const EXIT_QUIT_KEY: i32 = 0;
/// Exit status when the loop was interrupted by SIGINT
pub const EXIT_INTERRUPTED: i32 = 1;

/// Process shutdown code, written at most once.
///
/// Clones share the same slot. The first `set` wins; later calls are
/// ignored and return `false`.
#[derive(Debug, Clone, Default)]
pub struct ShutdownCode(Rc<Cell<Option<i32>>>);

impl ShutdownCode {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, code: i32) -> bool {
        if self.0.get().is_some() {
            debug!("shutdown code already set, ignoring {}", code);
            return false;
        }
        info!("shutdown requested with code {}", code);
        self.0.set(Some(code));
        true
    }

    pub fn get(&self) -> Option<i32> {
        self.0.get()
    }

    pub fn is_set(&self) -> bool {
        self.0.get().is_some()
    }
}

/// Something the reactor should wake up for at a point in time.
///
/// `next_fire` returning `None` means the timer does not currently need
/// scheduling.
pub trait Timer {
    fn next_fire(&self) -> Option<Instant>;
    fn alarm(&mut self) -> Result<()>;
}

/// A descriptor watched for readability
pub trait FdWatcher {
    fn fd(&self) -> RawFd;

    fn on_readable(&mut self) -> Result<()>;

    /// Only consulted when [`FdWatcher::wants_write`] returns true
    fn on_writable(&mut self) -> Result<()> {
        Ok(())
    }

    fn on_exception(&mut self) -> Result<()> {
        Ok(())
    }

    fn wants_write(&self) -> bool {
        false
    }
}

/// Advisory time limit for one handler invocation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Budget {
    name: &'static str,
    limit: Duration,
}

impl Budget {
    pub const fn new(name: &'static str, limit: Duration) -> Self {
        Self { name, limit }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn limit(&self) -> Duration {
        self.limit
    }

    pub fn exceeded_by(&self, elapsed: Duration) -> bool {
        elapsed > self.limit
    }

    /// Run `f`, logging if it took longer than the limit
    pub fn run<T>(&self, f: impl FnOnce() -> T) -> T {
        let start = Instant::now();
        let out = f();
        let elapsed = start.elapsed();
        if self.exceeded_by(elapsed) {
            warn!(
                "{} took {:.3}s (budget {:.3}s)",
                self.name,
                elapsed.as_secs_f64(),
                self.limit.as_secs_f64()
            );
        }
        out
    }
}

/// Per-phase budgets
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Budgets {
    pub tick: Budget,
    pub preselect: Budget,
    pub read: Budget,
    pub write: Budget,
    pub except: Budget,
    pub alarm: Budget,
}

impl Default for Budgets {
    fn default() -> Self {
        Self::from(&ReactorConfig::default())
    }
}

impl From<&ReactorConfig> for Budgets {
    fn from(config: &ReactorConfig) -> Self {
        let dispatch = Duration::from_millis(config.dispatch_budget_ms);
        Self {
            tick: Budget::new("tick", Duration::from_millis(config.tick_budget_ms)),
            preselect: Budget::new(
                "preselect",
                Duration::from_millis(config.preselect_budget_ms),
            ),
            read: Budget::new("doread", dispatch),
            write: Budget::new("dowrite", dispatch),
            except: Budget::new("doexcept", dispatch),
            alarm: Budget::new("alarm", Duration::from_millis(config.alarm_budget_ms)),
        }
    }
}

type Hook = Box<dyn FnMut() -> Result<()>>;

/// Timer fire time captured before the wait
struct Snapshot {
    timer: Weak<RefCell<dyn Timer>>,
    fire_at: Instant,
}

#[derive(Default)]
struct Ready {
    read: Vec<Rc<RefCell<dyn FdWatcher>>>,
    write: Vec<Rc<RefCell<dyn FdWatcher>>>,
    except: Vec<Rc<RefCell<dyn FdWatcher>>>,
}

/// The event loop and the context object every component registers with.
///
/// Timers and watchers are held weakly: their owner decides how long they
/// live, and dead entries are pruned as they are found.
pub struct Reactor {
    shutdown: ShutdownCode,
    budgets: Budgets,
    timers: Vec<Weak<RefCell<dyn Timer>>>,
    watchers: Vec<Weak<RefCell<dyn FdWatcher>>>,
    ticks: Vec<Hook>,
    preselects: Vec<Hook>,
}

impl Reactor {
    pub fn new(budgets: Budgets) -> Self {
        Self {
            shutdown: ShutdownCode::new(),
            budgets,
            timers: Vec::new(),
            watchers: Vec::new(),
            ticks: Vec::new(),
            preselects: Vec::new(),
        }
    }

    pub fn from_config(config: &ReactorConfig) -> Self {
        Self::new(Budgets::from(config))
    }

    /// Handle on the shared shutdown code
    pub fn shutdown(&self) -> ShutdownCode {
        self.shutdown.clone()
    }

    pub fn budgets(&self) -> &Budgets {
        &self.budgets
    }

    pub fn add_timer(&mut self, timer: Weak<RefCell<dyn Timer>>) {
        self.timers.push(timer);
    }

    pub fn add_watcher(&mut self, watcher: Weak<RefCell<dyn FdWatcher>>) {
        self.watchers.push(watcher);
    }

    /// Hook run at the top of every iteration
    pub fn add_tick(&mut self, hook: impl FnMut() -> Result<()> + 'static) {
        self.ticks.push(Box::new(hook));
    }

    /// Hook run right before the blocking wait. It must not touch timers or
    /// draw; flushing buffered output is what it is for.
    pub fn add_preselect(&mut self, hook: impl FnMut() -> Result<()> + 'static) {
        self.preselects.push(Box::new(hook));
    }

    /// Run until the shutdown code is set and return it
    pub fn run(&mut self) -> Result<i32> {
        let _guard = interrupt::install()?;
        info!("entering event loop");
        loop {
            if let Some(code) = self.shutdown.get() {
                info!("event loop finished with code {}", code);
                return Ok(code);
            }
            self.iterate()?;
        }
    }

    /// One pass through all six phases
    pub fn iterate(&mut self) -> Result<()> {
        for tick in self.ticks.iter_mut() {
            self.budgets.tick.run(|| tick())?;
        }

        let (timeout, snapshots) = self.schedule(Instant::now());

        for hook in self.preselects.iter_mut() {
            self.budgets.preselect.run(|| hook())?;
        }

        let ready = self.wait(timeout)?;

        for watcher in &ready.read {
            self.budgets.read.run(|| watcher.borrow_mut().on_readable())?;
        }
        for watcher in &ready.write {
            self.budgets.write.run(|| watcher.borrow_mut().on_writable())?;
        }
        for watcher in &ready.except {
            self.budgets.except.run(|| watcher.borrow_mut().on_exception())?;
        }

        let now = Instant::now();
        for snapshot in snapshots {
            if now < snapshot.fire_at {
                continue;
            }
            if let Some(timer) = snapshot.timer.upgrade() {
                self.budgets.alarm.run(|| timer.borrow_mut().alarm())?;
            }
        }
        Ok(())
    }

    /// Snapshot every live timer's fire time and return the time to wait
    /// until the earliest of them. `None` means wait indefinitely.
    fn schedule(&mut self, now: Instant) -> (Option<Duration>, Vec<Snapshot>) {
        self.timers.retain(|t| t.strong_count() > 0);

        let mut timeout: Option<Duration> = None;
        let mut snapshots = Vec::with_capacity(self.timers.len());
        for weak in &self.timers {
            let Some(timer) = weak.upgrade() else {
                continue;
            };
            let Some(fire_at) = timer.borrow().next_fire() else {
                continue;
            };
            let wait = fire_at.saturating_duration_since(now);
            timeout = Some(timeout.map_or(wait, |t| t.min(wait)));
            snapshots.push(Snapshot {
                timer: weak.clone(),
                fire_at,
            });
        }
        (timeout, snapshots)
    }

    /// Time until the earliest scheduled timer, measured from `now`
    pub fn next_timeout(&mut self, now: Instant) -> Option<Duration> {
        self.schedule(now).0
    }

    fn wait(&mut self, timeout: Option<Duration>) -> Result<Ready> {
        self.watchers.retain(|w| w.strong_count() > 0);
        let watchers: Vec<Rc<RefCell<dyn FdWatcher>>> =
            self.watchers.iter().filter_map(Weak::upgrade).collect();

        if interrupt::take() {
            self.interrupted();
            return Ok(Ready::default());
        }

        let mut fds: Vec<libc::pollfd> = watchers
            .iter()
            .map(|w| {
                let w = w.borrow();
                let mut events = libc::POLLIN;
                if w.wants_write() {
                    events |= libc::POLLOUT;
                }
                libc::pollfd {
                    fd: w.fd(),
                    events,
                    revents: 0,
                }
            })
            .collect();

        let rc = unsafe {
            libc::poll(
                fds.as_mut_ptr(),
                fds.len() as libc::nfds_t,
                poll_timeout_ms(timeout),
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                if interrupt::take() {
                    self.interrupted();
                }
                return Ok(Ready::default());
            }
            return Err(err.into());
        }

        let mut ready = Ready::default();
        for (pfd, watcher) in fds.iter().zip(watchers) {
            if pfd.revents & (libc::POLLIN | libc::POLLHUP) != 0 {
                ready.read.push(watcher.clone());
            }
            if pfd.revents & libc::POLLOUT != 0 {
                ready.write.push(watcher.clone());
            }
            if pfd.revents & (libc::POLLERR | libc::POLLNVAL) != 0 {
                ready.except.push(watcher);
            }
        }
        Ok(ready)
    }

    fn interrupted(&self) {
        info!("interrupted, shutting down");
        self.shutdown.set(EXIT_INTERRUPTED);
    }
}

/// `poll` timeout in milliseconds, rounding up so a timer is never polled
/// for zero when it is still in the future
fn poll_timeout_ms(timeout: Option<Duration>) -> libc::c_int {
    match timeout {
        None => -1,
        Some(d) => {
            let mut ms = d.as_millis();
            if Duration::from_millis(ms as u64) < d {
                ms += 1;
            }
            ms.min(libc::c_int::MAX as u128) as libc::c_int
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::{Read, Write};
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    struct FixedTimer {
        at: Option<Instant>,
        fired: u32,
        repeat: bool,
        shutdown: Option<(ShutdownCode, i32)>,
    }

    impl FixedTimer {
        fn new(at: Option<Instant>) -> Self {
            Self {
                at,
                fired: 0,
                repeat: false,
                shutdown: None,
            }
        }
    }

    impl Timer for FixedTimer {
        fn next_fire(&self) -> Option<Instant> {
            self.at
        }

        fn alarm(&mut self) -> Result<()> {
            self.fired += 1;
            self.at = self.repeat.then(Instant::now);
            if let Some((code, value)) = &self.shutdown {
                code.set(*value);
            }
            Ok(())
        }
    }

    struct StreamWatcher {
        stream: UnixStream,
        reads: Vec<u8>,
        quit: Option<ShutdownCode>,
    }

    impl FdWatcher for StreamWatcher {
        fn fd(&self) -> RawFd {
            self.stream.as_raw_fd()
        }

        fn on_readable(&mut self) -> Result<()> {
            let mut buf = [0u8; 16];
            let n = self.stream.read(&mut buf)?;
            self.reads.extend_from_slice(&buf[..n]);
            if let Some(code) = &self.quit {
                code.set(EXIT_QUIT_KEY);
            }
            Ok(())
        }
    }

    fn timer(at: Option<Instant>) -> Rc<RefCell<FixedTimer>> {
        Rc::new(RefCell::new(FixedTimer::new(at)))
    }

    fn register_timer(reactor: &mut Reactor, t: &Rc<RefCell<FixedTimer>>) {
        let t: Rc<RefCell<dyn Timer>> = t.clone();
        reactor.add_timer(Rc::downgrade(&t));
    }

    #[test]
    fn test_timeout_is_earliest_timer() {
        let mut reactor = Reactor::new(Budgets::default());
        let now = Instant::now();
        let a = timer(Some(now + Duration::from_secs(5)));
        let b = timer(Some(now + Duration::from_secs(2)));
        let c = timer(None);
        for t in [&a, &b, &c] {
            register_timer(&mut reactor, t);
        }

        assert_eq!(reactor.next_timeout(now), Some(Duration::from_secs(2)));
    }

    #[test]
    fn test_timeout_without_timers_waits_forever() {
        let mut reactor = Reactor::new(Budgets::default());
        let idle = timer(None);
        register_timer(&mut reactor, &idle);
        assert_eq!(reactor.next_timeout(Instant::now()), None);
    }

    #[test]
    fn test_overdue_timer_gives_zero_timeout() {
        let mut reactor = Reactor::new(Budgets::default());
        let now = Instant::now();
        let t = timer(Some(now));
        register_timer(&mut reactor, &t);
        assert_eq!(
            reactor.next_timeout(now + Duration::from_secs(1)),
            Some(Duration::ZERO)
        );
    }

    #[test]
    fn test_dropped_timer_is_pruned() {
        let mut reactor = Reactor::new(Budgets::default());
        let now = Instant::now();
        {
            let t = timer(Some(now + Duration::from_secs(1)));
            register_timer(&mut reactor, &t);
        }
        assert_eq!(reactor.next_timeout(now), None);
        assert!(reactor.timers.is_empty());
    }

    #[test]
    fn test_shutdown_code_first_writer_wins() {
        let code = ShutdownCode::new();
        assert!(!code.is_set());
        assert!(code.set(0));
        assert!(!code.set(5));
        assert_eq!(code.get(), Some(0));

        let other = code.clone();
        assert!(!other.set(3));
        assert_eq!(other.get(), Some(0));
    }

    #[test]
    fn test_poll_timeout_rounds_up() {
        assert_eq!(poll_timeout_ms(None), -1);
        assert_eq!(poll_timeout_ms(Some(Duration::ZERO)), 0);
        assert_eq!(poll_timeout_ms(Some(Duration::from_micros(1500))), 2);
        assert_eq!(poll_timeout_ms(Some(Duration::from_secs(2))), 2000);
    }

    #[test]
    fn test_budget_overrun_is_not_fatal() {
        let budget = Budget::new("tick", Duration::from_millis(1));
        let value = budget.run(|| {
            std::thread::sleep(Duration::from_millis(5));
            42
        });
        assert_eq!(value, 42);
        assert!(budget.exceeded_by(Duration::from_millis(5)));
        assert!(!budget.exceeded_by(Duration::from_micros(500)));
    }

    #[test]
    #[serial]
    fn test_tick_hook_stops_loop() {
        let mut reactor = Reactor::new(Budgets::default());
        let code = reactor.shutdown();
        let count = Rc::new(Cell::new(0));
        let seen = count.clone();
        reactor.add_tick(move || {
            seen.set(seen.get() + 1);
            if seen.get() == 3 {
                code.set(4);
            }
            Ok(())
        });
        // An always-due timer keeps poll from blocking
        let t = timer(Some(Instant::now()));
        t.borrow_mut().repeat = true;
        register_timer(&mut reactor, &t);

        assert_eq!(reactor.run().unwrap(), 4);
        assert_eq!(count.get(), 3);
    }

    #[test]
    #[serial]
    fn test_due_timer_fires_once_and_sets_code() {
        let mut reactor = Reactor::new(Budgets::default());
        let t = timer(Some(Instant::now()));
        t.borrow_mut().shutdown = Some((reactor.shutdown(), 7));
        register_timer(&mut reactor, &t);

        assert_eq!(reactor.run().unwrap(), 7);
        assert_eq!(t.borrow().fired, 1);
    }

    struct Rescheduler {
        stream: UnixStream,
        timer: Rc<RefCell<FixedTimer>>,
    }

    impl FdWatcher for Rescheduler {
        fn fd(&self) -> RawFd {
            self.stream.as_raw_fd()
        }

        fn on_readable(&mut self) -> Result<()> {
            let mut buf = [0u8; 8];
            let _ = self.stream.read(&mut buf)?;
            self.timer.borrow_mut().at = Some(Instant::now());
            Ok(())
        }
    }

    #[test]
    #[serial]
    fn test_alarm_uses_fire_time_snapshotted_before_wait() {
        let mut reactor = Reactor::new(Budgets::default());
        let t = timer(Some(Instant::now() + Duration::from_secs(3600)));
        register_timer(&mut reactor, &t);

        let (local, mut remote) = UnixStream::pair().unwrap();
        remote.write_all(b"r").unwrap();
        let watcher = Rc::new(RefCell::new(Rescheduler {
            stream: local,
            timer: t.clone(),
        }));
        let w: Rc<RefCell<dyn FdWatcher>> = watcher.clone();
        reactor.add_watcher(Rc::downgrade(&w));

        // Pulled forward during dispatch: the snapshot still says an hour
        reactor.iterate().unwrap();
        assert_eq!(t.borrow().fired, 0);

        reactor.iterate().unwrap();
        assert_eq!(t.borrow().fired, 1);
    }

    #[test]
    #[serial]
    fn test_ready_fds_all_dispatched_before_exit() {
        let mut reactor = Reactor::new(Budgets::default());
        let (a_local, mut a_remote) = UnixStream::pair().unwrap();
        let (b_local, mut b_remote) = UnixStream::pair().unwrap();
        a_remote.write_all(b"x").unwrap();
        b_remote.write_all(b"y").unwrap();

        let a = Rc::new(RefCell::new(StreamWatcher {
            stream: a_local,
            reads: Vec::new(),
            quit: Some(reactor.shutdown()),
        }));
        let b = Rc::new(RefCell::new(StreamWatcher {
            stream: b_local,
            reads: Vec::new(),
            quit: None,
        }));
        for w in [&a, &b] {
            let w: Rc<RefCell<dyn FdWatcher>> = w.clone();
            reactor.add_watcher(Rc::downgrade(&w));
        }

        assert_eq!(reactor.run().unwrap(), EXIT_QUIT_KEY);
        assert_eq!(a.borrow().reads, b"x");
        assert_eq!(b.borrow().reads, b"y", "second watcher still ran");
    }

    #[test]
    #[serial]
    fn test_preselect_runs_before_wait() {
        let mut reactor = Reactor::new(Budgets::default());
        let (local, remote) = UnixStream::pair().unwrap();
        let watcher = Rc::new(RefCell::new(StreamWatcher {
            stream: local,
            reads: Vec::new(),
            quit: Some(reactor.shutdown()),
        }));
        let w: Rc<RefCell<dyn FdWatcher>> = watcher.clone();
        reactor.add_watcher(Rc::downgrade(&w));

        // The only thing that makes the fd readable is the preselect hook
        let mut remote = Some(remote);
        reactor.add_preselect(move || {
            if let Some(mut r) = remote.take() {
                r.write_all(b"flush")?;
            }
            Ok(())
        });

        assert_eq!(reactor.run().unwrap(), EXIT_QUIT_KEY);
        assert_eq!(watcher.borrow().reads, b"flush");
    }

    #[test]
    #[serial]
    fn test_handler_error_propagates() {
        let mut reactor = Reactor::new(Budgets::default());
        reactor.add_tick(|| anyhow::bail!("boom"));
        let err = reactor.run().unwrap_err();
        assert!(err.to_string().contains("boom"));
        assert!(!reactor.shutdown().is_set());
    }

    #[test]
    #[serial]
    fn test_interrupt_sets_default_code() {
        let mut reactor = Reactor::new(Budgets::default());
        let _ = interrupt::take();
        reactor.add_tick(|| {
            interrupt::raise();
            Ok(())
        });
        assert_eq!(reactor.run().unwrap(), EXIT_INTERRUPTED);
    }
}
