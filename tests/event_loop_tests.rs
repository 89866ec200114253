// Event loop integration tests
//
// Runs the reactor with a session registered as an fd watcher. Events queued
// on the in-memory transport make its descriptor readable, so the full
// tick / flush / poll / dispatch cycle is exercised.

use serial_test::serial;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Instant;
use wlsession::config::{KeyboardConfig, ReactorConfig};
use wlsession::protocol::{Capability, Event, KeyboardEvent, SeatEvent, KEYMAP_FORMAT_XKB_V1};
use wlsession::reactor::Timer;
use wlsession::testing::{keymap_fd, FakeProtocol, Request, TableCompiler};
use wlsession::{Reactor, Session, EXIT_QUIT_KEY};

const SEAT: u32 = 4;

fn connect(reactor: &mut Reactor, keyboard: &KeyboardConfig) -> Rc<RefCell<Session<FakeProtocol>>> {
    let mut fake = FakeProtocol::compositor();
    fake.add_global(SEAT, "wl_seat");
    Session::connect(reactor, fake, Box::new(TableCompiler), keyboard).unwrap()
}

fn type_key(session: &Rc<RefCell<Session<FakeProtocol>>>, keymap: &str, key: u32) {
    let (fd, size) = keymap_fd(keymap).unwrap();
    let mut session = session.borrow_mut();
    let fake = session.protocol_mut();
    fake.push_event(Event::Seat {
        seat: SEAT,
        event: SeatEvent::Capabilities(Capability::KEYBOARD),
    });
    fake.push_event(Event::Keyboard {
        seat: SEAT,
        event: KeyboardEvent::Keymap {
            format: KEYMAP_FORMAT_XKB_V1,
            fd,
            size,
        },
    });
    fake.push_event(Event::Keyboard {
        seat: SEAT,
        event: KeyboardEvent::Key {
            serial: 1,
            time: 0,
            key,
            pressed: true,
        },
    });
}

/// Fires once, right away
struct Stop {
    fired: bool,
    shutdown: wlsession::ShutdownCode,
}

impl Timer for Stop {
    fn next_fire(&self) -> Option<Instant> {
        (!self.fired).then(Instant::now)
    }

    fn alarm(&mut self) -> anyhow::Result<()> {
        self.fired = true;
        self.shutdown.set(42);
        Ok(())
    }
}

#[test]
#[serial]
fn test_quit_key_ends_the_loop() {
    let mut reactor = Reactor::from_config(&ReactorConfig::default());
    let session = connect(&mut reactor, &KeyboardConfig::default());

    // evdev 16 + 8 = xkb 24
    type_key(&session, "24=q", 16);

    assert_eq!(reactor.run().unwrap(), EXIT_QUIT_KEY);
    assert_eq!(
        session
            .borrow()
            .protocol()
            .count(|r| *r == Request::GetKeyboard(SEAT)),
        1
    );
}

#[test]
#[serial]
fn test_configured_quit_character() {
    let mut reactor = Reactor::from_config(&ReactorConfig::default());
    let keyboard = KeyboardConfig { quit_character: 'x' };
    let session = connect(&mut reactor, &keyboard);

    type_key(&session, "53=x", 45);
    assert_eq!(reactor.run().unwrap(), EXIT_QUIT_KEY);
}

#[test]
#[serial]
fn test_other_keys_keep_running() {
    let mut reactor = Reactor::from_config(&ReactorConfig::default());
    let session = connect(&mut reactor, &KeyboardConfig::default());
    type_key(&session, "38=a", 30);

    let timer: Rc<RefCell<dyn Timer>> = Rc::new(RefCell::new(Stop {
        fired: false,
        shutdown: reactor.shutdown(),
    }));
    reactor.add_timer(Rc::downgrade(&timer));

    // The timer wins because typing 'a' does not quit
    assert_eq!(reactor.run().unwrap(), 42);
}

#[test]
#[serial]
fn test_flush_happens_before_every_wait() {
    let mut reactor = Reactor::from_config(&ReactorConfig::default());
    let session = connect(&mut reactor, &KeyboardConfig::default());

    let iterations = Rc::new(Cell::new(0u32));
    let counter = iterations.clone();
    let shutdown = reactor.shutdown();
    let weak = Rc::downgrade(&session);
    reactor.add_tick(move || {
        counter.set(counter.get() + 1);
        // A queued ping keeps the descriptor readable, so no wait blocks
        if let Some(session) = weak.upgrade() {
            session
                .borrow_mut()
                .protocol_mut()
                .push_event(Event::Ping { serial: counter.get() });
        }
        if counter.get() == 3 {
            shutdown.set(0);
        }
        Ok(())
    });

    // The iteration that sets the code still runs to completion
    assert_eq!(reactor.run().unwrap(), 0);
    assert_eq!(iterations.get(), 3);

    let session = session.borrow();
    let requests = session.protocol().requests();
    assert_eq!(session.protocol().count(|r| *r == Request::Flush), 3);
    for serial in 1..=3 {
        let flush = requests
            .iter()
            .enumerate()
            .filter(|(_, r)| **r == Request::Flush)
            .nth(serial as usize - 1)
            .map(|(i, _)| i)
            .unwrap();
        let pong = requests
            .iter()
            .position(|r| *r == Request::Pong(serial))
            .unwrap();
        assert!(flush < pong, "flush {} should precede pong {}", serial, serial);
    }
}

#[test]
#[serial]
fn test_dropped_session_is_no_longer_watched() {
    let mut reactor = Reactor::from_config(&ReactorConfig::default());
    let session = connect(&mut reactor, &KeyboardConfig::default());
    drop(session);

    let timer: Rc<RefCell<dyn Timer>> = Rc::new(RefCell::new(Stop {
        fired: false,
        shutdown: reactor.shutdown(),
    }));
    reactor.add_timer(Rc::downgrade(&timer));
    assert_eq!(reactor.run().unwrap(), 42);
}
