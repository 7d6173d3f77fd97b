//! Loopback tests against a pseudo-terminal pair.
//!
//! The channel opens the pty slave as its serial device; the tests play the
//! role of the remote end by reading and writing the master descriptor.
//! Bytes written to the master traverse a kernel work queue before they are
//! visible on the slave, so the tests pump the event loop until the expected
//! state is observed instead of asserting right after a write.

use std::cell::Cell;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;

use libc::{c_void, size_t};

use serial_channel::{
    Baud115200, Bits7, ErrorKind, FlowSoftware, LineSettings, OpenMode, ParityEven, PollLoop,
    SerialChannel, StopBits,
};

struct Pty {
    master: libc::c_int,
    slave_path: PathBuf,
}

impl Drop for Pty {
    fn drop(&mut self) {
        unsafe { libc::close(self.master) };
    }
}

fn open_pty() -> Pty {
    let _ = env_logger::builder().is_test(true).try_init();

    unsafe {
        let master = libc::posix_openpt(libc::O_RDWR | libc::O_NOCTTY);
        assert!(master >= 0, "posix_openpt failed");
        assert_eq!(libc::grantpt(master), 0, "grantpt failed");
        assert_eq!(libc::unlockpt(master), 0, "unlockpt failed");

        let mut name = [0 as libc::c_char; 128];

        #[cfg(target_os = "linux")]
        assert_eq!(
            libc::ptsname_r(master, name.as_mut_ptr(), name.len() as size_t),
            0,
            "ptsname_r failed"
        );

        #[cfg(not(target_os = "linux"))]
        {
            let ptr = libc::ptsname(master);
            assert!(!ptr.is_null(), "ptsname failed");
            libc::strncpy(name.as_mut_ptr(), ptr, name.len() - 1);
        }

        let slave_path = std::ffi::CStr::from_ptr(name.as_ptr())
            .to_string_lossy()
            .into_owned();

        Pty {
            master,
            slave_path: PathBuf::from(slave_path),
        }
    }
}

fn write_master(pty: &Pty, bytes: &[u8]) {
    let rv = unsafe {
        libc::write(
            pty.master,
            bytes.as_ptr() as *const c_void,
            bytes.len() as size_t,
        )
    };
    assert_eq!(rv, bytes.len() as isize, "write to pty master failed");
}

/// Reads up to `max` bytes from the master, waiting up to a second for the
/// first byte to arrive.
fn read_master(pty: &Pty, max: usize) -> Vec<u8> {
    let mut pollfd = libc::pollfd {
        fd: pty.master,
        events: libc::POLLIN,
        revents: 0,
    };
    let ready = unsafe { libc::poll(&mut pollfd, 1, 1000) };
    assert!(ready > 0, "pty master never became readable");

    let mut buf = vec![0u8; max];
    let rv = unsafe { libc::read(pty.master, buf.as_mut_ptr() as *mut c_void, max as size_t) };
    assert!(rv >= 0, "read from pty master failed");
    buf.truncate(rv as usize);
    buf
}

const TICK: Option<Duration> = Some(Duration::from_millis(20));

/// Pumps the event loop until `cond` holds.
fn pump_until(event_loop: &PollLoop, mut cond: impl FnMut() -> bool) {
    for _ in 0..250 {
        if cond() {
            return;
        }
        event_loop.turn(TICK).unwrap();
    }
    panic!("condition not reached while pumping the event loop");
}

/// Pumps the event loop until a turn makes progress (dispatches a readiness
/// callback or runs a deferred task).
fn pump_until_progress(event_loop: &PollLoop) {
    for _ in 0..250 {
        if event_loop.turn(TICK).unwrap() > 0 {
            return;
        }
    }
    panic!("event loop never made progress");
}

/// Reads from the channel until `count` bytes arrived.
fn collect_read(channel: &std::rc::Rc<std::cell::RefCell<SerialChannel>>, count: usize) -> Vec<u8> {
    let mut collected = Vec::new();
    for _ in 0..250 {
        let mut buf = [0u8; 64];
        let n = channel.borrow_mut().read(&mut buf).unwrap();
        collected.extend_from_slice(&buf[..n]);
        if collected.len() >= count {
            return collected;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    panic!("expected {} bytes, got {:?}", count, collected);
}

#[test]
fn fill_reports_exact_pending_count() {
    let pty = open_pty();
    let event_loop = PollLoop::new();
    let channel = SerialChannel::new(&pty.slave_path, event_loop.handle());
    channel.borrow_mut().open(OpenMode::read_write()).unwrap();

    write_master(&pty, b"ABCDEFGHIJ");
    pump_until(&event_loop, || channel.borrow().bytes_available() == 10);

    let mut buf = [0u8; 4];
    let n = channel.borrow_mut().read(&mut buf).unwrap();
    assert_eq!(n, 4);
    assert_eq!(&buf, b"ABCD");
    assert_eq!(channel.borrow().bytes_available(), 6);
}

#[test]
fn fifo_order_is_preserved_across_chunked_writes() {
    let pty = open_pty();
    let event_loop = PollLoop::new();
    let channel = SerialChannel::new(&pty.slave_path, event_loop.handle());
    channel.borrow_mut().open(OpenMode::read_write()).unwrap();

    write_master(&pty, b"hello ");
    pump_until(&event_loop, || channel.borrow().bytes_available() >= 6);
    write_master(&pty, b"world");
    pump_until(&event_loop, || channel.borrow().bytes_available() >= 11);

    let mut buf = [0u8; 64];
    let n = channel.borrow_mut().read(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"hello world");
}

#[test]
fn read_beyond_available_returns_only_available() {
    let pty = open_pty();
    let event_loop = PollLoop::new();
    let channel = SerialChannel::new(&pty.slave_path, event_loop.handle());
    channel.borrow_mut().open(OpenMode::read_write()).unwrap();

    write_master(&pty, b"short");
    pump_until(&event_loop, || channel.borrow().bytes_available() == 5);

    let mut buf = [0u8; 32];
    let n = channel.borrow_mut().read(&mut buf).unwrap();
    assert_eq!(n, 5);
    assert_eq!(&buf[..n], b"short");

    // nothing left: another read makes zero progress without blocking
    let n = channel.borrow_mut().read(&mut buf).unwrap();
    assert_eq!(n, 0);
}

#[test]
fn writes_reach_the_device() {
    let pty = open_pty();
    let event_loop = PollLoop::new();
    let channel = SerialChannel::new(&pty.slave_path, event_loop.handle());
    channel.borrow_mut().open(OpenMode::read_write()).unwrap();

    let n = channel.borrow_mut().write(b"ping").unwrap();
    assert_eq!(n, 4);

    assert_eq!(read_master(&pty, 16), b"ping");
}

#[test]
fn ready_read_is_deferred_to_the_following_turn() {
    let pty = open_pty();
    let event_loop = PollLoop::new();
    let channel = SerialChannel::new(&pty.slave_path, event_loop.handle());
    channel.borrow_mut().open(OpenMode::read_write()).unwrap();

    let notified = Rc::new(Cell::new(0));
    let counter = notified.clone();
    channel
        .borrow_mut()
        .on_ready_read(move || counter.set(counter.get() + 1));

    write_master(&pty, b"hi");

    // the turn that dispatches the fill must not deliver the notification
    pump_until_progress(&event_loop);
    assert_eq!(notified.get(), 0);

    event_loop.turn(TICK).unwrap();
    assert_eq!(notified.get(), 1);
}

#[test]
fn unbuffered_mode_forwards_readiness_without_buffering() {
    let pty = open_pty();
    let event_loop = PollLoop::new();
    let channel = SerialChannel::new(&pty.slave_path, event_loop.handle());
    channel
        .borrow_mut()
        .open(OpenMode::read_write().unbuffered())
        .unwrap();

    let notified = Rc::new(Cell::new(0));
    let counter = notified.clone();
    channel
        .borrow_mut()
        .on_ready_read(move || counter.set(counter.get() + 1));

    write_master(&pty, b"raw");

    // forwarded from the dispatching turn itself
    pump_until_progress(&event_loop);
    assert_eq!(notified.get(), 1);

    // the bytes were left in the kernel queue, not pulled into the channel
    assert_eq!(collect_read(&channel, 3), b"raw");
}

#[test]
fn write_failure_disables_the_watch_until_read() {
    let pty = open_pty();
    let event_loop = PollLoop::new();
    let channel = SerialChannel::new(&pty.slave_path, event_loop.handle());
    channel.borrow_mut().open(OpenMode::read_write()).unwrap();

    let notified = Rc::new(Cell::new(0));
    let counter = notified.clone();
    channel
        .borrow_mut()
        .on_ready_read(move || counter.set(counter.get() + 1));

    // jam the transmit path: nobody drains the master, so the kernel queue
    // fills and a non-blocking write eventually fails
    let chunk = [0x55u8; 16384];
    let mut failure = None;
    for _ in 0..64 {
        match channel.borrow_mut().write(&chunk) {
            Ok(_) => continue,
            Err(err) => {
                failure = Some(err);
                break;
            }
        }
    }
    let failure = failure.expect("transmit queue never filled");

    assert!(matches!(failure.kind(), ErrorKind::Io(_)));
    assert!(!failure.to_string().is_empty());
    assert_eq!(
        channel.borrow().last_error(),
        Some(failure.to_string().as_str())
    );

    // the watch is disabled: incoming data no longer triggers a fill
    write_master(&pty, b"XYZ");
    std::thread::sleep(Duration::from_millis(50));
    event_loop.turn(TICK).unwrap();
    event_loop.turn(TICK).unwrap();
    assert_eq!(notified.get(), 0);

    // read re-enables the watch and still serves the pending bytes
    assert_eq!(collect_read(&channel, 3), b"XYZ");

    write_master(&pty, b"more");
    pump_until(&event_loop, || notified.get() > 0);
}

#[test]
fn close_is_idempotent_and_fires_about_to_close_once() {
    let pty = open_pty();
    let event_loop = PollLoop::new();
    let channel = SerialChannel::new(&pty.slave_path, event_loop.handle());
    channel.borrow_mut().open(OpenMode::read_write()).unwrap();

    let observed = Rc::new(Cell::new(0));
    let counter = observed.clone();
    channel
        .borrow_mut()
        .on_about_to_close(move || counter.set(counter.get() + 1));

    channel.borrow_mut().close();
    channel.borrow_mut().close();

    assert!(!channel.borrow().is_open());
    assert_eq!(observed.get(), 1);
}

#[test]
fn reopen_is_a_fresh_lifecycle() {
    let pty = open_pty();
    let event_loop = PollLoop::new();
    let channel = SerialChannel::new(&pty.slave_path, event_loop.handle());
    channel.borrow_mut().open(OpenMode::read_write()).unwrap();

    write_master(&pty, b"stale");
    pump_until(&event_loop, || channel.borrow().bytes_available() == 5);

    channel.borrow_mut().close();
    channel.borrow_mut().open(OpenMode::read_write()).unwrap();

    // bytes from the previous lifecycle are gone
    assert_eq!(channel.borrow().bytes_available(), 0);

    write_master(&pty, b"fresh");
    pump_until(&event_loop, || channel.borrow().bytes_available() == 5);

    let mut buf = [0u8; 16];
    let n = channel.borrow_mut().read(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"fresh");
}

#[test]
fn line_settings_round_trip_through_the_device() {
    let pty = open_pty();
    let event_loop = PollLoop::new();
    let channel = SerialChannel::new(&pty.slave_path, event_loop.handle());
    channel.borrow_mut().open(OpenMode::read_write()).unwrap();

    let settings = LineSettings {
        baud_rate: Baud115200,
        char_size: Bits7,
        parity: ParityEven,
        stop_bits: StopBits::Stop2,
        flow_control: FlowSoftware,
    };

    channel.borrow_mut().set_line_settings(settings).unwrap();

    assert_eq!(channel.borrow().line_settings(), settings);
    assert_eq!(channel.borrow().device_settings().unwrap(), settings);
}

#[cfg(target_os = "linux")]
#[test]
fn mark_and_space_parity_round_trip_through_the_device() {
    use serial_channel::{ParityMark, ParitySpace};

    let pty = open_pty();
    let event_loop = PollLoop::new();
    let channel = SerialChannel::new(&pty.slave_path, event_loop.handle());
    channel.borrow_mut().open(OpenMode::read_write()).unwrap();

    for parity in [ParityMark, ParitySpace] {
        let settings = LineSettings {
            parity,
            ..Default::default()
        };

        channel.borrow_mut().set_line_settings(settings).unwrap();
        assert_eq!(channel.borrow().device_settings().unwrap().parity, parity);
    }
}

#[test]
fn open_while_open_is_rejected() {
    let pty = open_pty();
    let event_loop = PollLoop::new();
    let channel = SerialChannel::new(&pty.slave_path, event_loop.handle());
    channel.borrow_mut().open(OpenMode::read_write()).unwrap();

    let error = channel.borrow_mut().open(OpenMode::read_only()).unwrap_err();
    assert_eq!(error.kind(), ErrorKind::InvalidInput);
    assert!(channel.borrow().is_open());
}

#[test]
fn write_only_channel_rejects_reads() {
    let pty = open_pty();
    let event_loop = PollLoop::new();
    let channel = SerialChannel::new(&pty.slave_path, event_loop.handle());
    channel.borrow_mut().open(OpenMode::write_only()).unwrap();

    let mut buf = [0u8; 4];
    let error = channel.borrow_mut().read(&mut buf).unwrap_err();
    assert_eq!(error.kind(), ErrorKind::InvalidInput);
}
