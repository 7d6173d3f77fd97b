//! Echoes bytes through a serial channel opened on an in-process pty pair.
//!
//! Run with `RUST_LOG=serial_channel=trace cargo run --example loopback` to
//! watch the channel's fill/notify cycle.

use std::ffi::CStr;
use std::time::Duration;

use serial_channel::{Baud115200, LineSettings, OpenMode, PollLoop, SerialChannel};

fn main() -> serial_channel::Result<()> {
    env_logger::init();

    let (master, slave_path) = open_pty();
    println!("channel device: {}", slave_path);

    let event_loop = PollLoop::new();
    let channel = SerialChannel::new(&slave_path, event_loop.handle());

    channel.borrow_mut().set_line_settings(LineSettings {
        baud_rate: Baud115200,
        ..Default::default()
    })?;
    channel.borrow_mut().open(OpenMode::read_write())?;

    // echo whatever arrives back out through the channel
    let echo = channel.clone();
    channel.borrow_mut().on_ready_read(move || {
        let mut buf = [0u8; 256];
        let n = echo.borrow_mut().read(&mut buf).unwrap_or(0);
        if n > 0 {
            println!("channel received {:?}", String::from_utf8_lossy(&buf[..n]));
            let _ = echo.borrow_mut().write(&buf[..n]);
        }
    });

    write_master(master, b"hello, channel\n");

    for _ in 0..20 {
        event_loop.turn(Some(Duration::from_millis(50)))?;
    }

    let echoed = read_master(master);
    println!("remote end got back {:?}", String::from_utf8_lossy(&echoed));

    channel.borrow_mut().close();
    unsafe { libc::close(master) };
    Ok(())
}

fn open_pty() -> (libc::c_int, String) {
    unsafe {
        let master = libc::posix_openpt(libc::O_RDWR | libc::O_NOCTTY);
        assert!(master >= 0, "posix_openpt failed");
        assert_eq!(libc::grantpt(master), 0);
        assert_eq!(libc::unlockpt(master), 0);

        let mut name = [0 as libc::c_char; 128];

        #[cfg(target_os = "linux")]
        assert_eq!(
            libc::ptsname_r(master, name.as_mut_ptr(), name.len() as libc::size_t),
            0
        );

        #[cfg(not(target_os = "linux"))]
        {
            let ptr = libc::ptsname(master);
            assert!(!ptr.is_null());
            libc::strncpy(name.as_mut_ptr(), ptr, name.len() - 1);
        }

        let path = CStr::from_ptr(name.as_ptr()).to_string_lossy().into_owned();
        (master, path)
    }
}

fn write_master(master: libc::c_int, bytes: &[u8]) {
    let rv = unsafe {
        libc::write(
            master,
            bytes.as_ptr() as *const libc::c_void,
            bytes.len() as libc::size_t,
        )
    };
    assert_eq!(rv, bytes.len() as isize);
}

fn read_master(master: libc::c_int) -> Vec<u8> {
    let mut pollfd = libc::pollfd {
        fd: master,
        events: libc::POLLIN,
        revents: 0,
    };
    let ready = unsafe { libc::poll(&mut pollfd, 1, 1000) };
    assert!(ready > 0, "nothing echoed back");

    let mut buf = vec![0u8; 256];
    let rv = unsafe {
        libc::read(
            master,
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len() as libc::size_t,
        )
    };
    assert!(rv >= 0);
    buf.truncate(rv as usize);
    buf
}
