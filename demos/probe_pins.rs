//! Toggles RTS/DTR on a real serial device and reports the input pins.
//!
//! Pass one or more device paths: `cargo run --example probe_pins /dev/ttyUSB0`.

use std::cell::RefCell;
use std::env;
use std::rc::Rc;
use std::thread;
use std::time::Duration;

use serial_channel::{OpenMode, PollLoop, SerialChannel};

fn main() {
    env_logger::init();

    let event_loop = PollLoop::new();

    for arg in env::args_os().skip(1) {
        let channel = SerialChannel::new(&arg, event_loop.handle());
        channel.borrow_mut().open(OpenMode::read_write()).unwrap();
        println!("opened device {:?}", arg);
        probe_pins(&channel).unwrap();
    }
}

fn probe_pins(channel: &Rc<RefCell<SerialChannel>>) -> serial_channel::Result<()> {
    let mut channel = channel.borrow_mut();

    channel.set_rts(false)?;
    channel.set_dtr(false)?;

    let mut rts = false;
    let mut dtr = false;
    let mut toggle = true;

    loop {
        thread::sleep(Duration::from_secs(1));

        if toggle {
            rts = !rts;
            channel.set_rts(rts)?;
        } else {
            dtr = !dtr;
            channel.set_dtr(dtr)?;
        }

        println!(
            "RTS={:5?} DTR={:5?} CTS={:5?} DSR={:5?} RI={:5?} CD={:?}",
            rts,
            dtr,
            channel.read_cts()?,
            channel.read_dsr()?,
            channel.read_ri()?,
            channel.read_cd()?
        );

        toggle = !toggle;
    }
}
