//! Event-driven serial port channel for POSIX systems.
//!
//! A [`SerialChannel`] owns the file descriptor of a serial device, manages
//! its line discipline (baud rate, character size, stop bits, parity, flow
//! control) through the terminal control interface, and bridges read-readiness
//! events from a host event loop into an internal byte buffer. Reads and
//! writes never block: a read serves whatever is already buffered, and the
//! channel signals "ready to read" through a callback delivered between event
//! loop turns.
//!
//! The channel does not poll the device itself. It registers a read watch
//! with a readiness service — [`PollLoop`] is the adapter provided by this
//! crate — and the service invokes the channel whenever the descriptor
//! becomes readable.
//!
//! ```no_run
//! use serial_channel::{OpenMode, PollLoop, SerialChannel};
//!
//! fn main() -> serial_channel::Result<()> {
//!     let event_loop = PollLoop::new();
//!
//!     let channel = SerialChannel::new("/dev/ttyUSB0", event_loop.handle());
//!     channel.borrow_mut().open(OpenMode::read_write())?;
//!
//!     let reader = channel.clone();
//!     channel.borrow_mut().on_ready_read(move || {
//!         let mut buf = [0u8; 256];
//!         let n = reader.borrow_mut().read(&mut buf).unwrap_or(0);
//!         println!("received {:?}", &buf[..n]);
//!     });
//!
//!     loop {
//!         event_loop.turn(None)?;
//!     }
//! }
//! ```

pub use crate::BaudRate::*;
pub use crate::CharSize::*;
pub use crate::FlowControl::*;
pub use crate::Parity::*;
pub use crate::StopBits::*;

pub use crate::channel::SerialChannel;
pub use crate::error::{Error, ErrorKind, Result};
pub use crate::poll::{LoopHandle, PollLoop, ReadWatch};

mod channel;
mod error;
mod line;
mod poll;

/// Serial port baud rates.
///
/// The set is closed: rates outside this enumeration are not representable
/// and therefore cannot be requested.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BaudRate {
    /** 110 baud. */
    Baud110,
    /** 300 baud. */
    Baud300,
    /** 600 baud. */
    Baud600,
    /** 1200 baud. */
    Baud1200,
    /** 2400 baud. */
    Baud2400,
    /** 4800 baud. */
    Baud4800,
    /** 9600 baud. */
    Baud9600,
    /** 19,200 baud. */
    Baud19200,
    /** 38,400 baud. */
    Baud38400,
    /** 57,600 baud. */
    Baud57600,
    /** 115,200 baud. */
    Baud115200,
}

impl BaudRate {
    /// Returns the numeric bit rate.
    pub fn speed(&self) -> u32 {
        match *self {
            Baud110 => 110,
            Baud300 => 300,
            Baud600 => 600,
            Baud1200 => 1200,
            Baud2400 => 2400,
            Baud4800 => 4800,
            Baud9600 => 9600,
            Baud19200 => 19200,
            Baud38400 => 38400,
            Baud57600 => 57600,
            Baud115200 => 115_200,
        }
    }

    /// Looks up the enumerated rate for a numeric bit rate.
    ///
    /// Returns `None` for anything outside the supported set.
    pub fn from_speed(speed: u32) -> Option<BaudRate> {
        match speed {
            110 => Some(Baud110),
            300 => Some(Baud300),
            600 => Some(Baud600),
            1200 => Some(Baud1200),
            2400 => Some(Baud2400),
            4800 => Some(Baud4800),
            9600 => Some(Baud9600),
            19200 => Some(Baud19200),
            38400 => Some(Baud38400),
            57600 => Some(Baud57600),
            115_200 => Some(Baud115200),
            _ => None,
        }
    }
}

/// Number of bits per character.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CharSize {
    /** 5 bits per character. */
    Bits5,
    /** 6 bits per character. */
    Bits6,
    /** 7 bits per character. */
    Bits7,
    /** 8 bits per character. */
    Bits8,
}

/// Parity checking modes.
///
/// Mark and space parity transmit a constant parity bit. They require
/// platform support and are rejected with a descriptive error where the
/// platform does not expose the extended parity flag.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Parity {
    /// No parity bit.
    ParityNone,

    /// Parity bit sets odd number of 1 bits.
    ParityOdd,

    /// Parity bit sets even number of 1 bits.
    ParityEven,

    /// Parity bit is always 1.
    ParityMark,

    /// Parity bit is always 0.
    ParitySpace,
}

/// Number of stop bits transmitted after every character.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StopBits {
    /// One stop bit.
    Stop1,

    /// Two stop bits.
    Stop2,
}

/// Flow control modes.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FlowControl {
    /// No flow control.
    FlowNone,

    /// Flow control using XON/XOFF bytes.
    FlowSoftware,

    /// Flow control using RTS/CTS signals.
    FlowHardware,
}

/// A device-independent line-discipline configuration.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct LineSettings {
    /// Baud rate.
    pub baud_rate: BaudRate,

    /// Character size.
    pub char_size: CharSize,

    /// Parity checking mode.
    pub parity: Parity,

    /// Number of stop bits.
    pub stop_bits: StopBits,

    /// Flow control mode.
    pub flow_control: FlowControl,
}

impl Default for LineSettings {
    fn default() -> Self {
        LineSettings {
            baud_rate: Baud9600,
            char_size: Bits8,
            parity: ParityNone,
            stop_bits: StopBits::Stop1,
            flow_control: FlowNone,
        }
    }
}

/// Requested access direction for [`SerialChannel::open`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Access {
    /// Open for reading only.
    ReadOnly,
    /// Open for writing only.
    WriteOnly,
    /// Open for reading and writing.
    ReadWrite,
}

/// How a channel is opened: access direction plus an optional unbuffered
/// modifier.
///
/// In the default buffered mode, readiness events drain the kernel queue
/// into the channel's internal buffer before the consumer is notified. In
/// unbuffered mode the readiness event is forwarded to the consumer as-is
/// and the consumer reads straight from the device.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct OpenMode {
    access: Access,
    unbuffered: bool,
}

impl OpenMode {
    /// Read-only, buffered.
    pub fn read_only() -> Self {
        OpenMode {
            access: Access::ReadOnly,
            unbuffered: false,
        }
    }

    /// Write-only, buffered.
    pub fn write_only() -> Self {
        OpenMode {
            access: Access::WriteOnly,
            unbuffered: false,
        }
    }

    /// Read-write, buffered.
    pub fn read_write() -> Self {
        OpenMode {
            access: Access::ReadWrite,
            unbuffered: false,
        }
    }

    /// Switches the mode to unbuffered delivery.
    pub fn unbuffered(mut self) -> Self {
        self.unbuffered = true;
        self
    }

    /// The access direction.
    pub fn access(&self) -> Access {
        self.access
    }

    /// Whether readiness events bypass the internal buffer.
    pub fn is_unbuffered(&self) -> bool {
        self.unbuffered
    }

    /// Whether the mode permits reading.
    pub fn readable(&self) -> bool {
        matches!(self.access, Access::ReadOnly | Access::ReadWrite)
    }

    /// Whether the mode permits writing.
    pub fn writable(&self) -> bool {
        matches!(self.access, Access::WriteOnly | Access::ReadWrite)
    }
}
