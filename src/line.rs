//! Translation between [`LineSettings`] and the termios representation.
//!
//! Encoding is all-or-nothing: a configuration the platform cannot express
//! is rejected before any flag of the output termios is touched.

use libc::tcflag_t;
use termios::os::target::{B115200, B57600};
use termios::{
    cfgetispeed, cfgetospeed, cfmakeraw, cfsetspeed, Termios, B110, B1200, B19200, B2400, B300,
    B38400, B4800, B600, B9600, CLOCAL, CREAD, CS5, CS6, CS7, CS8, CSIZE, CSTOPB, IGNPAR, INPCK,
    IXOFF, IXON, PARENB, PARODD, VMIN, VTIME,
};

use crate::error::{self, Error, ErrorKind, Result};
use crate::{BaudRate, CharSize, FlowControl, LineSettings, Parity, StopBits};

/// Extended parity flag for mark/space parity, where the platform has one.
#[cfg(any(target_os = "linux", target_os = "android"))]
const MARK_SPACE: Option<tcflag_t> = Some(libc::CMSPAR as tcflag_t);

#[cfg(not(any(target_os = "linux", target_os = "android")))]
const MARK_SPACE: Option<tcflag_t> = None;

/// RTS/CTS flag, where the platform has one.
#[cfg(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "freebsd",
    target_os = "openbsd"
))]
const RTS_CTS: Option<tcflag_t> = Some(termios::os::target::CRTSCTS);

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "freebsd",
    target_os = "openbsd"
)))]
const RTS_CTS: Option<tcflag_t> = None;

/// Converts a device snapshot into the raw mode the channel operates in:
/// no canonical processing, no echo, no signal generation, receiver on,
/// modem-control lines ignored, and zero-character non-blocking reads.
pub(crate) fn raw_init(termios: &mut Termios) {
    cfmakeraw(termios);

    termios.c_cflag |= CREAD | CLOCAL;
    termios.c_cc[VMIN] = 0;
    termios.c_cc[VTIME] = 0;
}

/// Checks that every field of `settings` is expressible on this platform.
///
/// Fails with `Unsupported` and a descriptive message, leaving nothing
/// mutated, so callers can validate before staging a configuration.
pub(crate) fn validate(settings: &LineSettings) -> Result<()> {
    if matches!(settings.parity, Parity::ParityMark | Parity::ParitySpace)
        && MARK_SPACE.is_none()
    {
        return Err(Error::new(
            ErrorKind::Unsupported,
            "Space/Mark parity not supported",
        ));
    }

    if settings.flow_control == FlowControl::FlowHardware && RTS_CTS.is_none() {
        return Err(Error::new(
            ErrorKind::Unsupported,
            "Hardware flow control not supported",
        ));
    }

    Ok(())
}

/// Encodes `settings` into `termios`.
///
/// The output should start from a [`raw_init`] base; every encoded field
/// clears the flags it owns before setting them, so re-encoding over a
/// previously encoded termios is also sound.
pub(crate) fn encode(settings: &LineSettings, termios: &mut Termios) -> Result<()> {
    validate(settings)?;

    cfsetspeed(termios, baud_flag(settings.baud_rate)).map_err(error::from_io_error)?;

    // character size
    let size = match settings.char_size {
        CharSize::Bits5 => CS5,
        CharSize::Bits6 => CS6,
        CharSize::Bits7 => CS7,
        CharSize::Bits8 => CS8,
    };
    termios.c_cflag &= !CSIZE;
    termios.c_cflag |= size;

    // parity
    match settings.parity {
        Parity::ParityNone => {
            termios.c_cflag &= !(PARENB | PARODD);
            if let Some(cmspar) = MARK_SPACE {
                termios.c_cflag &= !cmspar;
            }
            termios.c_iflag &= !INPCK;
            termios.c_iflag |= IGNPAR;
        }
        Parity::ParityOdd => {
            termios.c_cflag |= PARENB | PARODD;
            if let Some(cmspar) = MARK_SPACE {
                termios.c_cflag &= !cmspar;
            }
            termios.c_iflag |= INPCK;
            termios.c_iflag &= !IGNPAR;
        }
        Parity::ParityEven => {
            termios.c_cflag &= !PARODD;
            termios.c_cflag |= PARENB;
            if let Some(cmspar) = MARK_SPACE {
                termios.c_cflag &= !cmspar;
            }
            termios.c_iflag |= INPCK;
            termios.c_iflag &= !IGNPAR;
        }
        Parity::ParityMark | Parity::ParitySpace => {
            // validated above; unreachable on platforms without the flag
            let Some(cmspar) = MARK_SPACE else {
                return Err(Error::new(
                    ErrorKind::Unsupported,
                    "Space/Mark parity not supported",
                ));
            };

            termios.c_cflag |= PARENB | cmspar;
            if settings.parity == Parity::ParityMark {
                termios.c_cflag |= PARODD;
            } else {
                termios.c_cflag &= !PARODD;
            }
            termios.c_iflag |= INPCK;
            termios.c_iflag &= !IGNPAR;
        }
    };

    // stop bits
    match settings.stop_bits {
        StopBits::Stop1 => termios.c_cflag &= !CSTOPB,
        StopBits::Stop2 => termios.c_cflag |= CSTOPB,
    };

    // flow control
    match settings.flow_control {
        FlowControl::FlowNone => {
            termios.c_iflag &= !(IXON | IXOFF);
            if let Some(rtscts) = RTS_CTS {
                termios.c_cflag &= !rtscts;
            }
        }
        FlowControl::FlowSoftware => {
            termios.c_iflag |= IXON | IXOFF;
            if let Some(rtscts) = RTS_CTS {
                termios.c_cflag &= !rtscts;
            }
        }
        FlowControl::FlowHardware => {
            let Some(rtscts) = RTS_CTS else {
                return Err(Error::new(
                    ErrorKind::Unsupported,
                    "Hardware flow control not supported",
                ));
            };

            termios.c_iflag &= !(IXON | IXOFF);
            termios.c_cflag |= rtscts;
        }
    };

    Ok(())
}

fn baud_flag(rate: BaudRate) -> libc::speed_t {
    match rate {
        BaudRate::Baud110 => B110,
        BaudRate::Baud300 => B300,
        BaudRate::Baud600 => B600,
        BaudRate::Baud1200 => B1200,
        BaudRate::Baud2400 => B2400,
        BaudRate::Baud4800 => B4800,
        BaudRate::Baud9600 => B9600,
        BaudRate::Baud19200 => B19200,
        BaudRate::Baud38400 => B38400,
        BaudRate::Baud57600 => B57600,
        BaudRate::Baud115200 => B115200,
    }
}

/// Decodes the baud rate, if both directions agree on an enumerated rate.
pub(crate) fn baud_rate(termios: &Termios) -> Option<BaudRate> {
    let ospeed = cfgetospeed(termios);
    let ispeed = cfgetispeed(termios);

    if ospeed != ispeed {
        return None;
    }

    match ospeed {
        B110 => Some(BaudRate::Baud110),
        B300 => Some(BaudRate::Baud300),
        B600 => Some(BaudRate::Baud600),
        B1200 => Some(BaudRate::Baud1200),
        B2400 => Some(BaudRate::Baud2400),
        B4800 => Some(BaudRate::Baud4800),
        B9600 => Some(BaudRate::Baud9600),
        B19200 => Some(BaudRate::Baud19200),
        B38400 => Some(BaudRate::Baud38400),
        B57600 => Some(BaudRate::Baud57600),
        B115200 => Some(BaudRate::Baud115200),
        _ => None,
    }
}

pub(crate) fn char_size(termios: &Termios) -> Option<CharSize> {
    match termios.c_cflag & CSIZE {
        CS5 => Some(CharSize::Bits5),
        CS6 => Some(CharSize::Bits6),
        CS7 => Some(CharSize::Bits7),
        CS8 => Some(CharSize::Bits8),

        _ => None,
    }
}

pub(crate) fn parity(termios: &Termios) -> Option<Parity> {
    if termios.c_cflag & PARENB == 0 {
        return Some(Parity::ParityNone);
    }

    if let Some(cmspar) = MARK_SPACE {
        if termios.c_cflag & cmspar != 0 {
            if termios.c_cflag & PARODD != 0 {
                return Some(Parity::ParityMark);
            } else {
                return Some(Parity::ParitySpace);
            }
        }
    }

    if termios.c_cflag & PARODD != 0 {
        Some(Parity::ParityOdd)
    } else {
        Some(Parity::ParityEven)
    }
}

pub(crate) fn stop_bits(termios: &Termios) -> Option<StopBits> {
    if termios.c_cflag & CSTOPB != 0 {
        Some(StopBits::Stop2)
    } else {
        Some(StopBits::Stop1)
    }
}

pub(crate) fn flow_control(termios: &Termios) -> Option<FlowControl> {
    if let Some(rtscts) = RTS_CTS {
        if termios.c_cflag & rtscts != 0 {
            return Some(FlowControl::FlowHardware);
        }
    }

    if termios.c_iflag & (IXON | IXOFF) != 0 {
        Some(FlowControl::FlowSoftware)
    } else {
        Some(FlowControl::FlowNone)
    }
}
