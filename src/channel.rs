//! The serial channel: descriptor ownership, buffering, and notification.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::rc::{Rc, Weak};

use libc::{c_int, c_void, size_t};
use log::{debug, trace, warn};
use termios::{tcdrain, tcflush, tcsetattr, Termios, TCIFLUSH, TCSANOW};

use crate::error::{self, Error, ErrorKind, Result};
use crate::line;
use crate::poll::{LoopHandle, ReadWatch};
use crate::{Access, LineSettings, OpenMode};

/// An event-driven channel over a POSIX serial device.
///
/// The channel is created closed, pointing at a device node. [`open`] acquires
/// the descriptor exclusively, snapshots the device's line settings (restored
/// verbatim on [`close`]), switches the line to raw mode, and registers a read
/// watch with the readiness service. From then on the host event loop drains
/// the kernel queue into the channel's internal buffer and the consumer is
/// notified through the `ready_read` callback, deferred to the next loop turn.
///
/// All I/O is non-blocking: [`read`] serves at most [`bytes_available`] bytes
/// and returns immediately, and [`write`] goes straight to the descriptor.
///
/// The channel is single-threaded. [`new`] hands out an
/// `Rc<RefCell<SerialChannel>>` shared between the consumer and the readiness
/// callbacks; all mutation happens on the thread that runs the event loop.
///
/// [`new`]: SerialChannel::new
/// [`open`]: SerialChannel::open
/// [`close`]: SerialChannel::close
/// [`read`]: SerialChannel::read
/// [`write`]: SerialChannel::write
/// [`bytes_available`]: SerialChannel::bytes_available
pub struct SerialChannel {
    path: PathBuf,
    service: LoopHandle,
    weak: Weak<RefCell<SerialChannel>>,
    fd: Option<RawFd>,
    mode: Option<OpenMode>,
    reset: Option<Termios>,
    raw: Option<Termios>,
    settings: LineSettings,
    buffer: VecDeque<u8>,
    watch: Option<ReadWatch>,
    last_error: Option<String>,
    ready_read: Option<Rc<dyn Fn()>>,
    about_to_close: Option<Rc<dyn Fn()>>,
}

impl SerialChannel {
    /// Creates a closed channel for the device at `path`.
    ///
    /// `service` is the readiness service the channel will register its read
    /// watch with; obtain it from [`PollLoop::handle`](crate::PollLoop::handle).
    pub fn new<P: AsRef<Path>>(path: P, service: LoopHandle) -> Rc<RefCell<SerialChannel>> {
        let channel = Rc::new(RefCell::new(SerialChannel {
            path: path.as_ref().to_path_buf(),
            service,
            weak: Weak::new(),
            fd: None,
            mode: None,
            reset: None,
            raw: None,
            settings: LineSettings::default(),
            buffer: VecDeque::new(),
            watch: None,
            last_error: None,
            ready_read: None,
            about_to_close: None,
        }));

        channel.borrow_mut().weak = Rc::downgrade(&channel);
        channel
    }

    /// The device node this channel operates on.
    pub fn device(&self) -> &Path {
        &self.path
    }

    /// Whether the channel currently holds an open descriptor.
    pub fn is_open(&self) -> bool {
        self.fd.is_some()
    }

    /// The mode the channel was opened with, or `None` when closed.
    pub fn open_mode(&self) -> Option<OpenMode> {
        self.mode
    }

    /// The line settings the channel intends to apply (and has applied, if
    /// it is open and the last application succeeded).
    pub fn line_settings(&self) -> LineSettings {
        self.settings
    }

    /// The description of the most recent failure, if any.
    ///
    /// Cleared by successful operations. This is where the detail of errors
    /// swallowed by the zero-progress [`read`](SerialChannel::read) path
    /// ends up.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Registers the consumer callback for "data available" notifications.
    ///
    /// In buffered mode the callback is invoked between event-loop turns,
    /// never from inside the readiness dispatch that filled the buffer. In
    /// unbuffered mode it is forwarded synchronously from the dispatch.
    pub fn on_ready_read<F: Fn() + 'static>(&mut self, callback: F) {
        self.ready_read = Some(Rc::new(callback));
    }

    /// Registers a callback fired at the start of [`close`], while the
    /// descriptor is still valid.
    ///
    /// The callback is invoked with the channel mutably borrowed, so it must
    /// not call back into the channel; capture whatever it needs instead.
    ///
    /// [`close`]: SerialChannel::close
    pub fn on_about_to_close<F: Fn() + 'static>(&mut self, callback: F) {
        self.about_to_close = Some(Rc::new(callback));
    }

    /// Opens the device.
    ///
    /// Acquires the descriptor with exclusive, non-controlling-terminal
    /// access and switches it to non-blocking mode. On success the device's
    /// current line settings are snapshotted for restoration at close, the
    /// line is converted to raw mode, the read watch is registered, and the
    /// channel's pending line settings are applied; the result of that
    /// application is the result of `open`.
    ///
    /// ## Errors
    ///
    /// * `NoDevice` if the device could not be acquired. This could indicate
    ///   that it is missing, inaccessible, or already held exclusively.
    ///   The channel state is unchanged in this case.
    /// * `InvalidInput` if the channel is already open or the path is not a
    ///   valid device name.
    /// * Any error from applying the pending line settings; the channel
    ///   remains open with the failure recorded in
    ///   [`last_error`](SerialChannel::last_error).
    pub fn open(&mut self, mode: OpenMode) -> Result<()> {
        use libc::{F_SETFL, O_NOCTTY, O_NONBLOCK, O_RDONLY, O_RDWR, O_WRONLY};

        if self.fd.is_some() {
            return Err(Error::new(ErrorKind::InvalidInput, "channel is already open"));
        }

        let cstr = CString::new(self.path.as_os_str().as_bytes())
            .map_err(|_| Error::new(ErrorKind::InvalidInput, "device path contains a NUL byte"))?;

        let access = match mode.access() {
            Access::ReadOnly => O_RDONLY,
            Access::WriteOnly => O_WRONLY,
            Access::ReadWrite => O_RDWR,
        };

        let fd = unsafe { libc::open(cstr.as_ptr(), access | O_NOCTTY) };
        if fd < 0 {
            return Err(error::last_os_error());
        }

        let init = (|| {
            if unsafe { libc::fcntl(fd, F_SETFL, O_NONBLOCK) } < 0 {
                return Err(error::last_os_error());
            }

            // exclusive access; released again by close()
            if unsafe { libc::ioctl(fd, libc::TIOCEXCL as _) } < 0 {
                return Err(error::last_os_error());
            }

            Termios::from_fd(fd).map_err(error::from_io_error)
        })();

        let reset = match init {
            Ok(termios) => termios,
            Err(err) => {
                unsafe { libc::close(fd) };
                return Err(err);
            }
        };

        let mut raw = reset;
        line::raw_init(&mut raw);

        let weak = self.weak.clone();
        let watch = if mode.is_unbuffered() {
            self.service.watch_read(fd, move || {
                let callback = weak
                    .upgrade()
                    .and_then(|channel| channel.borrow().ready_read.clone());
                if let Some(callback) = callback {
                    callback();
                }
            })
        } else {
            self.service.watch_read(fd, move || {
                if let Some(channel) = weak.upgrade() {
                    let _ = channel.borrow_mut().fill_buffer();
                }
            })
        };

        self.fd = Some(fd);
        self.mode = Some(mode);
        self.reset = Some(reset);
        self.raw = Some(raw);
        self.watch = Some(watch);
        self.buffer.clear();

        debug!("opened {} (fd {}, {:?})", self.path.display(), fd, mode);

        self.apply_settings()
    }

    /// Closes the channel.
    ///
    /// Fires the `about_to_close` callback while the descriptor is still
    /// valid, restores the line settings captured at open, releases the
    /// descriptor, and destroys the read watch. Bytes still in the internal
    /// buffer are discarded. Calling `close` on a closed channel is a no-op.
    pub fn close(&mut self) {
        let fd = match self.fd {
            Some(fd) => fd,
            None => return,
        };

        if let Some(callback) = self.about_to_close.clone() {
            callback();
        }

        if let Some(reset) = self.reset.take() {
            if let Err(err) = tcsetattr(fd, TCSANOW, &reset) {
                warn!(
                    "failed to restore line settings on {}: {}",
                    self.path.display(),
                    err
                );
            }
        }

        unsafe {
            libc::ioctl(fd, libc::TIOCNXCL as _);
            libc::close(fd);
        }

        if let Some(watch) = self.watch.take() {
            watch.set_enabled(false);
        }

        self.fd = None;
        self.mode = None;
        self.raw = None;
        self.buffer.clear();

        debug!("closed {}", self.path.display());
    }

    /// The number of bytes that can be read without blocking: the internal
    /// buffer plus whatever the OS reports pending on the descriptor.
    ///
    /// Cheap and non-blocking; returns 0 when the channel is closed.
    pub fn bytes_available(&self) -> usize {
        let device = match self.fd {
            Some(fd) => device_pending(fd).unwrap_or(0),
            None => 0,
        };

        self.buffer.len() + device
    }

    /// Reads up to `buf.len()` bytes, without blocking.
    ///
    /// The request is clamped to [`bytes_available`]. In buffered mode the
    /// internal buffer is topped up first; buffered bytes are served in FIFO
    /// order before any remainder is read straight from the descriptor. As a
    /// side effect the read watch is re-enabled, compensating for watches
    /// disabled by earlier error conditions.
    ///
    /// A failure while topping up the buffer is not an error here: the read
    /// reports zero progress and leaves the detail in
    /// [`last_error`](SerialChannel::last_error), so a consumer driven by
    /// readiness notifications can simply retry.
    ///
    /// ## Errors
    ///
    /// * `InvalidInput` if the channel is not open for reading.
    /// * The OS error if the direct descriptor read fails; the read watch is
    ///   disabled and `last_error` records the description.
    ///
    /// [`bytes_available`]: SerialChannel::bytes_available
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mode = match self.mode {
            Some(mode) if mode.readable() => mode,
            _ => {
                return Err(Error::new(
                    ErrorKind::InvalidInput,
                    "channel is not open for reading",
                ))
            }
        };
        let fd = self.require_open_fd()?;

        self.enable_watch();

        let available = self.bytes_available();
        let want = buf.len().min(available);

        if !mode.is_unbuffered() && self.fill_buffer().is_err() {
            return Ok(0);
        }

        let served = want.min(self.buffer.len());
        for (slot, byte) in buf.iter_mut().zip(self.buffer.drain(..served)) {
            *slot = byte;
        }

        let mut total = served;
        if want > served {
            let rest = &mut buf[served..want];
            let rv = unsafe { libc::read(fd, rest.as_mut_ptr() as *mut c_void, rest.len() as size_t) };
            if rv < 0 {
                let err = error::last_os_error();
                self.disable_watch();
                self.record_error(&err);
                return Err(err);
            }
            total += rv as usize;
        }

        self.last_error = None;
        Ok(total)
    }

    /// Writes `buf` straight to the descriptor; there is no write buffering.
    ///
    /// Returns the number of bytes accepted, which may be short.
    ///
    /// ## Errors
    ///
    /// * `InvalidInput` if the channel is not open for writing.
    /// * The OS error if the write fails; the read watch is disabled and
    ///   `last_error` records the description.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        match self.mode {
            Some(mode) if mode.writable() => {}
            _ => {
                return Err(Error::new(
                    ErrorKind::InvalidInput,
                    "channel is not open for writing",
                ))
            }
        }
        let fd = self.require_open_fd()?;

        let rv = unsafe { libc::write(fd, buf.as_ptr() as *const c_void, buf.len() as size_t) };
        if rv < 0 {
            let err = error::last_os_error();
            self.disable_watch();
            self.record_error(&err);
            warn!("write to {} failed: {}", self.path.display(), err);
            return Err(err);
        }

        self.last_error = None;
        Ok(rv as usize)
    }

    /// Blocks until the OS transmit queue for this device has drained.
    pub fn drain(&self) -> Result<()> {
        let fd = self.require_open_fd()?;
        tcdrain(fd).map_err(error::from_io_error)
    }

    /// Stages `settings` and, if the channel is open, applies them.
    ///
    /// Validation is all-or-nothing: a configuration the platform cannot
    /// express (mark/space parity, hardware flow control where unsupported)
    /// is rejected with a descriptive error before anything is staged or
    /// written to the device. When the channel is closed the settings are
    /// only staged, to be applied by the next [`open`](SerialChannel::open).
    ///
    /// Application discards pending input (flush, not drain) and writes the
    /// whole composite configuration atomically.
    ///
    /// ## Errors
    ///
    /// * `Unsupported` if the platform cannot express the configuration;
    ///   previously applied settings are untouched.
    /// * The OS error if the device rejects the configuration; the read
    ///   watch is disabled and `last_error` records the description.
    pub fn set_line_settings(&mut self, settings: LineSettings) -> Result<()> {
        line::validate(&settings)?;

        self.settings = settings;
        self.apply_settings()
    }

    /// Reads back the line settings currently in effect on the device.
    ///
    /// This queries the live descriptor, so the answer can differ from
    /// [`line_settings`](SerialChannel::line_settings) if the hardware
    /// adjusted or rejected part of the last application.
    pub fn device_settings(&self) -> Result<LineSettings> {
        let fd = self.require_open_fd()?;
        let termios = Termios::from_fd(fd).map_err(error::from_io_error)?;

        let unrecognized =
            |what: &str| Error::new(ErrorKind::Unsupported, format!("device reports {}", what));

        Ok(LineSettings {
            baud_rate: line::baud_rate(&termios)
                .ok_or_else(|| unrecognized("an unrecognized baud rate"))?,
            char_size: line::char_size(&termios)
                .ok_or_else(|| unrecognized("an unrecognized character size"))?,
            parity: line::parity(&termios)
                .ok_or_else(|| unrecognized("an unrecognized parity mode"))?,
            stop_bits: line::stop_bits(&termios)
                .ok_or_else(|| unrecognized("an unrecognized stop-bit count"))?,
            flow_control: line::flow_control(&termios)
                .ok_or_else(|| unrecognized("an unrecognized flow-control mode"))?,
        })
    }

    /// Sets or clears the RTS modem-control line.
    pub fn set_rts(&mut self, level: bool) -> Result<()> {
        self.set_pin(libc::TIOCM_RTS, level)
    }

    /// Sets or clears the DTR modem-control line.
    pub fn set_dtr(&mut self, level: bool) -> Result<()> {
        self.set_pin(libc::TIOCM_DTR, level)
    }

    /// Reads the CTS modem-control line.
    pub fn read_cts(&self) -> Result<bool> {
        self.read_pin(libc::TIOCM_CTS)
    }

    /// Reads the DSR modem-control line.
    pub fn read_dsr(&self) -> Result<bool> {
        self.read_pin(libc::TIOCM_DSR)
    }

    /// Reads the RI modem-control line.
    pub fn read_ri(&self) -> Result<bool> {
        self.read_pin(libc::TIOCM_RI)
    }

    /// Reads the CD modem-control line.
    pub fn read_cd(&self) -> Result<bool> {
        self.read_pin(libc::TIOCM_CD)
    }

    /// Drains the kernel queue into the internal buffer and schedules the
    /// consumer notification if the buffer grew.
    ///
    /// Fatal errors leave the watch disabled and are recorded; the "try
    /// again" class is harmless and leaves the watch enabled.
    fn fill_buffer(&mut self) -> Result<()> {
        let before = self.buffer.len();
        let result = self.fill_once();

        if let Err(err) = &result {
            self.disable_watch();
            self.record_error(err);
            warn!("fill on {} failed: {}", self.path.display(), err);
        }

        if self.buffer.len() != before {
            trace!(
                "buffered {} bytes from {}",
                self.buffer.len() - before,
                self.path.display()
            );
            if let Some(callback) = self.ready_read.clone() {
                // delivered on the next loop turn, never from inside the
                // readiness dispatch
                self.service.defer(move || callback());
            }
        }

        result
    }

    fn fill_once(&mut self) -> Result<()> {
        let fd = self.require_open_fd()?;

        // no readiness dispatch while the queue is being drained
        self.disable_watch();

        let pending = device_pending(fd)?;
        let mut chunk = vec![0u8; pending];
        let rv = unsafe { libc::read(fd, chunk.as_mut_ptr() as *mut c_void, pending as size_t) };
        if rv < 0 {
            let errno = io::Error::last_os_error();
            let raw = errno.raw_os_error();
            if raw == Some(libc::EAGAIN) || raw == Some(libc::EWOULDBLOCK) {
                // harmless: the queue emptied under us
                self.enable_watch();
                return Ok(());
            }
            return Err(error::from_io_error(errno));
        }

        self.buffer.extend(&chunk[..rv as usize]);
        self.enable_watch();
        Ok(())
    }

    /// Flushes pending input and writes the staged configuration to the
    /// device. A no-op while closed: the configuration stays staged.
    fn apply_settings(&mut self) -> Result<()> {
        let (fd, raw) = match (self.fd, self.raw) {
            (Some(fd), Some(raw)) => (fd, raw),
            _ => return Ok(()),
        };

        let mut termios = raw;
        line::encode(&self.settings, &mut termios)?;

        let result = tcflush(fd, TCIFLUSH)
            .and_then(|()| tcsetattr(fd, TCSANOW, &termios))
            .map_err(error::from_io_error);

        match result {
            Ok(()) => {
                self.last_error = None;
                Ok(())
            }
            Err(err) => {
                self.disable_watch();
                self.record_error(&err);
                Err(err)
            }
        }
    }

    fn set_pin(&mut self, pin: c_int, level: bool) -> Result<()> {
        let fd = self.require_open_fd()?;
        let request = if level {
            libc::TIOCMBIS
        } else {
            libc::TIOCMBIC
        };

        if unsafe { libc::ioctl(fd, request as _, &pin) } < 0 {
            return Err(error::last_os_error());
        }
        Ok(())
    }

    fn read_pin(&self, pin: c_int) -> Result<bool> {
        let fd = self.require_open_fd()?;

        let mut pins: c_int = 0;
        if unsafe { libc::ioctl(fd, libc::TIOCMGET as _, &mut pins) } < 0 {
            return Err(error::last_os_error());
        }
        Ok(pins & pin != 0)
    }

    fn require_open_fd(&self) -> Result<RawFd> {
        self.fd
            .ok_or_else(|| Error::new(ErrorKind::InvalidInput, "channel is not open"))
    }

    fn enable_watch(&self) {
        if let Some(watch) = &self.watch {
            watch.set_enabled(true);
        }
    }

    fn disable_watch(&self) {
        if let Some(watch) = &self.watch {
            watch.set_enabled(false);
        }
    }

    fn record_error(&mut self, err: &Error) {
        self.last_error = Some(err.description().to_string());
    }
}

impl Drop for SerialChannel {
    fn drop(&mut self) {
        self.close();
    }
}

fn device_pending(fd: RawFd) -> Result<usize> {
    let mut count: c_int = 0;
    if unsafe { libc::ioctl(fd, libc::FIONREAD as _, &mut count) } < 0 {
        return Err(error::last_os_error());
    }
    Ok(count.max(0) as usize)
}
