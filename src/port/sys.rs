//! Descriptor-level device control.
//!
//! A [`Descriptor`] is a borrowed view of the OS handle owned by the
//! transport's stream, used for the termios operations tokio-serial does
//! not expose once the stream has been split: line-rate query/set, input
//! flush, output drain, and pseudo-terminal unlock. On non-Unix targets
//! the operations degrade to their documented fallbacks (drain reports
//! success, the line-rate query returns the 0 sentinel).

#[cfg(unix)]
mod imp {
    use std::ffi::CStr;
    use std::io;
    use std::mem::MaybeUninit;
    use std::os::unix::io::RawFd;

    /// Line rates expressible through termios speed constants, covering
    /// the 1200-115200 device domain plus the common extended rates.
    const BAUD_TABLE: &[(u32, libc::speed_t)] = &[
        (1200, libc::B1200),
        (2400, libc::B2400),
        (4800, libc::B4800),
        (9600, libc::B9600),
        (19_200, libc::B19200),
        (38_400, libc::B38400),
        (57_600, libc::B57600),
        (115_200, libc::B115200),
        (230_400, libc::B230400),
    ];

    /// Borrowed view of an open byte-stream descriptor.
    #[derive(Debug, Clone, Copy)]
    pub struct Descriptor {
        fd: RawFd,
    }

    impl Descriptor {
        #[must_use]
        pub const fn new(fd: RawFd) -> Self {
            Self { fd }
        }

        fn termios(self) -> io::Result<libc::termios> {
            let mut tio = MaybeUninit::<libc::termios>::uninit();
            // SAFETY: fd is a valid open descriptor for the lifetime of the
            // owning stream; tcgetattr initializes tio on success.
            if unsafe { libc::tcgetattr(self.fd, tio.as_mut_ptr()) } != 0 {
                return Err(io::Error::last_os_error());
            }
            // SAFETY: tcgetattr returned 0, so tio is initialized.
            Ok(unsafe { tio.assume_init() })
        }

        /// Queries the output line rate; 0 if the device does not support
        /// the query or reports a rate outside the known table.
        #[must_use]
        pub fn baud_rate(self) -> u32 {
            let Ok(tio) = self.termios() else {
                return 0;
            };
            // SAFETY: tio is a valid termios obtained from tcgetattr.
            let speed = unsafe { libc::cfgetospeed(&raw const tio) };
            BAUD_TABLE
                .iter()
                .find(|(_, s)| *s == speed)
                .map_or(0, |(rate, _)| *rate)
        }

        /// Applies the given line rate in both directions.
        pub fn set_baud_rate(self, rate: u32) -> io::Result<()> {
            let Some((_, speed)) = BAUD_TABLE.iter().find(|(r, _)| *r == rate) else {
                return Err(io::Error::from(io::ErrorKind::Unsupported));
            };

            let mut tio = self.termios()?;
            // SAFETY: tio is a valid termios and speed comes from the table.
            let ret = unsafe {
                libc::cfsetispeed(&raw mut tio, *speed) | libc::cfsetospeed(&raw mut tio, *speed)
            };
            if ret != 0 {
                return Err(io::Error::last_os_error());
            }
            // SAFETY: fd is open and tio was filled by tcgetattr above.
            if unsafe { libc::tcsetattr(self.fd, libc::TCSANOW, &raw const tio) } != 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }

        /// Discards unread input held by the OS.
        pub fn flush_input(self) -> io::Result<()> {
            // SAFETY: fd is a valid open descriptor.
            if unsafe { libc::tcflush(self.fd, libc::TCIFLUSH) } != 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }

        /// Blocks until all queued output has been transmitted.
        #[must_use]
        pub fn drain(self) -> bool {
            // SAFETY: fd is a valid open descriptor.
            unsafe { libc::tcdrain(self.fd) == 0 }
        }

        /// Unlocks a pseudo-terminal master and resolves its peer path.
        pub fn unlock_pty(self) -> io::Result<String> {
            // SAFETY: fd refers to an open pty master.
            if unsafe { libc::grantpt(self.fd) } != 0 {
                return Err(io::Error::last_os_error());
            }
            // SAFETY: as above.
            if unsafe { libc::unlockpt(self.fd) } != 0 {
                return Err(io::Error::last_os_error());
            }
            self.peer_path()
        }

        #[cfg(target_os = "linux")]
        fn peer_path(self) -> io::Result<String> {
            let mut buf = [0_i8; 128];
            // SAFETY: buf outlives the call and its length is passed.
            if unsafe { libc::ptsname_r(self.fd, buf.as_mut_ptr().cast(), buf.len()) } != 0 {
                return Err(io::Error::last_os_error());
            }
            // SAFETY: ptsname_r wrote a NUL-terminated string into buf.
            let path = unsafe { CStr::from_ptr(buf.as_ptr().cast()) };
            Ok(path.to_string_lossy().into_owned())
        }

        #[cfg(not(target_os = "linux"))]
        fn peer_path(self) -> io::Result<String> {
            // SAFETY: fd refers to an open pty master; the returned pointer
            // is valid until the next ptsname call and is copied right away.
            let ptr = unsafe { libc::ptsname(self.fd) };
            if ptr.is_null() {
                return Err(io::Error::last_os_error());
            }
            let path = unsafe { CStr::from_ptr(ptr) };
            Ok(path.to_string_lossy().into_owned())
        }
    }
}

#[cfg(not(unix))]
mod imp {
    use std::io;

    /// Stub descriptor for targets without termios.
    #[derive(Debug, Clone, Copy)]
    pub struct Descriptor;

    impl Descriptor {
        /// The line-rate query is unsupported; always the 0 sentinel.
        #[must_use]
        pub const fn baud_rate(self) -> u32 {
            0
        }

        pub fn set_baud_rate(self, _rate: u32) -> io::Result<()> {
            Err(io::Error::from(io::ErrorKind::Unsupported))
        }

        pub fn flush_input(self) -> io::Result<()> {
            Ok(())
        }

        /// No drain primitive; reports success unconditionally.
        #[must_use]
        pub const fn drain(self) -> bool {
            true
        }
    }
}

pub use imp::Descriptor;
