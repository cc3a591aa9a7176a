// Input byte stream over a borrowed file descriptor.
//
// The descriptor is either a regular file (plain blocking reads, end at
// zero bytes) or a pipe/socket, probed with fstat. Non-regular descriptors
// are switched to non-blocking mode and waited on with poll(2) so the read
// deadline and the watchdog kick interval can both be honored.

use std::fs::File;
use std::io::Read;
use std::os::unix::io::{AsRawFd, OwnedFd};
use std::time::{Duration, Instant};

use log::debug;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::poll::{poll, PollFd, PollFlags};
use nix::sys::stat::fstat;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// The whole request was filled.
    Full,
    /// Stream ended after this many bytes of the request.
    Eof(usize),
    /// Deadline expired after this many bytes of the request.
    TimedOut(usize),
}

pub struct InputStream {
    file: File,
    needs_poll: bool,
    deadline: Duration,
    kick_interval: Duration,
}

fn io_err(e: nix::errno::Errno) -> std::io::Error {
    std::io::Error::from_raw_os_error(e as i32)
}

impl InputStream {
    pub fn new(
        fd: OwnedFd,
        deadline: Duration,
        kick_interval: Duration,
    ) -> std::io::Result<InputStream> {
        let raw = fd.as_raw_fd();
        let st = fstat(raw).map_err(io_err)?;
        let needs_poll = (st.st_mode & libc::S_IFMT) != libc::S_IFREG;
        if needs_poll {
            let flags = fcntl(raw, FcntlArg::F_GETFL).map_err(io_err)?;
            let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
            fcntl(raw, FcntlArg::F_SETFL(flags)).map_err(io_err)?;
        }
        debug!(
            "input descriptor {} ({})",
            raw,
            if needs_poll { "pipe/socket" } else { "regular file" }
        );
        Ok(InputStream {
            file: File::from(fd),
            needs_poll,
            deadline,
            kick_interval,
        })
    }

    /// Fill `buf` completely, waiting up to the deadline for readiness.
    /// `kick` runs between waits so the caller can feed its watchdog.
    pub fn read_full(
        &mut self,
        buf: &mut [u8],
        mut kick: Option<&mut (dyn FnMut() + Send)>,
    ) -> std::io::Result<ReadOutcome> {
        let mut got = 0;
        let mut idle = Duration::from_secs(0);
        while got < buf.len() {
            if self.needs_poll {
                loop {
                    if idle >= self.deadline {
                        return Ok(ReadOutcome::TimedOut(got));
                    }
                    let slice = self.kick_interval.min(self.deadline - idle);
                    let started = Instant::now();
                    let mut fds = [PollFd::new(self.file.as_raw_fd(), PollFlags::POLLIN)];
                    let ready = match poll(&mut fds, slice.as_millis() as i32) {
                        Ok(n) => n > 0,
                        Err(nix::errno::Errno::EINTR) => false,
                        Err(e) => return Err(io_err(e)),
                    };
                    idle += started.elapsed();
                    if let Some(kick) = kick.as_mut() {
                        kick();
                    }
                    if ready {
                        break;
                    }
                }
            }
            match self.file.read(&mut buf[got..]) {
                Ok(0) => return Ok(ReadOutcome::Eof(got)),
                Ok(n) => {
                    got += n;
                    idle = Duration::from_secs(0);
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(ReadOutcome::Full)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::os::unix::io::FromRawFd;

    fn pipe_pair() -> (OwnedFd, File) {
        let mut fds = [0i32; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let read = unsafe { OwnedFd::from_raw_fd(fds[0]) };
        let write = unsafe { File::from_raw_fd(fds[1]) };
        (read, write)
    }

    #[test]
    fn reads_across_split_writes() {
        use std::io::Write;
        let (read, mut write) = pipe_pair();
        let mut input = InputStream::new(
            read,
            Duration::from_secs(5),
            Duration::from_millis(50),
        )
        .unwrap();
        let writer = std::thread::spawn(move || {
            write.write_all(b"hell").unwrap();
            std::thread::sleep(Duration::from_millis(20));
            write.write_all(b"o").unwrap();
        });
        let mut buf = [0u8; 5];
        let outcome = input.read_full(&mut buf, None).unwrap();
        writer.join().unwrap();
        assert_eq!(outcome, ReadOutcome::Full);
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn closed_writer_reports_eof_with_partial_count() {
        use std::io::Write;
        let (read, mut write) = pipe_pair();
        let mut input = InputStream::new(
            read,
            Duration::from_secs(5),
            Duration::from_millis(50),
        )
        .unwrap();
        write.write_all(b"abc").unwrap();
        drop(write);
        let mut buf = [0u8; 10];
        let outcome = input.read_full(&mut buf, None).unwrap();
        assert_eq!(outcome, ReadOutcome::Eof(3));
        assert_eq!(&buf[..3], b"abc");
    }

    #[test]
    fn deadline_expires_without_input() {
        let (read, _write) = pipe_pair();
        let mut input = InputStream::new(
            read,
            Duration::from_millis(60),
            Duration::from_millis(20),
        )
        .unwrap();
        let mut kicks = 0u32;
        let mut kick = || kicks += 1;
        let mut buf = [0u8; 4];
        let outcome = input.read_full(&mut buf, Some(&mut kick)).unwrap();
        assert_eq!(outcome, ReadOutcome::TimedOut(0));
        assert!(kicks >= 2);
    }
}
