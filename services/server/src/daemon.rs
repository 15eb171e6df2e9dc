//! Classic double-fork daemonisation for the `-d` flag.
//!
//! Must run before the async runtime starts; forking a process with live
//! runtime threads is undefined behaviour territory.

use std::io;

/// Detach from the controlling terminal.
///
/// Returns `Ok(true)` in the final daemon child, `Ok(false)` in the parents
/// (which should exit 0 without running the server).
pub fn daemonize() -> io::Result<bool> {
    // SAFETY: single-threaded at this point; fork/setsid/umask/chdir/dup2
    // are async-signal-safe libc calls with no Rust state involved.
    unsafe {
        match libc::fork() {
            -1 => return Err(io::Error::last_os_error()),
            0 => {}
            _ => return Ok(false),
        }

        if libc::setsid() == -1 {
            return Err(io::Error::last_os_error());
        }
        if libc::chdir(c"/".as_ptr()) == -1 {
            return Err(io::Error::last_os_error());
        }
        libc::umask(0o027);

        match libc::fork() {
            -1 => return Err(io::Error::last_os_error()),
            0 => {}
            _ => return Ok(false),
        }

        let null = libc::open(c"/dev/null".as_ptr(), libc::O_RDWR);
        if null == -1 {
            return Err(io::Error::last_os_error());
        }
        libc::dup2(null, libc::STDIN_FILENO);
        libc::dup2(null, libc::STDOUT_FILENO);
        libc::dup2(null, libc::STDERR_FILENO);
        if null > libc::STDERR_FILENO {
            libc::close(null);
        }
    }

    Ok(true)
}
