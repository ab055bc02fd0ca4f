//! Listener setup.

use std::net::SocketAddr;

use mio::net::{TcpListener, TcpStream};

use crate::error::{Result, TileliteError};

/// Binds a non-blocking listener and raises its accept backlog to the
/// platform maximum.
pub fn bind_listener(addr: SocketAddr) -> Result<TcpListener> {
    let listener =
        TcpListener::bind(addr).map_err(|source| TileliteError::Bind { addr, source })?;
    raise_backlog(&listener)?;
    Ok(listener)
}

#[cfg(unix)]
fn raise_backlog(listener: &TcpListener) -> Result<()> {
    use std::os::fd::AsRawFd;

    // listen(2) on an already listening socket only updates the backlog.
    // SAFETY: the fd is owned by `listener` and stays open for the call.
    let rc = unsafe { libc::listen(listener.as_raw_fd(), libc::SOMAXCONN) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}

#[cfg(not(unix))]
fn raise_backlog(_listener: &TcpListener) -> Result<()> {
    Ok(())
}

pub(crate) fn configure_stream(stream: &TcpStream, no_delay: bool) {
    if let Err(e) = stream.set_nodelay(no_delay) {
        tracing::warn!(error = %e, "failed to set TCP_NODELAY");
    }
}

/// Makes dropping `stream` send a reset instead of a FIN.
#[cfg(all(test, unix))]
pub(crate) fn reset_on_drop(stream: &std::net::TcpStream) {
    use std::os::fd::AsRawFd;

    let linger = libc::linger {
        l_onoff: 1,
        l_linger: 0,
    };
    // SAFETY: the fd is open and `linger` outlives the call with the size passed.
    let rc = unsafe {
        libc::setsockopt(
            stream.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_LINGER,
            &linger as *const libc::linger as *const libc::c_void,
            std::mem::size_of::<libc::linger>() as libc::socklen_t,
        )
    };
    assert_eq!(rc, 0, "SO_LINGER: {}", std::io::Error::last_os_error());
}
