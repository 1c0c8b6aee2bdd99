//! Takes over the service socket path and puts it back afterwards.
//!
//! If the real service is listening, its socket file is renamed to a sibling
//! name and the proxy binds in its place. Restore deletes the proxy socket
//! first and only then renames the original back, so the rename never lands
//! on top of a live proxy socket.

use fs_err as fs;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketPaths {
    /// Where clients expect the service.
    pub canonical: PathBuf,
    /// Where the real service's socket is parked while the proxy runs.
    pub relocated: PathBuf,
}

impl SocketPaths {
    pub fn new(dir: &Path, socket_name: &str, relocated_name: &str) -> Self {
        Self {
            canonical: dir.join(socket_name),
            relocated: dir.join(relocated_name),
        }
    }

    pub fn from_config(config: &ProxyConfig) -> Self {
        Self::new(
            &config.resolve_runtime_dir(),
            &config.socket_name,
            &config.relocated_name,
        )
    }
}

/// Whether something accepts connections at `path`.
///
/// A file that exists but refuses the connection is a leftover from a dead
/// process. No other signal (age, permissions) is consulted. The probe never
/// waits on the peer: a listener with a full accept queue counts as alive.
pub fn socket_alive(path: &Path) -> bool {
    if !path_present(path) {
        return false;
    }
    match connect_nonblocking(path) {
        Ok(_) => true,
        Err(err) => {
            err.kind() == io::ErrorKind::WouldBlock
                || err.raw_os_error() == Some(libc::EINPROGRESS)
        }
    }
}

/// Connects to the socket at `path` with `O_NONBLOCK` already set, so a hung
/// listener fails with `WouldBlock` instead of parking the caller.
pub(crate) fn connect_nonblocking(path: &Path) -> io::Result<UnixStream> {
    let (addr, addr_len) = socket_addr(path)?;

    // SAFETY: socket() has no preconditions.
    let fd = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: `fd` was just returned by socket() and nothing else owns it.
    let stream = UnixStream::from(unsafe { OwnedFd::from_raw_fd(fd) });
    stream.set_nonblocking(true)?;
    // SAFETY: fcntl on a live fd we own.
    if unsafe { libc::fcntl(stream.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }

    // SAFETY: `addr` is an initialised sockaddr_un and `addr_len` its size.
    let rc = unsafe {
        libc::connect(
            stream.as_raw_fd(),
            &addr as *const libc::sockaddr_un as *const libc::sockaddr,
            addr_len,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(stream)
}

pub(crate) fn socket_addr(path: &Path) -> io::Result<(libc::sockaddr_un, libc::socklen_t)> {
    let bytes = path.as_os_str().as_bytes();
    // SAFETY: all-zero bytes are a valid sockaddr_un.
    let mut addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
    // Leave room for the trailing NUL.
    if bytes.len() >= addr.sun_path.len() || bytes.contains(&0) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("unusable socket path: {}", path.display()),
        ));
    }
    for (dst, src) in addr.sun_path.iter_mut().zip(bytes) {
        *dst = *src as libc::c_char;
    }
    Ok((addr, std::mem::size_of::<libc::sockaddr_un>() as libc::socklen_t))
}

/// The proxy's hold on the canonical socket path.
///
/// Dropping it restores the filesystem, so a panic or early return still puts
/// the real socket back.
#[derive(Debug)]
pub struct Takeover {
    paths: SocketPaths,
    upstream_active: bool,
    listener: Option<UnixListener>,
    restored: bool,
}

impl Takeover {
    pub fn establish(paths: SocketPaths) -> Result<Self> {
        Self::establish_with(paths, bind_listener)
    }

    fn establish_with<F>(paths: SocketPaths, bind: F) -> Result<Self>
    where
        F: FnOnce(&Path) -> io::Result<UnixListener>,
    {
        prepare_socket_dir(&paths.canonical)?;
        recover_leftover_relocation(&paths)?;

        let upstream_active = if path_present(&paths.canonical) {
            if socket_alive(&paths.canonical) {
                info!(
                    path = %paths.canonical.display(),
                    relocated = %paths.relocated.display(),
                    "Real service is running, relocating its socket"
                );
                fs::rename(&paths.canonical, &paths.relocated).map_err(|source| {
                    ProxyError::Relocate {
                        from: paths.canonical.clone(),
                        to: paths.relocated.clone(),
                        source,
                    }
                })?;
                true
            } else {
                info!(path = %paths.canonical.display(), "Removing stale socket");
                fs::remove_file(&paths.canonical).map_err(|source| ProxyError::RemoveStale {
                    path: paths.canonical.clone(),
                    source,
                })?;
                false
            }
        } else {
            info!(path = %paths.canonical.display(), "Real service not running, passive mode");
            false
        };

        match bind(&paths.canonical) {
            Ok(listener) => Ok(Self {
                paths,
                upstream_active,
                listener: Some(listener),
                restored: false,
            }),
            Err(source) => {
                remove_dead_proxy_socket(&paths.canonical);
                if upstream_active {
                    roll_back_relocation(&paths);
                }
                Err(ProxyError::Bind {
                    path: paths.canonical.clone(),
                    source,
                })
            }
        }
    }

    pub fn paths(&self) -> &SocketPaths {
        &self.paths
    }

    pub fn upstream_active(&self) -> bool {
        self.upstream_active
    }

    /// `None` once restored.
    pub fn listener(&self) -> Option<&UnixListener> {
        self.listener.as_ref()
    }

    /// Closes the proxy socket, deletes its file and moves the real socket
    /// back. Runs once; later calls do nothing.
    pub fn restore(&mut self) {
        if self.restored {
            return;
        }
        self.restored = true;
        drop(self.listener.take());

        if path_present(&self.paths.canonical) {
            if let Err(err) = fs::remove_file(&self.paths.canonical) {
                warn!(error = %err, "Failed to remove proxy socket");
            }
        }

        if path_present(&self.paths.relocated) {
            info!(path = %self.paths.canonical.display(), "Restoring original socket");
            if let Err(err) = fs::rename(&self.paths.relocated, &self.paths.canonical) {
                error!(error = %err, "Failed to restore original socket");
            }
        }
    }
}

impl Drop for Takeover {
    fn drop(&mut self) {
        self.restore();
    }
}

/// Binds a non-blocking listener at `path`.
pub(crate) fn bind_listener(path: &Path) -> io::Result<UnixListener> {
    let listener = UnixListener::bind(path)?;
    listener.set_nonblocking(true)?;
    Ok(listener)
}

/// A relocated file at startup means an earlier run died before restoring.
/// It is authoritative: whatever sits at the canonical path is replaced.
fn recover_leftover_relocation(paths: &SocketPaths) -> Result<()> {
    if !path_present(&paths.relocated) {
        return Ok(());
    }

    warn!(
        path = %paths.relocated.display(),
        "Found leftover relocated socket, restoring"
    );
    if path_present(&paths.canonical) {
        fs::remove_file(&paths.canonical).map_err(|source| ProxyError::RemoveStale {
            path: paths.canonical.clone(),
            source,
        })?;
    }
    fs::rename(&paths.relocated, &paths.canonical).map_err(|source| ProxyError::Relocate {
        from: paths.relocated.clone(),
        to: paths.canonical.clone(),
        source,
    })
}

/// A bind that fails after creating its file leaves a dead socket behind.
/// Anything still accepting connections belongs to someone else and stays.
fn remove_dead_proxy_socket(path: &Path) {
    if !path_present(path) || socket_alive(path) {
        return;
    }
    if let Err(err) = fs::remove_file(path) {
        warn!(error = %err, "Failed to remove half-bound proxy socket");
    }
}

/// Undoes a relocation after a failed bind. Leaves an occupied canonical path
/// alone rather than clobbering it.
fn roll_back_relocation(paths: &SocketPaths) {
    if !path_present(&paths.relocated) || path_present(&paths.canonical) {
        return;
    }
    match fs::rename(&paths.relocated, &paths.canonical) {
        Ok(()) => info!(path = %paths.canonical.display(), "Rolled back socket relocation"),
        Err(err) => error!(error = %err, "Failed to roll back socket relocation"),
    }
}

fn prepare_socket_dir(socket_path: &Path) -> Result<()> {
    let Some(parent) = socket_path.parent() else {
        return Ok(());
    };
    fs::create_dir_all(parent).map_err(|source| ProxyError::SocketDir {
        path: parent.to_path_buf(),
        source,
    })
}

// Socket files are not followed; a dangling symlink still counts as present.
fn path_present(path: &Path) -> bool {
    std::fs::symlink_metadata(path).is_ok()
}

/// Binds a raw socket at `path`, listening with `backlog` when given. With a
/// backlog of 0 and nobody calling accept, the queue fills after one connect.
#[cfg(test)]
pub(crate) fn bind_raw(path: &Path, backlog: Option<libc::c_int>) -> OwnedFd {
    let (addr, addr_len) = socket_addr(path).expect("socket path");
    // SAFETY: plain socket syscalls; the fd is owned by the returned OwnedFd.
    unsafe {
        let fd = libc::socket(libc::AF_UNIX, libc::SOCK_STREAM, 0);
        assert!(fd >= 0, "socket() failed");
        let fd = OwnedFd::from_raw_fd(fd);
        let rc = libc::bind(
            fd.as_raw_fd(),
            &addr as *const libc::sockaddr_un as *const libc::sockaddr,
            addr_len,
        );
        assert_eq!(rc, 0, "bind() failed");
        if let Some(backlog) = backlog {
            assert_eq!(libc::listen(fd.as_raw_fd(), backlog), 0, "listen() failed");
        }
        fd
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_paths(dir: &Path) -> SocketPaths {
        SocketPaths::new(dir, "discord-ipc-0", "discord-ipc-original")
    }

    #[test]
    fn missing_path_is_not_alive() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        assert!(!socket_alive(&temp_dir.path().join("nothing-here")));
    }

    #[test]
    fn bound_but_not_listening_is_not_alive() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("test-socket");
        let _fd = bind_raw(&path, None);

        assert!(path.exists());
        assert!(!socket_alive(&path));
    }

    #[test]
    fn closed_listener_leaves_dead_socket() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("test-socket");
        drop(UnixListener::bind(&path).expect("bind"));

        assert!(path.exists());
        assert!(!socket_alive(&path));
    }

    #[test]
    fn listening_socket_is_alive() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("test-socket");
        let _listener = UnixListener::bind(&path).expect("bind");

        assert!(socket_alive(&path));
    }

    #[test]
    fn listener_with_full_queue_is_alive_without_blocking() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("test-socket");
        let _fd = bind_raw(&path, Some(0));

        // Fill the accept queue; later connects would block if allowed to.
        let mut queued = Vec::new();
        while let Ok(stream) = connect_nonblocking(&path) {
            queued.push(stream);
            assert!(queued.len() < 64, "accept queue never filled");
        }
        assert!(socket_alive(&path));
    }

    #[test]
    fn passive_mode_when_nothing_present() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let paths = test_paths(temp_dir.path());

        let mut takeover = Takeover::establish(paths.clone()).expect("establish");
        assert!(!takeover.upstream_active());
        assert!(takeover.listener().is_some());
        assert!(socket_alive(&paths.canonical));
        assert!(!paths.relocated.exists());

        takeover.restore();
        assert!(takeover.listener().is_none());
        assert!(!paths.canonical.exists());
        assert!(!paths.relocated.exists());
    }

    #[test]
    fn stale_socket_is_replaced() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let paths = test_paths(temp_dir.path());
        drop(UnixListener::bind(&paths.canonical).expect("bind stale"));

        let takeover = Takeover::establish(paths.clone()).expect("establish");
        assert!(!takeover.upstream_active());
        assert!(!paths.relocated.exists());
        assert!(socket_alive(&paths.canonical));
    }

    #[test]
    fn live_socket_is_relocated_and_restored() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let paths = test_paths(temp_dir.path());
        let real = UnixListener::bind(&paths.canonical).expect("bind real");

        let mut takeover = Takeover::establish(paths.clone()).expect("establish");
        assert!(takeover.upstream_active());
        assert!(paths.relocated.exists());
        assert!(socket_alive(&paths.relocated));
        assert!(socket_alive(&paths.canonical));

        // Drain the liveness probe and the check above.
        real.set_nonblocking(true).expect("nonblocking");
        while real.accept().is_ok() {}

        takeover.restore();
        assert!(!paths.relocated.exists());
        assert!(paths.canonical.exists());

        let _client = UnixStream::connect(&paths.canonical).expect("connect restored");
        real.set_nonblocking(false).expect("blocking");
        real.accept().expect("real service accepts at canonical path");
    }

    #[test]
    fn restore_runs_once() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let paths = test_paths(temp_dir.path());
        let _real = UnixListener::bind(&paths.canonical).expect("bind real");

        let mut takeover = Takeover::establish(paths.clone()).expect("establish");
        takeover.restore();
        assert!(paths.canonical.exists());

        // A second restore must not delete the real socket it just put back.
        takeover.restore();
        drop(takeover);
        assert!(paths.canonical.exists());
        assert!(socket_alive(&paths.canonical));
    }

    #[test]
    fn drop_restores_original() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let paths = test_paths(temp_dir.path());
        let _real = UnixListener::bind(&paths.canonical).expect("bind real");

        {
            let takeover = Takeover::establish(paths.clone()).expect("establish");
            assert!(takeover.upstream_active());
        }
        assert!(!paths.relocated.exists());
        assert!(socket_alive(&paths.canonical));
    }

    #[test]
    fn leftover_relocation_is_recovered_before_probe() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let paths = test_paths(temp_dir.path());
        // Earlier run died: real socket parked, dead proxy socket at canonical.
        let _real = UnixListener::bind(&paths.relocated).expect("bind real");
        drop(UnixListener::bind(&paths.canonical).expect("bind dead proxy"));

        let mut takeover = Takeover::establish(paths.clone()).expect("establish");
        assert!(takeover.upstream_active());
        assert!(socket_alive(&paths.relocated));

        takeover.restore();
        assert!(!paths.relocated.exists());
        assert!(socket_alive(&paths.canonical));
    }

    #[test]
    fn leftover_dead_relocation_ends_in_passive_mode() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let paths = test_paths(temp_dir.path());
        drop(UnixListener::bind(&paths.relocated).expect("bind dead real"));

        let takeover = Takeover::establish(paths.clone()).expect("establish");
        assert!(!takeover.upstream_active());
        assert!(!paths.relocated.exists());
    }

    #[test]
    fn bind_failure_rolls_back_relocation() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let paths = test_paths(temp_dir.path());
        let _real = UnixListener::bind(&paths.canonical).expect("bind real");

        let result = Takeover::establish_with(paths.clone(), |_| {
            Err(io::Error::new(io::ErrorKind::AddrInUse, "simulated"))
        });

        assert!(matches!(result, Err(ProxyError::Bind { .. })));
        assert!(!paths.relocated.exists());
        assert!(socket_alive(&paths.canonical));
    }

    #[test]
    fn half_bound_proxy_socket_is_removed_before_rollback() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let paths = test_paths(temp_dir.path());
        let _real = UnixListener::bind(&paths.canonical).expect("bind real");

        // The socket file exists by the time the failure is reported.
        let result = Takeover::establish_with(paths.clone(), |path| {
            let _half_bound = UnixListener::bind(path)?;
            Err(io::Error::new(io::ErrorKind::Other, "listen failed"))
        });

        assert!(matches!(result, Err(ProxyError::Bind { .. })));
        assert!(!paths.relocated.exists());
        assert!(socket_alive(&paths.canonical));
    }

    #[test]
    fn half_bound_socket_is_removed_in_passive_mode() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let paths = test_paths(temp_dir.path());

        let result = Takeover::establish_with(paths.clone(), |path| {
            let _half_bound = UnixListener::bind(path)?;
            Err(io::Error::new(io::ErrorKind::Other, "listen failed"))
        });

        assert!(result.is_err());
        assert!(!paths.canonical.exists());
    }

    #[test]
    fn rollback_never_clobbers_canonical() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let paths = test_paths(temp_dir.path());
        fs::write(&paths.relocated, b"").expect("write relocated");
        fs::write(&paths.canonical, b"occupied").expect("write canonical");

        roll_back_relocation(&paths);
        assert!(paths.relocated.exists());
        assert_eq!(
            fs::read(&paths.canonical).expect("read canonical"),
            b"occupied".to_vec()
        );
    }

    #[test]
    fn creates_missing_runtime_dir() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let dir = temp_dir.path().join("runtime");
        let paths = test_paths(&dir);

        let _takeover = Takeover::establish(paths.clone()).expect("establish");
        assert!(socket_alive(&paths.canonical));
    }
}
