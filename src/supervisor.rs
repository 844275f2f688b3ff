//! The privilege-separation supervisor (§4.F): binds the listen socket,
//! forks the worker pool, reaps it, and — on the re-exec'd worker side —
//! opens the catalog, enters the chroot, and drops to the service user
//! before handing off to the worker event loop.

use crate::catalog::Catalog;
use crate::config::Config;
use crate::error::FatalError;
use crate::worker::Worker;
use nix::sys::socket::{bind, listen, socket, AddressFamily, Backlog, SockFlag, SockType, UnixAddr};
use nix::sys::stat::{umask, Mode};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{
    chdir, chroot, fork, setgroups, setresgid, setresuid, ForkResult, Pid, Uid, User,
};
use std::ffi::CString;
use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

const WORKER_SOCKET_FD: RawFd = 3;

/// Entry point once flags are parsed: dispatches to the worker path if `-S`
/// was given, otherwise runs as the root supervisor.
pub fn run(config: &Config) -> Result<(), FatalError> {
    ensure_std_fds_open()?;

    if config.worker_mode {
        worker_entry(config)
    } else {
        supervisor_main(config)
    }
}

/// Makes sure descriptors 0, 1 and 2 are open, re-pointing any that are not
/// at `/dev/null`, so later `socket`/`dup2` calls land on predictable
/// numbers (§4.F step 1).
fn ensure_std_fds_open() -> io::Result<()> {
    for fd in 0..=2 {
        if nix::fcntl::fcntl(fd, nix::fcntl::FcntlArg::F_GETFD).is_err() {
            let null = File::open("/dev/null")?;
            nix::unistd::dup2(null.as_raw_fd(), fd).map_err(io::Error::from)?;
        }
    }
    Ok(())
}

fn resolve_user(name: &str) -> Result<User, FatalError> {
    let user = User::from_name(name)
        .map_err(|e| FatalError::Io(io::Error::from(e)))?
        .ok_or_else(|| FatalError::UnknownUser(name.to_string()))?;
    if user.uid.is_root() {
        return Err(FatalError::SuperuserService(name.to_string()));
    }
    Ok(user)
}

fn supervisor_main(config: &Config) -> Result<(), FatalError> {
    if !Uid::effective().is_root() {
        return Err(FatalError::NotRoot);
    }

    let user = resolve_user(&config.user)?;
    let root = config
        .root
        .clone()
        .unwrap_or_else(|| user.dir.to_string_lossy().into_owned());

    let socket_path = build_socket_path(&root, &config.socket)?;
    let listen_fd = bind_listen_socket(&socket_path, &user)?;

    let argv0 = std::env::args()
        .next()
        .unwrap_or_else(|| "pkg_fcgi".to_string());

    let mut children = Vec::with_capacity(config.workers);
    for _ in 0..config.workers {
        match unsafe { fork() }.map_err(FatalError::Fork)? {
            ForkResult::Parent { child } => children.push(child),
            ForkResult::Child => {
                spawn_worker(&argv0, config, &root, listen_fd.as_raw_fd());
                // spawn_worker never returns; if it does, exec failed.
                std::process::exit(1);
            }
        }
    }
    drop(listen_fd);

    log::info!("forked {} worker(s)", children.len());

    // Matching the original: the otherwise-idle parent chroots and drops
    // privileges too, immediately after the fork loop.
    privsep(&user, &root)?;
    restrict_supervisor();

    if !config.foreground {
        unsafe { nix::unistd::daemon(true, false) }.map_err(|e| FatalError::Io(io::Error::from(e)))?;
    }

    reap(children)
}

fn build_socket_path(root: &str, socket: &str) -> Result<PathBuf, FatalError> {
    let path = Path::new(root).join(socket.trim_start_matches('/'));
    if path.as_os_str().len() >= libc_sockaddr_un_path_len() {
        return Err(FatalError::SocketPathTooLong);
    }
    Ok(path)
}

/// `sizeof(sockaddr_un.sun_path)`: 108 on Linux.
fn libc_sockaddr_un_path_len() -> usize {
    108
}

fn bind_listen_socket(socket_path: &Path, user: &User) -> Result<OwnedFd, FatalError> {
    let _ = std::fs::remove_file(socket_path);

    let fd = socket(
        AddressFamily::Unix,
        SockType::Stream,
        SockFlag::SOCK_NONBLOCK,
        None,
    )
    .map_err(|e| FatalError::Bind(io::Error::from(e)))?;

    let addr = UnixAddr::new(socket_path).map_err(|e| FatalError::Bind(io::Error::from(e)))?;

    let previous_umask = umask(Mode::from_bits_truncate(0o133));
    let bind_result = bind(fd.as_raw_fd(), &addr);
    umask(previous_umask);
    bind_result.map_err(|e| FatalError::Bind(io::Error::from(e)))?;

    std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o660))
        .map_err(FatalError::Io)?;
    nix::unistd::chown(socket_path, Some(user.uid), Some(user.gid))
        .map_err(|e| FatalError::Bind(io::Error::from(e)))?;

    let backlog = Backlog::new(5).map_err(|e| FatalError::Bind(io::Error::from(e)))?;
    listen(&fd, backlog).map_err(|e| FatalError::Bind(io::Error::from(e)))?;

    Ok(fd)
}

/// Re-execs `argv0` in worker mode with the listen socket delivered on fd 3.
/// Only called in the freshly forked child; never returns on success.
fn spawn_worker(argv0: &str, config: &Config, root: &str, listen_fd: RawFd) {
    if listen_fd != WORKER_SOCKET_FD {
        if let Err(e) = nix::unistd::dup2(listen_fd, WORKER_SOCKET_FD) {
            log::error!("failed to arrange listen socket on fd 3: {e}");
            return;
        }
    }

    let mut args = vec![argv0.to_string(), "-S".to_string(), "-p".to_string(), root.to_string()];
    args.push("-u".to_string());
    args.push(config.user.clone());
    if config.foreground {
        args.push("-d".to_string());
    }
    for _ in 0..config.verbosity {
        args.push("-v".to_string());
    }
    args.push(config.db.clone());

    let cstrings: Vec<CString> = args
        .iter()
        .map(|a| CString::new(a.as_str()).expect("argument must not contain NUL"))
        .collect();
    let path = cstrings[0].clone();

    if let Err(e) = nix::unistd::execv(&path, &cstrings) {
        log::error!("failed to re-exec worker: {e}");
    }
}

fn reap(mut children: Vec<Pid>) -> Result<(), FatalError> {
    let mut broadcast_sent = false;
    loop {
        match waitpid(None, None) {
            Ok(WaitStatus::Exited(pid, code)) => {
                log::info!("worker {pid} exited with status {code}");
                children.retain(|&p| p != pid);
                broadcast_shutdown_once(&mut broadcast_sent, &children);
            }
            Ok(WaitStatus::Signaled(pid, signal, _)) => {
                log::info!("worker {pid} killed by {signal:?}");
                children.retain(|&p| p != pid);
                broadcast_shutdown_once(&mut broadcast_sent, &children);
            }
            Ok(_) => {}
            Err(nix::errno::Errno::ECHILD) => {
                log::info!("all workers reaped; exiting");
                std::process::exit(1);
            }
            Err(e) => return Err(FatalError::Io(io::Error::from(e))),
        }
    }
}

fn broadcast_shutdown_once(sent: &mut bool, remaining: &[Pid]) {
    if *sent {
        return;
    }
    *sent = true;
    for &pid in remaining {
        let _ = nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGTERM);
    }
}

fn worker_entry(config: &Config) -> Result<(), FatalError> {
    let user = resolve_user(&config.user)?;
    let root = config
        .root
        .clone()
        .unwrap_or_else(|| user.dir.to_string_lossy().into_owned());

    let in_chroot_db = PathBuf::from(&config.db);
    let host_db = Path::new(&root).join(in_chroot_db.strip_prefix("/").unwrap_or(&in_chroot_db));
    let host_db = host_db.canonicalize().map_err(FatalError::Io)?;

    let catalog = Catalog::open(&host_db).map_err(FatalError::Catalog)?;

    privsep(&user, &root)?;
    restrict_worker();

    let mut worker = Worker::new(WORKER_SOCKET_FD, catalog, in_chroot_db)?;
    worker.run().map_err(|e| FatalError::Io(io::Error::other(e.to_string())))
}

/// `chroot` + `chdir("/")` + drop to the resolved service user: shared by
/// the worker entry path and the (non-`-S`) supervisor after its fork loop,
/// matching the original, which sandboxes both (§4.F).
fn privsep(user: &User, root: &str) -> Result<(), FatalError> {
    chroot(root).map_err(FatalError::Chroot)?;
    chdir("/").map_err(FatalError::Chroot)?;
    setgroups(&[]).map_err(FatalError::PrivilegeDrop)?;
    setresgid(user.gid, user.gid, user.gid).map_err(FatalError::PrivilegeDrop)?;
    setresuid(user.uid, user.uid, user.uid).map_err(FatalError::PrivilegeDrop)?;
    Ok(())
}

/// `pledge("stdio proc", NULL)` in the original; Linux has no portable
/// equivalent, so this is a documented no-op rather than a fabricated
/// seccomp sandbox.
fn restrict_supervisor() {}

/// `pledge("stdio rpath flock unix", NULL)` in the original; see
/// [`restrict_supervisor`].
fn restrict_worker() {}
