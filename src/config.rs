//! Command-line parsing (§6): resolves `argv` into a [`Config`] before the
//! supervisor or worker logic runs, the way `vintage`'s binaries would lean
//! on a CLI crate if they shipped one — here `getopts`, matching the flag
//! style the spec itself uses.

const DEFAULT_SOCKET: &str = "/run/pkg_fcgi.sock";
const DEFAULT_USER: &str = "www";
const DEFAULT_DB: &str = "/pkg_fcgi/pkgs.sqlite3";
const DEFAULT_WORKERS: usize = 3;
const MAX_WORKERS: usize = 32;

#[derive(Debug, Clone)]
pub struct Config {
    /// `-d`: stay attached to the controlling terminal instead of
    /// daemonizing. Worker mode always behaves as though this is set, since
    /// a re-exec'd worker has nothing useful to daemonize into again.
    pub foreground: bool,
    /// `-v`, repeatable: 0 = warn, 1 = info, 2+ = debug.
    pub verbosity: u8,
    /// `-j`: worker count, 1..=32.
    pub workers: usize,
    /// `-p`: chroot root. `None` means "resolve the service user's home
    /// directory", deferred to the supervisor since it requires a user
    /// lookup.
    pub root: Option<String>,
    /// `-s`: socket path, relative to `root`.
    pub socket: String,
    /// `-u`: service user name.
    pub user: String,
    /// Positional: path to the catalog database, interpreted inside the
    /// chroot.
    pub db: String,
    /// `-S`: internal flag set only on the re-exec'd worker's argv.
    pub worker_mode: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            foreground: false,
            verbosity: 0,
            workers: DEFAULT_WORKERS,
            root: None,
            socket: DEFAULT_SOCKET.to_string(),
            user: DEFAULT_USER.to_string(),
            db: DEFAULT_DB.to_string(),
            worker_mode: false,
        }
    }
}

/// Parses `args` (excluding `argv[0]`). `Err` carries a human-readable
/// message suitable for printing to stderr alongside usage.
pub fn parse(args: &[String]) -> Result<Config, String> {
    let mut opts = getopts::Options::new();
    opts.optflag("d", "", "run in the foreground");
    opts.optflagmulti("v", "", "increase verbosity");
    opts.optopt("j", "", "number of worker processes (1-32)", "N");
    opts.optopt("p", "", "chroot root", "PATH");
    opts.optopt("s", "", "unix socket path, relative to the chroot", "PATH");
    opts.optopt("u", "", "service user", "USER");
    opts.optflag("S", "", "internal: enter worker mode on fd 3");

    let matches = opts.parse(args).map_err(|e| e.to_string())?;

    let mut config = Config {
        foreground: matches.opt_present("d"),
        verbosity: matches.opt_count("v") as u8,
        worker_mode: matches.opt_present("S"),
        ..Config::default()
    };

    if let Some(j) = matches.opt_str("j") {
        let workers: usize = j.parse().map_err(|_| format!("invalid -j value: {j}"))?;
        if !(1..=MAX_WORKERS).contains(&workers) {
            return Err(format!("-j must be between 1 and {MAX_WORKERS}"));
        }
        config.workers = workers;
    }
    if let Some(p) = matches.opt_str("p") {
        config.root = Some(p);
    }
    if let Some(s) = matches.opt_str("s") {
        config.socket = s;
    }
    if let Some(u) = matches.opt_str("u") {
        config.user = u;
    }

    match matches.free.as_slice() {
        [] => {}
        [db] => config.db = db.clone(),
        _ => return Err("too many positional arguments".to_string()),
    }

    Ok(config)
}
