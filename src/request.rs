use crate::output::OutputBuffer;

/// Fixed limit this responder imposes on path-ish parameter values, standing
/// in for the platform `PATH_MAX` the original silently truncated at (§9
/// Open Question, resolved in SPEC_FULL.md).
pub const PATH_MAX: usize = 1024;

/// `REQUEST_METHOD`, case-insensitively mapped; anything else is `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestMethod {
    #[default]
    Unknown,
    Get,
    Post,
}

impl RequestMethod {
    pub fn parse(value: &[u8]) -> RequestMethod {
        if value.eq_ignore_ascii_case(b"GET") {
            RequestMethod::Get
        } else if value.eq_ignore_ascii_case(b"POST") {
            RequestMethod::Post
        } else {
            RequestMethod::Unknown
        }
    }
}

/// One active FastCGI request id on a connection (§3).
///
/// Holds the parameters accumulated from `FCGI_PARAMS` records until the
/// empty terminator arrives, at which point the request is dispatched to
/// the router.
pub struct Request {
    pub id: u16,
    pub server_name: Option<String>,
    pub script_name: Option<String>,
    pub path_info: Option<String>,
    pub query_string: Option<String>,
    pub method: RequestMethod,
    pub out: OutputBuffer,
    /// Set once an empty `FCGI_PARAMS` record has been received.
    pub dispatched: bool,
    /// Set once `END_REQUEST` has been enqueued; no more `STDOUT` may follow.
    pub ended: bool,
    /// `FCGI_KEEP_CONN`, read off this request's `FCGI_BEGIN_REQUEST`. A
    /// connection is torn down once a request with this unset completes.
    pub keep_conn: bool,
}

impl Request {
    pub fn new(id: u16) -> Self {
        Request {
            id,
            server_name: None,
            script_name: None,
            path_info: None,
            query_string: None,
            method: RequestMethod::default(),
            out: OutputBuffer::new(id),
            dispatched: false,
            ended: false,
            keep_conn: true,
        }
    }

    /// Applies one decoded name/value pair from a `PARAMS` record, per the
    /// extraction rules of §4.D. Pairs outside these rules (wrong name,
    /// value too long) are silently dropped — the caller has already
    /// drained the bytes off the wire.
    pub fn apply_param(&mut self, name: &[u8], value: &[u8]) {
        match name {
            b"SERVER_NAME" if value.len() < 256 => {
                self.server_name = Some(String::from_utf8_lossy(value).into_owned());
            }
            b"SCRIPT_NAME" if value.len() < PATH_MAX => {
                let mut s = String::from_utf8_lossy(value).into_owned();
                if !s.ends_with('/') {
                    s.push('/');
                }
                self.script_name = Some(s);
            }
            b"GEMINI_URL_PATH" if value.len() < PATH_MAX => {
                let mut s = String::from_utf8_lossy(value).into_owned();
                if !s.starts_with('/') {
                    s.insert(0, '/');
                }
                self.path_info = Some(s);
            }
            b"QUERY_STRING" if (1..1024).contains(&value.len()) => {
                self.query_string = Some(String::from_utf8_lossy(value).into_owned());
            }
            b"REQUEST_METHOD" if value.len() < 8 => {
                self.method = RequestMethod::parse(value);
            }
            _ => {}
        }
    }

    pub fn script_name_or_default(&self) -> &str {
        self.script_name.as_deref().unwrap_or("/")
    }

    pub fn path_info_or_default(&self) -> &str {
        self.path_info.as_deref().unwrap_or("/")
    }

    pub fn query_string_or_default(&self) -> &str {
        self.query_string.as_deref().unwrap_or("")
    }
}
