use crate::catalog::Catalog;
use crate::error::Error;
use crate::record::{
    self, keep_conn_flag, pairs, BeginRequestBody, EndRequestBody, Header, ProtocolStatus,
    TYPE_ABORT_REQUEST, TYPE_BEGIN_REQUEST, TYPE_END_REQUEST, TYPE_GET_VALUES, TYPE_PARAMS,
    TYPE_STDIN,
};
use crate::request::Request;
use crate::router;
use std::collections::BTreeMap;

/// One accepted connection's protocol state: the partial-record decoder,
/// the requests currently open on it (more than one when the peer
/// multiplexes), and the bytes waiting to be written back.
///
/// A `Connection` never touches a socket itself — [`feed`](Self::feed) takes
/// bytes read off the wire and [`drain_output`](Self::drain_output) hands
/// back bytes to write. The mio event loop in `worker` owns the actual
/// `UnixStream`; this type only owns the FastCGI state machine, which keeps
/// it exercisable without a real listener.
pub struct Connection {
    inbuf: Vec<u8>,
    outbuf: Vec<u8>,
    requests: BTreeMap<u16, Request>,
    /// Set once a request without `FCGI_KEEP_CONN` has ended. The worker
    /// closes the socket as soon as `outbuf` has drained past this point.
    done: bool,
}

impl Default for Connection {
    fn default() -> Self {
        Self::new()
    }
}

impl Connection {
    pub fn new() -> Self {
        Connection {
            inbuf: Vec::new(),
            outbuf: Vec::new(),
            requests: BTreeMap::new(),
            done: false,
        }
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.inbuf.extend_from_slice(bytes);
    }

    pub fn drain_output(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.outbuf)
    }

    /// True once this connection should be closed as soon as its remaining
    /// output has been written out.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Parses and dispatches as many complete records as `inbuf` currently
    /// holds, stopping cleanly on a partially-buffered record. Only
    /// violations serious enough to warrant tearing the whole connection
    /// down (bad version, a mid-stream multiplexing relapse) come back as
    /// `Err`; everything else this responder rejects is answered in-band.
    pub fn process(&mut self, catalog: &Catalog) -> Result<(), Error> {
        loop {
            if self.inbuf.len() < Header::LEN {
                return Ok(());
            }
            let header_bytes: [u8; 8] = self.inbuf[..Header::LEN].try_into().unwrap();
            let header = Header::decode(header_bytes)?;
            let needed =
                Header::LEN + header.content_length as usize + header.padding_length as usize;
            if self.inbuf.len() < needed {
                return Ok(());
            }
            let content =
                self.inbuf[Header::LEN..Header::LEN + header.content_length as usize].to_vec();
            self.inbuf.drain(..needed);
            self.handle_record(header.type_id, header.request_id, &content, catalog)?;
        }
    }

    fn handle_record(
        &mut self,
        type_id: u8,
        request_id: u16,
        content: &[u8],
        catalog: &Catalog,
    ) -> Result<(), Error> {
        match type_id {
            TYPE_BEGIN_REQUEST => self.handle_begin_request(request_id, content),
            TYPE_ABORT_REQUEST => self.finish_request(request_id, 1, ProtocolStatus::RequestComplete),
            TYPE_PARAMS => self.handle_params(request_id, content, catalog),
            TYPE_STDIN => Ok(()), // the responder never reads a request body; drop it
            TYPE_GET_VALUES => {
                log::debug!(request_id; "FCGI_GET_VALUES is not answered; dropping");
                Ok(())
            }
            other => {
                log::warn!(request_id, record_type = other; "dropping unrecognized record type");
                Ok(())
            }
        }
    }

    fn handle_begin_request(&mut self, request_id: u16, content: &[u8]) -> Result<(), Error> {
        if self.done {
            // The peer is still using a connection whose last request closed
            // it out by declining FCGI_KEEP_CONN.
            return Err(Error::KeepConnViolation);
        }
        if self.requests.contains_key(&request_id) {
            log::warn!(request_id; "duplicate FCGI_BEGIN_REQUEST; ignoring");
            return Ok(());
        }

        let (role_id, flags) = BeginRequestBody::decode_raw(content)?;
        let keep_conn = keep_conn_flag(flags);

        match record::Role::from_id(role_id) {
            Ok(role) if role.supported() => {
                let mut req = Request::new(request_id);
                req.keep_conn = keep_conn;
                self.requests.insert(request_id, req);
            }
            _ => self.reject_unknown_role(request_id, keep_conn)?,
        }
        Ok(())
    }

    fn reject_unknown_role(&mut self, request_id: u16, keep_conn: bool) -> Result<(), Error> {
        let header = Header {
            type_id: TYPE_END_REQUEST,
            request_id,
            content_length: 8,
            padding_length: 0,
        };
        self.outbuf.extend_from_slice(&header.encode());
        EndRequestBody::new(1, ProtocolStatus::UnknownRole).encode(&mut self.outbuf)?;
        if !keep_conn {
            self.done = true;
        }
        Ok(())
    }

    fn handle_params(
        &mut self,
        request_id: u16,
        content: &[u8],
        catalog: &Catalog,
    ) -> Result<(), Error> {
        let Some(req) = self.requests.get_mut(&request_id) else {
            return Ok(()); // unknown id, already drained off the wire
        };
        if req.dispatched {
            return Ok(()); // stray PARAMS after the terminator; ignore
        }

        if content.is_empty() {
            req.dispatched = true;
            let mut sink = Vec::new();
            let app_status = router::dispatch(req, catalog, &mut sink)?;
            req.out.flush(&mut sink)?;
            self.outbuf.extend_from_slice(&sink);
            return self.finish_request(request_id, app_status, ProtocolStatus::RequestComplete);
        }

        for (name, value) in pairs::decode(content)? {
            req.apply_param(&name, &value);
        }
        Ok(())
    }

    fn finish_request(
        &mut self,
        request_id: u16,
        app_status: u8,
        protocol_status: ProtocolStatus,
    ) -> Result<(), Error> {
        let Some(mut req) = self.requests.remove(&request_id) else {
            return Ok(());
        };
        req.out.flush(&mut self.outbuf)?;
        req.ended = true;

        let header = Header {
            type_id: TYPE_END_REQUEST,
            request_id,
            content_length: 8,
            padding_length: 0,
        };
        self.outbuf.extend_from_slice(&header.encode());
        EndRequestBody::new(app_status, protocol_status).encode(&mut self.outbuf)?;

        if !req.keep_conn {
            self.done = true;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{TYPE_ABORT_REQUEST, TYPE_BEGIN_REQUEST, TYPE_PARAMS, TYPE_STDOUT, VERSION};
    use assert_matches::assert_matches;

    fn frame(type_id: u8, request_id: u16, content: &[u8]) -> Vec<u8> {
        let mut out = vec![
            VERSION,
            type_id,
            (request_id >> 8) as u8,
            request_id as u8,
            (content.len() >> 8) as u8,
            content.len() as u8,
            0,
            0,
        ];
        out.extend_from_slice(content);
        out
    }

    fn begin_request_body(role_id: u16, keep_conn: bool) -> Vec<u8> {
        vec![
            (role_id >> 8) as u8,
            role_id as u8,
            if keep_conn { 1 } else { 0 },
            0,
            0,
            0,
            0,
            0,
        ]
    }

    fn nv_pairs(pairs: &[(&[u8], &[u8])]) -> Vec<u8> {
        let mut out = Vec::new();
        record::pairs::encode(pairs, &mut out).unwrap();
        out
    }

    fn minimal_params(path: &str) -> Vec<u8> {
        nv_pairs(&[
            (b"SCRIPT_NAME", b"/"),
            (b"GEMINI_URL_PATH", path.as_bytes()),
        ])
    }

    fn find_end_request(bytes: &[u8], request_id: u16) -> Option<(u8, u8)> {
        let mut pos = 0;
        while pos + 8 <= bytes.len() {
            let header = Header::decode(bytes[pos..pos + 8].try_into().unwrap()).unwrap();
            let body_start = pos + 8;
            let body_end = body_start + header.content_length as usize;
            if header.type_id == record::TYPE_END_REQUEST && header.request_id == request_id {
                let body = &bytes[body_start..body_end];
                return Some((body[3], body[4]));
            }
            pos = body_end + header.padding_length as usize;
        }
        None
    }

    #[test]
    fn full_request_round_trip_emits_stdout_then_end_request() {
        let catalog = Catalog::open_in_memory_for_test().unwrap();
        let mut conn = Connection::new();

        conn.feed(&frame(TYPE_BEGIN_REQUEST, 1, &begin_request_body(1, false)));
        conn.feed(&frame(TYPE_PARAMS, 1, &minimal_params("/")));
        conn.feed(&frame(TYPE_PARAMS, 1, &[]));

        conn.process(&catalog).unwrap();

        let out = conn.drain_output();
        assert!(!out.is_empty());

        let mut saw_stdout = false;
        let mut pos = 0;
        while pos + 8 <= out.len() {
            let header = Header::decode(out[pos..pos + 8].try_into().unwrap()).unwrap();
            if header.type_id == TYPE_STDOUT {
                saw_stdout = true;
            }
            pos += 8 + header.content_length as usize + header.padding_length as usize;
        }
        assert!(saw_stdout);
        assert_eq!(find_end_request(&out, 1), Some((0, 0)));
        assert!(conn.is_done());
    }

    #[test]
    fn keep_conn_leaves_connection_open() {
        let catalog = Catalog::open_in_memory_for_test().unwrap();
        let mut conn = Connection::new();

        conn.feed(&frame(TYPE_BEGIN_REQUEST, 1, &begin_request_body(1, true)));
        conn.feed(&frame(TYPE_PARAMS, 1, &minimal_params("/")));
        conn.feed(&frame(TYPE_PARAMS, 1, &[]));
        conn.process(&catalog).unwrap();

        assert!(!conn.is_done());
    }

    #[test]
    fn unsupported_role_is_rejected_without_creating_a_request() {
        let catalog = Catalog::open_in_memory_for_test().unwrap();
        let mut conn = Connection::new();

        conn.feed(&frame(TYPE_BEGIN_REQUEST, 1, &begin_request_body(2, false)));
        conn.process(&catalog).unwrap();

        let out = conn.drain_output();
        assert_eq!(find_end_request(&out, 1), Some((1, 3)));
        assert!(conn.is_done());

        // No STDOUT should ever have been emitted for a rejected role.
        let header = Header::decode(out[..8].try_into().unwrap()).unwrap();
        assert_eq!(header.type_id, record::TYPE_END_REQUEST);
    }

    #[test]
    fn duplicate_begin_request_is_ignored() {
        let catalog = Catalog::open_in_memory_for_test().unwrap();
        let mut conn = Connection::new();

        conn.feed(&frame(TYPE_BEGIN_REQUEST, 1, &begin_request_body(1, true)));
        conn.feed(&frame(TYPE_BEGIN_REQUEST, 1, &begin_request_body(1, true)));
        conn.process(&catalog).unwrap();

        assert_eq!(conn.requests.len(), 1);
    }

    #[test]
    fn abort_request_ends_request_immediately() {
        let catalog = Catalog::open_in_memory_for_test().unwrap();
        let mut conn = Connection::new();

        conn.feed(&frame(TYPE_BEGIN_REQUEST, 1, &begin_request_body(1, true)));
        conn.feed(&frame(TYPE_ABORT_REQUEST, 1, &[]));
        conn.process(&catalog).unwrap();

        let out = conn.drain_output();
        assert_eq!(find_end_request(&out, 1), Some((1, 0)));
        assert!(conn.requests.is_empty());
    }

    #[test]
    fn multiplexed_requests_finish_independently() {
        let catalog = Catalog::open_in_memory_for_test().unwrap();
        let mut conn = Connection::new();

        conn.feed(&frame(TYPE_BEGIN_REQUEST, 1, &begin_request_body(1, true)));
        conn.feed(&frame(TYPE_BEGIN_REQUEST, 2, &begin_request_body(1, true)));
        conn.feed(&frame(TYPE_PARAMS, 2, &minimal_params("/")));
        conn.feed(&frame(TYPE_PARAMS, 2, &[]));
        conn.feed(&frame(TYPE_PARAMS, 1, &minimal_params("/all")));
        conn.feed(&frame(TYPE_PARAMS, 1, &[]));

        conn.process(&catalog).unwrap();

        let out = conn.drain_output();
        assert!(find_end_request(&out, 1).is_some());
        assert!(find_end_request(&out, 2).is_some());
        assert!(conn.requests.is_empty());
    }

    #[test]
    fn unsupported_version_tears_down_connection() {
        let catalog = Catalog::open_in_memory_for_test().unwrap();
        let mut conn = Connection::new();
        let mut bad = frame(TYPE_BEGIN_REQUEST, 1, &begin_request_body(1, true));
        bad[0] = 2; // corrupt the version byte
        conn.feed(&bad);

        assert_matches!(conn.process(&catalog), Err(Error::UnsupportedVersion(2)));
    }

    #[test]
    fn reusing_a_closed_connection_is_a_violation() {
        let catalog = Catalog::open_in_memory_for_test().unwrap();
        let mut conn = Connection::new();

        conn.feed(&frame(TYPE_BEGIN_REQUEST, 1, &begin_request_body(1, false)));
        conn.feed(&frame(TYPE_PARAMS, 1, &minimal_params("/")));
        conn.feed(&frame(TYPE_PARAMS, 1, &[]));
        conn.process(&catalog).unwrap();
        assert!(conn.is_done());

        conn.feed(&frame(TYPE_BEGIN_REQUEST, 3, &begin_request_body(1, true)));
        assert_matches!(conn.process(&catalog), Err(Error::KeepConnViolation));
    }
}
