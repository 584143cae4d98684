//! Serve FastCGI responder requests on one accepted connection.

use std::io::{self, Read, Write};

use tracing::{debug, warn};

use super::record::{self, BeginRequest, Record};
use super::request::{Request, URL_MAX_LENGTH};
use super::service_io::{ResponseIo, ServiceIo};

/// A fully received request.
struct Incoming {
    id: u16,
    keep_conn: bool,
    params: Vec<u8>,
    body: Vec<u8>,
}

/// Request being assembled from PARAMS and STDIN records.
struct Pending {
    incoming: Incoming,
    params_done: bool,
    stdin_done: bool,
}

/// Turns `EINTR` into `ConnectionAborted` once `stop` says so, so a blocked
/// read can be broken by a signal.
struct StopAware<'a, S> {
    inner: &'a mut S,
    stop: &'a dyn Fn() -> bool,
}

impl<S: Read> Read for StopAware<'_, S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.inner.read(buf) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                    if (self.stop)() {
                        return Err(io::Error::new(
                            io::ErrorKind::ConnectionAborted,
                            "shutdown requested",
                        ));
                    }
                }
                other => return other,
            }
        }
    }
}

impl<S: Write> Write for StopAware<'_, S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Serve requests on `stream` until the peer closes, a request without
/// `KEEP_CONN` completes, or `stop` returns true.
///
/// Queries whose raw `QUERY_STRING` is [`URL_MAX_LENGTH`] bytes or longer
/// get a `414` status without reaching `handler`.
pub fn serve_connection<S, H>(
    stream: &mut S,
    stop: &dyn Fn() -> bool,
    mut handler: H,
) -> io::Result<()>
where
    S: Read + Write,
    H: FnMut(&mut dyn ServiceIo, &Request),
{
    let mut conn = StopAware {
        inner: stream,
        stop,
    };
    while !stop() {
        let Some(incoming) = read_request(&mut conn)? else {
            break;
        };
        let env = record::decode_pairs(&incoming.params)?;
        let request = Request::new(env);
        let mut io = ResponseIo::new(&mut conn, incoming.id, &incoming.body);

        let query_len = request.header_for_name("QUERY_STRING").map_or(0, str::len);
        if query_len >= URL_MAX_LENGTH {
            debug!(len = query_len, "query string too long");
            io.add_header_field("Status: 414 Request-URI Too Long");
            io.end_header_field();
        } else {
            handler(&mut io, &request);
        }
        io.finish()?;

        if !incoming.keep_conn {
            break;
        }
    }
    Ok(())
}

fn end_request<W: Write>(w: &mut W, id: u16, protocol_status: u8) -> io::Result<()> {
    record::write_record(
        w,
        record::END_REQUEST,
        id,
        &record::end_request_body(0, protocol_status),
    )
}

fn get_values_result<W: Write>(w: &mut W, content: &[u8]) -> io::Result<()> {
    let asked = record::decode_pairs(content)?;
    let known = [
        ("FCGI_MAX_CONNS", "1"),
        ("FCGI_MAX_REQS", "1"),
        ("FCGI_MPXS_CONNS", "0"),
    ];
    let reply = record::encode_pairs(
        known
            .into_iter()
            .filter(|(name, _)| asked.iter().any(|(asked, _)| asked == name)),
    );
    record::write_record(w, record::GET_VALUES_RESULT, record::NULL_REQUEST_ID, &reply)
}

/// Read records until one responder request is complete. `Ok(None)` when
/// the peer closes first.
fn read_request<S: Read + Write>(conn: &mut S) -> io::Result<Option<Incoming>> {
    let mut pending: Option<Pending> = None;
    loop {
        let Some(Record {
            kind,
            request_id,
            content,
        }) = record::read_record(conn)?
        else {
            return Ok(None);
        };

        if request_id == record::NULL_REQUEST_ID {
            if kind == record::GET_VALUES {
                get_values_result(conn, &content)?;
            } else {
                record::write_record(
                    conn,
                    record::UNKNOWN_TYPE,
                    record::NULL_REQUEST_ID,
                    &record::unknown_type_body(kind),
                )?;
            }
            continue;
        }

        if kind == record::BEGIN_REQUEST {
            if pending.as_ref().is_some_and(|p| p.incoming.id != request_id) {
                end_request(conn, request_id, record::CANT_MPX_CONN)?;
                continue;
            }
            let Some(begin) = BeginRequest::parse(&content) else {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "short BEGIN_REQUEST body",
                ));
            };
            if begin.role != record::RESPONDER {
                warn!(role = begin.role, "refusing non-responder request");
                end_request(conn, request_id, record::UNKNOWN_ROLE)?;
                continue;
            }
            pending = Some(Pending {
                incoming: Incoming {
                    id: request_id,
                    keep_conn: begin.keep_conn(),
                    params: Vec::new(),
                    body: Vec::new(),
                },
                params_done: false,
                stdin_done: false,
            });
            continue;
        }

        let Some(current) = pending.as_mut().filter(|p| p.incoming.id == request_id) else {
            continue;
        };
        match kind {
            record::PARAMS if content.is_empty() => current.params_done = true,
            record::PARAMS => current.incoming.params.extend_from_slice(&content),
            record::STDIN if content.is_empty() => current.stdin_done = true,
            record::STDIN => current.incoming.body.extend_from_slice(&content),
            record::ABORT_REQUEST => {
                debug!(request_id, "request aborted by peer");
                let keep_conn = current.incoming.keep_conn;
                end_request(conn, request_id, record::REQUEST_COMPLETE)?;
                pending = None;
                if !keep_conn {
                    return Ok(None);
                }
                continue;
            }
            _ => {}
        }
        if current.params_done && current.stdin_done {
            return Ok(pending.take().map(|p| p.incoming));
        }
    }
}
