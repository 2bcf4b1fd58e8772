/*
 * Copyright (C) 2025 Fastly, Inc.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use crate::buffer::ReadBuffer;
use crate::dispatch::{
    DispatchStatus, Dispatcher, Request, ResponseAddress, ResponseChannel, ResponseEvent,
};
use crate::http1::{
    self, Body, ContentLengthError, CorsPolicy, Method, RequestHead, RespondContext, Response,
    StatusCode, Version,
};
use crate::stats::{ErrorCategory, RequestStatistics, ServerStatistics};
use crate::writequeue::WriteQueue;
use arrayvec::ArrayString;
use log::{debug, warn};
use std::cmp;
use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::io::{Read, Write};
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct Limits {
    pub header_size_max: usize,
    pub body_size_max: usize,
    pub pipeline_max: usize,
    pub compact_every: u32,
    pub write_queue_bytes_max: usize,
    pub compress_min: usize,
    pub read_buffer_size: usize,
    pub keep_alive_timeout: Duration,
    pub shutdown_grace: Duration,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            header_size_max: 64 * 1024,
            body_size_max: 64 * 1024 * 1024,
            pipeline_max: 64,
            compact_every: 500,
            write_queue_bytes_max: 256 * 1024,
            compress_min: 16 * 1024,
            read_buffer_size: 16 * 1024,
            keep_alive_timeout: Duration::from_secs(90),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TaskConfig {
    pub limits: Limits,
    pub cors: CorsPolicy,
    pub server_tag: String,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            limits: Limits::default(),
            cors: CorsPolicy::default(),
            server_tag: String::from(concat!("portico/", env!("CARGO_PKG_VERSION"))),
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum TaskState {
    ReadingHead,
    ReadingBody,
    Dispatching,
    WritingResponse,
    Chunking,
    Closed,
}

// readiness reported back to the owning event loop after each event
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Want {
    pub read: bool,
    pub write: bool,
    pub deadline: Option<Instant>,
}

// the request currently being framed out of the read buffer
struct CurrentRequest {
    head: RequestHead,
    keep_alive: bool,
    origin: Option<String>,
    deny_credentials: bool,
    accept_deflate: bool,
    stats: Option<RequestStatistics>,
}

// a dispatched request awaiting its response. responses are written
// in seq order no matter when handlers finish
struct InFlight {
    seq: u64,
    head_only: bool,
    version: Version,
    keep_alive: bool,
    origin: Option<String>,
    deny_credentials: bool,
    accept_deflate: bool,
    cancelled: Arc<AtomicBool>,
    stats: Option<RequestStatistics>,
}

// a response (and any chunks that trailed it) parked behind the
// pipeline head
#[derive(Default)]
struct PendingResponse {
    resp: Option<Response>,
    chunks: Vec<Vec<u8>>,
    finished: bool,
}

// Per-connection state machine. Owns the socket, the read buffer and
// the write queue; driven entirely by readiness callbacks from one
// event loop plus cross-thread response delivery. Generic over the
// stream so the machine can run against a scripted socket in tests.
pub struct CommTask<S: Read + Write> {
    stream: S,
    peer_addr: SocketAddr,
    id: ArrayString<32>,
    conn_key: usize,
    generation: u32,

    cfg: Rc<TaskConfig>,
    dispatcher: Arc<dyn Dispatcher>,
    channel: ResponseChannel,
    stats: Arc<ServerStatistics>,

    state: TaskState,
    rbuf: ReadBuffer,
    wq: WriteQueue,

    cur: Option<CurrentRequest>,
    in_flight: VecDeque<InFlight>,
    reorder: BTreeMap<u64, PendingResponse>,
    next_seq: u64,

    chunking_seq: Option<u64>,
    chunking_stats: Option<RequestStatistics>,
    chunking_cancel: Option<Arc<AtomicBool>>,

    setup_done: bool,
    closed: bool,
    close_requested: bool,
    read_closed: bool,
    parse_disabled: bool,
    timing_out: bool,
    in_drive: bool,

    since_compact: u32,
    deadline: Option<Instant>,
}

impl<S: Read + Write> CommTask<S> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        stream: S,
        peer_addr: SocketAddr,
        id: ArrayString<32>,
        conn_key: usize,
        generation: u32,
        cfg: Rc<TaskConfig>,
        dispatcher: Arc<dyn Dispatcher>,
        channel: ResponseChannel,
        stats: Arc<ServerStatistics>,
    ) -> Self {
        let rbuf_max =
            cfg.limits.header_size_max + cfg.limits.body_size_max + cfg.limits.read_buffer_size;
        let rbuf = ReadBuffer::new(cfg.limits.read_buffer_size, rbuf_max);

        Self {
            stream,
            peer_addr,
            id,
            conn_key,
            generation,
            cfg,
            dispatcher,
            channel,
            stats,
            state: TaskState::ReadingHead,
            rbuf,
            wq: WriteQueue::new(),
            cur: None,
            in_flight: VecDeque::new(),
            reorder: BTreeMap::new(),
            next_seq: 0,
            chunking_seq: None,
            chunking_stats: None,
            chunking_cancel: None,
            setup_done: false,
            closed: false,
            close_requested: false,
            read_closed: false,
            parse_disabled: false,
            timing_out: false,
            in_drive: false,
            since_compact: 0,
            deadline: None,
        }
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    pub fn wants(&self) -> Want {
        if self.closed {
            return Want {
                read: false,
                write: false,
                deadline: None,
            };
        }

        let read = self.setup_done
            && !self.read_closed
            && self.in_flight.len() < self.cfg.limits.pipeline_max
            && self.wq.remaining() < self.cfg.limits.write_queue_bytes_max;

        Want {
            read,
            write: !self.wq.is_empty(),
            deadline: self.deadline,
        }
    }

    // the socket is registered; start the keep-alive clock. events
    // racing ahead of this call are dropped
    pub fn on_setup(&mut self, now: Instant) {
        self.setup_done = true;
        self.deadline = Some(now + self.cfg.limits.keep_alive_timeout);

        debug!("conn {}: started for {}", self.id, self.peer_addr);
    }

    pub fn on_read_ready(&mut self, now: Instant) {
        if !self.setup_done {
            debug!("conn {}: read event before setup, dropping", self.id);
            return;
        }

        if self.closed || self.read_closed {
            return;
        }

        let mut eof = false;

        loop {
            if !self.rbuf.ensure_write_avail() {
                let status = if self.cur.is_none() {
                    StatusCode::RequestHeaderFieldsTooLarge
                } else {
                    StatusCode::PayloadTooLarge
                };

                self.protocol_error(status, now);
                break;
            }

            match self.rbuf.write_from(&mut self.stream) {
                Ok(0) => {
                    eof = true;
                    break;
                }
                Ok(size) => {
                    self.stats.add_bytes_read(size);
                    self.refresh_deadline(now);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.transport_error(e);
                    return;
                }
            }
        }

        if eof && !self.closed {
            // the peer finished sending. requests already buffered
            // are still served below with a close disposition;
            // anything incomplete can never complete
            debug!("conn {}: peer closed its sending side", self.id);

            self.read_closed = true;
            self.close_requested = true;
        }

        if !self.closed {
            self.drive_parse(now);
        }

        if eof && !self.closed {
            self.parse_disabled = true;
            self.cur = None;
        }

        if !self.closed {
            self.try_write(now);
            self.maybe_close_when_idle();
        }

        self.recompute_state();
    }

    pub fn on_write_ready(&mut self, now: Instant) {
        if !self.setup_done {
            debug!("conn {}: write event before setup, dropping", self.id);
            return;
        }

        if self.closed {
            return;
        }

        self.try_write(now);
        self.recompute_state();
    }

    pub fn on_timeout(&mut self, now: Instant) {
        if self.closed || !self.setup_done {
            return;
        }

        match self.deadline {
            Some(deadline) if deadline <= now => {}
            _ => return,
        }

        let idle =
            self.in_flight.is_empty() && self.chunking_seq.is_none() && self.wq.is_empty();

        if idle {
            debug!("conn {}: keep-alive timeout", self.id);
            self.stats.count_error(ErrorCategory::Timeout);
            self.close_now();
        } else if !self.timing_out {
            // a request is in flight; give its response a grace
            // period to finish before forcing the connection down
            debug!("conn {}: timeout with request in flight", self.id);

            self.timing_out = true;
            self.cancel_in_flight();
            self.close_requested = true;
            self.parse_disabled = true;
            self.read_closed = true;
            self.deadline = Some(now + self.cfg.limits.shutdown_grace);
        } else {
            debug!("conn {}: grace expired, force closing", self.id);
            self.stats.count_error(ErrorCategory::Timeout);
            self.close_now();
        }

        self.recompute_state();
    }

    // response delivery, from the dispatcher. seq identifies the
    // request; out-of-order completions park until their turn
    pub fn on_response(&mut self, seq: u64, event: ResponseEvent, now: Instant) {
        if self.closed {
            return;
        }

        match event {
            ResponseEvent::Response(resp) => {
                if !self.in_flight.iter().any(|e| e.seq == seq) {
                    debug!("conn {}: response for dead request {}, dropping", self.id, seq);
                    return;
                }

                let slot = self.reorder.entry(seq).or_default();

                if slot.resp.is_some() {
                    warn!("conn {}: duplicate response for request {}", self.id, seq);
                    return;
                }

                slot.resp = Some(resp);
                self.flush_ready(now);
            }
            ResponseEvent::Chunk(data) => {
                if data.is_empty() {
                    return;
                }

                if self.chunking_seq == Some(seq) {
                    self.wq.push(http1::encode_chunk(&data), None);
                } else if let Some(slot) = self.reorder.get_mut(&seq) {
                    if !slot.finished {
                        slot.chunks.push(data);
                    }
                } else {
                    debug!("conn {}: chunk for dead request {}, dropping", self.id, seq);
                }
            }
            ResponseEvent::Finish => {
                if self.chunking_seq == Some(seq) {
                    self.wq
                        .push(http1::CHUNKED_TERM.to_vec(), self.chunking_stats.take());

                    self.chunking_seq = None;
                    self.chunking_cancel = None;

                    self.flush_ready(now);
                } else if let Some(slot) = self.reorder.get_mut(&seq) {
                    slot.finished = true;
                }
            }
        }

        if !self.closed {
            self.try_write(now);

            // a pipeline slot may have freed up
            if !self.in_drive && !self.parse_disabled && !self.closed {
                self.drive_parse(now);
            }

            self.maybe_close_when_idle();
        }

        self.recompute_state();
    }

    // frame as many requests out of the buffer as limits allow,
    // dispatching each completed one
    fn drive_parse(&mut self, now: Instant) {
        if self.in_drive {
            return;
        }

        self.in_drive = true;

        loop {
            if self.closed || self.parse_disabled {
                break;
            }

            if self.in_flight.len() >= self.cfg.limits.pipeline_max {
                break;
            }

            if self.cur.is_none() {
                let start = self.rbuf.start_of_request();
                let scan_from = cmp::max(self.rbuf.read_cursor().saturating_sub(3), start);

                let end = match http1::find_header_end(self.rbuf.filled(), scan_from) {
                    Some(end) => end,
                    None => {
                        let len = self.rbuf.len();

                        if len > self.rbuf.read_cursor() {
                            self.rbuf.set_read_cursor(len);
                        }

                        if len - start > self.cfg.limits.header_size_max {
                            self.protocol_error(StatusCode::RequestHeaderFieldsTooLarge, now);
                        }

                        break;
                    }
                };

                if end - start > self.cfg.limits.header_size_max {
                    self.protocol_error(StatusCode::RequestHeaderFieldsTooLarge, now);
                    break;
                }

                let head = match http1::parse_request_head(self.rbuf.slice(start, end - start)) {
                    Ok(head) => head,
                    Err(e) => {
                        self.protocol_error(e.status(), now);
                        break;
                    }
                };

                let body_len = match http1::parse_content_length(&head.headers) {
                    Ok(Some(len)) => len,
                    Ok(None) => 0,
                    Err(ContentLengthError::Missing) => {
                        self.protocol_error(StatusCode::LengthRequired, now);
                        break;
                    }
                    Err(ContentLengthError::Malformed) => {
                        self.protocol_error(StatusCode::BadRequest, now);
                        break;
                    }
                };

                if body_len > self.cfg.limits.body_size_max {
                    self.protocol_error(StatusCode::PayloadTooLarge, now);
                    break;
                }

                self.rbuf.set_read_cursor(end);
                self.rbuf.set_body(end, body_len);

                let keep = http1::keep_alive(head.version, &head.headers);

                let origin = head.headers.get("origin").map(String::from);

                let deny_credentials = match &origin {
                    Some(origin) => self.cfg.cors.deny_credentials(origin),
                    None => false,
                };

                let accept_deflate = http1::accepts_deflate(&head.headers);

                if body_len > 0 && http1::expects_continue(head.version, &head.headers) {
                    self.wq.push(http1::CONTINUE_RESPONSE.to_vec(), None);
                }

                debug!("conn {}: request {} {}", self.id, head.method, head.url);

                self.cur = Some(CurrentRequest {
                    head,
                    keep_alive: keep,
                    origin,
                    deny_credentials,
                    accept_deflate,
                    stats: Some(RequestStatistics::new(&self.stats, now)),
                });
            }

            // body phase
            let body_start = self.rbuf.body_start();
            let body_len = self.rbuf.body_len();

            if self.rbuf.len() < body_start + body_len {
                let len = self.rbuf.len();

                if len > self.rbuf.read_cursor() {
                    self.rbuf.set_read_cursor(len);
                }

                break;
            }

            self.rbuf.set_read_cursor(body_start + body_len);

            let cur = self.cur.take().unwrap();
            let last = !cur.keep_alive;

            self.complete_request(cur, body_start, body_len, now);

            self.rbuf.consume_request();

            self.since_compact += 1;
            if self.since_compact >= self.cfg.limits.compact_every {
                self.rbuf.compact();
                self.since_compact = 0;
            }

            if last {
                // no further requests after a close disposition
                self.parse_disabled = true;
                break;
            }
        }

        self.in_drive = false;
    }

    // a complete request: answer CORS preflights inline, hand
    // everything else to the dispatcher
    fn complete_request(
        &mut self,
        cur: CurrentRequest,
        body_start: usize,
        body_len: usize,
        now: Instant,
    ) {
        let seq = self.next_seq;
        self.next_seq += 1;

        let is_preflight = cur.head.method == Method::Options
            && cur.origin.is_some()
            && cur.head.headers.contains("access-control-request-method");

        let cancelled = Arc::new(AtomicBool::new(false));

        self.in_flight.push_back(InFlight {
            seq,
            head_only: cur.head.method == Method::Head,
            version: cur.head.version,
            keep_alive: cur.keep_alive,
            origin: if is_preflight {
                None
            } else {
                cur.origin.clone()
            },
            deny_credentials: cur.deny_credentials,
            accept_deflate: cur.accept_deflate && !is_preflight,
            cancelled: Arc::clone(&cancelled),
            stats: cur.stats,
        });

        if is_preflight {
            let origin = cur.origin.as_deref().unwrap();

            let mut resp = Response::new(StatusCode::Ok);

            http1::add_preflight_headers(
                &mut resp,
                &self.cfg.cors,
                origin,
                cur.head.headers.get("access-control-request-headers"),
                cur.deny_credentials,
            );

            self.on_response(seq, ResponseEvent::Response(resp), now);
            return;
        }

        let body = if body_len > 0 {
            self.rbuf.detach(body_start, body_len)
        } else {
            Vec::new()
        };

        let req = Request {
            method: cur.head.method,
            url: cur.head.url,
            version: cur.head.version,
            headers: cur.head.headers,
            body,
            peer_addr: self.peer_addr,
        };

        let sender = self.channel.sender(
            ResponseAddress {
                conn: self.conn_key,
                generation: self.generation,
                seq,
            },
            cancelled,
        );

        let dispatcher = Arc::clone(&self.dispatcher);

        match dispatcher.dispatch(req, sender) {
            DispatchStatus::Responded(resp) => {
                self.on_response(seq, ResponseEvent::Response(resp), now)
            }
            DispatchStatus::Pending => {}
        }
    }

    // move head-of-line responses into the write queue, in request
    // arrival order
    fn flush_ready(&mut self, now: Instant) {
        loop {
            // an unfinished chunked response blocks the line
            if self.chunking_seq.is_some() {
                break;
            }

            let seq = match self.in_flight.front() {
                Some(e) => e.seq,
                None => break,
            };

            let ready = matches!(self.reorder.get(&seq), Some(p) if p.resp.is_some());
            if !ready {
                break;
            }

            let pending = self.reorder.remove(&seq).unwrap();
            let entry = self.in_flight.pop_front().unwrap();

            self.enqueue_response(entry, pending, now);
        }
    }

    fn enqueue_response(&mut self, entry: InFlight, pending: PendingResponse, now: Instant) {
        let mut resp = pending.resp.unwrap();

        if !entry.keep_alive {
            self.close_requested = true;
        }

        // the handler may demand a close
        if let Some(value) = resp.headers.get("connection") {
            if http1::header_value_contains(value, "close") {
                self.close_requested = true;
            }
        }

        if resp.status.as_u16() >= 500 {
            self.stats.count_error(ErrorCategory::Handler);
        }

        if let Some(origin) = &entry.origin {
            http1::add_cors_headers(&mut resp, &self.cfg.cors, origin, entry.deny_credentials);
        }

        if entry.accept_deflate && !entry.head_only && !resp.headers.contains("content-encoding")
        {
            if let Body::Full(body) = &resp.body {
                if body.len() >= self.cfg.limits.compress_min {
                    match http1::deflate_body(body) {
                        Ok(z) => {
                            resp.headers.set_preserve_case("Content-Encoding", "deflate");
                            resp.body = Body::Full(z);
                        }
                        Err(e) => debug!("conn {}: deflate failed: {:?}", self.id, e),
                    }
                }
            }
        }

        if entry.head_only {
            let len = match &resp.body {
                Body::Full(body) => body.len(),
                Body::Head(len) => *len,
                Body::Chunked => 0,
            };

            resp.body = Body::Head(len);
        }

        let keep_alive_out = !self.close_requested && !self.read_closed;

        let ctx = RespondContext {
            version: entry.version,
            keep_alive: keep_alive_out,
            server_tag: &self.cfg.server_tag,
        };

        let mut buf = http1::encode_head(&resp, &ctx);

        let mut stats = entry.stats;
        if let Some(stats) = &mut stats {
            stats.mark_queued(now);
        }

        match resp.body {
            Body::Full(body) => {
                if !http1::status_has_no_body(resp.status) {
                    buf.extend_from_slice(&body);
                }

                self.wq.push(buf, stats);
            }
            Body::Head(_) => {
                self.wq.push(buf, stats);
            }
            Body::Chunked => {
                self.wq.push(buf, None);

                for chunk in pending.chunks {
                    if !chunk.is_empty() {
                        self.wq.push(http1::encode_chunk(&chunk), None);
                    }
                }

                if pending.finished {
                    self.wq.push(http1::CHUNKED_TERM.to_vec(), stats);
                } else {
                    self.chunking_seq = Some(entry.seq);
                    self.chunking_stats = stats;
                    self.chunking_cancel = Some(entry.cancelled);
                }
            }
        }
    }

    fn try_write(&mut self, now: Instant) {
        if self.closed || self.wq.is_empty() {
            return;
        }

        match self.wq.write_to(&mut self.stream, now) {
            Ok(size) => {
                if size > 0 {
                    self.stats.add_bytes_written(size);
                    self.refresh_deadline(now);
                }

                if self.wq.is_empty() {
                    self.after_drain(now);
                }
            }
            Err(e) => self.transport_error(e),
        }
    }

    fn after_drain(&mut self, now: Instant) {
        if self.chunking_seq.is_some() {
            return;
        }

        if self.in_flight.is_empty() {
            if self.close_requested || self.read_closed {
                // mid-parse the close is deferred; the event handler
                // settles it once parsing has wound down
                if !self.in_drive {
                    self.close_now();
                }

                return;
            }

            self.refresh_deadline(now);

            // back-pressure may have paused parsing with pipelined
            // bytes still buffered
            if !self.in_drive && !self.parse_disabled {
                self.drive_parse(now);
            }
        }
    }

    fn maybe_close_when_idle(&mut self) {
        if (self.close_requested || self.read_closed)
            && self.wq.is_empty()
            && self.in_flight.is_empty()
            && self.chunking_seq.is_none()
        {
            self.close_now();
        }
    }

    // answer a framing problem with a best-effort error response,
    // then shut the connection down once it has flushed. the error
    // response queues behind any pipelined responses still owed
    fn protocol_error(&mut self, status: StatusCode, now: Instant) {
        if self.closed {
            return;
        }

        debug!(
            "conn {}: protocol error, responding {}",
            self.id,
            status.as_u16()
        );

        self.stats.count_error(ErrorCategory::Protocol);

        self.parse_disabled = true;
        self.read_closed = true;
        self.close_requested = true;
        self.cur = None;

        let seq = self.next_seq;
        self.next_seq += 1;

        self.in_flight.push_back(InFlight {
            seq,
            head_only: false,
            version: Version::V11,
            keep_alive: false,
            origin: None,
            deny_credentials: false,
            accept_deflate: false,
            cancelled: Arc::new(AtomicBool::new(false)),
            stats: None,
        });

        self.on_response(seq, ResponseEvent::Response(Response::new(status)), now);
    }

    fn transport_error(&mut self, e: io::Error) {
        debug!("conn {}: transport error: {:?}", self.id, e);

        self.stats.count_error(ErrorCategory::Transport);
        self.close_now();
    }

    fn cancel_in_flight(&mut self) {
        for entry in self.in_flight.iter() {
            entry.cancelled.store(true, Ordering::Relaxed);
        }

        if let Some(cancelled) = &self.chunking_cancel {
            cancelled.store(true, Ordering::Relaxed);
        }
    }

    // commit the close. nothing is written past this point
    fn close_now(&mut self) {
        if self.closed {
            return;
        }

        debug!("conn {}: closed", self.id);

        self.cancel_in_flight();

        self.closed = true;
        self.wq.clear();
        self.reorder.clear();
        self.in_flight.clear();
        self.chunking_seq = None;
        self.chunking_stats = None;
        self.chunking_cancel = None;
        self.cur = None;
        self.deadline = None;
        self.state = TaskState::Closed;
    }

    fn refresh_deadline(&mut self, now: Instant) {
        if !self.timing_out {
            self.deadline = Some(now + self.cfg.limits.keep_alive_timeout);
        }
    }

    fn recompute_state(&mut self) {
        self.state = if self.closed {
            TaskState::Closed
        } else if self.chunking_seq.is_some() {
            TaskState::Chunking
        } else if !self.wq.is_empty() {
            TaskState::WritingResponse
        } else if !self.in_flight.is_empty() {
            TaskState::Dispatching
        } else if self.cur.is_some() {
            TaskState::ReadingBody
        } else {
            TaskState::ReadingHead
        };
    }
}


#[cfg(test)]
mod tests {
    use super::testutil::FakeSock;
    use super::*;
    use crate::dispatch::ResponseSender;
    use flate2::read::DeflateDecoder;
    use mio::{Poll, Token, Waker};
    use std::sync::mpsc;
    use std::sync::Mutex;

    struct OkDispatcher;

    impl Dispatcher for OkDispatcher {
        fn dispatch(&self, _req: Request, _sender: ResponseSender) -> DispatchStatus {
            let mut resp = Response::new(StatusCode::Ok);
            resp.body = Body::Full(b"ok".to_vec());

            DispatchStatus::Responded(resp)
        }
    }

    // echoes the request body, or the url when there is no body
    struct EchoDispatcher;

    impl Dispatcher for EchoDispatcher {
        fn dispatch(&self, req: Request, _sender: ResponseSender) -> DispatchStatus {
            let body = if req.body.is_empty() {
                req.url.into_bytes()
            } else {
                req.body
            };

            let mut resp = Response::new(StatusCode::Ok);
            resp.body = Body::Full(body);

            DispatchStatus::Responded(resp)
        }
    }

    struct ChunkedDispatcher;

    impl Dispatcher for ChunkedDispatcher {
        fn dispatch(&self, _req: Request, _sender: ResponseSender) -> DispatchStatus {
            DispatchStatus::Responded(Response::chunked(StatusCode::Ok))
        }
    }

    // parks requests so the test can answer them out of band
    #[derive(Default)]
    struct PendingDispatcher {
        reqs: Mutex<Vec<Request>>,
    }

    impl Dispatcher for PendingDispatcher {
        fn dispatch(&self, req: Request, _sender: ResponseSender) -> DispatchStatus {
            self.reqs.lock().unwrap().push(req);

            DispatchStatus::Pending
        }
    }

    struct Harness {
        _poll: Poll,
        _rx: mpsc::Receiver<(ResponseAddress, ResponseEvent)>,
    }

    fn new_task_with_allowance(
        dispatcher: Arc<dyn Dispatcher>,
        limits: Limits,
        write_allow: usize,
    ) -> (CommTask<FakeSock>, Harness) {
        let poll = Poll::new().unwrap();
        let waker = Arc::new(Waker::new(poll.registry(), Token(0)).unwrap());

        let (tx, rx) = mpsc::channel();
        let channel = ResponseChannel::new(tx, waker);

        let cfg = Rc::new(TaskConfig {
            limits,
            cors: CorsPolicy::default(),
            server_tag: String::from("testsrv"),
        });

        let mut sock = FakeSock::new();
        sock.allow_write(write_allow);

        let mut task = CommTask::new(
            sock,
            "127.0.0.1:4321".parse().unwrap(),
            ArrayString::from("test-conn").unwrap(),
            0,
            1,
            cfg,
            dispatcher,
            channel,
            Arc::new(ServerStatistics::new()),
        );

        task.on_setup(Instant::now());

        (task, Harness { _poll: poll, _rx: rx })
    }

    fn new_task(
        dispatcher: Arc<dyn Dispatcher>,
        limits: Limits,
    ) -> (CommTask<FakeSock>, Harness) {
        new_task_with_allowance(dispatcher, limits, 1024 * 1024)
    }

    fn feed(task: &mut CommTask<FakeSock>, data: &[u8]) {
        task.stream_mut().add_readable(data);
        task.on_read_ready(Instant::now());
    }

    fn parse_response(data: &[u8]) -> (u16, Vec<(String, String)>, Vec<u8>, usize) {
        let mut headers = [httparse::EMPTY_HEADER; 32];
        let mut resp = httparse::Response::new(&mut headers);

        let head_size = match resp.parse(data) {
            Ok(httparse::Status::Complete(size)) => size,
            _ => panic!("incomplete response head"),
        };

        let code = resp.code.unwrap();

        let headers: Vec<(String, String)> = resp
            .headers
            .iter()
            .map(|h| {
                (
                    h.name.to_ascii_lowercase(),
                    String::from_utf8(h.value.to_vec()).unwrap(),
                )
            })
            .collect();

        let clen: usize = headers
            .iter()
            .find(|(name, _)| name == "content-length")
            .map(|(_, value)| value.parse().unwrap())
            .unwrap_or(0);

        let body_end = (head_size + clen).min(data.len());
        let body = data[head_size..body_end].to_vec();

        (code, headers, body, head_size + clen)
    }

    fn header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
        headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    #[test]
    fn test_simple_get_keep_alive() {
        let (mut task, _h) = new_task(Arc::new(OkDispatcher), Limits::default());

        feed(&mut task, b"GET /x HTTP/1.1\r\nHost: h\r\n\r\n");

        let out = task.stream_mut().take_writable();
        assert_eq!(
            out,
            b"HTTP/1.1 200 OK\r\nServer: testsrv\r\nConnection: Keep-Alive\r\nContent-Length: 2\r\n\r\nok"
        );

        // connection stays open for the next request
        assert!(!task.is_closed());
        assert_eq!(task.state(), TaskState::ReadingHead);
        assert!(task.wants().read);
    }

    #[test]
    fn test_http10_close() {
        let (mut task, _h) = new_task(Arc::new(OkDispatcher), Limits::default());

        feed(&mut task, b"GET / HTTP/1.0\r\n\r\n");

        let out = task.stream_mut().take_writable();
        let (code, headers, _, _) = parse_response(&out);

        assert_eq!(code, 200);
        assert!(out.starts_with(b"HTTP/1.0 200 OK\r\n"));
        assert_eq!(header(&headers, "connection"), Some("close"));

        // closed once the response flushed
        assert!(task.is_closed());
        assert_eq!(task.state(), TaskState::Closed);
    }

    #[test]
    fn test_http10_keep_alive_requested() {
        let (mut task, _h) = new_task(Arc::new(OkDispatcher), Limits::default());

        feed(
            &mut task,
            b"GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n",
        );

        let out = task.stream_mut().take_writable();
        let (_, headers, _, _) = parse_response(&out);

        assert_eq!(header(&headers, "connection"), Some("Keep-Alive"));
        assert!(!task.is_closed());
    }

    #[test]
    fn test_split_reads_equal_one_shot() {
        let (mut task, _h) = new_task(Arc::new(OkDispatcher), Limits::default());

        let input = b"GET /x HTTP/1.1\r\nHost: h\r\n\r\n";

        for b in input.iter() {
            feed(&mut task, &[*b]);
        }

        let out = task.stream_mut().take_writable();
        assert_eq!(
            out,
            b"HTTP/1.1 200 OK\r\nServer: testsrv\r\nConnection: Keep-Alive\r\nContent-Length: 2\r\n\r\nok"
        );
    }

    #[test]
    fn test_post_body_echoed() {
        let (mut task, _h) = new_task(Arc::new(EchoDispatcher), Limits::default());

        feed(
            &mut task,
            b"POST /docs HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello",
        );

        let out = task.stream_mut().take_writable();
        let (code, _, body, _) = parse_response(&out);

        assert_eq!(code, 200);
        assert_eq!(body, b"hello");
    }

    #[test]
    fn test_body_split_across_reads() {
        let (mut task, _h) = new_task(Arc::new(EchoDispatcher), Limits::default());

        feed(
            &mut task,
            b"POST /docs HTTP/1.1\r\nContent-Length: 10\r\n\r\nhel",
        );
        assert_eq!(task.state(), TaskState::ReadingBody);
        assert!(task.stream_mut().take_writable().is_empty());

        feed(&mut task, b"lo wor");
        assert_eq!(task.state(), TaskState::ReadingBody);

        feed(&mut task, b"ld");

        let out = task.stream_mut().take_writable();
        let (_, _, body, _) = parse_response(&out);
        assert_eq!(body, b"hello world"[..10].to_vec());
    }

    #[test]
    fn test_post_content_length_zero() {
        let dispatcher = Arc::new(PendingDispatcher::default());
        let (mut task, _h) = new_task(dispatcher.clone(), Limits::default());

        feed(&mut task, b"POST /docs HTTP/1.1\r\nContent-Length: 0\r\n\r\n");

        let reqs = dispatcher.reqs.lock().unwrap();
        assert_eq!(reqs.len(), 1);
        assert_eq!(reqs[0].method, Method::Post);
        assert!(reqs[0].body.is_empty());
    }

    #[test]
    fn test_get_without_content_length() {
        let dispatcher = Arc::new(PendingDispatcher::default());
        let (mut task, _h) = new_task(dispatcher.clone(), Limits::default());

        feed(&mut task, b"GET /docs HTTP/1.1\r\n\r\n");

        let reqs = dispatcher.reqs.lock().unwrap();
        assert_eq!(reqs.len(), 1);
        assert!(reqs[0].body.is_empty());
    }

    #[test]
    fn test_pipelined_responses_ordered() {
        let dispatcher = Arc::new(PendingDispatcher::default());
        let (mut task, _h) = new_task(dispatcher.clone(), Limits::default());

        feed(&mut task, b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\n\r\n");

        assert_eq!(dispatcher.reqs.lock().unwrap().len(), 2);

        let now = Instant::now();

        // /b completes first; nothing can be written yet
        let mut resp_b = Response::new(StatusCode::Ok);
        resp_b.body = Body::Full(b"B".to_vec());
        task.on_response(1, ResponseEvent::Response(resp_b), now);

        assert!(task.stream_mut().take_writable().is_empty());

        let mut resp_a = Response::new(StatusCode::Ok);
        resp_a.body = Body::Full(b"A".to_vec());
        task.on_response(0, ResponseEvent::Response(resp_a), now);

        let out = task.stream_mut().take_writable();

        let (code, _, body, consumed) = parse_response(&out);
        assert_eq!(code, 200);
        assert_eq!(body, b"A");

        let (code, _, body, _) = parse_response(&out[consumed..]);
        assert_eq!(code, 200);
        assert_eq!(body, b"B");

        assert!(!task.is_closed());
    }

    #[test]
    fn test_response_order_matches_arrival_order() {
        let dispatcher = Arc::new(PendingDispatcher::default());
        let (mut task, _h) = new_task(dispatcher.clone(), Limits::default());

        let mut input = Vec::new();
        for i in 0..5 {
            input.extend_from_slice(format!("GET /{} HTTP/1.1\r\n\r\n", i).as_bytes());
        }

        feed(&mut task, &input);
        assert_eq!(dispatcher.reqs.lock().unwrap().len(), 5);

        let now = Instant::now();

        // complete in reverse order
        for seq in (0..5u64).rev() {
            let mut resp = Response::new(StatusCode::Ok);
            resp.body = Body::Full(format!("r{}", seq).into_bytes());
            task.on_response(seq, ResponseEvent::Response(resp), now);
        }

        let out = task.stream_mut().take_writable();

        let mut pos = 0;
        for seq in 0..5 {
            let (_, _, body, consumed) = parse_response(&out[pos..]);
            assert_eq!(body, format!("r{}", seq).into_bytes());
            pos += consumed;
        }

        assert_eq!(pos, out.len());
    }

    #[test]
    fn test_cors_preflight() {
        let dispatcher = Arc::new(PendingDispatcher::default());
        let (mut task, _h) = new_task(dispatcher.clone(), Limits::default());

        feed(
            &mut task,
            b"OPTIONS /x HTTP/1.1\r\nOrigin: https://e.example\r\nAccess-Control-Request-Method: POST\r\nAccess-Control-Request-Headers: x-req-id\r\n\r\n",
        );

        // answered without dispatch
        assert!(dispatcher.reqs.lock().unwrap().is_empty());

        let out = task.stream_mut().take_writable();
        let (code, headers, body, _) = parse_response(&out);

        assert_eq!(code, 200);
        assert!(body.is_empty());
        assert_eq!(header(&headers, "content-length"), Some("0"));
        assert_eq!(
            header(&headers, "access-control-allow-origin"),
            Some("https://e.example")
        );
        assert_eq!(
            header(&headers, "access-control-allow-methods"),
            Some("DELETE, GET, HEAD, OPTIONS, PATCH, POST, PUT")
        );
        assert_eq!(
            header(&headers, "access-control-allow-headers"),
            Some("x-req-id")
        );
        assert_eq!(header(&headers, "access-control-max-age"), Some("1800"));
        assert_eq!(
            header(&headers, "access-control-allow-credentials"),
            Some("false")
        );

        assert!(!task.is_closed());
    }

    #[test]
    fn test_cors_headers_on_actual_response() {
        let (mut task, _h) = new_task(Arc::new(OkDispatcher), Limits::default());

        feed(
            &mut task,
            b"GET /x HTTP/1.1\r\nOrigin: https://e.example\r\n\r\n",
        );

        let out = task.stream_mut().take_writable();
        let (code, headers, _, _) = parse_response(&out);

        assert_eq!(code, 200);
        assert_eq!(
            header(&headers, "access-control-allow-origin"),
            Some("https://e.example")
        );
        assert!(header(&headers, "access-control-expose-headers").is_some());
    }

    #[test]
    fn test_options_without_origin_dispatched() {
        let dispatcher = Arc::new(PendingDispatcher::default());
        let (mut task, _h) = new_task(dispatcher.clone(), Limits::default());

        feed(&mut task, b"OPTIONS /x HTTP/1.1\r\n\r\n");

        assert_eq!(dispatcher.reqs.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_oversized_header() {
        let mut limits = Limits::default();
        limits.header_size_max = 8192;

        let (mut task, _h) = new_task(Arc::new(OkDispatcher), limits);

        let mut input = Vec::from(&b"GET / HTTP/1.1\r\nX-Pad: "[..]);
        input.resize(9000, b'a');

        feed(&mut task, &input);

        let out = task.stream_mut().take_writable();
        assert!(out.starts_with(b"HTTP/1.1 431 Request Header Fields Too Large\r\n"));

        let (_, headers, _, _) = parse_response(&out);
        assert_eq!(header(&headers, "connection"), Some("close"));

        assert!(task.is_closed());
    }

    #[test]
    fn test_header_exactly_at_limit() {
        let mut limits = Limits::default();
        limits.header_size_max = 8192;

        let (mut task, _h) = new_task(Arc::new(OkDispatcher), limits);

        let prefix = b"GET / HTTP/1.1\r\nX-Pad: ";
        let suffix = b"\r\n\r\n";
        let pad = 8192 - prefix.len() - suffix.len();

        let mut input = Vec::new();
        input.extend_from_slice(prefix);
        input.resize(prefix.len() + pad, b'a');
        input.extend_from_slice(suffix);
        assert_eq!(input.len(), 8192);

        feed(&mut task, &input);

        let out = task.stream_mut().take_writable();
        let (code, _, _, _) = parse_response(&out);
        assert_eq!(code, 200);
        assert!(!task.is_closed());
    }

    #[test]
    fn test_body_size_limits() {
        let mut limits = Limits::default();
        limits.body_size_max = 10;

        let (mut task, _h) = new_task(Arc::new(EchoDispatcher), limits.clone());

        feed(
            &mut task,
            b"POST / HTTP/1.1\r\nContent-Length: 10\r\n\r\n0123456789",
        );

        let out = task.stream_mut().take_writable();
        let (code, _, body, _) = parse_response(&out);
        assert_eq!(code, 200);
        assert_eq!(body, b"0123456789");
        assert!(!task.is_closed());

        // one byte more is rejected
        let (mut task, _h) = new_task(Arc::new(EchoDispatcher), limits);

        feed(&mut task, b"POST / HTTP/1.1\r\nContent-Length: 11\r\n\r\n");

        let out = task.stream_mut().take_writable();
        let (code, _, _, _) = parse_response(&out);
        assert_eq!(code, 413);
        assert!(task.is_closed());
    }

    #[test]
    fn test_content_length_malformed() {
        let (mut task, _h) = new_task(Arc::new(OkDispatcher), Limits::default());

        feed(&mut task, b"POST / HTTP/1.1\r\nContent-Length: abc\r\n\r\n");

        let out = task.stream_mut().take_writable();
        let (code, _, _, _) = parse_response(&out);
        assert_eq!(code, 400);
        assert!(task.is_closed());
    }

    #[test]
    fn test_content_length_empty() {
        let (mut task, _h) = new_task(Arc::new(OkDispatcher), Limits::default());

        feed(&mut task, b"POST / HTTP/1.1\r\nContent-Length: \r\n\r\n");

        let out = task.stream_mut().take_writable();
        let (code, _, _, _) = parse_response(&out);
        assert_eq!(code, 411);
        assert!(task.is_closed());
    }

    #[test]
    fn test_unsupported_version() {
        let (mut task, _h) = new_task(Arc::new(OkDispatcher), Limits::default());

        feed(&mut task, b"GET / HTTP/2.0\r\n\r\n");

        let out = task.stream_mut().take_writable();
        assert!(out.starts_with(b"HTTP/1.1 505 HTTP Version Not Supported\r\n"));
        assert!(task.is_closed());
    }

    #[test]
    fn test_error_response_ordered_after_pipelined() {
        let dispatcher = Arc::new(PendingDispatcher::default());
        let (mut task, _h) = new_task(dispatcher.clone(), Limits::default());

        // a good request followed by a broken one
        feed(&mut task, b"GET /a HTTP/1.1\r\n\r\ngarbage\r\n\r\n");

        assert_eq!(dispatcher.reqs.lock().unwrap().len(), 1);
        assert!(task.stream_mut().take_writable().is_empty());

        let mut resp = Response::new(StatusCode::Ok);
        resp.body = Body::Full(b"A".to_vec());
        task.on_response(0, ResponseEvent::Response(resp), Instant::now());

        let out = task.stream_mut().take_writable();

        let (code, _, body, consumed) = parse_response(&out);
        assert_eq!(code, 200);
        assert_eq!(body, b"A");

        let (code, _, _, _) = parse_response(&out[consumed..]);
        assert_eq!(code, 400);

        assert!(task.is_closed());
    }

    #[test]
    fn test_chunked_response() {
        let (mut task, _h) = new_task(Arc::new(ChunkedDispatcher), Limits::default());

        feed(&mut task, b"GET /stream HTTP/1.1\r\n\r\n");
        assert_eq!(task.state(), TaskState::Chunking);

        let now = Instant::now();

        task.on_response(0, ResponseEvent::Chunk(b"Hello".to_vec()), now);
        task.on_response(0, ResponseEvent::Chunk(b" World".to_vec()), now);
        task.on_response(0, ResponseEvent::Finish, now);

        let out = task.stream_mut().take_writable();
        let out_str = String::from_utf8(out.clone()).unwrap();

        assert!(out_str.contains("Transfer-Encoding: chunked\r\n"));
        assert!(!out_str.contains("Content-Length"));
        assert!(out_str.ends_with("5\r\nHello\r\n6\r\n World\r\n0\r\n\r\n"));

        // stream finished; connection reusable
        assert!(!task.is_closed());
        assert_eq!(task.state(), TaskState::ReadingHead);
    }

    #[test]
    fn test_chunked_behind_pipeline_head() {
        let dispatcher = Arc::new(PendingDispatcher::default());
        let (mut task, _h) = new_task(dispatcher.clone(), Limits::default());

        feed(&mut task, b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\n\r\n");

        let now = Instant::now();

        // the second response streams while the first is still owed;
        // its chunks buffer in arrival order
        task.on_response(1, ResponseEvent::Response(Response::chunked(StatusCode::Ok)), now);
        task.on_response(1, ResponseEvent::Chunk(b"later".to_vec()), now);
        task.on_response(1, ResponseEvent::Finish, now);

        assert!(task.stream_mut().take_writable().is_empty());

        let mut resp = Response::new(StatusCode::Ok);
        resp.body = Body::Full(b"first".to_vec());
        task.on_response(0, ResponseEvent::Response(resp), now);

        let out = task.stream_mut().take_writable();
        let out_str = String::from_utf8(out).unwrap();

        let first = out_str.find("first").unwrap();
        let later = out_str.find("5\r\nlater\r\n0\r\n\r\n").unwrap();
        assert!(first < later);
    }

    #[test]
    fn test_head_request() {
        let (mut task, _h) = new_task(Arc::new(EchoDispatcher), Limits::default());

        feed(&mut task, b"HEAD /resource HTTP/1.1\r\n\r\n");

        let out = task.stream_mut().take_writable();
        let head_end = out.windows(4).position(|w| w == b"\r\n\r\n").unwrap() + 4;

        let (code, headers, _, _) = parse_response(&out[..head_end]);
        assert_eq!(code, 200);

        // content-length of the body that would have been sent, but
        // no body bytes
        assert_eq!(header(&headers, "content-length"), Some("9"));
        assert_eq!(out.len(), head_end);
    }

    #[test]
    fn test_expect_continue() {
        let (mut task, _h) = new_task(Arc::new(EchoDispatcher), Limits::default());

        feed(
            &mut task,
            b"POST / HTTP/1.1\r\nContent-Length: 2\r\nExpect: 100-continue\r\n\r\nhi",
        );

        let out = task.stream_mut().take_writable();
        assert!(out.starts_with(b"HTTP/1.1 100 Continue\r\n\r\n"));

        let (code, _, body, _) = parse_response(&out[b"HTTP/1.1 100 Continue\r\n\r\n".len()..]);
        assert_eq!(code, 200);
        assert_eq!(body, b"hi");
    }

    #[test]
    fn test_deflate_applied_over_threshold() {
        let mut limits = Limits::default();
        limits.compress_min = 16;

        let (mut task, _h) = new_task(Arc::new(EchoDispatcher), limits);

        let mut input = Vec::from(&b"POST / HTTP/1.1\r\nAccept-Encoding: deflate\r\nContent-Length: 64\r\n\r\n"[..]);
        let body: Vec<u8> = vec![b'z'; 64];
        input.extend_from_slice(&body);

        feed(&mut task, &input);

        let out = task.stream_mut().take_writable();
        let (code, headers, resp_body, _) = parse_response(&out);

        assert_eq!(code, 200);
        assert_eq!(header(&headers, "content-encoding"), Some("deflate"));

        let clen: usize = header(&headers, "content-length").unwrap().parse().unwrap();
        assert_eq!(resp_body.len(), clen);

        let mut decoded = Vec::new();
        DeflateDecoder::new(&resp_body[..])
            .read_to_end(&mut decoded)
            .unwrap();
        assert_eq!(decoded, body);
    }

    #[test]
    fn test_deflate_skipped_under_threshold() {
        let (mut task, _h) = new_task(Arc::new(OkDispatcher), Limits::default());

        feed(
            &mut task,
            b"GET / HTTP/1.1\r\nAccept-Encoding: deflate\r\n\r\n",
        );

        let out = task.stream_mut().take_writable();
        let (_, headers, body, _) = parse_response(&out);

        assert!(header(&headers, "content-encoding").is_none());
        assert_eq!(body, b"ok");
    }

    #[test]
    fn test_backpressure_at_pipeline_limit() {
        let mut limits = Limits::default();
        limits.pipeline_max = 2;

        let dispatcher = Arc::new(PendingDispatcher::default());
        let (mut task, _h) = new_task(dispatcher.clone(), limits);

        feed(
            &mut task,
            b"GET /0 HTTP/1.1\r\n\r\nGET /1 HTTP/1.1\r\n\r\nGET /2 HTTP/1.1\r\n\r\n",
        );

        // only two in flight; reads disabled
        assert_eq!(dispatcher.reqs.lock().unwrap().len(), 2);
        assert!(!task.wants().read);

        // answering the head of line frees a slot; the buffered third
        // request is parsed and dispatched
        let mut resp = Response::new(StatusCode::Ok);
        resp.body = Body::Full(b"r0".to_vec());
        task.on_response(0, ResponseEvent::Response(resp), Instant::now());

        assert_eq!(dispatcher.reqs.lock().unwrap().len(), 3);

        // still two in flight, so reads stay off until another drains
        assert!(!task.wants().read);

        let mut resp = Response::new(StatusCode::Ok);
        resp.body = Body::Full(b"r1".to_vec());
        task.on_response(1, ResponseEvent::Response(resp), Instant::now());

        assert!(task.wants().read);
    }

    #[test]
    fn test_compaction_keeps_pipelining_correct() {
        let mut limits = Limits::default();
        limits.compact_every = 1;

        let (mut task, _h) = new_task(Arc::new(EchoDispatcher), limits);

        feed(
            &mut task,
            b"GET /first HTTP/1.1\r\n\r\nGET /second HTTP/1.1\r\n\r\n",
        );

        let out = task.stream_mut().take_writable();

        let (_, _, body, consumed) = parse_response(&out);
        assert_eq!(body, b"/first");

        let (_, _, body, _) = parse_response(&out[consumed..]);
        assert_eq!(body, b"/second");
    }

    #[test]
    fn test_peer_close_while_idle() {
        let (mut task, _h) = new_task(Arc::new(OkDispatcher), Limits::default());

        task.stream_mut().set_eof();
        task.on_read_ready(Instant::now());

        assert!(task.is_closed());
        assert!(task.stream_mut().take_writable().is_empty());
    }

    #[test]
    fn test_peer_half_close_after_request() {
        let (mut task, _h) = new_task(Arc::new(OkDispatcher), Limits::default());

        // request and FIN arrive together; the response is still
        // written, then the connection closes
        task.stream_mut().add_readable(b"GET / HTTP/1.1\r\n\r\n");
        task.stream_mut().set_eof();
        task.on_read_ready(Instant::now());

        let out = task.stream_mut().take_writable();
        let (code, headers, _, _) = parse_response(&out);

        assert_eq!(code, 200);
        assert_eq!(header(&headers, "connection"), Some("close"));
        assert!(task.is_closed());
    }

    #[test]
    fn test_idle_timeout() {
        let (mut task, _h) = new_task(Arc::new(OkDispatcher), Limits::default());

        let deadline = task.wants().deadline.unwrap();

        // before the deadline nothing happens
        task.on_timeout(deadline - Duration::from_secs(1));
        assert!(!task.is_closed());

        task.on_timeout(deadline);
        assert!(task.is_closed());
        assert!(task.stream_mut().take_writable().is_empty());
    }

    #[test]
    fn test_timeout_grace_with_request_in_flight() {
        let dispatcher = Arc::new(PendingDispatcher::default());
        let (mut task, _h) = new_task(dispatcher.clone(), Limits::default());

        feed(&mut task, b"GET /slow HTTP/1.1\r\n\r\n");

        let deadline = task.wants().deadline.unwrap();

        // first expiry grants grace
        task.on_timeout(deadline);
        assert!(!task.is_closed());

        let grace = task.wants().deadline.unwrap();
        assert!(grace > deadline);

        // the response makes it out within the grace period
        let mut resp = Response::new(StatusCode::Ok);
        resp.body = Body::Full(b"late".to_vec());
        task.on_response(0, ResponseEvent::Response(resp), grace - Duration::from_secs(1));

        let out = task.stream_mut().take_writable();
        let (code, _, body, _) = parse_response(&out);
        assert_eq!(code, 200);
        assert_eq!(body, b"late");

        assert!(task.is_closed());
    }

    #[test]
    fn test_timeout_grace_expires() {
        let dispatcher = Arc::new(PendingDispatcher::default());
        let (mut task, _h) = new_task(dispatcher.clone(), Limits::default());

        feed(&mut task, b"GET /slow HTTP/1.1\r\n\r\n");

        let deadline = task.wants().deadline.unwrap();
        task.on_timeout(deadline);
        assert!(!task.is_closed());

        let grace = task.wants().deadline.unwrap();
        task.on_timeout(grace);
        assert!(task.is_closed());
    }

    #[test]
    fn test_partial_write_resumes() {
        // no write allowance: the response has to wait in the queue
        let (mut task, _h) = new_task_with_allowance(Arc::new(OkDispatcher), Limits::default(), 0);

        feed(&mut task, b"GET /x HTTP/1.1\r\n\r\n");

        assert!(task.stream_mut().take_writable().is_empty());
        assert!(task.wants().write);
        assert_eq!(task.state(), TaskState::WritingResponse);

        // allow a few bytes at a time and drive with write readiness
        let mut out = Vec::new();

        for _ in 0..64 {
            task.stream_mut().allow_write(16);
            task.on_write_ready(Instant::now());
            out.extend_from_slice(&task.stream_mut().take_writable());

            if !task.wants().write {
                break;
            }
        }

        assert_eq!(
            out,
            b"HTTP/1.1 200 OK\r\nServer: testsrv\r\nConnection: Keep-Alive\r\nContent-Length: 2\r\n\r\nok"
        );
        assert_eq!(task.state(), TaskState::ReadingHead);
    }

    #[test]
    fn test_events_before_setup_dropped() {
        let poll = Poll::new().unwrap();
        let waker = Arc::new(Waker::new(poll.registry(), Token(0)).unwrap());
        let (tx, _rx) = mpsc::channel();

        let mut sock = FakeSock::new();
        sock.add_readable(b"GET / HTTP/1.1\r\n\r\n");
        sock.allow_write(1024);

        let mut task = CommTask::new(
            sock,
            "127.0.0.1:4321".parse().unwrap(),
            ArrayString::from("test-conn").unwrap(),
            0,
            1,
            Rc::new(TaskConfig::default()),
            Arc::new(OkDispatcher),
            ResponseChannel::new(tx, waker),
            Arc::new(ServerStatistics::new()),
        );

        // events racing ahead of setup are dropped deterministically
        task.on_read_ready(Instant::now());
        assert!(task.stream_mut().take_writable().is_empty());
        assert!(!task.wants().read);

        task.on_setup(Instant::now());
        assert!(task.wants().read);

        task.on_read_ready(Instant::now());
        let out = task.stream_mut().take_writable();
        assert!(out.starts_with(b"HTTP/1.1 200 OK\r\n"));
    }

    #[test]
    fn test_stale_response_dropped() {
        let (mut task, _h) = new_task(Arc::new(OkDispatcher), Limits::default());

        feed(&mut task, b"GET / HTTP/1.1\r\n\r\n");
        task.stream_mut().take_writable();

        // a response for a request that no longer exists
        let mut resp = Response::new(StatusCode::Ok);
        resp.body = Body::Full(b"stale".to_vec());
        task.on_response(0, ResponseEvent::Response(resp), Instant::now());

        assert!(task.stream_mut().take_writable().is_empty());
        assert!(!task.is_closed());
    }

    #[test]
    fn test_handler_error_keeps_pipelining() {
        let dispatcher = Arc::new(PendingDispatcher::default());
        let (mut task, _h) = new_task(dispatcher.clone(), Limits::default());

        feed(&mut task, b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\n\r\n");

        let now = Instant::now();

        task.on_response(
            0,
            ResponseEvent::Response(Response::new(StatusCode::InternalServerError)),
            now,
        );

        let mut resp = Response::new(StatusCode::Ok);
        resp.body = Body::Full(b"B".to_vec());
        task.on_response(1, ResponseEvent::Response(resp), now);

        let out = task.stream_mut().take_writable();

        // the 500 is per-request; the next pipelined response still
        // arrives and the connection stays up
        let (code, _, _, consumed) = parse_response(&out);
        assert_eq!(code, 500);

        let (code, _, body, _) = parse_response(&out[consumed..]);
        assert_eq!(code, 200);
        assert_eq!(body, b"B");

        assert!(!task.is_closed());
    }
}
