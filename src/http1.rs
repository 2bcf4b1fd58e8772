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

use flate2::write::DeflateEncoder;
use flate2::Compression;
use std::fmt;
use std::io;
use std::io::Write;
use std::str;

pub const HEADERS_MAX: usize = 64;

pub const CHUNKED_TERM: &[u8] = b"0\r\n\r\n";

pub const CONTINUE_RESPONSE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

pub const CORS_ALLOW_METHODS: &str = "DELETE, GET, HEAD, OPTIONS, PATCH, POST, PUT";

pub const CORS_MAX_AGE: &str = "1800";

const CORS_EXPOSE_HEADERS_DEFAULT: &str =
    "etag, content-encoding, content-length, content-type, location, server, x-arango-*";

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Method {
    Delete,
    Get,
    Head,
    Options,
    Patch,
    Post,
    Put,
}

impl Method {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "DELETE" => Some(Self::Delete),
            "GET" => Some(Self::Get),
            "HEAD" => Some(Self::Head),
            "OPTIONS" => Some(Self::Options),
            "PATCH" => Some(Self::Patch),
            "POST" => Some(Self::Post),
            "PUT" => Some(Self::Put),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Delete => "DELETE",
            Self::Get => "GET",
            Self::Head => "HEAD",
            Self::Options => "OPTIONS",
            Self::Patch => "PATCH",
            Self::Post => "POST",
            Self::Put => "PUT",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Version {
    V10,
    V11,
}

impl Version {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::V10 => "1.0",
            Self::V11 => "1.1",
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum StatusCode {
    Continue,
    SwitchingProtocols,
    Processing,
    Ok,
    Created,
    Accepted,
    NonAuthoritativeInformation,
    NoContent,
    ResetContent,
    PartialContent,
    MovedPermanently,
    Found,
    SeeOther,
    NotModified,
    TemporaryRedirect,
    PermanentRedirect,
    BadRequest,
    Unauthorized,
    PaymentRequired,
    Forbidden,
    NotFound,
    MethodNotAllowed,
    NotAcceptable,
    RequestTimeout,
    Conflict,
    Gone,
    LengthRequired,
    PreconditionFailed,
    PayloadTooLarge,
    RequestUriTooLong,
    UnsupportedMediaType,
    RequestedRangeNotSatisfiable,
    ExpectationFailed,
    ImATeapot,
    UnprocessableEntity,
    Locked,
    PreconditionRequired,
    TooManyRequests,
    RequestHeaderFieldsTooLarge,
    UnavailableForLegalReasons,
    InternalServerError,
    NotImplemented,
    BadGateway,
    ServiceUnavailable,
    HttpVersionNotSupported,
    BandwidthLimitExceeded,
    NotExtended,
    Unknown(u16),
}

impl StatusCode {
    pub fn from_u16(code: u16) -> Self {
        match code {
            100 => Self::Continue,
            101 => Self::SwitchingProtocols,
            102 => Self::Processing,
            200 => Self::Ok,
            201 => Self::Created,
            202 => Self::Accepted,
            203 => Self::NonAuthoritativeInformation,
            204 => Self::NoContent,
            205 => Self::ResetContent,
            206 => Self::PartialContent,
            301 => Self::MovedPermanently,
            302 => Self::Found,
            303 => Self::SeeOther,
            304 => Self::NotModified,
            307 => Self::TemporaryRedirect,
            308 => Self::PermanentRedirect,
            400 => Self::BadRequest,
            401 => Self::Unauthorized,
            402 => Self::PaymentRequired,
            403 => Self::Forbidden,
            404 => Self::NotFound,
            405 => Self::MethodNotAllowed,
            406 => Self::NotAcceptable,
            408 => Self::RequestTimeout,
            409 => Self::Conflict,
            410 => Self::Gone,
            411 => Self::LengthRequired,
            412 => Self::PreconditionFailed,
            413 => Self::PayloadTooLarge,
            414 => Self::RequestUriTooLong,
            415 => Self::UnsupportedMediaType,
            416 => Self::RequestedRangeNotSatisfiable,
            417 => Self::ExpectationFailed,
            418 => Self::ImATeapot,
            422 => Self::UnprocessableEntity,
            423 => Self::Locked,
            428 => Self::PreconditionRequired,
            429 => Self::TooManyRequests,
            431 => Self::RequestHeaderFieldsTooLarge,
            451 => Self::UnavailableForLegalReasons,
            500 => Self::InternalServerError,
            501 => Self::NotImplemented,
            502 => Self::BadGateway,
            503 => Self::ServiceUnavailable,
            505 => Self::HttpVersionNotSupported,
            509 => Self::BandwidthLimitExceeded,
            510 => Self::NotExtended,
            code => Self::Unknown(code),
        }
    }

    pub fn as_u16(&self) -> u16 {
        match self {
            Self::Continue => 100,
            Self::SwitchingProtocols => 101,
            Self::Processing => 102,
            Self::Ok => 200,
            Self::Created => 201,
            Self::Accepted => 202,
            Self::NonAuthoritativeInformation => 203,
            Self::NoContent => 204,
            Self::ResetContent => 205,
            Self::PartialContent => 206,
            Self::MovedPermanently => 301,
            Self::Found => 302,
            Self::SeeOther => 303,
            Self::NotModified => 304,
            Self::TemporaryRedirect => 307,
            Self::PermanentRedirect => 308,
            Self::BadRequest => 400,
            Self::Unauthorized => 401,
            Self::PaymentRequired => 402,
            Self::Forbidden => 403,
            Self::NotFound => 404,
            Self::MethodNotAllowed => 405,
            Self::NotAcceptable => 406,
            Self::RequestTimeout => 408,
            Self::Conflict => 409,
            Self::Gone => 410,
            Self::LengthRequired => 411,
            Self::PreconditionFailed => 412,
            Self::PayloadTooLarge => 413,
            Self::RequestUriTooLong => 414,
            Self::UnsupportedMediaType => 415,
            Self::RequestedRangeNotSatisfiable => 416,
            Self::ExpectationFailed => 417,
            Self::ImATeapot => 418,
            Self::UnprocessableEntity => 422,
            Self::Locked => 423,
            Self::PreconditionRequired => 428,
            Self::TooManyRequests => 429,
            Self::RequestHeaderFieldsTooLarge => 431,
            Self::UnavailableForLegalReasons => 451,
            Self::InternalServerError => 500,
            Self::NotImplemented => 501,
            Self::BadGateway => 502,
            Self::ServiceUnavailable => 503,
            Self::HttpVersionNotSupported => 505,
            Self::BandwidthLimitExceeded => 509,
            Self::NotExtended => 510,
            Self::Unknown(code) => *code,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            Self::Continue => "Continue",
            Self::SwitchingProtocols => "Switching Protocols",
            Self::Processing => "Processing",
            Self::Ok => "OK",
            Self::Created => "Created",
            Self::Accepted => "Accepted",
            Self::NonAuthoritativeInformation => "Non-Authoritative Information",
            Self::NoContent => "No Content",
            Self::ResetContent => "Reset Content",
            Self::PartialContent => "Partial Content",
            Self::MovedPermanently => "Moved Permanently",
            Self::Found => "Found",
            Self::SeeOther => "See Other",
            Self::NotModified => "Not Modified",
            Self::TemporaryRedirect => "Temporary Redirect",
            Self::PermanentRedirect => "Permanent Redirect",
            Self::BadRequest => "Bad Request",
            Self::Unauthorized => "Unauthorized",
            Self::PaymentRequired => "Payment Required",
            Self::Forbidden => "Forbidden",
            Self::NotFound => "Not Found",
            Self::MethodNotAllowed => "Method Not Allowed",
            Self::NotAcceptable => "Not Acceptable",
            Self::RequestTimeout => "Request Timeout",
            Self::Conflict => "Conflict",
            Self::Gone => "Gone",
            Self::LengthRequired => "Length Required",
            Self::PreconditionFailed => "Precondition Failed",
            Self::PayloadTooLarge => "Payload Too Large",
            Self::RequestUriTooLong => "Request-URI Too Long",
            Self::UnsupportedMediaType => "Unsupported Media Type",
            Self::RequestedRangeNotSatisfiable => "Requested Range Not Satisfiable",
            Self::ExpectationFailed => "Expectation Failed",
            Self::ImATeapot => "I'm a teapot",
            Self::UnprocessableEntity => "Unprocessable Entity",
            Self::Locked => "Locked",
            Self::PreconditionRequired => "Precondition Required",
            Self::TooManyRequests => "Too Many Requests",
            Self::RequestHeaderFieldsTooLarge => "Request Header Fields Too Large",
            Self::UnavailableForLegalReasons => "Unavailable For Legal Reasons",
            Self::InternalServerError => "Internal Server Error",
            Self::NotImplemented => "Not Implemented",
            Self::BadGateway => "Bad Gateway",
            Self::ServiceUnavailable => "Service Unavailable",
            Self::HttpVersionNotSupported => "HTTP Version Not Supported",
            Self::BandwidthLimitExceeded => "Bandwidth Limit Exceeded",
            Self::NotExtended => "Not Extended",
            Self::Unknown(code) => match code / 100 {
                1 => "Informational",
                2 => "Success",
                3 => "Redirection",
                4 => "Client error",
                5 => "Server error",
                _ => "Unknown",
            },
        }
    }
}

// header names are compared case-insensitively and duplicate sets
// overwrite (last write wins). names set through set() are stored
// lowercased; set_preserve_case() keeps the caller's casing for the
// wire
#[derive(Debug, Clone, Default)]
pub struct HeaderMap {
    entries: Vec<(String, String)>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn set(&mut self, name: &str, value: &str) {
        self.set_entry(name.to_ascii_lowercase(), value);
    }

    pub fn set_preserve_case(&mut self, name: &str, value: &str) {
        self.set_entry(String::from(name), value);
    }

    fn set_entry(&mut self, name: String, value: &str) {
        for e in self.entries.iter_mut() {
            if e.0.eq_ignore_ascii_case(&name) {
                e.0 = name;
                e.1 = String::from(value);
                return;
            }
        }

        self.entries.push((name, String::from(value)));
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.0.eq_ignore_ascii_case(name))
            .map(|e| e.1.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn remove(&mut self, name: &str) {
        self.entries.retain(|e| !e.0.eq_ignore_ascii_case(name));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|e| (e.0.as_str(), e.1.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ParseError {
    Syntax,
    TooManyHeaders,
    UnsupportedMethod,
    UnsupportedVersion,
}

impl ParseError {
    // the status a protocol error is answered with before closing
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Syntax => StatusCode::BadRequest,
            Self::TooManyHeaders => StatusCode::RequestHeaderFieldsTooLarge,
            Self::UnsupportedMethod => StatusCode::MethodNotAllowed,
            Self::UnsupportedVersion => StatusCode::HttpVersionNotSupported,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ContentLengthError {
    Missing,
    Malformed,
}

// find the end-of-headers sentinel. returns the offset just past the
// blank line, or None if more bytes are needed
pub fn find_header_end(buf: &[u8], from: usize) -> Option<usize> {
    if buf.len() < from + 4 {
        return None;
    }

    buf[from..]
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|pos| from + pos + 4)
}

#[derive(Debug)]
pub struct RequestHead {
    pub method: Method,
    pub url: String,
    pub version: Version,
    pub headers: HeaderMap,
}

// tokenize a complete header region (request line + headers + blank
// line). the caller has already located the end-of-headers sentinel,
// so a partial parse here means the bytes are malformed
pub fn parse_request_head(head: &[u8]) -> Result<RequestHead, ParseError> {
    let mut headers = [httparse::EMPTY_HEADER; HEADERS_MAX];
    let mut req = httparse::Request::new(&mut headers);

    match req.parse(head) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => return Err(ParseError::Syntax),
        Err(httparse::Error::TooManyHeaders) => return Err(ParseError::TooManyHeaders),
        Err(httparse::Error::Version) => return Err(ParseError::UnsupportedVersion),
        Err(_) => return Err(ParseError::Syntax),
    }

    let method = match Method::parse(req.method.unwrap()) {
        Some(method) => method,
        None => return Err(ParseError::UnsupportedMethod),
    };

    let version = match req.version.unwrap() {
        0 => Version::V10,
        1 => Version::V11,
        _ => return Err(ParseError::UnsupportedVersion),
    };

    let mut map = HeaderMap::new();

    for h in req.headers.iter() {
        let value = match str::from_utf8(h.value) {
            Ok(value) => value,
            Err(_) => return Err(ParseError::Syntax),
        };

        map.set(h.name, value);
    }

    Ok(RequestHead {
        method,
        url: String::from(req.path.unwrap()),
        version,
        headers: map,
    })
}

// Content-Length policy: absent is fine (no body), an empty value
// means the client failed to supply a required length, anything
// non-numeric or negative is malformed
pub fn parse_content_length(headers: &HeaderMap) -> Result<Option<usize>, ContentLengthError> {
    let value = match headers.get("content-length") {
        Some(value) => value.trim(),
        None => return Ok(None),
    };

    if value.is_empty() {
        return Err(ContentLengthError::Missing);
    }

    if value.starts_with('-') {
        return Err(ContentLengthError::Malformed);
    }

    match value.parse() {
        Ok(len) => Ok(Some(len)),
        Err(_) => Err(ContentLengthError::Malformed),
    }
}

// check a comma-separated header value for a token, ignoring
// parameters such as q-values
pub fn header_value_contains(value: &str, token: &str) -> bool {
    for part in value.split(',') {
        let part = match part.split(';').next() {
            Some(part) => part.trim(),
            None => continue,
        };

        if part.eq_ignore_ascii_case(token) {
            return true;
        }
    }

    false
}

// connection disposition: 1.1 defaults to keep-alive unless the
// client says close; 1.0 defaults to close unless the client asks
// for keep-alive
pub fn keep_alive(version: Version, headers: &HeaderMap) -> bool {
    let mut keep = false;
    let mut close = false;

    if let Some(value) = headers.get("connection") {
        keep = header_value_contains(value, "keep-alive");
        close = header_value_contains(value, "close");
    }

    match version {
        Version::V11 => !close,
        Version::V10 => keep && !close,
    }
}

pub fn accepts_deflate(headers: &HeaderMap) -> bool {
    match headers.get("accept-encoding") {
        Some(value) => header_value_contains(value, "deflate"),
        None => false,
    }
}

pub fn expects_continue(version: Version, headers: &HeaderMap) -> bool {
    if version != Version::V11 {
        return false;
    }

    match headers.get("expect") {
        Some(value) => header_value_contains(value, "100-continue"),
        None => false,
    }
}

#[derive(Debug)]
pub enum Body {
    Full(Vec<u8>),
    Chunked,
    Head(usize),
}

#[derive(Debug)]
pub struct Response {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Body,
}

impl Response {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Body::Full(Vec::new()),
        }
    }

    pub fn with_body(status: StatusCode, content_type: &str, body: Vec<u8>) -> Self {
        let mut resp = Self::new(status);
        resp.headers.set_preserve_case("Content-Type", content_type);
        resp.body = Body::Full(body);

        resp
    }

    // start a chunked stream. the body arrives later through
    // send_chunk/finish on the response sender
    pub fn chunked(status: StatusCode) -> Self {
        let mut resp = Self::new(status);
        resp.body = Body::Chunked;

        resp
    }
}

pub struct RespondContext<'a> {
    pub version: Version,
    pub keep_alive: bool,
    pub server_tag: &'a str,
}

pub fn status_has_no_body(status: StatusCode) -> bool {
    matches!(status.as_u16(), 100..=199 | 204 | 304)
}

// serialize the status line and headers. the assembler owns the
// Server, Connection, Content-Length and Transfer-Encoding headers;
// handler-supplied copies of those are dropped
pub fn encode_head(resp: &Response, ctx: &RespondContext) -> Vec<u8> {
    let mut buf = Vec::with_capacity(256);

    write!(
        buf,
        "HTTP/{} {} {}\r\n",
        ctx.version.as_str(),
        resp.status.as_u16(),
        resp.status.reason()
    )
    .unwrap();

    write!(buf, "Server: {}\r\n", ctx.server_tag).unwrap();

    for (name, value) in resp.headers.iter() {
        if name.eq_ignore_ascii_case("Connection")
            || name.eq_ignore_ascii_case("Content-Length")
            || name.eq_ignore_ascii_case("Transfer-Encoding")
        {
            continue;
        }

        write!(buf, "{}: {}\r\n", name, value).unwrap();
    }

    if ctx.keep_alive {
        buf.extend_from_slice(b"Connection: Keep-Alive\r\n");
    } else {
        buf.extend_from_slice(b"Connection: close\r\n");
    }

    match &resp.body {
        Body::Full(body) => {
            if !status_has_no_body(resp.status) {
                write!(buf, "Content-Length: {}\r\n", body.len()).unwrap();
            }
        }
        Body::Head(len) => {
            if !status_has_no_body(resp.status) {
                write!(buf, "Content-Length: {}\r\n", len).unwrap();
            }
        }
        Body::Chunked => {
            buf.extend_from_slice(b"Transfer-Encoding: chunked\r\n");
        }
    }

    buf.extend_from_slice(b"\r\n");

    buf
}

// frame one chunk: <hex-length>\r\n<bytes>\r\n
pub fn encode_chunk(data: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(data.len() + 10);

    write!(buf, "{:x}\r\n", data.len()).unwrap();
    buf.extend_from_slice(data);
    buf.extend_from_slice(b"\r\n");

    buf
}

#[derive(Debug, Clone)]
pub struct CorsPolicy {
    // respond with a wildcard instead of echoing the origin
    pub use_wildcard: bool,
    // origins allowed to send credentials. "*" trusts everyone
    pub trusted_origins: Vec<String>,
    pub expose_headers: String,
}

impl Default for CorsPolicy {
    fn default() -> Self {
        Self {
            use_wildcard: false,
            trusted_origins: Vec::new(),
            expose_headers: String::from(CORS_EXPOSE_HEADERS_DEFAULT),
        }
    }
}

impl CorsPolicy {
    pub fn deny_credentials(&self, origin: &str) -> bool {
        !self
            .trusted_origins
            .iter()
            .any(|o| o == origin || o == "*")
    }

    fn allow_origin<'a>(&self, origin: &'a str) -> &'a str {
        if self.use_wildcard {
            "*"
        } else {
            origin
        }
    }
}

pub fn add_preflight_headers(
    resp: &mut Response,
    policy: &CorsPolicy,
    origin: &str,
    request_headers: Option<&str>,
    deny_credentials: bool,
) {
    let headers = &mut resp.headers;

    headers.set_preserve_case("Access-Control-Allow-Origin", policy.allow_origin(origin));
    headers.set_preserve_case("Access-Control-Allow-Methods", CORS_ALLOW_METHODS);

    if let Some(request_headers) = request_headers {
        headers.set_preserve_case("Access-Control-Allow-Headers", request_headers);
    }

    headers.set_preserve_case("Access-Control-Max-Age", CORS_MAX_AGE);
    headers.set_preserve_case(
        "Access-Control-Allow-Credentials",
        if deny_credentials { "false" } else { "true" },
    );
}

pub fn add_cors_headers(
    resp: &mut Response,
    policy: &CorsPolicy,
    origin: &str,
    deny_credentials: bool,
) {
    let headers = &mut resp.headers;

    headers.set_preserve_case("Access-Control-Allow-Origin", policy.allow_origin(origin));
    headers.set_preserve_case("Access-Control-Expose-Headers", &policy.expose_headers);
    headers.set_preserve_case(
        "Access-Control-Allow-Credentials",
        if deny_credentials { "false" } else { "true" },
    );
}

pub fn deflate_body(data: &[u8]) -> Result<Vec<u8>, io::Error> {
    let mut enc = DeflateEncoder::new(Vec::with_capacity(data.len() / 2), Compression::default());

    enc.write_all(data)?;

    enc.finish()
}
