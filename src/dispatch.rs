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

use crate::http1::{HeaderMap, Method, Response, StatusCode, Version};
use log::debug;
use mio::Waker;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};

// A complete request, detached from the connection's read buffer so
// it can be moved to a handler thread.
#[derive(Debug)]
pub struct Request {
    pub method: Method,
    pub url: String,
    pub version: Version,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
    pub peer_addr: SocketAddr,
}

pub enum DispatchStatus {
    // the handler ran inline and this is its response
    Responded(Response),
    // the response will arrive later through the ResponseSender
    Pending,
}

// The application side of the connection task. Implementations may
// answer inline or move the work to their own threads; either way the
// sender routes the result back to the owning event loop.
pub trait Dispatcher: Send + Sync {
    fn dispatch(&self, req: Request, sender: ResponseSender) -> DispatchStatus;
}

pub enum ResponseEvent {
    Response(Response),
    Chunk(Vec<u8>),
    Finish,
}

// identifies one request of one connection of one worker. generation
// guards against slab key reuse after a connection is torn down
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct ResponseAddress {
    pub conn: usize,
    pub generation: u32,
    pub seq: u64,
}

// Cross-thread route back to a worker: an mpsc handoff plus a poll
// wakeup. Everything after delivery runs on the worker thread.
#[derive(Clone)]
pub struct ResponseChannel {
    tx: mpsc::Sender<(ResponseAddress, ResponseEvent)>,
    waker: Arc<Waker>,
}

impl ResponseChannel {
    pub fn new(tx: mpsc::Sender<(ResponseAddress, ResponseEvent)>, waker: Arc<Waker>) -> Self {
        Self { tx, waker }
    }

    pub fn sender(&self, addr: ResponseAddress, cancelled: Arc<AtomicBool>) -> ResponseSender {
        ResponseSender {
            channel: self.clone(),
            addr,
            cancelled,
        }
    }
}

#[derive(Clone)]
pub struct ResponseSender {
    channel: ResponseChannel,
    addr: ResponseAddress,
    cancelled: Arc<AtomicBool>,
}

impl ResponseSender {
    pub fn respond(&self, resp: Response) {
        self.send(ResponseEvent::Response(resp));
    }

    pub fn send_chunk(&self, data: Vec<u8>) {
        self.send(ResponseEvent::Chunk(data));
    }

    pub fn finish(&self) {
        self.send(ResponseEvent::Finish);
    }

    // cooperative cancellation: the connection died or timed out.
    // handlers may keep going, but their output will be dropped
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    fn send(&self, event: ResponseEvent) {
        if self.channel.tx.send((self.addr, event)).is_err() {
            debug!("response dropped: worker is gone");
            return;
        }

        if let Err(e) = self.channel.waker.wake() {
            debug!("worker wake failed: {:?}", e);
        }
    }
}

// Internal error codes reported by handlers, projected onto HTTP
// statuses.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ErrorCode {
    BadParameter,
    ReadOnly,
    NotFound,
    DataSourceNotFound,
    Canceled,
    Killed,
    Conflict,
    UniqueConstraintViolated,
    Deadlock,
    OutOfMemory,
    Internal,
    BackendUnavailable,
    ClusterUnsupported,
}

impl ErrorCode {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadParameter => StatusCode::BadRequest,
            Self::ReadOnly => StatusCode::Forbidden,
            Self::NotFound | Self::DataSourceNotFound => StatusCode::NotFound,
            Self::Canceled | Self::Killed => StatusCode::Gone,
            Self::Conflict | Self::UniqueConstraintViolated => StatusCode::Conflict,
            Self::Deadlock | Self::OutOfMemory | Self::Internal => {
                StatusCode::InternalServerError
            }
            Self::BackendUnavailable => StatusCode::ServiceUnavailable,
            Self::ClusterUnsupported => StatusCode::NotImplemented,
        }
    }
}

pub fn error_response(code: ErrorCode, message: &str) -> Response {
    Response::with_body(code.status(), "text/plain", message.as_bytes().to_vec())
}
