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

use log::trace;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ErrorCategory {
    Protocol,
    Transport,
    Timeout,
    Handler,
}

// Shared aggregate, updated from all worker threads. Counters use
// Relaxed ordering, so individual values cannot be assumed to be in
// sync with each other.
#[derive(Debug, Default)]
pub struct ServerStatistics {
    connections_accepted: AtomicU64,
    connections_current: AtomicU64,
    requests_served: AtomicU64,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    protocol_errors: AtomicU64,
    transport_errors: AtomicU64,
    timeouts: AtomicU64,
    handler_errors: AtomicU64,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Snapshot {
    pub connections_accepted: u64,
    pub connections_current: u64,
    pub requests_served: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub protocol_errors: u64,
    pub transport_errors: u64,
    pub timeouts: u64,
    pub handler_errors: u64,
}

impl ServerStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_opened(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.connections_current.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.connections_current.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn add_bytes_read(&self, amount: usize) {
        self.bytes_read.fetch_add(amount as u64, Ordering::Relaxed);
    }

    pub fn add_bytes_written(&self, amount: usize) {
        self.bytes_written
            .fetch_add(amount as u64, Ordering::Relaxed);
    }

    pub fn count_error(&self, category: ErrorCategory) {
        let counter = match category {
            ErrorCategory::Protocol => &self.protocol_errors,
            ErrorCategory::Transport => &self.transport_errors,
            ErrorCategory::Timeout => &self.timeouts,
            ErrorCategory::Handler => &self.handler_errors,
        };

        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn request_served(&self) {
        self.requests_served.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            connections_current: self.connections_current.load(Ordering::Relaxed),
            requests_served: self.requests_served.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            transport_errors: self.transport_errors.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            handler_errors: self.handler_errors.load(Ordering::Relaxed),
        }
    }
}

// Travels with a request from the moment its request line is
// recognized until the response buffer fully drains. The write queue
// stamps the final timestamp and releases the handle into the
// aggregate.
#[derive(Debug)]
pub struct RequestStatistics {
    agg: Arc<ServerStatistics>,
    read_start: Instant,
    queued: Option<Instant>,
}

impl RequestStatistics {
    pub fn new(agg: &Arc<ServerStatistics>, now: Instant) -> Self {
        Self {
            agg: Arc::clone(agg),
            read_start: now,
            queued: None,
        }
    }

    // the response has been serialized into the write queue
    pub fn mark_queued(&mut self, now: Instant) {
        if self.queued.is_none() {
            self.queued = Some(now);
        }
    }

    // the response bytes have fully left the process
    pub fn finish_written(self, now: Instant) {
        self.agg.request_served();

        let queued = self.queued.unwrap_or(now);

        trace!(
            "request served: handling={:?} writing={:?}",
            queued - self.read_start,
            now - queued
        );
    }
}
