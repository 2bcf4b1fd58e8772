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

use std::io;
use std::io::Read;

// Append-only accumulator for inbound request bytes. The region
// [start_of_request, read_cursor) holds the request currently being
// framed; bytes past read_cursor have been received but not yet
// scanned. Compaction rebases everything so start_of_request returns
// to offset 0, keeping the buffer bounded across long-lived
// keep-alive connections.
//
// Cursor invariant:
//   0 <= start_of_request <= body_start <= read_cursor <= len <= capacity
pub struct ReadBuffer {
    buf: Vec<u8>,
    end: usize,
    start_of_request: usize,
    read_cursor: usize,
    body_start: usize,
    body_len: usize,
    max_size: usize,
}

impl ReadBuffer {
    pub fn new(size: usize, max_size: usize) -> Self {
        assert!(size > 0 && size <= max_size);

        Self {
            buf: vec![0; size],
            end: 0,
            start_of_request: 0,
            read_cursor: 0,
            body_start: 0,
            body_len: 0,
            max_size,
        }
    }

    fn check_cursors(&self) {
        debug_assert!(self.start_of_request <= self.body_start);
        debug_assert!(self.body_start <= self.read_cursor);
        debug_assert!(self.read_cursor <= self.end);
        debug_assert!(self.end <= self.buf.len());
    }

    pub fn len(&self) -> usize {
        self.end
    }

    pub fn is_empty(&self) -> bool {
        self.end == 0
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn filled(&self) -> &[u8] {
        &self.buf[..self.end]
    }

    pub fn start_of_request(&self) -> usize {
        self.start_of_request
    }

    pub fn read_cursor(&self) -> usize {
        self.read_cursor
    }

    pub fn body_start(&self) -> usize {
        self.body_start
    }

    pub fn body_len(&self) -> usize {
        self.body_len
    }

    pub fn write_avail(&self) -> usize {
        self.buf.len() - self.end
    }

    // grow geometrically until the hard cap. returns false when the
    // buffer is full and cannot grow further
    pub fn ensure_write_avail(&mut self) -> bool {
        if self.write_avail() > 0 {
            return true;
        }

        if self.buf.len() >= self.max_size {
            return false;
        }

        let size = std::cmp::min(self.buf.len() * 2, self.max_size);
        self.buf.resize(size, 0);

        true
    }

    pub fn write_buf(&mut self) -> &mut [u8] {
        let len = self.buf.len();

        &mut self.buf[self.end..len]
    }

    pub fn write_commit(&mut self, amount: usize) {
        assert!(self.end + amount <= self.buf.len());

        self.end += amount;
    }

    pub fn write_from(&mut self, r: &mut dyn Read) -> Result<usize, io::Error> {
        let size = r.read(self.write_buf())?;

        self.write_commit(size);

        Ok(size)
    }

    pub fn set_read_cursor(&mut self, pos: usize) {
        assert!(pos >= self.read_cursor && pos <= self.end);

        self.read_cursor = pos;

        self.check_cursors();
    }

    pub fn set_body(&mut self, start: usize, len: usize) {
        assert!(start >= self.start_of_request && start <= self.end);

        self.body_start = start;
        self.body_len = len;
    }

    pub fn slice(&self, offset: usize, len: usize) -> &[u8] {
        &self.buf[offset..(offset + len)]
    }

    // copy a region out so it can outlive the buffer (and any
    // compaction of it)
    pub fn detach(&self, offset: usize, len: usize) -> Vec<u8> {
        self.slice(offset, len).to_vec()
    }

    // the current request has been fully handled. the next request, if
    // any, begins at the read cursor
    pub fn consume_request(&mut self) {
        self.start_of_request = self.read_cursor;
        self.body_start = self.read_cursor;
        self.body_len = 0;

        // nothing buffered beyond this request: rewind for free
        if self.start_of_request == self.end {
            self.start_of_request = 0;
            self.read_cursor = 0;
            self.body_start = 0;
            self.end = 0;
        }

        self.check_cursors();
    }

    // shift [start_of_request, end) down to offset 0 and rebase all
    // cursors. returns the shift amount
    pub fn compact(&mut self) -> usize {
        let shift = self.start_of_request;

        if shift == 0 {
            return 0;
        }

        self.buf.copy_within(self.start_of_request..self.end, 0);

        self.start_of_request = 0;
        self.read_cursor -= shift;
        self.body_start -= shift;
        self.end -= shift;

        self.check_cursors();

        shift
    }
}
