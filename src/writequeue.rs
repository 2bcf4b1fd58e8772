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

use crate::stats::RequestStatistics;
use std::collections::VecDeque;
use std::io;
use std::io::Write;
use std::time::Instant;

struct Entry {
    buf: Vec<u8>,
    stats: Option<RequestStatistics>,
}

// Ordered outgoing buffers with a byte offset into the head buffer.
// Drained opportunistically; a buffer's statistics handle is released
// when its last byte has been accepted by the socket.
pub struct WriteQueue {
    entries: VecDeque<Entry>,
    offset: usize,
    remaining: usize,
}

impl WriteQueue {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
            offset: 0,
            remaining: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    // unsent bytes across all buffers
    pub fn remaining(&self) -> usize {
        self.remaining
    }

    pub fn push(&mut self, buf: Vec<u8>, stats: Option<RequestStatistics>) {
        if buf.is_empty() {
            // nothing to drain; settle the handle now
            if let Some(stats) = stats {
                stats.finish_written(Instant::now());
            }

            return;
        }

        self.remaining += buf.len();
        self.entries.push_back(Entry { buf, stats });
    }

    // write as much as the sink accepts. WouldBlock stops the drain
    // without error; the offset keeps the position for next time
    pub fn write_to<W: Write>(&mut self, writer: &mut W, now: Instant) -> Result<usize, io::Error> {
        let mut total = 0;

        while let Some(entry) = self.entries.front() {
            let size = match writer.write(&entry.buf[self.offset..]) {
                Ok(0) => break,
                Ok(size) => size,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };

            self.offset += size;
            self.remaining -= size;
            total += size;

            if self.offset < entry.buf.len() {
                // partial write; try again later
                break;
            }

            let entry = self.entries.pop_front().unwrap();
            self.offset = 0;

            if let Some(stats) = entry.stats {
                stats.finish_written(now);
            }
        }

        Ok(total)
    }

    // drop everything unsent, statistics handles included
    pub fn clear(&mut self) {
        self.entries.clear();
        self.offset = 0;
        self.remaining = 0;
    }
}
