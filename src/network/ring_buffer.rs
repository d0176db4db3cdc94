// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Two-region ring buffer used for the per-connection read and write sides.
//!
//! Region A is the primary region and holds the oldest bytes. When A's tail
//! runs out of room, region B is opened at offset 0, in the gap left in front
//! of A by earlier reads. Writers append to B until A drains; at that point B
//! is promoted to A. Bytes never move except on that promotion, and only when
//! B's own front was partially consumed in the same call.
//!
//! ```text
//!  0        b_start+b_len     a_start            a_start+a_len    capacity
//!  |--- B ---|.....free.......|------- A --------|......free.......|
//! ```

use std::cmp;

#[derive(Debug, Default)]
pub struct RingBuffer {
    buffer: Vec<u8>,
    a_start: usize,
    a_len: usize,
    b_start: usize,
    b_len: usize,
    b_active: bool,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        let mut ring = RingBuffer::default();
        ring.allocate(capacity);
        ring
    }

    /// (Re)initializes the storage. Any buffered bytes are discarded.
    pub fn allocate(&mut self, capacity: usize) {
        self.buffer = vec![0; capacity];
        self.clear();
    }

    /// Drops the storage entirely. The buffer reports a capacity of zero
    /// afterwards and rejects every non-empty write.
    pub fn release(&mut self) {
        self.buffer = Vec::new();
        self.clear();
    }

    pub fn clear(&mut self) {
        self.a_start = 0;
        self.a_len = 0;
        self.b_start = 0;
        self.b_len = 0;
        self.b_active = false;
    }

    /// Appends all of `data` or nothing.
    ///
    /// Goes to B when B is open, otherwise to A's tail when it fits there,
    /// otherwise opens B in front of A. When the free space is there but split
    /// between both sides of A, the contents are compacted to the front first.
    /// Returns false, leaving the buffer untouched, only when the total free
    /// space is smaller than `data`.
    pub fn write(&mut self, data: &[u8]) -> bool {
        let len = data.len();
        if len == 0 {
            return true;
        }
        if self.free_space() < len {
            return false;
        }

        if self.b_active {
            if self.b_free_space() >= len {
                let end = self.b_start + self.b_len;
                self.buffer[end..end + len].copy_from_slice(data);
                self.b_len += len;
                return true;
            }
        } else if self.a_free_space() >= len {
            self.append_a(data);
            return true;
        } else if self.space_before_a() >= len {
            self.b_active = true;
            self.b_start = 0;
            self.buffer[..len].copy_from_slice(data);
            self.b_len = len;
            return true;
        }

        self.compact();
        self.append_a(data);
        true
    }

    fn append_a(&mut self, data: &[u8]) {
        let end = self.a_start + self.a_len;
        self.buffer[end..end + data.len()].copy_from_slice(data);
        self.a_len += data.len();
    }

    /// Copies exactly `dest.len()` bytes out of the buffer and consumes them.
    pub fn read(&mut self, dest: &mut [u8]) -> bool {
        if !self.peek(dest) {
            return false;
        }
        self.consume(dest.len());
        true
    }

    /// Same as [`RingBuffer::read`] but leaves the bytes in place.
    pub fn peek(&self, dest: &mut [u8]) -> bool {
        let len = dest.len();
        if self.size() < len {
            return false;
        }

        let from_a = cmp::min(len, self.a_len);
        dest[..from_a].copy_from_slice(&self.buffer[self.a_start..self.a_start + from_a]);

        let from_b = len - from_a;
        if from_b > 0 {
            dest[from_a..].copy_from_slice(&self.buffer[self.b_start..self.b_start + from_b]);
        }
        true
    }

    /// Discards `len` bytes from the front without copying them out.
    pub fn remove(&mut self, len: usize) -> bool {
        if self.size() < len {
            return false;
        }
        self.consume(len);
        true
    }

    fn consume(&mut self, len: usize) {
        let from_a = cmp::min(len, self.a_len);
        self.a_start += from_a;
        self.a_len -= from_a;

        let from_b = len - from_a;
        if from_b > 0 {
            self.b_start += from_b;
            self.b_len -= from_b;
        }

        if self.a_len == 0 {
            if self.b_active && self.b_len > 0 {
                if self.b_start != 0 {
                    self.buffer
                        .copy_within(self.b_start..self.b_start + self.b_len, 0);
                }
                self.a_start = 0;
                self.a_len = self.b_len;
            } else {
                self.a_start = 0;
                self.a_len = 0;
            }
            self.b_active = false;
            self.b_start = 0;
            self.b_len = 0;
        }
    }

    /// Moves every buffered byte into one run at offset 0.
    pub fn compact(&mut self) {
        if self.a_start == 0 && !self.b_active {
            return;
        }
        let mut linear = vec![0; self.buffer.len()];
        let size = self.size();
        self.peek(&mut linear[..size]);
        self.buffer = linear;
        self.clear();
        self.a_len = size;
    }

    /// Reallocates to `new_capacity` and copies the buffered bytes over, in
    /// order, to the front of the new storage. Shrinking is refused.
    pub fn grow(&mut self, new_capacity: usize) -> bool {
        if new_capacity <= self.buffer.len() {
            return false;
        }
        let size = self.size();
        let mut grown = vec![0; new_capacity];
        self.peek(&mut grown[..size]);
        self.buffer = grown;
        self.clear();
        self.a_len = size;
        true
    }

    /// Bytes that can be handed to a transmit call in one piece.
    pub fn contiguous_readable_bytes(&self) -> usize {
        self.a_len
    }

    pub fn readable_slice(&self) -> &[u8] {
        &self.buffer[self.a_start..self.a_start + self.a_len]
    }

    /// Largest single write that is guaranteed to be accepted next, filling A's
    /// tail before B is opened.
    pub fn writable_len(&self) -> usize {
        if self.b_active {
            self.b_free_space()
        } else if self.a_free_space() > 0 {
            self.a_free_space()
        } else {
            self.space_before_a()
        }
    }

    /// Total unused bytes, regardless of how they are split between regions.
    pub fn free_space(&self) -> usize {
        self.buffer.len() - self.size()
    }

    pub fn size(&self) -> usize {
        self.a_len + self.b_len
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    fn a_free_space(&self) -> usize {
        self.buffer.len() - self.a_start - self.a_len
    }

    fn b_free_space(&self) -> usize {
        self.a_start - self.b_start - self.b_len
    }

    fn space_before_a(&self) -> usize {
        self.a_start
    }
}
