// Copyright 2022 Ryan Seipp
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

//! Bounded session buffers

/// Hard cap on any single per-direction buffer. A socket whose buffer would
/// grow past this on append is torn down rather than throttled.
pub const MAX_BUFFER: usize = 1024 * 1024;

/// A contiguous byte queue with a read offset.
///
/// Consumed bytes are reclaimed by compaction once the dead prefix outgrows
/// the live region, so steady-state streaming does not reallocate.
#[derive(Debug, Default)]
pub struct StreamBuf {
    data: Vec<u8>,
    start: usize,
}

impl StreamBuf {
    /// Creates an empty buffer.
    pub fn new() -> Self {
        Self {
            data: Vec::new(),
            start: 0,
        }
    }

    /// Number of unconsumed bytes.
    pub fn len(&self) -> usize {
        self.data.len() - self.start
    }

    /// True when no unconsumed bytes remain.
    pub fn is_empty(&self) -> bool {
        self.start == self.data.len()
    }

    /// The unconsumed region.
    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.start..]
    }

    /// Appends `bytes` unless the buffer would exceed `cap`.
    ///
    /// Returns false without appending anything when the cap would be
    /// breached; the caller decides what dies.
    pub fn extend_capped(&mut self, bytes: &[u8], cap: usize) -> bool {
        if self.len() + bytes.len() > cap {
            return false;
        }
        self.compact_if_needed();
        self.data.extend_from_slice(bytes);
        true
    }

    /// Marks `n` bytes as consumed.
    ///
    /// # Panics
    /// Panics if `n` exceeds the unconsumed length.
    pub fn consume(&mut self, n: usize) {
        assert!(n <= self.len(), "consumed past end of buffer");
        self.start += n;
        self.compact_if_needed();
    }

    /// Removes and returns all unconsumed bytes.
    pub fn take_all(&mut self) -> Vec<u8> {
        let out = self.data.split_off(self.start);
        self.data.clear();
        self.start = 0;
        out
    }

    /// Drops all content.
    pub fn clear(&mut self) {
        self.data.clear();
        self.start = 0;
    }

    fn compact_if_needed(&mut self) {
        if self.start == self.data.len() {
            self.data.clear();
            self.start = 0;
        } else if self.start > 4096 && self.start > self.data.len() / 2 {
            self.data.drain(..self.start);
            self.start = 0;
        }
    }
}
