// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! CylonRequest for network communication

use super::CYLON_MAX_USER_HEADER;

/// A buffer addressed to one worker, with an optional short header
#[derive(Debug, Clone)]
pub struct CylonRequest {
    pub buffer: Vec<u8>,
    pub target: i32,
    pub header: [i32; CYLON_MAX_USER_HEADER],
    pub header_length: usize,
}

impl CylonRequest {
    /// Create a new request with buffer and target
    pub fn new(target: i32, buffer: Vec<u8>) -> Self {
        Self {
            buffer,
            target,
            header: [0; CYLON_MAX_USER_HEADER],
            header_length: 0,
        }
    }

    /// Create a new request with buffer, target, and header.
    /// Header words beyond the sixth are dropped.
    pub fn new_with_header(target: i32, buffer: Vec<u8>, header: &[i32]) -> Self {
        let mut req = Self::new(target, buffer);
        let len = header.len().min(CYLON_MAX_USER_HEADER);
        req.header[..len].copy_from_slice(&header[..len]);
        req.header_length = len;
        req
    }

    /// Create a finish request (empty buffer)
    pub fn new_finish(target: i32) -> Self {
        Self::new(target, Vec::new())
    }

    /// The caller supplied header words
    pub fn header(&self) -> &[i32] {
        &self.header[..self.header_length]
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_is_truncated() {
        let req = CylonRequest::new_with_header(1, vec![1, 2, 3], &[9, 8, 7, 6, 5, 4, 3]);
        assert_eq!(req.header(), &[9, 8, 7, 6, 5, 4]);
        assert_eq!(req.len(), 3);

        let fin = CylonRequest::new_finish(2);
        assert!(fin.is_empty());
        assert!(fin.header().is_empty());
    }
}
