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

//! Buffer implementations for network communication

use super::Buffer;

/// Simple vector-backed buffer
#[derive(Debug, Clone, Default)]
pub struct VecBuffer {
    data: Vec<u8>,
}

impl VecBuffer {
    pub fn with_data(data: Vec<u8>) -> Self {
        Self { data }
    }
}

impl Buffer for VecBuffer {
    fn data(&self) -> &[u8] {
        &self.data
    }

    fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    fn len(&self) -> usize {
        self.data.len()
    }
}
