// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

//! Pool of pre-allocated request and response wire buffers.

use parking_lot::Mutex;
use serde::Serialize;

use crate::dal::RsBuffer;

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct MemoryStats {
    #[serde(rename = "allocationsCount")]
    pub allocations_count: i64,
    #[serde(rename = "deallocationsCount")]
    pub deallocations_count: i64,
    #[serde(rename = "buffersCount")]
    pub buffers_count: i64,
    #[serde(rename = "freeBuffers")]
    pub free_buffers: i64,
}

struct Side {
    buffers: Vec<RsBuffer>,
    stats: MemoryStats,
}

impl Side {
    fn new(buffer_size: usize, pre_allocated: usize) -> Self {
        let buffers = (0..pre_allocated)
            .map(|_| RsBuffer::with_capacity(buffer_size))
            .collect::<Vec<_>>();
        Side {
            buffers,
            stats: MemoryStats {
                allocations_count: pre_allocated as i64,
                deallocations_count: 0,
                buffers_count: pre_allocated as i64,
                free_buffers: 0,
            },
        }
    }

    fn get(&mut self, buffer_size: usize) -> RsBuffer {
        if let Some(buffer) = self.buffers.pop() {
            return buffer;
        }
        self.stats.buffers_count += 1;
        self.stats.allocations_count += 1;
        RsBuffer::with_capacity(buffer_size)
    }

    fn put(&mut self, mut buffer: RsBuffer) {
        buffer.clear();
        self.buffers.push(buffer);
    }

    fn stats(&mut self) -> MemoryStats {
        self.stats.free_buffers = self.buffers.len() as i64;
        self.stats
    }
}

/// Two-sided buffer pool. Each `get_*` hands out a pre-allocated buffer if
/// any remain, otherwise allocates fresh and counts it. The pool mutexes are
/// leaf locks.
pub struct BufferPool {
    req_buffer_size: usize,
    resp_buffer_size: usize,
    req: Mutex<Side>,
    resp: Mutex<Side>,
}

impl BufferPool {
    pub fn new(req_buffer_size: usize, resp_buffer_size: usize, pre_allocated: usize) -> Self {
        BufferPool {
            req_buffer_size,
            resp_buffer_size,
            req: Mutex::new(Side::new(req_buffer_size, pre_allocated)),
            resp: Mutex::new(Side::new(resp_buffer_size, pre_allocated)),
        }
    }

    pub fn get_req_buffer(&self) -> RsBuffer {
        self.req.lock().get(self.req_buffer_size)
    }

    pub fn get_resp_buffer(&self) -> RsBuffer {
        self.resp.lock().get(self.resp_buffer_size)
    }

    pub fn return_req_buffer(&self, buffer: RsBuffer) {
        self.req.lock().put(buffer);
    }

    pub fn return_resp_buffer(&self, buffer: RsBuffer) {
        self.resp.lock().put(buffer);
    }

    pub fn req_stats(&self) -> MemoryStats {
        self.req.lock().stats()
    }

    pub fn resp_stats(&self) -> MemoryStats {
        self.resp.lock().stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_reuses_preallocated_buffers() {
        let pool = BufferPool::new(1024, 2048, 2);
        let a = pool.get_req_buffer();
        let b = pool.get_req_buffer();
        assert_eq!(a.capacity(), 1024);
        assert_eq!(b.capacity(), 1024);
        let stats = pool.req_stats();
        assert_eq!(stats.allocations_count, 2);
        assert_eq!(stats.free_buffers, 0);

        pool.return_req_buffer(a);
        pool.return_req_buffer(b);
        let stats = pool.req_stats();
        assert_eq!(stats.free_buffers, 2);
    }

    #[test]
    fn pool_allocates_fresh_when_exhausted() {
        let pool = BufferPool::new(256, 256, 1);
        let _a = pool.get_resp_buffer();
        let _b = pool.get_resp_buffer();
        let stats = pool.resp_stats();
        assert_eq!(stats.allocations_count, 2);
        assert_eq!(stats.buffers_count, 2);
    }
}
