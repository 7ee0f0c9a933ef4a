use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use log::debug;
use parking_lot::Mutex;

use crate::cache::Cache;
use crate::engine::Engine;
use crate::index::{Index, OpStatus};
use crate::kv::CompactString;
use crate::page::MAX_CHUNK;
use crate::pointer::PolymorphicPointer;
use crate::wal::LogOp;
use crate::{StoreError, WorkerId};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum RpcOp {
    Insert = 0,
    Search = 1,
    Update = 2,
    Range = 3,
    CallForMemory = 4,
}

impl RpcOp {
    fn from_byte(byte: u8) -> Result<Self, StoreError> {
        Ok(match byte {
            0 => RpcOp::Insert,
            1 => RpcOp::Search,
            2 => RpcOp::Update,
            3 => RpcOp::Range,
            4 => RpcOp::CallForMemory,
            _ => return Err(StoreError::Wire("unknown op code")),
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum RpcStatus {
    Ok = 0,
    NoMemory = 1,
    Failed = 2,
}

impl RpcStatus {
    fn from_byte(byte: u8) -> Result<Self, StoreError> {
        Ok(match byte {
            0 => RpcStatus::Ok,
            1 => RpcStatus::NoMemory,
            2 => RpcStatus::Failed,
            _ => return Err(StoreError::Wire("unknown status code")),
        })
    }
}

/*
 * Request layout: one op byte, then CompactString-framed arguments.
 *
 *   Insert | key | value          Update | key | new value
 *   Search | key                  Range  | start | end
 *   CallForMemory
 */
#[derive(Debug, PartialEq, Eq)]
pub enum Request<'a> {
    Insert { key: &'a [u8], value: &'a [u8] },
    Search { key: &'a [u8] },
    Update { key: &'a [u8], value: &'a [u8] },
    Range { start: &'a [u8], end: &'a [u8] },
    CallForMemory,
}

impl<'a> Request<'a> {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Request::Insert { key, value } => {
                buf.push(RpcOp::Insert as u8);
                CompactString::encode_into(&mut buf, key);
                CompactString::encode_into(&mut buf, value);
            }
            Request::Search { key } => {
                buf.push(RpcOp::Search as u8);
                CompactString::encode_into(&mut buf, key);
            }
            Request::Update { key, value } => {
                buf.push(RpcOp::Update as u8);
                CompactString::encode_into(&mut buf, key);
                CompactString::encode_into(&mut buf, value);
            }
            Request::Range { start, end } => {
                buf.push(RpcOp::Range as u8);
                CompactString::encode_into(&mut buf, start);
                CompactString::encode_into(&mut buf, end);
            }
            Request::CallForMemory => buf.push(RpcOp::CallForMemory as u8),
        }
        buf
    }

    pub fn parse(buf: &'a [u8]) -> Result<Self, StoreError> {
        let (&op, rest) = buf
            .split_first()
            .ok_or(StoreError::Wire("empty request"))?;
        Ok(match RpcOp::from_byte(op)? {
            RpcOp::Insert => {
                let (key, rest) = CompactString::decode(rest)?;
                let (value, _) = CompactString::decode(rest)?;
                Request::Insert { key, value }
            }
            RpcOp::Search => {
                let (key, _) = CompactString::decode(rest)?;
                Request::Search { key }
            }
            RpcOp::Update => {
                let (key, rest) = CompactString::decode(rest)?;
                let (value, _) = CompactString::decode(rest)?;
                Request::Update { key, value }
            }
            RpcOp::Range => {
                let (start, rest) = CompactString::decode(rest)?;
                let (end, _) = CompactString::decode(rest)?;
                Request::Range { start, end }
            }
            RpcOp::CallForMemory => Request::CallForMemory,
        })
    }
}

/// Response layouts, little-endian after the status byte:
/// plain status; Search adds `size` and the value handle (0 size means
/// miss); Range adds a count and (size, handle) pairs; CallForMemory
/// adds the granted address and length.
#[derive(Debug, PartialEq, Eq)]
pub enum Response {
    Status(RpcStatus),
    Search {
        status: RpcStatus,
        size: u64,
        handle: PolymorphicPointer,
    },
    Range {
        status: RpcStatus,
        items: Vec<(u64, PolymorphicPointer)>,
    },
    Memory {
        status: RpcStatus,
        addr: u64,
        size: u64,
    },
}

impl Response {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        let mut word = [0u8; 8];
        match self {
            Response::Status(status) => buf.push(*status as u8),
            Response::Search {
                status,
                size,
                handle,
            } => {
                buf.push(*status as u8);
                LittleEndian::write_u64(&mut word, *size);
                buf.extend_from_slice(&word);
                LittleEndian::write_u64(&mut word, handle.raw());
                buf.extend_from_slice(&word);
            }
            Response::Range { status, items } => {
                buf.push(*status as u8);
                LittleEndian::write_u64(&mut word, items.len() as u64);
                buf.extend_from_slice(&word);
                for (size, handle) in items {
                    LittleEndian::write_u64(&mut word, *size);
                    buf.extend_from_slice(&word);
                    LittleEndian::write_u64(&mut word, handle.raw());
                    buf.extend_from_slice(&word);
                }
            }
            Response::Memory { status, addr, size } => {
                buf.push(*status as u8);
                LittleEndian::write_u64(&mut word, *addr);
                buf.extend_from_slice(&word);
                LittleEndian::write_u64(&mut word, *size);
                buf.extend_from_slice(&word);
            }
        }
        buf
    }

    /// Decode a response; the caller knows which op it sent.
    pub fn parse(op: RpcOp, buf: &[u8]) -> Result<Self, StoreError> {
        let (&status, rest) = buf
            .split_first()
            .ok_or(StoreError::Wire("empty response"))?;
        let status = RpcStatus::from_byte(status)?;
        Ok(match op {
            RpcOp::Search => Response::Search {
                status,
                size: read_u64(rest, 0)?,
                handle: PolymorphicPointer::from_raw(read_u64(rest, 8)?),
            },
            RpcOp::Range => {
                let count = read_u64(rest, 0)? as usize;
                let mut items = Vec::with_capacity(count);
                for i in 0..count {
                    items.push((
                        read_u64(rest, 8 + i * 16)?,
                        PolymorphicPointer::from_raw(read_u64(rest, 16 + i * 16)?),
                    ));
                }
                Response::Range { status, items }
            }
            RpcOp::CallForMemory => Response::Memory {
                status,
                addr: read_u64(rest, 0)?,
                size: read_u64(rest, 8)?,
            },
            _ => Response::Status(status),
        })
    }
}

fn read_u64(buf: &[u8], offset: usize) -> Result<u64, StoreError> {
    buf.get(offset..offset + 8)
        .map(LittleEndian::read_u64)
        .ok_or(StoreError::Wire("truncated response"))
}

/// Per-server store: the engine, the index over its PM, and the DRAM
/// read cache. Request handlers parse the wire form, call the index and
/// answer in bytes; the transports that carry them live outside.
///
/// Mutations serialize behind one writer mutex (this node owns a single
/// static range); reads go through the lock-free index.
pub struct StoreServer {
    engine: Arc<Engine>,
    index: Index,
    cache: Mutex<Cache>,
    writer: Mutex<()>,
}

impl StoreServer {
    /// Bootstrap a fresh index, or rebuild it from the persisted leaf
    /// chain when the engine recovered existing state.
    pub fn make(engine: Arc<Engine>, cache_capacity: usize) -> Result<Self, StoreError> {
        let index = if engine.root_leaf() == 0 {
            let index = Index::bootstrap(engine.allocator().clone(), engine.logger().clone())?;
            engine.set_root_leaf(index.first_leaf());
            index
        } else {
            unsafe {
                Index::recover(
                    engine.allocator().clone(),
                    engine.logger().clone(),
                    engine.root_leaf(),
                )?
            }
        };
        Ok(Self {
            engine,
            index,
            cache: Mutex::new(Cache::new(cache_capacity)),
            writer: Mutex::new(()),
        })
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn index(&self) -> &Index {
        &self.index
    }

    pub fn register_worker(&self) -> Result<WorkerId, StoreError> {
        self.engine.register_worker()
    }

    pub fn unregister_worker(&self, worker: WorkerId) {
        self.engine.unregister_worker(worker);
    }

    /// Route value placement through the engine's remote-memory agent
    /// once local PM runs out.
    pub fn enable_agent(&self) {
        self.index.enable_agent(self.engine.agent().clone());
    }

    /// Execute one wire-framed request on behalf of `worker` and return
    /// the wire-framed response.
    pub fn dispatch(&self, worker: WorkerId, request: &[u8]) -> Vec<u8> {
        let response = match Request::parse(request) {
            Ok(Request::Insert { key, value }) => self.handle_insert(worker, key, value),
            Ok(Request::Search { key }) => self.handle_search(key),
            Ok(Request::Update { key, value }) => self.handle_update(worker, key, value),
            Ok(Request::Range { start, end }) => self.handle_range(start, end),
            Ok(Request::CallForMemory) => self.handle_memory(worker),
            Err(_) => Response::Status(RpcStatus::Failed),
        };
        response.encode()
    }

    fn handle_insert(&self, worker: WorkerId, key: &[u8], value: &[u8]) -> Response {
        let _g = self.writer.lock();
        let (status, handle) = self.index.insert(worker, key, value);
        match status {
            OpStatus::Ok => {
                let size = CompactString::chunk_size(value.len()) as u64;
                self.cache.lock().insert(key, handle, size);
                Response::Status(RpcStatus::Ok)
            }
            OpStatus::NoMemory => Response::Status(RpcStatus::NoMemory),
            _ => Response::Status(RpcStatus::Failed),
        }
    }

    fn handle_search(&self, key: &[u8]) -> Response {
        if let Some((handle, size)) = self.cache.lock().get(key) {
            return Response::Search {
                status: RpcStatus::Ok,
                size,
                handle,
            };
        }
        let (handle, size) = self.index.search(key);
        if !handle.is_null() {
            self.cache.lock().insert(key, handle, size);
        }
        Response::Search {
            status: RpcStatus::Ok,
            size,
            handle,
        }
    }

    fn handle_update(&self, worker: WorkerId, key: &[u8], value: &[u8]) -> Response {
        let _g = self.writer.lock();
        let (status, handle) = self.index.update(worker, key, value);
        match status {
            OpStatus::Ok => {
                let size = CompactString::chunk_size(value.len()) as u64;
                self.cache.lock().insert(key, handle, size);
                Response::Status(RpcStatus::Ok)
            }
            OpStatus::NoMemory => Response::Status(RpcStatus::NoMemory),
            _ => Response::Status(RpcStatus::Failed),
        }
    }

    fn handle_range(&self, start: &[u8], end: &[u8]) -> Response {
        let items = self
            .index
            .scan_range(start, end)
            .into_iter()
            .map(|(handle, size)| (size, handle))
            .collect();
        Response::Range {
            status: RpcStatus::Ok,
            items,
        }
    }

    /// Grant a peer one chunk of local PM to use as a remote region.
    /// The grant is logged and checkpointed so it survives a crash; it
    /// is reclaimed only when the peer restarts and lets it go.
    fn handle_memory(&self, worker: WorkerId) -> Response {
        let _g = self.writer.lock();
        let slot = self.engine.logger().make_log(worker, LogOp::Insert);
        if self
            .engine
            .allocator()
            .allocate(worker, MAX_CHUNK, &slot)
            .is_err()
        {
            self.engine.logger().commit(worker);
            return Response::Memory {
                status: RpcStatus::NoMemory,
                addr: 0,
                size: 0,
            };
        }
        self.engine.logger().checkpoint(worker);
        let addr = slot.get().raw();
        debug!("granted {} bytes of PM at {:#x}", MAX_CHUNK, addr);
        Response::Memory {
            status: RpcStatus::Ok,
            addr,
            size: MAX_CHUNK as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_codec_round_trip() {
        let cases = vec![
            Request::Insert {
                key: b"k",
                value: b"v",
            },
            Request::Search { key: b"needle" },
            Request::Update {
                key: b"k",
                value: b"v2",
            },
            Request::Range {
                start: b"a",
                end: b"z",
            },
            Request::CallForMemory,
        ];
        for request in cases {
            let wire = request.encode();
            assert_eq!(Request::parse(&wire).unwrap(), request);
        }
        assert!(Request::parse(&[]).is_err());
        assert!(Request::parse(&[9]).is_err());
    }

    #[test]
    fn response_codec_round_trip() {
        let search = Response::Search {
            status: RpcStatus::Ok,
            size: 7,
            handle: PolymorphicPointer::make_remote(3, 0x40),
        };
        let wire = search.encode();
        assert_eq!(wire.len(), 17);
        assert_eq!(Response::parse(RpcOp::Search, &wire).unwrap(), search);

        let range = Response::Range {
            status: RpcStatus::Ok,
            items: vec![
                (3, PolymorphicPointer::make_local(0x1000)),
                (5, PolymorphicPointer::make_local(0x2000)),
            ],
        };
        assert_eq!(
            Response::parse(RpcOp::Range, &range.encode()).unwrap(),
            range
        );

        let status = Response::Status(RpcStatus::NoMemory);
        assert_eq!(
            Response::parse(RpcOp::Insert, &status.encode()).unwrap(),
            status
        );
    }
}
