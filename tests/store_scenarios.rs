use std::sync::Arc;
use std::time::Duration;

use ridge::cache::Cache;
use ridge::engine::Engine;
use ridge::index::{NodeRef, OpStatus, DEGREE};
use ridge::kv::CompactString;
use ridge::page::MAX_CHUNK;
use ridge::pmem::PmRegion;
use ridge::pointer::{PolymorphicPointer, RemotePointer};
use ridge::remote::{agent_area_size, LoopbackChannel};
use ridge::store::{Request, Response, RpcOp, RpcStatus, StoreServer};
use ridge::wal::log_area_size;
use ridge::PAGE_SIZE;

fn fresh_store(pages: usize) -> (Arc<Engine>, StoreServer) {
    let size = log_area_size() + agent_area_size() + pages * PAGE_SIZE;
    let region = PmRegion::open_anon(size).unwrap();
    let engine = Arc::new(Engine::with_region(region, 1).unwrap());
    let store = StoreServer::make(engine.clone(), 128).unwrap();
    (engine, store)
}

/// The handle a local insert returns points straight at the stored blob.
unsafe fn deref(handle: PolymorphicPointer) -> &'static [u8] {
    assert!(handle.is_local());
    CompactString::from_addr(handle.raw()).as_bytes()
}

#[test]
fn insert_then_search_returns_stored_bytes() {
    let (_engine, store) = fresh_store(4096);
    let worker = store.register_worker().unwrap();

    let keys: Vec<String> = (0..10).map(|i| format!("1000000000000000000{i}")).collect();
    for key in &keys {
        let (status, handle) = store.index().insert(worker, key.as_bytes(), key.as_bytes());
        assert_eq!(status, OpStatus::Ok);
        assert!(!handle.is_null());
    }
    for key in &keys {
        let (handle, size) = store.index().search(key.as_bytes());
        assert!(!handle.is_null());
        assert_eq!(size as usize, CompactString::chunk_size(key.len()));
        assert_eq!(unsafe { deref(handle) }, key.as_bytes());
    }

    // a key that was never inserted stays unfindable
    let (handle, size) = store.index().search(b"10000000000000000099");
    assert!(handle.is_null());
    assert_eq!(size, 0);
}

#[test]
fn split_sequence_keeps_order() {
    let (_engine, store) = fresh_store(2048);
    let worker = store.register_worker().unwrap();

    for key in ["a", "c", "e", "b", "d"] {
        let (status, _) = store.index().insert(worker, key.as_bytes(), key.as_bytes());
        assert_eq!(status, OpStatus::Ok, "inserting {key}");
    }

    if DEGREE == 3 {
        assert_eq!(store.index().leaf_splits(), 2);
        assert!(matches!(store.index().root(), NodeRef::Inner(_)));
    }

    let handles = store.index().scan(b"a", 5);
    let got: Vec<Vec<u8>> = handles
        .iter()
        .map(|h| unsafe { deref(*h) }.to_vec())
        .collect();
    assert_eq!(got, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec(), b"e".to_vec()]);

    // scans honor the requested bound
    assert_eq!(store.index().scan(b"b", 2).len(), 2);
    assert_eq!(store.index().scan(b"f", 5).len(), 0);
}

#[test]
fn repeat_insert_keeps_first_value() {
    let (_engine, store) = fresh_store(1024);
    let worker = store.register_worker().unwrap();

    let (status, _) = store.index().insert(worker, b"k", b"v1");
    assert_eq!(status, OpStatus::Ok);
    let (status, handle) = store.index().insert(worker, b"k", b"v2");
    assert_eq!(status, OpStatus::RepeatInsert);
    assert!(handle.is_null());

    let (handle, _) = store.index().search(b"k");
    assert_eq!(unsafe { deref(handle) }, b"v1");
}

#[test]
fn scan_is_ordered_regardless_of_insert_order() {
    let (_engine, store) = fresh_store(4096);
    let worker = store.register_worker().unwrap();

    // deliberately unordered
    let mut keys: Vec<String> = (0..40).map(|i| format!("key-{i:02}")).collect();
    for chunk in keys.chunks(5).rev() {
        for key in chunk.iter().rev() {
            let (status, _) = store.index().insert(worker, key.as_bytes(), key.as_bytes());
            assert_eq!(status, OpStatus::Ok);
        }
    }

    let handles = store.index().scan(b"key-", 100);
    keys.sort();
    let got: Vec<Vec<u8>> = handles
        .iter()
        .map(|h| unsafe { deref(*h) }.to_vec())
        .collect();
    let expect: Vec<Vec<u8>> = keys.iter().map(|k| k.as_bytes().to_vec()).collect();
    assert_eq!(got, expect);
}

#[test]
fn update_in_place_and_reallocating() {
    let (_engine, store) = fresh_store(2048);
    let worker = store.register_worker().unwrap();

    let (status, first) = store.index().insert(worker, b"k", b"longvalue");
    assert_eq!(status, OpStatus::Ok);

    // shrinking update rewrites the chunk in place
    let (status, handle) = store.index().update(worker, b"k", b"short");
    assert_eq!(status, OpStatus::Ok);
    assert_eq!(handle, first);
    assert_eq!(unsafe { deref(handle) }, b"short");

    // a longer value needs a fresh chunk
    let (status, handle) = store.index().update(worker, b"k", b"a considerably longer value");
    assert_eq!(status, OpStatus::Ok);
    assert_ne!(handle, first);
    assert_eq!(unsafe { deref(handle) }, b"a considerably longer value");

    // updating an absent key fails without side effects
    let (status, _) = store.index().update(worker, b"missing", b"x");
    assert_eq!(status, OpStatus::Failed);
}

#[test]
fn remove_frees_and_unlinks() {
    let (_engine, store) = fresh_store(2048);
    let worker = store.register_worker().unwrap();

    for key in ["r1", "r2", "r3"] {
        store.index().insert(worker, key.as_bytes(), key.as_bytes());
    }
    assert_eq!(store.index().remove(worker, b"r2"), OpStatus::Ok);
    assert!(store.index().search(b"r2").0.is_null());
    assert_eq!(store.index().remove(worker, b"r2"), OpStatus::Failed);

    // neighbors are untouched and order is preserved
    let handles = store.index().scan(b"r", 10);
    assert_eq!(handles.len(), 2);
    assert!(store.index().insert(worker, b"r2", b"again").0 == OpStatus::Ok);
}

#[test]
fn cache_lru_with_ttl_expiry() {
    let mut cache = Cache::new(2);
    cache.insert(b"k1", PolymorphicPointer::make_local(0x100), 1);
    cache.insert(b"k2", PolymorphicPointer::make_local(0x200), 2);
    cache.insert(b"k3", PolymorphicPointer::make_local(0x300), 3);

    assert!(cache.get(b"k1").is_none());
    assert!(cache.get(b"k2").is_some());
    assert!(cache.get(b"k3").is_some());

    std::thread::sleep(Duration::from_millis(2100));
    assert!(cache.get(b"k2").is_none());
    assert!(cache.get(b"k3").is_none());
}

#[test]
fn remote_pointer_encoding() {
    let p = PolymorphicPointer::make_remote(7, 0x1000);
    assert!(p.is_remote());
    assert!(!p.is_local());
    assert_eq!(p.node_id(), 7);
    assert_eq!(p.raw() >> 62, 0b10);
    assert_eq!((p.raw() >> 56) & 0x3f, 0b000111);

    let local = PolymorphicPointer::make_local(0x7fff_0000_1234);
    assert!(local.is_local());
    assert_eq!(local.raw_local() as u64, 0x7fff_0000_1234);
}

#[test]
fn rpc_dispatch_round_trip() {
    let (_engine, store) = fresh_store(2048);
    let worker = store.register_worker().unwrap();

    let insert = Request::Insert {
        key: b"alpha",
        value: b"one",
    }
    .encode();
    let resp = store.dispatch(worker, &insert);
    assert_eq!(
        Response::parse(RpcOp::Insert, &resp).unwrap(),
        Response::Status(RpcStatus::Ok)
    );

    // duplicate insert is surfaced as a failure on the wire
    let resp = store.dispatch(worker, &insert);
    assert_eq!(
        Response::parse(RpcOp::Insert, &resp).unwrap(),
        Response::Status(RpcStatus::Failed)
    );

    let resp = store.dispatch(worker, &Request::Search { key: b"alpha" }.encode());
    match Response::parse(RpcOp::Search, &resp).unwrap() {
        Response::Search {
            status,
            size,
            handle,
        } => {
            assert_eq!(status, RpcStatus::Ok);
            assert_eq!(size as usize, CompactString::chunk_size(3));
            assert_eq!(unsafe { deref(handle) }, b"one");
        }
        other => panic!("unexpected response {other:?}"),
    }

    // a miss answers with a zero size
    let resp = store.dispatch(worker, &Request::Search { key: b"beta" }.encode());
    match Response::parse(RpcOp::Search, &resp).unwrap() {
        Response::Search { size, handle, .. } => {
            assert_eq!(size, 0);
            assert!(handle.is_null());
        }
        other => panic!("unexpected response {other:?}"),
    }

    for key in ["delta", "gamma"] {
        store.dispatch(
            worker,
            &Request::Insert {
                key: key.as_bytes(),
                value: key.as_bytes(),
            }
            .encode(),
        );
    }
    let resp = store.dispatch(
        worker,
        &Request::Range {
            start: b"a",
            end: b"z",
        }
        .encode(),
    );
    match Response::parse(RpcOp::Range, &resp).unwrap() {
        Response::Range { status, items } => {
            assert_eq!(status, RpcStatus::Ok);
            assert_eq!(items.len(), 3);
        }
        other => panic!("unexpected response {other:?}"),
    }

    let resp = store.dispatch(worker, &[0xee]);
    assert_eq!(
        Response::parse(RpcOp::Insert, &resp).unwrap(),
        Response::Status(RpcStatus::Failed)
    );
}

#[test]
fn oversized_value_lands_in_peer_pm() {
    let (engine, store) = fresh_store(4096);
    let worker = store.register_worker().unwrap();

    let peer_mem = MAX_CHUNK * 4;
    engine
        .agent()
        .set_channel(worker, 2, LoopbackChannel::new(peer_mem));
    assert!(engine
        .agent()
        .add_region(worker, RemotePointer::make(2, 0), peer_mem as u64));
    store.enable_agent();

    // too large for any local page, so the agent places it
    let value = vec![0x42u8; MAX_CHUNK + 10];
    let (status, handle) = store.index().insert(worker, b"remote-key", &value);
    assert_eq!(status, OpStatus::Ok);
    assert!(handle.is_remote());
    assert_eq!(handle.node_id(), 2);

    let (found, size) = store.index().search(b"remote-key");
    assert_eq!(found, handle);
    assert_eq!(size as usize, CompactString::chunk_size(value.len()));

    // the bytes really are on the peer, behind the channel
    let mut buf = vec![0u8; size as usize];
    engine
        .agent()
        .read_remote(worker, found.remote(), &mut buf)
        .unwrap();
    let (payload, _) = CompactString::decode(&buf).unwrap();
    assert_eq!(payload, &value[..]);
}

#[test]
fn exhaustion_surfaces_no_memory() {
    let (_engine, store) = fresh_store(48);
    let worker = store.register_worker().unwrap();

    let mut last = OpStatus::Ok;
    for i in 0..100_000 {
        let key = format!("key-{i:06}");
        let (status, _) = store.index().insert(worker, key.as_bytes(), key.as_bytes());
        if status != OpStatus::Ok {
            last = status;
            break;
        }
    }
    assert_eq!(last, OpStatus::NoMemory);
}

#[test]
fn concurrent_disjoint_inserts_all_succeed() {
    let (_engine, store) = fresh_store(8192);
    let store = Arc::new(store);

    let mut threads = Vec::new();
    for t in 0..4u32 {
        let store = store.clone();
        threads.push(std::thread::spawn(move || {
            let worker = store.register_worker().unwrap();
            for i in 0..25 {
                let key = format!("{t}-key-{i:03}");
                let resp = store.dispatch(
                    worker,
                    &Request::Insert {
                        key: key.as_bytes(),
                        value: key.as_bytes(),
                    }
                    .encode(),
                );
                assert_eq!(
                    Response::parse(RpcOp::Insert, &resp).unwrap(),
                    Response::Status(RpcStatus::Ok),
                    "insert of {key}"
                );
            }
            store.unregister_worker(worker);
        }));
    }
    for thread in threads {
        thread.join().unwrap();
    }

    for t in 0..4u32 {
        for i in 0..25 {
            let key = format!("{t}-key-{i:03}");
            let (handle, _) = store.index().search(key.as_bytes());
            assert!(!handle.is_null(), "missing {key}");
            assert_eq!(unsafe { deref(handle) }, key.as_bytes());
        }
    }
}
