//! Iterator completeness and prefix filtering over `TdbStore` (§6.1, §8).

use flashvault::{BlockDevice, Flags, KvStore, RamBlockDevice, TdbStore};
use std::collections::BTreeSet;

fn fresh_store() -> TdbStore<RamBlockDevice> {
    let dev = RamBlockDevice::new(64 * 1024, 4096, 1);
    let store = TdbStore::new(dev, 0, 64 * 1024).unwrap();
    store.init().unwrap();
    store
}

fn drain_keys(store: &TdbStore<RamBlockDevice>, prefix: Option<&str>) -> BTreeSet<String> {
    let it = store.iterator_open(prefix).unwrap();
    let mut seen = BTreeSet::new();
    let mut buf = [0u8; 128];
    while let Some(n) = store.iterator_next(it, &mut buf).unwrap() {
        seen.insert(String::from_utf8(buf[..n as usize].to_vec()).unwrap());
    }
    store.iterator_close(it).unwrap();
    seen
}

#[test]
fn iterates_every_live_key_exactly_once() {
    let store = fresh_store();
    for key in ["alpha", "beta", "gamma", "delta"] {
        store.set(key, b"v", Flags::empty()).unwrap();
    }
    let seen = drain_keys(&store, None);
    assert_eq!(
        seen,
        BTreeSet::from(["alpha", "beta", "gamma", "delta"].map(String::from))
    );
}

#[test]
fn removed_keys_are_excluded() {
    let store = fresh_store();
    store.set("keep", b"v", Flags::empty()).unwrap();
    store.set("drop", b"v", Flags::empty()).unwrap();
    store.remove("drop").unwrap();
    let seen = drain_keys(&store, None);
    assert_eq!(seen, BTreeSet::from(["keep".to_string()]));
}

#[test]
fn prefix_filters_results() {
    let store = fresh_store();
    store.set("cfg/a", b"1", Flags::empty()).unwrap();
    store.set("cfg/b", b"2", Flags::empty()).unwrap();
    store.set("log/a", b"3", Flags::empty()).unwrap();
    let seen = drain_keys(&store, Some("cfg/"));
    assert_eq!(seen, BTreeSet::from(["cfg/a".to_string(), "cfg/b".to_string()]));
}

#[test]
fn two_concurrent_iterators_are_independent() {
    let store = fresh_store();
    store.set("x", b"1", Flags::empty()).unwrap();
    store.set("y", b"2", Flags::empty()).unwrap();

    let it_a = store.iterator_open(None).unwrap();
    let it_b = store.iterator_open(None).unwrap();
    let mut buf = [0u8; 16];
    assert!(store.iterator_next(it_a, &mut buf).unwrap().is_some());
    assert!(store.iterator_next(it_b, &mut buf).unwrap().is_some());
    assert!(store.iterator_next(it_b, &mut buf).unwrap().is_some());
    assert!(store.iterator_next(it_b, &mut buf).unwrap().is_none());
    assert!(store.iterator_next(it_a, &mut buf).unwrap().is_some());
    assert!(store.iterator_next(it_a, &mut buf).unwrap().is_none());
}
