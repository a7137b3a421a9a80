//! End-to-end coverage of `TdbStore`'s public `KvStore` surface (§3.1-3.2, §8).

use flashvault::{BlockDevice, Flags, KvStore, RamBlockDevice, TdbStore};

const AREA_SIZE: u32 = 64 * 1024;

fn fresh_store() -> TdbStore<RamBlockDevice> {
    let dev = RamBlockDevice::new(AREA_SIZE, 4096, 1);
    let store = TdbStore::new(dev, 0, AREA_SIZE).unwrap();
    store.init().unwrap();
    store
}

#[test]
fn set_then_get_round_trips() {
    let store = fresh_store();
    store.set("name", b"flashvault", Flags::empty()).unwrap();
    let mut buf = [0u8; 32];
    let n = store.get("name", &mut buf, 0).unwrap();
    assert_eq!(&buf[..n as usize], b"flashvault");
}

#[test]
fn get_missing_key_is_not_found() {
    let store = fresh_store();
    let mut buf = [0u8; 8];
    assert!(matches!(
        store.get("nope", &mut buf, 0),
        Err(flashvault::Error::NotFound)
    ));
}

#[test]
fn overwrite_replaces_value() {
    let store = fresh_store();
    store.set("k", b"first", Flags::empty()).unwrap();
    store.set("k", b"second-value", Flags::empty()).unwrap();
    let mut buf = [0u8; 32];
    let n = store.get("k", &mut buf, 0).unwrap();
    assert_eq!(&buf[..n as usize], b"second-value");
}

#[test]
fn write_once_rejects_overwrite_and_removal() {
    let store = fresh_store();
    store.set("pinned", b"v1", Flags::WRITE_ONCE).unwrap();
    assert!(matches!(
        store.set("pinned", b"v2", Flags::empty()),
        Err(flashvault::Error::WriteProtected)
    ));
    assert!(matches!(
        store.remove("pinned"),
        Err(flashvault::Error::WriteProtected)
    ));
}

#[test]
fn remove_then_get_is_not_found() {
    let store = fresh_store();
    store.set("gone", b"x", Flags::empty()).unwrap();
    store.remove("gone").unwrap();
    let mut buf = [0u8; 8];
    assert!(matches!(
        store.get("gone", &mut buf, 0),
        Err(flashvault::Error::NotFound)
    ));
}

#[test]
fn partial_read_respects_offset() {
    let store = fresh_store();
    store.set("blob", b"0123456789", Flags::empty()).unwrap();
    let mut buf = [0u8; 4];
    let n = store.get("blob", &mut buf, 5).unwrap();
    assert_eq!(&buf[..n as usize], b"5678");
}

#[test]
fn get_into_too_small_buffer_is_rejected() {
    let store = fresh_store();
    store.set("blob", b"0123456789", Flags::empty()).unwrap();
    let mut buf = [0u8; 4];
    assert!(matches!(
        store.get("blob", &mut buf, 0),
        Err(flashvault::Error::BuffTooSmall)
    ));
}

#[test]
fn reinit_after_deinit_preserves_data() {
    let dev = RamBlockDevice::new(AREA_SIZE, 4096, 1);
    let store = TdbStore::new(dev, 0, AREA_SIZE).unwrap();
    store.init().unwrap();
    store.set("persist", b"survives", Flags::empty()).unwrap();
    store.deinit().unwrap();

    store.init().unwrap();
    let mut buf = [0u8; 16];
    let n = store.get("persist", &mut buf, 0).unwrap();
    assert_eq!(&buf[..n as usize], b"survives");
}

#[test]
fn reset_wipes_all_keys() {
    let store = fresh_store();
    store.set("a", b"1", Flags::empty()).unwrap();
    store.set("b", b"2", Flags::empty()).unwrap();
    store.reset().unwrap();
    let mut buf = [0u8; 4];
    assert!(matches!(
        store.get("a", &mut buf, 0),
        Err(flashvault::Error::NotFound)
    ));
}

#[test]
fn streaming_write_matches_one_shot() {
    let store = fresh_store();
    store.set_start("streamed", 11, Flags::empty()).unwrap();
    store.set_add_data(b"hello ").unwrap();
    store.set_add_data(b"world").unwrap();
    store.set_finalize().unwrap();

    let mut buf = [0u8; 16];
    let n = store.get("streamed", &mut buf, 0).unwrap();
    assert_eq!(&buf[..n as usize], b"hello world");
}

#[test]
fn streaming_write_rejects_size_mismatch() {
    let store = fresh_store();
    store.set_start("short", 99, Flags::empty()).unwrap();
    store.set_add_data(b"too short").unwrap();
    assert!(matches!(
        store.set_finalize(),
        Err(flashvault::Error::InvalidArgument)
    ));
}

#[test]
fn second_set_start_while_stream_open_is_busy() {
    let store = fresh_store();
    store.set_start("first", 1, Flags::empty()).unwrap();
    assert!(matches!(
        store.set_start("second", 1, Flags::empty()),
        Err(flashvault::Error::OsError)
    ));
}

#[test]
fn set_add_data_without_start_is_not_ready() {
    let store = fresh_store();
    assert!(matches!(
        store.set_add_data(b"x"),
        Err(flashvault::Error::NotReady)
    ));
}
