use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use docsync_common::{Author, ChannelMessage};
use docsync_relay::access::AccessPolicy;
use docsync_relay::cache::MemoryKv;
use docsync_relay::config::SyncTuning;
use docsync_relay::lock::LockManager;
use docsync_relay::session::SyncServices;
use docsync_relay::store::MemoryStore;
use yrs::updates::decoder::Decode;
use yrs::{Doc, Options, ReadTxn, Text, Transact, Update};

pub fn autosave_author() -> Author {
    Author::new("docsync", "docsync@localhost")
}

/// Short timings so debounced flushes fire within a test run.
pub fn fast_tuning() -> SyncTuning {
    SyncTuning {
        flush_debounce: Duration::from_millis(200),
        idle_flush_delay: Duration::from_millis(50),
        head_check_interval: Duration::from_millis(100),
        lock_poll_interval: Duration::from_millis(1),
        ..SyncTuning::default()
    }
}

pub fn memory_services(tuning: SyncTuning, access: AccessPolicy) -> (SyncServices, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::default());
    let services = SyncServices::new(
        tuning.clone(),
        autosave_author(),
        Arc::new(MemoryKv::default()),
        LockManager::local(tuning.lock_poll_interval),
        store.clone(),
        access,
    );
    (services, store)
}

/// Update produced by an editor holding `state` that inserts `text` at `index`.
pub fn edit(state: &[u8], client_id: u64, index: u32, text: &str) -> Vec<u8> {
    let doc = Doc::with_options(Options { client_id, ..Default::default() });
    let update = Update::decode_v1(state).expect("state should decode");
    doc.transact_mut().apply_update(update).expect("state should apply");
    let before = doc.transact().state_vector();
    let root = doc.get_or_insert_text("content");
    root.insert(&mut doc.transact_mut(), index, text);
    let diff = doc.transact().encode_diff_v1(&before);
    diff
}

pub fn sync_state(message: &ChannelMessage) -> Vec<u8> {
    let ChannelMessage::Sync { state } = message else {
        panic!("expected sync, got {message:?}");
    };
    STANDARD.decode(state).expect("sync state should be base64")
}

pub fn update_message(update: &[u8], sender: &str) -> ChannelMessage {
    ChannelMessage::Update { update: STANDARD.encode(update), sender: sender.to_string() }
}

/// Poll `condition` until it holds or five seconds pass.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
