use chrono::TimeZone;
use serde_json::json;
use siem_event_pipeline::config::IndexSettings;
use siem_event_pipeline::models::Event;
use siem_event_pipeline::processor::dedup::{fingerprint, DedupCache};
use siem_event_pipeline::storage::IndexStore;

fn store() -> IndexStore {
    IndexStore::new(&IndexSettings {
        hosts: "http://localhost:9200".to_string(),
        username: None,
        password: None,
        ssl_verify: true,
        index_prefix: "logs".to_string(),
        ilm_warm_days: 30,
        ilm_cold_days: 90,
        ilm_delete_days: 365,
    })
    .unwrap()
}

fn submission(request_id: &str) -> Event {
    serde_json::from_value(json!({
        "source": "apache",
        "event_type": "log",
        "data": {
            "remote_host": "127.0.0.1",
            "status": 200,
            "request_id": request_id,
        },
    }))
    .unwrap()
}

#[test]
fn resubmitted_event_dedups_to_one_index_write() {
    // The same canonical payload submitted twice inside the window
    // fingerprints identically even though accept() assigned fresh ids
    // and the transport stamped different request ids.
    let first = submission("req-aaa").accept(1_048_576).unwrap();
    let second = submission("req-bbb").accept(1_048_576).unwrap();
    assert_ne!(first.id, second.id);
    assert_eq!(fingerprint(&first), fingerprint(&second));

    let mut cache = DedupCache::new(300, 10_000);
    assert!(!cache.check_and_insert(&fingerprint(&first), 1000));
    assert!(cache.check_and_insert(&fingerprint(&second), 1010));
}

#[test]
fn changed_payload_is_not_a_duplicate() {
    let mut other = submission("req-aaa");
    other.data.insert("status".into(), json!(500));
    assert_ne!(
        fingerprint(&submission("req-aaa")),
        fingerprint(&other)
    );
}

#[test]
fn index_bucket_follows_the_event_timestamp() {
    let store = store();
    let october_2000 = chrono::Utc.with_ymd_and_hms(2000, 10, 10, 20, 55, 36).unwrap();
    assert_eq!(store.index_for(october_2000), "logs-2000.10");

    // Events land in the bucket of their own timestamp, not the wall
    // clock at processing time.
    let mut event = submission("req-aaa").accept(1_048_576).unwrap();
    event.timestamp = Some(october_2000);
    assert_eq!(store.index_for(event.timestamp.unwrap()), "logs-2000.10");
}

#[test]
fn accepted_events_satisfy_post_accept_invariants() {
    let event = submission("req-aaa").accept(1_048_576).unwrap();
    assert!(event.id.is_some());
    assert!(event.timestamp.is_some());
    assert_eq!(event.source, "apache");
    assert_eq!(event.event_type, "log");
    assert!(event.enriched.is_empty());
}
