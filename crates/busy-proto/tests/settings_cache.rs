use busy_proto::config::Config;
use busy_proto::settings::SettingKey;
use busy_proto::store::{FileStore, KeyValueStore, SNAPSHOT_KEY};
use busy_proto::sync::SettingsSynchronizer;
use serde_json::json;

fn open(dir: &std::path::Path) -> SettingsSynchronizer {
    let defaults = Config::default().default_snapshot();
    SettingsSynchronizer::load(Box::new(FileStore::new(dir)), defaults, None).unwrap()
}

#[test]
fn edits_survive_a_restart() {
    let dir = tempfile::tempdir().unwrap();

    {
        let mut sync = open(dir.path());
        sync.apply_user_edit("globalVolume", json!(0.4)).unwrap();
        sync.apply_remote_update(&json!({ "payload": { "googleCalInterval": 7500, "phoneVolume": "0.1" } }))
            .unwrap();
        sync.set_enabled("teams", true).unwrap();
    }

    let sync = open(dir.path());
    let snap = sync.snapshot();
    assert!((snap.globals.global_volume - 0.4).abs() < 1e-6);
    assert_eq!(snap.channels.get("google-cal").unwrap().interval_ms, 7500);
    assert!((snap.channels.get("phone").unwrap().volume - 0.1).abs() < 1e-6);
    assert!(snap.channels.get("teams").unwrap().enabled);
    assert_eq!(snap.channels.len(), 10);
}

#[test]
fn added_channels_are_restored_from_the_cache() {
    let dir = tempfile::tempdir().unwrap();
    {
        let mut sync = open(dir.path());
        let pager = busy_proto::channel::Channel::new("pager", "pager.wav", 9000, 0.5);
        sync.upsert_channel(pager).unwrap();
    }

    let sync = open(dir.path());
    let ids: Vec<_> = sync.snapshot().channels.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(ids.len(), 11);
    assert_eq!(ids.last(), Some(&"pager"));
}

#[test]
fn remote_snapshot_wins_over_cache_at_startup() {
    let dir = tempfile::tempdir().unwrap();
    {
        let mut sync = open(dir.path());
        sync.apply_user_edit("slackInterval", json!(2000)).unwrap();
        sync.apply_user_edit("defaultInterval", json!(6000)).unwrap();
    }

    let remote = json!({ "settings": { "slackInterval": { "value": 9000 } } });
    let defaults = Config::default().default_snapshot();
    let sync = SettingsSynchronizer::load(Box::new(FileStore::new(dir.path())), defaults, Some(&remote)).unwrap();
    let snap = sync.snapshot();
    assert_eq!(snap.channels.get("slack").unwrap().interval_ms, 9000);
    assert_eq!(snap.globals.default_interval, 6000);
}

#[test]
fn corrupt_cache_falls_back_to_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileStore::new(dir.path());
    store.put(SNAPSHOT_KEY, "{ not json").unwrap();

    let sync = open(dir.path());
    assert_eq!(sync.snapshot(), &Config::default().default_snapshot());
    // the unreadable blob was replaced by a valid one
    let rewritten = store.get(SNAPSHOT_KEY).unwrap().unwrap();
    assert!(serde_json::from_str::<serde_json::Value>(&rewritten).is_ok());
}

#[test]
fn merge_reports_changed_keys_once() {
    let dir = tempfile::tempdir().unwrap();
    let mut sync = open(dir.path());
    let partial = json!({ "slackVolume": 0.3, "backgroundColor": "#000", "faxVolume": 1 });

    let first = sync.apply_remote_update(&partial).unwrap();
    assert_eq!(first.changed, vec![SettingKey::ChannelVolume("slack".into())]);
    assert_eq!(first.rejected.len(), 1);

    let after_first = sync.snapshot().clone();
    let second = sync.apply_remote_update(&partial).unwrap();
    assert!(second.changed.is_empty());
    assert_eq!(sync.snapshot(), &after_first);
}
