//! Runtime tests against real SQLite files in temporary directories.

use std::path::Path;
use std::time::Duration;

use questline_core::host::NullHost;
use questline_core::persistence::{MemoryStore, PlayerStore, SqliteStore};
use questline_core::definition::VarScope;
use questline_core::{Capabilities, PlayerId, QuestEngine, QuestError, QuestId};
use questline_server::{QuestServer, ServerConfig, telemetry};

const COURIER: &str = r#"{
    "id": "courier",
    "blocked_commands": ["spawn"],
    "branches": { "main": { "start": "cp", "nodes": {
        "cp": { "type": "checkpoint", "goto": "deliver" },
        "deliver": { "type": "objective", "objective": "Deliver the parcel" }
    }}}
}"#;

fn config(root: &Path) -> ServerConfig {
    let mut config = ServerConfig::default();
    config.core.persistence.path = root.join("questline.db").to_string_lossy().into_owned();
    config.core.cache.flush_interval_ticks = 1_000;
    config.server.definitions_dir = root.join("quests");
    config
}

fn write_content(root: &Path) {
    let dir = root.join("quests");
    std::fs::create_dir_all(&dir).expect("quests dir");
    std::fs::write(dir.join("courier.json"), COURIER).expect("quest file");
}

#[test]
fn checkpoint_reaches_the_database_through_the_worker() {
    telemetry::init("debug");
    let root = tempfile::tempdir().expect("tempdir");
    write_content(root.path());
    let config = config(root.path());
    let db_path = config.core.persistence.path.clone();
    let persistence = config.core.persistence.clone();

    let mut server = QuestServer::open(config).expect("open");
    let mut host = NullHost;
    let player = PlayerId::new();
    let id = QuestId::from("courier");
    server.player_joined(player, &mut host).expect("join");
    server.engine_mut().start_quest(player, &id, &mut host).expect("start");

    server.tick(&mut host);
    for _ in 0..400 {
        if !server.engine().is_dirty(player) {
            break;
        }
        std::thread::sleep(Duration::from_millis(5));
        server.tick(&mut host);
    }
    assert!(!server.engine().is_dirty(player), "checkpoint write confirmed");
    assert!(server.ticks() < 1_000, "written before the periodic flush");

    let reader = SqliteStore::open(&db_path, &persistence).expect("reader");
    let saved = reader.load_player(player).expect("load").expect("saved");
    let progress = saved.active.get(&id).expect("active quest saved");
    assert_eq!(progress.cursors.get("main").map(|c| c.node.as_str()), Some("deliver"));

    let err = server.player_command(player, "/spawn", &mut host).expect_err("blocked");
    assert!(matches!(err, QuestError::CommandRestricted { .. }));
    assert!(server.player_command(player, "/help", &mut host).is_ok());

    server.shutdown().expect("shutdown");
}

#[test]
fn shutdown_flushes_pending_edits() {
    let root = tempfile::tempdir().expect("tempdir");
    write_content(root.path());
    let config = config(root.path());
    let db_path = config.core.persistence.path.clone();
    let persistence = config.core.persistence.clone();

    let mut server = QuestServer::open(config).expect("open");
    let player = PlayerId::new();
    server
        .engine_mut()
        .set_variable(player, None, VarScope::User, "title", Some("Courier".into()))
        .expect("set");
    assert!(server.engine().is_dirty(player));
    server.shutdown().expect("shutdown");

    let reader = SqliteStore::open(&db_path, &persistence).expect("reader");
    let saved = reader.load_player(player).expect("load").expect("saved");
    assert_eq!(saved.user_vars.get("title").map(String::as_str), Some("Courier"));
}

#[test]
fn cached_definitions_survive_a_missing_directory() {
    let root = tempfile::tempdir().expect("tempdir");
    write_content(root.path());

    let mut first = QuestServer::open(config(root.path())).expect("first open");
    assert_eq!(first.engine().definitions().len(), 1);
    first.shutdown().expect("shutdown");
    drop(first);

    std::fs::remove_dir_all(root.path().join("quests")).expect("remove quests");
    let mut second = QuestServer::open(config(root.path())).expect("second open");
    assert_eq!(second.engine().definitions().len(), 1);
    second.shutdown().expect("shutdown");

    let mut uncached = config(root.path());
    uncached.server.use_definition_cache = false;
    assert!(QuestServer::open(uncached).is_err());
}

#[test]
fn without_a_worker_flushes_are_synchronous() {
    let store = MemoryStore::new();
    let mut config = ServerConfig::default();
    config.core.cache.flush_interval_ticks = 2;
    let engine = QuestEngine::new(config.core.clone(), Box::new(store.clone()), Capabilities::default()).expect("engine");
    let mut server = QuestServer::with_engine(config, engine, None);
    let mut host = NullHost;
    let player = PlayerId::new();

    server
        .engine_mut()
        .set_variable(player, None, VarScope::User, "k", Some("v".into()))
        .expect("set");
    server.tick(&mut host);
    assert!(store.stored(player).is_none());
    server.tick(&mut host);
    assert!(store.stored(player).is_some());
    assert!(!server.engine().is_dirty(player));
}
