//! Tests for the app lifecycle driver.

use std::fs;

use camino::Utf8PathBuf;
use rstest::{fixture, rstest};
use tempfile::TempDir;

use super::*;
use crate::cache::ReattachDescriptor;
use crate::error::HostError;
use crate::protocol::PROTOCOL_VERSION;
use crate::testing::{EventLog, FakeConnector, RecordingFetcher, RecordingToolchain};

struct Rig {
    _dir: TempDir,
    root: Utf8PathBuf,
    log: EventLog,
}

impl Rig {
    fn env(&self, connector: &FakeConnector) -> Arc<AppEnvironment> {
        let store = ReattachStore::new(self.root.join("cache.json"), "test");
        Arc::new(
            AppEnvironment::new(self.root.join("apps"), store)
                .with_fetcher(Arc::new(RecordingFetcher::new(self.log.clone())))
                .with_toolchain(Arc::new(RecordingToolchain::new(self.log.clone())))
                .with_connector(Arc::new(connector.clone()))
                .with_sinks(OutputSinks::discard())
                .with_terminate_grace(Duration::ZERO),
        )
    }

    fn local_entry(&self, name: &str) -> AppEntry {
        let dir = self.root.join(name);
        fs::create_dir_all(&dir).expect("local app dir");
        AppEntry::new(dir.as_str())
    }

    fn connector(&self, shared: bool) -> FakeConnector {
        FakeConnector::new(
            Manifest::new("hello").with_shared_host(shared),
            self.log.clone(),
        )
    }
}

#[fixture]
fn rig() -> Rig {
    let dir = TempDir::new().expect("temp dir");
    let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf8 temp dir");
    Rig {
        _dir: dir,
        root,
        log: EventLog::new(),
    }
}

fn ctx() -> CallContext {
    CallContext::background()
}

#[rstest]
fn local_app_builds_launches_and_stops(rig: Rig) {
    let connector = rig.connector(false);
    let mut app = App::resolve(rig.local_entry("hello"), rig.env(&connector));

    app.load(&ctx()).expect("load");

    assert!(app.is_loaded());
    assert_eq!(app.ownership(), Some(Ownership::Private));
    assert!(!app.is_host(), "a private process is not a shared host");
    assert!(!app.is_shared_host());
    assert_eq!(app.manifest().map(|m| m.name.as_str()), Some("hello"));
    let pid = FakeConnector::FIRST_PID;
    let src = rig.root.join("hello");
    assert_eq!(
        rig.log.events(),
        [
            format!("tidy {src}"),
            "compile hello".to_owned(),
            format!("launch hello {pid}"),
            format!("dispense hello {pid}"),
            "manifest".to_owned(),
        ]
    );

    app.kill_client();
    app.kill_client();
    assert_eq!(rig.log.count(&format!("terminate {pid}")), 1);
    assert!(connector.live_pids().is_empty());
    assert!(!app.is_loaded());
}

#[rstest]
fn built_local_app_is_not_rebuilt(rig: Rig) {
    let connector = rig.connector(false);
    let env = rig.env(&connector);
    let entry = rig.local_entry("hello");
    App::resolve(entry.clone(), Arc::clone(&env))
        .load(&ctx())
        .expect("first load");
    rig.log.clear();

    App::resolve(entry, env).load(&ctx()).expect("second load");

    assert!(!rig.log.events().iter().any(|event| event.starts_with("compile")));
}

#[rstest]
fn unresolvable_app_stays_failed(rig: Rig) {
    let connector = rig.connector(false);
    let mut app = App::resolve(AppEntry::new("github.com/org"), rig.env(&connector));

    let error = app.load(&ctx()).expect_err("invalid reference");

    assert_eq!(error.stage(), crate::error::Stage::Resolve);
    assert!(app.error().is_some());
    assert!(app.resolved().is_none());
    app.kill_client();
    assert!(rig.log.events().is_empty());
}

#[rstest]
fn remote_fetch_failure_is_recorded_once(rig: Rig) {
    let connector = rig.connector(false);
    let store = ReattachStore::new(rig.root.join("cache.json"), "test");
    let env = Arc::new(
        AppEnvironment::new(rig.root.join("apps"), store)
            .with_fetcher(Arc::new(RecordingFetcher::failing(
                rig.log.clone(),
                "repository not found",
            )))
            .with_connector(Arc::new(connector)),
    );
    let mut app = App::resolve(AppEntry::new("github.com/org/gone"), env);

    let first = app.load(&ctx()).expect_err("fetch fails");
    let second = app.load(&ctx()).expect_err("still failed");

    assert_eq!(first.to_string(), second.to_string());
    assert!(first.to_string().starts_with("cloning \"github.com/org/gone\""));
    assert_eq!(rig.log.count("fetch github.com/org/gone"), 1);
}

#[rstest]
fn manifest_failure_stops_the_process(rig: Rig) {
    let connector = rig.connector(false).with_failure("manifest");
    let mut app = App::resolve(rig.local_entry("hello"), rig.env(&connector));

    let error = app.load(&ctx()).expect_err("manifest fails");

    assert!(error.to_string().starts_with("manifest load: "), "{error}");
    assert!(connector.live_pids().is_empty());
    assert_eq!(
        rig.log.count(&format!("terminate {}", FakeConnector::FIRST_PID)),
        1
    );
}

#[rstest]
fn shared_host_has_one_owner(rig: Rig) {
    let connector = rig.connector(true);
    let env = rig.env(&connector);
    let entry = rig.local_entry("hello");
    let mut apps: Vec<App> = (0..4)
        .map(|_| App::resolve(entry.clone(), Arc::clone(&env)))
        .collect();
    for app in &mut apps {
        app.load(&ctx()).expect("load");
    }

    let roles: Vec<_> = apps.iter().filter_map(App::ownership).collect();
    assert_eq!(
        roles,
        [
            Ownership::Owner,
            Ownership::Guest,
            Ownership::Guest,
            Ownership::Guest
        ]
    );
    let hosts: Vec<_> = apps.iter().map(App::is_host).collect();
    assert_eq!(hosts, [true, false, false, false]);
    assert_eq!(connector.live_pids(), [FakeConnector::FIRST_PID]);

    for guest in apps.iter_mut().skip(1) {
        guest.kill_client();
        assert_eq!(connector.live_pids(), [FakeConnector::FIRST_PID]);
        assert!(env.coordinator().store().contains(entry.path.as_str()).expect("read"));
    }
    assert_eq!(rig.log.count(&format!("terminate {}", FakeConnector::FIRST_PID)), 0);
    assert!(env.coordinator().store().contains(entry.path.as_str()).expect("read"));

    if let Some(owner) = apps.first_mut() {
        owner.kill_client();
    }
    assert!(connector.live_pids().is_empty());
    assert!(!env.coordinator().store().contains(entry.path.as_str()).expect("read"));
}

#[rstest]
#[case::private(false, Ownership::Private)]
#[case::shared(true, Ownership::Owner)]
fn corrupt_cache_does_not_block_loading(
    rig: Rig,
    #[case] shared: bool,
    #[case] expected: Ownership,
) {
    fs::write(rig.root.join("cache.json"), "{not json").expect("corrupt cache");
    let connector = rig.connector(shared);
    let env = rig.env(&connector);
    let entry = rig.local_entry("hello");
    let mut app = App::resolve(entry.clone(), Arc::clone(&env));

    app.load(&ctx()).expect("load despite corrupt cache");

    assert_eq!(app.ownership(), Some(expected));
    assert_eq!(
        env.coordinator().store().contains(&entry.path).expect("read"),
        shared
    );
}

#[rstest]
fn crashed_owner_is_replaced(rig: Rig) {
    let connector = rig.connector(true);
    let env = rig.env(&connector);
    let entry = rig.local_entry("hello");
    let crashed = FakeConnector::FIRST_PID + 500;
    let descriptor = ReattachDescriptor {
        protocol_version: PROTOCOL_VERSION,
        endpoint: trellis_config::SocketEndpoint::unix("/tmp/trellis-fake/crashed.sock"),
        pid: crashed,
    };
    env.coordinator()
        .store()
        .write(&entry.path, &descriptor)
        .expect("seed cache");

    let mut app = App::resolve(entry.clone(), Arc::clone(&env));
    app.load(&ctx()).expect("relaunch");

    assert_eq!(app.ownership(), Some(Ownership::Owner));
    let published = env
        .coordinator()
        .store()
        .read(&entry.path)
        .expect("read")
        .expect("entry");
    assert_eq!(published.pid, FakeConnector::FIRST_PID);
}

#[rstest]
fn unreachable_live_owner_is_an_error(rig: Rig) {
    let connector = rig.connector(true);
    let env = rig.env(&connector);
    let entry = rig.local_entry("hello");
    let descriptor = ReattachDescriptor {
        protocol_version: PROTOCOL_VERSION,
        endpoint: trellis_config::SocketEndpoint::unix("/tmp/trellis-fake/alive.sock"),
        pid: std::process::id(),
    };
    env.coordinator()
        .store()
        .write(&entry.path, &descriptor)
        .expect("seed cache");

    let mut app = App::resolve(entry.clone(), Arc::clone(&env));
    let error = app.load(&ctx()).expect_err("stale descriptor");

    assert!(matches!(
        error,
        AppError::Connect(HostError::StaleDescriptor { .. })
    ));
    assert!(env.coordinator().store().contains(&entry.path).expect("read"));
    assert!(connector.live_pids().is_empty(), "nothing launched");
}

#[rstest]
fn update_refetches_remote_sources(rig: Rig) {
    let connector = rig.connector(false);
    let env = rig.env(&connector);
    let mut app = App::resolve(AppEntry::new("github.com/org/hello"), env);
    app.load(&ctx()).expect("load");
    let artifact = app.resolved().expect("resolved").artifact_path();
    assert!(artifact.exists());

    app.update(&ctx()).expect("update");

    assert!(!app.is_loaded());
    assert!(!artifact.exists(), "clone was removed and fetched again");
    assert_eq!(rig.log.count("fetch github.com/org/hello"), 2);
    assert!(connector.live_pids().is_empty());
}

#[rstest]
fn link_failure_stops_and_records(rig: Rig) {
    let connector = rig.connector(false);
    let mut app = App::resolve(rig.local_entry("hello"), rig.env(&connector));
    app.load(&ctx()).expect("load");

    app.fail(AppError::Link(LinkError::NotLoaded {
        app: "hello".to_owned(),
    }));

    assert!(connector.live_pids().is_empty());
    assert!(matches!(app.error(), Some(AppError::Link(_))));
    assert!(app.current_manifest(&ctx()).is_err());
}
