//! End-to-end engine scenarios over a real on-disk cache with stub
//! collaborators for transport, scripting, and logging.

mod support;

use camino::Utf8PathBuf;
use envy::{Cache, Engine, EngineOptions, RunReport};
use serde_json::{Value, json};
use std::fs;
use std::sync::Arc;
use std::time::Duration;
use support::{CollectLog, EventLog, StubFetcher, StubHost, TestScript};

struct Fixture {
    _dir: tempfile::TempDir,
    cache: Cache,
    manifest: Utf8PathBuf,
    host: Arc<StubHost>,
    fetcher: Arc<StubFetcher>,
    log: Arc<CollectLog>,
}

fn fixture() -> Fixture {
    let dir = tempfile::TempDir::new().unwrap();
    let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
    let cache = Cache::open(root.join("cache")).unwrap();
    let manifest = root.join("manifest.lua");
    fs::write(&manifest, "-- test manifest").unwrap();
    Fixture {
        _dir: dir,
        cache,
        manifest,
        host: StubHost::new(),
        fetcher: StubFetcher::new(),
        log: CollectLog::new(),
    }
}

fn engine(fixture: &Fixture) -> Engine {
    let options = EngineOptions {
        backoff_base: Duration::ZERO,
        ..EngineOptions::default()
    };
    Engine::new(
        fixture.cache.clone(),
        fixture.host.clone(),
        fixture.fetcher.clone(),
    )
    .with_log(fixture.log.clone())
    .with_options(options)
}

fn run(fixture: &Fixture, roots: &[Value]) -> RunReport {
    engine(fixture).run(roots, &fixture.manifest).unwrap()
}

fn sha_hex(bytes: &[u8]) -> String {
    hex::encode(envy::hash::sha256_bytes(bytes))
}

fn remote_root(identity: &str, url: &str, sha256: &str) -> Value {
    json!({
        "identity": identity,
        "remote": {"url": url, "sha256": sha256},
    })
}

/// Replicates the engine's check-phase input digest for a dependency-free
/// remote package, to locate its asset entry on disk.
fn remote_entry_prefix(canonical_key: &str, url: &str, sha256: &str) -> String {
    let mut input = Vec::new();
    input.extend_from_slice(canonical_key.as_bytes());
    input.push(0);
    input.extend_from_slice(format!("remote:{url}:{sha256}").as_bytes());
    input.push(0);
    hex::encode(envy::hash::sha256_bytes(&input))[..16].to_string()
}

#[test]
fn cold_fetch_of_a_remote_package() {
    let fixture = fixture();
    let payload = b"tool-archive-bytes";
    let url = "https://example/tool.tar.gz";
    let sha = sha_hex(payload);
    fixture.fetcher.serve(url, payload);

    let report = run(&fixture, &[remote_root("a.tool@1", url, &sha)]);

    assert!(report.all_succeeded(), "failures: {:?}", report.failures);
    let outcome = report.outcome("a.tool@1").unwrap();
    assert!(!outcome.result_hash.is_empty());

    let asset = outcome.asset_path.clone().unwrap();
    assert_eq!(fs::read(asset.join("tool.tar.gz")).unwrap(), payload);

    // The asset entry is committed under its content-addressed name.
    let prefix = remote_entry_prefix("a.tool@1", url, &sha);
    let entry = fixture.cache.assets_dir().join(format!(
        "a.tool@1.{}-{}-sha256-{prefix}",
        std::env::consts::OS,
        std::env::consts::ARCH
    ));
    assert!(entry.join(".envy-complete").exists());
    assert!(!entry.join(".work").exists());
    assert!(!entry.join(".install").exists());

    // The recipe namespace carries the package's spec file.
    let recipe = fixture.cache.recipes_dir().join("a.tool@1.lua");
    assert!(recipe.join(".envy-complete").exists());
}

#[test]
fn warm_cache_hit_skips_fetch_and_reproduces_the_hash() {
    let fixture = fixture();
    let payload = b"tool-archive-bytes";
    let url = "https://example/tool.tar.gz";
    let sha = sha_hex(payload);
    fixture.fetcher.serve(url, payload);

    let first = run(&fixture, &[remote_root("a.tool@1", url, &sha)]);
    assert!(first.all_succeeded());
    let fetches_after_first = fixture.fetcher.call_count();

    let second = run(&fixture, &[remote_root("a.tool@1", url, &sha)]);
    assert!(second.all_succeeded());

    assert_eq!(
        fixture.fetcher.call_count(),
        fetches_after_first,
        "warm run must not touch the network"
    );
    assert_eq!(
        first.outcome("a.tool@1").unwrap().result_hash,
        second.outcome("a.tool@1").unwrap().result_hash
    );
}

#[test]
fn needed_by_gates_the_dependent_before_its_fetch() {
    let fixture = fixture();
    let events: Arc<EventLog> = Arc::clone(&fixture.fetcher.events);

    let a_url = "https://example/a.tar";
    let b_url = "https://example/b.tar";
    fixture.fetcher.serve(a_url, b"a-bytes");
    fixture.fetcher.serve(b_url, b"b-bytes");

    let mut a_script = TestScript::named("a");
    a_script.log = Some(Arc::clone(&events));
    a_script.deps = vec![json!({
        "identity": "t.b@1",
        "remote": {"url": b_url, "sha256": sha_hex(b"b-bytes")},
        "needed_by": "stage",
    })];
    fixture.host.register("t.a@1", Arc::new(a_script));

    let mut b_script = TestScript::named("b");
    b_script.log = Some(Arc::clone(&events));
    fixture.host.register("t.b@1", Arc::new(b_script));

    let report = run(
        &fixture,
        &[remote_root("t.a@1", a_url, &sha_hex(b"a-bytes"))],
    );
    assert!(report.all_succeeded(), "failures: {:?}", report.failures);

    let b_stage = events.position("b.stage").expect("b staged");
    let a_fetch = events
        .position(&format!("fetch:{a_url}"))
        .expect("a fetched");
    assert!(
        b_stage < a_fetch,
        "dependency stage must precede dependent fetch: {:?}",
        events.snapshot()
    );
}

#[test]
fn dependency_cycles_fail_both_packages() {
    let fixture = fixture();
    let x_url = "https://example/x.tar";
    let y_url = "https://example/y.tar";
    fixture.fetcher.serve(x_url, b"x");
    fixture.fetcher.serve(y_url, b"y");

    let mut x_script = TestScript::named("x");
    x_script.deps = vec![json!({
        "identity": "t.y@1",
        "remote": {"url": y_url, "sha256": sha_hex(b"y")},
    })];
    fixture.host.register("t.x@1", Arc::new(x_script));

    let mut y_script = TestScript::named("y");
    y_script.deps = vec![json!({
        "identity": "t.x@1",
        "remote": {"url": x_url, "sha256": sha_hex(b"x")},
    })];
    fixture.host.register("t.y@1", Arc::new(y_script));

    let report = run(&fixture, &[remote_root("t.x@1", x_url, &sha_hex(b"x"))]);

    assert_eq!(report.failures.len(), 2);
    for key in ["t.x@1", "t.y@1"] {
        let failure = report.failures.get(key).expect("both packages fail");
        assert!(failure.contains("dependency cycle"), "got: {failure}");
        assert!(failure.contains("t.x@1") && failure.contains("t.y@1"));
        assert!(report.outcome(key).unwrap().result_hash.is_empty());
    }
}

#[test]
fn hash_mismatch_rolls_back_and_a_good_run_recovers() {
    let fixture = fixture();
    let url = "https://example/tool.tar.gz";
    let declared = sha_hex(b"good-bytes");
    fixture.fetcher.serve(url, b"evil-bytes");

    let report = run(&fixture, &[remote_root("a.tool@1", url, &declared)]);
    let failure = report.failures.get("a.tool@1").expect("must fail");
    assert!(failure.contains("hash mismatch"), "got: {failure}");

    // No asset entry was committed.
    for entry in fixture.cache.assets_dir().read_dir_utf8().unwrap().flatten() {
        assert!(
            !entry.path().join(".envy-complete").exists(),
            "rollback must not leave a completeness marker"
        );
        assert!(!entry.path().join(".install").exists());
    }

    // The same declaration succeeds once the content is right.
    fixture.fetcher.serve(url, b"good-bytes");
    let retry = run(&fixture, &[remote_root("a.tool@1", url, &declared)]);
    assert!(retry.all_succeeded(), "failures: {:?}", retry.failures);
    assert!(!retry.outcome("a.tool@1").unwrap().result_hash.is_empty());
}

#[test]
fn concurrent_runs_share_one_install() {
    let fixture = fixture();
    let payload = b"tool-archive-bytes";
    let url = "https://example/tool.tar.gz";
    let sha = sha_hex(payload);
    fixture.fetcher.serve(url, payload);

    let mut workers = Vec::new();
    for _ in 0..2 {
        let engine = engine(&fixture);
        let manifest = fixture.manifest.clone();
        let root = remote_root("a.tool@1", url, &sha);
        workers.push(std::thread::spawn(move || {
            engine.run(&[root], &manifest).unwrap()
        }));
    }
    let reports: Vec<RunReport> = workers
        .into_iter()
        .map(|w| w.join().unwrap())
        .collect();

    for report in &reports {
        assert!(report.all_succeeded(), "failures: {:?}", report.failures);
    }
    assert_eq!(
        reports[0].outcome("a.tool@1").unwrap().result_hash,
        reports[1].outcome("a.tool@1").unwrap().result_hash
    );
    assert_eq!(
        fixture.fetcher.call_count(),
        1,
        "exactly one run does the work; the other observes completion"
    );
}

#[test]
fn transient_network_failures_are_retried() {
    let fixture = fixture();
    let payload = b"flaky-bytes";
    let url = "https://example/flaky.tar.gz";
    fixture.fetcher.serve(url, payload);
    fixture.fetcher.fail_transiently(url, 2);

    let report = run(&fixture, &[remote_root("a.flaky@1", url, &sha_hex(payload))]);

    assert!(report.all_succeeded(), "failures: {:?}", report.failures);
    assert_eq!(fixture.fetcher.call_count(), 3);
}

#[test]
fn weak_fallback_substitutes_for_a_failed_primary() {
    let fixture = fixture();
    let app_url = "https://example/app.tar";
    let brk_url = "https://example/brk.tar";
    let alt_url = "https://example/alt.tar";
    for (url, bytes) in [
        (app_url, b"app".as_slice()),
        (brk_url, b"brk"),
        (alt_url, b"alt"),
    ] {
        fixture.fetcher.serve(url, bytes);
    }

    let app_script = Arc::new({
        let mut script = TestScript::named("app");
        script.deps = vec![json!({
            "identity": "t.brk@1",
            "remote": {"url": brk_url, "sha256": sha_hex(b"brk")},
            "weak": {
                "identity": "t.alt@1",
                "remote": {"url": alt_url, "sha256": sha_hex(b"alt")},
            },
        })];
        script
    });
    fixture.host.register("t.app@1", Arc::clone(&app_script));

    let mut brk_script = TestScript::named("brk");
    brk_script.fail_build = true;
    fixture.host.register("t.brk@1", Arc::new(brk_script));

    let report = run(&fixture, &[remote_root("t.app@1", app_url, &sha_hex(b"app"))]);

    assert!(report.failures.contains_key("t.brk@1"));
    assert!(!report.failures.contains_key("t.app@1"));
    assert!(!report.failures.contains_key("t.alt@1"));

    // The dependent saw the fallback's asset under the primary's key.
    let seen = app_script.seen_deps.lock();
    let substituted = seen.get("t.brk@1").expect("dependency resolved");
    assert_eq!(
        substituted,
        &report.outcome("t.alt@1").unwrap().asset_path.clone().unwrap()
    );
}

#[test]
fn product_dependencies_resolve_inside_the_provider_tree() {
    let fixture = fixture();
    let cons_url = "https://example/cons.tar";
    let prov_url = "https://example/prov.bin";
    fixture.fetcher.serve(cons_url, b"cons");
    fixture.fetcher.serve(prov_url, b"prov");

    let cons_script = Arc::new({
        let mut script = TestScript::named("cons");
        script.deps = vec![json!({
            "identity": "t.prov@1",
            "remote": {"url": prov_url, "sha256": sha_hex(b"prov")},
            "product": "bin",
        })];
        script
    });
    fixture.host.register("t.cons@1", Arc::clone(&cons_script));

    let prov_script = Arc::new({
        let mut script = TestScript::named("prov");
        script
            .products
            .insert("bin".to_string(), "prov.bin".to_string());
        script
    });
    fixture.host.register("t.prov@1", prov_script);

    let report = run(&fixture, &[remote_root("t.cons@1", cons_url, &sha_hex(b"cons"))]);
    assert!(report.all_succeeded(), "failures: {:?}", report.failures);

    let seen = cons_script.seen_deps.lock();
    let product_path = seen.get("t.prov@1").expect("product resolved");
    assert!(product_path.as_str().ends_with("asset/prov.bin"));
    assert!(product_path.exists());
}

#[test]
fn fetch_function_packages_wait_for_source_dependencies() {
    let fixture = fixture();
    let src_url = "https://example/src.tar";
    fixture.fetcher.serve(src_url, b"src");

    fixture.host.register_recipe_files(
        "t.ff@1",
        vec![("t.ff@1.lua".to_string(), b"-- generated spec".to_vec())],
    );
    let mut ff_script = TestScript::named("ff");
    ff_script.log = Some(Arc::clone(&fixture.fetcher.events));
    fixture.host.register("t.ff@1", Arc::new(ff_script));

    let root = json!({
        "identity": "t.ff@1",
        "fetch_function": {
            "source_dependencies": [{
                "identity": "t.src@1",
                "remote": {"url": src_url, "sha256": sha_hex(b"src")},
            }],
        },
    });

    let report = run(&fixture, &[root]);
    assert!(report.all_succeeded(), "failures: {:?}", report.failures);

    // The source dependency completed and the generated spec was cached.
    assert!(report.outcome("t.src@1").is_some());
    let recipe = fixture.cache.recipes_dir().join("t.ff@1.lua");
    assert!(recipe.join(".envy-complete").exists());
    assert!(recipe.join("asset/t.ff@1.lua").exists());

    // The script's own fetch produced the installed payload.
    let asset = report.outcome("t.ff@1").unwrap().asset_path.clone().unwrap();
    assert_eq!(fs::read(asset.join("payload.txt")).unwrap(), b"ff");
}

#[test]
fn failure_reports_reach_the_log_collaborator() {
    let fixture = fixture();
    let url = "https://example/broken.tar";
    fixture.fetcher.serve(url, b"broken");

    let mut script = TestScript::named("broken");
    script.fail_build = true;
    fixture.host.register("t.broken@1", Arc::new(script));

    let report = run(&fixture, &[remote_root("t.broken@1", url, &sha_hex(b"broken"))]);
    assert!(report.failures.contains_key("t.broken@1"));

    let blocks = fixture.log.blocks.lock();
    assert_eq!(blocks.len(), 1);
    assert!(blocks[0].contains("synthetic build failure"));
    assert!(blocks[0].contains("package: t.broken@1"));
    assert!(blocks[0].contains("phase: build"));
}
