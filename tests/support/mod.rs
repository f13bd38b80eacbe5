//! In-process stub collaborators for engine scenario tests

use anyhow::{anyhow, bail};
use camino::{Utf8Path, Utf8PathBuf};
use envy::{
    BuildLog, CanonicalKey, PackageCfg, PackageScript, ScriptContext, ScriptHost, SourceFetcher,
    TransientNetworkError,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

/// Shared, ordered record of interesting moments across packages.
#[derive(Debug, Default)]
pub struct EventLog {
    events: Mutex<Vec<String>>,
}

impl EventLog {
    pub fn push(&self, event: impl Into<String>) {
        self.events.lock().push(event.into());
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    /// Index of the first event equal to `needle`.
    pub fn position(&self, needle: &str) -> Option<usize> {
        self.events.lock().iter().position(|e| e == needle)
    }
}

fn copy_dir(src: &Utf8Path, dest: &Utf8Path) -> std::io::Result<()> {
    fs::create_dir_all(dest)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dest.as_std_path().join(entry.file_name());
        if entry.file_type()?.is_dir() {
            let sub = Utf8PathBuf::from_path_buf(entry.path()).expect("utf-8 test paths");
            let sub_dest = Utf8PathBuf::from_path_buf(target).expect("utf-8 test paths");
            copy_dir(&sub, &sub_dest)?;
        } else {
            fs::copy(entry.path(), target)?;
        }
    }
    Ok(())
}

/// Configurable package script used by scenario tests.
#[derive(Default)]
pub struct TestScript {
    /// Short name used as the event prefix (`<name>.stage` etc.).
    pub name: String,
    pub deps: Vec<Value>,
    pub products: HashMap<String, String>,
    pub log: Option<Arc<EventLog>>,
    pub fail_build: bool,
    /// Paths of resolved dependencies observed during build, by key.
    pub seen_deps: Mutex<HashMap<String, Utf8PathBuf>>,
}

impl TestScript {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    fn event(&self, phase: &str) {
        if let Some(log) = &self.log {
            log.push(format!("{}.{phase}", self.name));
        }
    }
}

impl PackageScript for TestScript {
    fn dependencies(&self) -> anyhow::Result<Vec<Value>> {
        Ok(self.deps.clone())
    }

    fn fetch(&self, ctx: &ScriptContext<'_>) -> anyhow::Result<()> {
        self.event("fetch");
        fs::write(ctx.fetch_dir.join("payload.txt"), self.name.as_bytes())?;
        Ok(())
    }

    fn stage(&self, ctx: &ScriptContext<'_>) -> anyhow::Result<()> {
        self.event("stage");
        copy_dir(ctx.fetch_dir, ctx.stage_dir)?;
        Ok(())
    }

    fn build(&self, ctx: &ScriptContext<'_>) -> anyhow::Result<()> {
        self.event("build");
        if self.fail_build {
            bail!("synthetic build failure (exit code 2)");
        }
        let mut seen = self.seen_deps.lock();
        for (key, asset) in ctx.dependencies {
            seen.insert(key.clone(), asset.path.clone());
        }
        copy_dir(ctx.stage_dir, ctx.install_dir)?;
        Ok(())
    }

    fn products(&self) -> HashMap<String, String> {
        self.products.clone()
    }
}

/// Script host serving registered scripts by package identity.
#[derive(Default)]
pub struct StubHost {
    scripts: Mutex<HashMap<String, Arc<TestScript>>>,
    recipe_files: Mutex<HashMap<String, Vec<(String, Vec<u8>)>>>,
}

impl StubHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, identity: &str, script: Arc<TestScript>) {
        self.scripts.lock().insert(identity.to_string(), script);
    }

    /// Files produced by the user-supplied recipe fetch of a
    /// `fetch_function` package.
    pub fn register_recipe_files(&self, identity: &str, files: Vec<(String, Vec<u8>)>) {
        self.recipe_files
            .lock()
            .insert(identity.to_string(), files);
    }
}

impl ScriptHost for StubHost {
    fn fetch_recipe(&self, cfg: &PackageCfg, dest: &Utf8Path) -> anyhow::Result<()> {
        let files = self
            .recipe_files
            .lock()
            .get(&cfg.identity)
            .cloned()
            .ok_or_else(|| anyhow!("no recipe registered for '{}'", cfg.identity))?;
        for (name, bytes) in files {
            fs::write(dest.join(name), bytes)?;
        }
        Ok(())
    }

    fn load(
        &self,
        cfg: &PackageCfg,
        _spec_file: &Utf8Path,
    ) -> anyhow::Result<Arc<dyn PackageScript>> {
        let script = self.scripts.lock().get(&cfg.identity).cloned();
        Ok(match script {
            Some(script) => script,
            None => Arc::new(TestScript::named(&cfg.identity)),
        })
    }
}

/// In-memory source fetcher with optional injected transient failures.
#[derive(Default)]
pub struct StubFetcher {
    remotes: Mutex<HashMap<String, Vec<u8>>>,
    transient_failures: Mutex<HashMap<String, u32>>,
    pub events: Arc<EventLog>,
    calls: AtomicU32,
}

impl StubFetcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn serve(&self, url: &str, bytes: &[u8]) {
        self.remotes.lock().insert(url.to_string(), bytes.to_vec());
    }

    /// Fail the next `count` downloads of `url` with a transient error.
    pub fn fail_transiently(&self, url: &str, count: u32) {
        self.transient_failures
            .lock()
            .insert(url.to_string(), count);
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl SourceFetcher for StubFetcher {
    fn fetch_remote(&self, url: &str, dest: &Utf8Path) -> anyhow::Result<Utf8PathBuf> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        {
            let mut failures = self.transient_failures.lock();
            if let Some(remaining) = failures.get_mut(url) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(TransientNetworkError(format!("timeout fetching {url}")).into());
                }
            }
        }

        let bytes = self
            .remotes
            .lock()
            .get(url)
            .cloned()
            .ok_or_else(|| anyhow!("404 not found: {url}"))?;
        let name = url.rsplit('/').next().unwrap_or("download");
        let path = dest.join(name);
        fs::write(&path, bytes)?;
        self.events.push(format!("fetch:{url}"));
        Ok(path)
    }

    fn fetch_git(&self, url: &str, git_ref: &str, dest: &Utf8Path) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        fs::write(dest.join("checkout.txt"), format!("{url}@{git_ref}"))?;
        self.events.push(format!("git:{url}@{git_ref}"));
        Ok(())
    }
}

/// Log collaborator that captures build output and failure blocks.
#[derive(Debug, Default)]
pub struct CollectLog {
    pub lines: Mutex<Vec<String>>,
    pub blocks: Mutex<Vec<String>>,
}

impl CollectLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl BuildLog for CollectLog {
    fn line(&self, key: &CanonicalKey, line: &str) {
        self.lines.lock().push(format!("{key}: {line}"));
    }

    fn error_block(&self, block: &str) {
        self.blocks.lock().push(block.to_string());
    }
}
