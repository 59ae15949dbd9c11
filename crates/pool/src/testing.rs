//! In-process fakes for the runtime boundary. They let the pool, the
//! installer, and the engine be exercised without a PHP binary or network.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use platform::{
    ArchiveDecoder, ArchiveEntry, FetchResponse, Fetcher, FileStat, Interpreter, MountOptions,
    OutputEvent, OutputSender, RuntimeFactory, RuntimeFs,
};
use tokio::sync::watch;

use crate::services::Services;

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ========== Gate ==========

/// A one-shot latch shared across threads and runtimes.
#[derive(Clone)]
pub struct Gate {
    tx: Arc<watch::Sender<bool>>,
}

impl Gate {
    pub fn new() -> Self {
        Self {
            tx: Arc::new(watch::Sender::new(false)),
        }
    }

    pub fn open(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_open(&self) -> bool {
        *self.tx.borrow()
    }

    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|open| *open).await;
    }
}

impl Default for Gate {
    fn default() -> Self {
        Self::new()
    }
}

// ========== Fetcher ==========

enum Served {
    Body(Vec<u8>),
    Status(u16, String),
    NetworkError(String),
}

/// Serves canned responses by url and counts requests. Unknown urls get 404.
#[derive(Default)]
pub struct FakeFetcher {
    served: Mutex<HashMap<String, Served>>,
    calls: Mutex<HashMap<String, usize>>,
    held: Mutex<HashMap<String, Gate>>,
}

impl FakeFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn serve(&self, url: &str, body: Vec<u8>) {
        guard(&self.served).insert(url.to_string(), Served::Body(body));
    }

    pub fn serve_status(&self, url: &str, status: u16, status_text: &str) {
        guard(&self.served).insert(
            url.to_string(),
            Served::Status(status, status_text.to_string()),
        );
    }

    pub fn fail(&self, url: &str, message: &str) {
        guard(&self.served).insert(url.to_string(), Served::NetworkError(message.to_string()));
    }

    /// Responses for `url` wait until the returned gate opens.
    pub fn hold(&self, url: &str) -> Gate {
        let gate = Gate::new();
        guard(&self.held).insert(url.to_string(), gate.clone());
        gate
    }

    pub fn calls(&self, url: &str) -> usize {
        guard(&self.calls).get(url).copied().unwrap_or(0)
    }
}

#[async_trait]
impl Fetcher for FakeFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchResponse> {
        *guard(&self.calls).entry(url.to_string()).or_default() += 1;
        let held = guard(&self.held).get(url).cloned();
        if let Some(gate) = held {
            gate.wait().await;
        }
        match guard(&self.served).get(url) {
            Some(Served::Body(body)) => Ok(FetchResponse::ok(body.clone())),
            Some(Served::Status(status, text)) => Ok(FetchResponse {
                status: *status,
                status_text: text.clone(),
                body: Vec::new(),
            }),
            Some(Served::NetworkError(message)) => Err(anyhow!("{message}")),
            None => Ok(FetchResponse {
                status: 404,
                status_text: "Not Found".to_string(),
                body: Vec::new(),
            }),
        }
    }
}

// ========== Archive ==========

/// Decodes a text archive: one `path=content` entry per line, `\n` escapes
/// newlines in content, and `dir/=` denotes a directory.
pub struct FakeDecoder;

impl FakeDecoder {
    pub fn encode(entries: &[(&str, &str)]) -> Vec<u8> {
        entries
            .iter()
            .map(|(path, content)| format!("{path}={}", content.replace('\n', "\\n")))
            .collect::<Vec<_>>()
            .join("\n")
            .into_bytes()
    }
}

impl ArchiveDecoder for FakeDecoder {
    fn decode(&self, bytes: &[u8]) -> Result<Vec<ArchiveEntry>> {
        let text = std::str::from_utf8(bytes).map_err(|_| anyhow!("not a text archive"))?;
        let mut entries = Vec::new();
        for line in text.lines().filter(|line| !line.is_empty()) {
            let Some((path, content)) = line.split_once('=') else {
                bail!("corrupt archive entry: {line}");
            };
            entries.push(ArchiveEntry::file(path, content.replace("\\n", "\n")));
        }
        Ok(entries)
    }
}

// ========== Filesystem ==========

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemNode {
    Dir,
    File(Vec<u8>),
}

/// Durable backing shared by every `MemFs` built on it, standing in for the
/// persistent storage behind a mount.
pub type DurableStore = Arc<Mutex<HashMap<String, MemNode>>>;

/// In-memory mount. Writes stay in memory until `syncfs(false)`;
/// `syncfs(true)` reloads from the durable store.
pub struct MemFs {
    live: Mutex<HashMap<String, MemNode>>,
    durable: DurableStore,
    fail_writes: Mutex<Option<String>>,
    syncs: AtomicUsize,
}

impl MemFs {
    pub fn new() -> Self {
        Self::with_store(Self::durable_store())
    }

    pub fn durable_store() -> DurableStore {
        Arc::new(Mutex::new(HashMap::new()))
    }

    pub fn with_store(durable: DurableStore) -> Self {
        Self {
            live: Mutex::new(HashMap::new()),
            durable,
            fail_writes: Mutex::new(None),
            syncs: AtomicUsize::new(0),
        }
    }

    /// Make every subsequent `write_file` fail with `message`.
    pub fn fail_writes(&self, message: &str) {
        *guard(&self.fail_writes) = Some(message.to_string());
    }

    pub fn read(&self, path: &str) -> Option<Vec<u8>> {
        match guard(&self.live).get(path) {
            Some(MemNode::File(bytes)) => Some(bytes.clone()),
            _ => None,
        }
    }

    pub fn syncs(&self) -> usize {
        self.syncs.load(Ordering::Relaxed)
    }

    fn is_dir(live: &HashMap<String, MemNode>, path: &str) -> bool {
        path == "/" || matches!(live.get(path), Some(MemNode::Dir))
    }
}

impl Default for MemFs {
    fn default() -> Self {
        Self::new()
    }
}

fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(index) => &path[..index],
    }
}

#[async_trait]
impl RuntimeFs for MemFs {
    fn stat(&self, path: &str) -> Result<FileStat> {
        let live = guard(&self.live);
        if path == "/" {
            return Ok(FileStat { is_dir: true, size: 0 });
        }
        match live.get(path.trim_end_matches('/')) {
            Some(MemNode::Dir) => Ok(FileStat { is_dir: true, size: 0 }),
            Some(MemNode::File(bytes)) => Ok(FileStat {
                is_dir: false,
                size: bytes.len() as u64,
            }),
            None => bail!("ENOENT: {path}"),
        }
    }

    fn mkdir(&self, path: &str) -> Result<()> {
        let path = path.trim_end_matches('/');
        let mut live = guard(&self.live);
        if live.contains_key(path) {
            bail!("EEXIST: {path}");
        }
        if !Self::is_dir(&live, parent_of(path)) {
            bail!("ENOENT: {}", parent_of(path));
        }
        live.insert(path.to_string(), MemNode::Dir);
        Ok(())
    }

    fn mkdir_tree(&self, path: &str) -> Result<()> {
        let mut live = guard(&self.live);
        let mut current = String::new();
        for segment in path.split('/').filter(|segment| !segment.is_empty()) {
            current.push('/');
            current.push_str(segment);
            match live.get(&current) {
                Some(MemNode::File(_)) => bail!("ENOTDIR: {current}"),
                Some(MemNode::Dir) => {}
                None => {
                    live.insert(current.clone(), MemNode::Dir);
                }
            }
        }
        Ok(())
    }

    fn write_file(&self, path: &str, bytes: &[u8]) -> Result<()> {
        if let Some(message) = guard(&self.fail_writes).clone() {
            bail!("{message}");
        }
        let mut live = guard(&self.live);
        if !Self::is_dir(&live, parent_of(path)) {
            bail!("ENOENT: {}", parent_of(path));
        }
        live.insert(path.to_string(), MemNode::File(bytes.to_vec()));
        Ok(())
    }

    async fn syncfs(&self, populate: bool) -> Result<()> {
        self.syncs.fetch_add(1, Ordering::Relaxed);
        if populate {
            let durable = guard(&self.durable).clone();
            guard(&self.live).extend(durable);
        } else {
            let live = guard(&self.live).clone();
            guard(&self.durable).extend(live);
        }
        Ok(())
    }
}

// ========== Runtime ==========

/// Observations shared by every interpreter a `FakeRuntimeFactory` creates.
#[derive(Default)]
pub struct RuntimeProbe {
    instances: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
    images: Mutex<Vec<Vec<u8>>>,
    runs: Mutex<Vec<String>>,
    gates: Mutex<HashMap<String, Gate>>,
}

impl RuntimeProbe {
    pub fn instances(&self) -> usize {
        self.instances.load(Ordering::SeqCst)
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Highest number of scripts observed running at once.
    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    pub fn images(&self) -> Vec<Vec<u8>> {
        guard(&self.images).clone()
    }

    /// Sources in the order their runs started.
    pub fn runs(&self) -> Vec<String> {
        guard(&self.runs).clone()
    }

    /// Named gate used by `wait 'name'` statements.
    pub fn gate(&self, name: &str) -> Gate {
        guard(&self.gates)
            .entry(name.to_string())
            .or_default()
            .clone()
    }
}

/// Builds scripted interpreters over `MemFs` mounts sharing one durable
/// store.
///
/// The fake understands one statement per line: `echo 'text'`,
/// `stderr 'text'`, `sleep 'ms'`, `wait 'gate'`, `fail 'message'` and
/// `require 'path'`. `<?php`, `error_reporting(..)` and `ini_set(..)` lines
/// are ignored; anything else is a parse error.
pub struct FakeRuntimeFactory {
    durable: DurableStore,
    probe: Arc<RuntimeProbe>,
    reject_images: Mutex<Option<String>>,
}

impl FakeRuntimeFactory {
    pub fn new(durable: DurableStore) -> Self {
        Self {
            durable,
            probe: Arc::new(RuntimeProbe::default()),
            reject_images: Mutex::new(None),
        }
    }

    pub fn probe(&self) -> Arc<RuntimeProbe> {
        Arc::clone(&self.probe)
    }

    /// Make every subsequent instantiation fail with `message`.
    pub fn reject_images(&self, message: &str) {
        *guard(&self.reject_images) = Some(message.to_string());
    }
}

impl RuntimeFactory for FakeRuntimeFactory {
    fn instantiate(&self, image: Vec<u8>, _mount: &MountOptions) -> Result<Box<dyn Interpreter>> {
        if let Some(message) = guard(&self.reject_images).clone() {
            bail!("{message}");
        }
        self.probe.instances.fetch_add(1, Ordering::SeqCst);
        guard(&self.probe.images).push(image);
        Ok(Box::new(FakeInterpreter {
            fs: Arc::new(MemFs::with_store(Arc::clone(&self.durable))),
            probe: Arc::clone(&self.probe),
            refreshes: 0,
        }))
    }
}

struct FakeInterpreter {
    fs: Arc<MemFs>,
    probe: Arc<RuntimeProbe>,
    refreshes: usize,
}

struct ActiveRun<'a>(&'a RuntimeProbe);

impl<'a> ActiveRun<'a> {
    fn enter(probe: &'a RuntimeProbe) -> Self {
        let now = probe.active.fetch_add(1, Ordering::SeqCst) + 1;
        probe.max_active.fetch_max(now, Ordering::SeqCst);
        Self(probe)
    }
}

impl Drop for ActiveRun<'_> {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

fn quoted(argument: &str) -> Result<String> {
    let argument = argument.trim();
    let inner = argument
        .strip_prefix('\'')
        .and_then(|rest| rest.strip_suffix('\''))
        .ok_or_else(|| anyhow!("PHP Parse error: expected quoted string, got {argument}"))?;
    Ok(inner.replace("\\'", "'").replace("\\\\", "\\"))
}

impl FakeInterpreter {
    async fn execute(&self, source: &str, output: &OutputSender, depth: usize) -> Result<()> {
        if depth > 8 {
            bail!("PHP Fatal error: require nesting too deep");
        }
        for line in source.lines() {
            let statement = line.trim().trim_end_matches(';').trim();
            if statement.is_empty()
                || statement == "<?php"
                || statement == "?>"
                || statement.starts_with("error_reporting(")
                || statement.starts_with("ini_set(")
            {
                continue;
            }
            let (command, argument) = statement.split_once(' ').unwrap_or((statement, ""));
            match command {
                "echo" => {
                    let _ = output.send(OutputEvent::Stdout(quoted(argument)?.into_bytes()));
                }
                "stderr" => {
                    let _ = output.send(OutputEvent::Stderr(quoted(argument)?.into_bytes()));
                }
                "sleep" => {
                    let millis: u64 = quoted(argument)?.parse()?;
                    tokio::time::sleep(Duration::from_millis(millis)).await;
                }
                "wait" => self.probe.gate(&quoted(argument)?).wait().await,
                "fail" => bail!("{}", quoted(argument)?),
                "require" => {
                    let path = quoted(argument)?;
                    let script = self.fs.read(&path).ok_or_else(|| {
                        anyhow!("PHP Fatal error: Failed opening required '{path}'")
                    })?;
                    let script = String::from_utf8_lossy(&script).into_owned();
                    Box::pin(self.execute(&script, output, depth + 1)).await?;
                }
                other => bail!("PHP Parse error: unexpected '{other}'"),
            }
        }
        Ok(())
    }
}

#[async_trait(?Send)]
impl Interpreter for FakeInterpreter {
    fn fs(&self) -> Arc<dyn RuntimeFs> {
        self.fs.clone()
    }

    async fn refresh(&mut self) -> Result<()> {
        self.refreshes += 1;
        Ok(())
    }

    async fn run(&mut self, source: &str, output: OutputSender) -> Result<()> {
        guard(&self.probe.runs).push(source.to_string());
        let _active = ActiveRun::enter(&self.probe);
        self.execute(source, &output, 0).await
    }
}

// ========== Assembled ==========

/// A fake world: shared durable storage, fetcher, and runtime factory.
pub struct FakeWorld {
    pub durable: DurableStore,
    pub fetcher: Arc<FakeFetcher>,
    pub runtime: Arc<FakeRuntimeFactory>,
}

impl FakeWorld {
    pub const IMAGE_URL: &'static str = "php.wasm";
    pub const ARCHIVE_URL: &'static str = "www.zip";

    /// Serves an image and the given archive entries at the default urls.
    pub fn new(archive: &[(&str, &str)]) -> Self {
        let durable = MemFs::durable_store();
        let fetcher = Arc::new(FakeFetcher::new());
        fetcher.serve(Self::IMAGE_URL, b"\0asm fake runtime".to_vec());
        fetcher.serve(Self::ARCHIVE_URL, FakeDecoder::encode(archive));
        let runtime = Arc::new(FakeRuntimeFactory::new(Arc::clone(&durable)));
        Self {
            durable,
            fetcher,
            runtime,
        }
    }

    pub fn services(&self) -> Services {
        Services {
            runtime: self.runtime.clone(),
            fetcher: self.fetcher.clone(),
            archive: Arc::new(FakeDecoder),
        }
    }

    pub fn probe(&self) -> Arc<RuntimeProbe> {
        self.runtime.probe()
    }

    pub fn is_persisted(&self, path: &str) -> bool {
        guard(&self.durable).contains_key(path)
    }
}
