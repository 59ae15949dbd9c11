use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use engine::{Engine, RuntimeConfig, Services};
use platform_server::{ProcessRuntimeFactory, ServerFetcher, ZipDecoder};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

pub mod batch;
pub mod install;
pub mod run;
pub mod stats;

const LONG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    "\ngit_sha: ",
    env!("PHPW_GIT_SHA"),
    "\ntarget: ",
    env!("PHPW_TARGET"),
);

#[derive(Debug, Parser)]
#[command(
    name = "phpw",
    version,
    long_version = LONG_VERSION,
    about = "run PHP scripts on a pool of execution units"
)]
pub struct Cli {
    #[command(flatten)]
    pub options: Options,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Install the application archive into the document root
    Install,
    /// Run a script from the document root (default: the configured entry)
    Run { path: Option<String> },
    /// Run PHP source given on the command line
    Eval { code: String },
    /// Run JSON-lines requests from a file, one result line per request
    Batch { file: PathBuf },
    /// Start the pool and print its state
    Stats,
}

#[derive(Debug, Args)]
pub struct Options {
    /// Application directory holding phpw.json, the runtime image and the archive
    #[arg(long, global = true, default_value = ".")]
    pub dir: PathBuf,
    /// Where the archive is unpacked (default: <dir>/.phpw/www)
    #[arg(long, global = true)]
    pub doc_root: Option<PathBuf>,
    /// Number of execution units
    #[arg(long, global = true)]
    pub units: Option<usize>,
    /// Capture stderr and log per-request detail
    #[arg(long, global = true)]
    pub debug: bool,
    /// Runtime image location (path or url)
    #[arg(long, global = true)]
    pub image: Option<String>,
    /// Application archive location (path or url)
    #[arg(long, global = true)]
    pub archive: Option<String>,
    /// Entry script for `run` without a path
    #[arg(long, global = true)]
    pub entry: Option<String>,
    /// PHP source run once on every unit at start-up
    #[arg(long, global = true)]
    pub warm_up: Option<String>,
}

impl Options {
    fn overrides(&self) -> RuntimeConfig {
        RuntimeConfig {
            units: self.units,
            debug: self.debug.then_some(true),
            doc_root: self
                .doc_root
                .as_ref()
                .map(|path| path.to_string_lossy().into_owned()),
            entry: self.entry.clone(),
            image: self.image.clone(),
            archive: self.archive.clone(),
            warm_up: self.warm_up.clone(),
        }
    }

    pub fn config(&self) -> RuntimeConfig {
        self.config_with(RuntimeConfig::from_env())
    }

    /// `phpw.json`, then `env`, then flags. The document root always ends
    /// up absolute.
    pub fn config_with(&self, env: RuntimeConfig) -> RuntimeConfig {
        let mut config = RuntimeConfig::load(&self.dir)
            .merge(env)
            .merge(self.overrides());
        config.doc_root = Some(resolve_doc_root(&self.dir, config.doc_root.as_deref()));
        config
    }

    pub fn services(&self) -> Services {
        Services {
            runtime: Arc::new(ProcessRuntimeFactory::new()),
            fetcher: Arc::new(ServerFetcher::new(&self.dir)),
            archive: Arc::new(ZipDecoder),
        }
    }

    pub fn engine(&self) -> Result<Engine> {
        let config = self.config();
        tracing::debug!("runtime config: {:?}", config);
        Ok(Engine::new(&config, self.services())?)
    }
}

fn resolve_doc_root(dir: &Path, configured: Option<&str>) -> String {
    let path = match configured {
        Some(path) if Path::new(path).is_absolute() => PathBuf::from(path),
        Some(path) => dir.join(path),
        None => dir.join(".phpw").join("www"),
    };
    std::path::absolute(&path)
        .unwrap_or(path)
        .to_string_lossy()
        .into_owned()
}

pub fn init_tracing(debug: bool) {
    let fallback = if debug { "debug" } else { "warn" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_env("PHPW_LOG").unwrap_or_else(|_| EnvFilter::new(fallback)))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Run the parsed command and return the process exit code.
pub fn execute(cli: Cli) -> i32 {
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("error: failed to start async runtime: {err}");
            return 1;
        }
    };

    let result = runtime.block_on(async {
        let engine = cli.options.engine()?;
        match cli.command {
            Command::Install => install::cmd(&engine).await,
            Command::Run { path } => run::cmd(&engine, path).await,
            Command::Eval { code } => run::eval(&engine, code).await,
            Command::Batch { file } => batch::cmd(&engine, &file).await,
            Command::Stats => stats::cmd(&engine).await,
        }
    });

    match result {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["phpw", "run", "admin.php", "--units", "3", "--debug"])
            .expect("parse");
        assert!(matches!(cli.command, Command::Run { path: Some(ref path) } if path == "admin.php"));
        assert_eq!(cli.options.units, Some(3));
        assert!(cli.options.debug);

        let cli = Cli::try_parse_from(["phpw", "eval", "<?php echo 1;"]).expect("parse");
        assert!(matches!(cli.command, Command::Eval { ref code } if code == "<?php echo 1;"));
        assert!(Cli::try_parse_from(["phpw", "serve"]).is_err());
    }

    #[test]
    fn test_doc_root_resolves_against_app_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join("phpw.json"),
            r#"{ "docRoot": "public", "units": 2 }"#,
        )
        .unwrap();
        let cli = Cli::try_parse_from([
            "phpw",
            "stats",
            "--dir",
            dir.path().to_str().unwrap(),
            "--entry",
            "main.php",
        ])
        .expect("parse");

        let config = cli.options.config_with(RuntimeConfig::default());
        let doc_root = PathBuf::from(config.doc_root.clone().unwrap());
        assert!(doc_root.is_absolute());
        assert!(doc_root.ends_with("public"));
        assert_eq!(config.units, Some(2));
        assert_eq!(config.entry(), "main.php");
    }

    #[test]
    fn test_default_doc_root_is_private_to_app_dir() {
        let resolved = resolve_doc_root(Path::new("/srv/app"), None);
        assert_eq!(resolved, "/srv/app/.phpw/www");
        assert_eq!(resolve_doc_root(Path::new("/srv/app"), Some("/var/www")), "/var/www");
    }
}
