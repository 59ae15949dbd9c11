use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use platform::{
    Interpreter, MountOptions, OutputEvent, OutputSender, RuntimeFactory, RuntimeFs,
};
use std::io::Write;
use std::process::Stdio;
use std::sync::Arc;
use tempfile::TempPath;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;

use crate::fs::DirFs;

const DEFAULT_ARGS: [&str; 4] = ["-d", "display_errors=stdout", "-d", "html_errors=0"];

/// Treats the runtime image as a PHP CLI executable. Every instance writes its
/// own copy of the image to a private temp file.
pub struct ProcessRuntimeFactory {
    args: Vec<String>,
}

impl ProcessRuntimeFactory {
    pub fn new() -> Self {
        Self::with_args(DEFAULT_ARGS.iter().map(|arg| arg.to_string()).collect())
    }

    /// Arguments passed to the executable before the script arrives on stdin.
    pub fn with_args(args: Vec<String>) -> Self {
        Self { args }
    }
}

impl Default for ProcessRuntimeFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl RuntimeFactory for ProcessRuntimeFactory {
    fn instantiate(&self, image: Vec<u8>, mount: &MountOptions) -> Result<Box<dyn Interpreter>> {
        if image.is_empty() {
            bail!("runtime image is empty");
        }
        let mut file = tempfile::Builder::new()
            .prefix("phpw-runtime-")
            .tempfile()
            .context("failed to create runtime file")?;
        file.write_all(&image).context("failed to write runtime image")?;
        file.flush().context("failed to write runtime image")?;
        let executable = file.into_temp_path();

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&executable, std::fs::Permissions::from_mode(0o755))
                .context("failed to mark runtime executable")?;
        }

        Ok(Box::new(ProcessInterpreter {
            executable,
            args: self.args.clone(),
            fs: Arc::new(DirFs::new(&mount.mount_path)),
        }))
    }
}

pub struct ProcessInterpreter {
    executable: TempPath,
    args: Vec<String>,
    fs: Arc<DirFs>,
}

#[async_trait(?Send)]
impl Interpreter for ProcessInterpreter {
    fn fs(&self) -> Arc<dyn RuntimeFs> {
        self.fs.clone()
    }

    /// Every run is a fresh process, so there is no state to reset.
    async fn refresh(&mut self) -> Result<()> {
        Ok(())
    }

    async fn run(&mut self, source: &str, output: OutputSender) -> Result<()> {
        let mut child = Command::new(&*self.executable)
            .args(&self.args)
            .current_dir(self.fs.root())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .context("failed to start runtime process")?;

        let mut stdin = child.stdin.take().context("runtime stdin unavailable")?;
        let stdout = child.stdout.take().context("runtime stdout unavailable")?;
        let stderr = child.stderr.take().context("runtime stderr unavailable")?;

        let feed = async move {
            let written = stdin.write_all(source.as_bytes()).await;
            drop(stdin);
            match written {
                // The script may exit before reading all of its input.
                Err(err) if err.kind() == std::io::ErrorKind::BrokenPipe => Ok(()),
                other => other,
            }
        };
        let (fed, out, err) = tokio::join!(
            feed,
            pump(stdout, output.clone(), OutputEvent::Stdout),
            pump(stderr, output, OutputEvent::Stderr),
        );
        fed.context("failed to send script to runtime")?;
        out.context("failed to read runtime stdout")?;
        err.context("failed to read runtime stderr")?;

        let status = child.wait().await.context("runtime process lost")?;
        if !status.success() {
            bail!("runtime exited with {}", status);
        }
        Ok(())
    }
}

/// Reads `reader` to the end and emits it as one event. Pipe reads split
/// output at arbitrary points, including inside multi-byte characters.
async fn pump<R>(
    mut reader: R,
    output: OutputSender,
    wrap: fn(Vec<u8>) -> OutputEvent,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut bytes = Vec::new();
    reader.read_to_end(&mut bytes).await?;
    if !bytes.is_empty() {
        // A dropped receiver only means nobody is listening anymore.
        let _ = output.send(wrap(bytes));
    }
    Ok(())
}
