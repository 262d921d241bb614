use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::{Duration, Instant};

use scad_mesh::MeshFormat;
use tokio::process::Command;
use uuid::Uuid;

pub mod workspace;

pub use workspace::{RequestWorkspace, sweep_work_dir};

pub const DEFAULT_PROGRAM: &str = "openscad";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);
const VERSION_TIMEOUT: Duration = Duration::from_secs(15);
const NO_DIAGNOSTIC: &str = "<no diagnostic output>";

#[derive(Debug, Clone)]
pub struct CompilerConfig {
    pub program: PathBuf,
    pub work_dir: PathBuf,
    pub format: MeshFormat,
    pub timeout: Duration,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from(DEFAULT_PROGRAM),
            work_dir: default_work_dir(),
            format: MeshFormat::default(),
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

pub fn default_work_dir() -> PathBuf {
    std::env::temp_dir().join("scad-designer")
}

#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    #[error("OpenSCAD failed with exit code {}: {diagnostic}", exit_label(.exit_code))]
    CompilerFailure {
        exit_code: Option<i32>,
        diagnostic: String,
        stdout: String,
        stderr: String,
    },
    #[error("OpenSCAD exited successfully but produced no mesh: {diagnostic}")]
    MissingOutput {
        diagnostic: String,
        stdout: String,
        stderr: String,
    },
    #[error("OpenSCAD did not finish within {limit:?}")]
    Timeout { limit: Duration },
    #[error("compilation was cancelled")]
    Cancelled,
    #[error("could not start compiler '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("{context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: io::Error,
    },
}

fn exit_label(code: &Option<i32>) -> String {
    code.map_or_else(|| "none (terminated by signal)".to_string(), |code| code.to_string())
}

impl CompileError {
    pub fn kind(&self) -> &'static str {
        match self {
            CompileError::CompilerFailure { .. } => "compiler_failure",
            CompileError::MissingOutput { .. } => "missing_output",
            CompileError::Timeout { .. } => "timeout",
            CompileError::Cancelled => "cancelled",
            CompileError::Spawn { .. } => "spawn",
            CompileError::Io { .. } => "io",
        }
    }

    /// Never-empty summary of the compiler's output: stderr, else stdout,
    /// else a placeholder. `None` when the compiler never reported anything.
    pub fn diagnostic(&self) -> Option<&str> {
        match self {
            CompileError::CompilerFailure { diagnostic, .. }
            | CompileError::MissingOutput { diagnostic, .. } => Some(diagnostic),
            _ => None,
        }
    }

    /// Raw (trimmed) stdout and stderr of the compiler run, possibly empty.
    pub fn streams(&self) -> Option<(&str, &str)> {
        match self {
            CompileError::CompilerFailure { stdout, stderr, .. }
            | CompileError::MissingOutput { stdout, stderr, .. } => Some((stdout, stderr)),
            _ => None,
        }
    }

    fn io(context: &'static str) -> impl FnOnce(io::Error) -> Self {
        move |source| CompileError::Io { context, source }
    }
}

/// A mesh produced by one compile request. The file stays on disk until
/// [`CompiledMesh::discard`] (or [`CompiledMesh::discard_blocking`] outside
/// async code) is called.
#[derive(Debug, Clone)]
pub struct CompiledMesh {
    pub id: Uuid,
    pub path: PathBuf,
    pub format: MeshFormat,
    pub bytes: Vec<u8>,
    /// Compiler stderr from a successful run (warnings, render stats).
    pub warnings: String,
    pub elapsed_ms: f64,
    dir: PathBuf,
}

impl CompiledMesh {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn discard(&self) -> io::Result<()> {
        workspace::remove_dir(&self.dir).await
    }

    pub fn discard_blocking(&self) -> io::Result<()> {
        workspace::remove_dir_blocking(&self.dir)
    }
}

#[derive(Debug, Clone)]
pub struct ScadCompiler {
    config: CompilerConfig,
}

impl ScadCompiler {
    pub fn new(config: CompilerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CompilerConfig {
        &self.config
    }

    pub fn format(&self) -> MeshFormat {
        self.config.format
    }

    /// Runs `<program> --version` and returns the reported version line.
    pub async fn version(&self) -> Result<String, CompileError> {
        let child = Command::new(&self.config.program)
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| self.spawn_error(source))?;

        let output = tokio::time::timeout(VERSION_TIMEOUT, child.wait_with_output())
            .await
            .map_err(|_| CompileError::Timeout {
                limit: VERSION_TIMEOUT,
            })?
            .map_err(CompileError::io("waiting for compiler version"))?;

        if !output.status.success() {
            return Err(failure_from_output(&output));
        }

        // OpenSCAD prints its version on stderr.
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let version = [stdout.trim(), stderr.trim()]
            .into_iter()
            .find(|text| !text.is_empty())
            .unwrap_or("unknown version")
            .lines()
            .next()
            .unwrap_or_default()
            .to_string();
        Ok(version)
    }

    pub async fn compile(&self, script: &str) -> Result<CompiledMesh, CompileError> {
        self.compile_until(script, std::future::pending()).await
    }

    /// Compiles `script`, giving up with [`CompileError::Cancelled`] as soon
    /// as `cancel` resolves. The child process is killed on timeout and on
    /// cancellation, and the request workspace is removed on every failure.
    pub async fn compile_until<F>(&self, script: &str, cancel: F) -> Result<CompiledMesh, CompileError>
    where
        F: Future<Output = ()>,
    {
        let workspace = RequestWorkspace::create(&self.config.work_dir)
            .await
            .map_err(CompileError::io("creating compile workspace"))?;

        let result = self.run(&workspace, script, cancel).await;
        if let Err(err) = &result {
            tracing::warn!(workspace = %workspace.id(), kind = err.kind(), "compilation failed");
            if let Err(cleanup) = workspace.remove().await {
                tracing::warn!(dir = %workspace.dir().display(), "failed to remove workspace: {cleanup}");
            }
        }
        result
    }

    async fn run<F>(
        &self,
        workspace: &RequestWorkspace,
        script: &str,
        cancel: F,
    ) -> Result<CompiledMesh, CompileError>
    where
        F: Future<Output = ()>,
    {
        let format = self.config.format;
        let script_path = workspace
            .write_script(script)
            .await
            .map_err(CompileError::io("writing OpenSCAD script"))?;
        let output_path = workspace.output_path(format);

        tracing::info!(
            workspace = %workspace.id(),
            %format,
            program = %self.config.program.display(),
            "compiling OpenSCAD script"
        );
        let start = Instant::now();

        let child = Command::new(&self.config.program)
            .arg("-o")
            .arg(&output_path)
            .arg("--export-format")
            .arg(format.export_flag())
            .arg(&script_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| self.spawn_error(source))?;

        let limit = self.config.timeout;
        let output = tokio::select! {
            waited = tokio::time::timeout(limit, child.wait_with_output()) => match waited {
                Ok(output) => output.map_err(CompileError::io("waiting for OpenSCAD"))?,
                Err(_) => return Err(CompileError::Timeout { limit }),
            },
            () = cancel => return Err(CompileError::Cancelled),
        };
        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;

        if !output.status.success() {
            return Err(failure_from_output(&output));
        }

        let warnings = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let bytes = match tokio::fs::read(&output_path).await {
            Ok(bytes) if !bytes.is_empty() => bytes,
            Ok(_) | Err(_) => {
                let (stdout, stderr) = captured_streams(&output);
                return Err(CompileError::MissingOutput {
                    diagnostic: diagnostic_text(&stdout, &stderr),
                    stdout,
                    stderr,
                });
            }
        };

        if !format.matches_marker(&bytes) {
            tracing::warn!(%format, len = bytes.len(), "mesh does not carry the expected format marker");
        }

        workspace
            .remove_script()
            .await
            .map_err(CompileError::io("removing OpenSCAD script"))?;
        tracing::info!(workspace = %workspace.id(), bytes = bytes.len(), elapsed_ms, "mesh ready");

        Ok(CompiledMesh {
            id: workspace.id(),
            path: output_path,
            format,
            bytes,
            warnings,
            elapsed_ms,
            dir: workspace.dir().to_path_buf(),
        })
    }

    fn spawn_error(&self, source: io::Error) -> CompileError {
        CompileError::Spawn {
            program: self.config.program.display().to_string(),
            source,
        }
    }
}

fn failure_from_output(output: &Output) -> CompileError {
    let (stdout, stderr) = captured_streams(output);
    CompileError::CompilerFailure {
        exit_code: output.status.code(),
        diagnostic: diagnostic_text(&stdout, &stderr),
        stdout,
        stderr,
    }
}

fn captured_streams(output: &Output) -> (String, String) {
    (
        String::from_utf8_lossy(&output.stdout).trim().to_string(),
        String::from_utf8_lossy(&output.stderr).trim().to_string(),
    )
}

/// stderr, else stdout, else a placeholder; never empty.
fn diagnostic_text(stdout: &str, stderr: &str) -> String {
    [stderr, stdout]
        .into_iter()
        .find(|text| !text.is_empty())
        .unwrap_or(NO_DIAGNOSTIC)
        .to_string()
}

#[cfg(all(test, unix))]
mod tests {
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};
    use std::time::Duration;

    use scad_mesh::{MeshFormat, detect_format};
    use tempfile::TempDir;

    use super::{CompileError, CompilerConfig, ScadCompiler};

    const ASCII_TRIANGLE: &str = "solid OpenSCAD_Model\n  facet normal 0 0 1\n    outer loop\n      vertex 0 0 0\n      vertex 10 0 0\n      vertex 0 10 0\n    endloop\n  endfacet\nendsolid OpenSCAD_Model\n";

    /// Writes an executable shell script standing in for `openscad`.
    /// Arguments arrive as: -o <out> --export-format <fmt> <script>.
    fn fake_compiler(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("fake-openscad");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write fake compiler");
        let mut permissions = std::fs::metadata(&path).expect("metadata").permissions();
        permissions.set_mode(0o755);
        std::fs::set_permissions(&path, permissions).expect("chmod fake compiler");
        path
    }

    fn compiler(program: PathBuf, work_dir: &Path, format: MeshFormat) -> ScadCompiler {
        ScadCompiler::new(CompilerConfig {
            program,
            work_dir: work_dir.to_path_buf(),
            format,
            timeout: Duration::from_secs(10),
        })
    }

    fn writes_triangle() -> String {
        format!("cat \"$5\" >&2\nprintf '%s' '{ASCII_TRIANGLE}' > \"$2\"")
    }

    fn entries(dir: &Path) -> usize {
        std::fs::read_dir(dir).map(|it| it.count()).unwrap_or(0)
    }

    #[tokio::test]
    async fn successful_compile_returns_mesh_and_drops_script() {
        let bin = TempDir::new().expect("bin dir");
        let work = TempDir::new().expect("work dir");
        let program = fake_compiler(bin.path(), &writes_triangle());
        let compiler = compiler(program, work.path(), MeshFormat::AsciiStl);

        let mesh = compiler.compile("cube(10);").await.expect("compile should succeed");

        assert!(!mesh.is_empty());
        assert_eq!(mesh.format, MeshFormat::AsciiStl);
        assert_eq!(detect_format(&mesh.bytes), Some(MeshFormat::AsciiStl));
        assert!(mesh.path.exists());
        assert!(mesh.path.starts_with(work.path()));
        assert!(!mesh.dir().join("model.scad").exists());
        assert_eq!(mesh.warnings, "cube(10);");

        mesh.discard().await.expect("discard");
        assert!(!mesh.path.exists());
        assert_eq!(entries(work.path()), 0);
    }

    #[tokio::test]
    async fn export_flags_are_passed_to_the_compiler() {
        let bin = TempDir::new().expect("bin dir");
        let work = TempDir::new().expect("work dir");
        let program = fake_compiler(
            bin.path(),
            "printf '%s %s %s' \"$1\" \"$3\" \"$4\" >&2\nprintf 'OFF\\n0 0 0\\n' > \"$2\"",
        );
        let compiler = compiler(program, work.path(), MeshFormat::Off);

        let mesh = compiler.compile("cube(1);").await.expect("compile should succeed");
        assert_eq!(mesh.warnings, "-o --export-format off");
        assert!(mesh.path.ends_with("model.off"));
        assert!(MeshFormat::Off.matches_marker(&mesh.bytes));
    }

    #[tokio::test]
    async fn non_zero_exit_reports_stderr_and_cleans_up() {
        let bin = TempDir::new().expect("bin dir");
        let work = TempDir::new().expect("work dir");
        let program = fake_compiler(
            bin.path(),
            "echo 'Compiling design...'\necho \"ERROR: Parser error in file \\\"$5\\\", line 3: syntax error\" >&2\nexit 1",
        );
        let compiler = compiler(program, work.path(), MeshFormat::BinaryStl);

        let err = compiler
            .compile("module broken() {\n  cube(10);\n")
            .await
            .expect_err("compile should fail");

        match &err {
            CompileError::CompilerFailure {
                exit_code,
                diagnostic,
                stdout,
                stderr,
            } => {
                assert_eq!(*exit_code, Some(1));
                assert!(diagnostic.contains("line 3"), "{diagnostic}");
                assert_eq!(diagnostic, stderr);
                assert_eq!(stdout, "Compiling design...");
            }
            other => panic!("expected compiler failure, got {other:?}"),
        }
        assert_eq!(err.kind(), "compiler_failure");
        assert!(err.to_string().contains("exit code 1"));
        assert_eq!(entries(work.path()), 0);
    }

    #[tokio::test]
    async fn silent_failure_still_has_a_diagnostic() {
        let bin = TempDir::new().expect("bin dir");
        let work = TempDir::new().expect("work dir");
        let program = fake_compiler(bin.path(), "exit 2");
        let compiler = compiler(program, work.path(), MeshFormat::BinaryStl);

        let err = compiler.compile("cube(1);").await.expect_err("exit 2");
        assert!(!err.diagnostic().unwrap_or_default().is_empty());
        assert_eq!(err.streams(), Some(("", "")));
    }

    #[tokio::test]
    async fn stdout_only_failure_keeps_stderr_empty() {
        let bin = TempDir::new().expect("bin dir");
        let work = TempDir::new().expect("work dir");
        let program = fake_compiler(bin.path(), "echo 'ERROR: undefined module foo'\nexit 1");
        let compiler = compiler(program, work.path(), MeshFormat::BinaryStl);

        let err = compiler.compile("foo();").await.expect_err("exit 1");
        assert_eq!(err.diagnostic(), Some("ERROR: undefined module foo"));
        assert_eq!(err.streams(), Some(("ERROR: undefined module foo", "")));
    }

    #[tokio::test]
    async fn zero_exit_without_output_is_missing_output() {
        let bin = TempDir::new().expect("bin dir");
        let work = TempDir::new().expect("work dir");
        let program = fake_compiler(bin.path(), "echo 'WARNING: Current top level object is empty.' >&2");
        let compiler = compiler(program, work.path(), MeshFormat::BinaryStl);

        let err = compiler.compile("// nothing").await.expect_err("no output");
        assert_eq!(err.kind(), "missing_output");
        assert!(err.diagnostic().unwrap_or_default().contains("empty"));
        assert_eq!(
            err.streams(),
            Some(("", "WARNING: Current top level object is empty."))
        );
        assert_eq!(entries(work.path()), 0);
    }

    #[tokio::test]
    async fn slow_compiler_times_out() {
        let bin = TempDir::new().expect("bin dir");
        let work = TempDir::new().expect("work dir");
        let program = fake_compiler(bin.path(), "exec sleep 5");
        let compiler = ScadCompiler::new(CompilerConfig {
            program,
            work_dir: work.path().to_path_buf(),
            format: MeshFormat::BinaryStl,
            timeout: Duration::from_millis(200),
        });

        let err = compiler.compile("cube(1);").await.expect_err("should time out");
        assert!(matches!(err, CompileError::Timeout { .. }), "{err:?}");
        assert_eq!(entries(work.path()), 0);
    }

    #[tokio::test]
    async fn cancellation_stops_the_compile() {
        let bin = TempDir::new().expect("bin dir");
        let work = TempDir::new().expect("work dir");
        let program = fake_compiler(bin.path(), "exec sleep 5");
        let compiler = compiler(program, work.path(), MeshFormat::BinaryStl);

        let err = compiler
            .compile_until("cube(1);", tokio::time::sleep(Duration::from_millis(100)))
            .await
            .expect_err("should be cancelled");
        assert_eq!(err.kind(), "cancelled");
        assert_eq!(entries(work.path()), 0);
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let work = TempDir::new().expect("work dir");
        let compiler = compiler(
            PathBuf::from("/nonexistent/openscad"),
            work.path(),
            MeshFormat::BinaryStl,
        );

        let err = compiler.compile("cube(1);").await.expect_err("no binary");
        assert_eq!(err.kind(), "spawn");
        assert!(compiler.version().await.is_err());
    }

    #[tokio::test]
    async fn concurrent_compiles_use_distinct_files() {
        let bin = TempDir::new().expect("bin dir");
        let work = TempDir::new().expect("work dir");
        let program = fake_compiler(bin.path(), &writes_triangle());
        let compiler = compiler(program, work.path(), MeshFormat::AsciiStl);

        let (a, b) = tokio::join!(compiler.compile("cube(1);"), compiler.compile("sphere(2);"));
        let a = a.expect("first compile");
        let b = b.expect("second compile");

        assert_ne!(a.id, b.id);
        assert_ne!(a.path, b.path);
        assert_eq!(a.warnings, "cube(1);");
        assert_eq!(b.warnings, "sphere(2);");
    }

    #[tokio::test]
    async fn version_is_read_from_stderr() {
        let bin = TempDir::new().expect("bin dir");
        let work = TempDir::new().expect("work dir");
        let program = fake_compiler(bin.path(), "echo 'OpenSCAD version 2021.01' >&2");
        let compiler = compiler(program, work.path(), MeshFormat::BinaryStl);

        let version = compiler.version().await.expect("version");
        assert_eq!(version, "OpenSCAD version 2021.01");
    }

    fn real_openscad(work: &Path, format: MeshFormat) -> Option<ScadCompiler> {
        let available = std::process::Command::new("openscad")
            .arg("--version")
            .output()
            .is_ok_and(|output| output.status.success());
        if !available {
            eprintln!("skipping: openscad is not installed");
            return None;
        }
        Some(ScadCompiler::new(CompilerConfig {
            program: PathBuf::from("openscad"),
            work_dir: work.to_path_buf(),
            format,
            timeout: Duration::from_secs(60),
        }))
    }

    #[tokio::test]
    async fn openscad_renders_a_cube_in_the_requested_format() {
        let work = TempDir::new().expect("work dir");
        let Some(compiler) = real_openscad(work.path(), MeshFormat::BinaryStl) else {
            return;
        };

        let mesh = compiler.compile("cube(10);").await.expect("cube should compile");
        assert!(mesh.len() > 84);
        assert!(MeshFormat::BinaryStl.matches_marker(&mesh.bytes));
    }

    #[tokio::test]
    async fn openscad_syntax_error_mentions_the_line() {
        let work = TempDir::new().expect("work dir");
        let Some(compiler) = real_openscad(work.path(), MeshFormat::BinaryStl) else {
            return;
        };

        let err = compiler
            .compile("module broken() {\n  cube(10);\n")
            .await
            .expect_err("unterminated block should fail");
        assert_eq!(err.kind(), "compiler_failure");
        assert!(
            err.diagnostic().unwrap_or_default().contains("line"),
            "{err}"
        );
    }
}
