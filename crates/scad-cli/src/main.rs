use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Args, Parser, Subcommand};
use scad_ai::openai::{DEFAULT_API_BASE, DEFAULT_MAX_COMPLETION_TOKENS, DEFAULT_MODEL};
use scad_ai::{ApiKey, OpenAiChatModel, OpenAiConfig, ScriptGenerator};
use scad_compiler::{CompiledMesh, CompilerConfig, ScadCompiler, default_work_dir};
use scad_mesh::{MeshFormat, MeshStats, parse_stl};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "scad-cli")]
#[command(version, about = "Generate OpenSCAD scripts from prompts and compile them to meshes")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[command(flatten)]
    shared: SharedArgs,
}

#[derive(Subcommand)]
enum Command {
    /// Ask the model for a script and print it (or write it to a file)
    Generate {
        #[arg(long)]
        prompt: String,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Compile an existing .scad file
    Compile {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        output: PathBuf,
        /// Defaults to the output file's extension, else binstl.
        #[arg(long)]
        format: Option<MeshFormat>,
    },
    /// Generate a script for the prompt and compile it in one go
    Design {
        #[arg(long)]
        prompt: String,
        #[arg(long)]
        output: PathBuf,
        #[arg(long)]
        format: Option<MeshFormat>,
        /// Also keep the generated script next to the mesh
        #[arg(long)]
        keep_script: bool,
    },
}

#[derive(Args)]
struct SharedArgs {
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true, global = true)]
    api_key: Option<String>,

    #[arg(long, env = "OPENAI_BASE_URL", default_value = DEFAULT_API_BASE, global = true)]
    api_base: String,

    #[arg(long, env = "OPENAI_MODEL", default_value = DEFAULT_MODEL, global = true)]
    model: String,

    #[arg(long, env = "SCAD_COMPILER", default_value = "openscad", global = true)]
    compiler: PathBuf,

    /// Applies to both the model request and the compiler run.
    #[arg(long, default_value_t = 120, global = true)]
    timeout_secs: u64,
}

impl SharedArgs {
    fn generator(&self) -> anyhow::Result<ScriptGenerator<OpenAiChatModel>> {
        let model = OpenAiChatModel::new(OpenAiConfig {
            api_base: self.api_base.clone(),
            model: self.model.clone(),
            max_completion_tokens: DEFAULT_MAX_COMPLETION_TOKENS,
            timeout: Duration::from_secs(self.timeout_secs),
        })
        .context("failed to build the text-generation client")?;
        Ok(ScriptGenerator::new(model))
    }

    fn api_key(&self) -> Option<ApiKey> {
        self.api_key.clone().and_then(ApiKey::new)
    }

    fn compiler(&self, format: MeshFormat) -> ScadCompiler {
        ScadCompiler::new(CompilerConfig {
            program: self.compiler.clone(),
            work_dir: default_work_dir(),
            format,
            timeout: Duration::from_secs(self.timeout_secs),
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Generate { prompt, output } => {
            let script = generate(&cli.shared, &prompt).await?;
            match output {
                Some(path) => write_file(&path, script.as_bytes()).await?,
                None => println!("{script}"),
            }
        }
        Command::Compile {
            input,
            output,
            format,
        } => {
            let script = tokio::fs::read_to_string(&input)
                .await
                .with_context(|| format!("failed to read {}", input.display()))?;
            let format = resolve_format(format, &output);
            compile_to(&cli.shared, &script, &output, format).await?;
        }
        Command::Design {
            prompt,
            output,
            format,
            keep_script,
        } => {
            let script = generate(&cli.shared, &prompt).await?;
            if keep_script {
                write_file(&output.with_extension("scad"), script.as_bytes()).await?;
            }
            let format = resolve_format(format, &output);
            compile_to(&cli.shared, &script, &output, format).await?;
        }
    }
    Ok(())
}

async fn generate(shared: &SharedArgs, prompt: &str) -> anyhow::Result<String> {
    let generator = shared.generator()?;
    let script = generator
        .generate(prompt, shared.api_key().as_ref())
        .await
        .context("script generation failed")?;
    tracing::info!(elapsed_ms = script.elapsed_ms, "script generated");
    Ok(script.source)
}

async fn compile_to(
    shared: &SharedArgs,
    script: &str,
    output: &Path,
    format: MeshFormat,
) -> anyhow::Result<()> {
    let compiler = shared.compiler(format);
    let mesh = compiler.compile(script).await.inspect_err(|err| {
        if let Some((stdout, _)) = err.streams()
            && !stdout.is_empty()
        {
            eprintln!("OpenSCAD stdout:\n{stdout}");
        }
    })?;

    let written = write_file(output, &mesh.bytes).await;
    if let Err(err) = mesh.discard().await {
        tracing::warn!("failed to remove compile workspace: {err}");
    }
    written?;

    for line in summary(&mesh) {
        println!("{line}");
    }
    Ok(())
}

fn resolve_format(explicit: Option<MeshFormat>, output: &Path) -> MeshFormat {
    explicit
        .or_else(|| {
            output
                .extension()
                .and_then(|ext| ext.to_str())
                .and_then(|ext| ext.parse().ok())
        })
        .unwrap_or_default()
}

fn summary(mesh: &CompiledMesh) -> Vec<String> {
    let mut lines = vec![
        format!("format {}", mesh.format),
        format!("bytes {}", mesh.len()),
    ];
    if mesh.format.is_stl() {
        match parse_stl(&mesh.bytes) {
            Ok(parsed) => {
                let stats = MeshStats::of(&parsed);
                let extent = stats.bounding_box.extent();
                lines.push(format!("vertices {}", stats.vertex_count));
                lines.push(format!("triangles {}", stats.triangle_count));
                lines.push(format!(
                    "extent {:.3} x {:.3} x {:.3}",
                    extent[0], extent[1], extent[2]
                ));
                lines.push(format!("volume {:.3}", stats.volume));
            }
            Err(err) => tracing::warn!("could not read compiled STL: {err}"),
        }
    }
    lines
}

async fn write_file(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    if path.as_os_str().is_empty() {
        bail!("output path must not be empty");
    }
    tokio::fs::write(path, bytes)
        .await
        .with_context(|| format!("failed to write {}", path.display()))
}
