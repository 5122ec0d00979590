//! `typedown` — the CLI front end: seven fixed subcommands over
//! the library's `Project`/`Compiler`/`QueryEngine`, built from a `clap`
//! derive `Cli`/`Commands` pair, `tracing_subscriber::fmt()` initialised
//! from `RUST_LOG` in `main`, and a
//! `tokio::runtime::Builder::new_current_thread()` for the one subcommand
//! that needs an async runtime (`lsp`).

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use serde_json::json;
use typedown::diagnostic::DiagnosticReport;
use typedown::error::TypedownError;
use typedown::project::{CompileOptions, Compiler, Project, Stage};
use typedown::query::QueryEngine;

#[derive(Parser)]
#[command(name = "typedown")]
#[command(author, version, about = "Compiler for the Typedown markdown dialect", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
enum StageArg {
    Syntax,
    Structure,
    Local,
    Global,
}

impl From<StageArg> for Stage {
    fn from(value: StageArg) -> Self {
        match value {
            StageArg::Syntax => Stage::Syntax,
            StageArg::Structure => Stage::Structure,
            StageArg::Local => Stage::Local,
            StageArg::Global => Stage::Global,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline up to a given stage and report diagnostics
    Check {
        /// syntax | structure | local | global (default: local)
        stage: Option<StageArg>,
        #[arg(long)]
        path: Option<PathBuf>,
        /// Shorthand for `structure`
        #[arg(long, conflicts_with = "full")]
        fast: bool,
        /// Shorthand for `global`
        #[arg(long)]
        full: bool,
        #[arg(long)]
        json: bool,
        /// Re-run the check on every relevant filesystem change instead of exiting
        #[arg(long)]
        watch: bool,
    },

    /// Resolve a query string against the compiled project
    Query {
        q: String,
        #[arg(long)]
        sql: bool,
        /// File the query is scoped from, for `Id` lookup (default: project root)
        #[arg(long)]
        scope: Option<PathBuf>,
        #[arg(long)]
        path: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },

    /// Run a `typedown.toml` task, substituting `${target}` if given
    Run {
        script: String,
        target: Option<String>,
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        path: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },

    /// Print project metadata
    Info {
        #[arg(long)]
        path: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },

    /// List completion candidates for a file position
    Complete {
        file: PathBuf,
        #[arg(long)]
        line: Option<usize>,
        #[arg(long)]
        char: Option<usize>,
        /// Inline content overriding the file on disk (unsaved buffer)
        #[arg(long)]
        content: Option<String>,
        #[arg(long)]
        path: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },

    /// Start the language server
    Lsp {
        #[arg(long)]
        port: Option<u16>,
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
    },

    /// Scaffold a new project
    Init { name: String },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli.command) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::from(e.exit_code() as u8)
        }
    }
}

fn run(command: Commands) -> Result<ExitCode, TypedownError> {
    match command {
        Commands::Check { stage, path, fast, full, json, watch } => {
            cmd_check(stage, path, fast, full, json, watch)
        }
        Commands::Query { q, sql, scope, path, json } => cmd_query(q, sql, scope, path, json),
        Commands::Run { script, target, dry_run, path, json } => cmd_run(script, target, dry_run, path, json),
        Commands::Info { path, json } => cmd_info(path, json),
        Commands::Complete { file, line, char, content, path, json } => {
            cmd_complete(file, line, char, content, path, json)
        }
        Commands::Lsp { port, host } => cmd_lsp(port, host),
        Commands::Init { name } => cmd_init(name),
    }
}

fn discover(path: Option<PathBuf>) -> Result<Project, TypedownError> {
    let start = path.unwrap_or(std::env::current_dir()?);
    Project::discover(&start)
}

fn print_report(report: &DiagnosticReport, json: bool) {
    if json {
        for diagnostic in report.iter() {
            println!("{}", diagnostic.to_wire());
        }
    } else {
        for diagnostic in report.iter() {
            println!("{diagnostic}");
        }
    }
}

fn cmd_check(
    stage: Option<StageArg>,
    path: Option<PathBuf>,
    fast: bool,
    full: bool,
    json: bool,
    watch: bool,
) -> Result<ExitCode, TypedownError> {
    if fast && full {
        eprintln!("error: --fast and --full are mutually exclusive");
        return Ok(ExitCode::from(2));
    }

    let stage = if full {
        Stage::Global
    } else if fast {
        Stage::Structure
    } else {
        stage.map(Stage::from).unwrap_or(Stage::Local)
    };

    let project = discover(path)?;
    let compiler = Compiler::new(project);

    if watch {
        return cmd_check_watch(compiler, stage, json);
    }

    let result = compiler.compile(&CompileOptions { target: None, stage });

    print_report(&result.diagnostics, json);
    if result.diagnostics.has_errors() {
        Ok(ExitCode::FAILURE)
    } else {
        Ok(ExitCode::SUCCESS)
    }
}

#[cfg(not(feature = "watch"))]
fn cmd_check_watch(_compiler: Compiler, _stage: Stage, _json: bool) -> Result<ExitCode, TypedownError> {
    eprintln!("error: this build was compiled without the 'watch' feature");
    Ok(ExitCode::FAILURE)
}

/// Runs one check immediately, then recompiles on every debounced batch of
/// relevant filesystem changes until interrupted with Ctrl-C, printing each
/// new report as it arrives rather than exiting after the first.
#[cfg(feature = "watch")]
fn cmd_check_watch(compiler: Compiler, stage: Stage, json: bool) -> Result<ExitCode, TypedownError> {
    let compiler = std::sync::Arc::new(parking_lot::Mutex::new(compiler));
    let stage_for_closure = stage;

    let print_once = |compiler: &Compiler| {
        let result = compiler.compile(&CompileOptions { target: None, stage: stage_for_closure });
        print_report(&result.diagnostics, json);
    };
    print_once(&compiler.lock());

    let _handle = typedown::watch::watch_project(std::sync::Arc::clone(&compiler), move |result| {
        print_report(&result.diagnostics, json);
    })?;

    eprintln!("watching for changes, press Ctrl-C to stop");
    let running = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(true));
    let r = running.clone();
    if ctrlc::set_handler(move || {
        r.store(false, std::sync::atomic::Ordering::SeqCst);
    })
    .is_err()
    {
        tracing::warn!("failed to install Ctrl-C handler");
    }
    while running.load(std::sync::atomic::Ordering::SeqCst) {
        std::thread::sleep(std::time::Duration::from_millis(100));
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_query(
    q: String,
    sql: bool,
    scope: Option<PathBuf>,
    path: Option<PathBuf>,
    json: bool,
) -> Result<ExitCode, TypedownError> {
    let project = discover(path)?;
    let root = project.root.clone();
    let compiler = Compiler::new(project);
    let result = compiler.compile(&CompileOptions::default());

    if result.diagnostics.has_errors() {
        print_report(&result.diagnostics, json);
        return Ok(ExitCode::FAILURE);
    }

    let context_path = scope.unwrap_or_else(|| root.join(typedown::PROJECT_FILE));
    let engine = QueryEngine::new(&result.table, &result.store, &root);

    let outcome = if sql {
        engine.sql(&q, None)
    } else {
        engine.resolve_query(&q, &context_path)
    };

    match outcome {
        Ok(value) => {
            if json {
                println!("{}", json!({ "query": q, "result": value }));
            } else {
                println!("{value:#}");
            }
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            eprintln!("[{}] {e}", e.code());
            Ok(ExitCode::FAILURE)
        }
    }
}

fn cmd_run(
    script: String,
    target: Option<String>,
    dry_run: bool,
    path: Option<PathBuf>,
    json: bool,
) -> Result<ExitCode, TypedownError> {
    let project = discover(path)?;
    let Some(command_template) = project.config.tasks.get(&script).cloned() else {
        eprintln!("error: no task named '{script}' in {}", typedown::PROJECT_FILE);
        return Ok(ExitCode::from(2));
    };

    let command_line = match &target {
        Some(t) => command_template.replace("${target}", t),
        None => command_template,
    };

    if dry_run {
        if json {
            println!("{}", json!({ "command": command_line, "dry_run": true }));
        } else {
            println!("{command_line}");
        }
        return Ok(ExitCode::SUCCESS);
    }

    let status = std::process::Command::new("sh")
        .arg("-c")
        .arg(&command_line)
        .current_dir(&project.root)
        .status()
        .map_err(TypedownError::from)?;

    let code = status.code().unwrap_or(1);
    Ok(ExitCode::from(code.clamp(0, 255) as u8))
}

fn cmd_info(path: Option<PathBuf>, json: bool) -> Result<ExitCode, TypedownError> {
    let project = discover(path)?;
    if json {
        println!(
            "{}",
            json!({
                "root": project.root,
                "package": project.config.package,
                "tasks": project.config.tasks.keys().collect::<Vec<_>>(),
                "scripts": project.config.scripts.keys().collect::<Vec<_>>(),
                "prelude": project.config.linker.prelude,
            })
        );
    } else {
        println!("root: {}", project.root.display());
        if let Some(name) = &project.config.package.name {
            println!("package: {name}");
        }
        println!("tasks: {}", project.config.tasks.keys().cloned().collect::<Vec<_>>().join(", "));
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_complete(
    file: PathBuf,
    line: Option<usize>,
    char: Option<usize>,
    content: Option<String>,
    path: Option<PathBuf>,
    json: bool,
) -> Result<ExitCode, TypedownError> {
    let project = discover(path)?;
    let compiler = Compiler::new(project);
    if let Some(content) = content {
        compiler.source.update_overlay(file.clone(), content);
    }
    let result = compiler.compile(&CompileOptions { target: None, stage: Stage::Local });

    let mut candidates = Vec::new();
    for block_ref in result.table.iter_entities() {
        if let Some(typedown::symbol_table::Resolved::Entity(e)) = result.store.resolve(block_ref) {
            candidates.push(e.id.clone());
        }
    }
    for block_ref in result.table.iter_models() {
        if let Some(typedown::symbol_table::Resolved::Model(m)) = result.store.resolve(block_ref) {
            candidates.push(m.name.clone());
        }
    }
    candidates.sort();
    candidates.dedup();

    let _ = (line, char);
    if json {
        println!("{}", json!({ "candidates": candidates }));
    } else {
        for candidate in &candidates {
            println!("{candidate}");
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_lsp(port: Option<u16>, host: String) -> Result<ExitCode, TypedownError> {
    #[cfg(not(feature = "lsp"))]
    {
        let _ = (port, host);
        eprintln!("error: this build was compiled without the 'lsp' feature");
        Ok(ExitCode::FAILURE)
    }

    #[cfg(feature = "lsp")]
    {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(TypedownError::from)?;

        match port {
            None => {
                runtime.block_on(typedown::lsp::run_server());
            }
            Some(port) => {
                let running = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(true));
                let r = running.clone();
                if ctrlc::set_handler(move || {
                    r.store(false, std::sync::atomic::Ordering::SeqCst);
                })
                .is_err()
                {
                    tracing::warn!("failed to install Ctrl-C handler");
                }

                runtime.block_on(async move {
                    let listener = match tokio::net::TcpListener::bind((host.as_str(), port)).await {
                        Ok(l) => l,
                        Err(e) => {
                            eprintln!("error: failed to bind {host}:{port}: {e}");
                            return;
                        }
                    };
                    eprintln!("typedown lsp listening on {host}:{port}");

                    tokio::select! {
                        accepted = listener.accept() => {
                            if let Ok((stream, _addr)) = accepted {
                                let (read, write) = stream.into_split();
                                let (service, socket) = typedown::lsp::build_service();
                                tower_lsp_server::Server::new(read, write, socket).serve(service).await;
                            }
                        }
                        _ = async {
                            while running.load(std::sync::atomic::Ordering::SeqCst) {
                                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                            }
                        } => {
                            eprintln!("shutting down before a client connected");
                        }
                    }
                });
            }
        }
        Ok(ExitCode::SUCCESS)
    }
}

fn cmd_init(name: String) -> Result<ExitCode, TypedownError> {
    let root = PathBuf::from(&name);
    if root.exists() {
        eprintln!("error: {} already exists", root.display());
        return Ok(ExitCode::FAILURE);
    }
    std::fs::create_dir_all(root.join("models"))?;
    std::fs::create_dir_all(root.join("entities"))?;
    std::fs::write(
        root.join(typedown::PROJECT_FILE),
        format!("[package]\nname = \"{name}\"\nversion = \"0.1.0\"\n"),
    )?;
    std::fs::write(
        root.join("models/example.td"),
        "```model:Example\nrecord Example { name: str }\n```\n",
    )?;
    println!("initialized project '{name}' at {}", root.display());
    Ok(ExitCode::SUCCESS)
}
