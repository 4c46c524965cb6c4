//! Binary entrypoint for the experience engine CLI.
//!
//! Commands:
//! - `init` - write a starter `config.toml` and create the content and state directories
//! - `check` - load every experience, run command discovery and report problems
//! - `play --player <id> [--experience <id>] [--admin]` - line-oriented local session over stdin
//! - `audit --experience <id> [--limit <n>]` - print recent admin audit entries
//!
//! See the library crate docs for module-level details: `experience_engine::`.
use std::sync::Arc;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use log::{error, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use experience_engine::config::Config;
use experience_engine::engine::bootstrap::BootstrapService;
use experience_engine::engine::template::load_world_template;
use experience_engine::engine::{DisabledInterpreter, ExperienceEngine, Interpreter};

#[derive(Parser)]
#[command(name = "experience-engine")]
#[command(about = "State manager and command engine for dynamic experiences")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init,
    /// Validate experiences, templates and command definitions
    Check,
    /// Play interactively from the terminal
    Play {
        /// Player id to act as
        #[arg(short, long)]
        player: String,
        /// Experience to start in (otherwise `play <name>` or the configured default)
        #[arg(short, long)]
        experience: Option<String>,
        /// Grant admin capability for `@` commands
        #[arg(long)]
        admin: bool,
    },
    /// Show recent admin audit entries for an experience
    Audit {
        #[arg(short, long)]
        experience: String,
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Init => {
            init_logging(&None, cli.verbose);
            info!("Initializing new engine configuration");
            if tokio::fs::try_exists(&cli.config).await.unwrap_or(false) {
                warn!("{} already exists; leaving it untouched", cli.config);
                return Ok(());
            }
            Config::create_default(&cli.config).await?;
            let cfg = Config::load(&cli.config).await?;
            tokio::fs::create_dir_all(&cfg.engine.content_root).await?;
            tokio::fs::create_dir_all(&cfg.engine.data_dir).await?;
            info!("Configuration file created at {}", cli.config);
        }
        Commands::Check => {
            let config = Config::load(&cli.config).await?;
            init_logging(&Some(config.clone()), cli.verbose);
            let engine = ExperienceEngine::from_config(&config, Arc::new(DisabledInterpreter))?;
            let bootstrap = BootstrapService::new(engine.store().clone());
            let mut problems = 0usize;
            for (id, discovered) in engine.discover_all() {
                let cfg = engine.catalog().get(&id)?;
                if let Err(e) = load_world_template(&cfg) {
                    error!("{}: {}", id, e);
                    problems += 1;
                    continue;
                }
                match bootstrap.ensure_world(&cfg) {
                    Ok(true) => info!("{}: created shared world record", id),
                    Ok(false) => {}
                    Err(e) => {
                        error!("{}: {}", id, e);
                        problems += 1;
                    }
                }
                match discovered {
                    Ok(set) => {
                        println!(
                            "{} ({}): {} player command(s), {} admin command(s)",
                            id,
                            cfg.state_model,
                            set.player_commands().count(),
                            set.admin_commands().count()
                        );
                        for skipped in set.skipped() {
                            println!("  skipped {}: {}", skipped.file, skipped.reason);
                            problems += 1;
                        }
                    }
                    Err(e) => {
                        error!("{}: {}", id, e);
                        problems += 1;
                    }
                }
            }
            if problems > 0 {
                return Err(anyhow!("{} problem(s) found", problems));
            }
            println!("All experiences OK");
        }
        Commands::Play {
            player,
            experience,
            admin,
        } => {
            let config = Config::load(&cli.config).await?;
            init_logging(&Some(config.clone()), cli.verbose);
            let interpreter = build_interpreter(&config)?;
            let engine = ExperienceEngine::from_config(&config, interpreter)?;
            play(&engine, &player, experience, admin).await?;
        }
        Commands::Audit { experience, limit } => {
            let config = Config::load(&cli.config).await?;
            init_logging(&Some(config.clone()), cli.verbose);
            let engine = ExperienceEngine::from_config(&config, Arc::new(DisabledInterpreter))?;
            for entry in engine.store().list_audit(&experience, limit)? {
                println!(
                    "{} {} @{} {} [{}; applied {}, dropped {}]",
                    entry.recorded_at.format("%Y-%m-%dT%H:%M:%SZ"),
                    entry.player_id,
                    entry.command,
                    entry.arguments,
                    if entry.succeeded { "ok" } else { "failed" },
                    entry.applied,
                    entry.dropped
                );
            }
        }
    }

    Ok(())
}

fn build_interpreter(config: &Config) -> Result<Arc<dyn Interpreter>> {
    if !config.llm.enabled {
        info!("Interpreter disabled; only admin commands will succeed");
        return Ok(Arc::new(DisabledInterpreter));
    }
    #[cfg(feature = "http-llm")]
    {
        let http = experience_engine::engine::interpreter::HttpInterpreter::new(config.llm.clone())
            .map_err(|e| anyhow!("Failed to build interpreter client: {}", e))?;
        info!("Interpreter: {} ({})", config.llm.endpoint, config.llm.model);
        Ok(Arc::new(http))
    }
    #[cfg(not(feature = "http-llm"))]
    {
        warn!("Built without the 'http-llm' feature; interpreter disabled");
        Ok(Arc::new(DisabledInterpreter))
    }
}

async fn play(engine: &ExperienceEngine, player: &str, mut experience: Option<String>, admin: bool) -> Result<()> {
    let mut stdout = tokio::io::stdout();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    stdout.write_all(b"> ").await?;
    stdout.flush().await?;
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if matches!(line, "quit" | "exit") {
            break;
        }
        if !line.is_empty() {
            let response = engine.handle_message(player, experience.as_deref(), line, admin).await;
            if response.experience_id.is_some() {
                experience = response.experience_id.clone();
            }
            let mut out = format!("{}\n", response.narrative);
            if !response.available_actions.is_empty() {
                out.push_str(&format!("[{}]\n", response.available_actions.join(" | ")));
            }
            if let Some(err) = &response.error {
                out.push_str(&format!("(error: {}: {})\n", err.kind, err.detail));
            }
            stdout.write_all(out.as_bytes()).await?;
        }
        stdout.write_all(b"> ").await?;
        stdout.flush().await?;
    }
    Ok(())
}

fn init_logging(config: &Option<Config>, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    // CLI verbosity overrides the configured level
    let configured = config
        .as_ref()
        .and_then(|c| c.logging.level.parse::<log::LevelFilter>().ok())
        .unwrap_or(log::LevelFilter::Info);
    let base_level = match verbosity {
        0 => configured,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(base_level);

    let log_file = config
        .as_ref()
        .and_then(|c| c.logging.file.as_ref())
        .and_then(|file| std::fs::OpenOptions::new().create(true).append(true).open(file).ok());

    match (config, log_file) {
        (Some(cfg), Some(f)) => {
            let security_path = cfg.logging.security_file.clone();
            let write_mutex = std::sync::Arc::new(std::sync::Mutex::new(f));
            // Echo to the console only when attached to a terminal
            let is_tty = atty::is(atty::Stream::Stdout);

            builder.format(move |fmt, record| {
                let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
                let line = format!("{} [{}] {}", ts, record.level(), record.args());

                if let Ok(mut guard) = write_mutex.lock() {
                    let _ = writeln!(guard, "{}", line);
                }

                if record.target() == "security" {
                    if let Some(ref sec_path) = security_path {
                        if let Ok(mut sf) = std::fs::OpenOptions::new().create(true).append(true).open(sec_path) {
                            let _ = writeln!(sf, "{}", line);
                        }
                    }
                }

                if is_tty {
                    writeln!(fmt, "{}", line)
                } else {
                    Ok(())
                }
            });
        }
        _ => {
            builder.format(|fmt, record| {
                let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
                writeln!(fmt, "{} [{}] {}", ts, record.level(), record.args())
            });
        }
    }
    let _ = builder.try_init();
}
