use anyhow::Result;
use clap::Parser;
use gmail_labeler::cli::{self, Cli, Commands};
use gmail_labeler::error::LabelerError;
use indicatif::MultiProgress;
use std::io::Write;
use std::process;
use std::sync::Arc;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

/// Exit code when the run could not start or was aborted (auth, config)
const EXIT_ABORTED: i32 = 2;

/// A writer that prints through MultiProgress to avoid progress bar conflicts
#[derive(Clone)]
struct MultiProgressWriter {
    multi: Arc<MultiProgress>,
    buffer: Arc<std::sync::Mutex<Vec<u8>>>,
}

impl MultiProgressWriter {
    fn new(multi: Arc<MultiProgress>) -> Self {
        Self {
            multi,
            buffer: Arc::new(std::sync::Mutex::new(Vec::new())),
        }
    }

    fn buffer(&self) -> std::sync::MutexGuard<'_, Vec<u8>> {
        self.buffer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Write for MultiProgressWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buffer().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut buffer = self.buffer();
        if !buffer.is_empty() {
            let msg = String::from_utf8_lossy(&buffer);
            let msg = msg.trim_end_matches('\n');
            if !msg.is_empty() {
                let _ = self.multi.println(msg);
            }
            buffer.clear();
        }
        Ok(())
    }
}

impl Drop for MultiProgressWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

/// MakeWriter implementation for tracing
#[derive(Clone)]
struct MultiProgressMakeWriter {
    multi: Arc<MultiProgress>,
}

impl<'a> MakeWriter<'a> for MultiProgressMakeWriter {
    type Writer = MultiProgressWriter;

    fn make_writer(&'a self) -> Self::Writer {
        MultiProgressWriter::new(Arc::clone(&self.multi))
    }
}

#[tokio::main]
async fn main() {
    match run().await {
        Ok(code) => process::exit(code),
        Err(e) => {
            display_error(&e);
            eprintln!("\nFor help, run: gmail-labeler --help");
            process::exit(EXIT_ABORTED);
        }
    }
}

fn init_tracing(cli: &Cli, multi: &Arc<MultiProgress>) {
    let filter = if cli.verbose {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("gmail_labeler=debug,info"))
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("gmail_labeler=info,warn"))
    };

    let make_writer = MultiProgressMakeWriter {
        multi: Arc::clone(multi),
    };

    if cli.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_current_span(false)
            .init();
    } else {
        // Logs print above progress bars
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(make_writer)
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .init();
    }
}

async fn run() -> Result<i32> {
    // Several dependencies pull in rustls; pick one crypto provider explicitly
    #[cfg(not(windows))]
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install default crypto provider"))?;

    #[cfg(windows)]
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install default crypto provider"))?;

    let cli = Cli::parse();

    let multi_progress = Arc::new(MultiProgress::new());
    init_tracing(&cli, &multi_progress);

    match &cli.command {
        Commands::Auth { force } => {
            tracing::info!("Authorizing with Gmail API...");
            cli::authorize(&cli, *force).await?;
            Ok(0)
        }

        Commands::Run { dry_run, options } => {
            run_and_summarize(&cli, *dry_run, options, &multi_progress).await
        }

        Commands::DryRun { options } => {
            run_and_summarize(&cli, true, options, &multi_progress).await
        }

        Commands::Rules => {
            cli::list_rules(&cli).await?;
            Ok(0)
        }

        Commands::Status => {
            cli::show_status(&cli).await?;
            Ok(0)
        }

        Commands::InitConfig { output, force } => {
            tracing::info!("Generating example configuration file");
            cli::init_config(output, *force).await?;
            Ok(0)
        }
    }
}

async fn run_and_summarize(
    cli: &Cli,
    dry_run: bool,
    options: &cli::RunOptions,
    multi_progress: &Arc<MultiProgress>,
) -> Result<i32> {
    if dry_run {
        println!("Running in DRY RUN mode - no changes will be made");
    }

    let report = cli::run_labeling(cli, dry_run, options, (**multi_progress).clone()).await?;

    println!("\n========================================");
    print!("{}", report.render());
    println!("========================================");

    Ok(report.exit_code())
}

/// Display error with context
fn display_error(error: &anyhow::Error) {
    eprintln!("Error: {}", error);

    let mut cause = error.source();
    while let Some(e) = cause {
        eprintln!("  Caused by: {}", e);
        cause = e.source();
    }

    if let Some(err) = error.downcast_ref::<LabelerError>() {
        match err {
            LabelerError::AuthError(_) => {
                eprintln!("\nHint: The stored credential is missing, expired or revoked.");
                eprintln!("      Try running: gmail-labeler auth --force");
            }
            LabelerError::ConfigError(_) => {
                eprintln!("\nHint: Check your configuration file for errors.");
                eprintln!("      Run: gmail-labeler init-config --force");
            }
            LabelerError::RateLimitExceeded { .. } => {
                eprintln!("\nHint: You've hit Gmail API rate limits.");
                eprintln!("      Lower rate_limit.units_per_second in the config.");
            }
            _ => {}
        }
    }
}
