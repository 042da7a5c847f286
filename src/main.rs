use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::info;
use simplelog::{Config, LevelFilter, WriteLogger};

use pagestream::panic_handler::initialize_panic_handler;
use pagestream::settings::{self, PipelineSettings, RenderFailurePolicy};

const DEFAULT_LOG_FILE: &str = "pagestream.log";

#[derive(Parser, Debug)]
#[command(name = "pagestream", version, about = "Render document pages in a background worker", long_about = None)]
struct Cli {
    /// Settings file (default: <config dir>/pagestream/config.yaml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log file, shared by the viewer and its workers
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Render every page of a document through a worker process
    Open {
        document: PathBuf,

        /// Write each placed page here as PNG
        #[arg(long)]
        out: Option<PathBuf>,

        /// Ask the worker to jump to this page
        #[arg(long)]
        focus: Option<usize>,

        /// Number of frames to receive before sending the focus request
        #[arg(long, default_value_t = 0, requires = "focus")]
        focus_after: usize,
    },

    /// Worker process entry point; speaks the frame protocol on stdin/stdout
    #[command(hide = true)]
    Worker {
        #[arg(long)]
        document: PathBuf,

        #[arg(long)]
        region: String,

        #[arg(long, default_value_t = 2.0)]
        scale: f32,

        #[arg(long, default_value_t = RenderFailurePolicy::AbortSession)]
        on_render_error: RenderFailurePolicy,
    },
}

fn init_logging(path: &Path, level: LevelFilter) -> Result<()> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("opening log file {path:?}"))?;
    WriteLogger::init(level, Config::default(), file)?;
    Ok(())
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // Workers only read settings; the viewer owns the file
    let settings = match (&cli.command, &cli.config) {
        (Commands::Worker { .. }, Some(path)) => settings::read_settings_from_path(path),
        (Commands::Worker { .. }, None) => settings::read_settings(),
        (_, Some(path)) => settings::load_settings_from_path(path),
        (_, None) => settings::load_settings(),
    };
    let log_file = cli
        .log_file
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_FILE));
    init_logging(&log_file, settings.log_level_filter())?;
    initialize_panic_handler();

    match cli.command {
        Commands::Open {
            document,
            out,
            focus,
            focus_after,
        } => {
            info!("Starting pagestream for {document:?}");
            let focus = focus.map(|page| (page, focus_after));
            let completed = open::run(
                settings,
                cli.config.as_deref(),
                &log_file,
                &document,
                out.as_deref(),
                focus,
            )?;
            Ok(if completed {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Commands::Worker {
            document,
            region,
            scale,
            on_render_error,
        } => {
            worker::run(&document, &region, scale, on_render_error)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

#[cfg(feature = "pdf")]
mod open {
    use std::fs;
    use std::sync::Arc;
    use std::thread;

    use anyhow::bail;
    use log::warn;
    use pagestream::pipeline::{MupdfEngine, ProcessLauncher};
    use pagestream::{PageCanvas, PageLayout, PageProducer, PollOutcome};

    use super::*;

    /// Drives one session to its end. Returns whether every page arrived.
    pub fn run(
        settings: PipelineSettings,
        config: Option<&Path>,
        log_file: &Path,
        document: &Path,
        out: Option<&Path>,
        focus: Option<(usize, usize)>,
    ) -> Result<bool> {
        if let Some(dir) = out {
            fs::create_dir_all(dir).with_context(|| format!("creating {dir:?}"))?;
        }

        let engine = Arc::new(MupdfEngine::new(settings.render_scale));
        let mut launcher = ProcessLauncher::current_exe()?.with_log_file(log_file);
        if let Some(config) = config {
            launcher = launcher.with_config(config);
        }
        let mut canvas = PageCanvas::new(PageLayout::from_settings(&settings));
        let mut producer = PageProducer::new(engine, Box::new(launcher), settings);

        let page_count = producer
            .start(document)
            .with_context(|| format!("starting render session for {document:?}"))?;
        canvas.clear(page_count);
        println!("{}: {page_count} pages", document.display());

        let mut received = 0;
        if focus.is_some_and(|(_, after)| after == 0) {
            request_focus(&producer, focus);
        }

        loop {
            match producer.poll()? {
                PollOutcome::Frame(frame) => {
                    received += 1;
                    match canvas.insert(&frame) {
                        Ok(placed) => {
                            println!(
                                "page {:>4}: {:>9} bytes, {}x{} at ({}, {})",
                                placed.page_index,
                                frame.length(),
                                placed.image.width(),
                                placed.image.height(),
                                placed.x,
                                placed.y
                            );
                            if let Some(dir) = out {
                                let path = dir.join(format!("page-{:04}.png", placed.page_index));
                                placed
                                    .image
                                    .save(&path)
                                    .with_context(|| format!("writing {path:?}"))?;
                            }
                        }
                        Err(e) => warn!("{e}"),
                    }
                    if focus.is_some_and(|(_, after)| after == received) {
                        request_focus(&producer, focus);
                    }
                }
                PollOutcome::Pending => thread::sleep(producer.poll_interval()),
                PollOutcome::Finished(_) => break,
                PollOutcome::Idle => bail!("render session stopped polling unexpectedly"),
            }
        }

        let Some(report) = producer.stop() else {
            bail!("render session vanished before teardown");
        };
        println!(
            "{:?}: {} delivered, {} skipped, {} remaining",
            report.outcome, report.delivered, report.skipped, report.remaining
        );
        Ok(report.is_success())
    }

    fn request_focus(producer: &PageProducer, focus: Option<(usize, usize)>) {
        if let Some((page, _)) = focus {
            info!("requesting focus on page {page}");
            producer.request_focus(page);
        }
    }
}

#[cfg(feature = "pdf")]
mod worker {
    use std::io;

    use pagestream::pipeline::{MupdfEngine, WorkerChannel, run_worker};

    use super::*;

    pub fn run(document: &Path, region: &str, scale: f32, policy: RenderFailurePolicy) -> Result<()> {
        let engine = MupdfEngine::new(scale);
        let channel = WorkerChannel::new(io::stdin().lock(), io::stdout().lock());
        let record = run_worker(&engine, document, region, channel, policy)
            .with_context(|| format!("attaching to region {region}"))?;
        info!("worker for {document:?} exiting: {record:?}");
        Ok(())
    }
}

#[cfg(not(feature = "pdf"))]
mod open {
    use super::*;

    pub fn run(
        _settings: PipelineSettings,
        _config: Option<&Path>,
        _log_file: &Path,
        _document: &Path,
        _out: Option<&Path>,
        _focus: Option<(usize, usize)>,
    ) -> Result<bool> {
        anyhow::bail!("pagestream was built without the `pdf` feature; no document engine available")
    }
}

#[cfg(not(feature = "pdf"))]
mod worker {
    use super::*;

    pub fn run(_document: &Path, _region: &str, _scale: f32, _policy: RenderFailurePolicy) -> Result<()> {
        anyhow::bail!("pagestream was built without the `pdf` feature; no document engine available")
    }
}
