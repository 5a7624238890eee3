use anyhow::{anyhow, bail, Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use pose_match::{
    bridge::{ProcessBridge, ProcessExtractorFactory, ProcessLifter},
    compare::Comparator,
    config::{ComparatorConfig, LiveConfig, PipelineConfig},
    event::Event,
    extract::ExtractorFactory,
    frame::FrameSize,
    job::{self, CancelToken, Job, JobOutput, RelayEnd},
    pipeline::{lift::lift_video, BatchPipeline},
    registry::{validate_upload, ReferenceRegistry},
    session::LiveSession,
    transport::run_live_session,
    video::{default_backend, VideoBackend},
    Error,
};
use serde::Serialize;
use std::{
    ops::ControlFlow,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use structopt::StructOpt;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;

const STDIN_SHUTDOWN_GRACE: Duration = Duration::from_millis(200);

#[derive(structopt::StructOpt)]
struct ModelOpt {
    /// Command running the keypoint extractor bridge, e.g. "python extract.py".
    #[structopt(long, env = "POSE_MATCH_EXTRACTOR")]
    extractor: String,

    /// JSON file with comparator settings.
    #[structopt(long)]
    config: Option<PathBuf>,

    /// Maximum normalized distance for a keypoint to count as correct.
    #[structopt(short, long)]
    threshold: Option<f32>,
}

impl ModelOpt {
    fn comparator(&self) -> Result<Comparator> {
        let config = match &self.config {
            Some(path) => ComparatorConfig::from_json_file(path)?,
            None => ComparatorConfig::default(),
        };
        let config = match self.threshold {
            Some(threshold) => config.with_threshold(threshold)?,
            None => config,
        };
        Ok(Comparator::new(config))
    }

    fn extractors(&self) -> Result<Arc<dyn ExtractorFactory>> {
        Ok(Arc::new(ProcessExtractorFactory::new(split_command(
            &self.extractor,
        )?)))
    }
}

#[derive(structopt::StructOpt)]
struct ReferenceOpt {
    /// Reference video path, or an id when --references is given.
    #[structopt(short, long)]
    reference: String,

    /// Directory of reference videos to resolve --reference against.
    #[structopt(long, env = "POSE_MATCH_REFERENCES")]
    references: Option<PathBuf>,
}

impl ReferenceOpt {
    fn resolve(&self) -> Result<PathBuf> {
        match &self.references {
            Some(dir) => Ok(ReferenceRegistry::open(dir)?.resolve(&self.reference)?),
            None => Ok(PathBuf::from(&self.reference)),
        }
    }
}

#[derive(structopt::StructOpt)]
enum Command {
    /// Compare a user video against a reference video.
    Compare {
        #[structopt(flatten)]
        model: ModelOpt,

        #[structopt(flatten)]
        reference: ReferenceOpt,

        #[structopt(short, long)]
        user: PathBuf,

        #[structopt(short, long, default_value = "output")]
        out_dir: PathBuf,

        /// Width of each pane of the side-by-side video.
        #[structopt(long, default_value = "640")]
        panel_width: u32,

        #[structopt(long, default_value = "480")]
        panel_height: u32,

        /// Print events as JSON lines instead of showing a progress bar.
        #[structopt(long)]
        events: bool,
    },

    /// Write a copy of a user video with flags and a reference ghost.
    Annotate {
        #[structopt(flatten)]
        model: ModelOpt,

        #[structopt(flatten)]
        reference: ReferenceOpt,

        #[structopt(short, long)]
        user: PathBuf,

        #[structopt(short, long)]
        out: PathBuf,

        #[structopt(long)]
        events: bool,
    },

    /// Lift the poses of a single video to 3D.
    Lift {
        #[structopt(flatten)]
        model: ModelOpt,

        /// Command running the 3D lifting bridge.
        #[structopt(long, env = "POSE_MATCH_LIFTER")]
        lifter: String,

        #[structopt(short, long)]
        video: PathBuf,

        /// Where to copy the 3D keypoints; printed to stdout when omitted.
        #[structopt(short, long)]
        output: Option<PathBuf>,

        #[structopt(long, default_value = "res/output")]
        work_dir: PathBuf,

        #[structopt(long)]
        events: bool,
    },

    /// Run a live session over stdin/stdout.
    Live {
        #[structopt(flatten)]
        model: ModelOpt,

        #[structopt(flatten)]
        reference: ReferenceOpt,

        #[structopt(long, default_value = "recordings")]
        output_dir: PathBuf,

        #[structopt(long, default_value = "30")]
        fps: f64,
    },

    /// List the videos in a reference directory.
    References {
        #[structopt(long, env = "POSE_MATCH_REFERENCES")]
        dir: PathBuf,
    },
}

#[derive(structopt::StructOpt)]
struct Opt {
    #[structopt(short, long, default_value = "info", env = "RUST_LOG")]
    log_level: tracing_subscriber::filter::EnvFilter,

    #[structopt(subcommand)]
    command: Command,
}

fn split_command(command: &str) -> Result<Vec<String>> {
    let parts: Vec<String> = command.split_whitespace().map(str::to_owned).collect();
    if parts.is_empty() {
        bail!("empty bridge command");
    }
    Ok(parts)
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")
}

/// Relay a job to the terminal, either as JSON lines or as a progress bar,
/// with Ctrl-C cancelling it.
fn drive<T, F>(job: Job<T>, json: bool, mut on_result: F) -> Result<()>
where
    T: JobOutput + Serialize + Send + 'static,
    F: FnMut(&T) -> Result<()>,
{
    let cancel = job.cancel_token().clone();
    ctrlc::set_handler(move || cancel.cancel()).context("failed setting Ctrl-C handler")?;

    let bar = if json {
        None
    } else {
        let bar = ProgressBar::new(100).with_style(
            ProgressStyle::default_bar()
                .template("{prefix:.bold.dim} [{bar:40}] {pos:>3}% {wide_msg}")
                .progress_chars("=> "),
        );
        bar.set_prefix(job.name().to_owned());
        Some(bar)
    };

    let mut failure = None;
    let end = runtime()?.block_on(job.relay(Vec::new(), |event| {
        if json {
            match serde_json::to_string(&event.to_wire()) {
                Ok(line) => println!("{}", line),
                Err(e) => warn!(error = %e, "failed to serialize event"),
            }
        }
        match &event {
            Event::Log(text) => {
                if let Some(bar) = &bar {
                    bar.println(text);
                }
            }
            Event::Progress(progress) => {
                if let Some(bar) = &bar {
                    bar.set_position(u64::from(progress.percentage));
                    bar.set_message(progress.message.clone());
                }
            }
            Event::Result(output) => {
                if let Err(e) = on_result(output) {
                    failure = Some(e);
                }
            }
            Event::Error(message) => failure = Some(anyhow!("{}", message)),
            Event::Done => {
                if let Some(bar) = &bar {
                    bar.finish_with_message("done");
                }
            }
        }
        ControlFlow::Continue(())
    }));

    if let Some(e) = failure {
        return Err(e);
    }
    match end {
        RelayEnd::Done => Ok(()),
        other => Err(anyhow!("job ended with {:?}", other)),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn output_path(dir: &Path, id: &uuid::Uuid, kind: &str, backend: &dyn VideoBackend) -> PathBuf {
    dir.join(format!("{}_{}.{}", id, kind, backend.extension()))
}

fn main() -> Result<()> {
    let opt = Opt::from_args();

    job::set_capture_filter(&opt.log_level);
    tracing::subscriber::set_global_default(
        tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .with(opt.log_level),
    )?;

    match run(opt.command) {
        Err(e) if e.downcast_ref::<Error>().map_or(false, Error::is_input_error) => {
            eprintln!("invalid input: {:#}", e);
            std::process::exit(2);
        }
        outcome => outcome,
    }
}

fn run(command: Command) -> Result<()> {
    let backend = default_backend();

    match command {
        Command::Compare {
            model,
            reference,
            user,
            out_dir,
            panel_width,
            panel_height,
            events,
        } => {
            let reference = reference.resolve()?;
            validate_upload(&reference)?;
            validate_upload(&user)?;
            std::fs::create_dir_all(&out_dir)
                .with_context(|| format!("failed to create {}", out_dir.display()))?;

            let id = uuid::Uuid::new_v4();
            let side_by_side = output_path(&out_dir, &id, "side_by_side", backend.as_ref());
            let annotated = output_path(&out_dir, &id, "annotated", backend.as_ref());
            let pipeline = BatchPipeline::new(
                backend,
                model.extractors()?,
                model.comparator()?,
                PipelineConfig {
                    panel: FrameSize::new(panel_width, panel_height),
                    ..Default::default()
                },
            );

            let job = Job::spawn("compare", move |ctx| {
                Ok(pipeline.compare(
                    &reference,
                    &user,
                    &side_by_side,
                    &annotated,
                    ctx,
                    ctx.cancel_token(),
                )?)
            })?;
            drive(job, events, |output| {
                if !events {
                    print_json(output)?;
                }
                Ok(())
            })
        }

        Command::Annotate {
            model,
            reference,
            user,
            out,
            events,
        } => {
            let reference = reference.resolve()?;
            validate_upload(&reference)?;
            validate_upload(&user)?;
            let pipeline = BatchPipeline::new(
                backend,
                model.extractors()?,
                model.comparator()?,
                PipelineConfig::default(),
            );
            let job = Job::spawn("annotate", move |ctx| {
                Ok(pipeline.annotate(&reference, &user, &out, ctx, ctx.cancel_token())?)
            })?;
            drive(job, events, |output| {
                if !events {
                    print_json(output)?;
                }
                Ok(())
            })
        }

        Command::Lift {
            model,
            lifter,
            video,
            output,
            work_dir,
            events,
        } => {
            validate_upload(&video)?;
            let extractors = model.extractors()?;
            let lifter_command = split_command(&lifter)?;
            let basename = uuid::Uuid::new_v4().to_string();
            let progress_every = PipelineConfig::default().progress_every;

            let job = Job::spawn("lift", move |ctx| {
                let mut extractor = extractors.create()?;
                let mut lifter = ProcessLifter::new(ProcessBridge::spawn(&lifter_command)?);
                Ok(lift_video(
                    backend.as_ref(),
                    extractor.as_mut(),
                    &mut lifter,
                    &video,
                    &work_dir,
                    &basename,
                    progress_every,
                    ctx,
                    ctx.cancel_token(),
                )?)
            })?;
            // the job's files are removed after the relay, so copy them out first
            drive(job, events, |result| {
                let path = &result.keypoints_json_path;
                match &output {
                    Some(dest) => {
                        std::fs::copy(path, dest).with_context(|| {
                            format!("failed to copy {} to {}", path.display(), dest.display())
                        })?;
                        info!(path = %dest.display(), "wrote 3D keypoints");
                    }
                    None if !events => {
                        let text = std::fs::read_to_string(path)
                            .with_context(|| format!("failed to read {}", path.display()))?;
                        println!("{}", text);
                    }
                    None => {}
                }
                Ok(())
            })
        }

        Command::Live {
            model,
            reference,
            output_dir,
            fps,
        } => {
            let reference = reference.resolve()?;
            validate_upload(&reference)?;
            let stop = CancelToken::default();
            let handler_stop = stop.clone();
            ctrlc::set_handler(move || handler_stop.cancel())
                .context("failed setting Ctrl-C handler")?;

            let comparator = model.comparator()?;
            let extractors = model.extractors()?;
            let config = LiveConfig {
                output_dir: output_dir.clone(),
                fps,
                ..Default::default()
            };
            let session = LiveSession::open(
                Arc::clone(&backend),
                extractors.as_ref(),
                comparator.clone(),
                &reference,
                &config,
            )?;
            let annotated = output_path(
                &output_dir,
                &uuid::Uuid::new_v4(),
                "annotated",
                backend.as_ref(),
            );
            let pipeline =
                BatchPipeline::new(backend, extractors, comparator, PipelineConfig::default());

            // Ctrl-C stops serving; the recording is still closed and annotated
            let runtime = runtime()?;
            let outcome = runtime.block_on(async {
                let mut stdin = tokio::io::stdin();
                let mut stdout = tokio::io::stdout();
                run_live_session(
                    session,
                    &mut stdin,
                    &mut stdout,
                    pipeline,
                    &reference,
                    annotated,
                    &stop,
                )
                .await
            });
            // a pending stdin read never finishes on its own
            runtime.shutdown_timeout(STDIN_SHUTDOWN_GRACE);
            let outcome = outcome?;
            info!(
                end = ?outcome.end,
                frames = outcome.frames_recorded,
                annotated = ?outcome.annotation.map(|a| a.annotated_video_path),
                "live session finished"
            );
            Ok(())
        }

        Command::References { dir } => {
            for entry in ReferenceRegistry::open(&dir)?.list()? {
                println!("{}\t{}", entry.id, entry.path.display());
            }
            Ok(())
        }
    }
}
