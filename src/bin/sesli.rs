//! `sesli` — narrate a text or PDF into an audiobook.
//!
//! Usage:
//!   sesli book kitap.pdf --reference anlatici.wav --output kitap.wav
//!   sesli book hikaye.txt --profile story_teller_female --speed 0.9
//!   sesli book roman.pdf --openai onyx --enhance
//!   sesli resume /tmp/sesli-job-20260101-101010-000001-4242-0 --openai nova
//!   sesli prepare-reference kayit.mp3 anlatici.wav --seconds 30
//!   sesli blend anlatici.wav ikinci.wav karisim.wav --ratio 0.3
//!   sesli segment hikaye.txt
//!   sesli batch tasks.json --output-dir ciktilar
//!   sesli voices --category Edebiyat
//!   sesli key <ELEVENLABS_API_KEY>
//!
//! Logging goes to stderr; set `RUST_LOG=debug` for per-unit detail.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};

use sesli::assemble::GapPolicy;
use sesli::backend::cloud::{profiles_in, ELEVENLABS_VOICES, OPENAI_VOICES};
use sesli::backend::local::command_loader;
use sesli::backend::Emotion;
use sesli::config::{save_elevenlabs_key, CONFIG_FILE};
use sesli::queue::{pipeline_runner, OUTPUT_EXTENSION};
use sesli::segment::kind_histogram;
use sesli::voice::{blend_files, prepare_reference_file, REFERENCE_SECS};
use sesli::{
    build_backend, BatchQueue, ModelRuntime, Pipeline, Settings, StyleOptions, SynthesisBackend,
    TextCleaner, VoiceRef,
};

#[derive(Debug, Parser)]
#[command(name = "sesli", version)]
#[command(about = "Turn texts and PDFs into narrated audiobooks")]
struct Cli {
    /// Settings file (missing file → defaults).
    #[arg(long, global = true, default_value = CONFIG_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Narrate a .txt, .md or .pdf file.
    Book(BookArgs),
    /// Continue an interrupted job from its working directory, with the
    /// style it was started with.
    Resume(ResumeArgs),
    /// Turn a recording into a cloning reference (mono, 24 kHz, trimmed).
    PrepareReference {
        input: PathBuf,
        output: PathBuf,
        /// Seconds kept from the start of the recording.
        #[arg(long, default_value_t = REFERENCE_SECS)]
        seconds: f64,
    },
    /// Mix two reference voices into a new one.
    Blend {
        first: PathBuf,
        second: PathBuf,
        output: PathBuf,
        /// Share of the second voice, 0–1.
        #[arg(long, default_value_t = 0.5)]
        ratio: f32,
    },
    /// Print the units a text splits into, without synthesising.
    Segment {
        input: PathBuf,
    },
    /// Run every task of a tasks.json file, one after another.
    Batch {
        tasks: PathBuf,
        #[arg(long, default_value = "batch_output")]
        output_dir: PathBuf,
    },
    /// List cloud voices and ElevenLabs profiles.
    Voices {
        #[arg(long)]
        category: Option<String>,
    },
    /// Store the ElevenLabs API key in the settings file.
    Key {
        api_key: String,
    },
}

#[derive(Debug, Args)]
#[group(required = true, multiple = false)]
struct VoiceArgs {
    /// Reference recording (10–60 s WAV) for the local cloning model.
    #[arg(long)]
    reference: Option<PathBuf>,
    /// ElevenLabs catalogue voice (ada, emre, aylin, burak).
    #[arg(long)]
    elevenlabs: Option<String>,
    /// ElevenLabs voice profile (see `sesli voices`).
    #[arg(long)]
    profile: Option<String>,
    /// OpenAI voice (alloy, echo, fable, onyx, nova, shimmer).
    #[arg(long)]
    openai: Option<String>,
}

impl VoiceArgs {
    fn voice(&self) -> anyhow::Result<VoiceRef> {
        let voice = if let Some(path) = &self.reference {
            VoiceRef::Reference(path.clone())
        } else if let Some(v) = &self.elevenlabs {
            VoiceRef::ElevenLabs(v.clone())
        } else if let Some(p) = &self.profile {
            VoiceRef::Profile(p.clone())
        } else if let Some(v) = &self.openai {
            VoiceRef::OpenAi(v.clone())
        } else {
            bail!("choose a voice: --reference, --elevenlabs, --profile or --openai");
        };
        Ok(voice)
    }
}

#[derive(Debug, Args)]
struct StyleArgs {
    /// Speaking rate, 0.5–2.0.
    #[arg(long, default_value_t = 1.0)]
    speed: f32,
    /// Pitch shift in 0.1-octave steps, -5–5.
    #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
    pitch: i32,
    /// neutral, happy, sad or excited.
    #[arg(long)]
    emotion: Option<Emotion>,
}

impl StyleArgs {
    fn style(&self) -> StyleOptions {
        StyleOptions {
            speed: self.speed,
            pitch: self.pitch,
            emotion: self.emotion.unwrap_or_default(),
        }
    }
}

#[derive(Debug, Args)]
struct BookArgs {
    input: PathBuf,
    #[command(flatten)]
    voice: VoiceArgs,
    #[command(flatten)]
    style: StyleArgs,
    /// Output file; the extension picks the format.
    #[arg(long, short)]
    output: Option<PathBuf>,
    #[arg(long)]
    max_units: Option<usize>,
    /// What a failed sentence leaves behind: omit or silence.
    #[arg(long)]
    gap: Option<GapPolicy>,
    /// Root for the job's resumable working directory.
    #[arg(long)]
    workdir: Option<PathBuf>,
    /// Noise gate, loudness levelling and compression on the result.
    #[arg(long)]
    enhance: bool,
}

#[derive(Debug, Args)]
struct ResumeArgs {
    workdir: PathBuf,
    #[command(flatten)]
    voice: VoiceArgs,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .init();

    let cli = Cli::parse();
    let settings = Settings::load(&cli.config)?;

    match cli.command {
        Commands::Book(args) => book(settings, args),
        Commands::Resume(args) => resume(settings, args),
        Commands::PrepareReference { input, output, seconds } => {
            let reference = prepare_reference_file(&input, &output, seconds)?;
            println!("{}: {:.1} s reference", output.display(), reference.duration().as_secs_f64());
            Ok(())
        }
        Commands::Blend { first, second, output, ratio } => {
            let mixed = blend_files(&first, &second, &output, ratio)?;
            println!("{}: {:.1} s blend", output.display(), mixed.duration().as_secs_f64());
            Ok(())
        }
        Commands::Segment { input } => segment(settings, &input),
        Commands::Batch { tasks, output_dir } => batch(settings, &tasks, output_dir),
        Commands::Voices { category } => {
            voices(category.as_deref());
            Ok(())
        }
        Commands::Key { api_key } => {
            save_elevenlabs_key(&cli.config, &api_key)?;
            println!("ElevenLabs key saved to {}", cli.config.display());
            Ok(())
        }
    }
}

fn runtime(settings: &Settings) -> ModelRuntime {
    ModelRuntime::new(command_loader(settings.local_model.clone(), settings.local_timeout()))
}

fn print_progress(fraction: f32, message: &str) {
    eprintln!("[{:>5.1}%] {message}", fraction * 100.0);
}

fn read_text(input: &Path) -> anyhow::Result<String> {
    let extracted = sesli::source::extract(input)?;
    log::info!(
        "{}: {} words, ~{:.0} min of narration",
        input.display(),
        extracted.word_count,
        extracted.estimated_minutes
    );
    Ok(TextCleaner::new().clean(&extracted.text))
}

fn book(mut settings: Settings, args: BookArgs) -> anyhow::Result<()> {
    if let Some(n) = args.max_units {
        settings.max_units = n;
    }
    if let Some(gap) = args.gap {
        settings.gap_policy = gap;
    }
    if args.workdir.is_some() {
        settings.work_root = args.workdir.clone();
    }
    settings.enhance |= args.enhance;
    settings.validate()?;

    let output = args
        .output
        .clone()
        .unwrap_or_else(|| args.input.with_extension(OUTPUT_EXTENSION));
    let text = read_text(&args.input)?;

    let runtime = runtime(&settings);
    let backend: Arc<dyn SynthesisBackend> = build_backend(&args.voice.voice()?, &settings, &runtime)?;

    let report = Pipeline::new(settings)
        .with_style(args.style.style())
        .with_progress(&print_progress)
        .run(&text, backend, &output)?;
    println!("{report}");
    Ok(())
}

fn resume(settings: Settings, args: ResumeArgs) -> anyhow::Result<()> {
    let runtime = runtime(&settings);
    let backend = build_backend(&args.voice.voice()?, &settings, &runtime)?;
    let report = Pipeline::new(settings)
        .with_progress(&print_progress)
        .resume(&args.workdir, backend)?;
    println!("{report}");
    Ok(())
}

fn segment(settings: Settings, input: &Path) -> anyhow::Result<()> {
    let text = read_text(input)?;
    let units = Pipeline::new(settings).segment(&text)?;
    for (i, unit) in units.iter().enumerate() {
        println!("{i:>4}  {:<11} {:.1}s  {}", unit.kind.as_str(), unit.pause_after, unit.text);
    }
    let kinds: Vec<String> = kind_histogram(&units)
        .iter()
        .map(|(kind, n)| format!("{kind}: {n}"))
        .collect();
    println!("\n{} units ({})", units.len(), kinds.join(", "));
    Ok(())
}

fn batch(settings: Settings, tasks: &Path, output_dir: PathBuf) -> anyhow::Result<()> {
    let specs = BatchQueue::load_tasks(tasks)?;
    if specs.is_empty() {
        bail!("{} contains no tasks", tasks.display());
    }
    let mut queue = BatchQueue::new(output_dir)?;
    for spec in specs {
        queue.add(spec.text, spec.voice, spec.style);
    }

    let runtime = runtime(&settings);
    let (summary, path) = queue
        .process(pipeline_runner(&settings, &runtime))
        .context("batch run failed")?;
    runtime.release();

    for job in &summary.per_job {
        match (&job.output_file, &job.error) {
            (Some(file), _) => println!("#{:<3} ok      {}", job.id, file.display()),
            (None, Some(err)) => println!("#{:<3} failed  {err}", job.id),
            (None, None) => println!("#{:<3} {:?}", job.id, job.status),
        }
    }
    println!(
        "{}/{} completed, {} failed; summary in {}",
        summary.completed,
        summary.total,
        summary.failed,
        path.display()
    );
    Ok(())
}

fn voices(category: Option<&str>) {
    println!("ElevenLabs voices:");
    for v in ELEVENLABS_VOICES {
        println!("  {:<8} {:<7} {:<7} {}", v.key, v.gender, v.age, v.description);
    }

    println!("\nElevenLabs profiles{}:", category.map(|c| format!(" ({c})")).unwrap_or_default());
    for p in profiles_in(category) {
        println!(
            "  {:<20} {:<6} {:<12} stability {:.1}, similarity {:.2}  {}",
            p.key, p.voice, p.category, p.stability, p.similarity_boost, p.description
        );
    }

    println!("\nOpenAI voices: {}", OPENAI_VOICES.join(", "));
}
