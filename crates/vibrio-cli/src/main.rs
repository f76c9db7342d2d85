//! # Vibrio CLI Entry Point
//!
//! One-shot difficulty and performance calculations from the command line.
//! Results are printed to stdout as a single line of JSON; logs go to stderr.
//!
//! ## Usage
//!
//! ```bash
//! # Difficulty of a beatmap by id, with Hidden + DoubleTime
//! vibrio difficulty 1001682 -m HDDT
//!
//! # Performance of a play on a local .osu file
//! vibrio performance ./map.osu -m HD --n300 2019 --n100 104 --misses 3 --combo 3141
//!
//! # Performance from a replay
//! vibrio performance 1001682 --replay ./play.osr
//!
//! # Fetch a beatmap through the engine, or query and clear its cache
//! vibrio beatmap 1001682 > map.osu
//! vibrio beatmap 1001682 --status
//! vibrio beatmap --clear-cache
//! ```

use std::io::Write;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use argh::FromArgs;
use vibrio::{CalculationRequest, HitStatistics, Lazer, LazerConfig, ModSet, OsuMod};

#[derive(FromArgs)]
/// Vibrio - osu! difficulty and performance calculations
struct Cli {
    /// path to the engine executable (default: $VIBRIO_ENGINE_PATH, then lib/Vibrio next to this binary)
    #[argh(option, long = "engine")]
    engine: Option<PathBuf>,

    /// engine startup timeout in milliseconds
    #[argh(option, long = "startup-timeout-ms")]
    startup_timeout_ms: Option<u64>,

    /// forward the engine's own output to the log
    #[argh(switch, long = "engine-log")]
    engine_log: bool,

    #[argh(subcommand)]
    command: Commands,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    Difficulty(DifficultyArgs),
    Performance(PerformanceArgs),
    Beatmap(BeatmapArgs),
}

#[derive(FromArgs)]
#[argh(subcommand, name = "difficulty")]
/// calculate difficulty attributes
struct DifficultyArgs {
    /// beatmap id or path to a .osu file
    #[argh(positional)]
    beatmap: String,

    /// mods to apply, e.g. `-m HD -m DT` or `-m HDDT`
    #[argh(option, short = 'm', long = "mods")]
    mods: Vec<String>,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "performance")]
/// calculate performance attributes of a play
struct PerformanceArgs {
    /// beatmap id or path to a .osu file
    #[argh(positional)]
    beatmap: String,

    /// mods to apply, e.g. `-m HD -m DT` or `-m HDDT`
    #[argh(option, short = 'm', long = "mods")]
    mods: Vec<String>,

    /// number of 300s
    #[argh(option, long = "n300", default = "0")]
    count_300: u32,

    /// number of 100s
    #[argh(option, long = "n100", default = "0")]
    count_100: u32,

    /// number of 50s
    #[argh(option, long = "n50", default = "0")]
    count_50: u32,

    /// number of misses
    #[argh(option, long = "misses", default = "0")]
    count_miss: u32,

    /// max combo reached
    #[argh(option, long = "combo")]
    combo: Option<u32>,

    /// replay file to score instead of hit counts
    #[argh(option, long = "replay")]
    replay: Option<PathBuf>,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "beatmap")]
/// fetch a beatmap or manage the engine's beatmap cache
struct BeatmapArgs {
    /// beatmap id
    #[argh(positional)]
    id: Option<u32>,

    /// print whether the beatmap is cached instead of its content
    #[argh(switch, long = "status")]
    status: bool,

    /// clear the engine's beatmap cache
    #[argh(switch, long = "clear-cache")]
    clear_cache: bool,
}

fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    // stdout carries results only
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    let lazer = Lazer::new(session_config(&cli)?)?;
    let result = run(&lazer, cli.command);
    lazer.close();
    result
}

fn session_config(cli: &Cli) -> Result<LazerConfig> {
    let mut config = LazerConfig::from_env()?.with_engine_output_logged(cli.engine_log);
    if let Some(engine) = &cli.engine {
        config = config.with_executable(engine);
    }
    if let Some(ms) = cli.startup_timeout_ms {
        config = config.with_startup_timeout(Duration::from_millis(ms));
    }
    Ok(config)
}

fn run(lazer: &Lazer, command: Commands) -> Result<()> {
    match command {
        Commands::Difficulty(args) => {
            let request = beatmap_request(&args.beatmap)?.with_mods(parse_mods(&args.mods)?);
            let result = lazer.calculate(&request)?;
            println!("{}", serde_json::to_string(&result)?);
        }
        Commands::Performance(args) => {
            let request = performance_request(&args)?;
            tracing::debug!("Calculating performance for {}", args.beatmap);
            let performance = lazer.calculate_performance(&request)?;
            println!("{}", serde_json::to_string(&performance)?);
        }
        Commands::Beatmap(args) => {
            if args.clear_cache {
                lazer.clear_cache()?;
            }
            match (args.id, args.status) {
                (Some(id), true) => println!("{}", lazer.has_beatmap(id)?),
                (Some(id), false) => {
                    let content = lazer.get_beatmap(id)?;
                    let mut stdout = std::io::stdout().lock();
                    stdout.write_all(&content)?;
                    stdout.flush()?;
                }
                (None, true) => bail!("--status needs a beatmap id"),
                (None, false) if !args.clear_cache => bail!("expected a beatmap id or --clear-cache"),
                (None, false) => {}
            }
        }
    }
    Ok(())
}

/// Numeric arguments are beatmap ids, anything else a path to a `.osu` file.
fn beatmap_request(beatmap: &str) -> Result<CalculationRequest> {
    if let Ok(id) = beatmap.parse::<u32>() {
        return Ok(CalculationRequest::by_id(id));
    }
    let content =
        std::fs::read(beatmap).with_context(|| format!("Failed to read beatmap file {}", beatmap))?;
    Ok(CalculationRequest::by_content(content))
}

fn performance_request(args: &PerformanceArgs) -> Result<CalculationRequest> {
    let request = beatmap_request(&args.beatmap)?;
    match (&args.replay, args.combo) {
        (Some(path), _) => {
            if !args.mods.is_empty() {
                bail!("--mods cannot be combined with --replay; the replay carries its own mods");
            }
            let replay = std::fs::read(path)
                .with_context(|| format!("Failed to read replay file {}", path.display()))?;
            Ok(request.with_replay(replay))
        }
        (None, Some(combo)) => Ok(request.with_mods(parse_mods(&args.mods)?).with_hit_stats(
            HitStatistics::new(args.count_300, args.count_100, args.count_50, args.count_miss, combo),
        )),
        (None, None) => bail!("--combo is required unless --replay is given"),
    }
}

/// Accepts repeated, comma separated or concatenated acronyms (`HD,DT`, `HDDT`).
fn parse_mods(values: &[String]) -> Result<ModSet> {
    let mut mods = ModSet::new();
    for value in values {
        for part in value.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            if part.eq_ignore_ascii_case("NM") {
                continue;
            }
            if part.len() % 2 != 0 || !part.is_ascii() {
                bail!("Invalid mod list '{}'", part);
            }
            for i in (0..part.len()).step_by(2) {
                mods.insert(OsuMod::from_str(&part[i..i + 2])?);
            }
        }
    }
    Ok(mods)
}
