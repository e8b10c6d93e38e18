use anyhow::{anyhow, Result};
use clap::{builder::PossibleValue, Parser, ValueEnum};
use itertools::Itertools;
use log::{debug, info};
use regex::Regex;
use serde::Deserialize;
use std::{
    fs::{self, File},
    io::{BufRead, BufReader, BufWriter, Read, Write},
    path::{Path, PathBuf},
    process::{Command, Stdio},
    thread,
    time::{Duration, Instant},
};
use thiserror::Error;
use walkdir::WalkDir;

/// Collect TVC variant calls and run the cpscChecker utility.
/// Run from an Ion Torrent experiment results directory after the
/// Torrent Variant Caller plugin has finished.
#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct Args {
    /// Non-default lookup file for the cpscChecker utility
    #[arg(short, long, value_name = "LOOKUP", default_value = "mc")]
    pub lookup: String,

    /// Custom sample key to use for this run
    #[arg(short, long, value_name = "SAMPLEKEY")]
    pub samplekey: Option<String>,

    /// Skip cpscChecker (R&D server without standard sample IDs)
    #[arg(short, long)]
    pub r_and_d: bool,

    /// Experiment results directory
    #[arg(short = 'd', long, value_name = "RUNDIR", default_value = ".")]
    pub run_dir: PathBuf,

    /// TOML file overriding the discovery/checker conventions
    #[arg(short, long, value_name = "CONFIG")]
    pub config: Option<PathBuf>,

    /// Path to the cpscChecker executable
    #[arg(long, value_name = "CHECKER")]
    pub checker: Option<PathBuf>,

    /// Log level
    #[arg(long)]
    pub log: Option<LogLevel>,
}

#[derive(Debug, Clone)]
pub enum LogLevel {
    Info,
    Debug,
}

impl ValueEnum for LogLevel {
    fn value_variants<'a>() -> &'a [Self] {
        &[LogLevel::Info, LogLevel::Debug]
    }

    fn to_possible_value<'a>(&self) -> Option<PossibleValue> {
        Some(match self {
            LogLevel::Info => PossibleValue::new("info"),
            LogLevel::Debug => PossibleValue::new("debug"),
        })
    }
}

#[derive(Debug, Error)]
pub enum CollectorError {
    #[error("{0}")]
    Discovery(String),

    #[error("no variant files found under \"{}\"", .0.display())]
    NoVariants(PathBuf),

    #[error("{0}")]
    Io(String),

    #[error(
        "checker failed{}: {stderr}",
        match code {
            Some(c) => format!(" (exit code {c})"),
            _ => String::new(),
        }
    )]
    Checker { code: Option<i32>, stderr: String },

    #[error("checker did not finish within {0:?}")]
    Timeout(Duration),
}

impl CollectorError {
    pub fn exit_code(&self) -> i32 {
        match self {
            CollectorError::Discovery(_) => 2,
            CollectorError::NoVariants(_) => 3,
            CollectorError::Io(_) => 4,
            CollectorError::Checker { .. } => 5,
            CollectorError::Timeout(_) => 6,
        }
    }
}

/// Discovery, naming, and checker conventions. The TVC directory layout
/// and the cpscChecker contract vary between Torrent Server releases, so
/// none of these are hard-coded.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub discovery: DiscoveryConfig,
    pub output: OutputConfig,
    pub checker: CheckerConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub plugin_dir: String,
    pub results_pattern: String,
    pub variant_file: String,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            plugin_dir: "plugin_out".to_string(),
            results_pattern: "^variantCaller_out".to_string(),
            variant_file: "alleles.txt".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub suffix: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            suffix: "_collected_variants.txt".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct CheckerConfig {
    pub program: String,
    pub timeout_secs: u64,
}

impl Default for CheckerConfig {
    fn default() -> Self {
        Self {
            program: "cpscChecker.pl".to_string(),
            timeout_secs: 600,
        }
    }
}

impl Config {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => {
                let text = fs::read_to_string(path).map_err(|e| {
                    CollectorError::Io(format!(
                        "Cannot read {}: {e}",
                        path.display()
                    ))
                })?;
                toml::from_str(&text)
                    .map_err(|e| anyhow!("Cannot parse {}: {e}", path.display()))
            }
            _ => Ok(Self::default()),
        }
    }
}

// --------------------------------------------------
pub fn run(args: Args) -> Result<()> {
    let start = Instant::now();
    let _ = env_logger::Builder::new()
        .filter_level(match args.log {
            Some(LogLevel::Debug) => log::LevelFilter::Debug,
            Some(LogLevel::Info) => log::LevelFilter::Info,
            _ => log::LevelFilter::Off,
        })
        .try_init();

    info!("args = {args:#?}");

    let config = Config::load(args.config.as_deref())?;
    debug!("config = {config:#?}");

    let run_dir = fs::canonicalize(&args.run_dir).map_err(|e| {
        CollectorError::Io(format!(
            "Cannot read {}: {e}",
            args.run_dir.display()
        ))
    })?;

    let files = discover_variant_files(&run_dir, &config.discovery)?;
    if files.is_empty() {
        return Err(CollectorError::NoVariants(run_dir).into());
    }
    info!("Found {} variant file(s)", files.len());
    debug!(
        "files = {}",
        files.iter().map(|f| f.display().to_string()).join(", ")
    );

    let aggregate =
        run_dir.join(format!("{}{}", run_id(&run_dir), config.output.suffix));
    concatenate(&files, &aggregate)?;
    info!(r#"Wrote aggregate "{}""#, aggregate.display());

    if args.r_and_d {
        info!("R&D run, skipping {}", config.checker.program);
    } else {
        let checker = resolve_checker(args.checker.as_deref(), &config.checker)?;
        run_checker(
            &checker,
            &aggregate,
            &args.lookup,
            args.samplekey.as_deref(),
            Duration::from_secs(config.checker.timeout_secs),
        )?;
    }

    println!(
        r#"Collected {} sample file(s) into "{}" in {} seconds"#,
        files.len(),
        aggregate.display(),
        start.elapsed().as_secs()
    );

    Ok(())
}

// --------------------------------------------------
// Scan the TVC plugin output for per-barcode variant files. Reruns of
// the plugin leave numbered directories; the highest rerun number wins.
pub fn discover_variant_files(
    run_dir: &Path,
    config: &DiscoveryConfig,
) -> Result<Vec<PathBuf>> {
    let plugin_dir = run_dir.join(&config.plugin_dir);
    if !plugin_dir.is_dir() {
        return Err(CollectorError::Discovery(format!(
            r#"no "{}" directory under "{}", has the TVC plugin been run?"#,
            config.plugin_dir,
            run_dir.display()
        ))
        .into());
    }

    let pattern = Regex::new(&config.results_pattern).map_err(|e| {
        anyhow!(r#"invalid results_pattern "{}": {e}"#, config.results_pattern)
    })?;

    let mut tvc_dirs = vec![];
    for entry in WalkDir::new(&plugin_dir).min_depth(1).max_depth(1) {
        let entry = entry?;
        if entry.file_type().is_dir()
            && pattern.is_match(&entry.file_name().to_string_lossy())
        {
            tvc_dirs.push(entry.into_path());
        }
    }
    tvc_dirs.sort_by_key(|dir| rerun_sort_key(dir));

    let tvc_dir = tvc_dirs.pop().ok_or_else(|| {
        CollectorError::Discovery(format!(
            r#"no TVC output directory matching "{}" under "{}""#,
            config.results_pattern,
            plugin_dir.display()
        ))
    })?;
    info!(r#"Collecting from "{}""#, tvc_dir.display());

    let mut files = vec![];

    // Non-barcoded runs write a single file at the top level
    let top_level = tvc_dir.join(&config.variant_file);
    if top_level.is_file() {
        files.push(top_level);
    }

    let mut barcode_dirs = vec![];
    for entry in WalkDir::new(&tvc_dir).min_depth(1).max_depth(1) {
        let entry = entry?;
        if entry.file_type().is_dir() {
            barcode_dirs.push(entry.into_path());
        }
    }
    barcode_dirs.sort();

    for barcode_dir in barcode_dirs {
        let file = barcode_dir.join(&config.variant_file);
        if file.is_file() {
            files.push(file);
        } else {
            debug!(
                r#"no "{}" in "{}""#,
                config.variant_file,
                barcode_dir.display()
            );
        }
    }

    Ok(files)
}

// --------------------------------------------------
// Line-wise so the aggregate's line count is the sum of the inputs',
// even when an input is missing its final newline.
pub fn concatenate(files: &[PathBuf], outpath: &Path) -> Result<()> {
    let mut output = open_for_write(outpath)?;
    for filename in files {
        let file = open(filename)?;
        for line in file.lines() {
            let line = line.map_err(|e| {
                CollectorError::Io(format!(
                    "Cannot read {}: {e}",
                    filename.display()
                ))
            })?;
            writeln!(output, "{line}").map_err(|e| {
                CollectorError::Io(format!(
                    "Cannot write {}: {e}",
                    outpath.display()
                ))
            })?;
        }
    }
    output.flush().map_err(|e| {
        CollectorError::Io(format!("Cannot write {}: {e}", outpath.display()))
    })?;

    Ok(())
}

// --------------------------------------------------
fn resolve_checker(
    explicit: Option<&Path>,
    config: &CheckerConfig,
) -> Result<PathBuf> {
    match explicit {
        Some(path) => Ok(path.to_path_buf()),
        _ => which::which(&config.program).map_err(|e| {
            CollectorError::Checker {
                code: None,
                stderr: format!("{}: {e}", config.program),
            }
            .into()
        }),
    }
}

// --------------------------------------------------
pub fn run_checker(
    checker: &Path,
    aggregate: &Path,
    lookup: &str,
    samplekey: Option<&str>,
    timeout: Duration,
) -> Result<()> {
    let mut checker_args = vec!["-l".to_string(), lookup.to_string()];
    if let Some(key) = samplekey {
        checker_args.extend_from_slice(&["-s".to_string(), key.to_string()]);
    }
    checker_args.push(aggregate.to_string_lossy().to_string());

    info!(r#"Running "{} {}""#, checker.display(), checker_args.join(" "));

    let mut child = Command::new(checker)
        .args(&checker_args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| CollectorError::Checker {
            code: None,
            stderr: format!("{}: {e}", checker.display()),
        })?;

    // Drain the pipes while the child runs, or a chatty checker fills
    // the pipe buffer, blocks on write, and never exits
    let stdout_reader = spawn_pipe_reader(child.stdout.take());
    let stderr_reader = spawn_pipe_reader(child.stderr.take());

    let deadline = Instant::now() + timeout;
    let status = loop {
        let status = child.try_wait().map_err(|e| {
            CollectorError::Io(format!(
                "Cannot wait on {}: {e}",
                checker.display()
            ))
        })?;
        match status {
            Some(status) => break status,
            _ if Instant::now() >= deadline => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(CollectorError::Timeout(timeout).into());
            }
            _ => thread::sleep(Duration::from_millis(50)),
        }
    };

    let stdout = stdout_reader.join().unwrap_or_default();
    let stderr = stderr_reader.join().unwrap_or_default();

    if !status.success() {
        return Err(CollectorError::Checker {
            code: status.code(),
            stderr: String::from_utf8_lossy(&stderr).trim().to_string(),
        }
        .into());
    }

    let stdout = String::from_utf8_lossy(&stdout);
    if !stdout.trim().is_empty() {
        info!("Checker output:\n{}", stdout.trim());
    }

    Ok(())
}

// --------------------------------------------------
fn spawn_pipe_reader<R: Read + Send + 'static>(
    pipe: Option<R>,
) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = vec![];
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        buf
    })
}

// --------------------------------------------------
// Orders "variantCaller_out.10" after "variantCaller_out.9"
fn rerun_sort_key(dir: &Path) -> (String, u64) {
    let name = dir
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    if let Some((stem, number)) = name.rsplit_once('.') {
        if let Ok(number) = number.parse() {
            return (stem.to_string(), number);
        }
    }
    (name, 0)
}

// --------------------------------------------------
fn run_id(run_dir: &Path) -> String {
    run_dir
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| "run".to_string())
}

// --------------------------------------------------
fn open(filename: &Path) -> Result<Box<dyn BufRead>> {
    Ok(Box::new(BufReader::new(File::open(filename).map_err(
        |e| {
            CollectorError::Io(format!(
                "Cannot read {}: {e}",
                filename.display()
            ))
        },
    )?)))
}

// --------------------------------------------------
fn open_for_write(filename: &Path) -> Result<Box<dyn Write>> {
    Ok(Box::new(BufWriter::new(File::create(filename).map_err(
        |e| {
            CollectorError::Io(format!(
                "Cannot write {}: {e}",
                filename.display()
            ))
        },
    )?)))
}
