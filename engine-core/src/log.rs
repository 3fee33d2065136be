#![allow(unused)]
use colored::{Color, ColoredString, Colorize};
use std::fmt;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

pub use colored::control;

pub type BoxedCollector = Box<dyn OutputCollector + Send + Sync>;

lazy_static! {
    pub static ref GLOBAL_OUTPUT_COLLECTOR: RwLock<Box<dyn OutputCollector + 'static + Sync + Send>> =
        RwLock::new(Box::new(Logger::stdout(None)));
    static ref ERROR: ColoredString = Level::Error.as_ref().to_ascii_uppercase().red();
    static ref WARN: ColoredString = Level::Warn.as_ref().to_ascii_uppercase().yellow();
    static ref INFO: ColoredString = Level::Info.as_ref().to_ascii_uppercase().green();
    static ref DEBUG: ColoredString = Level::Debug.as_ref().to_ascii_uppercase().bright_white();
    static ref TRACE: ColoredString = Level::Trace.as_ref().to_ascii_uppercase().cyan();
    static ref L_BRACE: ColoredString = "[".color(Color::TrueColor {
        r: 74,
        g: 87,
        b: 107
    });
    static ref R_BRACE: ColoredString = "]".color(Color::TrueColor {
        r: 74,
        g: 87,
        b: 107
    });
}

#[derive(Debug, Clone)]
pub struct Config {
    location: OutputLocation,
    level: Level,
    no_color: bool,
}

impl Config {
    pub fn file<P: AsRef<Path>>(path: P) -> Self {
        Self {
            location: OutputLocation::File(path.as_ref().to_path_buf()),
            level: Level::default(),
            no_color: true,
        }
    }

    pub fn stdout() -> Self {
        Self {
            location: OutputLocation::Stdout,
            level: Level::default(),
            no_color: false,
        }
    }

    pub fn no_color(mut self, no_color: bool) -> Self {
        self.no_color = no_color;
        self
    }

    pub fn level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    pub fn as_collector(self) -> std::io::Result<BoxedCollector> {
        match self.location {
            OutputLocation::File(path) => {
                let mut logger = Logger::file(path, Some(self.level))?;
                logger.set_no_color(self.no_color);
                Ok(Box::new(logger))
            }
            OutputLocation::Stdout => {
                let mut logger = Logger::stdout(Some(self.level));
                logger.set_no_color(self.no_color);
                Ok(Box::new(logger))
            }
        }
    }

    /// Installs a collector built from this config as the process-wide sink.
    pub fn install(self) -> std::io::Result<()> {
        let collector = self.as_collector()?;
        *GLOBAL_OUTPUT_COLLECTOR.write().unwrap() = collector;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub enum OutputLocation {
    File(PathBuf),
    Stdout,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl Level {
    fn colored_string(&self) -> &'static ColoredString {
        match &self {
            Level::Error => &ERROR,
            Level::Debug => &DEBUG,
            Level::Info => &INFO,
            Level::Warn => &WARN,
            Level::Trace => &TRACE,
        }
    }
}

impl Default for Level {
    fn default() -> Self {
        Level::Info
    }
}

impl AsRef<str> for Level {
    fn as_ref(&self) -> &str {
        match &self {
            Level::Error => "error",
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Trace => "trace",
        }
    }
}

/// Outcome marker attached to a prefixed stream line.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Marker {
    Line,
    Success,
    Failed,
}

pub struct Arguments<'args> {
    pub level: Option<Level>,
    pub prefix: Option<&'args str>,
    pub marker: Marker,
    pub args: fmt::Arguments<'args>,
}

impl<'args> Arguments<'args> {
    pub fn new(args: fmt::Arguments<'args>) -> Self {
        Self {
            level: None,
            prefix: None,
            marker: Marker::Line,
            args,
        }
    }

    pub fn level(mut self, level: Level) -> Self {
        self.level = Some(level);
        self
    }

    pub fn prefix(mut self, prefix: &'args str) -> Self {
        self.prefix = Some(prefix);
        self
    }

    pub fn marker(mut self, marker: Marker) -> Self {
        self.marker = marker;
        self
    }
}

pub trait OutputCollector: Writer + Leveled + Colored {}

pub trait Writer {
    fn write_out(&mut self, args: Arguments<'_>) -> io::Result<()>;
}

pub trait Leveled {
    fn set_level(&mut self, level: Level);
}

pub trait Colored {
    fn set_override(&mut self, should_color: bool);
}

pub struct Logger<'l> {
    level: Level,
    handle: Box<dyn std::io::Write + Send + Sync + 'l>,
    timestamp: bool,
    no_color: bool,
}

impl<'l> Logger<'l> {
    pub fn new(
        handle: impl std::io::Write + Send + Sync + 'l,
        level: Option<Level>,
        no_color: bool,
    ) -> Self {
        Self {
            level: level.unwrap_or_default(),
            handle: Box::new(handle),
            timestamp: true,
            no_color,
        }
    }

    pub fn stdout(level: Option<Level>) -> Self {
        Self::new(std::io::stdout(), level, false)
    }

    pub fn file(path: impl AsRef<Path>, level: Option<Level>) -> io::Result<Self> {
        Ok(Self::new(
            File::open(path.as_ref()).or_else(|_| File::create(path.as_ref()))?,
            level,
            true,
        ))
    }

    pub fn set_no_color(&mut self, no_color: bool) {
        self.no_color = no_color;
    }

    pub fn set_timestamp(&mut self, timestamp: bool) {
        self.timestamp = timestamp;
    }

    fn verify_should_colorize(&self) {
        let control = &colored::control::SHOULD_COLORIZE;
        if control.should_colorize() && self.no_color {
            control.set_override(false);
        } else if !control.should_colorize() && !self.no_color {
            control.set_override(true);
        }
    }
}

impl<'l> Writer for Logger<'l> {
    fn write_out(&mut self, args: Arguments<'_>) -> std::io::Result<()> {
        use chrono::prelude::*;

        self.verify_should_colorize();

        let level = if let Some(level) = args.level {
            if level > self.level {
                return Ok(());
            } else {
                level
            }
        } else {
            self.level
        };

        let mut s = format!("{}{: ^5}{}", *L_BRACE, level.colored_string(), *R_BRACE);

        if self.timestamp {
            s.push_str(&format!(
                "{}{}{}",
                *L_BRACE,
                Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
                *R_BRACE
            ));
        }

        if let Some(prefix) = args.prefix {
            s.push_str(&format!("{}", prefix.bright_blue()));
        }

        s.push(' ');
        let line = format!("{}", args.args);
        match args.marker {
            Marker::Line => s.push_str(&line),
            Marker::Success => s.push_str(&format!("{}", line.green())),
            Marker::Failed => s.push_str(&format!("{}", line.red())),
        }
        s.push('\n');

        write!(&mut self.handle, "{}", s)
    }
}

impl<'l> Leveled for Logger<'l> {
    fn set_level(&mut self, level: Level) {
        self.level = level;
    }
}

impl<'l> Colored for Logger<'l> {
    fn set_override(&mut self, should_color: bool) {
        self.no_color = !should_color;
    }
}

impl<'l> OutputCollector for Logger<'l> {}

// ################################################################################
// Prefixed stream aggregation.
//
// Producers tag lines with the container prefix; each producer writes its
// lines in program order and the collector lock serialises across producers,
// so interleaving happens at line granularity only and per-prefix order is
// preserved. These take the write lock (never `try_write`) - a contended
// stream line must not be dropped.

/// Writes one container output line under `prefix`.
pub fn log_message(prefix: &str, line: &str) {
    emit(prefix, line, Marker::Line);
}

/// Writes a success marker line under `prefix`.
pub fn success_message(prefix: &str, line: &str) {
    emit(prefix, line, Marker::Success);
}

/// Writes a failure marker line under `prefix`.
pub fn failed_message(prefix: &str, line: &str) {
    emit(prefix, line, Marker::Failed);
}

fn emit(prefix: &str, line: &str, marker: Marker) {
    if let Ok(mut collector) = GLOBAL_OUTPUT_COLLECTOR.write() {
        let res = collector.write_out(
            Arguments::new(format_args!("{}", line))
                .level(Level::Info)
                .prefix(prefix)
                .marker(marker),
        );
        if let Err(e) = res {
            eprintln!("logging failed - {}", e);
        }
    }
}

/// Copies `reader` line by line into the global sink, untagged. Returns the
/// number of bytes read.
pub fn copy(reader: impl Read) -> io::Result<u64> {
    let mut reader = BufReader::new(reader);
    let mut line = String::new();
    let mut copied = 0u64;
    loop {
        line.clear();
        let n = reader.read_line(&mut line)?;
        if n == 0 {
            break;
        }
        copied += n as u64;
        if let Ok(mut collector) = GLOBAL_OUTPUT_COLLECTOR.write() {
            collector.write_out(
                Arguments::new(format_args!("{}", line.trim_end_matches('\n'))).level(Level::Info),
            )?;
        }
    }
    Ok(copied)
}

#[macro_export]
macro_rules! write_out {
    (-> $dst:expr, $($arg:tt)*) =>
    {{
         use $crate::log::Arguments;
         $dst.write_out(Arguments::new(format_args!($($arg)*)))
     }};
    (error -> $dst:expr, $($arg:tt)*) =>
    {{
         use $crate::log::{Arguments, Level};
         $dst.write_out(Arguments::new(format_args!($($arg)*)).level(Level::Error))
     }};
    (info -> $dst:expr, $($arg:tt)*) =>
    {{
         use $crate::log::{Arguments, Level};
         $dst.write_out(Arguments::new(format_args!($($arg)*)).level(Level::Info))
     }};
    (debug -> $dst:expr, $($arg:tt)*) =>
    {{
         use $crate::log::{Arguments, Level};
         $dst.write_out(Arguments::new(format_args!($($arg)*)).level(Level::Debug))
     }};
    (warn -> $dst:expr, $($arg:tt)*) =>
    {{
         use $crate::log::{Arguments, Level};
         $dst.write_out(Arguments::new(format_args!($($arg)*)).level(Level::Warn))
     }};
    (trace -> $dst:expr, $($arg:tt)*) =>
    {{
         use $crate::log::{Arguments, Level};
         $dst.write_out(Arguments::new(format_args!($($arg)*)).level(Level::Trace))
     }};
}

#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => {{
        use $crate::log::GLOBAL_OUTPUT_COLLECTOR;
        if let Ok(mut collector) = GLOBAL_OUTPUT_COLLECTOR.write() {
            if let Err(e) = $crate::write_out!(error -> collector, $($arg)*) {
                eprintln!("logging failed - {}", e);
            }
        }
    }};
}

#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => {{
        use $crate::log::GLOBAL_OUTPUT_COLLECTOR;
        if let Ok(mut collector) = GLOBAL_OUTPUT_COLLECTOR.write() {
            if let Err(e) = $crate::write_out!(info -> collector, $($arg)*) {
                eprintln!("logging failed - {}", e);
            }
        }
    }};
}

#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => {{
        use $crate::log::GLOBAL_OUTPUT_COLLECTOR;
        if let Ok(mut collector) = GLOBAL_OUTPUT_COLLECTOR.write() {
            if let Err(e) = $crate::write_out!(debug -> collector, $($arg)*) {
                eprintln!("logging failed - {}", e);
            }
        }
    }};
}

#[macro_export]
macro_rules! warning {
    ($($arg:tt)*) => {{
        use $crate::log::GLOBAL_OUTPUT_COLLECTOR;
        if let Ok(mut collector) = GLOBAL_OUTPUT_COLLECTOR.write() {
            if let Err(e) = $crate::write_out!(warn -> collector, $($arg)*) {
                eprintln!("logging failed - {}", e);
            }
        }
    }};
}

#[macro_export]
macro_rules! trace {
    ($($arg:tt)*) => {{
        use $crate::log::GLOBAL_OUTPUT_COLLECTOR;
        if let Ok(mut collector) = GLOBAL_OUTPUT_COLLECTOR.try_write() {
            if let Err(e) = $crate::write_out!(trace -> collector, $($arg)*) {
                eprintln!("logging failed - {}", e);
            }
        }
    }};
}

pub use {debug, error, info, trace, warning, write_out};
