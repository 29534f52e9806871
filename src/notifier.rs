//! Logging setup and build-step progress.
//!
//! [`Notifier::init`] installs `env_logger` for the whole process, filtered by
//! a [`VerbosityLevel`] (`RUST_LOG` still applies on top). In
//! [`VerbosityLevel::Quiet`] only warnings are logged and step messages drive
//! an `indicatif` spinner instead; any other level writes them as log records.

use env_logger::Env;
use indicatif::{ProgressBar, ProgressStyle};
use log::LevelFilter;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum VerbosityLevel {
    Quiet = 0, // Spinner, warnings only
    Info = 1,
    Debug = 2,
    Trace = 3,
}

impl From<u8> for VerbosityLevel {
    fn from(level: u8) -> Self {
        match level {
            0 => VerbosityLevel::Quiet,
            1 => VerbosityLevel::Info,
            2 => VerbosityLevel::Debug,
            _ => VerbosityLevel::Trace,
        }
    }
}

impl VerbosityLevel {
    pub fn to_log_level(self) -> LevelFilter {
        match self {
            VerbosityLevel::Quiet => LevelFilter::Warn,
            VerbosityLevel::Info => LevelFilter::Info,
            VerbosityLevel::Debug => LevelFilter::Debug,
            VerbosityLevel::Trace => LevelFilter::Trace,
        }
    }
}

pub struct Notifier {
    verbosity: VerbosityLevel,
    spinner: Option<ProgressBar>,
}

impl Notifier {
    /// Installs the global logger. Safe to call more than once; later calls
    /// keep the first logger.
    pub fn init(verbosity_level: u8) -> Self {
        let verbosity = VerbosityLevel::from(verbosity_level);
        let _ = env_logger::Builder::from_env(Env::default())
            .filter_level(verbosity.to_log_level())
            .try_init();
        Self::without_logger(verbosity)
    }

    /// A notifier that leaves logger installation to the caller.
    pub fn without_logger(verbosity: VerbosityLevel) -> Self {
        Self {
            verbosity,
            spinner: None,
        }
    }

    pub fn verbosity_level(&self) -> VerbosityLevel {
        self.verbosity
    }

    fn spinner(&mut self) -> &ProgressBar {
        self.spinner.get_or_insert_with(|| {
            let spinner = ProgressBar::new_spinner();
            if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} {msg}") {
                spinner.set_style(style);
            }
            spinner.enable_steady_tick(Duration::from_millis(100));
            spinner
        })
    }

    /// Reports the step currently running.
    pub fn step(&mut self, message: &str) {
        match self.verbosity {
            VerbosityLevel::Quiet => self.spinner().set_message(message.to_string()),
            _ => log::info!("{}", message),
        }
    }

    pub fn layer_progress(&mut self, current: usize, total: usize, digest: &str) {
        let short = digest.split(':').nth(1).unwrap_or(digest);
        let short = &short[..short.len().min(12)];
        self.step(&format!("Layer {}/{} ({})", current, total, short));
    }

    pub fn finish(&mut self, message: &str) {
        match self.spinner.take() {
            Some(spinner) => spinner.finish_with_message(message.to_string()),
            None => log::info!("{}", message),
        }
    }
}

impl Drop for Notifier {
    fn drop(&mut self) {
        if let Some(spinner) = self.spinner.take() {
            spinner.finish_and_clear();
        }
    }
}
