//! Spoken alert message: synthesis once, playback per call.

use std::path::{Path, PathBuf};
use std::process::Command;

use log::{info, warn};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AudioError {
    #[error("audio command is empty")]
    EmptyCommand,

    #[error("failed to launch `{program}`")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{program}` exited with status {status:?}")]
    Failed { program: String, status: Option<i32> },

    #[error("audio file {0} is missing")]
    Missing(PathBuf),
}

pub trait SpeechSynthesizer {
    fn synthesize(&mut self, text: &str, language: &str, out: &Path) -> Result<(), AudioError>;
}

pub trait AudioPlayer {
    fn play(&mut self, path: &Path) -> Result<(), AudioError>;
}

/// Runs `argv` after substituting `{text}`, `{lang}` and `{out}`.
#[derive(Clone, Debug)]
pub struct CommandSynthesizer {
    argv: Vec<String>,
}

impl CommandSynthesizer {
    pub fn new(argv: Vec<String>) -> Self {
        Self { argv }
    }
}

impl SpeechSynthesizer for CommandSynthesizer {
    fn synthesize(&mut self, text: &str, language: &str, out: &Path) -> Result<(), AudioError> {
        let out = out.to_string_lossy();
        let argv: Vec<String> = self
            .argv
            .iter()
            .map(|arg| {
                arg.replace("{text}", text)
                    .replace("{lang}", language)
                    .replace("{out}", &out)
            })
            .collect();
        run(&argv)
    }
}

/// Runs `argv` with `{file}` substituted, or the file appended when no placeholder is present.
#[derive(Clone, Debug)]
pub struct CommandPlayer {
    argv: Vec<String>,
}

impl CommandPlayer {
    pub fn new(argv: Vec<String>) -> Self {
        Self { argv }
    }
}

impl AudioPlayer for CommandPlayer {
    fn play(&mut self, path: &Path) -> Result<(), AudioError> {
        if !path.exists() {
            return Err(AudioError::Missing(path.to_path_buf()));
        }
        let file = path.to_string_lossy();
        let mut argv: Vec<String> = self.argv.iter().map(|a| a.replace("{file}", &file)).collect();
        if !self.argv.iter().any(|a| a.contains("{file}")) {
            argv.push(file.to_string());
        }
        run(&argv)
    }
}

fn run(argv: &[String]) -> Result<(), AudioError> {
    let (program, args) = argv.split_first().ok_or(AudioError::EmptyCommand)?;
    let status = Command::new(program)
        .args(args)
        .status()
        .map_err(|source| AudioError::Spawn {
            program: program.clone(),
            source,
        })?;
    if status.success() {
        Ok(())
    } else {
        Err(AudioError::Failed {
            program: program.clone(),
            status: status.code(),
        })
    }
}

/// Make sure the rendered message exists at `path`, synthesizing it only when missing.
pub fn prepare_voice_message(
    synthesizer: &mut dyn SpeechSynthesizer,
    text: &str,
    language: &str,
    path: &Path,
) -> Result<PathBuf, AudioError> {
    if path.exists() {
        info!("[ALERT] reusing voice message {}", path.display());
        return Ok(path.to_path_buf());
    }
    info!("[ALERT] synthesizing voice message to {}", path.display());
    if let Err(e) = synthesizer.synthesize(text, language, path) {
        warn!("[ALERT] voice synthesis failed: {}", e);
        return Err(e);
    }
    if path.exists() {
        Ok(path.to_path_buf())
    } else {
        Err(AudioError::Missing(path.to_path_buf()))
    }
}
