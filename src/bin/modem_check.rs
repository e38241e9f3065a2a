use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use log::info;

use fall_monitor_rs::alert::{
    serial_dispatcher, AtClient, FlashUpload, SerialDispatcher, SerialTransport, Transport,
};
use fall_monitor_rs::clock::{current_timestamp, Clock, SystemClock};
use fall_monitor_rs::config::{AlertMode, MonitorConfig};
use fall_monitor_rs::Incident;

#[derive(Parser, Debug)]
#[command(name = "modem_check")]
#[command(about = "Exercise the alert modem without running detection", long_about = None)]
struct Args {
    /// JSON configuration file (alert section is used)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Modem serial port
    #[arg(long)]
    port: Option<String>,

    /// Number to message or call
    #[arg(long)]
    phone: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send AT and report whether the module answers
    Ping,
    /// Send one SMS
    Sms {
        #[arg(long)]
        message: Option<String>,
    },
    /// Place one alert call
    Call,
    /// Full alert sequence as for a confirmed fall
    Alert,
    /// Copy an audio file into the module's flash
    Upload {
        /// Local file (defaults to the configured voice message audio)
        #[arg(long)]
        file: Option<PathBuf>,
        /// Name on the module (defaults to the local file name)
        #[arg(long)]
        name: Option<String>,
    },
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = MonitorConfig::load(args.config.as_deref()).context("loading configuration")?;
    if let Some(port) = args.port {
        config.alert.modem_port = port;
    }
    if let Some(phone) = args.phone {
        config.alert.phone_number = phone;
    }
    match args.command {
        Command::Ping => {
            let mut dispatcher = open_dispatcher(&config, false)?;
            let outcome = dispatcher.ping();
            if outcome.ok {
                info!("[MODEM] module answered: {}", outcome.response);
            } else {
                bail!("module did not answer OK (got {:?})", outcome.response);
            }
        }
        Command::Sms { message } => {
            let mut dispatcher = open_dispatcher(&config, true)?;
            let text = message.unwrap_or_else(|| config.alert.sms_message.clone());
            let attempt = dispatcher.send_sms(&text, SystemClock.now());
            println!("{}", serde_json::to_string_pretty(&attempt)?);
            if !attempt.success {
                bail!("SMS failed: {}", attempt.detail);
            }
        }
        Command::Call => {
            let mut dispatcher = open_dispatcher(&config, true)?;
            let attempt = dispatcher.place_call(SystemClock.now());
            println!("{}", serde_json::to_string_pretty(&attempt)?);
            if !attempt.success {
                bail!("call failed: {}", attempt.detail);
            }
        }
        Command::Alert => {
            let mut dispatcher = open_dispatcher(&config, true)?;
            let now = current_timestamp();
            let incident = Incident::new(1, now, now, &config.alert.sms_message);
            let report = dispatcher.dispatch(&incident);
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.any_success() {
                bail!("every alert channel failed");
            }
        }
        Command::Upload { file, name } => upload(&config, file.as_deref(), name.as_deref())?,
    }
    Ok(())
}

fn open_dispatcher(config: &MonitorConfig, needs_number: bool) -> anyhow::Result<SerialDispatcher> {
    if needs_number && config.alert.phone_number.is_empty() {
        bail!("no phone number: pass --phone or set alert.phone_number");
    }
    let dispatcher = serial_dispatcher(&config.alert);
    if !dispatcher.transport().is_connected() {
        bail!("cannot open modem port {}", config.alert.modem_port);
    }
    Ok(dispatcher)
}

fn upload(config: &MonitorConfig, file: Option<&Path>, name: Option<&str>) -> anyhow::Result<()> {
    let local = match (file, &config.alert.mode) {
        (Some(path), _) => path.to_path_buf(),
        (None, AlertMode::VoiceMessage { audio_path, .. }) => audio_path.clone(),
        (None, AlertMode::Tones { .. }) => bail!("no audio file: pass --file"),
    };
    let remote = match name {
        Some(name) => name.to_string(),
        None => local
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .with_context(|| format!("no file name in {}", local.display()))?,
    };
    let data = std::fs::read(&local).with_context(|| format!("reading {}", local.display()))?;

    let transport = SerialTransport::open(&config.alert.modem_port, config.alert.baud_rate)
        .with_context(|| format!("opening {}", config.alert.modem_port))?;
    let mut at = AtClient::new(transport, SystemClock);
    let report = FlashUpload::default()
        .run(&mut at, &remote, &data)
        .with_context(|| format!("uploading {}", local.display()))?;
    info!("[MODEM] {} bytes stored as {}", report.bytes, report.remote_name);
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
