//! Emergency notification over a cellular modem.

pub mod dispatcher;
pub mod reconnect;
pub mod transport;
pub mod upload;
pub mod voice;

use log::warn;

pub use dispatcher::{AlertAttempt, AlertDispatcher, AlertReport, AudioBackend, Channel};
pub use transport::{
    AtClient, CommandOutcome, DryRunTransport, ModemLink, SerialTransport, Transport,
    TransportError,
};
pub use upload::{FlashUpload, UploadError, UploadReport};
pub use voice::{
    prepare_voice_message, AudioError, AudioPlayer, CommandPlayer, CommandSynthesizer,
    SpeechSynthesizer,
};

use crate::clock::SystemClock;
use crate::config::{AlertConfig, AlertMode};

pub type SerialDispatcher = AlertDispatcher<ModemLink<SerialTransport, SystemClock>, SystemClock>;

/// Dispatcher on the configured serial port. A missing port leaves it in
/// detection-only mode with background reopen attempts.
pub fn serial_dispatcher(config: &AlertConfig) -> SerialDispatcher {
    let port = config.modem_port.clone();
    let baud_rate = config.baud_rate;
    let link = ModemLink::connect(
        Box::new(move || SerialTransport::open(&port, baud_rate)),
        SystemClock,
    );
    let dispatcher = AlertDispatcher::new(link, SystemClock, config.clone());

    match &config.mode {
        AlertMode::VoiceMessage {
            text,
            language,
            audio_path,
            ..
        } => {
            let mut synthesizer = CommandSynthesizer::new(config.tts_command.clone());
            // Render now so the first call does not wait on synthesis.
            if let Err(e) = prepare_voice_message(&mut synthesizer, text, language, audio_path) {
                warn!("[ALERT] voice message not ready ({}), calls will retry or use tones", e);
            }
            dispatcher.with_audio(AudioBackend {
                synthesizer: Box::new(synthesizer),
                player: Box::new(CommandPlayer::new(config.player_command.clone())),
            })
        }
        AlertMode::Tones { .. } => dispatcher,
    }
}
