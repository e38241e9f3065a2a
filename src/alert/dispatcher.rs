use std::path::Path;

use log::{error, info, warn};
use serde::{Deserialize, Serialize};

use crate::alert::transport::{AtClient, CommandOutcome, Transport};
use crate::alert::voice::{prepare_voice_message, AudioPlayer, SpeechSynthesizer};
use crate::clock::{secs, Clock};
use crate::config::{AlertConfig, AlertMode};
use crate::incident::Incident;

const FALLBACK_TONE_SECS: f64 = 20.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Sms,
    VoiceCall,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AlertAttempt {
    pub channel: Channel,
    pub success: bool,
    /// SMS: submission confirmed. Call: dial acknowledged.
    pub timestamp: f64,
    /// From dispatch start to `timestamp`.
    pub latency_secs: f64,
    pub detail: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AlertReport {
    pub incident_id: u64,
    pub started_at: f64,
    pub finished_at: f64,
    pub attempts: Vec<AlertAttempt>,
    /// Incident was already handled; nothing was sent.
    pub skipped: bool,
}

impl AlertReport {
    pub fn attempt(&self, channel: Channel) -> Option<&AlertAttempt> {
        self.attempts.iter().find(|a| a.channel == channel)
    }

    pub fn any_success(&self) -> bool {
        self.attempts.iter().any(|a| a.success)
    }
}

pub struct AudioBackend {
    pub synthesizer: Box<dyn SpeechSynthesizer>,
    pub player: Box<dyn AudioPlayer>,
}

/// Sends the SMS and places the call for a confirmed fall.
///
/// Every step is best-effort: failures end up in the report, never as errors.
pub struct AlertDispatcher<T: Transport, C: Clock + Clone> {
    modem: AtClient<T, C>,
    clock: C,
    config: AlertConfig,
    audio: Option<AudioBackend>,
    last_incident: Option<u64>,
}

impl<T: Transport, C: Clock + Clone> AlertDispatcher<T, C> {
    pub fn new(transport: T, clock: C, config: AlertConfig) -> Self {
        Self {
            modem: AtClient::new(transport, clock.clone()),
            clock,
            config,
            audio: None,
            last_incident: None,
        }
    }

    pub fn with_audio(mut self, audio: AudioBackend) -> Self {
        self.audio = Some(audio);
        self
    }

    pub fn config(&self) -> &AlertConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        self.modem.transport()
    }

    /// Check that the module answers at all.
    pub fn ping(&mut self) -> CommandOutcome {
        let wait = secs(self.config.timings.ping_wait);
        self.modem.command("AT", "OK", wait)
    }

    pub fn dispatch(&mut self, incident: &Incident) -> AlertReport {
        let started_at = self.clock.now();
        if self.last_incident.is_some_and(|last| incident.id <= last) {
            warn!("[ALERT] incident {} already dispatched, ignoring", incident.id);
            return AlertReport {
                incident_id: incident.id,
                started_at,
                finished_at: started_at,
                attempts: Vec::new(),
                skipped: true,
            };
        }
        self.last_incident = Some(incident.id);

        info!(
            "[ALERT] dispatching incident {} (confirmed after {:.2}s)",
            incident.id, incident.time_to_confirm
        );

        let sms = self.send_sms(&incident.message, started_at);
        let call = if sms.success || self.config.call_when_sms_fails {
            self.place_call(started_at)
        } else {
            AlertAttempt {
                channel: Channel::VoiceCall,
                success: false,
                timestamp: self.clock.now(),
                latency_secs: self.clock.now() - started_at,
                detail: "skipped: SMS failed".to_string(),
            }
        };

        let report = AlertReport {
            incident_id: incident.id,
            started_at,
            finished_at: self.clock.now(),
            attempts: vec![sms, call],
            skipped: false,
        };
        if report.any_success() {
            info!("[ALERT] incident {} dispatched", incident.id);
        } else {
            error!("[ALERT] every channel failed for incident {}", incident.id);
        }
        report
    }

    /// Text-mode SMS. `started_at` anchors the latency.
    pub fn send_sms(&mut self, message: &str, started_at: f64) -> AlertAttempt {
        let outcome = self.try_send_sms(message);
        let now = self.clock.now();
        let (success, detail) = match outcome {
            Ok(reply) => {
                info!("[ALERT] SMS sent to {}", self.config.phone_number);
                (true, reply)
            }
            Err(reason) => {
                warn!("[ALERT] SMS failed: {}", reason);
                (false, reason)
            }
        };
        AlertAttempt {
            channel: Channel::Sms,
            success,
            timestamp: now,
            latency_secs: now - started_at,
            detail,
        }
    }

    fn try_send_sms(&mut self, message: &str) -> Result<String, String> {
        let t = self.config.timings.clone();

        let mode = self.modem.command("AT+CMGF=1", "OK", secs(t.text_mode_wait));
        if !mode.ok {
            return Err(describe("text mode not acknowledged", &mode));
        }

        let recipient = format!("AT+CMGS=\"{}\"", self.config.phone_number);
        let prompt = self.modem.command(&recipient, ">", secs(t.recipient_wait));
        if !prompt.ok {
            return Err(describe("no message prompt", &prompt));
        }

        self.modem
            .write_raw(message.as_bytes())
            .map_err(|e| format!("body write failed: {}", e))?;
        self.clock.sleep(secs(t.body_wait));
        self.modem
            .write_raw(&[0x1A])
            .map_err(|e| format!("submit write failed: {}", e))?;

        let submitted = self.modem.expect_response("+CMGS:", secs(t.submit_wait));
        if !submitted.ok {
            return Err(describe("submission not confirmed", &submitted));
        }
        Ok(submitted.response)
    }

    /// Dial, wait for pickup, play the alert, hang up.
    pub fn place_call(&mut self, started_at: f64) -> AlertAttempt {
        let t = self.config.timings.clone();
        let dial = format!("ATD{};", self.config.phone_number);
        let dialed = self.modem.command(&dial, "OK", secs(t.dial_wait));
        let now = self.clock.now();
        if !dialed.ok {
            let detail = describe("call setup not acknowledged", &dialed);
            warn!("[ALERT] {}", detail);
            return AlertAttempt {
                channel: Channel::VoiceCall,
                success: false,
                timestamp: now,
                latency_secs: now - started_at,
                detail,
            };
        }
        info!("[ALERT] call placed to {}", self.config.phone_number);
        self.clock.sleep(secs(t.answer_wait));

        let playback = match self.config.mode.clone() {
            AlertMode::Tones { duration_secs } => self.play_tones(duration_secs),
            AlertMode::VoiceMessage {
                text,
                language,
                audio_path,
                repeats,
                pause_secs,
            } => match self.play_voice(&text, &language, &audio_path, repeats, pause_secs) {
                Ok(plays) => format!("voice message played {}x", plays),
                Err(reason) => {
                    warn!("[ALERT] voice message unavailable ({}), using tones", reason);
                    let tones = self.play_tones(FALLBACK_TONE_SECS);
                    format!("voice failed ({}); {}", reason, tones)
                }
            },
        };

        let hangup = self.modem.command("ATH", "OK", secs(t.hangup_wait));
        if hangup.ok {
            info!("[ALERT] call ended");
        } else {
            warn!("[ALERT] hang-up not acknowledged");
        }

        AlertAttempt {
            channel: Channel::VoiceCall,
            success: true,
            timestamp: now,
            latency_secs: now - started_at,
            detail: format!(
                "{}; hangup {}",
                playback,
                if hangup.ok { "ok" } else { "failed" }
            ),
        }
    }

    fn play_tones(&mut self, duration_secs: f64) -> String {
        let t = self.config.timings.clone();
        let deadline = self.clock.now() + duration_secs;
        let (mut sent, mut acked) = (0u32, 0u32);
        while self.clock.now() < deadline {
            let tone = self.modem.command("AT+VTS=\"#\"", "OK", secs(t.tone_wait));
            if let Some(e) = tone.error {
                warn!("[ALERT] tone playback aborted: {}", e);
                break;
            }
            sent += 1;
            if tone.ok {
                acked += 1;
            }
            self.clock.sleep(secs(t.tone_gap));
        }
        format!("tones {}/{} acknowledged", acked, sent)
    }

    fn play_voice(
        &mut self,
        text: &str,
        language: &str,
        path: &Path,
        repeats: u32,
        pause_secs: f64,
    ) -> Result<u32, String> {
        let audio = self
            .audio
            .as_mut()
            .ok_or_else(|| "no audio backend".to_string())?;
        let path = prepare_voice_message(audio.synthesizer.as_mut(), text, language, path)
            .map_err(|e| e.to_string())?;
        for i in 0..repeats {
            audio.player.play(&path).map_err(|e| e.to_string())?;
            if i + 1 < repeats {
                self.clock.sleep(secs(pause_secs));
            }
        }
        Ok(repeats)
    }
}

fn describe(what: &str, outcome: &CommandOutcome) -> String {
    match &outcome.error {
        Some(e) => format!("{}: {}", what, e),
        None if outcome.response.is_empty() => format!("{}: no response", what),
        None => format!("{}: got {:?}", what, outcome.response),
    }
}
