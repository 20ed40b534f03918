//! Capture microphone avec cpal
//!
//! Ce module énumère les API hôtes et les périphériques d'entrée, puis ouvre
//! un stream de capture au format fixe (48 kHz, stéréo, f32, blocs de 20 ms).
//!
//! # Architecture thread
//!
//! cpal appelle notre callback sur un thread temps réel. Le callback accumule
//! les échantillons jusqu'à former une frame complète, puis la dépose dans le
//! slot de transfert (`FrameProducer::offer`) sans jamais attendre.
//!
//! Les indices de périphériques ne sont pas stables : rien n'est mis en cache,
//! chaque listing et chaque ouverture réinterroge le backend.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, Device, Host, Stream, StreamConfig};
use tracing::{debug, error, info, warn};

use crate::{AudioConfig, AudioError, AudioFrame, AudioResult, FrameProducer};

/// Périphérique d'entrée tel que vu lors d'un listing
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InputDevice {
    /// Nom affiché par le backend
    pub name: String,

    /// API hôte à laquelle appartient le périphérique
    pub host_api: String,

    /// Périphérique d'entrée par défaut pour cette API
    pub is_default: bool,
}

impl std::fmt::Display for InputDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let marker = if self.is_default { '*' } else { ' ' };
        write!(f, "{} {}", marker, self.name)
    }
}

/// Liste les noms des API hôtes disponibles (ALSA, JACK, WASAPI, CoreAudio...)
pub fn list_host_apis() -> Vec<String> {
    cpal::available_hosts()
        .into_iter()
        .map(|id| id.name().to_string())
        .collect()
}

/// Nom de l'API hôte utilisée par défaut sur ce système
pub fn default_host_api() -> String {
    cpal::default_host().id().name().to_string()
}

/// Liste les périphériques d'entrée d'une API hôte
///
/// Retourne une liste vide si l'API est inconnue ou si l'énumération échoue.
/// Seuls les périphériques avec au moins un canal d'entrée sont retenus.
pub fn list_input_devices(host_api: &str) -> Vec<InputDevice> {
    let host = match open_host(host_api) {
        Ok(host) => host,
        Err(e) => {
            debug!(host_api, error = %e, "API hôte indisponible");
            return Vec::new();
        }
    };

    let default_name = host.default_input_device().and_then(|d| device_name(&d));

    let devices = match host.input_devices() {
        Ok(devices) => devices,
        Err(e) => {
            warn!(host_api, error = %e, "Énumération des périphériques impossible");
            return Vec::new();
        }
    };

    devices
        .filter(has_input_channels)
        .filter_map(|device| device_name(&device))
        .map(|name| InputDevice {
            is_default: default_name.as_deref() == Some(name.as_str()),
            host_api: host_api.to_string(),
            name,
        })
        .collect()
}

/// Stream de capture actif
///
/// Au plus un stream est ouvert à la fois : le contrôleur du pipeline ferme
/// l'ancien avant d'en ouvrir un nouveau. Le stream s'arrête quand il est libéré.
pub struct CaptureStream {
    stream: Stream,
    device: InputDevice,
}

impl CaptureStream {
    /// Ouvre et démarre la capture sur le périphérique (API hôte, nom)
    ///
    /// Le périphérique est recherché à nouveau au moment de l'ouverture.
    ///
    /// # Erreurs
    /// - `AudioError::UnknownHostApi` : l'API demandée n'existe pas
    /// - `AudioError::DeviceNotFound` : aucun périphérique d'entrée ne correspond
    /// - `AudioError::StreamBuild` / `StreamStart` : le backend a refusé le stream ;
    ///   dans ce cas le stream est libéré avant de remonter l'erreur
    pub fn open(
        host_api: &str,
        device_name_wanted: &str,
        config: &AudioConfig,
        producer: FrameProducer,
    ) -> AudioResult<Self> {
        config.validate().map_err(AudioError::ConfigError)?;

        let host = open_host(host_api)?;
        let default_name = host.default_input_device().and_then(|d| device_name(&d));

        let device = host
            .input_devices()?
            .filter(has_input_channels)
            .find(|d| device_name(d).as_deref() == Some(device_name_wanted))
            .ok_or_else(|| AudioError::DeviceNotFound {
                host_api: host_api.to_string(),
                device: device_name_wanted.to_string(),
            })?;

        let stream = build_stream(&device, config, producer)?;

        if let Err(e) = stream.play() {
            drop(stream);
            return Err(AudioError::StreamStart(e));
        }

        let device = InputDevice {
            name: device_name_wanted.to_string(),
            host_api: host_api.to_string(),
            is_default: default_name.as_deref() == Some(device_name_wanted),
        };

        info!(device = %device.name, host_api = %device.host_api, "Capture audio démarrée");

        Ok(Self { stream, device })
    }

    /// Périphérique capturé
    pub fn device(&self) -> &InputDevice {
        &self.device
    }

    /// Arrête la capture et libère le stream
    pub fn close(self) {
        if let Err(e) = self.stream.pause() {
            debug!(error = %e, "Pause du stream impossible, libération directe");
        }
        info!(device = %self.device.name, "Capture audio arrêtée");
    }
}

fn open_host(host_api: &str) -> AudioResult<Host> {
    let id = cpal::available_hosts()
        .into_iter()
        .find(|id| id.name() == host_api)
        .ok_or_else(|| AudioError::UnknownHostApi(host_api.to_string()))?;

    Ok(cpal::host_from_id(id)?)
}

fn device_name(device: &Device) -> Option<String> {
    device.description().ok().map(|desc| desc.name().to_string())
}

fn has_input_channels(device: &Device) -> bool {
    device
        .supported_input_configs()
        .map(|mut configs| configs.any(|c| c.channels() > 0))
        .unwrap_or(false)
}

/// Construit le stream f32 en mode faible latence
///
/// On demande des blocs fixes de 20 ms ; si le backend refuse, on retombe sur
/// sa taille de bloc par défaut, l'accumulateur reconstituant les frames.
fn build_stream(device: &Device, config: &AudioConfig, producer: FrameProducer) -> AudioResult<Stream> {
    let fixed = StreamConfig {
        channels: config.channels,
        sample_rate: config.sample_rate,
        buffer_size: BufferSize::Fixed(config.samples_per_frame() as u32),
    };

    match build_with(device, &fixed, config.frame_len(), producer.clone()) {
        Ok(stream) => Ok(stream),
        Err(cpal::BuildStreamError::StreamConfigNotSupported) => {
            warn!("Taille de bloc fixe refusée, utilisation de la taille par défaut");
            let fallback = StreamConfig { buffer_size: BufferSize::Default, ..fixed };
            Ok(build_with(device, &fallback, config.frame_len(), producer)?)
        }
        Err(e) => Err(e.into()),
    }
}

fn build_with(
    device: &Device,
    stream_config: &StreamConfig,
    frame_len: usize,
    producer: FrameProducer,
) -> Result<Stream, cpal::BuildStreamError> {
    let mut accumulator = FrameAccumulator::new(frame_len);

    device.build_input_stream(
        stream_config,
        move |data: &[f32], _: &cpal::InputCallbackInfo| {
            accumulator.push(data, |frame| {
                producer.offer(frame);
            });
        },
        move |err| {
            error!(error = %err, "Erreur du stream de capture");
        },
        None,
    )
}

/// Découpe le flux d'échantillons du callback en frames de taille fixe
///
/// Tout se passe dans le thread temps réel : pas de verrou, une seule
/// allocation bornée par frame produite.
struct FrameAccumulator {
    buffer: Vec<f32>,
    frame_len: usize,
    sequence: u64,
}

impl FrameAccumulator {
    fn new(frame_len: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(frame_len),
            frame_len,
            sequence: 0,
        }
    }

    fn push(&mut self, mut data: &[f32], mut emit: impl FnMut(AudioFrame)) {
        while !data.is_empty() {
            let missing = self.frame_len - self.buffer.len();
            let take = missing.min(data.len());
            self.buffer.extend_from_slice(&data[..take]);
            data = &data[take..];

            if self.buffer.len() == self.frame_len {
                let samples = std::mem::replace(&mut self.buffer, Vec::with_capacity(self.frame_len));
                emit(AudioFrame::new(samples, self.sequence));
                self.sequence += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame_handoff;

    #[test]
    fn test_accumulator_exact_blocks() {
        let mut acc = FrameAccumulator::new(4);
        let mut frames = Vec::new();

        acc.push(&[0.1, 0.2, 0.3, 0.4], |f| frames.push(f));
        acc.push(&[0.5, 0.6, 0.7, 0.8], |f| frames.push(f));

        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].samples, vec![0.1, 0.2, 0.3, 0.4]);
        assert_eq!(frames[1].sequence_number, 1);
    }

    #[test]
    fn test_accumulator_uneven_blocks() {
        let mut acc = FrameAccumulator::new(4);
        let mut frames = Vec::new();

        acc.push(&[1.0, 2.0, 3.0], |f| frames.push(f));
        assert!(frames.is_empty());

        acc.push(&[4.0, 5.0, 6.0, 7.0, 8.0, 9.0], |f| frames.push(f));
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].samples, vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(frames[1].samples, vec![5.0, 6.0, 7.0, 8.0]);

        // Le reste attend le bloc suivant
        acc.push(&[10.0, 11.0, 12.0], |f| frames.push(f));
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[2].samples, vec![9.0, 10.0, 11.0, 12.0]);
    }

    #[test]
    fn test_accumulator_feeds_handoff() {
        let (producer, mut consumer) = frame_handoff();
        let mut acc = FrameAccumulator::new(2);

        acc.push(&[0.1, 0.2, 0.3, 0.4, 0.5, 0.6], |f| {
            producer.offer(f);
        });

        assert_eq!(consumer.try_next().map(|f| f.sequence_number), Some(0));
        assert_eq!(consumer.dropped_frames(), 2);
    }

    #[test]
    fn test_unknown_host_api() {
        assert!(list_input_devices("Aucune API de ce nom").is_empty());

        let (producer, _consumer) = frame_handoff();
        let result = CaptureStream::open("Aucune API de ce nom", "Micro", &AudioConfig::default(), producer);
        assert!(matches!(result, Err(AudioError::UnknownHostApi(_))));
    }

    #[test]
    fn test_device_display() {
        let device = InputDevice {
            name: "USB Mic".to_string(),
            host_api: "ALSA".to_string(),
            is_default: true,
        };
        assert_eq!(device.to_string(), "* USB Mic");
    }

    // Nécessite un vrai microphone
    #[test]
    #[ignore]
    fn test_open_default_device() {
        for host_api in list_host_apis() {
            let devices = list_input_devices(&host_api);
            if let Some(default) = devices.iter().find(|d| d.is_default) {
                let (producer, _consumer) = frame_handoff();
                let stream = CaptureStream::open(&host_api, &default.name, &AudioConfig::default(), producer)
                    .expect("ouverture du périphérique par défaut");
                assert_eq!(stream.device().name, default.name);
                stream.close();
                return;
            }
        }
    }
}
