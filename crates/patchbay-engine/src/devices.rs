use std::sync::atomic::{AtomicBool, Ordering};

use patchbay_core::EngineInitError;
use serde::{Deserialize, Serialize};

/// Audio/MIDI device settings, fixed for the life of the process.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub sample_rate: u32,
    pub frames_per_buffer: u32,
    /// Whether a MIDI input layer should be brought up alongside audio.
    pub midi: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44_100,
            frames_per_buffer: 256,
            midi: true,
        }
    }
}

/// Process-wide device subsystems.
///
/// Initialized once in `main` and shared by reference with every session.
/// Sessions never start or stop these; the subsystems are torn down when the
/// last owner drops this value.
#[derive(Debug)]
pub struct DeviceServices {
    config: DeviceConfig,
    running: AtomicBool,
}

impl DeviceServices {
    pub fn initialize(config: DeviceConfig) -> Result<Self, EngineInitError> {
        if config.sample_rate == 0 {
            return Err(EngineInitError::new("sample rate must be non-zero"));
        }
        if config.frames_per_buffer == 0 {
            return Err(EngineInitError::new("frames per buffer must be non-zero"));
        }
        tracing::info!(
            sample_rate = config.sample_rate,
            frames_per_buffer = config.frames_per_buffer,
            "audio subsystem initialized"
        );
        if config.midi {
            tracing::info!("midi subsystem initialized");
        }
        Ok(Self {
            config,
            running: AtomicBool::new(true),
        })
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn sample_rate(&self) -> u32 {
        self.config.sample_rate
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Tear the subsystems down early. Idempotent; also runs on drop.
    pub fn terminate(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            if self.config.midi {
                tracing::info!("midi subsystem terminated");
            }
            tracing::info!("audio subsystem terminated");
        }
    }
}

impl Drop for DeviceServices {
    fn drop(&mut self) {
        self.terminate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let cfg = DeviceConfig::default();
        assert_eq!(cfg.sample_rate, 44_100);
        assert_eq!(cfg.frames_per_buffer, 256);
        assert!(cfg.midi);
    }

    #[test]
    fn initialize_is_running() {
        let services = DeviceServices::initialize(DeviceConfig::default()).unwrap();
        assert!(services.is_running());
        assert_eq!(services.sample_rate(), 44_100);
    }

    #[test]
    fn zero_sample_rate_rejected() {
        let cfg = DeviceConfig {
            sample_rate: 0,
            ..DeviceConfig::default()
        };
        let err = DeviceServices::initialize(cfg).unwrap_err();
        assert!(err.to_string().contains("sample rate"));
    }

    #[test]
    fn zero_buffer_rejected() {
        let cfg = DeviceConfig {
            frames_per_buffer: 0,
            ..DeviceConfig::default()
        };
        assert!(DeviceServices::initialize(cfg).is_err());
    }

    #[test]
    fn terminate_is_idempotent() {
        let services = DeviceServices::initialize(DeviceConfig::default()).unwrap();
        services.terminate();
        services.terminate();
        assert!(!services.is_running());
    }

    #[test]
    fn serde_roundtrip() {
        let cfg = DeviceConfig {
            sample_rate: 48_000,
            frames_per_buffer: 128,
            midi: false,
        };
        let json = serde_json::to_string(&cfg).unwrap();
        let back: DeviceConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cfg);
    }
}
