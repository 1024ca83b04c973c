//! Compute device selection for the embedding model.
//!
//! Resolution order:
//! 1. An explicit `accelerator` preference, if an accelerator is available
//! 2. A vendor co-processor (Apple silicon), unless the CPU was requested
//! 3. CPU
//!
//! The selector is a small state machine: `Unresolved` resolves once into
//! `Accelerated(device)` or `Cpu`, and the only transition after that is
//! `Accelerated -> Cpu` when the accelerated device fails. A selector that has
//! fallen back never resolves to an accelerated device again.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Which device the caller would like the model to run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DevicePreference {
    #[default]
    Auto,
    Accelerator,
    Cpu,
}

impl FromStr for DevicePreference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "accelerator" | "cuda" | "gpu" => Ok(Self::Accelerator),
            "cpu" => Ok(Self::Cpu),
            other => Err(format!(
                "unknown device '{other}', expected one of: auto, accelerator, cpu"
            )),
        }
    }
}

impl fmt::Display for DevicePreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Accelerator => write!(f, "accelerator"),
            Self::Cpu => write!(f, "cpu"),
        }
    }
}

/// A concrete device a model is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    Cuda,
    CoreMl,
    Cpu,
}

impl Device {
    pub fn is_accelerated(&self) -> bool {
        !matches!(self, Device::Cpu)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cuda => write!(f, "cuda"),
            Device::CoreMl => write!(f, "coreml"),
            Device::Cpu => write!(f, "cpu"),
        }
    }
}

/// Answers which non-CPU devices are usable on this machine.
pub trait DeviceProbe: Send + Sync {
    fn accelerator_available(&self) -> bool;
    fn coprocessor_available(&self) -> bool;
}

/// Probe backed by the ONNX runtime execution providers compiled into
/// this binary. Without the `cuda`/`coreml` features it only knows the CPU.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProbe;

impl DeviceProbe for SystemProbe {
    fn accelerator_available(&self) -> bool {
        #[cfg(feature = "cuda")]
        {
            use ort::execution_providers::{CUDAExecutionProvider, ExecutionProvider};
            CUDAExecutionProvider::default()
                .is_available()
                .unwrap_or(false)
        }
        #[cfg(not(feature = "cuda"))]
        {
            false
        }
    }

    fn coprocessor_available(&self) -> bool {
        #[cfg(all(feature = "coreml", target_os = "macos"))]
        {
            use ort::execution_providers::{CoreMLExecutionProvider, ExecutionProvider};
            CoreMLExecutionProvider::default()
                .is_available()
                .unwrap_or(false)
        }
        #[cfg(not(all(feature = "coreml", target_os = "macos")))]
        {
            false
        }
    }
}

/// Pick a device for `preference` without any state.
pub fn select_device(preference: DevicePreference, probe: &dyn DeviceProbe) -> Device {
    if preference == DevicePreference::Cpu {
        return Device::Cpu;
    }

    if preference == DevicePreference::Accelerator && probe.accelerator_available() {
        return Device::Cuda;
    }

    if probe.coprocessor_available() {
        return Device::CoreMl;
    }

    Device::Cpu
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Unresolved,
    Accelerated(Device),
    Cpu,
}

/// Device state machine owned by the model provider.
#[derive(Debug)]
pub struct DeviceSelector {
    state: DeviceState,
    fell_back: bool,
}

impl Default for DeviceSelector {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceSelector {
    pub fn new() -> Self {
        Self {
            state: DeviceState::Unresolved,
            fell_back: false,
        }
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    /// Whether an accelerated device has failed during this selector's lifetime.
    pub fn has_fallen_back(&self) -> bool {
        self.fell_back
    }

    /// Resolve the device, or return the already resolved one.
    pub fn resolve(&mut self, preference: DevicePreference, probe: &dyn DeviceProbe) -> Device {
        match self.state {
            DeviceState::Accelerated(device) => device,
            DeviceState::Cpu => Device::Cpu,
            DeviceState::Unresolved => {
                let device = if self.fell_back {
                    Device::Cpu
                } else {
                    select_device(preference, probe)
                };

                self.state = if device.is_accelerated() {
                    DeviceState::Accelerated(device)
                } else {
                    DeviceState::Cpu
                };
                device
            }
        }
    }

    /// Move from an accelerated device to the CPU.
    ///
    /// Returns `false` (and changes nothing) unless the selector currently
    /// sits on an accelerated device.
    pub fn fall_back(&mut self) -> bool {
        match self.state {
            DeviceState::Accelerated(device) => {
                log::warn!("device {device} failed, falling back to cpu");
                self.state = DeviceState::Cpu;
                self.fell_back = true;
                true
            }
            _ => false,
        }
    }

    /// Forget the resolved device so the next `resolve` picks again.
    /// A previous fallback is remembered.
    pub fn reset(&mut self) {
        self.state = DeviceState::Unresolved;
    }
}
