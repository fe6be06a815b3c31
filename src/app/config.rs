//! Transaction layer configuration
//!
//! [`ApplicationConfig`] holds the access point defaults. [`LocalDeviceConfig`]
//! carries optional per-device overrides; when the local device object sets a
//! value it wins over the access point default. Each transaction resolves its
//! values once when it is created, so a configuration change only affects
//! transactions started afterwards.

use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use super::Segmentation;

/// Access point defaults for confirmed services and segmentation
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ApplicationConfig {
    /// APDU timeout (milliseconds)
    pub apdu_timeout: u32,
    /// Number of APDU retries
    pub number_of_apdu_retries: u8,
    /// Maximum APDU length accepted
    pub max_apdu_length_accepted: u16,
    /// Segmentation support
    pub segmentation_supported: Segmentation,
    /// Segment timeout (milliseconds)
    pub segment_timeout: u32,
    /// Maximum segments accepted, `None` for unspecified
    pub max_segments_accepted: Option<u8>,
    /// Window size proposed in the first segment
    pub proposed_window_size: u8,
    /// How long the local application may take to answer (milliseconds)
    pub application_timeout: u32,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            apdu_timeout: 3000,
            number_of_apdu_retries: 3,
            max_apdu_length_accepted: 1024,
            segmentation_supported: Segmentation::NoSegmentation,
            segment_timeout: 1500,
            max_segments_accepted: Some(8),
            proposed_window_size: 2,
            application_timeout: 3000,
        }
    }
}

impl ApplicationConfig {
    pub fn with_segmentation(mut self, segmentation: Segmentation) -> Self {
        self.segmentation_supported = segmentation;
        self
    }

    pub fn with_max_apdu_length(mut self, length: u16) -> Self {
        self.max_apdu_length_accepted = length;
        self
    }

    pub fn with_max_segments(mut self, segments: Option<u8>) -> Self {
        self.max_segments_accepted = segments;
        self
    }

    pub fn with_window_size(mut self, window: u8) -> Self {
        self.proposed_window_size = window.max(1);
        self
    }

    pub fn with_retries(mut self, retries: u8) -> Self {
        self.number_of_apdu_retries = retries;
        self
    }

    pub fn with_apdu_timeout(mut self, millis: u32) -> Self {
        self.apdu_timeout = millis;
        self
    }

    pub fn with_segment_timeout(mut self, millis: u32) -> Self {
        self.segment_timeout = millis;
        self
    }

    pub fn with_application_timeout(mut self, millis: u32) -> Self {
        self.application_timeout = millis;
        self
    }

    /// Application timeout as a [`Duration`]
    pub fn application_timeout(&self) -> Duration {
        Duration::from_millis(self.application_timeout as u64)
    }
}

/// Values published by the local device object, overriding access point defaults
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct LocalDeviceConfig {
    pub apdu_timeout: Option<u32>,
    pub number_of_apdu_retries: Option<u8>,
    pub max_apdu_length_accepted: Option<u16>,
    pub segmentation_supported: Option<Segmentation>,
    pub segment_timeout: Option<u32>,
    pub max_segments_accepted: Option<u8>,
}

/// Capability values fixed for the lifetime of one transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionParameters {
    pub apdu_timeout: u32,
    pub number_of_apdu_retries: u8,
    pub max_apdu_length_accepted: u16,
    pub segmentation_supported: Segmentation,
    pub segment_timeout: u32,
    pub max_segments_accepted: Option<u8>,
}

impl TransactionParameters {
    /// Local device values first, access point defaults otherwise
    pub fn resolve(local: Option<&LocalDeviceConfig>, defaults: &ApplicationConfig) -> Self {
        let local = local.cloned().unwrap_or_default();
        Self {
            apdu_timeout: local.apdu_timeout.unwrap_or(defaults.apdu_timeout),
            number_of_apdu_retries: local
                .number_of_apdu_retries
                .unwrap_or(defaults.number_of_apdu_retries),
            max_apdu_length_accepted: local
                .max_apdu_length_accepted
                .unwrap_or(defaults.max_apdu_length_accepted),
            segmentation_supported: local
                .segmentation_supported
                .unwrap_or(defaults.segmentation_supported),
            segment_timeout: local.segment_timeout.unwrap_or(defaults.segment_timeout),
            max_segments_accepted: local
                .max_segments_accepted
                .or(defaults.max_segments_accepted),
        }
    }
}
