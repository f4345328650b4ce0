use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// One segment of the piecewise crash distribution.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MultiplierBand {
    pub min_multiplier: f64,
    pub max_multiplier: f64,
    pub probability: f64,
}

const FALLBACK_BAND: MultiplierBand = MultiplierBand {
    min_multiplier: 1.0,
    max_multiplier: 10.0,
    probability: 1.0,
};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MultiplierConfig {
    pub bands: Vec<MultiplierBand>,
}

impl MultiplierConfig {
    /// Uniform `[1.0, 10.0)` used whenever no usable config is on disk.
    pub fn fallback() -> Self {
        Self {
            bands: vec![FALLBACK_BAND],
        }
    }

    pub fn load(path: &Path) -> Self {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) => {
                tracing::warn!(path = %path.display(), "Multiplier config unreadable, using fallback: {err}");
                return Self::fallback();
            }
        };
        let config: MultiplierConfig = match serde_json::from_str(&raw) {
            Ok(config) => config,
            Err(err) => {
                tracing::warn!(path = %path.display(), "Multiplier config invalid, using fallback: {err}");
                return Self::fallback();
            }
        };
        if !config.is_usable() {
            tracing::warn!(path = %path.display(), "Multiplier config has no usable bands, using fallback");
            return Self::fallback();
        }
        config
    }

    fn is_usable(&self) -> bool {
        !self.bands.is_empty()
            && self.bands.iter().all(|band| {
                band.min_multiplier >= 1.0
                    && band.max_multiplier > band.min_multiplier
                    && band.probability > 0.0
            })
    }
}

/// Draws crash multipliers by inverse-CDF over the configured bands.
pub struct MultiplierGenerator {
    config: MultiplierConfig,
}

impl MultiplierGenerator {
    pub fn new(config: MultiplierConfig) -> Self {
        let config = if config.is_usable() {
            config
        } else {
            MultiplierConfig::fallback()
        };
        Self { config }
    }

    pub fn from_file(path: &Path) -> Self {
        Self::new(MultiplierConfig::load(path))
    }

    pub fn config(&self) -> &MultiplierConfig {
        &self.config
    }

    pub fn draw(&self) -> f64 {
        self.draw_with(&mut rand::thread_rng())
    }

    pub fn draw_with(&self, rng: &mut impl Rng) -> f64 {
        let u: f64 = rng.gen();
        let mut cumulative = 0.0;
        let mut selected = None;
        for band in &self.config.bands {
            cumulative += band.probability;
            if u < cumulative {
                selected = Some(*band);
                break;
            }
        }
        // Float drift can leave u beyond the last cumulative bound.
        let band = selected
            .or_else(|| self.config.bands.last().copied())
            .unwrap_or(FALLBACK_BAND);

        let mut value = round_two_decimals(rng.gen_range(band.min_multiplier..band.max_multiplier));
        // Rounding up can land exactly on the exclusive upper bound.
        if value >= band.max_multiplier {
            value = round_two_decimals(band.max_multiplier - 0.01).max(band.min_multiplier);
        }
        value.max(1.0)
    }
}

fn round_two_decimals(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
