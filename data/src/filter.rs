use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

/// Server-side filter applied to a waveform before it is returned.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "filterType", rename_all = "lowercase")]
pub enum FilterKind {
    /// Sentinel: no filtered requests are issued under it.
    #[default]
    None,
    Bandpass {
        freq_min: f64,
        freq_max: f64,
        order: u32,
        zero_phase: bool,
    },
    Lowpass {
        freq: f64,
        order: u32,
        zero_phase: bool,
    },
    Highpass {
        freq: f64,
        order: u32,
        zero_phase: bool,
    },
}

impl FilterKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterKind::None => "none",
            FilterKind::Bandpass { .. } => "bandpass",
            FilterKind::Lowpass { .. } => "lowpass",
            FilterKind::Highpass { .. } => "highpass",
        }
    }

    fn options(&self) -> Value {
        match *self {
            FilterKind::None => Value::Null,
            FilterKind::Bandpass {
                freq_min,
                freq_max,
                order,
                zero_phase,
            } => json!({
                "freqmin": freq_min,
                "freqmax": freq_max,
                "corners": order,
                "zerophase": zero_phase,
            }),
            FilterKind::Lowpass {
                freq,
                order,
                zero_phase,
            }
            | FilterKind::Highpass {
                freq,
                order,
                zero_phase,
            } => json!({
                "freq": freq,
                "corners": order,
                "zerophase": zero_phase,
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaperType {
    #[default]
    Hann,
    Hamming,
    Cosine,
    Blackman,
    Triang,
}

impl TaperType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaperType::Hann => "hann",
            TaperType::Hamming => "hamming",
            TaperType::Cosine => "cosine",
            TaperType::Blackman => "blackman",
            TaperType::Triang => "triang",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Taper {
    pub kind: TaperType,
    /// Tapered share of each end, in percent of the window.
    pub width: f64,
}

impl Default for Taper {
    fn default() -> Self {
        Self {
            kind: TaperType::Hann,
            width: 5.0,
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum FilterError {
    #[error("Invalid corner frequency: {0}")]
    Frequency(String),
    #[error("Filter order must be at least 1")]
    Order,
    #[error("Taper width {0}% is outside 0..=50")]
    TaperWidth(f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct FilterSpec {
    #[serde(flatten)]
    pub kind: FilterKind,
    #[serde(default)]
    pub taper: Taper,
}

impl FilterSpec {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn bandpass(freq_min: f64, freq_max: f64, order: u32, zero_phase: bool) -> Self {
        Self {
            kind: FilterKind::Bandpass {
                freq_min,
                freq_max,
                order,
                zero_phase,
            },
            taper: Taper::default(),
        }
    }

    pub fn lowpass(freq: f64, order: u32, zero_phase: bool) -> Self {
        Self {
            kind: FilterKind::Lowpass {
                freq,
                order,
                zero_phase,
            },
            taper: Taper::default(),
        }
    }

    pub fn highpass(freq: f64, order: u32, zero_phase: bool) -> Self {
        Self {
            kind: FilterKind::Highpass {
                freq,
                order,
                zero_phase,
            },
            taper: Taper::default(),
        }
    }

    pub fn with_taper(mut self, kind: TaperType, width: f64) -> Self {
        self.taper = Taper { kind, width };
        self
    }

    pub fn is_active(&self) -> bool {
        self.kind != FilterKind::None
    }

    pub fn validate(&self) -> Result<(), FilterError> {
        let positive = |f: f64| f.is_finite() && f > 0.0;

        match self.kind {
            FilterKind::None => return Ok(()),
            FilterKind::Bandpass {
                freq_min,
                freq_max,
                order,
                ..
            } => {
                if !positive(freq_min) || !positive(freq_max) || freq_min >= freq_max {
                    return Err(FilterError::Frequency(format!("{freq_min}..{freq_max} Hz")));
                }
                if order == 0 {
                    return Err(FilterError::Order);
                }
            }
            FilterKind::Lowpass { freq, order, .. } | FilterKind::Highpass { freq, order, .. } => {
                if !positive(freq) {
                    return Err(FilterError::Frequency(format!("{freq} Hz")));
                }
                if order == 0 {
                    return Err(FilterError::Order);
                }
            }
        }

        if !(0.0..=50.0).contains(&self.taper.width) {
            return Err(FilterError::TaperWidth(self.taper.width));
        }
        Ok(())
    }

    /// Control-plane fields merged into a `stream.filter` envelope.
    /// `None` under the sentinel filter.
    pub fn request_fields(&self) -> Option<Map<String, Value>> {
        if !self.is_active() {
            return None;
        }

        let mut fields = Map::new();
        fields.insert("filterType".to_string(), json!(self.kind.as_str()));
        fields.insert("filterOptions".to_string(), self.kind.options());
        fields.insert("taperType".to_string(), json!(self.taper.kind.as_str()));
        fields.insert("taperWidth".to_string(), json!(self.taper.width));
        Some(fields)
    }

    /// Stable fingerprint separating cache namespaces of different filters.
    pub fn fingerprint(&self) -> String {
        let body = match self.kind {
            FilterKind::None => String::new(),
            FilterKind::Bandpass {
                freq_min,
                freq_max,
                order,
                zero_phase,
            } => format!("{freq_min}-{freq_max}:{order}:{zero_phase}"),
            FilterKind::Lowpass {
                freq,
                order,
                zero_phase,
            }
            | FilterKind::Highpass {
                freq,
                order,
                zero_phase,
            } => format!("{freq}:{order}:{zero_phase}"),
        };

        format!(
            "{}({body})|{}:{}",
            self.kind.as_str(),
            self.taper.kind.as_str(),
            self.taper.width
        )
    }
}

impl std::fmt::Display for FilterSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            FilterKind::None => write!(f, "unfiltered"),
            FilterKind::Bandpass {
                freq_min, freq_max, ..
            } => write!(f, "bandpass {freq_min}-{freq_max} Hz"),
            FilterKind::Lowpass { freq, .. } => write!(f, "lowpass {freq} Hz"),
            FilterKind::Highpass { freq, .. } => write!(f, "highpass {freq} Hz"),
        }
    }
}
