//! Perceptual transfer functions: SMPTE ST 2084 (PQ), Rec. 2100 HLG and gamma.
//!
//! All curves map linear light in `[0, 1]` to a perceptually uniform signal in
//! `[0, 1]` and back. Inputs outside `[0, 1]` are clamped. For PQ, linear
//! `1.0` is the 10 000 nit peak.

use serde::{Deserialize, Serialize};

/// SMPTE ST 2084 constants.
mod pq {
    pub const M1: f32 = 2610.0 / 16384.0;
    pub const M2: f32 = 2523.0 / 4096.0 * 128.0;
    pub const C1: f32 = 3424.0 / 4096.0;
    pub const C2: f32 = 2413.0 / 4096.0 * 32.0;
    pub const C3: f32 = 2392.0 / 4096.0 * 32.0;
}

/// Rec. 2100 HLG constants.
mod hlg {
    pub const A: f32 = 0.178_832_77;
    pub const B: f32 = 0.284_668_92; // 1 - 4A
    pub const C: f32 = 0.559_910_73; // 0.5 - A ln(4A)
}

/// Peak luminance of the PQ curve in nits.
pub const PQ_PEAK_LUMINANCE: f32 = 10_000.0;

/// Transfer curve applied before color transforms.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferCurve {
    /// Identity.
    #[default]
    Linear,
    /// sRGB / Rec. 709 display gamma.
    Gamma22,
    /// DCI-P3 display gamma.
    Gamma24,
    /// SMPTE ST 2084 perceptual quantizer (HDR10).
    Pq,
    /// Hybrid log-gamma.
    Hlg,
}

impl TransferCurve {
    /// Linear light to signal.
    #[inline]
    pub fn encode(self, linear: f32) -> f32 {
        match self {
            TransferCurve::Linear => linear,
            TransferCurve::Gamma22 => gamma_encode(linear, 2.2),
            TransferCurve::Gamma24 => gamma_encode(linear, 2.4),
            TransferCurve::Pq => pq_encode(linear),
            TransferCurve::Hlg => hlg_encode(linear),
        }
    }

    /// Signal to linear light.
    #[inline]
    pub fn decode(self, signal: f32) -> f32 {
        match self {
            TransferCurve::Linear => signal,
            TransferCurve::Gamma22 => gamma_decode(signal, 2.2),
            TransferCurve::Gamma24 => gamma_decode(signal, 2.4),
            TransferCurve::Pq => pq_decode(signal),
            TransferCurve::Hlg => hlg_decode(signal),
        }
    }

    /// Apply [`TransferCurve::encode`] to every component.
    pub fn encode_slice(self, values: &mut [f32]) {
        if self != TransferCurve::Linear {
            values.iter_mut().for_each(|v| *v = self.encode(*v));
        }
    }

    /// Apply [`TransferCurve::decode`] to every component.
    pub fn decode_slice(self, values: &mut [f32]) {
        if self != TransferCurve::Linear {
            values.iter_mut().for_each(|v| *v = self.decode(*v));
        }
    }
}

pub fn gamma_encode(linear: f32, gamma: f32) -> f32 {
    if linear <= 0.0 {
        return 0.0;
    }
    if linear >= 1.0 {
        return 1.0;
    }
    linear.powf(1.0 / gamma)
}

pub fn gamma_decode(signal: f32, gamma: f32) -> f32 {
    if signal <= 0.0 {
        return 0.0;
    }
    if signal >= 1.0 {
        return 1.0;
    }
    signal.powf(gamma)
}

/// PQ encode of linear light relative to the peak.
pub fn pq_encode(linear: f32) -> f32 {
    if linear <= 0.0 {
        return 0.0;
    }
    if linear >= 1.0 {
        return 1.0;
    }
    let lm1 = linear.powf(pq::M1);
    ((pq::C1 + pq::C2 * lm1) / (1.0 + pq::C3 * lm1)).powf(pq::M2)
}

/// PQ decode to linear light relative to the peak.
pub fn pq_decode(signal: f32) -> f32 {
    if signal <= 0.0 {
        return 0.0;
    }
    if signal >= 1.0 {
        return 1.0;
    }
    let nm2 = signal.powf(1.0 / pq::M2);
    let numerator = (nm2 - pq::C1).max(0.0);
    let denominator = pq::C2 - pq::C3 * nm2;
    if denominator <= 0.0 {
        return 1.0;
    }
    (numerator / denominator).powf(1.0 / pq::M1)
}

/// PQ encode of an absolute luminance in nits.
pub fn pq_encode_nits(nits: f32) -> f32 {
    pq_encode(nits / PQ_PEAK_LUMINANCE)
}

/// PQ decode to an absolute luminance in nits.
pub fn pq_decode_nits(signal: f32) -> f32 {
    pq_decode(signal) * PQ_PEAK_LUMINANCE
}

pub fn hlg_encode(linear: f32) -> f32 {
    if linear <= 0.0 {
        return 0.0;
    }
    if linear >= 1.0 {
        return 1.0;
    }
    if linear <= 1.0 / 12.0 {
        (3.0 * linear).sqrt()
    } else {
        hlg::A * (12.0 * linear - hlg::B).ln() + hlg::C
    }
}

pub fn hlg_decode(signal: f32) -> f32 {
    if signal <= 0.0 {
        return 0.0;
    }
    if signal >= 1.0 {
        return 1.0;
    }
    if signal <= 0.5 {
        signal * signal / 3.0
    } else {
        (((signal - hlg::C) / hlg::A).exp() + hlg::B) / 12.0
    }
}
