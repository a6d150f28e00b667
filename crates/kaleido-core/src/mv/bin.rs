//! Pixel-level binning for interval selections.
//!
//! An interval selection over a continuous domain would make a
//! materialized view as large as the number of distinct values. Binning
//! discretizes the domain through the selection's scale transform into
//! screen pixels, bounding view cardinality by the number of interactive
//! pixels instead.
//!
//! The same quantization runs in two places and must agree: as a SQL
//! expression over the source column (view creation) and numerically over
//! clause values (the accelerated query's WHERE range).

use crate::selection::{BinPolicy, Scale, ScaleKind};

/// Applies the scale's transform to a domain value.
#[must_use]
pub fn transform_value(scale: &Scale, value: f64) -> f64 {
    match scale.kind {
        ScaleKind::Identity | ScaleKind::Linear | ScaleKind::Time => value,
        ScaleKind::Log => match scale.base {
            Some(base) => value.ln() / base.ln(),
            None => value.ln(),
        },
        ScaleKind::Sqrt => value.sqrt(),
        ScaleKind::Pow => {
            let exponent = scale.exponent.unwrap_or(1.0);
            value.signum() * value.abs().powf(exponent)
        }
        ScaleKind::Symlog => {
            let constant = scale.constant.unwrap_or(1.0);
            value.signum() * (1.0 + (value / constant).abs()).ln()
        }
    }
}

/// Renders the scale's transform as SQL over the source column.
#[must_use]
pub fn transform_sql(scale: &Scale) -> String {
    let column = &scale.column;
    match scale.kind {
        ScaleKind::Identity | ScaleKind::Linear => column.clone(),
        ScaleKind::Time => format!("epoch_ms({column})"),
        ScaleKind::Log => match scale.base {
            Some(base) => format!("(ln({column}) / ln({base}))"),
            None => format!("ln({column})"),
        },
        ScaleKind::Sqrt => format!("sqrt({column})"),
        ScaleKind::Pow => {
            let exponent = scale.exponent.unwrap_or(1.0);
            format!("(sign({column}) * pow(abs({column}), {exponent}))")
        }
        ScaleKind::Symlog => {
            let constant = scale.constant.unwrap_or(1.0);
            format!("(sign({column}) * ln(1 + abs({column} / {constant})))")
        }
    }
}

/// The linear quantization derived from a scale's domain→range mapping and
/// a pixel size.
#[derive(Debug, Clone, Copy)]
pub struct Binning {
    lo: f64,
    factor: f64,
    policy: BinPolicy,
}

impl Binning {
    /// Derives the quantization, or `None` if the scale's domain is
    /// degenerate under its transform (non-finite endpoints, zero span,
    /// non-positive log domain) or the pixel size is unusable.
    #[must_use]
    pub fn derive(scale: &Scale, pixel_size: f64, policy: BinPolicy) -> Option<Self> {
        if !(pixel_size.is_finite() && pixel_size > 0.0) {
            return None;
        }
        let lo = transform_value(scale, scale.domain.0);
        let hi = transform_value(scale, scale.domain.1);
        let span = (scale.range.1 - scale.range.0).abs();
        if !lo.is_finite() || !hi.is_finite() || lo == hi || !span.is_finite() || span == 0.0 {
            return None;
        }
        let factor = span / ((hi - lo) * pixel_size);
        Some(Self { lo, factor, policy })
    }

    /// The bin index of a domain value.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn index(&self, scale: &Scale, value: f64) -> i64 {
        let scaled = (transform_value(scale, value) - self.lo) * self.factor;
        match self.policy {
            BinPolicy::Floor => scaled.floor() as i64,
            BinPolicy::Ceil => scaled.ceil() as i64,
            BinPolicy::Round => scaled.round() as i64,
        }
    }

    /// The binning expression as SQL over the source column.
    #[must_use]
    pub fn sql(&self, scale: &Scale) -> String {
        let rounding = match self.policy {
            BinPolicy::Floor => "floor",
            BinPolicy::Ceil => "ceil",
            BinPolicy::Round => "round",
        };
        format!(
            "{rounding}(({} - {}) * {})",
            transform_sql(scale),
            self.lo,
            self.factor
        )
    }
}
