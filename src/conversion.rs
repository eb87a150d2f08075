//! Unit normalization and rounding of decoded values.

use serde::Deserialize;

/// Number of decimal places every stored value is rounded to.
pub const DECIMAL_PLACES: i32 = 3;

/// A unit conversion applied to a decoded value before it is rounded.
///
/// In configuration files a conversion is written as a single-key map, e.g.
/// `conversion: { divide: 1000 }` for a meter reporting milliamperes.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(try_from = "ConversionSpec")]
pub enum Conversion {
    /// `value / divisor`
    Divide(f64),
    /// `value * factor`
    Multiply(f64),
    /// `value * scale + offset`
    Linear { scale: f64, offset: f64 },
    /// An arbitrary function, only available when building descriptors in code.
    Custom(fn(f64) -> f64),
}

/// Custom conversions never compare equal, not even to themselves.
impl PartialEq for Conversion {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Conversion::Divide(a), Conversion::Divide(b)) => a == b,
            (Conversion::Multiply(a), Conversion::Multiply(b)) => a == b,
            (
                Conversion::Linear { scale, offset },
                Conversion::Linear {
                    scale: other_scale,
                    offset: other_offset,
                },
            ) => scale == other_scale && offset == other_offset,
            _ => false,
        }
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct LinearSpec {
    scale: f64,
    #[serde(default)]
    offset: f64,
}

/// The configuration form of a [`Conversion`], a map with exactly one key.
#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ConversionSpec {
    divide: Option<f64>,
    multiply: Option<f64>,
    linear: Option<LinearSpec>,
}

impl TryFrom<ConversionSpec> for Conversion {
    type Error = String;

    fn try_from(spec: ConversionSpec) -> Result<Self, Self::Error> {
        match (spec.divide, spec.multiply, spec.linear) {
            (Some(divisor), None, None) if divisor == 0.0 => {
                Err(String::from("cannot divide by zero"))
            }
            (Some(divisor), None, None) => Ok(Conversion::Divide(divisor)),
            (None, Some(factor), None) => Ok(Conversion::Multiply(factor)),
            (None, None, Some(LinearSpec { scale, offset })) => {
                Ok(Conversion::Linear { scale, offset })
            }
            _ => Err(String::from(
                "a conversion needs exactly one of divide, multiply or linear",
            )),
        }
    }
}

impl Conversion {
    /// Applies the conversion to `value`.
    pub fn apply(&self, value: f64) -> f64 {
        match *self {
            Conversion::Divide(divisor) => value / divisor,
            Conversion::Multiply(factor) => value * factor,
            Conversion::Linear { scale, offset } => value * scale + offset,
            Conversion::Custom(f) => f(value),
        }
    }
}

/// Rounds to [`DECIMAL_PLACES`] decimal places, ties away from zero.
pub fn round(value: f64) -> f64 {
    let factor = 10f64.powi(DECIMAL_PLACES);
    (value * factor).round() / factor
}

/// Applies `conversion` (identity if `None`) and rounds the result.
///
/// Non-finite results (overflowing conversions, NaN payloads) are passed
/// through unchanged.
pub fn convert(value: f64, conversion: Option<&Conversion>) -> f64 {
    let converted = match conversion {
        Some(conversion) => conversion.apply(value),
        None => value,
    };
    round(converted)
}
