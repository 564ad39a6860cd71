//! Text encoding of feature vectors for transport.
//!
//! Every value is written by `format!` from the f64 itself with exactly 16
//! fractional digits. No JSON number is ever produced, so no generic encoder
//! gets a chance to shorten or re-round the values.

use log::warn;

use crate::error::{Error, Result};
use crate::extractor::FeatureVector;

pub const FRACTIONAL_DIGITS: usize = 16;

#[derive(Debug, Clone, PartialEq)]
pub struct SerializedFeature
{
    pub values: Vec<String>,
    /// Indices whose value could not be written as a decimal and were replaced
    /// by zero. Empty for any vector that came out of `l2_normalized()`.
    pub substitutions: Vec<usize>,
}

pub fn serialize(features: &FeatureVector) -> SerializedFeature
{
    let mut substitutions = Vec::new();
    let values = features.iter()
        .enumerate()
        .map(|(i, &value)| {
            if value.is_finite() {
                format_value(value)
            } else {
                substitutions.push(i);
                format_value(0.0)
            }
        })
        .collect();

    if !substitutions.is_empty() {
        warn!("Substituted 0 for {} non-finite feature values at indices {:?}", substitutions.len(), substitutions);
    }

    SerializedFeature { values, substitutions }
}

fn format_value(value: f64) -> String
{
    format!("{:.*}", FRACTIONAL_DIGITS, value)
}

/// Parses serialized feature values back into f64s, the way a consumer of
/// `featureValues` would. Any unparsable entry is an error.
pub fn parse_feature_values(values: &[String]) -> Result<Vec<f64>>
{
    values.iter()
        .enumerate()
        .map(|(i, text)| {
            text.trim().parse::<f64>()
                .map_err(|e| Error::Validation(format!("featureValues[{}] = {:?}: {}", i, text, e)))
        })
        .collect()
}
