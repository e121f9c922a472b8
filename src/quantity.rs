//! Validation of Kubernetes resource quantities (`500m`, `512Mi`, `1Gi`, `2`, `1e3`).
//!
//! The cluster API accepts quantities as strings, so a [`Quantity`] keeps the
//! caller's spelling and only guarantees it is well formed.

use std::fmt;
use std::str::FromStr;

const BINARY_SUFFIXES: [&str; 6] = ["Ki", "Mi", "Gi", "Ti", "Pi", "Ei"];
const DECIMAL_SUFFIXES: [&str; 7] = ["n", "u", "m", "k", "M", "G", "T"];
const LARGE_DECIMAL_SUFFIXES: [&str; 2] = ["P", "E"];

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Quantity(String);

impl Quantity {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Quantity {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let value = raw.trim();
        if value.is_empty() {
            return Err("quantity is empty".to_string());
        }

        let unsigned = value
            .strip_prefix('+')
            .or_else(|| value.strip_prefix('-'))
            .unwrap_or(value);

        let number_len = unsigned
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(unsigned.len());
        let (number, suffix) = unsigned.split_at(number_len);

        if number.is_empty() || number == "." || number.matches('.').count() > 1 {
            return Err(format!("'{value}' does not start with a number"));
        }

        if !is_valid_suffix(suffix) {
            return Err(format!("unknown suffix '{suffix}'"));
        }

        Ok(Self(value.to_string()))
    }
}

fn is_valid_suffix(suffix: &str) -> bool {
    if suffix.is_empty()
        || BINARY_SUFFIXES.contains(&suffix)
        || DECIMAL_SUFFIXES.contains(&suffix)
        || LARGE_DECIMAL_SUFFIXES.contains(&suffix)
    {
        return true;
    }

    // Decimal exponent form: 1e3, 1E-2
    let Some(exponent) = suffix.strip_prefix(['e', 'E']) else {
        return false;
    };
    let digits = exponent
        .strip_prefix('+')
        .or_else(|| exponent.strip_prefix('-'))
        .unwrap_or(exponent);
    !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_common_limits() {
        for raw in ["500m", "512Mi", "1Gi", "2", "0.5", "1.5Gi", "1e3", "100k", "+1"] {
            let quantity: Quantity = raw.parse().expect(raw);
            assert_eq!(quantity.as_str(), raw);
        }
    }

    #[test]
    fn rejects_malformed_values() {
        for raw in ["", "abc", "12Q", "1..5", "Mi", ".", "5mb", "1e"] {
            assert!(raw.parse::<Quantity>().is_err(), "{raw} should be rejected");
        }
    }
}
