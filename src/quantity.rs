//! Exact arithmetic for Kubernetes resource quantities
//!
//! `k8s_openapi` carries quantities as opaque strings ("500m", "128Mi",
//! "2", "1e3"). Admission needs to compare limits against requests and sum
//! requests against quotas exactly, not approximately, so quantities are
//! parsed into integer nano-units (1 unit = 10^9 nanos). Nano is the smallest
//! scale Kubernetes itself accepts, so every well-formed quantity has an
//! exact integer representation here.

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use crate::Error;

/// A resource quantity parsed into exact integer nano-units
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct ResourceAmount(i128);

/// Nanos per whole unit
const NANOS: i128 = 1_000_000_000;

impl ResourceAmount {
    /// Zero quantity
    pub const ZERO: ResourceAmount = ResourceAmount(0);

    /// Parse a Kubernetes quantity string
    ///
    /// Accepts an optional sign, a decimal number, and an optional suffix:
    /// decimal SI (n, u, m, k, M, G, T, P, E), binary (Ki..Ei), or scientific
    /// notation (e/E exponent).
    pub fn parse(s: &str) -> crate::Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::validation("empty quantity"));
        }

        let (sign, rest) = match s.as_bytes()[0] {
            b'-' => (-1i128, &s[1..]),
            b'+' => (1, &s[1..]),
            _ => (1, s),
        };

        // Split number from suffix
        let num_end = rest
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .unwrap_or(rest.len());
        let (number, suffix) = rest.split_at(num_end);
        if number.is_empty() {
            return Err(Error::validation(format!("invalid quantity: {s}")));
        }

        // Digits and decimal scale
        let (int_part, frac_part) = match number.split_once('.') {
            Some((i, f)) => (i, f),
            None => (number, ""),
        };
        let digits = format!("{int_part}{frac_part}");
        let mantissa: i128 = digits
            .parse()
            .map_err(|_| Error::validation(format!("invalid quantity: {s}")))?;

        // Suffix multiplier in nanos per unit of the mantissa
        let multiplier: i128 = match suffix {
            "" => NANOS,
            "n" => 1,
            "u" => 1_000,
            "m" => 1_000_000,
            "k" => NANOS * 1_000,
            "M" => NANOS * 1_000_000,
            "G" => NANOS * 1_000_000_000,
            "T" => NANOS * 1_000_000_000_000,
            "P" => NANOS * 1_000_000_000_000_000,
            "E" => NANOS * 1_000_000_000_000_000_000,
            "Ki" => NANOS << 10,
            "Mi" => NANOS << 20,
            "Gi" => NANOS << 30,
            "Ti" => NANOS << 40,
            "Pi" => NANOS << 50,
            "Ei" => NANOS << 60,
            _ => {
                // Scientific notation: 12e6, 1E3
                if let Some(exp) = suffix
                    .strip_prefix(['e', 'E'])
                    .and_then(|e| e.parse::<u32>().ok())
                {
                    NANOS
                        .checked_mul(10i128.checked_pow(exp).ok_or_else(|| {
                            Error::validation(format!("quantity overflow: {s}"))
                        })?)
                        .ok_or_else(|| Error::validation(format!("quantity overflow: {s}")))?
                } else {
                    return Err(Error::validation(format!(
                        "invalid quantity suffix '{suffix}' in {s}"
                    )));
                }
            }
        };

        let scale = 10i128
            .checked_pow(frac_part.len() as u32)
            .ok_or_else(|| Error::validation(format!("invalid quantity: {s}")))?;
        let nanos = mantissa
            .checked_mul(multiplier)
            .ok_or_else(|| Error::validation(format!("quantity overflow: {s}")))?
            / scale;

        Ok(ResourceAmount(sign * nanos))
    }

    /// Parse a `k8s_openapi` quantity
    pub fn from_quantity(q: &Quantity) -> crate::Result<Self> {
        Self::parse(&q.0)
    }

    /// Returns true for negative quantities
    pub fn is_negative(&self) -> bool {
        self.0 < 0
    }

    /// Saturating sum of two quantities
    pub fn add(&self, other: ResourceAmount) -> ResourceAmount {
        ResourceAmount(self.0.saturating_add(other.0))
    }

    /// Saturating difference of two quantities
    pub fn sub(&self, other: ResourceAmount) -> ResourceAmount {
        ResourceAmount(self.0.saturating_sub(other.0))
    }

    /// Saturating multiplication by a replica count
    pub fn scale(&self, replicas: i32) -> ResourceAmount {
        ResourceAmount(self.0.saturating_mul(replicas as i128))
    }
}

impl std::fmt::Display for ResourceAmount {
    /// Renders in base units with a trimmed decimal fraction, e.g. "1.75"
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let whole = self.0 / NANOS;
        let frac = (self.0 % NANOS).unsigned_abs();
        if frac == 0 {
            return write!(f, "{whole}");
        }
        let digits = format!("{frac:09}");
        let trimmed = digits.trim_end_matches('0');
        if self.0 < 0 && whole == 0 {
            write!(f, "-0.{trimmed}")
        } else {
            write!(f, "{whole}.{trimmed}")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn amt(s: &str) -> ResourceAmount {
        ResourceAmount::parse(s).unwrap()
    }

    #[test]
    fn test_plain_integers() {
        assert_eq!(amt("2"), amt("2000m"));
        assert_eq!(amt("0"), ResourceAmount::ZERO);
    }

    #[test]
    fn test_decimal_si_suffixes() {
        assert_eq!(amt("500m"), amt("0.5"));
        assert_eq!(amt("1k"), amt("1000"));
        assert_eq!(amt("1M"), amt("1000k"));
        assert_eq!(amt("100u"), amt("0.1m"));
    }

    #[test]
    fn test_binary_suffixes() {
        assert_eq!(amt("1Ki"), amt("1024"));
        assert_eq!(amt("1Gi"), amt("1024Mi"));
        assert_eq!(amt("1.5Gi"), amt("1536Mi"));
    }

    #[test]
    fn test_scientific_notation() {
        assert_eq!(amt("1e3"), amt("1000"));
        assert_eq!(amt("12e6"), amt("12M"));
    }

    /// Comparison must be exact: 128Mi is strictly less than 129Mi even
    /// though both round to "128 mega-ish" in floating point.
    #[test]
    fn test_comparison_is_exact() {
        assert!(amt("128Mi") < amt("129Mi"));
        assert!(amt("1000m") == amt("1"));
        assert!(amt("1000000001n") > amt("1"));
    }

    #[test]
    fn test_negative_sign_detected() {
        assert!(amt("-1").is_negative());
        assert!(!amt("0").is_negative());
        assert!(!amt("2").is_negative());
    }

    #[test]
    fn test_scale_and_add_for_quota_sums() {
        // 3 workers x 500m CPU + 1 launcher x 250m = 1750m
        let total = amt("500m").scale(3).add(amt("250m"));
        assert_eq!(total, amt("1750m"));
    }

    #[test]
    fn test_malformed_quantities_rejected() {
        assert!(ResourceAmount::parse("").is_err());
        assert!(ResourceAmount::parse("abc").is_err());
        assert!(ResourceAmount::parse("1X").is_err());
        assert!(ResourceAmount::parse("1.2.3").is_err());
    }
}
