//! IMEI syntax and checksum validation.
//!
//! A device identity is exactly 15 ASCII decimal digits whose Luhn
//! checksum is zero. Allow-list membership is a policy decision and lives
//! with the admission controller, not here.

use thiserror::Error;

/// Reasons an IMEI string is rejected.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImeiError {
    /// Not exactly 15 ASCII decimal digits.
    #[error("imei must be exactly 15 decimal digits")]
    BadFormat,

    /// Digits do not satisfy the Luhn checksum.
    #[error("imei fails the luhn checksum")]
    BadChecksum,
}

/// Validate an IMEI: 15 decimal digits with a zero Luhn sum.
pub fn validate(imei: &str) -> Result<(), ImeiError> {
    if imei.len() != 15 || !imei.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ImeiError::BadFormat);
    }

    if luhn_valid(imei) { Ok(()) } else { Err(ImeiError::BadChecksum) }
}

/// Luhn checksum over a run of ASCII digits.
///
/// Right to left, every second digit is doubled and reduced by 9 when the
/// doubling carries; the total must be divisible by 10. Non-digit input
/// yields `false`.
#[must_use]
pub fn luhn_valid(digits: &str) -> bool {
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return false;
    }

    let sum: u32 = digits
        .bytes()
        .rev()
        .enumerate()
        .map(|(i, b)| {
            let d = u32::from(b - b'0');
            if i % 2 == 1 {
                let doubled = d * 2;
                if doubled > 9 { doubled - 9 } else { doubled }
            } else {
                d
            }
        })
        .sum();

    sum % 10 == 0
}
