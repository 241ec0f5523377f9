//! Pure, total normalizers for contact fields. Every recipient key in the
//! system (audience matching, dedup ledger, provider calls) goes through
//! these functions exactly once, at the extraction boundary.

use std::sync::OnceLock;

use regex::Regex;

#[derive(Debug, Clone)]
pub struct NormalizeConfig {
    /// Country code prepended to national numbers, digits only.
    pub default_country_code: String,
    /// Inputs with fewer significant digits than this are rejected.
    pub min_phone_digits: usize,
}

impl Default for NormalizeConfig {
    fn default() -> Self {
        Self {
            default_country_code: "55".to_string(),
            min_phone_digits: 10,
        }
    }
}

/// Normalize a raw phone string into a canonical digits-only key carrying a
/// country code. Returns `None` for inputs that cannot be a valid mobile
/// number; callers treat that as "lead has no usable phone", never an error.
pub fn normalize_phone(raw: &str, config: &NormalizeConfig) -> Option<String> {
    let digits: String = raw.chars().filter(|ch| ch.is_ascii_digit()).collect();
    if digits.len() < config.min_phone_digits {
        return None;
    }

    let cc = config.default_country_code.as_str();
    // Already international: country code plus a full national number.
    if digits.len() > 11 && digits.starts_with(cc) {
        return Some(digits);
    }
    match digits.len() {
        // Area code + 9-digit mobile (third digit is the mobile prefix).
        11 if digits.as_bytes()[2] == b'9' => Some(format!("{}{}", cc, digits)),
        10 => Some(format!("{}{}", cc, digits)),
        _ => None,
    }
}

fn email_regex() -> &'static Regex {
    static EMAIL_RE: OnceLock<Regex> = OnceLock::new();
    EMAIL_RE.get_or_init(|| {
        Regex::new(r"^[a-z0-9][a-z0-9._%+-]*@[a-z0-9][a-z0-9.-]*\.[a-z]{2,}$")
            .expect("email regex")
    })
}

/// Normalize a raw email string: trim, lower-case, validate conservatively.
pub fn normalize_email(raw: &str) -> Option<String> {
    let candidate = raw.trim().to_ascii_lowercase();
    if email_regex().is_match(&candidate) {
        Some(candidate)
    } else {
        None
    }
}
