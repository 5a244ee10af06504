//! Credit packages
//!
//! Maps a paid amount to a credit grant, either through a price tier lookup
//! or a fixed pack size that ignores the amount.

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Package {
    pub name: String,
    pub price_cents: i64,
    pub credits: u32,
}

impl Package {
    pub fn new(name: impl Into<String>, price_cents: i64, credits: u32) -> Self {
        Self {
            name: name.into(),
            price_cents,
            credits,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreditPolicy {
    /// Amount at or above the premium price buys premium, anything else basic
    Tiered { basic: Package, premium: Package },
    /// Every completed payment buys the same number of credits
    Fixed { credits: u32 },
}

impl Default for CreditPolicy {
    fn default() -> Self {
        CreditPolicy::Tiered {
            basic: Package::new("Basic Package", 500, 2000),
            premium: Package::new("Premium Package", 1000, 5000),
        }
    }
}

/// Credits a payment resolves to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreditGrant {
    pub package: String,
    pub credits: u32,
}

impl CreditPolicy {
    /// Whether a payment without an amount can still be granted
    pub fn needs_amount(&self) -> bool {
        matches!(self, CreditPolicy::Tiered { .. })
    }

    /// Resolve a paid amount to credits. `None` only when the policy needs an
    /// amount and none was given.
    pub fn grant_for(&self, amount_cents: Option<i64>) -> Option<CreditGrant> {
        match self {
            CreditPolicy::Tiered { basic, premium } => {
                let amount = amount_cents?;
                let package = if amount >= premium.price_cents {
                    premium
                } else {
                    basic
                };
                Some(CreditGrant {
                    package: package.name.clone(),
                    credits: package.credits,
                })
            }
            CreditPolicy::Fixed { credits } => Some(CreditGrant {
                package: "Credit Pack".to_string(),
                credits: *credits,
            }),
        }
    }
}

/// Parse a provider decimal amount ("5", "5.0", "10.00") into integer cents.
/// Anything with more than two fractional digits, a sign, or stray characters
/// is rejected.
pub fn parse_amount_cents(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    let (whole, frac) = match raw.split_once('.') {
        Some((whole, frac)) => (whole, frac),
        None => (raw, ""),
    };
    if whole.is_empty() || frac.len() > 2 {
        return None;
    }
    if !whole.bytes().all(|b| b.is_ascii_digit()) || !frac.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    let whole: i64 = whole.parse().ok()?;
    let frac: i64 = match frac.len() {
        0 => 0,
        1 => frac.parse::<i64>().ok()? * 10,
        _ => frac.parse().ok()?,
    };
    whole.checked_mul(100)?.checked_add(frac)
}
