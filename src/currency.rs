//! Currency parameters shared by nodes and the wallets they create

use crate::error::{NodeError, Result};
use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Currency {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_ticker")]
    pub ticker: String,
    #[serde(default = "default_decimal_places")]
    pub decimal_places: u8,
}

impl Default for Currency {
    fn default() -> Self {
        Self {
            name: default_name(),
            ticker: default_ticker(),
            decimal_places: default_decimal_places(),
        }
    }
}

impl Currency {
    /// Render atomic units as a decimal amount, e.g. `1234500` -> `"1.234500"`.
    pub fn format_amount(&self, amount: u64) -> String {
        let places = self.decimal_places as usize;
        if places == 0 {
            return amount.to_string();
        }
        let digits = format!("{:0>width$}", amount, width = places + 1);
        let (whole, frac) = digits.split_at(digits.len() - places);
        format!("{}.{}", whole, frac)
    }

    /// Parse a decimal amount into atomic units.
    pub fn parse_amount(&self, text: &str) -> Result<u64> {
        let text = text.trim();
        let places = self.decimal_places as usize;
        let (whole, frac) = match text.split_once('.') {
            Some((w, f)) => (w, f),
            None => (text, ""),
        };

        let bad = || NodeError::ConfigError(format!("invalid amount \"{}\"", text));
        if whole.is_empty() && frac.is_empty() {
            return Err(bad());
        }
        if frac.len() > places
            || !whole.chars().all(|c| c.is_ascii_digit())
            || !frac.chars().all(|c| c.is_ascii_digit())
        {
            return Err(bad());
        }

        let padded = format!("{}{:0<width$}", whole, frac, width = places);
        padded.parse::<u64>().map_err(|_| bad())
    }
}

fn default_name() -> String {
    "Quid".to_string()
}

fn default_ticker() -> String {
    "QUID".to_string()
}

fn default_decimal_places() -> u8 {
    6
}
