//! Disposable address and password generation

use rand::Rng;
use rand::seq::{IndexedRandom, SliceRandom};
use tracing::debug;

const LOCAL_PART_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const LETTERS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";
const DIGITS: &[u8] = b"0123456789";
const SYMBOLS: &[u8] = b"!@#$%^&*";

pub const MIN_LOCAL_PART_LENGTH: usize = 8;
pub const MIN_PASSWORD_LENGTH: usize = 8;

/// Builds `<random>@<domain>` addresses on the catch-all domains.
#[derive(Debug, Clone)]
pub struct AddressGenerator {
    domains: Vec<String>,
    local_part_length: usize,
}

impl AddressGenerator {
    /// `domains` must be non-empty; configuration validates this at
    /// startup.
    #[must_use]
    pub fn new(domains: Vec<String>, local_part_length: usize) -> Self {
        Self {
            domains,
            local_part_length: local_part_length.max(MIN_LOCAL_PART_LENGTH),
        }
    }

    #[must_use]
    pub fn generate(&self) -> String {
        let mut rng = rand::rng();
        let local: String = (0..self.local_part_length)
            .map(|_| char::from(LOCAL_PART_CHARSET[rng.random_range(0..LOCAL_PART_CHARSET.len())]))
            .collect();
        let domain = self
            .domains
            .choose(&mut rng)
            .map_or("localhost.invalid", String::as_str);

        let address = format!("{local}@{domain}");
        debug!("Generated address {}", address);
        address
    }
}

/// Random password with at least one letter, digit and symbol.
#[must_use]
pub fn generate_password(length: usize) -> String {
    let length = length.max(MIN_PASSWORD_LENGTH);
    let mut rng = rand::rng();
    let pool: Vec<u8> = [LETTERS, DIGITS, SYMBOLS].concat();

    let mut chars: Vec<u8> = Vec::with_capacity(length);
    for class in [LETTERS, DIGITS, SYMBOLS] {
        chars.push(class[rng.random_range(0..class.len())]);
    }
    while chars.len() < length {
        chars.push(pool[rng.random_range(0..pool.len())]);
    }
    chars.shuffle(&mut rng);

    chars.into_iter().map(char::from).collect()
}
