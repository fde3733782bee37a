//! Order numbers and delivery codes.

use chrono::NaiveDate;
use rand::Rng;
use std::collections::VecDeque;
use std::sync::Mutex;

/// Upper bound (inclusive) for six-digit codes and sequences
pub const MAX_SIX_DIGITS: u32 = 999_999;

pub trait CodeGenerator: Send + Sync {
    /// A value in `0..=999_999` used as the delivery OTP.
    fn delivery_code(&self) -> u32;
    /// A value in `0..=999_999` used as the order-number suffix.
    fn order_sequence(&self) -> u32;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RandomCodeGenerator;

impl CodeGenerator for RandomCodeGenerator {
    fn delivery_code(&self) -> u32 {
        rand::thread_rng().gen_range(0..=MAX_SIX_DIGITS)
    }

    fn order_sequence(&self) -> u32 {
        rand::thread_rng().gen_range(0..=MAX_SIX_DIGITS)
    }
}

/// Replays queued values, then falls back to counting upwards.
#[derive(Debug, Default)]
pub struct ScriptedCodeGenerator {
    delivery_codes: Mutex<VecDeque<u32>>,
    sequences: Mutex<VecDeque<u32>>,
    counter: Mutex<u32>,
}

impl ScriptedCodeGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delivery_codes(self, codes: impl IntoIterator<Item = u32>) -> Self {
        lock(&self.delivery_codes).extend(codes);
        self
    }

    pub fn with_sequences(self, sequences: impl IntoIterator<Item = u32>) -> Self {
        lock(&self.sequences).extend(sequences);
        self
    }

    fn next_counter(&self) -> u32 {
        let mut counter = lock(&self.counter);
        *counter = (*counter % MAX_SIX_DIGITS) + 1;
        *counter
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl CodeGenerator for ScriptedCodeGenerator {
    fn delivery_code(&self) -> u32 {
        let queued = lock(&self.delivery_codes).pop_front();
        queued.unwrap_or_else(|| self.next_counter())
    }

    fn order_sequence(&self) -> u32 {
        let queued = lock(&self.sequences).pop_front();
        queued.unwrap_or_else(|| self.next_counter())
    }
}

/// `PREFIX-YYYYMMDD-NNNNNN`
pub fn format_order_number(prefix: &str, date: NaiveDate, sequence: u32) -> String {
    format!(
        "{}-{}-{:06}",
        prefix,
        date.format("%Y%m%d"),
        sequence % (MAX_SIX_DIGITS + 1)
    )
}

/// Six digits, zero padded.
pub fn format_delivery_code(code: u32) -> String {
    format!("{:06}", code % (MAX_SIX_DIGITS + 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_number_layout() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        assert_eq!(format_order_number("COL", date, 42), "COL-20240301-000042");
        assert_eq!(
            format_order_number("COL", date, 999_999),
            "COL-20240301-999999"
        );
    }

    #[test]
    fn delivery_code_is_zero_padded() {
        assert_eq!(format_delivery_code(7), "000007");
        assert_eq!(format_delivery_code(0), "000000");
        assert_eq!(format_delivery_code(123_456), "123456");
    }

    #[test]
    fn random_codes_stay_in_range() {
        let generator = RandomCodeGenerator;
        for _ in 0..1_000 {
            assert!(generator.delivery_code() <= MAX_SIX_DIGITS);
            assert_eq!(format_delivery_code(generator.delivery_code()).len(), 6);
        }
    }

    #[test]
    fn scripted_generator_replays_then_counts() {
        let generator = ScriptedCodeGenerator::new()
            .with_delivery_codes([111_111])
            .with_sequences([5, 5]);
        assert_eq!(generator.delivery_code(), 111_111);
        assert_eq!(generator.order_sequence(), 5);
        assert_eq!(generator.order_sequence(), 5);
        assert_eq!(generator.order_sequence(), 1);
        assert_eq!(generator.delivery_code(), 2);
    }
}
