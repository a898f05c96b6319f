//! Utility functions and helpers

pub mod time;

/// Turn a raw (possibly negative or zero) line or column number into a
/// 1-based position. Anything that is not a positive 32-bit value means
/// "no position info".
pub fn source_position(raw: Option<i64>) -> Option<u32> {
    raw.and_then(|v| u32::try_from(v).ok()).filter(|v| *v > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_position() {
        assert_eq!(source_position(Some(10)), Some(10));
        assert_eq!(source_position(Some(0)), None);
        assert_eq!(source_position(Some(-3)), None);
        assert_eq!(source_position(Some(i64::from(u32::MAX) + 1)), None);
        assert_eq!(source_position(None), None);
    }
}
