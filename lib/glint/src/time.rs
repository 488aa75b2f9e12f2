use std::time::{SystemTime, UNIX_EPOCH};

/// Returns the current unix timestamp (seconds elapsed since 1970-01-01).
#[inline]
pub fn timestamp_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("System clock is set before the unix epoch")
        .as_secs()
}

/// Returns the current unix timestamp in milliseconds.
#[inline]
pub fn timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("System clock is set before the unix epoch")
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamps_consistent() {
        let secs = timestamp_secs();
        let millis = timestamp_millis();

        // The two reads happen within the same second, give or take one.
        assert!(millis / 1000 >= secs);
        assert!(millis / 1000 - secs <= 1);
    }
}
