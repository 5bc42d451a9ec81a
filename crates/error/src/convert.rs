use crate::{ErrorCode, SluiceError};

impl From<std::io::Error> for SluiceError {
    fn from(err: std::io::Error) -> Self {
        SluiceError::new(ErrorCode::CacheStoreFailed, err.to_string())
    }
}

impl From<serde_json::Error> for SluiceError {
    fn from(err: serde_json::Error) -> Self {
        SluiceError::new(ErrorCode::SerializationFailed, err.to_string())
    }
}

/// Levenshtein-based suggestion used for "did you mean" hints.
pub fn closest_match(target: &str, options: &[String]) -> Option<String> {
    let mut best_match: Option<&str> = None;
    let mut min_distance = usize::MAX;

    for option in options {
        let distance = levenshtein(target, option);
        if distance < min_distance && distance <= 3 {
            min_distance = distance;
            best_match = Some(option.as_str());
        }
    }

    best_match.map(|s| s.to_string())
}

fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];

    for i in 1..=a.len() {
        curr[0] = i;
        for j in 1..=b.len() {
            let cost = usize::from(a[i - 1] != b[j - 1]);
            curr[j] = (prev[j] + 1).min(curr[j - 1] + 1).min(prev[j - 1] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b.len()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levenshtein_distance() {
        assert_eq!(levenshtein("kitten", "sitting"), 3);
        assert_eq!(levenshtein("book", "back"), 2);
        assert_eq!(levenshtein("", ""), 0);
        assert_eq!(levenshtein("same", "same"), 0);
    }

    #[test]
    fn test_closest_match() {
        let options = vec![
            "postgres".to_string(),
            "mysql".to_string(),
            "memory".to_string(),
        ];

        assert_eq!(
            closest_match("postgres", &options),
            Some("postgres".to_string())
        );
        assert_eq!(closest_match("memroy", &options), Some("memory".to_string()));
        assert_eq!(closest_match("completely_different", &options), None);
    }

    #[test]
    fn test_io_error_mapping() {
        let io_err = std::io::Error::other("disk full");
        let err: SluiceError = io_err.into();
        assert_eq!(err.code, ErrorCode::CacheStoreFailed);
        assert!(err.message.contains("disk full"));
    }
}
