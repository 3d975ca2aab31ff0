use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};

pub fn rand_string() -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(10)
        .map(char::from)
        .collect()
}

/// A name for sessions the user did not name
pub(crate) fn generated_session_name() -> String {
    format!("etwsession-{}", rand_string())
}

/// Keep at most `max_chars` characters (not bytes) of `name`
pub(crate) fn truncate_chars(name: &str, max_chars: usize) -> String {
    name.chars().take(max_chars).collect()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_truncation_keeps_whole_characters() {
        assert_eq!(truncate_chars("tråce", 3), "trå");
        assert_eq!(truncate_chars("short", 200), "short");
    }

    #[test]
    fn test_generated_names_differ() {
        assert_ne!(generated_session_name(), generated_session_name());
    }
}
