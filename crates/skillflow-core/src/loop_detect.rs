//! Loop detection over the run's execution sequence.
//!
//! Two consecutive executions of one skill are legitimate (retry with new
//! inputs); the third is not. Alternating and three-skill cycles are caught
//! over the last six executions.

/// Examine the tail of the execution sequence and return a descriptive error
/// when an infinite loop is detected.
pub fn detect_infinite_loop(execution_sequence: &[String]) -> Option<String> {
    if execution_sequence.len() < 3 {
        return None;
    }
    let recent: Vec<&str> = execution_sequence
        .iter()
        .rev()
        .take(6)
        .rev()
        .map(String::as_str)
        .collect();

    // Same skill executed three times consecutively.
    let tail = &recent[recent.len() - 3..];
    if tail[0] == tail[1] && tail[1] == tail[2] {
        return Some(format!(
            "Infinite loop detected: '{}' executed 3 times in a row",
            tail[0]
        ));
    }

    // Alternating pattern A -> B -> A -> B.
    if recent.len() >= 4 {
        let tail = &recent[recent.len() - 4..];
        if tail[0] == tail[2] && tail[1] == tail[3] {
            return Some(format!(
                "Infinite loop detected: alternating pattern '{}' -> '{}' -> '{}' -> '{}'",
                tail[0], tail[1], tail[2], tail[3]
            ));
        }
    }

    // Three-skill cycle A -> B -> C -> A -> B -> C.
    if recent.len() >= 6
        && recent[0] == recent[3]
        && recent[1] == recent[4]
        && recent[2] == recent[5]
    {
        return Some(format!(
            "Infinite loop detected: cycle pattern '{}' -> '{}' -> '{}' repeating",
            recent[0], recent[1], recent[2]
        ));
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seq(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_short_sequences_are_clean() {
        assert_eq!(detect_infinite_loop(&seq(&[])), None);
        assert_eq!(detect_infinite_loop(&seq(&["a"])), None);
        assert_eq!(detect_infinite_loop(&seq(&["a", "a"])), None);
    }

    #[test]
    fn test_triple_repeat() {
        let err = detect_infinite_loop(&seq(&["a", "a", "a"])).unwrap();
        assert!(err.contains("'a' executed 3 times in a row"));
        // Also caught deep in a longer sequence.
        let err = detect_infinite_loop(&seq(&["x", "y", "b", "b", "b"])).unwrap();
        assert!(err.contains("executed 3 times in a row"));
    }

    #[test]
    fn test_two_in_a_row_is_allowed() {
        assert_eq!(detect_infinite_loop(&seq(&["a", "b", "a", "a"])), None);
    }

    #[test]
    fn test_alternating_pattern() {
        let err = detect_infinite_loop(&seq(&["a", "b", "a", "b"])).unwrap();
        assert!(err.contains("alternating pattern"));
        assert!(err.contains("'a' -> 'b' -> 'a' -> 'b'"));
    }

    #[test]
    fn test_three_cycle() {
        let err = detect_infinite_loop(&seq(&["a", "b", "c", "a", "b", "c"])).unwrap();
        assert!(err.contains("cycle pattern 'a' -> 'b' -> 'c' repeating"));
    }

    #[test]
    fn test_distinct_sequences_are_clean() {
        assert_eq!(detect_infinite_loop(&seq(&["a", "b", "c", "d", "e", "f"])), None);
        assert_eq!(detect_infinite_loop(&seq(&["a", "b", "c", "b", "a", "c"])), None);
    }
}
