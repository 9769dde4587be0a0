use nanoid::nanoid;

/// Characters for session codes - excludes 0/O/1/I/L to avoid confusion
/// when read aloud or typed by hand.
pub const CODE_ALPHABET: [char; 31] = [
    'A', 'B', 'C', 'D', 'E', 'F', 'G', 'H', 'J', 'K', 'M', 'N', 'P', 'Q', 'R', 'S', 'T', 'U', 'V',
    'W', 'X', 'Y', 'Z', '2', '3', '4', '5', '6', '7', '8', '9',
];

/// Default session code length. The registry widens to `WIDENED_LENGTH` if
/// it exhausts its collision-retry budget at this length.
pub const DEFAULT_LENGTH: usize = 6;
pub const WIDENED_LENGTH: usize = 7;

/// Generate a session code of the given length from `CODE_ALPHABET`.
pub fn generate(length: usize) -> String {
    nanoid!(length, &CODE_ALPHABET)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_length_is_six() {
        assert_eq!(generate(DEFAULT_LENGTH).len(), 6);
    }

    #[test]
    fn widened_length_is_seven() {
        assert_eq!(generate(WIDENED_LENGTH).len(), 7);
    }

    #[test]
    fn only_uses_unambiguous_alphabet() {
        for _ in 0..200 {
            let code = generate(DEFAULT_LENGTH);
            for c in code.chars() {
                assert!(CODE_ALPHABET.contains(&c), "unexpected char {c} in {code}");
            }
            assert!(!code.contains(['0', 'O', '1', 'I', 'L']));
        }
    }
}
