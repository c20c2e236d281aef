/// Counts tokens the way the target language model would.
pub trait TokenCounter {
    fn count_tokens(&self, text: &str) -> usize;
}

impl<F> TokenCounter for F
where
    F: Fn(&str) -> usize,
{
    fn count_tokens(&self, text: &str) -> usize {
        self(text)
    }
}

/// Tokenizer-free estimate: the larger of the word count and one token per
/// four characters. Tends to overestimate slightly for English prose.
#[derive(Debug, Clone, Copy, Default)]
pub struct ApproximateTokenCounter;

impl TokenCounter for ApproximateTokenCounter {
    fn count_tokens(&self, text: &str) -> usize {
        let words = text.split_whitespace().count();
        let chars = text.chars().count();
        words.max(chars.div_ceil(4))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_text_has_no_tokens() {
        assert_eq!(ApproximateTokenCounter.count_tokens(""), 0);
    }

    #[test]
    fn short_words_count_per_word() {
        assert_eq!(ApproximateTokenCounter.count_tokens("a b c d e"), 5);
    }

    #[test]
    fn long_words_count_per_four_chars() {
        assert_eq!(ApproximateTokenCounter.count_tokens("internationalization"), 5);
    }

    #[test]
    fn closures_are_counters() {
        let counter = |text: &str| text.len();
        assert_eq!(counter.count_tokens("abc"), 3);
    }
}
