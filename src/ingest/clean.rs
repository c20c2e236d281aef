use regex::{Captures, Regex};

use crate::models::Page;

pub type CleaningPass = fn(&str) -> String;

/// Hyphen repair must run before the newline passes.
pub const DEFAULT_PASSES: [CleaningPass; 3] = [
    merge_hyphenated_line_breaks,
    collapse_single_newlines,
    collapse_repeated_newlines,
];

pub fn merge_hyphenated_line_breaks(text: &str) -> String {
    let Ok(re) = Regex::new(r"(\w)-\n(\w)") else {
        return text.to_string();
    };
    re.replace_all(text, "${1}${2}").into_owned()
}

pub fn collapse_single_newlines(text: &str) -> String {
    let Ok(re) = Regex::new(r"\n+") else {
        return text.to_string();
    };
    re.replace_all(text, |caps: &Captures| {
        let run = &caps[0];
        if run.len() == 1 {
            " ".to_string()
        } else {
            run.to_string()
        }
    })
    .into_owned()
}

pub fn collapse_repeated_newlines(text: &str) -> String {
    let Ok(re) = Regex::new(r"\n{2,}") else {
        return text.to_string();
    };
    re.replace_all(text, "\n").into_owned()
}

pub fn normalize(text: &str, passes: &[CleaningPass]) -> String {
    passes
        .iter()
        .fold(text.to_string(), |current, pass| pass(&current))
}

pub fn clean_pages(pages: &[Page], passes: &[CleaningPass]) -> Vec<Page> {
    pages
        .iter()
        .map(|page| Page {
            index: page.index,
            text: normalize(&page.text, passes),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merges_single_hyphenated_word() {
        assert_eq!(merge_hyphenated_line_breaks("hyphen-\nated"), "hyphenated");
        assert_eq!(
            merge_hyphenated_line_breaks("This is a hyphen-\nated word."),
            "This is a hyphenated word."
        );
    }

    #[test]
    fn merges_every_hyphenated_word() {
        let text = "This is a hyphen-\nated word and anoth-\ner hyphenated word.";
        assert_eq!(
            merge_hyphenated_line_breaks(text),
            "This is a hyphenated word and another hyphenated word."
        );
    }

    #[test]
    fn hyphen_merge_needs_word_chars_on_both_sides() {
        let text = "A plain sentence without breaks.";
        assert_eq!(merge_hyphenated_line_breaks(text), text);
        assert_eq!(merge_hyphenated_line_breaks("end -\nstart"), "end -\nstart");
        assert_eq!(merge_hyphenated_line_breaks("end-\n start"), "end-\n start");
    }

    #[test]
    fn single_newline_becomes_space() {
        assert_eq!(collapse_single_newlines("a\nb"), "a b");
        assert_eq!(
            collapse_single_newlines("This is a line with\na single newline."),
            "This is a line with a single newline."
        );
    }

    #[test]
    fn paragraph_breaks_survive_single_newline_pass() {
        assert_eq!(collapse_single_newlines("a\n\nb"), "a\n\nb");
        assert_eq!(
            collapse_single_newlines("with\na single newline and\n\na double newline."),
            "with a single newline and\n\na double newline."
        );
    }

    #[test]
    fn repeated_newlines_collapse_to_one() {
        assert_eq!(collapse_repeated_newlines("a\n\n\nb"), "a\nb");
        assert_eq!(
            collapse_repeated_newlines("page one\n\npage two\n\n\npage three"),
            "page one\npage two\npage three"
        );
        assert_eq!(collapse_repeated_newlines("a\nb\nc"), "a\nb\nc");
        assert_eq!(collapse_repeated_newlines("ab"), "ab");
        assert_eq!(collapse_repeated_newlines(""), "");
    }

    #[test]
    fn passes_run_in_order() {
        fn upper(text: &str) -> String {
            text.to_uppercase()
        }
        fn tag(text: &str) -> String {
            format!("<{text}>")
        }

        assert_eq!(normalize("abc", &[upper, tag]), "<ABC>");
        assert_eq!(normalize("abc", &[]), "abc");
    }

    #[test]
    fn default_passes_clean_extracted_text() {
        let raw = "The agree-\nment covers\nall users.\n\n\nSection two\nstarts here.";
        assert_eq!(
            normalize(raw, &DEFAULT_PASSES),
            "The agreement covers all users.\nSection two starts here."
        );
    }

    #[test]
    fn clean_pages_keeps_indices() {
        let pages = vec![
            Page {
                index: 0,
                text: "page\none".to_string(),
            },
            Page {
                index: 2,
                text: "page\n\n\nthree".to_string(),
            },
        ];

        let cleaned = clean_pages(&pages, &DEFAULT_PASSES);
        assert_eq!(
            cleaned,
            vec![
                Page {
                    index: 0,
                    text: "page one".to_string(),
                },
                Page {
                    index: 2,
                    text: "page\nthree".to_string(),
                },
            ]
        );
    }
}
