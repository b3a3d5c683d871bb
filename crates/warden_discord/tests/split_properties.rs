use proptest::prelude::*;
use warden_discord::rest::split_message;

fn strip_newlines(s: &str) -> String {
    s.chars().filter(|c| *c != '\n').collect()
}

proptest! {
    #[test]
    fn chunks_fit_the_limit(text in "[a-zé\n ]{0,400}", limit in 1usize..60) {
        for chunk in split_message(&text, limit) {
            prop_assert!(!chunk.is_empty());
            prop_assert!(chunk.chars().count() <= limit);
        }
    }

    #[test]
    fn only_newlines_are_lost(text in "[a-z🦀\n]{0,400}", limit in 1usize..60) {
        let joined: String = split_message(&text, limit).concat();
        prop_assert_eq!(strip_newlines(&joined), strip_newlines(&text));
    }

    #[test]
    fn short_text_is_one_chunk(text in "[a-z\n]{1,50}") {
        prop_assert_eq!(split_message(&text, 2000), vec![text]);
    }
}

#[test]
fn empty_text_has_no_chunks() {
    assert!(split_message("", 2000).is_empty());
}

#[test]
fn breaks_on_last_newline_in_window() {
    let chunks = split_message("aaaa\nbbbb\ncccc", 10);
    assert_eq!(chunks, vec!["aaaa\nbbbb", "cccc"]);
}
