/// Drop anything between `<` and `>` and collapse whitespace runs to one space.
///
/// Store payloads embed light markup in text fields (`<strong>*</strong>`,
/// `<br>`); this is enough for substring matching and never fails. An
/// unterminated `<` swallows the rest of the input.
pub fn strip_html_tags(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut in_tag = false;
    let mut prev_space = false;
    for ch in input.chars() {
        match ch {
            '<' => in_tag = true,
            '>' if in_tag => {
                in_tag = false;
            }
            _ if in_tag => {}
            c if c.is_whitespace() => {
                if !prev_space {
                    out.push(' ');
                    prev_space = true;
                }
            }
            c => {
                out.push(c);
                prev_space = false;
            }
        }
    }
    decode_basic_entities(out.trim())
}

// Only the handful of entities that show up in language lists.
fn decode_basic_entities(input: &str) -> String {
    if !input.contains('&') {
        return input.to_string();
    }
    input
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_tags_and_collapses_whitespace() {
        assert_eq!(
            strip_html_tags("English<strong>*</strong>,  Korean<br><br>\n<strong>*</strong>full audio"),
            "English*, Korean *full audio"
        );
    }

    #[test]
    fn split_word_is_rejoined() {
        assert_eq!(strip_html_tags("<b>Kor</b>ean"), "Korean");
    }

    #[test]
    fn unterminated_tag_drops_the_tail() {
        assert_eq!(strip_html_tags("French, <strong Korean"), "French,");
    }

    #[test]
    fn decodes_common_entities() {
        assert_eq!(strip_html_tags("Fish&amp;Chips&nbsp;Edition"), "Fish&Chips Edition");
    }
}
