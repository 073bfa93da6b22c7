use scraper::{ElementRef, Html, Selector};
use unicode_normalization::UnicodeNormalization;

/// Declare selectors that are only initialised once and add tests to ensure they can be safely unwraped
/// The syntax is `SELECTOR_NAME: "selector";`
#[macro_export]
macro_rules! lazy_selectors {
    ( $( $selector_name:ident: $selector:expr; )+ ) => {
        $(
        static $selector_name: std::sync::LazyLock<scraper::Selector> =
            std::sync::LazyLock::new(|| scraper::Selector::parse($selector)
                .expect("One of the lazy selectors failed, run `cargo test` to find out which"));
        )*

        #[cfg(test)]
        mod lazy_selectors_autotest {
            $(
                /// Ensure the selector can be unwraped safely
                #[test]
                #[allow(non_snake_case)]
                fn $selector_name() {
                    assert!(scraper::Selector::parse(&$selector).is_ok());
                }
            )*
        }
    };
}

pub trait QuickSelect {
    fn get_inner_html_of(&self, selector: &Selector) -> Option<String>;
    fn get_text_of(&self, selector: &Selector) -> Option<String>;
    fn get_attr_of(&self, selector: &Selector, attr: &str) -> Option<String>;
}

impl QuickSelect for Html {
    fn get_inner_html_of(&self, selector: &Selector) -> Option<String> {
        self.select(selector)
            .next()
            .map(|element| element.inner_html())
            .filter(|s| !s.is_empty())
    }

    fn get_text_of(&self, selector: &Selector) -> Option<String> {
        self.select(selector)
            .next()
            .map(|e| collect_text(&e))
            .filter(|s| !s.is_empty())
    }

    fn get_attr_of(&self, selector: &Selector, attr: &str) -> Option<String> {
        self.select(selector)
            .next()
            .and_then(|e| e.attr(attr))
            .filter(|s| !s.is_empty())
            .map(ToString::to_string)
    }
}

/// All text of an element: NFC-normalized, whitespace-collapsed and
/// trimmed, with non-breaking spaces turned into plain spaces.
pub fn collect_text(element: &ElementRef) -> String {
    let mut out = String::new();
    for piece in element.text() {
        let piece = piece.replace('\u{a0}', " ");
        let trimmed = piece.trim();
        if trimmed.is_empty() {
            continue;
        }
        if !out.is_empty() {
            out.push(' ');
        }
        out.extend(trimmed.nfc());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collect_text_joins_and_normalizes() {
        let html = Html::parse_fragment("<p>  Chương\u{a0}1:  <b>Khởi đầu</b> </p>");
        let selector = Selector::parse("p").unwrap();
        let p = html.select(&selector).next().unwrap();
        assert_eq!(collect_text(&p), "Chương 1: Khởi đầu");
    }

    #[test]
    fn collect_text_recomposes_to_nfc() {
        // "é" as 'e' + combining acute must come out precomposed
        let html = Html::parse_fragment("<p>cafe\u{0301}</p>");
        let selector = Selector::parse("p").unwrap();
        let p = html.select(&selector).next().unwrap();
        assert_eq!(collect_text(&p), "café");
    }

    #[test]
    fn get_text_of_skips_empty_matches() {
        let html = Html::parse_fragment("<div><span></span><span>x</span></div>");
        let selector = Selector::parse("span").unwrap();
        assert_eq!(html.get_text_of(&selector), None);
    }
}
