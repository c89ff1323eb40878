use scraper::{ElementRef, Html, Selector};

/// A parsed HTML document.
///
/// `scraper::Html` is not `Send`; keep documents inside synchronous scopes
/// and never hold one across an `.await`.
pub struct Document {
    html: Html,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid path `{path}`: {message}")]
pub struct PathError {
    pub path: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Target {
    Text,
    OwnText,
    Attr(String),
}

/// A selector path: a CSS selector with an optional `::text` or `@attr` target,
/// or a legacy XPath in the subset listing configs were written in.
#[derive(Debug, Clone)]
pub struct SelectorPath {
    selector: Selector,
    target: Target,
}

impl SelectorPath {
    pub fn parse(path: &str) -> Result<Self, PathError> {
        let error = |message: String| PathError {
            path: path.to_owned(),
            message,
        };

        let trimmed = path.trim();
        let (css, target) = if is_xpath(trimmed) {
            xpath_to_css(trimmed).map_err(error)?
        } else if let Some(css) = trimmed.strip_suffix("::text") {
            (css.trim().to_owned(), Target::OwnText)
        } else if let Some((css, attr)) = trimmed.rsplit_once('@')
            && is_attribute_name(attr.trim())
        {
            (css.trim().to_owned(), Target::Attr(attr.trim().to_owned()))
        } else {
            (trimmed.to_owned(), Target::Text)
        };

        if css.is_empty() {
            return Err(error("empty selector".to_owned()));
        }
        let selector = Selector::parse(&css).map_err(|err| error(err.to_string()))?;

        Ok(Self { selector, target })
    }

    pub fn is_attribute(&self) -> bool {
        matches!(self.target, Target::Attr(_))
    }
}

fn is_xpath(path: &str) -> bool {
    path.starts_with('/') || path.starts_with("./")
}

/// Translates a location path such as `//div[contains(@class,'price')]/span[2]/text()`.
///
/// Supported: `/` and `//` axes, `*` and tag name tests, `@attr`,
/// `@attr='v'`, `contains(@attr,'v')`, `starts-with(@attr,'v')`, `[n]`,
/// `last()` and `and` inside predicates, and a trailing `text()` or `@attr`.
fn xpath_to_css(xpath: &str) -> Result<(String, Target), String> {
    let mut cursor = Cursor::new(xpath);
    if !(cursor.eat(".//") || cursor.eat("//") || cursor.eat("./") || cursor.eat("/")) {
        return Err("xpath must start with `/` or `//`".to_owned());
    }

    let mut combinator = "";
    let mut css = String::new();
    let mut target = Target::Text;
    loop {
        if cursor.eat("text()") {
            if css.is_empty() {
                return Err("`text()` needs an element step".to_owned());
            }
            // `//text()` takes every descendant text node.
            target = if combinator == " " {
                Target::Text
            } else {
                Target::OwnText
            };
            break;
        }
        if cursor.eat("@") {
            let name = cursor
                .name()
                .ok_or_else(|| cursor.unexpected("attribute name"))?;
            target = Target::Attr(name);
            break;
        }

        css.push_str(combinator);
        css.push_str(&xpath_step(&mut cursor)?);

        if cursor.at_end() {
            break;
        }
        combinator = if cursor.eat("//") {
            " "
        } else if cursor.eat("/") {
            " > "
        } else {
            return Err(cursor.unexpected("`/`"));
        };
    }

    if !cursor.at_end() {
        return Err(cursor.unexpected("end of path"));
    }
    Ok((css, target))
}

fn xpath_step(cursor: &mut Cursor) -> Result<String, String> {
    let tag = if cursor.eat("*") {
        "*".to_owned()
    } else {
        cursor.name().ok_or_else(|| cursor.unexpected("element name"))?
    };
    let any = tag == "*";

    let mut css = tag;
    while cursor.eat("[") {
        loop {
            cursor.skip_ws();
            css.push_str(&xpath_condition(cursor, any)?);
            cursor.skip_ws();
            if cursor.eat("]") {
                break;
            }
            if !cursor.eat("and") {
                return Err(cursor.unexpected("`and` or `]`"));
            }
        }
    }
    Ok(css)
}

fn xpath_condition(cursor: &mut Cursor, any: bool) -> Result<String, String> {
    if cursor.eat("@") {
        let attr = cursor
            .name()
            .ok_or_else(|| cursor.unexpected("attribute name"))?;
        cursor.skip_ws();
        if !cursor.eat("=") {
            return Ok(format!("[{attr}]"));
        }
        cursor.skip_ws();
        let value = cursor.quoted()?;
        return Ok(format!("[{attr}={}]", css_string(&value)));
    }

    for (function, operator) in [("contains(", "*="), ("starts-with(", "^=")] {
        if !cursor.eat(function) {
            continue;
        }
        cursor.skip_ws();
        if !cursor.eat("@") {
            return Err(cursor.unexpected("`@attr` (text predicates are not supported)"));
        }
        let attr = cursor
            .name()
            .ok_or_else(|| cursor.unexpected("attribute name"))?;
        cursor.skip_ws();
        if !cursor.eat(",") {
            return Err(cursor.unexpected("`,`"));
        }
        cursor.skip_ws();
        let value = cursor.quoted()?;
        cursor.skip_ws();
        if !cursor.eat(")") {
            return Err(cursor.unexpected("`)`"));
        }
        return Ok(format!("[{attr}{operator}{}]", css_string(&value)));
    }

    if cursor.eat("last()") {
        return Ok(if any { ":last-child" } else { ":last-of-type" }.to_owned());
    }
    if let Some(position) = cursor.number() {
        if position == 0 {
            return Err("positions start at 1".to_owned());
        }
        return Ok(if any {
            format!(":nth-child({position})")
        } else {
            format!(":nth-of-type({position})")
        });
    }
    Err(cursor.unexpected("predicate"))
}

fn css_string(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

struct Cursor<'a> {
    rest: &'a str,
}

impl<'a> Cursor<'a> {
    fn new(source: &'a str) -> Self {
        Self { rest: source }
    }

    fn at_end(&self) -> bool {
        self.rest.is_empty()
    }

    fn eat(&mut self, token: &str) -> bool {
        match self.rest.strip_prefix(token) {
            Some(rest) => {
                self.rest = rest;
                true
            }
            None => false,
        }
    }

    fn skip_ws(&mut self) {
        self.rest = self.rest.trim_start();
    }

    fn take_while(&mut self, keep: impl Fn(char) -> bool) -> &'a str {
        let end = self
            .rest
            .char_indices()
            .find(|(_, c)| !keep(*c))
            .map_or(self.rest.len(), |(i, _)| i);
        let (taken, rest) = self.rest.split_at(end);
        self.rest = rest;
        taken
    }

    fn name(&mut self) -> Option<String> {
        let name = self.take_while(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'));
        (!name.is_empty()).then(|| name.to_owned())
    }

    fn number(&mut self) -> Option<usize> {
        let digits = self.take_while(|c| c.is_ascii_digit());
        digits.parse().ok()
    }

    fn quoted(&mut self) -> Result<String, String> {
        let quote = match self.rest.chars().next() {
            Some(q @ ('\'' | '"')) => q,
            _ => return Err(self.unexpected("quoted string")),
        };
        self.rest = &self.rest[1..];
        let Some(end) = self.rest.find(quote) else {
            return Err("unterminated string".to_owned());
        };
        let value = self.rest[..end].to_owned();
        self.rest = &self.rest[end + 1..];
        Ok(value)
    }

    fn unexpected(&self, expected: &str) -> String {
        match self.rest.chars().next() {
            Some(_) => format!("expected {expected} at `{}`", self.rest),
            None => format!("expected {expected} at end of path"),
        }
    }
}

fn is_attribute_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | ':'))
}

impl Document {
    pub fn parse(html: &str) -> Self {
        Self {
            html: Html::parse_document(html),
        }
    }

    /// Returns trimmed, non-empty fragments in document order.
    pub fn select(&self, path: &SelectorPath) -> Vec<String> {
        let mut fragments = Vec::new();
        for element in self.html.select(&path.selector) {
            match &path.target {
                Target::Text => push_fragment(&mut fragments, &element.text().collect::<String>()),
                Target::OwnText => {
                    for text in own_text_nodes(element) {
                        push_fragment(&mut fragments, text);
                    }
                }
                Target::Attr(name) => {
                    if let Some(value) = element.value().attr(name) {
                        push_fragment(&mut fragments, value);
                    }
                }
            }
        }
        fragments
    }

    /// Like [`Document::select`], but text targets fall back to the `href` of
    /// matched elements. Used for listing links and pagination buttons.
    pub fn select_links(&self, path: &SelectorPath) -> Vec<String> {
        if path.is_attribute() {
            return self.select(path);
        }
        let mut links = Vec::new();
        for element in self.html.select(&path.selector) {
            if let Some(href) = element.value().attr("href") {
                push_fragment(&mut links, href);
            }
        }
        links
    }

    pub fn matches(&self, path: &SelectorPath) -> bool {
        self.html.select(&path.selector).next().is_some()
    }
}

fn own_text_nodes<'a>(element: ElementRef<'a>) -> impl Iterator<Item = &'a str> {
    element
        .children()
        .filter_map(|node| node.value().as_text().map(|text| &**text))
}

fn push_fragment(fragments: &mut Vec<String>, raw: &str) {
    let trimmed = raw.trim();
    if !trimmed.is_empty() {
        fragments.push(trimmed.to_owned());
    }
}
