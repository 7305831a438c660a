//! Parser for the email-header-like format of `METADATA` and `PKG-INFO`
//! files. The format is nominally RFC 822 but in practice it is "whatever
//! the Python standard library email parser accepts": lenient line endings,
//! continuation lines kept verbatim with embedded newlines, and an optional
//! free-form body after the first blank line.

use std::collections::HashMap;
use thiserror::Error;

/// The parsed headers and body of a metadata file. Header names are folded
/// to lowercase; repeated headers accumulate in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rfc822ish {
    fields: HashMap<String, Vec<String>>,
    /// The free-form body after the headers, which modern metadata uses for
    /// the long description.
    pub body: Option<String>,
}

/// Error raised when a metadata file cannot be parsed or a required field is
/// missing or repeated.
#[derive(Debug, Clone, Error)]
pub enum Rfc822ishError {
    /// The header section is malformed.
    #[error("malformed metadata headers: {0}")]
    Malformed(String),

    /// A field expected exactly once is missing.
    #[error("missing required metadata field '{0}'")]
    MissingField(String),

    /// A field expected at most once appears several times.
    #[error("multiple values for metadata field '{0}'")]
    DuplicateField(String),
}

peg::parser! {
    grammar rfc822ish_parser() for str {
        rule line_ending()
            = quiet!{"\r\n" / "\r" / "\n"} / expected!("end of line")

        rule field_name() -> &'input str
            = quiet!{$(['\x21'..='\x39' | '\x3b'..='\x7e']+)} / expected!("field name")

        // whitespace right after the colon is dropped, the rest of the value
        // is preserved as-is
        rule field_separator()
            = ":" [' ' | '\t']*

        rule field_value_piece()
            = [^ '\r' | '\n']*

        rule continuation_line_ending()
            = quiet!{line_ending() [' ' | '\t']} / expected!("continuation line")

        rule field_value() -> &'input str
            = $(field_value_piece() ** continuation_line_ending())

        rule field() -> (String, String)
            = n:field_name() field_separator() v:field_value()
                { (n.to_ascii_lowercase(), v.to_owned()) }

        rule fields() -> Vec<(String, String)>
            = field() ** line_ending()

        rule trailing_body() -> String
            = line_ending() line_ending() b:$([_]*) { b.to_owned() }

        pub rule document() -> Rfc822ish
            = f:fields() body:(trailing_body()?) line_ending()?
                {
                    let mut fields: HashMap<String, Vec<String>> = HashMap::new();
                    for (name, value) in f {
                        fields.entry(name).or_default().push(value);
                    }
                    Rfc822ish { fields, body }
                }
    }
}

impl Rfc822ish {
    /// Parses a metadata document.
    pub fn parse(input: &str) -> Result<Rfc822ish, Rfc822ishError> {
        rfc822ish_parser::document(input).map_err(|e| Rfc822ishError::Malformed(e.to_string()))
    }

    /// Removes and returns every value of `key`.
    pub fn take_all(&mut self, key: &str) -> Vec<String> {
        self.fields
            .remove(&key.to_ascii_lowercase())
            .unwrap_or_default()
    }

    /// Removes the single value of `key`, or `None` when absent. Errors when
    /// the field appears more than once.
    pub fn maybe_take(&mut self, key: &str) -> Result<Option<String>, Rfc822ishError> {
        let mut values = self.take_all(key);
        match values.len() {
            0 => Ok(None),
            1 => Ok(values.pop()),
            _ => Err(Rfc822ishError::DuplicateField(key.to_string())),
        }
    }

    /// Removes the single, required value of `key`.
    pub fn take(&mut self, key: &str) -> Result<String, Rfc822ishError> {
        self.maybe_take(key)?
            .ok_or_else(|| Rfc822ishError::MissingField(key.to_string()))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_basic_document() {
        let mut parsed = Rfc822ish::parse(
            "Metadata-Version: 2.1\nName: demo\nVersion: 0.0.1\nRequires-Dist: idna\nRequires-Dist: chardet; extra == 'enc'\n\nThe long description.\n",
        )
        .unwrap();
        assert_eq!(parsed.take("Name").unwrap(), "demo");
        assert_eq!(parsed.take_all("Requires-Dist").len(), 2);
        assert_eq!(parsed.body.as_deref(), Some("The long description.\n"));
        assert!(parsed.maybe_take("Requires-Python").unwrap().is_none());
    }

    #[test]
    fn test_continuation_lines() {
        let mut parsed =
            Rfc822ish::parse("Summary: first line\n continued here\nName: demo\n").unwrap();
        assert_eq!(parsed.take("Summary").unwrap(), "first line\n continued here");
    }

    #[test]
    fn test_duplicate_singleton() {
        let mut parsed = Rfc822ish::parse("Version: 1\nVersion: 2\n").unwrap();
        assert!(matches!(
            parsed.maybe_take("Version"),
            Err(Rfc822ishError::DuplicateField(_))
        ));
    }
}
