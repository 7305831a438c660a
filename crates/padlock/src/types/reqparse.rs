//! The peg grammar for PEP 508 dependency specifications: version specifier
//! lists, environment markers, and full requirement lines with optional
//! direct `@ url` references.

pub use self::parser::{marker, requirement, versionspec};
use super::extra::Extra;
use super::marker::{MarkerExpr, MarkerOp, MarkerValue};
use super::package_name::PackageName;
use super::specifier::{CompareOp, ParseSpecifierError, Specifier, Specifiers};

/// Whether the magic `extra` variable may appear in a marker. It is only
/// meaningful inside package metadata, not in user-supplied requirements.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ParseExtra {
    /// `extra == '...'` atoms are accepted.
    Allowed,
    /// `extra` is rejected with a parse error.
    NotAllowed,
}

/// The raw pieces of a PEP 508 requirement line before classification into
/// named/file/VCS form.
#[derive(Debug, Clone)]
pub struct ParsedLine {
    /// The project name.
    pub name: PackageName,
    /// Requested extras, in source order.
    pub extras: Vec<Extra>,
    /// The version constraint, empty for direct references.
    pub specifiers: Specifiers,
    /// The direct `@ url` reference, if any.
    pub url: Option<String>,
    /// The trailing `; marker`, if any.
    pub marker: Option<MarkerExpr>,
}

/// Builds a validated specifier set from parsed `(op, version)` pairs.
fn build_specifiers(pairs: Vec<(CompareOp, String)>) -> Result<Specifiers, ParseSpecifierError> {
    pairs
        .into_iter()
        .map(|(op, version)| Specifier::new(op, &version))
        .collect::<Result<Vec<_>, _>>()
        .map(Specifiers)
}

peg::parser! {
    grammar parser() for str {
        rule wsp()
            = quiet!{ [' ' | '\t'] }

        rule letter_or_digit()
            = quiet!{['A'..='Z' | 'a'..='z' | '0'..='9']} / expected!("letter or digit")

        rule _()
            = quiet!{ wsp()* }

        rule version_cmp() -> &'input str
            = $("===" / "<=" / ">=" / "~=" / "!=" / "==" / "<" / ">")

        rule version()
            = (letter_or_digit() / "-" / "_" / "." / "*" / "+" / "!")+

        rule version_one() -> (CompareOp, String)
            = _ op:version_cmp() _ v:$(version())
            {
                // the grammar only admits the eight operators, so the parse
                // cannot fail here
                (op.parse().unwrap(), v.to_string())
            }

        rule version_many() -> Vec<(CompareOp, String)>
            = version_one() ++ (_ ",")

        pub rule versionspec() -> Result<Specifiers, ParseSpecifierError>
            = pairs:(("(" vm:version_many() ")" { vm }) / version_many())
            { build_specifiers(pairs) }

        rule urlspec() -> &'input str
            = "@" _ u:$([^ ' ' | '\t']+) { u }

        rule not_in() -> &'static str
            = "not" wsp()+ "in" { "not in" }

        rule marker_op() -> &'input str
            = _ op:(version_cmp() / $("in") / not_in()) { op }

        rule python_str_c() -> &'input str
            = $(quiet! { [' ' | '\t' | 'A'..='Z' | 'a'..='z' | '0'..='9' | '(' | ')'
                 | '.' | '{' | '}' | '-' | '_' | '*' | '#' | ':' | ';' | ','
                 | '/' | '?' | '[' | ']' | '!' | '~' | '`' | '@' | '$' | '%'
                 | '^' | '&' | '=' | '+' | '|' | '<' | '>'] })
              / expected!("printable character")

        // PEP 508 allows but discourages backslash escapes; like the
        // reference grammar we do not support them.
        rule python_squote_str() -> &'input str
            = "'" s:$((python_str_c() / "\"")*) "'" { s }

        rule python_dquote_str() -> &'input str
            = "\"" s:$((python_str_c() / "'")*) "\"" { s }

        rule python_str() -> MarkerValue
            = s:(python_squote_str() / python_dquote_str())
              { MarkerValue::Literal(s.into()) }

        rule env_var(parse_extra: ParseExtra) -> MarkerValue
            = var:$(
                "python_version" / "python_full_version" / "os_name"
                / "sys_platform" / "platform_release" / "platform_system"
                / "platform_version" / "platform_machine"
                / "platform_python_implementation" / "implementation_name"
                / "implementation_version" / "extra"
              )
              {?
               if ParseExtra::NotAllowed == parse_extra && var == "extra" {
                   return Err("'extra' marker is not valid in this context")
               }
               Ok(MarkerValue::Variable(var.to_owned()))
              }

        // https://peps.python.org/pep-0345/#environment-markers
        rule pep345_env_var() -> MarkerValue
           = var:$(
               "os.name" / "sys.platform" / "platform.version" / "platform.machine"
               / "platform.python_implementation"
             )
             { MarkerValue::Variable(var.replace('.', "_")) }

        rule setuptools_env_var() -> MarkerValue
           = "python_implementation"
             { MarkerValue::Variable("platform_python_implementation".into()) }

        rule marker_value(parse_extra: ParseExtra) -> MarkerValue
            = _ v:(env_var(parse_extra) / pep345_env_var() / setuptools_env_var()
                   / python_str())
              { v }

        rule marker_expr(parse_extra: ParseExtra) -> MarkerExpr
            = _ "(" m:marker(parse_extra) _ ")" { m }
              / lhs:marker_value(parse_extra) op:marker_op() rhs:marker_value(parse_extra)
              {
                  let op = match op {
                      "in" => MarkerOp::In,
                      "not in" => MarkerOp::NotIn,
                      // the remaining spellings are the comparison operators
                      compare => MarkerOp::Compare(compare.parse().unwrap()),
                  };
                  MarkerExpr::Operator { op, lhs, rhs }
              }

        rule marker_and(parse_extra: ParseExtra) -> MarkerExpr
            = lhs:marker_expr(parse_extra) _ "and" _ rhs:marker_and(parse_extra)
                 { MarkerExpr::And(Box::new(lhs), Box::new(rhs)) }
              / marker_expr(parse_extra)

        rule marker_or(parse_extra: ParseExtra) -> MarkerExpr
            = lhs:marker_and(parse_extra) _ "or" _ rhs:marker_or(parse_extra)
                 { MarkerExpr::Or(Box::new(lhs), Box::new(rhs)) }
              / marker_and(parse_extra)

        pub rule marker(parse_extra: ParseExtra) -> MarkerExpr
            = marker_or(parse_extra)

        rule quoted_marker(parse_extra: ParseExtra) -> MarkerExpr
            = ";" _ m:marker(parse_extra) { m }

        rule identifier() -> &'input str
            = $(letter_or_digit() (letter_or_digit() / "-" / "_" / ".")*)

        rule name() -> PackageName
            = n:identifier() {? n.parse().or(Err("invalid project name")) }

        rule extra() -> Extra
            = e:identifier() {? e.parse().or(Err("invalid extra name")) }

        rule extras() -> Vec<Extra>
            = "[" _ es:(extra() ** (_ "," _)) _ "]" { es }

        rule name_req(parse_extra: ParseExtra) -> Result<ParsedLine, ParseSpecifierError>
            = name:name()
              _ extras:(extras() / "" { Vec::new() })
              _ specifiers:(versionspec() / "" { Ok(Specifiers::default()) })
              _ marker:(quoted_marker(parse_extra)?)
              {
                  Ok(ParsedLine {
                      name,
                      extras,
                      specifiers: specifiers?,
                      url: None,
                      marker,
                  })
              }

        rule url_req(parse_extra: ParseExtra) -> Result<ParsedLine, ParseSpecifierError>
            = name:name()
              _ extras:(extras() / "" { Vec::new() })
              _ url:urlspec()
              marker:((_ q:quoted_marker(parse_extra) { q })?)
            {
                Ok(ParsedLine {
                    name,
                    extras,
                    specifiers: Specifiers::default(),
                    url: Some(url.to_string()),
                    marker,
                })
            }

        pub rule requirement(parse_extra: ParseExtra) -> Result<ParsedLine, ParseSpecifierError>
            = _ r:(url_req(parse_extra) / name_req(parse_extra)) _ { r }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_versionspec() {
        let specs = versionspec(">=1.0, <2.0").unwrap().unwrap();
        assert_eq!(specs.to_string(), ">=1.0,<2.0");
        let specs = versionspec("(>=1.0)").unwrap().unwrap();
        assert_eq!(specs.len(), 1);
        assert!(versionspec(">=1.0,").is_err());
        // validation failures surface as the inner error
        assert!(versionspec("~=2").unwrap().is_err());
    }

    #[test]
    fn test_requirement_named() {
        let line = requirement("requests[socks,security] >= 2.8.1, == 2.8.*; python_version < '2.7'", ParseExtra::NotAllowed)
            .unwrap()
            .unwrap();
        assert_eq!(line.name.as_str(), "requests");
        assert_eq!(line.extras.len(), 2);
        assert_eq!(line.specifiers.len(), 2);
        assert!(line.url.is_none());
        assert!(line.marker.is_some());
    }

    #[test]
    fn test_requirement_direct_reference() {
        let line = requirement(
            "pip @ https://github.com/pypa/pip/archive/1.3.1.zip ; sys_platform == 'win32'",
            ParseExtra::NotAllowed,
        )
        .unwrap()
        .unwrap();
        assert_eq!(line.name.as_str(), "pip");
        assert_eq!(
            line.url.as_deref(),
            Some("https://github.com/pypa/pip/archive/1.3.1.zip")
        );
        assert!(line.marker.is_some());
    }

    #[test]
    fn test_extra_rejected_for_user_requirements() {
        assert!(requirement("demo; extra == 'x'", ParseExtra::NotAllowed).is_err());
        assert!(requirement("demo; extra == 'x'", ParseExtra::Allowed).is_ok());
    }

    #[test]
    fn test_chained_connectives() {
        // the formal PEP 508 grammar fails on unparenthesized chains
        let m = marker(
            "os_name == 'a' and os_name == 'b' and os_name == 'c' or os_name == 'd'",
            ParseExtra::NotAllowed,
        )
        .unwrap();
        assert!(matches!(m, MarkerExpr::Or(..)));
    }

    #[test]
    fn test_legacy_variables() {
        let m = marker(
            "os.name == 'nt' and python_implementation == 'PyPy'",
            ParseExtra::NotAllowed,
        )
        .unwrap();
        assert_eq!(
            m.to_string(),
            "os_name == \"nt\" and platform_python_implementation == \"PyPy\""
        );
    }
}
