use super::extra::Extra;
use super::pyspec::{ParsePySpecError, PySpecSet};
use super::specifier::{CompareOp, Specifier};
use miette::Diagnostic;
use serde_with::{DeserializeFromStr, SerializeDisplay};
use std::borrow::Borrow;
use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::hash::Hash;
use std::ops::{BitAnd, BitOr};
use std::str::FromStr;
use thiserror::Error;

/// One side of a marker comparison: an environment variable or a quoted
/// literal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MarkerValue {
    /// One of the PEP 508 environment variable names.
    Variable(String),
    /// A quoted string literal.
    Literal(String),
}

impl MarkerValue {
    fn is_extra(&self) -> bool {
        matches!(self, MarkerValue::Variable(name) if name == "extra")
    }

    fn is_python_key(&self) -> bool {
        matches!(
            self,
            MarkerValue::Variable(name)
                if name == "python_version" || name == "python_full_version"
        )
    }

    fn eval<'a>(&'a self, env: &'a dyn Env) -> Result<&'a str, EvalMarkerError> {
        match self {
            MarkerValue::Variable(name) => env
                .get_marker_var(name)
                .ok_or_else(|| EvalMarkerError::UnknownVariable(name.clone())),
            MarkerValue::Literal(text) => Ok(text),
        }
    }
}

impl Display for MarkerValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            MarkerValue::Variable(name) => write!(f, "{name}"),
            MarkerValue::Literal(text) => {
                if text.contains('"') {
                    write!(f, "'{text}'")
                } else {
                    write!(f, "\"{text}\"")
                }
            }
        }
    }
}

/// A comparison operator inside a marker expression.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum MarkerOp {
    /// One of the PEP 440 comparison operators.
    Compare(CompareOp),
    /// Substring containment.
    In,
    /// Negated substring containment.
    NotIn,
}

impl Display for MarkerOp {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            MarkerOp::Compare(op) => write!(f, "{op}"),
            MarkerOp::In => write!(f, "in"),
            MarkerOp::NotIn => write!(f, "not in"),
        }
    }
}

/// A PEP 508 environment marker expression tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MarkerExpr {
    /// Conjunction of two sub-expressions.
    And(Box<MarkerExpr>, Box<MarkerExpr>),
    /// Disjunction of two sub-expressions.
    Or(Box<MarkerExpr>, Box<MarkerExpr>),
    /// A single comparison.
    Operator {
        /// The operator.
        op: MarkerOp,
        /// Left-hand side.
        lhs: MarkerValue,
        /// Right-hand side.
        rhs: MarkerValue,
    },
}

/// Provides values for marker variables during evaluation.
pub trait Env {
    /// Returns the value of the marker variable, or `None` if unknown.
    fn get_marker_var(&self, var: &str) -> Option<&str>;
}

impl<T: Borrow<str> + Eq + Hash> Env for HashMap<T, T> {
    fn get_marker_var(&self, var: &str) -> Option<&str> {
        self.get(var).map(|s| s.borrow())
    }
}

/// Error raised while evaluating a marker against an environment.
#[derive(Debug, Clone, Error, Diagnostic)]
pub enum EvalMarkerError {
    /// A variable the environment does not define.
    #[error("no environment marker variable named '{0}'")]
    UnknownVariable(String),

    /// `~=` needs version operands on both sides.
    #[error("the ~= operator requires valid version strings")]
    CompatibleNeedsVersions,
}

impl MarkerExpr {
    /// Evaluates the expression against the given environment.
    pub fn eval(&self, env: &dyn Env) -> Result<bool, EvalMarkerError> {
        Ok(match self {
            MarkerExpr::And(lhs, rhs) => lhs.eval(env)? && rhs.eval(env)?,
            MarkerExpr::Or(lhs, rhs) => lhs.eval(env)? || rhs.eval(env)?,
            MarkerExpr::Operator { op, lhs, rhs } => {
                let mut lhs_val = lhs.eval(env)?;
                let mut rhs_val = rhs.eval(env)?;
                // comparisons against the magic 'extra' variable normalize
                // both sides, per PEP 685
                let lhs_holder: String;
                let rhs_holder: String;
                if lhs.is_extra() {
                    if let Ok(extra) = Extra::from_str(rhs_val) {
                        rhs_holder = extra.as_str().to_string();
                        rhs_val = rhs_holder.as_str();
                    }
                }
                if rhs.is_extra() {
                    if let Ok(extra) = Extra::from_str(lhs_val) {
                        lhs_holder = extra.as_str().to_string();
                        lhs_val = lhs_holder.as_str();
                    }
                }
                match op {
                    MarkerOp::In => rhs_val.contains(lhs_val),
                    MarkerOp::NotIn => !rhs_val.contains(lhs_val),
                    MarkerOp::Compare(op) => {
                        // version comparison when both sides admit it, string
                        // comparison otherwise
                        if let Ok(lhs_version) = lhs_val.parse() {
                            if let Ok(spec) = Specifier::new(*op, rhs_val) {
                                return Ok(spec.matches(&lhs_version));
                            }
                        }
                        match op {
                            CompareOp::LessThanEqual => lhs_val <= rhs_val,
                            CompareOp::StrictlyLessThan => lhs_val < rhs_val,
                            CompareOp::NotEqual => lhs_val != rhs_val,
                            CompareOp::Equal | CompareOp::ArbitraryEqual => lhs_val == rhs_val,
                            CompareOp::GreaterThanEqual => lhs_val >= rhs_val,
                            CompareOp::StrictlyGreaterThan => lhs_val > rhs_val,
                            CompareOp::Compatible => {
                                return Err(EvalMarkerError::CompatibleNeedsVersions)
                            }
                        }
                    }
                }
            }
        })
    }

    fn only_python_keys(&self) -> bool {
        match self {
            MarkerExpr::And(lhs, rhs) | MarkerExpr::Or(lhs, rhs) => {
                lhs.only_python_keys() && rhs.only_python_keys()
            }
            MarkerExpr::Operator { lhs, .. } => lhs.is_python_key(),
        }
    }

    /// Flattens a chain of the same connective into its operands.
    fn flatten_and(&self) -> Vec<&MarkerExpr> {
        match self {
            MarkerExpr::And(lhs, rhs) => {
                let mut out = lhs.flatten_and();
                out.extend(rhs.flatten_and());
                out
            }
            other => vec![other],
        }
    }

    fn flatten_or(&self) -> Vec<&MarkerExpr> {
        match self {
            MarkerExpr::Or(lhs, rhs) => {
                let mut out = lhs.flatten_or();
                out.extend(rhs.flatten_or());
                out
            }
            other => vec![other],
        }
    }

    /// Builds a python version set from a python-keys-only subtree.
    fn build_pyspec(&self) -> Result<PySpecSet, ParsePySpecError> {
        match self {
            MarkerExpr::And(lhs, rhs) => Ok(&lhs.build_pyspec()? & &rhs.build_pyspec()?),
            MarkerExpr::Or(lhs, rhs) => Ok(&lhs.build_pyspec()? | &rhs.build_pyspec()?),
            MarkerExpr::Operator { op, lhs, rhs } => {
                let (MarkerValue::Variable(key), MarkerValue::Literal(version)) = (lhs, rhs)
                else {
                    // a literal-vs-literal or reversed comparison carries no
                    // version information we can normalize
                    return Ok(PySpecSet::allow_all());
                };
                let mut version = version.trim().to_string();
                let mut op = *op;
                if key == "python_version" {
                    match op {
                        MarkerOp::Compare(CompareOp::StrictlyGreaterThan) => {
                            // > "3.7" on the two-part variable means >= "3.8"
                            let mut bits: Vec<i64> = version
                                .split('.')
                                .map(|p| p.parse().unwrap_or(0))
                                .collect();
                            if let Some(last) = bits.last_mut() {
                                *last += 1;
                            }
                            version = bits
                                .iter()
                                .map(|b| b.to_string())
                                .collect::<Vec<_>>()
                                .join(".");
                            op = MarkerOp::Compare(CompareOp::GreaterThanEqual);
                        }
                        MarkerOp::Compare(CompareOp::Equal | CompareOp::NotEqual) => {
                            if version.split('.').count() < 3 && !version.ends_with('*') {
                                version.push_str(".*");
                            }
                        }
                        MarkerOp::In | MarkerOp::NotIn => {
                            version = split_version_list(&version)
                                .map(|v| format!("{v}.*"))
                                .collect::<Vec<_>>()
                                .join(" ");
                        }
                        _ => {}
                    }
                }
                match op {
                    MarkerOp::In => {
                        let mut out = PySpecSet::impossible();
                        for v in split_version_list(&version) {
                            out = &out | &format!("=={v}").parse()?;
                        }
                        Ok(out)
                    }
                    MarkerOp::NotIn => {
                        let mut out = PySpecSet::allow_all();
                        for v in split_version_list(&version) {
                            out = &out & &format!("!={v}").parse()?;
                        }
                        Ok(out)
                    }
                    MarkerOp::Compare(op) => Ok(format!("{op}{version}").parse()?),
                }
            }
        }
    }
}

fn split_version_list(version: &str) -> impl Iterator<Item = &str> {
    let by_comma = version.contains(',');
    version
        .split(move |c: char| if by_comma { c == ',' } else { c.is_whitespace() })
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn fmt_expr(expr: &MarkerExpr, f: &mut Formatter<'_>, parent_is_and: bool) -> std::fmt::Result {
    match expr {
        MarkerExpr::Or(lhs, rhs) => {
            if parent_is_and {
                write!(f, "(")?;
            }
            fmt_expr(lhs, f, false)?;
            write!(f, " or ")?;
            fmt_expr(rhs, f, false)?;
            if parent_is_and {
                write!(f, ")")?;
            }
            Ok(())
        }
        MarkerExpr::And(lhs, rhs) => {
            fmt_expr(lhs, f, true)?;
            write!(f, " and ")?;
            fmt_expr(rhs, f, true)
        }
        MarkerExpr::Operator { op, lhs, rhs } => write!(f, "{lhs} {op} {rhs}"),
    }
}

impl Display for MarkerExpr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        fmt_expr(self, f, false)
    }
}

/// Error raised for an invalid marker string.
#[derive(Debug, Clone, Error, Diagnostic)]
#[error("invalid environment marker '{input}': {reason}")]
pub struct ParseMarkerError {
    /// The offending input.
    pub input: String,
    /// What went wrong.
    pub reason: String,
}

/// A marker with "always true" folded in: `Marker::any()` has no expression
/// and evaluates to true everywhere. Conjunction and disjunction treat it as
/// the identity and the absorbing element respectively.
#[derive(Debug, Clone, PartialEq, Eq, Hash, SerializeDisplay, DeserializeFromStr)]
pub struct Marker {
    expr: Option<MarkerExpr>,
}

impl Marker {
    /// The marker that holds in every environment.
    pub fn any() -> Self {
        Marker { expr: None }
    }

    /// Wraps an expression tree.
    pub fn from_expr(expr: MarkerExpr) -> Self {
        Marker { expr: Some(expr) }
    }

    /// The underlying expression, absent for the universal marker.
    pub fn expr(&self) -> Option<&MarkerExpr> {
        self.expr.as_ref()
    }

    /// Whether this marker holds everywhere.
    pub fn is_any(&self) -> bool {
        self.expr.is_none()
    }

    /// Whether this marker can never hold: its python constraint is
    /// impossible and nothing else remains.
    pub fn is_empty(&self) -> bool {
        match self.split_pyspec() {
            Ok((None, pyspec)) => pyspec.is_impossible(),
            _ => false,
        }
    }

    /// Evaluates the marker against an environment.
    pub fn evaluate(&self, env: &dyn Env) -> Result<bool, EvalMarkerError> {
        match &self.expr {
            None => Ok(true),
            Some(expr) => expr.eval(env),
        }
    }

    /// Splits into the non-python part and the python version constraint.
    /// When an `or` mixes python and non-python atoms the whole marker stays
    /// in the first element and the python part is universal.
    pub fn split_pyspec(&self) -> Result<(Option<Marker>, PySpecSet), ParsePySpecError> {
        let Some(expr) = &self.expr else {
            return Ok((None, PySpecSet::allow_all()));
        };
        if expr.only_python_keys() {
            return Ok((None, expr.build_pyspec()?));
        }
        if matches!(expr, MarkerExpr::Or(..)) {
            return Ok((Some(self.clone()), PySpecSet::allow_all()));
        }
        let mut pyspec = PySpecSet::allow_all();
        let mut rest: Option<MarkerExpr> = None;
        for part in expr.flatten_and() {
            if part.only_python_keys() {
                pyspec = &pyspec & &part.build_pyspec()?;
            } else {
                rest = Some(match rest {
                    None => part.clone(),
                    Some(acc) => MarkerExpr::And(Box::new(acc), Box::new(part.clone())),
                });
            }
        }
        Ok((rest.map(Marker::from_expr), pyspec))
    }

    /// Extracts `extra == '...'` atoms. Extras can only be stripped when all
    /// occurrences are joined by `and`, or when the marker is a pure
    /// disjunction of extras; otherwise the marker is returned unchanged.
    pub fn split_extras(&self) -> (Vec<Extra>, Option<Marker>) {
        fn extra_values(expr: &MarkerExpr) -> Option<Vec<Extra>> {
            let MarkerExpr::Operator { op, lhs, rhs } = expr else {
                return None;
            };
            if !lhs.is_extra() {
                return None;
            }
            let MarkerValue::Literal(value) = rhs else {
                return None;
            };
            match op {
                MarkerOp::Compare(CompareOp::Equal) => {
                    value.parse().ok().map(|extra| vec![extra])
                }
                MarkerOp::In => value
                    .split(',')
                    .map(|v| v.trim().parse().ok())
                    .collect::<Option<Vec<_>>>(),
                _ => None,
            }
        }

        let Some(expr) = &self.expr else {
            return (Vec::new(), None);
        };
        if matches!(expr, MarkerExpr::Or(..)) {
            let parts = expr.flatten_or();
            let mut extras = Vec::new();
            for part in &parts {
                match extra_values(part) {
                    Some(values) => extras.extend(values),
                    // an `or` mixing extras with anything else is left alone
                    None => return (Vec::new(), Some(self.clone())),
                }
            }
            return (extras, None);
        }
        let mut extras = Vec::new();
        let mut rest: Option<MarkerExpr> = None;
        for part in expr.flatten_and() {
            match extra_values(part) {
                Some(values) => extras.extend(values),
                None => {
                    rest = Some(match rest {
                        None => part.clone(),
                        Some(acc) => MarkerExpr::And(Box::new(acc), Box::new(part.clone())),
                    })
                }
            }
        }
        (extras, rest.map(Marker::from_expr))
    }
}

impl BitAnd for &Marker {
    type Output = Marker;

    fn bitand(self, other: &Marker) -> Marker {
        match (&self.expr, &other.expr) {
            (None, _) => other.clone(),
            (_, None) => self.clone(),
            (Some(a), Some(b)) => {
                if a == b {
                    self.clone()
                } else {
                    Marker::from_expr(MarkerExpr::And(Box::new(a.clone()), Box::new(b.clone())))
                }
            }
        }
    }
}

impl BitOr for &Marker {
    type Output = Marker;

    fn bitor(self, other: &Marker) -> Marker {
        match (&self.expr, &other.expr) {
            (None, _) | (_, None) => Marker::any(),
            (Some(a), Some(b)) => {
                if a == b {
                    self.clone()
                } else {
                    Marker::from_expr(MarkerExpr::Or(Box::new(a.clone()), Box::new(b.clone())))
                }
            }
        }
    }
}

impl Display for Marker {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.expr {
            None => Ok(()),
            Some(expr) => write!(f, "{expr}"),
        }
    }
}

impl FromStr for Marker {
    type Err = ParseMarkerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().is_empty() {
            return Ok(Marker::any());
        }
        let expr = super::reqparse::marker(s.trim(), super::reqparse::ParseExtra::Allowed)
            .map_err(|e| ParseMarkerError {
                input: s.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Marker::from_expr(expr))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn marker(s: &str) -> Marker {
        s.parse().unwrap()
    }

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_evaluate() {
        let m = marker("os_name == 'nt' and python_version >= '3.6'");
        assert!(m
            .evaluate(&env(&[("os_name", "nt"), ("python_version", "3.8")]))
            .unwrap());
        assert!(!m
            .evaluate(&env(&[("os_name", "posix"), ("python_version", "3.8")]))
            .unwrap());
        // conjunction mirrors the conjunction of the sides
        let a = marker("os_name == 'nt'");
        let b = marker("python_version >= '3.6'");
        let e = env(&[("os_name", "nt"), ("python_version", "3.5")]);
        assert_eq!(
            (&a & &b).evaluate(&e).unwrap(),
            a.evaluate(&e).unwrap() && b.evaluate(&e).unwrap()
        );
    }

    #[test]
    fn test_extra_normalized_comparison() {
        let m = marker("extra == 'Socks_Proxy'");
        assert!(m.evaluate(&env(&[("extra", "socks-proxy")])).unwrap());
    }

    #[test]
    fn test_and_or_display() {
        let a = marker("os_name == 'nt' or sys_platform == 'win32'");
        let b = marker("python_version >= '3.6'");
        assert_eq!(
            (&a & &b).to_string(),
            "(os_name == \"nt\" or sys_platform == \"win32\") and python_version >= \"3.6\""
        );
        assert_eq!(
            (&b | &a).to_string(),
            "python_version >= \"3.6\" or os_name == \"nt\" or sys_platform == \"win32\""
        );
        assert!((&Marker::any() & &b) == b);
        assert!((&Marker::any() | &b).is_any());
    }

    #[test]
    fn test_split_pyspec() {
        let (rest, pyspec) = marker("python_version >= '3.6'").split_pyspec().unwrap();
        assert!(rest.is_none());
        assert_eq!(pyspec.to_string(), ">=3.6");

        let (rest, pyspec) = marker("os_name == 'nt' and python_version < '3'")
            .split_pyspec()
            .unwrap();
        assert_eq!(rest.unwrap().to_string(), "os_name == \"nt\"");
        assert_eq!(pyspec.to_string(), "<3.0");

        // an `or` mixing python and non-python parts is not split
        let m = marker("os_name == 'nt' or python_version < '3'");
        let (rest, pyspec) = m.split_pyspec().unwrap();
        assert_eq!(rest.unwrap(), m);
        assert!(pyspec.is_allow_all());

        // python-only `or` becomes a union
        let (rest, pyspec) = marker("python_version == '2.7' or python_version >= '3.6'")
            .split_pyspec()
            .unwrap();
        assert!(rest.is_none());
        assert!(pyspec.contains(&"2.7.10".parse().unwrap(), true));
        assert!(pyspec.contains(&"3.7".parse().unwrap(), true));
        assert!(!pyspec.contains(&"3.5".parse().unwrap(), true));
    }

    #[test]
    fn test_split_pyspec_gt_on_python_version() {
        let (_, pyspec) = marker("python_version > '3.7'").split_pyspec().unwrap();
        // the two-part variable cannot see patch releases of 3.7
        assert_eq!(pyspec.to_string(), ">=3.8");
    }

    #[test]
    fn test_split_extras() {
        let (extras, rest) = marker("extra == 'enc'").split_extras();
        assert_eq!(extras, vec!["enc".parse::<Extra>().unwrap()]);
        assert!(rest.is_none());

        let (extras, rest) = marker("extra == 'enc' and os_name == 'nt'").split_extras();
        assert_eq!(extras.len(), 1);
        assert_eq!(rest.unwrap().to_string(), "os_name == \"nt\"");

        // a pure disjunction of extras is extracted
        let (extras, rest) = marker("extra == 'tz' or extra == 'all'").split_extras();
        assert_eq!(extras.len(), 2);
        assert!(rest.is_none());

        // a disjunction mixing extras with other atoms is left alone
        let m = marker("extra == 'tz' or os_name == 'nt'");
        let (extras, rest) = m.split_extras();
        assert!(extras.is_empty());
        assert_eq!(rest.unwrap(), m);
    }

    #[test]
    fn test_is_empty() {
        assert!(marker("python_version < '3' and python_version >= '3.6'").is_empty());
        assert!(!marker("python_version >= '3.6'").is_empty());
        assert!(!marker("os_name == 'nt'").is_empty());
        assert!(Marker::any().is_any());
    }
}
