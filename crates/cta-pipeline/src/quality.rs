//! Named selection criteria over parameter columns.
//!
//! A criterion is a pair `(name, "<column> <op> <number>")`, for example
//! `("enough light", "hillas_intensity > 50")`. Columns are checked against
//! the known parameter columns when the query is built, so a typo is a
//! configuration error and not a silently failing cut. A missing value
//! fails the criterion.

use std::sync::OnceLock;

use cta_core::ConfigurationError;
use regex::Regex;
use serde_json::{json, Value};

/// Comparison operator of a criterion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    /// `<`
    Less,
    /// `<=`
    LessEqual,
    /// `>`
    Greater,
    /// `>=`
    GreaterEqual,
    /// `==`
    Equal,
    /// `!=`
    NotEqual,
}

impl Comparison {
    fn parse(op: &str) -> Option<Self> {
        Some(match op {
            "<" => Comparison::Less,
            "<=" => Comparison::LessEqual,
            ">" => Comparison::Greater,
            ">=" => Comparison::GreaterEqual,
            "==" => Comparison::Equal,
            "!=" => Comparison::NotEqual,
            _ => return None,
        })
    }

    fn apply(self, lhs: f64, rhs: f64) -> bool {
        match self {
            Comparison::Less => lhs < rhs,
            Comparison::LessEqual => lhs <= rhs,
            Comparison::Greater => lhs > rhs,
            Comparison::GreaterEqual => lhs >= rhs,
            Comparison::Equal => lhs == rhs,
            Comparison::NotEqual => lhs != rhs,
        }
    }
}

/// One parsed criterion with its pass counter.
#[derive(Debug, Clone, PartialEq)]
pub struct Criterion {
    /// Human-readable name.
    pub name: String,
    /// Original expression.
    pub expression: String,
    /// Column compared.
    pub column: String,
    /// Operator.
    pub op: Comparison,
    /// Threshold.
    pub value: f64,
    passed: u64,
}

fn expression_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(r"^\s*([A-Za-z_][A-Za-z0-9_]*)\s*(<=|>=|==|!=|<|>)\s*(\S+)\s*$").ok()
        })
        .as_ref()
}

/// Ordered list of criteria, all of which must pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QualityQuery {
    criteria: Vec<Criterion>,
    evaluated: u64,
}

impl QualityQuery {
    /// Parse `criteria`. `key` is the dotted configuration key reported in
    /// errors; `columns` are the column names an expression may use.
    pub fn new(
        key: &str,
        criteria: &[(String, String)],
        columns: &[String],
    ) -> Result<Self, ConfigurationError> {
        let mut parsed = Vec::with_capacity(criteria.len());
        for (name, expression) in criteria {
            let invalid = |expected: String| {
                ConfigurationError::invalid(key, format!("[{name:?}, {expression:?}]"), expected)
            };
            let captures = expression_pattern()
                .and_then(|re| re.captures(expression))
                .ok_or_else(|| invalid("an expression '<column> <op> <number>'".into()))?;
            let column = captures[1].to_string();
            if !columns.contains(&column) {
                return Err(invalid(format!("a known column, not '{column}'")));
            }
            let op = Comparison::parse(&captures[2])
                .ok_or_else(|| invalid("one of < <= > >= == !=".into()))?;
            let value: f64 = captures[3]
                .parse()
                .map_err(|_| invalid(format!("a number, not '{}'", &captures[3])))?;
            parsed.push(Criterion {
                name: name.clone(),
                expression: expression.clone(),
                column,
                op,
                value,
                passed: 0,
            });
        }
        Ok(Self {
            criteria: parsed,
            evaluated: 0,
        })
    }

    /// Criteria in evaluation order.
    pub fn criteria(&self) -> &[Criterion] {
        &self.criteria
    }

    /// Evaluate every criterion against `lookup` and count the passes.
    /// Returns whether all passed.
    pub fn check(&mut self, lookup: impl Fn(&str) -> Option<f64>) -> bool {
        self.evaluated += 1;
        let mut all = true;
        for criterion in &mut self.criteria {
            let pass = lookup(&criterion.column)
                .is_some_and(|v| criterion.op.apply(v, criterion.value));
            if pass {
                criterion.passed += 1;
            }
            all &= pass;
        }
        all
    }

    /// Pass counts per criterion, for the provenance record.
    pub fn summary(&self) -> Value {
        json!({
            "evaluated": self.evaluated,
            "criteria": self
                .criteria
                .iter()
                .map(|c| json!({ "name": c.name, "expression": c.expression, "passed": c.passed }))
                .collect::<Vec<_>>(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn columns() -> Vec<String> {
        vec!["hillas_intensity".into(), "leakage_intensity_width_2".into()]
    }

    fn pairs(items: &[(&str, &str)]) -> Vec<(String, String)> {
        items
            .iter()
            .map(|(a, b)| (a.to_string(), b.to_string()))
            .collect()
    }

    #[test]
    fn test_check_counts_each_criterion() {
        let mut query = QualityQuery::new(
            "x.quality",
            &pairs(&[
                ("bright", "hillas_intensity > 50"),
                ("contained", "leakage_intensity_width_2<=0.2"),
            ]),
            &columns(),
        )
        .unwrap();

        let bright_leaky = |c: &str| match c {
            "hillas_intensity" => Some(100.0),
            _ => Some(0.5),
        };
        assert!(!query.check(bright_leaky));
        assert!(query.check(|c| match c {
            "hillas_intensity" => Some(60.0),
            _ => Some(0.1),
        }));
        assert!(!query.check(|_| None));

        let summary = query.summary();
        assert_eq!(summary["evaluated"], 3);
        assert_eq!(summary["criteria"][0]["passed"], 2);
        assert_eq!(summary["criteria"][1]["passed"], 1);
    }

    #[test]
    fn test_unknown_column_is_rejected() {
        let err = QualityQuery::new(
            "x.quality",
            &pairs(&[("typo", "hilas_intensity > 50")]),
            &columns(),
        )
        .unwrap_err();
        let text = err.to_string();
        assert!(text.contains("x.quality"));
        assert!(text.contains("hilas_intensity"));
    }

    #[test]
    fn test_malformed_expressions() {
        for expression in ["hillas_intensity >> 5", "hillas_intensity > abc", "> 5"] {
            assert!(
                QualityQuery::new("q", &pairs(&[("bad", expression)]), &columns()).is_err(),
                "{expression}"
            );
        }
    }
}
