//! PromQL selector builder.
//!
//! Label values coming from configuration or from the backend itself are
//! escaped for string literals; values used inside regex matchers are also
//! regex-escaped. Query ids never go through [`Selector::matches`] directly:
//! callers build the pattern with [`crate::qid::build_qid_regex`] first.

use std::fmt;

/// Escapes a value for use inside a double-quoted PromQL string literal.
pub fn escape_label_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            _ => out.push(ch),
        }
    }
    out
}

/// Anchored alternation of literal values: `^(?:a|b\.c)$`.
pub fn literal_alternation<S: AsRef<str>>(values: &[S]) -> String {
    let parts: Vec<String> = values
        .iter()
        .map(|v| regex::escape(v.as_ref()))
        .collect();
    format!("^(?:{})$", parts.join("|"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Matcher {
    label: String,
    op: &'static str,
    value: String,
}

/// A metric name plus label matchers, rendered as `metric{a="b",c=~"d"}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selector {
    metric: String,
    matchers: Vec<Matcher>,
}

impl Selector {
    pub fn new(metric: impl Into<String>) -> Self {
        Self {
            metric: metric.into(),
            matchers: Vec::new(),
        }
    }

    pub fn metric(&self) -> &str {
        &self.metric
    }

    fn push(mut self, label: &str, op: &'static str, value: &str) -> Self {
        self.matchers.push(Matcher {
            label: label.to_string(),
            op,
            value: escape_label_value(value),
        });
        self
    }

    /// `label="value"`
    pub fn eq(self, label: &str, value: &str) -> Self {
        self.push(label, "=", value)
    }

    /// `label!="value"`
    pub fn ne(self, label: &str, value: &str) -> Self {
        self.push(label, "!=", value)
    }

    /// `label=~"pattern"`; `pattern` must already be a safe regex.
    pub fn matches(self, label: &str, pattern: &str) -> Self {
        self.push(label, "=~", pattern)
    }

    /// `label!~"pattern"`; `pattern` must already be a safe regex.
    pub fn not_matches(self, label: &str, pattern: &str) -> Self {
        self.push(label, "!~", pattern)
    }

    /// Excludes every literal value in `values`; no-op when empty.
    pub fn not_in<S: AsRef<str>>(self, label: &str, values: &[S]) -> Self {
        if values.is_empty() {
            return self;
        }
        let pattern = literal_alternation(values);
        self.not_matches(label, &pattern)
    }

    /// `increase(<selector>[<range_s>s])`
    pub fn increase(&self, range_s: i64) -> String {
        format!("increase({}[{}s])", self, range_s)
    }

    /// `last_over_time(<selector>[<range_s>s])`
    pub fn last_over_time(&self, range_s: i64) -> String {
        format!("last_over_time({}[{}s])", self, range_s)
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.metric)?;
        if self.matchers.is_empty() {
            return Ok(());
        }
        f.write_str("{")?;
        for (i, m) in self.matchers.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}{}\"{}\"", m.label, m.op, m.value)?;
        }
        f.write_str("}")
    }
}

/// `sum by (<labels>) (<inner>)`, or plain `sum(<inner>)` without labels.
pub fn sum_by(labels: &[&str], inner: &str) -> String {
    if labels.is_empty() {
        format!("sum({})", inner)
    } else {
        format!("sum by ({}) ({})", labels.join(", "), inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_bare_metric() {
        assert_eq!(Selector::new("up").to_string(), "up");
    }

    #[test]
    fn renders_matchers_in_order() {
        let s = Selector::new("pgwatch_x")
            .eq("cluster", "main")
            .ne("datname", "")
            .matches("queryid", "^(?:1|2)$");
        assert_eq!(
            s.to_string(),
            r#"pgwatch_x{cluster="main",datname!="",queryid=~"^(?:1|2)$"}"#
        );
    }

    #[test]
    fn escapes_quotes_and_backslashes() {
        let s = Selector::new("m").eq("cluster", r#"a"}or vector(1)#\"#);
        assert_eq!(s.to_string(), r#"m{cluster="a\"}or vector(1)#\\"}"#);
    }

    #[test]
    fn not_in_regex_escapes_literals() {
        let s = Selector::new("m").not_in("datname", &["template0", "a.b"]);
        assert_eq!(s.to_string(), r#"m{datname!~"^(?:template0|a\\.b)$"}"#);
        let unchanged = Selector::new("m").not_in::<&str>("datname", &[]);
        assert_eq!(unchanged.to_string(), "m");
    }

    #[test]
    fn wraps_functions() {
        let s = Selector::new("m").eq("a", "b");
        assert_eq!(s.increase(3600), r#"increase(m{a="b"}[3600s])"#);
        assert_eq!(
            sum_by(&["queryid"], &s.increase(60)),
            r#"sum by (queryid) (increase(m{a="b"}[60s]))"#
        );
        assert_eq!(sum_by(&[], "x"), "sum(x)");
    }
}
