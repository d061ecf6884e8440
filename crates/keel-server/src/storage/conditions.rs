//! Query conditions
//!
//! A condition set maps a field name to a value. String values may start
//! with a comparison operator (`>=`, `<=`, `<>`, `>`, `<`) or contain glob
//! wildcards (`*`, `?`), which become a pattern match. Everything else is
//! an equality test. A record matches when every condition holds.

use std::cmp::Ordering;

use serde_json::{Map, Value};

pub type Conditions = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
    Like,
}

/// Longest prefixes first so `>=` is not read as `>`.
const PREFIXES: [(&str, Operator); 5] = [
    (">=", Operator::Ge),
    ("<=", Operator::Le),
    ("<>", Operator::Ne),
    (">", Operator::Gt),
    ("<", Operator::Lt),
];

#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub operator: Operator,
    pub operand: Value,
}

impl Condition {
    pub fn parse(value: &Value) -> Condition {
        let Value::String(raw) = value else {
            return Condition {
                operator: Operator::Eq,
                operand: value.clone(),
            };
        };

        for (prefix, operator) in PREFIXES {
            if let Some(rest) = raw.strip_prefix(prefix) {
                return Condition {
                    operator,
                    operand: Value::String(rest.trim().to_string()),
                };
            }
        }

        let operator = if raw.contains('*') || raw.contains('?') {
            Operator::Like
        } else {
            Operator::Eq
        };
        Condition {
            operator,
            operand: value.clone(),
        }
    }

    pub fn matches(&self, field: Option<&Value>) -> bool {
        let Some(field) = field else {
            return false;
        };

        if self.operator == Operator::Like {
            let (Some(pattern), Some(text)) = (self.operand.as_str(), as_text(field)) else {
                return false;
            };
            return glob_match(pattern, &text);
        }

        let Some(ordering) = compare(field, &self.operand) else {
            return self.operator == Operator::Ne;
        };
        match self.operator {
            Operator::Eq => ordering == Ordering::Equal,
            Operator::Ne => ordering != Ordering::Equal,
            Operator::Gt => ordering == Ordering::Greater,
            Operator::Lt => ordering == Ordering::Less,
            Operator::Ge => ordering != Ordering::Less,
            Operator::Le => ordering != Ordering::Greater,
            Operator::Like => false,
        }
    }
}

/// Whether `record` satisfies every condition.
pub fn matches_all(record: &Map<String, Value>, conditions: &Conditions) -> bool {
    conditions
        .iter()
        .all(|(field, value)| Condition::parse(value).matches(record.get(field)))
}

/// Orders a stored field against an operand. Numbers compare numerically,
/// including a numeric field against a numeric string operand.
fn compare(field: &Value, operand: &Value) -> Option<Ordering> {
    if let Some(left) = field.as_f64() {
        let right = match operand {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.parse::<f64>().ok(),
            _ => None,
        }?;
        return left.partial_cmp(&right);
    }
    match (field, operand) {
        (Value::String(left), Value::String(right)) => Some(left.cmp(right)),
        (Value::Bool(left), Value::Bool(right)) => Some(left.cmp(right)),
        (left, right) if left == right => Some(Ordering::Equal),
        _ => None,
    }
}

fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// `*` matches any run of characters, `?` exactly one.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();

    let (mut p, mut t) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while t < text.len() {
        match pattern.get(p) {
            Some('*') => {
                star = Some((p, t));
                p += 1;
            }
            Some(&c) if c == '?' || c == text[t] => {
                p += 1;
                t += 1;
            }
            _ => match star {
                Some((star_p, star_t)) => {
                    p = star_p + 1;
                    t = star_t + 1;
                    star = Some((star_p, star_t + 1));
                }
                None => return false,
            },
        }
    }
    pattern[p..].iter().all(|&c| c == '*')
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_operator_parsing_prefers_longest() {
        assert_eq!(Condition::parse(&json!(">=5")).operator, Operator::Ge);
        assert_eq!(Condition::parse(&json!("<=5")).operator, Operator::Le);
        assert_eq!(Condition::parse(&json!("<>5")).operator, Operator::Ne);
        assert_eq!(Condition::parse(&json!(">5")).operator, Operator::Gt);
        assert_eq!(Condition::parse(&json!("<5")).operator, Operator::Lt);
        assert_eq!(Condition::parse(&json!("ma*")).operator, Operator::Like);
        assert_eq!(Condition::parse(&json!("marcus")).operator, Operator::Eq);
        assert_eq!(Condition::parse(&json!(5)).operator, Operator::Eq);
    }

    #[test]
    fn test_numeric_comparisons() {
        let row = record(json!({"id": 7}));
        let cases = [
            (json!({"id": ">0"}), true),
            (json!({"id": ">7"}), false),
            (json!({"id": ">=7"}), true),
            (json!({"id": "<10"}), true),
            (json!({"id": "<=6"}), false),
            (json!({"id": "<>7"}), false),
            (json!({"id": 7}), true),
            (json!({"id": "7"}), true),
        ];
        for (conditions, expected) in cases {
            assert_eq!(
                matches_all(&row, conditions.as_object().unwrap()),
                expected,
                "{}",
                conditions
            );
        }
    }

    #[test]
    fn test_string_and_glob() {
        let row = record(json!({"login": "marcus", "name": "Marcus Aurelius"}));
        assert!(matches_all(&row, &record(json!({"login": "marcus"}))));
        assert!(matches_all(&row, &record(json!({"login": "mar*"}))));
        assert!(matches_all(&row, &record(json!({"login": "m?rcus"}))));
        assert!(matches_all(&row, &record(json!({"name": "*Aurel*"}))));
        assert!(!matches_all(&row, &record(json!({"login": "m?cus"}))));
        assert!(!matches_all(&row, &record(json!({"login": "marcus", "name": "x"}))));
    }

    #[test]
    fn test_missing_field_never_matches() {
        let row = record(json!({"login": "marcus"}));
        assert!(!matches_all(&row, &record(json!({"id": ">0"}))));
    }

    #[test]
    fn test_empty_conditions_match_everything() {
        let row = record(json!({"a": 1}));
        assert!(matches_all(&row, &Conditions::new()));
    }

    #[test]
    fn test_glob_edge_cases() {
        assert!(glob_match("*", ""));
        assert!(glob_match("a*b*c", "aXXbYYc"));
        assert!(!glob_match("a*b*c", "aXXbYY"));
        assert!(glob_match("??", "ab"));
        assert!(!glob_match("?", ""));
    }
}
