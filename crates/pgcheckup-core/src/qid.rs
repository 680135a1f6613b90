//! Query id matcher for backend selectors.
//!
//! Query ids arrive from reports, label values and user input. Before one is
//! embedded in a selector it must be a plain (optionally negative) decimal
//! integer. A single bad id rejects the whole batch.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QidError {
    #[error("no query ids given")]
    Empty,
    #[error("invalid query id {id:?}: expected an optionally negative decimal integer")]
    Invalid { id: String },
}

/// Returns true if `id` matches `^-?[0-9]+$` (ASCII digits only).
pub fn is_valid_qid(id: &str) -> bool {
    let digits = id.strip_prefix('-').unwrap_or(id);
    !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
}

/// Builds an anchored alternation `^(?:id1|id2|...)$` over the given ids.
///
/// Order follows the input. Fails closed: any invalid id rejects the batch.
pub fn build_qid_regex<S: AsRef<str>>(ids: &[S]) -> Result<String, QidError> {
    if ids.is_empty() {
        return Err(QidError::Empty);
    }
    let mut alternation = Vec::with_capacity(ids.len());
    for id in ids {
        let id = id.as_ref();
        if !is_valid_qid(id) {
            return Err(QidError::Invalid { id: id.to_string() });
        }
        alternation.push(id);
    }
    Ok(format!("^(?:{})$", alternation.join("|")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_anchored_alternation_in_input_order() {
        assert_eq!(build_qid_regex(&["123", "-45"]).unwrap(), "^(?:123|-45)$");
        assert_eq!(build_qid_regex(&["9"]).unwrap(), "^(?:9)$");
        assert_eq!(build_qid_regex(&["2", "1"]).unwrap(), "^(?:2|1)$");
    }

    #[test]
    fn rejects_non_numeric_ids() {
        assert_eq!(
            build_qid_regex(&["abc"]),
            Err(QidError::Invalid {
                id: "abc".to_string()
            })
        );
        assert!(build_qid_regex(&["1; DROP TABLE x"]).is_err());
        assert!(build_qid_regex(&["1|.*"]).is_err());
        assert!(build_qid_regex(&["-"]).is_err());
        assert!(build_qid_regex(&["--1"]).is_err());
        assert!(build_qid_regex(&[""]).is_err());
        assert!(build_qid_regex(&["12 "]).is_err());
    }

    #[test]
    fn one_bad_id_rejects_the_whole_batch() {
        let err = build_qid_regex(&["1", "2", "3\"}"]).unwrap_err();
        assert_eq!(
            err,
            QidError::Invalid {
                id: "3\"}".to_string()
            }
        );
    }

    #[test]
    fn rejects_empty_batch() {
        let ids: [&str; 0] = [];
        assert_eq!(build_qid_regex(&ids), Err(QidError::Empty));
    }

    #[test]
    fn rejects_non_ascii_digits() {
        // Arabic-Indic digits are Unicode digits but not valid query ids.
        assert!(!is_valid_qid("١٢٣"));
    }

    #[test]
    fn output_is_a_valid_regex_matching_only_the_ids() {
        let re = regex::Regex::new(&build_qid_regex(&["123", "-45"]).unwrap()).unwrap();
        assert!(re.is_match("123"));
        assert!(re.is_match("-45"));
        assert!(!re.is_match("1234"));
        assert!(!re.is_match("45"));
    }
}
