//! Read-only statement policy, checked before anything is executed.

use regex_lite::Regex;
use std::sync::LazyLock;

static FORBIDDEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(INSERT|UPDATE|DELETE|DROP|ALTER|CREATE|TRUNCATE|REPLACE|MERGE|GRANT|REVOKE)\b")
        .expect("forbidden-keyword pattern is valid")
});

static READ_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^(SELECT|WITH)\b").expect("read-prefix pattern is valid"));

/// Returns the violation text when `statement` may not run.
///
/// Any write/DDL/privilege keyword anywhere in the statement is rejected,
/// including inside string literals and comments.
pub fn check(statement: &str) -> Option<String> {
    let trimmed = statement.trim();

    if let Some(found) = FORBIDDEN.find(trimmed) {
        return Some(format!(
            "SECURITY VIOLATION: {} operation is not allowed. Only read-only SELECT queries are permitted.",
            found.as_str().to_uppercase()
        ));
    }

    if !READ_PREFIX.is_match(trimmed) {
        return Some(
            "SECURITY VIOLATION: Only SELECT queries are allowed. The statement must start with SELECT or WITH."
                .to_string(),
        );
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_select_passes() {
        assert_eq!(check("SELECT email FROM customers"), None);
        assert_eq!(check("  select * from customers where updated_at > now()"), None);
    }

    #[test]
    fn cte_passes() {
        assert_eq!(
            check("WITH recent AS (SELECT * FROM customers) SELECT email FROM recent"),
            None
        );
    }

    #[test]
    fn delete_is_rejected_by_name() {
        let violation = check("DELETE FROM customers").unwrap();
        assert!(violation.starts_with("SECURITY VIOLATION: DELETE"));
    }

    #[test]
    fn keyword_match_is_case_insensitive() {
        let violation = check("select 1; drop table customers").unwrap();
        assert!(violation.contains("DROP"));
    }

    #[test]
    fn identifiers_containing_keywords_pass() {
        assert_eq!(
            check("SELECT last_update, created_at, is_deleted FROM customers"),
            None
        );
    }

    #[test]
    fn non_select_prefix_rejected() {
        let violation = check("EXPLAIN SELECT 1").unwrap();
        assert!(violation.contains("Only SELECT queries are allowed"));
        assert!(check("").is_some());
    }

    #[test]
    fn every_forbidden_keyword_is_caught() {
        for kw in [
            "INSERT", "UPDATE", "DELETE", "DROP", "ALTER", "CREATE", "TRUNCATE", "REPLACE", "MERGE",
            "GRANT", "REVOKE",
        ] {
            let statement = format!("WITH x AS (SELECT 1) {kw} something");
            assert!(check(&statement).is_some(), "{kw} slipped through");
        }
    }
}
