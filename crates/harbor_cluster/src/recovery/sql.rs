//! Statements issued on the primary during recovery.

/// Quote `value` as a PostgreSQL string literal, following `quote_literal`:
/// single quotes are doubled, and a value containing a backslash uses the
/// `E'...'` form with backslashes doubled.
pub fn quote_literal(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 3);
    if value.contains('\\') {
        out.push('E');
    }
    out.push('\'');
    for c in value.chars() {
        match c {
            '\'' => out.push_str("''"),
            '\\' => out.push_str("\\\\"),
            c => out.push(c),
        }
    }
    out.push('\'');
    out
}

pub const CHECKPOINT: &str = "CHECKPOINT";

/// `SELECT <function>('<script>', '<host>', '<datadir>')`. `function` must
/// already be a validated identifier.
pub fn recovery_call(function: &str, script: &str, host: &str, data_directory: &str) -> String {
    format!(
        "SELECT {}({}, {}, {})",
        function,
        quote_literal(script),
        quote_literal(host),
        quote_literal(data_directory)
    )
}

/// `SELECT <function>('<host>', '<datadir>')`.
pub fn remote_start_call(function: &str, host: &str, data_directory: &str) -> String {
    format!(
        "SELECT {}({}, {})",
        function,
        quote_literal(host),
        quote_literal(data_directory)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_literal() {
        assert_eq!(quote_literal("plain"), "'plain'");
        assert_eq!(quote_literal("it's"), "'it''s'");
        assert_eq!(quote_literal(r"C:\data"), r"E'C:\\data'");
        assert_eq!(quote_literal(""), "''");
    }

    #[test]
    fn test_recovery_call() {
        assert_eq!(
            recovery_call("pgpool_recovery", "recovery_1st_stage", "db2", "/var/lib/pg"),
            "SELECT pgpool_recovery('recovery_1st_stage', 'db2', '/var/lib/pg')"
        );
    }

    #[test]
    fn test_injection_is_quoted() {
        let sql = remote_start_call("pgpool_remote_start", "x'); DROP TABLE t; --", "/d");
        assert_eq!(
            sql,
            "SELECT pgpool_remote_start('x''); DROP TABLE t; --', '/d')"
        );
    }
}
