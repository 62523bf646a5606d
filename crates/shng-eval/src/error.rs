//! Mapping of minijinja errors onto the evaluator error type

use shng_core::EvalError;

/// Translate a minijinja error raised for `expression`
pub(crate) fn map_error(expression: &str, err: minijinja::Error) -> EvalError {
    let message = match err.detail() {
        Some(detail) => format!("{}: {}", err.kind(), detail),
        None => err.to_string(),
    };
    match err.kind() {
        minijinja::ErrorKind::SyntaxError => EvalError::Syntax {
            expression: expression.to_string(),
            message,
        },
        _ => EvalError::Runtime {
            expression: expression.to_string(),
            message,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use minijinja::{Error, ErrorKind};

    #[test]
    fn test_syntax_errors_keep_their_kind() {
        let err = Error::new(ErrorKind::SyntaxError, "unexpected end of input");
        assert!(matches!(map_error("1 +", err), EvalError::Syntax { .. }));
    }

    #[test]
    fn test_other_errors_are_runtime() {
        let err = Error::new(ErrorKind::InvalidOperation, "unknown item 'x'");
        match map_error("item('x')", err) {
            EvalError::Runtime { expression, message } => {
                assert_eq!(expression, "item('x')");
                assert!(message.contains("unknown item"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
