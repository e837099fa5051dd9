//! Tests for front-end error reporting: syntax positions, semantic
//! constraint violations and malformed constructs.

use rill_parser::{parse, CompileError};

fn expect_error(source: &str) -> CompileError {
    match parse(source) {
        Err(e) => e,
        Ok(plan) => panic!("expected an error for {source:?}, got {plan:?}"),
    }
}

// ============================================================================
// Syntax errors
// ============================================================================

#[test]
fn test_invalid_syntax_returns_error_not_panic() {
    let invalid_inputs = [
        "define stream",                      // missing name and attributes
        "define stream S (symbol)",           // attribute without a type
        "from S select",                      // empty projection
        "from S select x",                    // missing output clause
        "from S[price > ] insert into Out",   // incomplete comparison
        "from S#window.time( insert into O",  // unclosed paren
        "from S select x group by insert into Out", // empty group by
        "partition with (x of S) begin end",  // partition without queries
    ];

    for input in &invalid_inputs {
        assert!(
            parse(input).is_err(),
            "should return an error for {input:?}"
        );
    }
}

#[test]
fn test_syntax_error_carries_line_and_column() {
    let source = "define stream S (x int);\nfrom S select x x insert into Out";
    match expect_error(source) {
        CompileError::Syntax { line, message, .. } => {
            assert_eq!(line, 2);
            assert!(
                message.contains("expected"),
                "message should say what was expected: {message}"
            );
        }
        other => panic!("expected a syntax error, got {other:?}"),
    }
}

#[test]
fn test_error_display_mentions_position() {
    let err = expect_error("from S select x\nbogus clause");
    let text = err.to_string();
    assert!(text.contains("line"), "display should name the line: {text}");
}

#[test]
fn test_reserved_word_cannot_name_a_stream() {
    assert!(parse("define stream select (x int)").is_err());
    assert!(parse("from insert select x insert into Out").is_err());
}

#[test]
fn test_delete_requires_on_condition() {
    assert!(parse("from S select symbol delete HoldingsTable").is_err());
    assert!(parse("from S select symbol update HoldingsTable").is_err());
}

#[test]
fn test_malformed_count_bounds() {
    assert!(parse("from e1=S<> select e1[0].x insert into Out").is_err());
    assert!(parse("from e1=S<a:b> select e1[0].x insert into Out").is_err());
}

// ============================================================================
// Semantic errors
// ============================================================================

#[test]
fn test_duplicate_stream_definition() {
    let err = expect_error("define stream S (x int); define stream S (y int)");
    match err {
        CompileError::Semantic { message, .. } => {
            assert!(message.contains("already defined"), "{message}");
        }
        other => panic!("expected a semantic error, got {other:?}"),
    }
}

#[test]
fn test_duplicate_table_definition() {
    let err = expect_error("define table T (x int); define table T (x int)");
    assert!(matches!(err, CompileError::Semantic { .. }));
}

#[test]
fn test_duplicate_attribute_in_definition() {
    let err = expect_error("define stream S (price double, price int)");
    match err {
        CompileError::Semantic { message, .. } => {
            assert!(message.contains("duplicate attribute"), "{message}");
        }
        other => panic!("expected a semantic error, got {other:?}"),
    }
}

#[test]
fn test_cannot_define_an_inner_stream() {
    let err = expect_error("define stream #S (x int)");
    match err {
        CompileError::Semantic {
            line,
            column,
            message,
            ..
        } => {
            assert_eq!((line, column), (1, 15));
            assert!(message.contains("inner stream"), "{message}");
        }
        other => panic!("expected a semantic error, got {other:?}"),
    }
}

#[test]
fn test_outer_joins_are_rejected() {
    for join in ["left outer join", "right outer join", "full outer join"] {
        let err = expect_error(&format!(
            "from A {join} B on A.x == B.x select A.x insert into Out"
        ));
        match err {
            CompileError::Semantic { message, .. } => {
                assert!(message.contains("outer"), "{message}");
            }
            other => panic!("expected a semantic error for {join}, got {other:?}"),
        }
    }
}

#[test]
fn test_double_unidirectional_join_is_rejected() {
    let err = expect_error(
        "from A unidirectional join B unidirectional on A.x == B.x \
         select A.x insert into Out",
    );
    match err {
        CompileError::Semantic { message, .. } => {
            assert!(message.contains("unidirectional"), "{message}");
        }
        other => panic!("expected a semantic error, got {other:?}"),
    }
}

#[test]
fn test_delete_from_inner_stream_is_rejected() {
    let err = expect_error("from S select x delete #T on x == 1");
    match err {
        CompileError::Semantic { message, .. } => {
            assert!(message.contains("inner stream"), "{message}");
        }
        other => panic!("expected a semantic error, got {other:?}"),
    }
}

#[test]
fn test_update_inner_stream_is_rejected() {
    let err = expect_error("from S select x update #T on x == 1");
    assert!(matches!(err, CompileError::Semantic { .. }));
}

#[test]
fn test_partition_by_inner_stream_is_rejected() {
    let err = expect_error(
        "partition with (x of #S) begin from #S select x insert into Out end",
    );
    match err {
        CompileError::Semantic { message, .. } => {
            assert!(message.contains("partition"), "{message}");
        }
        other => panic!("expected a semantic error, got {other:?}"),
    }
}

#[test]
fn test_time_value_overflow_is_rejected() {
    let err = expect_error(
        "from S#window.time(999999999999 year) select x insert into Out",
    );
    match err {
        CompileError::Semantic { message, .. } => {
            assert!(message.contains("overflow"), "{message}");
        }
        other => panic!("expected a semantic error, got {other:?}"),
    }
}

// ============================================================================
// Failure does not corrupt later parses
// ============================================================================

#[test]
fn test_parser_recovers_after_a_failed_parse() {
    assert!(parse("define stream S (price double, price int)").is_err());
    assert!(parse("define stream S (price double); from S select price insert into Out").is_ok());
}
