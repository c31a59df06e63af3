mod common;
use common::*;

use slate_shell::{NativeResult, ShellError};

#[test]
fn call_form_renders_text() {
    let shell = shell();
    assert_eq!(
        shell.eval("return Date(2020, 6)").unwrap(),
        NativeResult::String("2020-06-01T00:00:00.000Z".into())
    );
    assert_eq!(
        shell.eval("return Date('2024-02-29T12:30:00z')").unwrap(),
        NativeResult::String("2024-02-29T12:30:00.000Z".into())
    );
}

#[test]
fn constructor_forms_produce_dates() {
    let shell = shell();
    assert_eq!(
        shell.eval("return Date.new(0)").unwrap(),
        NativeResult::Date(bson::DateTime::from_millis(0))
    );
    assert_eq!(
        shell.eval("return ISODate('1970-01-02')").unwrap(),
        NativeResult::Date(bson::DateTime::from_millis(86_400_000))
    );
    assert_eq!(
        shell.eval("return Date.new(1970, 1, 1, 0, 0, 1, 500)").unwrap(),
        NativeResult::Date(bson::DateTime::from_millis(1_500))
    );
}

#[test]
fn dates_can_be_copied() {
    let shell = shell();
    assert_eq!(
        shell.eval("return ISODate(Date.new(1234)):getTime()").unwrap(),
        NativeResult::Int32(1234)
    );
}

#[test]
fn invalid_arguments_fail() {
    let shell = shell();
    assert!(matches!(
        shell.eval("return Date.new('yesterday')").unwrap_err(),
        ShellError::Argument(_)
    ));
    assert!(matches!(
        shell.eval("return Date.new({})").unwrap_err(),
        ShellError::Argument(_)
    ));
    assert!(matches!(
        shell.eval("return Date.new(2020, 1.5)").unwrap_err(),
        ShellError::Argument(_)
    ));
}

#[test]
fn now_is_epoch_millis() {
    let shell = shell();
    match shell.eval("return Date.now()").unwrap() {
        NativeResult::Int64(ms) => assert!(ms > 1_600_000_000_000),
        other => panic!("expected milliseconds, got {other:?}"),
    }
    assert!(matches!(shell.eval("return Date.new()").unwrap(), NativeResult::Date(_)));
}
