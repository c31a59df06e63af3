mod common;
use common::*;

use bson::{Bson, doc};
use slate_shell::{Cursor, MemorySource, NativeResult, ReadPreferenceMode, ShellError};

// ── Building and binding ────────────────────────────────────────

#[test]
fn accumulated_modifiers_bind_once() {
    let (shell, source) = shell_with_accounts();
    let value = shell
        .eval(r#"return find():limit(5):sort(Document.of("x", 1)):toArray()"#)
        .unwrap();
    assert_eq!(ids(&value), vec![5, 4, 3, 2, 1]);
    assert_eq!(source.executions(), 1);

    let options = source.last_options().unwrap();
    assert_eq!(options.limit(), Some(5));
    assert_eq!(options.sort(), Some(&doc! { "x": 1 }));
}

#[test]
fn last_write_wins_per_modifier() {
    let (shell, _source) = shell_with_accounts();
    let value = shell
        .eval("return find():limit(1):skip(1):limit(3):toArray()")
        .unwrap();
    assert_eq!(ids(&value), vec![2, 3, 4]);
}

#[test]
fn projection_and_sort_apply_together() {
    let (shell, _source) = shell_with_accounts();
    let value = shell
        .eval(r#"return find():projection({ name = 1 }):sort({ x = -1 }):limit(1):next()"#)
        .unwrap();
    let doc = value.as_document().unwrap();
    assert_eq!(doc.keys().collect::<Vec<_>>(), vec!["_id", "name"]);
    assert_eq!(doc.get("name"), Some(&NativeResult::String("Acme Corp".into())));
}

#[test]
fn modifier_after_terminal_call_fails() {
    let (shell, _source) = shell_with_accounts();
    let err = shell
        .eval("local c = find(); c:hasNext(); return c:limit(1)")
        .unwrap_err();
    assert_eq!(err, ShellError::IllegalState("query already executed".into()));

    let err = shell
        .eval("local c = find(); c:count(); return c:map(function(d) return d end)")
        .unwrap_err();
    assert_eq!(err, ShellError::IllegalState("query already executed".into()));
}

#[test]
fn invalid_modifier_arguments_are_rejected() {
    let (shell, _source) = shell_with_accounts();
    assert!(matches!(
        shell.eval("return find():skip(-1)").unwrap_err(),
        ShellError::Argument(_)
    ));
    assert!(matches!(
        shell.eval("return find():sort('x')").unwrap_err(),
        ShellError::Argument(_)
    ));
    assert!(matches!(
        shell.eval("return find():hint(3)").unwrap_err(),
        ShellError::Argument(_)
    ));
}

#[test]
fn flag_modifiers_are_recorded() {
    let (shell, source) = shell_with_accounts();
    shell
        .eval(
            r#"
            return find()
              :tailable({ awaitData = true })
              :noCursorTimeout()
              :returnKey()
              :readConcern("majority")
              :comment("audit")
              :maxTimeMS(50)
              :hint("x_1")
              :itcount()
            "#,
        )
        .unwrap();
    let options = source.last_options().unwrap();
    assert!(options.flag("tailable"));
    assert!(options.flag("awaitData"));
    assert!(options.flag("noCursorTimeout"));
    assert!(options.flag("returnKey"));
    assert_eq!(options.max_time_ms(), Some(50));
    assert_eq!(options.get("hint"), Some(&Bson::String("x_1".into())));
    assert_eq!(
        options.get("readConcern"),
        Some(&Bson::Document(doc! { "level": "majority" }))
    );
}

#[test]
fn read_preference_tag_sets() {
    let (shell, source) = shell_with_accounts();
    shell
        .eval(r#"return find():readPreference("secondary", { { dc = "east" }, {} }):toArray()"#)
        .unwrap();
    let pref = source.last_options().unwrap().read_preference().unwrap().unwrap();
    assert_eq!(pref.mode, ReadPreferenceMode::Secondary);
    assert_eq!(
        pref.tag_sets,
        vec![vec![("dc".to_string(), "east".to_string())], vec![]]
    );

    shell.eval(r#"return find():readPreference("nearest"):toArray()"#).unwrap();
    let pref = source.last_options().unwrap().read_preference().unwrap().unwrap();
    assert!(pref.tag_sets.is_empty());

    let err = shell
        .eval(r#"return find():readPreference("fastest")"#)
        .unwrap_err();
    assert!(matches!(err, ShellError::Argument(_)));
}

// ── Mapping ─────────────────────────────────────────────────────

#[test]
fn map_composes_left_to_right() {
    let (shell, _source) = shell_with_accounts();
    let value = shell
        .eval(
            r#"
            return find()
              :map(function(d) return d.x end)
              :map(function(x) return x * 10 end)
              :toArray()
            "#,
        )
        .unwrap();
    let expected: Vec<_> = [50, 40, 30, 20, 10].into_iter().map(NativeResult::Int32).collect();
    assert_eq!(value, NativeResult::Array(expected));
}

#[test]
fn map_applies_to_next_and_for_each() {
    let (shell, _source) = shell_with_accounts();
    let value = shell
        .eval(
            r#"
            local c = find():map(function(d) return d.name end)
            local first = c:next()
            local rest = {}
            c:forEach(function(name) rest[#rest + 1] = name end)
            return { first, #rest }
            "#,
        )
        .unwrap();
    assert_eq!(
        value,
        NativeResult::Array(vec![
            NativeResult::String("Acme Corp".into()),
            NativeResult::Int32(4),
        ])
    );
}

// ── Iteration and lifecycle ─────────────────────────────────────

#[test]
fn close_is_idempotent() {
    let (shell, _source) = shell_with_accounts();
    let value = shell
        .eval(
            r#"
            local c = find()
            c:next()
            c:close()
            c:close()
            return { c:isClosed(), c:isExhausted(), c:hasNext() }
            "#,
        )
        .unwrap();
    assert_eq!(
        value,
        NativeResult::Array(vec![
            NativeResult::Boolean(true),
            NativeResult::Boolean(true),
            NativeResult::Boolean(false),
        ])
    );
}

#[test]
fn next_after_close_fails() {
    let (shell, _source) = shell_with_accounts();
    let err = shell
        .eval("local c = find(); c:close(); return c:next()")
        .unwrap_err();
    assert_eq!(err, ShellError::IllegalState("cursor is closed".into()));
}

#[test]
fn drained_cursor_is_exhausted() {
    let (shell, _source) = shell_with_accounts();
    let value = shell
        .eval(
            r#"
            local c = find()
            local n = c:itcount()
            return { n, c:isExhausted(), c:next() == nil }
            "#,
        )
        .unwrap();
    assert_eq!(
        value,
        NativeResult::Array(vec![
            NativeResult::Int32(5),
            NativeResult::Boolean(true),
            NativeResult::Boolean(true),
        ])
    );
}

#[test]
fn close_inside_for_each_stops_iteration() {
    let (shell, _source) = shell_with_accounts();
    let value = shell
        .eval(
            r#"
            local c = find()
            local seen = 0
            c:forEach(function() seen = seen + 1; c:close() end)
            return { seen, c:isClosed() }
            "#,
        )
        .unwrap();
    assert_eq!(
        value,
        NativeResult::Array(vec![NativeResult::Int32(1), NativeResult::Boolean(true)])
    );
}

#[test]
fn reentrant_iteration_fails() {
    let (shell, _source) = shell_with_accounts();
    let err = shell
        .eval("local c = find(); c:forEach(function() c:next() end)")
        .unwrap_err();
    assert_eq!(err, ShellError::IllegalState("cursor is already in use".into()));
}

#[test]
fn count_and_explain() {
    let (shell, source) = shell_with_accounts();
    assert_eq!(shell.eval("return find():count()").unwrap(), NativeResult::Int32(5));
    let plan = shell
        .eval(r#"return find():limit(2):explain("executionStats")"#)
        .unwrap();
    let plan = plan.as_document().unwrap();
    assert_eq!(
        plan.get("verbosity"),
        Some(&NativeResult::String("executionStats".into()))
    );
    assert_eq!(source.executions(), 0);
}

#[test]
fn iterating_after_count_returns_every_document() {
    let (shell, source) = shell_with_accounts();
    let value = shell
        .eval(
            r#"
            local c = find()
            local n = c:count()
            return { n, c:toArray() }
            "#,
        )
        .unwrap();
    let NativeResult::Array(parts) = value else {
        panic!("expected an array, got {value:?}");
    };
    assert_eq!(parts[0], NativeResult::Int32(5));
    assert_eq!(ids(&parts[1]), vec![1, 2, 3, 4, 5]);
    assert_eq!(source.executions(), 1);

    let value = shell
        .eval(r#"local c = find(); c:explain(); return c:next()"#)
        .unwrap();
    assert_eq!(
        value.as_document().and_then(|d| d.get("_id")),
        Some(&NativeResult::Int32(1))
    );
}

#[test]
fn legacy_operations_are_not_supported() {
    let (shell, _source) = shell_with_accounts();
    for script in [
        "return find():addOption(2)",
        "return find():clone()",
        "return find():size()",
    ] {
        let err = shell.eval(script).unwrap_err();
        assert!(matches!(err, ShellError::NotSupported(_)), "{script}: {err:?}");
    }
}

#[test]
fn aggregation_cursors_share_the_engine() {
    let (shell, source) = shell_with_accounts();
    assert!(matches!(
        shell.eval("return aggregate()").unwrap(),
        NativeResult::AggregationCursor(_)
    ));
    assert_eq!(
        shell.eval("return tostring(aggregate())").unwrap(),
        NativeResult::String("AggregationCursor".into())
    );
    let value = shell.eval("return aggregate():skip(3):toArray()").unwrap();
    assert_eq!(ids(&value), vec![4, 5]);
    assert_eq!(source.executions(), 1);
}

#[test]
fn host_and_script_reach_the_same_cursor() {
    let shell = shell();
    let source = MemorySource::new(accounts());
    let (handle, value) = shell.wrap_cursor(Cursor::find(source.clone())).unwrap();
    shell.lua().globals().set("c", value).unwrap();

    shell.eval("c:limit(2)").unwrap();
    assert_eq!(handle.with(|c| Ok(c.options().limit())).unwrap(), Some(2));
    assert!(!handle.with(|c| Ok(c.is_executed())).unwrap());

    assert_eq!(shell.eval("return c:itcount()").unwrap(), NativeResult::Int32(2));
    handle.close();
    assert_eq!(shell.eval("return c:isClosed()").unwrap(), NativeResult::Boolean(true));
}
