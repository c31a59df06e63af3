use bson::{Document, doc};
use slate_shell::{Cursor, CursorHandle, MemorySource, NativeResult, ShellConfig, ShellRuntime};

pub fn shell() -> ShellRuntime {
    ShellRuntime::new(ShellConfig::default()).unwrap()
}

/// Five accounts; `x` runs opposite to `_id`.
pub fn accounts() -> Vec<Document> {
    vec![
        doc! { "_id": 1, "name": "Acme Corp", "x": 5, "status": "active" },
        doc! { "_id": 2, "name": "Globex", "x": 4, "status": "snoozed" },
        doc! { "_id": 3, "name": "Initech", "x": 3, "status": "rejected" },
        doc! { "_id": 4, "name": "Umbrella", "x": 2, "status": "active" },
        doc! { "_id": 5, "name": "Stark Industries", "x": 1, "status": "active" },
    ]
}

/// Runtime with `find()` and `aggregate()` globals over the account fixtures.
/// The returned source observes every cursor they hand out.
pub fn shell_with_accounts() -> (ShellRuntime, MemorySource) {
    let shell = shell();
    let source = MemorySource::new(accounts());

    let find_source = source.clone();
    shell
        .register_function("find", move |_, _| {
            let cursor = Cursor::find(find_source.clone());
            Ok(NativeResult::Cursor(CursorHandle::new(cursor)))
        })
        .unwrap();

    let aggregate_source = source.clone();
    shell
        .register_function("aggregate", move |_, _| {
            let cursor = Cursor::aggregate(aggregate_source.clone());
            Ok(NativeResult::AggregationCursor(CursorHandle::new(cursor)))
        })
        .unwrap();

    (shell, source)
}

/// `_id`s of an array of documents.
pub fn ids(value: &NativeResult) -> Vec<i32> {
    let NativeResult::Array(items) = value else {
        panic!("expected an array, got {value:?}");
    };
    items
        .iter()
        .map(|item| match item.as_document().and_then(|d| d.get("_id")) {
            Some(NativeResult::Int32(id)) => *id,
            other => panic!("unexpected element: {other:?}"),
        })
        .collect()
}
