mod common;
use common::*;

use bson::oid::ObjectId;
use mlua::Value;
use slate_shell::{NativeResult, ResultDocument, inject_map};

fn roundtrip(value: NativeResult) -> NativeResult {
    let shell = shell();
    shell.set_global("v", value).unwrap();
    shell.get_global("v").unwrap()
}

#[test]
fn primitives_roundtrip_with_their_width() {
    for value in [
        NativeResult::Boolean(false),
        NativeResult::String("héllo".into()),
        NativeResult::Int32(-7),
        NativeResult::Int64(1 << 40),
        NativeResult::Float32(1.5),
        NativeResult::Float64(0.1),
        NativeResult::Null,
        NativeResult::Void,
    ] {
        assert_eq!(roundtrip(value.clone()), value);
    }
}

#[test]
fn host_values_pass_through_unchanged() {
    let oid = NativeResult::ObjectId(ObjectId::parse_str("507f1f77bcf86cd799439011").unwrap());
    let date = NativeResult::Date(bson::DateTime::from_millis(86_400_000));
    let long = NativeResult::Long(42);
    for value in [oid, date, long, NativeResult::MinKey] {
        assert_eq!(roundtrip(value.clone()), value);
    }
}

#[test]
fn host_values_expose_type_and_display() {
    let shell = shell();
    let oid = ObjectId::parse_str("507f1f77bcf86cd799439011").unwrap();
    shell.set_global("id", NativeResult::ObjectId(oid)).unwrap();
    assert_eq!(
        shell.eval("return id:type()").unwrap(),
        NativeResult::String("ObjectId".into())
    );
    assert_eq!(
        shell.eval("return tostring(id)").unwrap(),
        NativeResult::String(r#"ObjectId("507f1f77bcf86cd799439011")"#.into())
    );
}

#[test]
fn documents_become_ordered_proxies() {
    let shell = shell();
    let doc: ResultDocument = [
        ("zeta", NativeResult::Int32(1)),
        ("alpha", NativeResult::String("a".into())),
        ("mid", NativeResult::Null),
    ]
    .into_iter()
    .collect();
    shell.set_global("doc", NativeResult::Document(doc.clone())).unwrap();

    let keys = shell
        .eval(
            r#"
            local out = {}
            for k in pairs(doc) do out[#out + 1] = k end
            return table.concat(out, ",")
            "#,
        )
        .unwrap();
    assert_eq!(keys, NativeResult::String("zeta,alpha,mid".into()));
    assert_eq!(shell.eval("return #doc").unwrap(), NativeResult::Int32(3));
    assert_eq!(shell.eval("return doc.alpha").unwrap(), NativeResult::String("a".into()));
    assert_eq!(shell.eval("return doc.mid == null").unwrap(), NativeResult::Boolean(true));
    assert_eq!(shell.get_global("doc").unwrap(), NativeResult::Document(doc));
}

#[test]
fn arrays_are_fresh_script_arrays() {
    let shell = shell();
    let items = NativeResult::Array(vec![
        NativeResult::Int32(10),
        NativeResult::Array(vec![NativeResult::Boolean(true)]),
    ]);
    shell.set_global("items", items.clone()).unwrap();
    assert_eq!(shell.eval("return #items").unwrap(), NativeResult::Int32(2));
    assert_eq!(shell.eval("return items[2][1]").unwrap(), NativeResult::Boolean(true));
    assert_eq!(shell.get_global("items").unwrap(), items);
}

#[test]
fn empty_array_stays_an_array() {
    assert_eq!(
        roundtrip(NativeResult::Array(Vec::new())),
        NativeResult::Array(Vec::new())
    );
}

#[test]
fn non_string_map_keys_are_dropped() {
    let shell = shell();
    let value = inject_map(
        shell.lua(),
        [
            (NativeResult::String("kept".into()), NativeResult::Int32(1)),
            (NativeResult::Int32(2), NativeResult::Int32(2)),
            (NativeResult::Boolean(true), NativeResult::Int32(3)),
        ],
    )
    .unwrap();
    assert!(matches!(value, Value::Table(_)));
    let doc = shell.extract(value, None).unwrap();
    let expected: ResultDocument = [("kept", NativeResult::Int32(1))].into_iter().collect();
    assert_eq!(doc, NativeResult::Document(expected));
}

#[test]
fn dates_are_usable_from_scripts() {
    let shell = shell();
    shell
        .set_global("d", NativeResult::Date(bson::DateTime::from_millis(1_704_067_200_000)))
        .unwrap();
    assert_eq!(
        shell.eval("return d:getTime()").unwrap(),
        NativeResult::Int64(1_704_067_200_000)
    );
    assert_eq!(
        shell.eval("return d:toISOString()").unwrap(),
        NativeResult::String("2024-01-01T00:00:00.000Z".into())
    );
}
