//! Property tests: values survive the trip through `E`, `F` and `V` lines.

#![allow(clippy::unwrap_used)]

use proptest::prelude::*;
use rts::{ArrayData, Stat, Value, ValueData, Values};
use rts_proto::{Line, RecvBuffer};

/// Any text, line breaks and quotes included.
fn text() -> impl Strategy<Value = String> {
    prop::collection::vec(any::<char>(), 0..24).prop_map(String::from_iter)
}

/// Finite doubles whose decimal form parses back exactly.
fn double() -> impl Strategy<Value = f64> {
    -1.0e12..1.0e12f64
}

/// Epoch times; a leading `+` would read as an offset from now.
fn time() -> impl Strategy<Value = f64> {
    0.0..4.0e9f64
}

fn scalar() -> impl Strategy<Value = ValueData> {
    prop_oneof![
        any::<i32>().prop_map(ValueData::Integer),
        double().prop_map(ValueData::Double),
        any::<bool>().prop_map(ValueData::Bool),
        text().prop_map(ValueData::String),
        time().prop_map(ValueData::Time),
        (0.0..360.0f64, -90.0..90.0f64).prop_map(|(ra, dec)| ValueData::RaDec { ra, dec }),
    ]
}

fn compound() -> impl Strategy<Value = ValueData> {
    let items = || 0..6usize;
    prop_oneof![
        prop::collection::vec(text(), 1..5).prop_flat_map(|options| {
            (0..options.len(), Just(options))
                .prop_map(|(index, options)| ValueData::Selection { index, options })
        }),
        prop::collection::vec(text(), items())
            .prop_map(|v| ValueData::Array(ArrayData::String(v))),
        prop::collection::vec(any::<i32>(), items())
            .prop_map(|v| ValueData::Array(ArrayData::Integer(v))),
        prop::collection::vec(double(), items())
            .prop_map(|v| ValueData::Array(ArrayData::Double(v))),
        prop::collection::vec(any::<bool>(), items())
            .prop_map(|v| ValueData::Array(ArrayData::Bool(v))),
        prop::collection::vec(time(), items())
            .prop_map(|v| ValueData::Array(ArrayData::Time(v))),
        (0..10_000usize, double(), double(), double(), 0.0..1.0e6f64)
            .prop_map(|(n, mean, min, max, sd)| ValueData::Stat(Stat::new(n, mean, min, max, sd))),
    ]
}

/// Sends `value`'s declaration and content through a receive buffer and
/// rebuilds it from the parsed lines, as a peer does.
fn transmit(value: &Value) -> Value {
    let mut lines = value.meta_lines();
    lines.push(value.value_line());
    let sent = lines.len();

    let mut buffer = RecvBuffer::new(64 * 1024);
    for line in &lines {
        buffer.extend(line.as_bytes());
        buffer.extend(b"\n");
    }
    let mut mirror: Option<Value> = None;
    let mut received = 0;
    while let Some(line) = buffer.next_line().unwrap() {
        received += 1;
        match Line::parse(&line).unwrap() {
            Line::MetaInfo {
                flags,
                name,
                description,
            } => mirror = Some(Value::declare(name, description.into_owned(), flags).unwrap()),
            Line::SelMetaInfo { option, .. } => {
                mirror.as_mut().unwrap().add_option(option.into_owned()).unwrap();
            }
            Line::Value { raw, .. } => mirror.as_mut().unwrap().decode(raw).unwrap(),
            other => panic!("unexpected line {other:?}"),
        }
    }
    assert_eq!(received, sent, "lines split or merged: {lines:?}");
    mirror.unwrap()
}

proptest! {
    /// A peer rebuilds exactly the scalar the owner declared and sent.
    #[test]
    fn scalars_survive_the_wire(data in scalar(), desc in text()) {
        let owner = Value::new("object", desc, data.clone()).writable();
        let copy = transmit(&owner);
        prop_assert_eq!(copy.flags(), owner.flags());
        prop_assert_eq!(copy.description(), owner.description());
        prop_assert_eq!(copy.data(), &data);
        prop_assert!(copy.changed_at().is_some());
    }

    /// Selections, arrays and statistics survive the same way.
    #[test]
    fn compound_values_survive_the_wire(data in compound(), desc in text()) {
        let owner = Value::new("object", desc, data.clone());
        let copy = transmit(&owner);
        prop_assert_eq!(copy.flags(), owner.flags());
        prop_assert_eq!(copy.value_size(), owner.value_size());
        prop_assert_eq!(copy.data(), &data);
    }

    /// A rejected update leaves the stored content alone.
    #[test]
    fn wrong_type_never_overwrites(n in any::<i32>(), text in "[a-z]{1,10}") {
        let mut values = Values::new();
        values.add(Value::new("count", "", ValueData::Integer(n))).unwrap();
        let value = values.get_mut("count").unwrap();
        prop_assert!(value.decode(&text).is_err());
        prop_assert!(value.set(ValueData::String(text)).is_err());
        prop_assert_eq!(values.integer("count").unwrap(), n);
    }
}
