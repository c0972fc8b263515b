use crate::error::ValidationError;
use crate::table::*;
use serde_json::json;

#[test]
fn test_table_rejects_duplicate_and_ragged_columns() {
    let duplicate = Table::new(vec![
        Column::new("a", ColumnData::Integer(vec![Some(1)])),
        Column::new("a", ColumnData::Integer(vec![Some(2)])),
    ]);
    assert_eq!(duplicate, Err(ValidationError::DuplicateColumn("a".to_string())));

    let ragged = Table::new(vec![
        Column::new("a", ColumnData::Integer(vec![Some(1), Some(2)])),
        Column::new("b", ColumnData::Integer(vec![Some(1)])),
    ]);
    assert!(matches!(ragged, Err(ValidationError::RaggedColumn { length: 1, expected: 2, .. })));
}

#[test]
fn test_non_finite_floats_become_missing() {
    let table = Table::new(vec![Column::new(
        "f",
        ColumnData::Float(vec![Some(1.5), Some(f64::NAN), Some(f64::INFINITY)]),
    )])
    .unwrap();
    assert_eq!(
        table.column("f").unwrap().data,
        ColumnData::Float(vec![Some(1.5), None, None])
    );
}

#[test]
fn test_from_records_infers_types() {
    let records = vec![
        json!({"age": 30, "name": "ada", "score": 1.5, "active": true}),
        json!({"age": null, "score": 2, "active": false}),
    ];
    let table = Table::from_records(&records).unwrap();

    assert_eq!(table.column_names(), vec!["age", "name", "score", "active"]);
    let types: Vec<ColumnType> = table.columns().iter().map(|c| c.column_type()).collect();
    assert_eq!(
        types,
        vec![
            ColumnType::Integer,
            ColumnType::Text,
            ColumnType::Float,
            ColumnType::Boolean
        ]
    );
    assert!(table.column("name").unwrap().data.is_missing(1));
    assert_eq!(table.row_count(), 2);
}

#[test]
fn test_from_records_rejects_nested_values() {
    let records = vec![json!({"a": [1, 2]})];
    assert!(matches!(
        Table::from_records(&records),
        Err(ValidationError::InvalidParameter { parameter: "records", .. })
    ));
}

#[test]
fn test_to_records_renders_missing_as_null() {
    let table = Table::new(vec![
        Column::new("a", ColumnData::Integer(vec![Some(1), None])),
        Column::new("b", ColumnData::Text(vec![None, Some("x".to_string())])),
    ])
    .unwrap();
    assert_eq!(
        table.to_records(),
        vec![json!({"a": 1, "b": null}), json!({"a": null, "b": "x"})]
    );
}

#[test]
fn test_take_rows_reorders_every_column() {
    let table = Table::new(vec![
        Column::new("a", ColumnData::Integer(vec![Some(1), Some(2), Some(3)])),
        Column::new("b", ColumnData::Boolean(vec![Some(true), None, Some(false)])),
    ])
    .unwrap();
    let taken = table.take_rows(&[2, 0]);
    assert_eq!(taken.column("a").unwrap().data, ColumnData::Integer(vec![Some(3), Some(1)]));
    assert_eq!(
        taken.column("b").unwrap().data,
        ColumnData::Boolean(vec![Some(false), Some(true)])
    );
}

#[test]
fn test_deserialize_validates_invariants() {
    let raw = r#"[
        {"name": "a", "data": {"type": "integer", "values": [1, 2]}},
        {"name": "a", "data": {"type": "text", "values": ["x", null]}}
    ]"#;
    assert!(serde_json::from_str::<Table>(raw).is_err());

    let ok = r#"[
        {"name": "a", "data": {"type": "datetime", "values": ["2024-01-01T00:00:00Z", null]}}
    ]"#;
    let table: Table = serde_json::from_str(ok).unwrap();
    assert_eq!(table.column("a").unwrap().column_type(), ColumnType::Datetime);
}

#[test]
fn test_column_type_parsing() {
    assert_eq!("int".parse::<ColumnType>(), Ok(ColumnType::Integer));
    assert_eq!("timestamp".parse::<ColumnType>(), Ok(ColumnType::Datetime));
    assert!("blob".parse::<ColumnType>().is_err());
    assert_eq!(ColumnType::Float.to_string(), "float");
}
