use rand::seq::SliceRandom;

use minirel::execution::{MemScan, QueryOperator, SortMergeJoinOperator};
use minirel::storage::schema::{int_schema, Field, Schema, Type};
use minirel::storage::tuple::{Cell, Tuple};

use crate::test_utils::{int_tuple, kv_tuple, setup};

fn kv_schema(prefix: &str) -> Schema {
    Schema::new(vec![
        Field::new(&format!("{}key", prefix), Type::Int64),
        Field::new(&format!("{}tag", prefix), Type::Bytes(8)),
    ])
}

fn join_of(left: Vec<Tuple>, right: Vec<Tuple>) -> SortMergeJoinOperator {
    let left_op = MemScan::new(kv_schema("l_"), left);
    let right_op = MemScan::new(kv_schema("r_"), right);
    SortMergeJoinOperator::new(Box::new(left_op), Box::new(right_op), vec![0], vec![0], 4)
}

fn row(t: &Tuple) -> (i64, String, i64, String) {
    match (t.get_cell(0), t.get_cell(1), t.get_cell(2), t.get_cell(3)) {
        (Cell::Int64(lk), Cell::Str(lt), Cell::Int64(rk), Cell::Str(rt)) => (lk, lt, rk, rt),
        _ => panic!("unexpected join row shape: {}", t),
    }
}

#[test]
fn test_equal_key_blocks_pair_exhaustively() {
    setup();

    let left = vec![kv_tuple(1, "a"), kv_tuple(1, "b"), kv_tuple(2, "c")];
    let right = vec![
        kv_tuple(1, "x"),
        kv_tuple(1, "y"),
        kv_tuple(2, "z"),
        kv_tuple(3, "w"),
    ];

    let join = join_of(left, right);
    let rows: Vec<(i64, String, i64, String)> = join.map(|t| row(&t)).collect();

    let expected = vec![
        (1, "a".to_string(), 1, "x".to_string()),
        (1, "a".to_string(), 1, "y".to_string()),
        (1, "b".to_string(), 1, "x".to_string()),
        (1, "b".to_string(), 1, "y".to_string()),
        (2, "c".to_string(), 2, "z".to_string()),
    ];
    assert_eq!(rows, expected);
}

#[test]
fn test_join_output_schema_is_concatenation() {
    setup();

    let join = join_of(vec![kv_tuple(1, "a")], vec![kv_tuple(1, "x")]);
    let schema = join.schema();
    assert_eq!(schema.fields.len(), 4);
    assert_eq!(schema.fields[0].name, "l_key");
    assert_eq!(schema.fields[2].name, "r_key");
}

#[test]
fn test_join_row_count_is_product_of_key_groups() {
    setup();

    // key k appears l_k times on the left, r_k times on the right;
    // the join must produce exactly sum(l_k * r_k) rows
    let groups: Vec<(i64, usize, usize)> = vec![(1, 3, 2), (2, 0, 4), (3, 2, 0), (4, 5, 3), (5, 1, 1)];

    let mut left = Vec::new();
    let mut right = Vec::new();
    let mut expected = 0;
    for (key, l_count, r_count) in &groups {
        for i in 0..*l_count {
            left.push(kv_tuple(*key, &format!("l{}", i)));
        }
        for i in 0..*r_count {
            right.push(kv_tuple(*key, &format!("r{}", i)));
        }
        expected += l_count * r_count;
    }

    // feed them shuffled: the operator sorts both sides itself
    let mut rng = rand::thread_rng();
    left.shuffle(&mut rng);
    right.shuffle(&mut rng);

    let join = join_of(left, right);
    let rows: Vec<Tuple> = join.collect();

    assert_eq!(rows.len(), expected);
    for t in &rows {
        let (lk, _, rk, _) = row(t);
        assert_eq!(lk, rk);
    }
}

#[test]
fn test_join_handles_right_exhaustion_mid_block() {
    setup();

    // the right side runs out while the marked block is still live
    let left = vec![kv_tuple(1, "a"), kv_tuple(1, "b")];
    let right = vec![kv_tuple(1, "x")];

    let join = join_of(left, right);
    let rows: Vec<(i64, String, i64, String)> = join.map(|t| row(&t)).collect();

    let expected = vec![
        (1, "a".to_string(), 1, "x".to_string()),
        (1, "b".to_string(), 1, "x".to_string()),
    ];
    assert_eq!(rows, expected);
}

#[test]
fn test_join_with_no_matches_or_empty_sides() {
    setup();

    // disjoint keys
    let join = join_of(vec![kv_tuple(1, "a")], vec![kv_tuple(2, "x")]);
    assert_eq!(join.count(), 0);

    // empty right
    let join = join_of(vec![kv_tuple(1, "a")], Vec::new());
    assert_eq!(join.count(), 0);

    // empty left
    let join = join_of(Vec::new(), vec![kv_tuple(1, "x")]);
    assert_eq!(join.count(), 0);
}

#[test]
fn test_join_of_presorted_int_inputs() {
    setup();

    // single-column inputs already in key order, declared as such
    let left: Vec<Tuple> = [1i64, 2, 2, 3].iter().map(|k| int_tuple(&[*k])).collect();
    let right: Vec<Tuple> = [2i64, 2, 3, 4].iter().map(|k| int_tuple(&[*k])).collect();

    let left_op = MemScan::new(int_schema(1, "l"), left).sorted_on(vec![0]);
    let right_op = MemScan::new(int_schema(1, "r"), right).sorted_on(vec![0]);

    let join =
        SortMergeJoinOperator::new(Box::new(left_op), Box::new(right_op), vec![0], vec![0], 4);
    let keys: Vec<i64> = join
        .map(|t| match t.get_cell(0) {
            Cell::Int64(v) => v,
            other => panic!("expected an int key, got {}", other),
        })
        .collect();

    // 2 matches twice for each of the two left 2s, 3 matches once
    assert_eq!(keys, vec![2, 2, 2, 2, 3]);
}
